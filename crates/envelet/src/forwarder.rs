//! Downstream forwarder for prediction and recommendation services.
//!
//! Posts segment sets as JSON and relays the reply verbatim. A network error,
//! a non-2xx status or a body that is not JSON are all [`ForwardError`]s;
//! callers decide whether that is fatal. Nothing is retried.

use std::time::Duration;

use serde::Serialize;

use crate::health::ENVELET_VERSION;
use crate::segment::SegmentSet;

#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    pub predict_url: String,
    pub recommend_url: String,
    pub timeout: Duration,
}

impl ForwarderConfig {
    /// Endpoints under one base URL: `<base>/predict` and `<base>/recommend`.
    pub fn with_base_url(base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            predict_url: format!("{base}/predict"),
            recommend_url: format!("{base}/recommend"),
            timeout: Duration::from_secs(60),
        }
    }
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self::with_base_url("http://127.0.0.1:5002")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("failed to create HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} responded with status {status}")]
    Status { url: String, status: u16 },
    #[error("invalid JSON from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

#[derive(Serialize)]
struct PredictionRequest<'a> {
    segments: &'a SegmentSet,
}

#[derive(Serialize)]
struct RecommendationRequest<'a> {
    segments: &'a SegmentSet,
    image_base64: &'a str,
}

pub struct Forwarder {
    config: ForwarderConfig,
    client: reqwest::Client,
}

impl Forwarder {
    pub fn new(config: ForwarderConfig) -> Result<Self, ForwardError> {
        let mut headers = reqwest::header::HeaderMap::new();
        let user_agent = format!("envelet/{}", ENVELET_VERSION);
        if let Ok(value) = reqwest::header::HeaderValue::from_str(&user_agent) {
            headers.insert(reqwest::header::USER_AGENT, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()
            .map_err(ForwardError::Client)?;

        Ok(Self { config, client })
    }

    /// Ask the prediction service about a segment set.
    pub async fn predict(&self, segments: &SegmentSet) -> Result<serde_json::Value, ForwardError> {
        self.post(&self.config.predict_url, &PredictionRequest { segments })
            .await
    }

    /// Ask the recommendation service about a segment set and an image.
    pub async fn recommend(
        &self,
        segments: &SegmentSet,
        image_base64: &str,
    ) -> Result<serde_json::Value, ForwardError> {
        self.post(
            &self.config.recommend_url,
            &RecommendationRequest {
                segments,
                image_base64,
            },
        )
        .await
    }

    async fn post<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
    ) -> Result<serde_json::Value, ForwardError> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|source| ForwardError::Request {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ForwardError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        tracing::debug!(%url, status = status.as_u16(), "Downstream service responded");
        response
            .json::<serde_json::Value>()
            .await
            .map_err(|source| ForwardError::Decode {
                url: url.to_string(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentRecord;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn forwarder(server: &MockServer) -> Forwarder {
        Forwarder::new(ForwarderConfig {
            timeout: Duration::from_secs(5),
            ..ForwarderConfig::with_base_url(&server.uri())
        })
        .unwrap()
    }

    fn wall() -> SegmentSet {
        SegmentSet::Typed(vec![SegmentRecord {
            label: "Wall A".to_string(),
            material: "brick".to_string(),
            wall_temperature_c: 18.5,
            humidity: 40.0,
            area: 12.0,
        }])
    }

    #[test]
    fn base_url_trailing_slash_is_ignored() {
        let config = ForwarderConfig::with_base_url("http://predictor:5002/");
        assert_eq!(config.predict_url, "http://predictor:5002/predict");
        assert_eq!(config.recommend_url, "http://predictor:5002/recommend");
    }

    #[tokio::test]
    async fn predict_posts_segments_and_relays_reply() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/predict"))
            .and(header("content-type", "application/json"))
            .and(body_json(serde_json::json!({
                "segments": [{
                    "label": "Wall A",
                    "material": "brick",
                    "temp": 18.5,
                    "humidity": 40.0,
                    "area": 12.0
                }]
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"risk": [0.2], "model": "v3"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let reply = forwarder(&server).predict(&wall()).await.unwrap();
        assert_eq!(reply, serde_json::json!({"risk": [0.2], "model": "v3"}));
    }

    #[tokio::test]
    async fn recommend_includes_image() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/recommend"))
            .and(body_json(serde_json::json!({
                "segments": [{
                    "label": "Wall A",
                    "material": "brick",
                    "temp": 18.5,
                    "humidity": 40.0,
                    "area": 12.0
                }],
                "image_base64": "aGVsbG8="
            })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"advice": "insulate"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let reply = forwarder(&server)
            .recommend(&wall(), "aGVsbG8=")
            .await
            .unwrap();
        assert_eq!(reply["advice"], "insulate");
    }

    #[tokio::test]
    async fn server_error_is_forward_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/predict"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let err = forwarder(&server).predict(&wall()).await.unwrap_err();
        assert!(matches!(err, ForwardError::Status { status: 500, .. }));
    }

    #[tokio::test]
    async fn non_json_reply_is_forward_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/predict"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;

        let err = forwarder(&server).predict(&wall()).await.unwrap_err();
        assert!(matches!(err, ForwardError::Decode { .. }));
    }

    #[tokio::test]
    async fn unreachable_service_is_forward_error() {
        let config = ForwarderConfig {
            timeout: Duration::from_secs(2),
            ..ForwarderConfig::with_base_url("http://127.0.0.1:9")
        };
        let err = Forwarder::new(config)
            .unwrap()
            .predict(&wall())
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::Request { .. }));
    }
}
