//! HTTP route handlers.

use std::sync::Arc;

use axum::{
    Router,
    extract::{
        DefaultBodyLimit, Multipart, Path, State, multipart::MultipartRejection,
        rejection::JsonRejection,
    },
    http::{StatusCode, header},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::PipelineError;
use crate::health::HealthSnapshot;
use crate::pipeline::PipelineResult;
use crate::registry::RunId;
use crate::service::{PipelineService, RecommendationInput};

/// Multipart field carrying the simulation input.
const UPLOAD_FIELD: &str = "file";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendationRequest {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub run_id: Option<String>,
}

fn error_response(
    status: StatusCode,
    error: &str,
    reason: &str,
    details: Option<String>,
) -> Response {
    let mut body = json!({
        "success": false,
        "error": error,
        "reason": reason,
    });
    if let Some(details) = details {
        body["details"] = Value::String(details);
    }
    (status, Json(body)).into_response()
}

async fn health(State(service): State<Arc<PipelineService>>) -> Json<HealthSnapshot> {
    Json(service.health())
}

fn invalid_upload(e: axum::extract::multipart::MultipartError) -> Response {
    error_response(
        e.status(),
        "Invalid upload",
        "invalid_upload",
        Some(e.body_text()),
    )
}

fn staging_failed(e: PipelineError) -> Response {
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "Failed to store upload",
        e.reason(),
        Some(e.to_string()),
    )
}

/// Stream the upload's file field into a fresh run. `Ok(None)` when there
/// is no file field.
async fn stage_upload(
    service: &PipelineService,
    mut multipart: Multipart,
) -> Result<Option<RunId>, Response> {
    let mut field = loop {
        match multipart.next_field().await {
            Ok(Some(field)) if field.name() == Some(UPLOAD_FIELD) => break field,
            Ok(Some(_)) => continue,
            Ok(None) => return Ok(None),
            Err(e) => return Err(invalid_upload(e)),
        }
    };

    let file_name = field.file_name().map(str::to_string);
    let mut staged = service.open_input().await.map_err(staging_failed)?;
    loop {
        match field.chunk().await {
            Ok(Some(chunk)) => {
                if let Err(e) = staged.write(&chunk).await {
                    service.discard_input(staged).await;
                    return Err(staging_failed(e));
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(run_id = %staged.run_id(), error = %e, "Upload interrupted");
                service.discard_input(staged).await;
                return Err(invalid_upload(e));
            }
        }
    }

    tracing::debug!(file_name = ?file_name, run_id = %staged.run_id(), "Upload received");
    service.commit_input(staged).await.map(Some).map_err(staging_failed)
}

fn pipeline_response(run_id: &RunId, result: PipelineResult) -> Response {
    match result {
        PipelineResult::SimulationFailed { reason } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "success": false,
                "error": "Simulation failed",
                "reason": "simulation_failed",
                "details": reason,
                "runId": run_id,
            })),
        )
            .into_response(),
        PipelineResult::ArtifactMissing => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "success": false,
                "error": "Simulation completed but no output file was generated.",
                "reason": "artifact_missing",
                "runId": run_id,
            })),
        )
            .into_response(),
        PipelineResult::PredictionUnavailable {
            result_url,
            warning,
        } => Json(json!({
            "success": true,
            "message": "Simulation succeeded but prediction failed",
            "resultUrl": result_url,
            "warning": warning,
            "runId": run_id,
        }))
        .into_response(),
        PipelineResult::Success {
            result_url,
            prediction,
        } => Json(json!({
            "success": true,
            "message": "Simulation and prediction completed",
            "resultUrl": result_url,
            "prediction": prediction,
            "runId": run_id,
        }))
        .into_response(),
    }
}

async fn upload_simulation_input(
    State(service): State<Arc<PipelineService>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    let staged = match multipart {
        Ok(multipart) => match stage_upload(&service, multipart).await {
            Ok(staged) => staged,
            Err(response) => return response,
        },
        Err(rejection) => {
            tracing::debug!(error = %rejection, "Upload is not a multipart body");
            None
        }
    };

    let Some(run_id) = staged else {
        let err = PipelineError::MissingInput;
        tracing::warn!("Upload without a file");
        return error_response(StatusCode::BAD_REQUEST, &err.to_string(), err.reason(), None);
    };

    // Run in a spawned task so a dropped connection does not cancel it.
    let task_service = Arc::clone(&service);
    let task_run = run_id.clone();
    let handle = tokio::spawn(async move { task_service.execute(&task_run).await });

    match handle.await {
        Ok(result) => pipeline_response(&run_id, result),
        Err(e) => {
            tracing::error!(run_id = %run_id, error = %e, "Pipeline task failed");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Simulation failed",
                "simulation_failed",
                Some(e.to_string()),
            )
        }
    }
}

async fn get_recommendation(
    State(service): State<Arc<PipelineService>>,
    body: Result<Json<RecommendationRequest>, JsonRejection>,
) -> Response {
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => {
            return error_response(
                rejection.status(),
                "Invalid request body",
                "invalid_request",
                Some(rejection.body_text()),
            );
        }
    };

    let Some(image) = request.image.filter(|image| !image.is_empty()) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "No image provided",
            PipelineError::MissingInput.reason(),
            None,
        );
    };

    let run_id = match request.run_id.as_deref() {
        None => None,
        Some(raw) => match RunId::parse(raw) {
            Some(id) => Some(id),
            None => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "Invalid runId",
                    "invalid_request",
                    None,
                );
            }
        },
    };

    let input = RecommendationInput {
        image_base64: image,
        timestamp: request.timestamp,
        run_id,
    };

    match service.recommend(input).await {
        Ok(recommendation) => Json(json!({
            "success": true,
            "message": "Recommendation generated successfully",
            "recommendation": recommendation,
        }))
        .into_response(),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to process recommendation",
            e.reason(),
            Some(e.to_string()),
        ),
    }
}

async fn get_run(
    State(service): State<Arc<PipelineService>>,
    Path(id): Path<String>,
) -> Response {
    match RunId::parse(&id).and_then(|id| service.run_snapshot(&id)) {
        Some(snapshot) => Json(snapshot).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "Run not found", "not_found", None),
    }
}

async fn get_result(
    State(service): State<Arc<PipelineService>>,
    Path(relative): Path<String>,
) -> Response {
    let Some(path) = service.storage().resolve_result(&relative) else {
        tracing::warn!(path = %relative, "Rejected result path");
        return StatusCode::NOT_FOUND.into_response();
    };

    match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_file() => {}
        _ => return StatusCode::NOT_FOUND.into_response(),
    }

    match tokio::fs::read(&path).await {
        Ok(contents) => {
            let mime = mime_guess::from_path(&path).first_or_octet_stream();
            ([(header::CONTENT_TYPE, mime.to_string())], contents).into_response()
        }
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "Failed to read result");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub fn routes(service: Arc<PipelineService>) -> Router {
    let limits = service.limits();
    Router::new()
        .route("/health", get(health))
        .route(
            "/upload-simulation-input",
            post(upload_simulation_input).layer(DefaultBodyLimit::max(limits.upload)),
        )
        .route(
            "/get_recommendation",
            post(get_recommendation).layer(DefaultBodyLimit::max(limits.json)),
        )
        .route("/runs/{id}", get(get_run))
        .route("/results/{*path}", get(get_result))
        .with_state(service)
}
