//! Segment records parsed from the simulation's CSV artifact.
//!
//! Files are streamed record by record on the blocking pool. A row that fails
//! to decode is logged and skipped; only I/O errors on the stream itself fail
//! the whole read. An artifact with a header and no data rows yields an empty
//! set.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

const LABEL_COLUMN: &str = "ObjectName";
const MATERIAL_COLUMN: &str = "Material_type";
const WALL_TEMPERATURE_COLUMN: &str = "FinalWallTemperature_C";
const HUMIDITY_COLUMN: &str = "Humidity";
const AREA_COLUMN: &str = "Area";

pub const DEFAULT_LABEL: &str = "Unnamed";
pub const DEFAULT_MATERIAL: &str = "unknown";

/// One building element from the simulation output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentRecord {
    pub label: String,
    /// Always lowercase.
    pub material: String,
    #[serde(rename = "temp", alias = "wallTemperatureC")]
    pub wall_temperature_c: f64,
    pub humidity: f64,
    pub area: f64,
}

impl SegmentRecord {
    /// Stand-in sent with recommendation requests when no run has produced
    /// an artifact yet.
    pub fn placeholder() -> Self {
        Self {
            label: "Unknown".to_string(),
            material: "concrete".to_string(),
            wall_temperature_c: 35.0,
            humidity: 60.0,
            area: 100.0,
        }
    }

    fn from_row(columns: &Columns, row: &csv::StringRecord) -> Self {
        let cell = |idx: Option<usize>| idx.and_then(|i| row.get(i));
        Self {
            label: text_or(cell(columns.label), DEFAULT_LABEL),
            material: text_or(cell(columns.material), DEFAULT_MATERIAL).to_lowercase(),
            wall_temperature_c: number_or_zero(cell(columns.wall_temperature)),
            humidity: number_or_zero(cell(columns.humidity)),
            area: number_or_zero(cell(columns.area)),
        }
    }
}

/// Untyped row: header -> cell text, in column order.
pub type FieldRecord = IndexMap<String, String>;

/// Which record shape is sent to the prediction service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentFormat {
    #[default]
    Segments,
    Fields,
}

impl FromStr for SegmentFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "segments" | "typed" => Ok(Self::Segments),
            "fields" => Ok(Self::Fields),
            other => Err(format!("unknown segment format '{other}'")),
        }
    }
}

/// Records ready to be forwarded, in either shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SegmentSet {
    Typed(Vec<SegmentRecord>),
    Fields(Vec<FieldRecord>),
}

impl SegmentSet {
    pub fn len(&self) -> usize {
        match self {
            Self::Typed(v) => v.len(),
            Self::Fields(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("failed to open {}: {source}", path.display())]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to read {}: {source}", path.display())]
    Read { path: PathBuf, source: csv::Error },
    #[error("transform task failed: {0}")]
    Join(String),
}

/// Header positions of the columns a [`SegmentRecord`] is built from.
struct Columns {
    label: Option<usize>,
    material: Option<usize>,
    wall_temperature: Option<usize>,
    humidity: Option<usize>,
    area: Option<usize>,
}

impl Columns {
    fn from_headers(headers: &csv::StringRecord) -> Self {
        let find = |name: &str| headers.iter().position(|h| h == name);
        Self {
            label: find(LABEL_COLUMN),
            material: find(MATERIAL_COLUMN),
            wall_temperature: find(WALL_TEMPERATURE_COLUMN),
            humidity: find(HUMIDITY_COLUMN),
            area: find(AREA_COLUMN),
        }
    }
}

fn text_or(cell: Option<&str>, default: &str) -> String {
    match cell {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => default.to_string(),
    }
}

/// Length of the longest decimal number at the start of `s`
/// (`[+-]digits[.digits][e[+-]digits]`), 0 when there is none.
fn numeric_prefix_len(s: &str) -> usize {
    let bytes = s.as_bytes();
    let digits_from = |mut i: usize| {
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        i
    };

    let mut end = usize::from(matches!(bytes.first(), Some(b'+' | b'-')));
    let int_end = digits_from(end);
    let mut mantissa_digits = int_end - end;
    end = int_end;

    if bytes.get(end) == Some(&b'.') {
        let frac_end = digits_from(end + 1);
        mantissa_digits += frac_end - end - 1;
        end = frac_end;
    }
    if mantissa_digits == 0 {
        return 0;
    }

    if matches!(bytes.get(end), Some(b'e' | b'E')) {
        let mut exp = end + 1;
        if matches!(bytes.get(exp), Some(b'+' | b'-')) {
            exp += 1;
        }
        let exp_end = digits_from(exp);
        if exp_end > exp {
            end = exp_end;
        }
    }
    end
}

/// Leading number of a cell, so `"21.5 C"` reads as 21.5. Cells without one
/// are zero, as are NaN and infinities: they have no JSON form.
fn number_or_zero(cell: Option<&str>) -> f64 {
    cell.map(|s| &s[..numeric_prefix_len(s)])
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
}

fn field_record(headers: &csv::StringRecord, row: &csv::StringRecord) -> FieldRecord {
    headers
        .iter()
        .enumerate()
        .map(|(i, h)| (h.to_string(), row.get(i).unwrap_or_default().to_string()))
        .collect()
}

fn read_rows<T>(
    path: &Path,
    mut convert: impl FnMut(&csv::StringRecord, &csv::StringRecord) -> T,
) -> Result<Vec<T>, TransformError> {
    let file = File::open(path).map_err(|source| TransformError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(BufReader::new(file));

    let headers = reader
        .headers()
        .map_err(|source| TransformError::Read {
            path: path.to_path_buf(),
            source,
        })?
        .clone();

    let mut rows = Vec::new();
    let mut row = csv::StringRecord::new();
    loop {
        match reader.read_record(&mut row) {
            Ok(true) => {
                if row.iter().all(str::is_empty) {
                    continue;
                }
                rows.push(convert(&headers, &row));
            }
            Ok(false) => break,
            Err(source) if matches!(source.kind(), csv::ErrorKind::Io(_)) => {
                return Err(TransformError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
            Err(e) => {
                let line = e.position().map(|p| p.line());
                tracing::warn!(path = %path.display(), ?line, error = %e, "Skipping invalid row");
            }
        }
    }

    Ok(rows)
}

pub fn read_segments_blocking(path: &Path) -> Result<Vec<SegmentRecord>, TransformError> {
    let mut columns = None;
    read_rows(path, |headers, row| {
        let columns = columns.get_or_insert_with(|| Columns::from_headers(headers));
        SegmentRecord::from_row(columns, row)
    })
}

pub fn read_field_records_blocking(path: &Path) -> Result<Vec<FieldRecord>, TransformError> {
    read_rows(path, field_record)
}

async fn on_blocking_pool<T: Send + 'static>(
    path: PathBuf,
    read: fn(&Path) -> Result<T, TransformError>,
) -> Result<T, TransformError> {
    tokio::task::spawn_blocking(move || read(&path))
        .await
        .map_err(|e| TransformError::Join(e.to_string()))?
}

/// Parse typed segment records from a CSV artifact.
pub async fn read_segments(path: impl Into<PathBuf>) -> Result<Vec<SegmentRecord>, TransformError> {
    on_blocking_pool(path.into(), read_segments_blocking).await
}

/// Parse untyped field records from a CSV artifact.
pub async fn read_field_records(
    path: impl Into<PathBuf>,
) -> Result<Vec<FieldRecord>, TransformError> {
    on_blocking_pool(path.into(), read_field_records_blocking).await
}

/// Parse an artifact into the shape selected by `format`.
pub async fn read_segment_set(
    path: impl Into<PathBuf>,
    format: SegmentFormat,
) -> Result<SegmentSet, TransformError> {
    match format {
        SegmentFormat::Segments => read_segments(path).await.map(SegmentSet::Typed),
        SegmentFormat::Fields => read_field_records(path).await.map(SegmentSet::Fields),
    }
}
