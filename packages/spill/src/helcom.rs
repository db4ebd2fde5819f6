//! HELCOM oil spill observations.
//!
//! One-shot query against the HELCOM `MapServer` layer of illegal
//! discharges. Each returned feature is written to
//! `{output_dir}/spill_{OBJECTID}.json` as a `GeoJSON`-style feature:
//! `{"type": "Feature", "properties": <attributes>, "geometry": <geometry>}`.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::SpillError;

/// Query endpoint of the HELCOM spill observation layer.
pub const HELCOM_QUERY_URL: &str =
    "https://maps.helcom.fi/arcgis/rest/services/MADS/Shipping/MapServer/323/query";

/// Oil spills since 2015 with a known date and time.
pub const DEFAULT_WHERE: &str =
    "Year > 2014 AND Spill_cat = 'Oil' AND Date IS NOT NULL AND Time_UTC IS NOT NULL";

/// Default output directory.
pub const DEFAULT_OUTPUT_DIR: &str = "detected_spills";

/// Query parameters for [`download_spills`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelcomQuery {
    pub query_url: String,
    pub where_clause: String,
}

impl Default for HelcomQuery {
    fn default() -> Self {
        Self {
            query_url: HELCOM_QUERY_URL.to_string(),
            where_clause: DEFAULT_WHERE.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    features: Vec<Feature>,
    #[serde(default)]
    error: Option<ServiceError>,
}

#[derive(Debug, Deserialize)]
struct Feature {
    attributes: Map<String, Value>,
    #[serde(default)]
    geometry: Value,
}

#[derive(Debug, Deserialize)]
struct ServiceError {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: String,
}

/// Downloads all matching spill features and writes one file per feature.
///
/// Returns the paths written.
///
/// # Errors
///
/// Returns [`SpillError`] if the request fails, the service reports an
/// error, or a file cannot be written.
pub async fn download_spills(
    query: &HelcomQuery,
    output_dir: &Path,
) -> Result<Vec<PathBuf>, SpillError> {
    let client = reqwest::Client::new();

    log::info!("HELCOM: querying {}", query.query_url);
    let body: Value = client
        .get(&query.query_url)
        .query(&[
            ("where", query.where_clause.as_str()),
            ("outFields", "*"),
            ("returnGeometry", "true"),
            ("f", "json"),
        ])
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    let written = write_features(body, output_dir)?;
    log::info!(
        "HELCOM: downloaded {} spill(s) to {}",
        written.len(),
        output_dir.display()
    );
    Ok(written)
}

/// Writes every feature of an `ArcGIS` query response to `output_dir`.
///
/// Features without an `OBJECTID` attribute are skipped with a warning.
///
/// # Errors
///
/// Returns [`SpillError::Service`] for an error document,
/// [`SpillError::Json`] if `body` is not a query response, and
/// [`SpillError::Io`] if writing fails.
pub fn write_features(body: Value, output_dir: &Path) -> Result<Vec<PathBuf>, SpillError> {
    let response: QueryResponse = serde_json::from_value(body)?;
    if let Some(error) = response.error {
        return Err(SpillError::Service {
            message: match error.code {
                Some(code) => format!("{code}: {}", error.message),
                None => error.message,
            },
        });
    }

    std::fs::create_dir_all(output_dir).map_err(|source| SpillError::Io {
        path: output_dir.to_path_buf(),
        source,
    })?;

    let mut written = Vec::with_capacity(response.features.len());
    for feature in response.features {
        let Some(object_id) = feature.attributes.get("OBJECTID").and_then(object_id_str) else {
            log::warn!("HELCOM: skipping feature without OBJECTID");
            continue;
        };

        let path = output_dir.join(format!("spill_{object_id}.json"));
        let entry = json!({
            "type": "Feature",
            "properties": feature.attributes,
            "geometry": feature.geometry,
        });
        let contents = serde_json::to_string_pretty(&entry)?;
        std::fs::write(&path, contents).map_err(|source| SpillError::Io {
            path: path.clone(),
            source,
        })?;
        written.push(path);
    }

    Ok(written)
}

fn object_id_str(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}
