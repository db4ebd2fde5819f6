//! The per-download manifest written next to every artifact.
//!
//! The layout mirrors what the Sentinel Hub Python client writes
//! (`request.json` beside `response.png`), so directories produced by
//! either tool can be reconciled. The echoed bounding box lives at
//! `request.payload.input.bounds.bbox`. Manifests written by this crate
//! also carry a top-level `correlation_id`.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::{CorrelationToken, ImageRequest};

/// Default manifest file name.
pub const MANIFEST_FILE_NAME: &str = "request.json";

/// Default artifact file stem (the extension comes from the output format).
pub const ARTIFACT_STEM: &str = "response";

/// JSON pointer to the echoed bounding box inside the request payload.
const PAYLOAD_BBOX_POINTER: &str = "/input/bounds/bbox";

/// File names used inside each request directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLayout {
    /// Manifest file name (e.g. `request.json`).
    pub manifest_file: String,
    /// Stem of the freshly downloaded artifact (e.g. `response`).
    pub artifact_stem: String,
}

impl Default for OutputLayout {
    fn default() -> Self {
        Self {
            manifest_file: MANIFEST_FILE_NAME.to_string(),
            artifact_stem: ARTIFACT_STEM.to_string(),
        }
    }
}

impl OutputLayout {
    /// Artifact file name for the given extension.
    #[must_use]
    pub fn artifact_file(&self, extension: &str) -> String {
        format!("{}.{extension}", self.artifact_stem)
    }
}

/// What the remote service was asked for and how it answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadManifest {
    pub request: ManifestRequest,
    #[serde(default)]
    pub response: Option<ManifestResponse>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationToken>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestRequest {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// The request body as sent. Kept untyped so manifests from other
    /// clients with extra or differently spelled fields still load.
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestResponse {
    #[serde(alias = "status_code")]
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Seconds between sending the request and receiving the body.
    #[serde(default)]
    pub elapsed: f64,
}

impl DownloadManifest {
    /// Builds the manifest for a completed download.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be converted to JSON.
    pub fn for_request(
        url: &str,
        request: &ImageRequest,
        response: ManifestResponse,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, serde_json::Error> {
        let mut headers = BTreeMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        headers.insert(
            "Accept".to_string(),
            request.output_format.as_ref().to_string(),
        );

        Ok(Self {
            request: ManifestRequest {
                url: url.to_string(),
                headers,
                payload: serde_json::to_value(request.payload())?,
            },
            response: Some(response),
            timestamp: Some(timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)),
            correlation_id: Some(request.correlation.clone()),
        })
    }

    /// Parses a manifest from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a manifest document.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// The bounding box echoed in the request payload, if present and
    /// well-formed (exactly four numbers).
    #[must_use]
    pub fn echoed_bbox(&self) -> Option<[f64; 4]> {
        let values = self
            .request
            .payload
            .pointer(PAYLOAD_BBOX_POINTER)?
            .as_array()?;
        if values.len() != 4 {
            return None;
        }
        let mut bbox = [0.0; 4];
        for (slot, value) in bbox.iter_mut().zip(values) {
            *slot = value.as_f64()?;
        }
        Some(bbox)
    }
}
