#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Imagery request types shared by the request builder, the dispatcher,
//! and the reconciler.
//!
//! An [`ImageRequest`] is the fully specified query for one spill record.
//! It renders to a Sentinel Hub Process API [`ProcessPayload`]. After a
//! download, the dispatcher stores a [`manifest::DownloadManifest`] next to
//! the artifact, which the reconciler later reads to join the artifact
//! back to its record.

pub mod evalscript;
pub mod manifest;

use std::fmt;

use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use spill_chips_spill_models::{GeoWindow, TimeWindow};
use strum_macros::{AsRefStr, Display, EnumString};

/// CRS URI for WGS84 in longitude/latitude axis order.
pub const CRS84: &str = "http://www.opengis.net/def/crs/OGC/1.3/CRS84";

/// Identifier of the single output response requested per image.
pub const DEFAULT_RESPONSE_ID: &str = "default";

/// The satellite data collection to query.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
pub enum DataCollection {
    /// Sentinel-2 top-of-atmosphere reflectance.
    #[serde(rename = "sentinel-2-l1c")]
    #[strum(serialize = "sentinel-2-l1c")]
    Sentinel2L1c,
    /// Sentinel-2 bottom-of-atmosphere reflectance.
    #[serde(rename = "sentinel-2-l2a")]
    #[strum(serialize = "sentinel-2-l2a")]
    Sentinel2L2a,
    /// Sentinel-1 ground range detected radar backscatter.
    #[serde(rename = "sentinel-1-grd")]
    #[strum(serialize = "sentinel-1-grd")]
    Sentinel1Grd,
}

impl DataCollection {
    /// Whether scenes carry cloud cover metadata. Radar collections do not,
    /// so they cannot be ordered by [`MosaickingOrder::LeastCloudCover`].
    #[must_use]
    pub const fn has_cloud_cover(self) -> bool {
        !matches!(self, Self::Sentinel1Grd)
    }
}

/// How overlapping scenes inside the time window are ordered when
/// mosaicked into a single image.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
pub enum MosaickingOrder {
    /// Most recent acquisition on top.
    #[serde(rename = "mostRecent")]
    #[strum(serialize = "mostRecent")]
    MostRecent,
    /// Oldest acquisition on top.
    #[serde(rename = "leastRecent")]
    #[strum(serialize = "leastRecent")]
    LeastRecent,
    /// Least cloud cover on top.
    #[default]
    #[serde(rename = "leastCC")]
    #[strum(serialize = "leastCC")]
    LeastCloudCover,
}

/// Output image encoding.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
pub enum MimeType {
    #[default]
    #[serde(rename = "image/png")]
    #[strum(serialize = "image/png")]
    Png,
    #[serde(rename = "image/jpeg")]
    #[strum(serialize = "image/jpeg")]
    Jpeg,
    #[serde(rename = "image/tiff")]
    #[strum(serialize = "image/tiff")]
    Tiff,
}

impl MimeType {
    /// File extension written for this encoding (without the dot).
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpg",
            Self::Tiff => "tif",
        }
    }
}

/// Opaque per-record token echoed in the download manifest.
///
/// Derived deterministically from the record identifier so that a later,
/// separate reconciliation run rebuilds the same tokens without any
/// persisted state.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationToken(String);

impl CorrelationToken {
    /// Derives the token for a record identifier.
    #[must_use]
    pub fn for_identifier(identifier: &str) -> Self {
        let mut context = md5::Context::new();
        context.consume(identifier.as_bytes());
        Self(format!("{:x}", context.finalize()))
    }

    /// Wraps a token read back from a manifest.
    #[must_use]
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A fully specified imagery query for one spill record.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRequest {
    /// Token tying the download back to its record.
    pub correlation: CorrelationToken,
    /// Area of interest and pixel grid.
    pub geo: GeoWindow,
    /// Acquisition date range.
    pub time: TimeWindow,
    /// Data-source selector.
    pub data_collection: DataCollection,
    /// Scene ordering policy.
    pub mosaicking_order: MosaickingOrder,
    /// Output encoding.
    pub output_format: MimeType,
    /// Evaluation script run by the service for every pixel. Opaque here.
    pub evalscript: String,
}

impl ImageRequest {
    /// Renders the Process API request body.
    #[must_use]
    pub fn payload(&self) -> ProcessPayload {
        ProcessPayload {
            input: ProcessInput {
                bounds: Bounds {
                    bbox: self.geo.bbox(),
                    properties: BoundsProperties {
                        crs: CRS84.to_string(),
                    },
                },
                data: vec![InputData {
                    data_type: self.data_collection,
                    data_filter: DataFilter {
                        time_range: TimeRange {
                            from: self.time.start.to_rfc3339_opts(SecondsFormat::Secs, true),
                            to: self.time.end.to_rfc3339_opts(SecondsFormat::Secs, true),
                        },
                        mosaicking_order: self.mosaicking_order,
                    },
                }],
            },
            output: ProcessOutput {
                width: self.geo.width(),
                height: self.geo.height(),
                responses: vec![OutputResponse {
                    identifier: DEFAULT_RESPONSE_ID.to_string(),
                    format: OutputFormat {
                        mime_type: self.output_format,
                    },
                }],
            },
            evalscript: self.evalscript.clone(),
        }
    }

    /// Stable directory name for this request's download: the hex MD5 of
    /// the serialized payload followed by the correlation token.
    ///
    /// Including the token keeps folders distinct when two records produce
    /// byte-identical payloads.
    #[must_use]
    pub fn folder_name(&self) -> String {
        let mut context = md5::Context::new();
        // Serializing plain structs of strings, numbers and enums cannot fail.
        if let Ok(bytes) = serde_json::to_vec(&self.payload()) {
            context.consume(&bytes);
        }
        context.consume(self.correlation.as_str().as_bytes());
        format!("{:x}", context.finalize())
    }

    /// File extension of the downloaded artifact.
    #[must_use]
    pub const fn extension(&self) -> &'static str {
        self.output_format.extension()
    }
}

/// Sentinel Hub Process API request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessPayload {
    pub input: ProcessInput,
    pub output: ProcessOutput,
    pub evalscript: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInput {
    pub bounds: Bounds,
    pub data: Vec<InputData>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    /// `[min_lon, min_lat, max_lon, max_lat]`.
    pub bbox: [f64; 4],
    pub properties: BoundsProperties,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundsProperties {
    pub crs: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputData {
    #[serde(rename = "type")]
    pub data_type: DataCollection,
    pub data_filter: DataFilter,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataFilter {
    pub time_range: TimeRange,
    pub mosaicking_order: MosaickingOrder,
}

/// RFC 3339 timestamps, inclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessOutput {
    pub width: u32,
    pub height: u32,
    pub responses: Vec<OutputResponse>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputResponse {
    pub identifier: String,
    pub format: OutputFormat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFormat {
    #[serde(rename = "type")]
    pub mime_type: MimeType,
}
