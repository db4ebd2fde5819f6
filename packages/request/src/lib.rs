#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Turns spill records into imagery requests.
//!
//! [`RequestBuilder`] validates the request configuration once and then
//! builds one [`ImageRequest`] per record without touching the network.
//! [`build_plan`] runs it over a whole record set and returns a
//! [`RequestPlan`]: the requests plus the [`GeometryIdentifierMap`] that
//! reconciliation later uses to rename downloads.

pub mod index;

use std::collections::BTreeSet;

use spill_chips_request_models::{
    CorrelationToken, DataCollection, ImageRequest, MimeType, MosaickingOrder,
};
use spill_chips_spill_models::SpillRecord;
use spill_chips_window::{WindowError, WindowParams, compute_windows};

pub use index::{BoundsCollision, GeometryIdentifierMap, MatchedBy, Resolution};

/// Invalid or incomplete request configuration. Fatal before dispatch.
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    /// The evaluation script is empty or whitespace.
    #[error("Evaluation script is missing")]
    MissingEvalscript,

    /// No data collection was selected.
    #[error("Data collection is missing")]
    MissingDataCollection,

    /// A numeric window parameter is out of range.
    #[error("Invalid request parameter {name}: {message}")]
    InvalidParameter {
        /// Parameter name.
        name: &'static str,
        /// What is wrong with it.
        message: String,
    },

    /// Two input records share an identifier, so their artifacts would be
    /// renamed to the same file.
    #[error("Duplicate record identifier: {identifier}")]
    DuplicateIdentifier {
        /// The repeated identifier.
        identifier: String,
    },
}

/// Everything needed to build requests, before validation.
#[derive(Debug, Clone)]
pub struct RequestConfig {
    /// Evaluation script sent verbatim to the service.
    pub evalscript: String,
    /// Data-source selector.
    pub data_collection: Option<DataCollection>,
    /// Scene ordering policy.
    pub mosaicking_order: MosaickingOrder,
    /// Output encoding.
    pub output_format: MimeType,
    /// Window sizes.
    pub window: WindowParams,
}

/// Builds [`ImageRequest`]s from records using a validated configuration.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    evalscript: String,
    data_collection: DataCollection,
    mosaicking_order: MosaickingOrder,
    output_format: MimeType,
    window: WindowParams,
}

impl RequestBuilder {
    /// Validates `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError`] if the evaluation script is blank,
    /// the data collection is missing, a window parameter is zero, or the
    /// collection cannot be ordered by cloud cover but `leastCC` is asked
    /// for.
    pub fn new(config: RequestConfig) -> Result<Self, ConfigurationError> {
        if config.evalscript.trim().is_empty() {
            return Err(ConfigurationError::MissingEvalscript);
        }
        let data_collection = config
            .data_collection
            .ok_or(ConfigurationError::MissingDataCollection)?;

        let window = config.window;
        for (name, value) in [
            ("time_half_width_days", window.half_width_days),
            ("half_edge_km", window.half_edge_km),
            ("resolution_m", window.resolution_m),
        ] {
            if value == 0 {
                return Err(ConfigurationError::InvalidParameter {
                    name,
                    message: "must be > 0".to_string(),
                });
            }
        }

        if config.mosaicking_order == MosaickingOrder::LeastCloudCover
            && !data_collection.has_cloud_cover()
        {
            return Err(ConfigurationError::InvalidParameter {
                name: "mosaicking_order",
                message: format!(
                    "{} has no cloud cover, use {} or {}",
                    data_collection,
                    MosaickingOrder::MostRecent,
                    MosaickingOrder::LeastRecent
                ),
            });
        }

        Ok(Self {
            evalscript: config.evalscript,
            data_collection,
            mosaicking_order: config.mosaicking_order,
            output_format: config.output_format,
            window,
        })
    }

    #[must_use]
    pub const fn window_params(&self) -> &WindowParams {
        &self.window
    }

    #[must_use]
    pub const fn output_format(&self) -> MimeType {
        self.output_format
    }

    /// Builds the request for one record.
    ///
    /// # Errors
    ///
    /// Returns [`WindowError`] if the record's windows cannot be computed
    /// (invalid coordinates or an empty pixel grid).
    pub fn build(&self, record: &SpillRecord) -> Result<ImageRequest, WindowError> {
        let (time, geo) = compute_windows(record, &self.window)?;

        Ok(ImageRequest {
            correlation: CorrelationToken::for_identifier(&record.identifier),
            geo,
            time,
            data_collection: self.data_collection,
            mosaicking_order: self.mosaicking_order,
            output_format: self.output_format,
            evalscript: self.evalscript.clone(),
        })
    }
}

/// A record that produced no request.
#[derive(Debug)]
pub struct RejectedRecord {
    pub identifier: String,
    pub reason: WindowError,
}

/// The output of request construction.
#[derive(Debug, Default)]
pub struct RequestPlan {
    /// One request per accepted record, in input order.
    pub requests: Vec<ImageRequest>,
    /// Join map consumed by reconciliation.
    pub index: GeometryIdentifierMap,
    /// Records whose boxes coincided exactly with an earlier record's.
    pub collisions: Vec<BoundsCollision>,
    /// Records skipped because their windows could not be computed.
    pub rejected: Vec<RejectedRecord>,
}

/// Builds one request per record, in order, along with the join map.
///
/// Records whose windows fail are logged and listed in
/// [`RequestPlan::rejected`]. Exact bounding-box collisions are logged and
/// listed in [`RequestPlan::collisions`].
///
/// # Errors
///
/// Returns [`ConfigurationError::DuplicateIdentifier`] if two records share
/// an identifier.
pub fn build_plan(
    builder: &RequestBuilder,
    records: &[SpillRecord],
) -> Result<RequestPlan, ConfigurationError> {
    let mut seen = BTreeSet::new();
    for record in records {
        if !seen.insert(record.identifier.as_str()) {
            return Err(ConfigurationError::DuplicateIdentifier {
                identifier: record.identifier.clone(),
            });
        }
    }

    let mut plan = RequestPlan::default();

    for record in records {
        let request = match builder.build(record) {
            Ok(request) => request,
            Err(e) => {
                log::warn!("Skipping {}: {e}", record.identifier);
                plan.rejected.push(RejectedRecord {
                    identifier: record.identifier.clone(),
                    reason: e,
                });
                continue;
            }
        };

        if let Err(collision) = plan.index.insert(&request, &record.identifier) {
            log::warn!(
                "Bounding box {} of {} is identical to {}'s; \
                 bbox-only manifests will resolve to {}",
                collision.key,
                collision.shadowed,
                collision.kept,
                collision.kept,
            );
            plan.collisions.push(collision);
        }

        plan.requests.push(request);
    }

    log::info!(
        "Built {} request(s) from {} record(s) ({} rejected, {} bbox collision(s))",
        plan.requests.len(),
        records.len(),
        plan.rejected.len(),
        plan.collisions.len(),
    );

    Ok(plan)
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone as _, Utc};

    use super::*;

    fn config() -> RequestConfig {
        RequestConfig {
            evalscript: "//VERSION=3".to_string(),
            data_collection: Some(DataCollection::Sentinel2L1c),
            mosaicking_order: MosaickingOrder::LeastCloudCover,
            output_format: MimeType::Png,
            window: WindowParams::default(),
        }
    }

    fn record(identifier: &str, latitude: f64, longitude: f64) -> SpillRecord {
        SpillRecord {
            identifier: identifier.to_string(),
            latitude,
            longitude,
            observed_at: Utc.with_ymd_and_hms(2020, 6, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn rejects_blank_evalscript() {
        let config = RequestConfig {
            evalscript: "  \n".to_string(),
            ..config()
        };
        assert!(matches!(
            RequestBuilder::new(config),
            Err(ConfigurationError::MissingEvalscript)
        ));
    }

    #[test]
    fn rejects_missing_data_collection() {
        let config = RequestConfig {
            data_collection: None,
            ..config()
        };
        assert!(matches!(
            RequestBuilder::new(config),
            Err(ConfigurationError::MissingDataCollection)
        ));
    }

    #[test]
    fn rejects_zero_window_parameters() {
        let config = RequestConfig {
            window: WindowParams::from_box_edge(5, 1, 100),
            ..config()
        };
        assert!(matches!(
            RequestBuilder::new(config),
            Err(ConfigurationError::InvalidParameter {
                name: "half_edge_km",
                ..
            })
        ));
    }

    #[test]
    fn rejects_cloud_cover_ordering_for_radar() {
        let least_cc = RequestConfig {
            data_collection: Some(DataCollection::Sentinel1Grd),
            ..config()
        };
        assert!(matches!(
            RequestBuilder::new(least_cc),
            Err(ConfigurationError::InvalidParameter {
                name: "mosaicking_order",
                ..
            })
        ));

        let most_recent = RequestConfig {
            data_collection: Some(DataCollection::Sentinel1Grd),
            mosaicking_order: MosaickingOrder::MostRecent,
            ..config()
        };
        assert!(RequestBuilder::new(most_recent).is_ok());
    }

    #[test]
    fn builds_request_from_record() {
        let builder = RequestBuilder::new(config()).unwrap();
        let request = builder.build(&record("HELCOM_ID_42", 59.3, 24.0)).unwrap();

        assert_eq!(
            request.correlation,
            CorrelationToken::for_identifier("HELCOM_ID_42")
        );
        assert_eq!(request.data_collection, DataCollection::Sentinel2L1c);
        assert_eq!(request.mosaicking_order, MosaickingOrder::LeastCloudCover);
        assert_eq!(request.evalscript, "//VERSION=3");
        assert!(request.geo.min_lon() < 24.0 && 24.0 < request.geo.max_lon());
    }

    #[test]
    fn plan_has_one_entry_per_distinct_record() {
        let builder = RequestBuilder::new(config()).unwrap();
        let records = vec![
            record("HELCOM_ID_1", 59.3, 24.0),
            record("HELCOM_ID_2", 57.1, 19.4),
            record("HELCOM_ID_3", 55.0, 14.2),
        ];

        let plan = build_plan(&builder, &records).unwrap();

        assert_eq!(plan.requests.len(), 3);
        assert_eq!(plan.index.len(), 3);
        assert_eq!(plan.index.bounds_len(), 3);
        assert!(plan.collisions.is_empty());

        for (record, request) in records.iter().zip(&plan.requests) {
            assert_eq!(
                plan.index.identifier_for_bounds(request.geo.bbox()),
                Some(record.identifier.as_str())
            );
            assert_eq!(
                plan.index.identifier_for_token(&request.correlation),
                Some(record.identifier.as_str())
            );
        }
    }

    #[test]
    fn identical_boxes_are_reported_as_collision() {
        let builder = RequestBuilder::new(config()).unwrap();
        let records = vec![
            record("HELCOM_ID_1", 59.3, 24.0),
            record("HELCOM_ID_2", 59.3, 24.0),
        ];

        let plan = build_plan(&builder, &records).unwrap();

        assert_eq!(plan.requests.len(), 2);
        assert_eq!(plan.index.len(), 2);
        assert_eq!(plan.index.bounds_len(), 1);
        assert_eq!(plan.collisions.len(), 1);
        assert_eq!(plan.collisions[0].kept, "HELCOM_ID_1");
        assert_eq!(plan.collisions[0].shadowed, "HELCOM_ID_2");

        // The token still tells the two apart.
        let second = plan
            .index
            .resolve(Some(&plan.requests[1].correlation), Some(plan.requests[1].geo.bbox()))
            .unwrap();
        assert_eq!(second.identifier, "HELCOM_ID_2");
        assert_eq!(second.matched_by, MatchedBy::Token);

        // A bbox-only manifest cannot.
        let bbox_only = plan
            .index
            .resolve(None, Some(plan.requests[1].geo.bbox()))
            .unwrap();
        assert_eq!(bbox_only.identifier, "HELCOM_ID_1");
        assert_eq!(bbox_only.matched_by, MatchedBy::Bounds);
    }

    #[test]
    fn invalid_records_are_rejected_not_fatal() {
        let builder = RequestBuilder::new(config()).unwrap();
        let records = vec![
            record("HELCOM_ID_1", 59.3, 24.0),
            record("HELCOM_ID_2", 123.0, 24.0),
        ];

        let plan = build_plan(&builder, &records).unwrap();

        assert_eq!(plan.requests.len(), 1);
        assert_eq!(plan.rejected.len(), 1);
        assert_eq!(plan.rejected[0].identifier, "HELCOM_ID_2");
        assert!(matches!(
            plan.rejected[0].reason,
            WindowError::InvalidCoordinate { .. }
        ));
    }

    #[test]
    fn duplicate_identifiers_are_fatal() {
        let builder = RequestBuilder::new(config()).unwrap();
        let records = vec![
            record("HELCOM_ID_1", 59.3, 24.0),
            record("HELCOM_ID_1", 57.1, 19.4),
        ];

        assert!(matches!(
            build_plan(&builder, &records),
            Err(ConfigurationError::DuplicateIdentifier { identifier }) if identifier == "HELCOM_ID_1"
        ));
    }

    #[test]
    fn unknown_lookups_miss() {
        let builder = RequestBuilder::new(config()).unwrap();
        let plan = build_plan(&builder, &[record("HELCOM_ID_1", 59.3, 24.0)]).unwrap();

        assert!(plan.index.resolve(None, Some([0.0, 0.0, 1.0, 1.0])).is_none());
        assert!(plan
            .index
            .resolve(Some(&CorrelationToken::from_raw("nope")), None)
            .is_none());
        assert!(plan.index.resolve(None, None).is_none());
    }
}
