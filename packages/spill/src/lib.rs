#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Where spill records come from.
//!
//! [`records`] loads [`SpillRecord`](spill_chips_spill_models::SpillRecord)s
//! from a CSV export. [`helcom`] pulls the raw oil spill observations from
//! the HELCOM map service as one `GeoJSON` feature file per spill.

pub mod helcom;
pub mod records;

use std::path::PathBuf;

/// Errors from loading or downloading spill data.
#[derive(Debug, thiserror::Error)]
pub enum SpillError {
    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The map service returned an error document.
    #[error("HELCOM service error: {message}")]
    Service {
        /// Message reported by the service.
        message: String,
    },

    /// JSON parsing or serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV parsing failed.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// File system I/O failed.
    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        /// Path that caused the error.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A required CSV column is absent from the header.
    #[error("Missing column {name}")]
    MissingColumn {
        /// Configured column name.
        name: String,
    },

    /// A row could not be turned into a record.
    #[error("Invalid record on line {line}: {message}")]
    InvalidRecord {
        /// 1-based line number in the input.
        line: u64,
        /// What is wrong with it.
        message: String,
    },
}
