#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Spill records and the spatial/temporal windows derived from them.
//!
//! A [`SpillRecord`] is one geolocated, dated oil spill observation. The
//! window computer turns each record into a [`TimeWindow`] and a
//! [`GeoWindow`], and the exact boundary tuple of the latter is captured as
//! a [`BoundsKey`] for joining downloaded imagery back to its record.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One input row: a spill observation with a stable identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpillRecord {
    /// Externally assigned, stable, unique identifier (e.g.
    /// `"HELCOM_ID_42"`). Used verbatim as the final artifact file stem.
    pub identifier: String,
    /// Latitude (WGS84).
    pub latitude: f64,
    /// Longitude (WGS84).
    pub longitude: f64,
    /// When the spill was observed, normalized to UTC.
    pub observed_at: DateTime<Utc>,
}

/// A closed time interval `[start, end]` centred on a spill observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeWindow {
    /// Inclusive start of the interval.
    pub start: DateTime<Utc>,
    /// Inclusive end of the interval.
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// Returns the length of the interval.
    #[must_use]
    pub fn span(&self) -> chrono::TimeDelta {
        self.end - self.start
    }

    /// Returns the midpoint of the interval.
    #[must_use]
    pub fn midpoint(&self) -> DateTime<Utc> {
        self.start + self.span() / 2
    }
}

/// A WGS84 bounding box plus the pixel grid requested for it.
///
/// Constructed only through [`GeoWindow::new`], which rejects empty boxes
/// and empty pixel grids.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoWindow {
    min_lon: f64,
    min_lat: f64,
    max_lon: f64,
    max_lat: f64,
    width: u32,
    height: u32,
}

impl GeoWindow {
    /// Builds a window from its corner coordinates and pixel grid size.
    ///
    /// Returns `None` if any coordinate is non-finite, if the box has zero
    /// (or negative) extent along either axis, or if the pixel grid is
    /// empty.
    #[must_use]
    pub fn new(
        min_lon: f64,
        min_lat: f64,
        max_lon: f64,
        max_lat: f64,
        width: u32,
        height: u32,
    ) -> Option<Self> {
        let finite = [min_lon, min_lat, max_lon, max_lat]
            .iter()
            .all(|v| v.is_finite());

        if !finite || min_lon >= max_lon || min_lat >= max_lat || width == 0 || height == 0 {
            return None;
        }

        Some(Self {
            min_lon,
            min_lat,
            max_lon,
            max_lat,
            width,
            height,
        })
    }

    #[must_use]
    pub const fn min_lon(&self) -> f64 {
        self.min_lon
    }

    #[must_use]
    pub const fn min_lat(&self) -> f64 {
        self.min_lat
    }

    #[must_use]
    pub const fn max_lon(&self) -> f64 {
        self.max_lon
    }

    #[must_use]
    pub const fn max_lat(&self) -> f64 {
        self.max_lat
    }

    /// Pixel grid width.
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Pixel grid height.
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// The boundary tuple in `(min_lon, min_lat, max_lon, max_lat)` order,
    /// which is also the order the imagery service echoes back.
    #[must_use]
    pub const fn bbox(&self) -> [f64; 4] {
        [self.min_lon, self.min_lat, self.max_lon, self.max_lat]
    }

    /// The exact boundary tuple as a map key.
    #[must_use]
    pub fn bounds_key(&self) -> BoundsKey {
        BoundsKey::from_bbox(self.bbox())
    }
}

/// Bit-exact boundary tuple used as a join key.
///
/// Two keys are equal only if every coordinate has the same `f64` bit
/// pattern (`-0.0` is folded into `0.0`). No tolerance is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BoundsKey([u64; 4]);

impl BoundsKey {
    /// Creates a key from a `(min_lon, min_lat, max_lon, max_lat)` tuple.
    #[must_use]
    pub fn from_bbox(bbox: [f64; 4]) -> Self {
        Self(bbox.map(|v| (if v == 0.0 { 0.0_f64 } else { v }).to_bits()))
    }

    /// Converts the key back into coordinates.
    #[must_use]
    pub fn to_bbox(self) -> [f64; 4] {
        self.0.map(f64::from_bits)
    }
}

impl fmt::Display for BoundsKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [min_lon, min_lat, max_lon, max_lat] = self.to_bbox();
        write!(f, "({min_lon}, {min_lat}, {max_lon}, {max_lat})")
    }
}
