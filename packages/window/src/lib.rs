#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Spatial and temporal query windows for spill records.
//!
//! Each [`SpillRecord`] is turned into a [`TimeWindow`] centred on the
//! observation time and a square-ish [`GeoWindow`] centred on its location.
//! The box uses a flat-earth approximation of [`KM_PER_DEGREE`] kilometres
//! per degree of latitude; the longitude half-width is stretched by
//! `1 / cos(latitude)` so the box keeps roughly the same ground extent at
//! every latitude.
//!
//! The longitude correction diverges at the poles. A record at exactly
//! ±90° latitude produces an unbounded longitude span; this is not special
//! cased.

use chrono::{DateTime, TimeDelta, Utc};
use geo::{Contains as _, Rect, coord};
use spill_chips_spill_models::{GeoWindow, SpillRecord, TimeWindow};

/// Approximate kilometres per degree of latitude.
pub const KM_PER_DEGREE: f64 = 111.0;

const METERS_PER_DEGREE: f64 = KM_PER_DEGREE * 1000.0;

/// Errors from window computation.
#[derive(Debug, thiserror::Error)]
pub enum WindowError {
    /// A window parameter is out of range.
    #[error("Invalid window parameter {name}: {message}")]
    InvalidParameter {
        /// Parameter name.
        name: &'static str,
        /// What is wrong with it.
        message: String,
    },

    /// The record's coordinates are outside WGS84 range or not finite.
    #[error("Invalid coordinate: latitude={latitude}, longitude={longitude}")]
    InvalidCoordinate {
        /// Offending latitude.
        latitude: f64,
        /// Offending longitude.
        longitude: f64,
    },

    /// The box extent and resolution round to an empty pixel grid.
    #[error(
        "Degenerate pixel grid: {width_m:.1} m x {height_m:.1} m at {resolution_m} m resolution"
    )]
    DegenerateGrid {
        /// Ground width of the box in metres.
        width_m: f64,
        /// Ground height of the box in metres.
        height_m: f64,
        /// Requested resolution in metres per pixel.
        resolution_m: u32,
    },
}

/// Parameters controlling window size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowParams {
    /// Days before and after the observation covered by the time window.
    pub half_width_days: u32,
    /// Distance from the box centre to each edge, in kilometres.
    pub half_edge_km: u32,
    /// Ground resolution in metres per pixel.
    pub resolution_m: u32,
}

impl WindowParams {
    /// Builds parameters from a full box edge length. The edge is halved
    /// with integer division, so an edge of `1` km yields a zero half-edge.
    #[must_use]
    pub const fn from_box_edge(half_width_days: u32, box_edge_km: u32, resolution_m: u32) -> Self {
        Self {
            half_width_days,
            half_edge_km: box_edge_km / 2,
            resolution_m,
        }
    }
}

impl Default for WindowParams {
    fn default() -> Self {
        Self::from_box_edge(5, 50, 100)
    }
}

/// Computes both windows for a record.
///
/// # Errors
///
/// Returns [`WindowError`] if any parameter is zero, the record's
/// coordinates are invalid, or the pixel grid would be empty.
pub fn compute_windows(
    record: &SpillRecord,
    params: &WindowParams,
) -> Result<(TimeWindow, GeoWindow), WindowError> {
    let time = time_window(record.observed_at, params.half_width_days)?;
    let geo = geo_window(
        record.latitude,
        record.longitude,
        params.half_edge_km,
        params.resolution_m,
    )?;
    Ok((time, geo))
}

/// Returns `[observed_at - half_width_days, observed_at + half_width_days]`.
///
/// # Errors
///
/// Returns [`WindowError::InvalidParameter`] if `half_width_days` is zero or
/// the interval overflows the representable date range.
pub fn time_window(
    observed_at: DateTime<Utc>,
    half_width_days: u32,
) -> Result<TimeWindow, WindowError> {
    if half_width_days == 0 {
        return Err(WindowError::InvalidParameter {
            name: "half_width_days",
            message: "must be > 0".to_string(),
        });
    }

    let delta = TimeDelta::days(i64::from(half_width_days));
    let overflow = || WindowError::InvalidParameter {
        name: "half_width_days",
        message: format!("{half_width_days} days around {observed_at} is out of range"),
    };

    Ok(TimeWindow {
        start: observed_at.checked_sub_signed(delta).ok_or_else(overflow)?,
        end: observed_at.checked_add_signed(delta).ok_or_else(overflow)?,
    })
}

/// Returns the bounding box around `(latitude, longitude)` and its pixel
/// grid.
///
/// # Errors
///
/// Returns [`WindowError`] if `half_edge_km` or `resolution_m` is zero, the
/// coordinates are invalid, or the grid rounds to zero pixels.
pub fn geo_window(
    latitude: f64,
    longitude: f64,
    half_edge_km: u32,
    resolution_m: u32,
) -> Result<GeoWindow, WindowError> {
    if half_edge_km == 0 {
        return Err(WindowError::InvalidParameter {
            name: "half_edge_km",
            message: "must be > 0 (box edge must be at least 2 km)".to_string(),
        });
    }
    if resolution_m == 0 {
        return Err(WindowError::InvalidParameter {
            name: "resolution_m",
            message: "must be > 0".to_string(),
        });
    }
    if !latitude.is_finite()
        || !longitude.is_finite()
        || !(-90.0..=90.0).contains(&latitude)
        || !(-180.0..=180.0).contains(&longitude)
    {
        return Err(WindowError::InvalidCoordinate {
            latitude,
            longitude,
        });
    }

    let lat_offset = f64::from(half_edge_km) / KM_PER_DEGREE;
    let lon_offset = lat_offset / latitude.to_radians().cos();

    let min_lat = latitude - lat_offset;
    let max_lat = latitude + lat_offset;
    let min_lon = longitude - lon_offset;
    let max_lon = longitude + lon_offset;

    let (width, height) = grid_size([min_lon, min_lat, max_lon, max_lat], resolution_m)?;

    log::debug!(
        "bbox ({min_lon}, {min_lat}, {max_lon}, {max_lat}) {width}x{height}px \
         http://bboxfinder.com/#{min_lat:.6},{min_lon:.6},{max_lat:.6},{max_lon:.6}"
    );

    GeoWindow::new(min_lon, min_lat, max_lon, max_lat, width, height).ok_or(
        WindowError::InvalidCoordinate {
            latitude,
            longitude,
        },
    )
}

/// Converts a `(min_lon, min_lat, max_lon, max_lat)` box into a pixel grid
/// at the given resolution.
///
/// Ground extent uses the same [`KM_PER_DEGREE`] approximation as the box
/// itself, with longitude scaled by the cosine of the centre latitude.
///
/// # Errors
///
/// Returns [`WindowError::DegenerateGrid`] if either side rounds to zero
/// pixels.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn grid_size(bbox: [f64; 4], resolution_m: u32) -> Result<(u32, u32), WindowError> {
    let [min_lon, min_lat, max_lon, max_lat] = bbox;
    let center_lat = f64::midpoint(min_lat, max_lat);

    let height_m = (max_lat - min_lat) * METERS_PER_DEGREE;
    let width_m = (max_lon - min_lon) * METERS_PER_DEGREE * center_lat.to_radians().cos();

    let resolution = f64::from(resolution_m);
    let width = (width_m / resolution).round().clamp(0.0, f64::from(u32::MAX)) as u32;
    let height = (height_m / resolution).round().clamp(0.0, f64::from(u32::MAX)) as u32;

    if width == 0 || height == 0 {
        return Err(WindowError::DegenerateGrid {
            width_m,
            height_m,
            resolution_m,
        });
    }

    Ok((width, height))
}

/// Returns `true` if the point lies strictly inside the window.
#[must_use]
pub fn contains_point(window: &GeoWindow, latitude: f64, longitude: f64) -> bool {
    let rect = Rect::new(
        coord! { x: window.min_lon(), y: window.min_lat() },
        coord! { x: window.max_lon(), y: window.max_lat() },
    );
    rect.contains(&coord! { x: longitude, y: latitude })
}
