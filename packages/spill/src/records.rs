//! CSV record loading.
//!
//! The expected input is a table with one spill per row. Column names are
//! configurable; the defaults match the HELCOM export (`HELCOM_ID`,
//! `Latitude`, `Longitude`, `Date_standard`). The raw identifier is
//! prefixed (`42` becomes `HELCOM_ID_42`) to form the stable record
//! identifier used as the final artifact name.

use std::collections::BTreeSet;
use std::io::Read;
use std::path::Path;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Deserialize;
use spill_chips_spill_models::SpillRecord;

use crate::SpillError;

/// Naive date-time layouts accepted after RFC 3339.
const DATE_TIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];

/// Column names and identifier prefix for the record table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RecordColumns {
    pub identifier: String,
    pub latitude: String,
    pub longitude: String,
    pub date: String,
    /// Prepended to the raw identifier value.
    pub identifier_prefix: String,
}

impl Default for RecordColumns {
    fn default() -> Self {
        Self {
            identifier: "HELCOM_ID".to_string(),
            latitude: "Latitude".to_string(),
            longitude: "Longitude".to_string(),
            date: "Date_standard".to_string(),
            identifier_prefix: "HELCOM_ID_".to_string(),
        }
    }
}

/// Parses a timestamp in any accepted layout, interpreting naive values as
/// UTC.
///
/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS`, `YYYY-MM-DDTHH:MM:SS`, and
/// `YYYY-MM-DD` (midnight).
#[must_use]
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }

    for fmt in DATE_TIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, fmt) {
            return Some(naive.and_utc());
        }
    }

    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Reads records from a CSV file.
///
/// # Errors
///
/// Returns [`SpillError::Io`] if the file cannot be opened, otherwise as
/// [`read_records`].
pub fn load_records(path: &Path, columns: &RecordColumns) -> Result<Vec<SpillRecord>, SpillError> {
    let file = std::fs::File::open(path).map_err(|source| SpillError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let records = read_records(file, columns)?;
    log::info!("Loaded {} record(s) from {}", records.len(), path.display());
    Ok(records)
}

/// Reads records from CSV with a header row.
///
/// # Errors
///
/// * [`SpillError::Csv`] on malformed CSV
/// * [`SpillError::MissingColumn`] if a configured column is absent
/// * [`SpillError::InvalidRecord`] for an empty or duplicate identifier, a
///   non-numeric coordinate, or an unparseable date
pub fn read_records<R: Read>(
    reader: R,
    columns: &RecordColumns,
) -> Result<Vec<SpillRecord>, SpillError> {
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);

    let headers = reader.headers()?.clone();
    let position = |name: &str| {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| SpillError::MissingColumn {
                name: name.to_string(),
            })
    };
    let id_idx = position(&columns.identifier)?;
    let lat_idx = position(&columns.latitude)?;
    let lon_idx = position(&columns.longitude)?;
    let date_idx = position(&columns.date)?;

    let mut seen = BTreeSet::new();
    let mut records = Vec::new();

    for row in reader.records() {
        let row = row?;
        let line = row.position().map_or(0, csv::Position::line);
        let invalid = |message: String| SpillError::InvalidRecord { line, message };
        let field = |idx: usize| row.get(idx).unwrap_or_default();

        let raw_id = field(id_idx);
        if raw_id.is_empty() {
            return Err(invalid("empty identifier".to_string()));
        }
        if raw_id.contains(['/', '\\']) {
            return Err(invalid(format!("identifier {raw_id:?} contains a path separator")));
        }
        let identifier = format!("{}{raw_id}", columns.identifier_prefix);
        if !seen.insert(identifier.clone()) {
            return Err(invalid(format!("duplicate identifier {identifier}")));
        }

        let coordinate = |idx: usize, name: &str| {
            field(idx)
                .parse::<f64>()
                .map_err(|_| invalid(format!("{name} {:?} is not a number", field(idx))))
        };
        let latitude = coordinate(lat_idx, &columns.latitude)?;
        let longitude = coordinate(lon_idx, &columns.longitude)?;

        let observed_at = parse_timestamp(field(date_idx))
            .ok_or_else(|| invalid(format!("unrecognized date {:?}", field(date_idx))))?;

        records.push(SpillRecord {
            identifier,
            latitude,
            longitude,
            observed_at,
        });
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone as _;

    use super::*;

    #[test]
    fn parses_every_accepted_date_layout() {
        let noon = Utc.with_ymd_and_hms(2020, 6, 1, 12, 30, 0).unwrap();
        assert_eq!(parse_timestamp("2020-06-01T12:30:00Z"), Some(noon));
        assert_eq!(parse_timestamp("2020-06-01T14:30:00+02:00"), Some(noon));
        assert_eq!(parse_timestamp("2020-06-01 12:30:00"), Some(noon));
        assert_eq!(parse_timestamp("2020-06-01T12:30:00"), Some(noon));
        assert_eq!(
            parse_timestamp("2020-06-01"),
            Some(Utc.with_ymd_and_hms(2020, 6, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(parse_timestamp("01/06/2020"), None);
    }

    #[test]
    fn reads_helcom_export() {
        let csv = "\
HELCOM_ID,Latitude,Longitude,Date_standard,Spill_cat
42,59.3,24.0,2020-06-01,Oil
43, 55.1 ,15.25,2021-07-15 08:00:00,Oil
";
        let records = read_records(csv.as_bytes(), &RecordColumns::default()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].identifier, "HELCOM_ID_42");
        assert!((records[0].latitude - 59.3).abs() < f64::EPSILON);
        assert!((records[1].latitude - 55.1).abs() < f64::EPSILON);
        assert_eq!(
            records[1].observed_at,
            Utc.with_ymd_and_hms(2021, 7, 15, 8, 0, 0).unwrap()
        );
    }

    #[test]
    fn honours_custom_columns() {
        let csv = "id,lat,lon,when\nA1,10.0,20.0,2022-01-01\n";
        let columns = RecordColumns {
            identifier: "id".to_string(),
            latitude: "lat".to_string(),
            longitude: "lon".to_string(),
            date: "when".to_string(),
            identifier_prefix: String::new(),
        };
        let records = read_records(csv.as_bytes(), &columns).unwrap();
        assert_eq!(records[0].identifier, "A1");
    }

    #[test]
    fn reports_missing_column() {
        let csv = "HELCOM_ID,Latitude,Longitude\n1,2,3\n";
        let err = read_records(csv.as_bytes(), &RecordColumns::default()).unwrap_err();
        assert!(matches!(err, SpillError::MissingColumn { name } if name == "Date_standard"));
    }

    #[test]
    fn rejects_bad_rows_with_line_numbers() {
        let bad_lat = "HELCOM_ID,Latitude,Longitude,Date_standard\n1,north,3,2020-01-01\n";
        let err = read_records(bad_lat.as_bytes(), &RecordColumns::default()).unwrap_err();
        assert!(matches!(err, SpillError::InvalidRecord { line: 2, .. }));

        let duplicate = "HELCOM_ID,Latitude,Longitude,Date_standard\n\
                         1,1,1,2020-01-01\n\
                         1,2,2,2020-01-02\n";
        let err = read_records(duplicate.as_bytes(), &RecordColumns::default()).unwrap_err();
        assert!(matches!(err, SpillError::InvalidRecord { line: 3, .. }));

        let bad_id = "HELCOM_ID,Latitude,Longitude,Date_standard\n../x,1,1,2020-01-01\n";
        assert!(read_records(bad_id.as_bytes(), &RecordColumns::default()).is_err());
    }

    #[test]
    fn load_records_reports_path() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("nope.csv");
        let err = load_records(&missing, &RecordColumns::default()).unwrap_err();
        assert!(matches!(err, SpillError::Io { path, .. } if path == missing));
    }
}
