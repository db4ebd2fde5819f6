//! `spill_chips.toml` and the command-line flags that override it.
//!
//! Every key is optional. Precedence is flag, then file, then built-in
//! default. Sentinel Hub credentials may also come from `SH_CLIENT_ID` and
//! `SH_CLIENT_SECRET`.

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use clap::Args;
use serde::Deserialize;
use spill_chips_dispatch::sentinel_hub::SentinelHubConfig;
use spill_chips_dispatch::{DEFAULT_CONCURRENCY, DEFAULT_TARGET_DIR, DispatchOptions, TransferError};
use spill_chips_reconcile::{ReconcileOptions, UnmatchedPolicy};
use spill_chips_request::RequestConfig;
use spill_chips_request_models::evalscript::EvalscriptPreset;
use spill_chips_request_models::manifest::{ARTIFACT_STEM, MANIFEST_FILE_NAME, OutputLayout};
use spill_chips_request_models::{DataCollection, MimeType, MosaickingOrder};
use spill_chips_spill::records::RecordColumns;
use spill_chips_window::WindowParams;

/// Config file read when `--config` is not given. Absent is fine.
pub const DEFAULT_CONFIG_PATH: &str = "spill_chips.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SentinelHubSection {
    pub base_url: Option<String>,
    pub token_url: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LayoutSection {
    pub manifest_file: String,
    pub artifact_stem: String,
}

impl Default for LayoutSection {
    fn default() -> Self {
        Self {
            manifest_file: MANIFEST_FILE_NAME.to_string(),
            artifact_stem: ARTIFACT_STEM.to_string(),
        }
    }
}

/// Everything a fetch run can be configured with.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FetchConfig {
    /// Days either side of the observation date.
    pub time_half_width_days: u32,
    /// Full edge of the square search box in km. Halved (integer division)
    /// before use.
    pub box_edge_km: u32,
    /// Ground resolution in meters per pixel.
    pub resolution_m: u32,
    pub concurrency: usize,
    /// Defaults to the preset's ordering, else `leastCC`.
    pub mosaicking_order: Option<MosaickingOrder>,
    /// Defaults to the preset's collection, else `sentinel-2-l1c`.
    pub data_collection: Option<DataCollection>,
    pub output_format: MimeType,
    pub evalscript: Option<String>,
    pub evalscript_file: Option<PathBuf>,
    pub evalscript_preset: Option<EvalscriptPreset>,
    pub target_dir: PathBuf,
    pub unmatched: UnmatchedPolicy,
    pub redownload: bool,
    pub layout: LayoutSection,
    pub sentinel_hub: SentinelHubSection,
    pub records: RecordColumns,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            time_half_width_days: 5,
            box_edge_km: 50,
            resolution_m: 100,
            concurrency: DEFAULT_CONCURRENCY,
            mosaicking_order: None,
            data_collection: None,
            output_format: MimeType::default(),
            evalscript: None,
            evalscript_file: None,
            evalscript_preset: None,
            target_dir: PathBuf::from(DEFAULT_TARGET_DIR),
            unmatched: UnmatchedPolicy::default(),
            redownload: false,
            layout: LayoutSection::default(),
            sentinel_hub: SentinelHubSection::default(),
            records: RecordColumns::default(),
        }
    }
}

fn parse_enum<T>(value: &str) -> Result<T, String>
where
    T: FromStr,
    T::Err: Display,
{
    value.parse().map_err(|e| format!("{e}: {value:?}"))
}

/// Flags shared by the commands that build requests.
#[derive(Debug, Clone, Default, Args)]
pub struct Overrides {
    /// Days either side of the observation date
    #[arg(long)]
    pub time_half_width_days: Option<u32>,
    /// Full edge of the search box in km
    #[arg(long)]
    pub box_edge_km: Option<u32>,
    /// Ground resolution in meters per pixel
    #[arg(long)]
    pub resolution_m: Option<u32>,
    /// Concurrent downloads
    #[arg(long)]
    pub concurrency: Option<usize>,
    /// `mostRecent`, `leastRecent` or `leastCC`
    #[arg(long, value_parser = parse_enum::<MosaickingOrder>)]
    pub mosaicking_order: Option<MosaickingOrder>,
    /// e.g. `sentinel-2-l1c`
    #[arg(long, value_parser = parse_enum::<DataCollection>)]
    pub data_collection: Option<DataCollection>,
    /// `image/png`, `image/jpeg` or `image/tiff`
    #[arg(long, value_parser = parse_enum::<MimeType>)]
    pub output_format: Option<MimeType>,
    /// File holding the evaluation script
    #[arg(long, conflicts_with = "evalscript_preset")]
    pub evalscript_file: Option<PathBuf>,
    /// Built-in evaluation script (`true-color`, `sar-vv`)
    #[arg(long, value_parser = parse_enum::<EvalscriptPreset>)]
    pub evalscript_preset: Option<EvalscriptPreset>,
    /// Root directory for downloads
    #[arg(long)]
    pub target_dir: Option<PathBuf>,
    /// `warn` or `fail`
    #[arg(long, value_parser = parse_enum::<UnmatchedPolicy>)]
    pub unmatched: Option<UnmatchedPolicy>,
    /// Download again even if a folder is already complete
    #[arg(long)]
    pub redownload: bool,
}

impl FetchConfig {
    /// Reads `path`, or returns defaults if `path` is `None` and
    /// [`DEFAULT_CONFIG_PATH`] does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        };

        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No {} found, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(source) => return Err(ConfigError::Read { path, source }),
        };

        let config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Applies command-line flags on top of the file values.
    pub fn apply(&mut self, overrides: &Overrides) {
        if let Some(v) = overrides.time_half_width_days {
            self.time_half_width_days = v;
        }
        if let Some(v) = overrides.box_edge_km {
            self.box_edge_km = v;
        }
        if let Some(v) = overrides.resolution_m {
            self.resolution_m = v;
        }
        if let Some(v) = overrides.concurrency {
            self.concurrency = v;
        }
        if let Some(v) = overrides.mosaicking_order {
            self.mosaicking_order = Some(v);
        }
        if let Some(v) = overrides.data_collection {
            self.data_collection = Some(v);
        }
        if let Some(v) = overrides.output_format {
            self.output_format = v;
        }
        if let Some(v) = &overrides.evalscript_file {
            self.evalscript = None;
            self.evalscript_preset = None;
            self.evalscript_file = Some(v.clone());
        }
        if let Some(v) = overrides.evalscript_preset {
            self.evalscript = None;
            self.evalscript_file = None;
            self.evalscript_preset = Some(v);
        }
        if let Some(v) = &overrides.target_dir {
            self.target_dir.clone_from(v);
        }
        if let Some(v) = overrides.unmatched {
            self.unmatched = v;
        }
        if overrides.redownload {
            self.redownload = true;
        }
    }

    /// Resolves the evaluation script, data collection and mosaicking order
    /// into a request configuration.
    ///
    /// The script comes from `evalscript`, else `evalscript_file`, else
    /// `evalscript_preset`. A missing script is left empty for the request
    /// builder to reject. Collection and ordering come from their own keys,
    /// else the preset, else `sentinel-2-l1c` and `leastCC`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] if `evalscript_file` cannot be read.
    pub fn request_config(&self) -> Result<RequestConfig, ConfigError> {
        let evalscript = if let Some(script) = &self.evalscript {
            script.clone()
        } else if let Some(path) = &self.evalscript_file {
            std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?
        } else {
            self.evalscript_preset
                .map(|p| p.script().to_string())
                .unwrap_or_default()
        };

        let data_collection = self
            .data_collection
            .or_else(|| self.evalscript_preset.map(EvalscriptPreset::data_collection))
            .unwrap_or(DataCollection::Sentinel2L1c);
        let mosaicking_order = self
            .mosaicking_order
            .or_else(|| self.evalscript_preset.map(EvalscriptPreset::mosaicking_order))
            .unwrap_or_default();

        Ok(RequestConfig {
            evalscript,
            data_collection: Some(data_collection),
            mosaicking_order,
            output_format: self.output_format,
            window: WindowParams::from_box_edge(
                self.time_half_width_days,
                self.box_edge_km,
                self.resolution_m,
            ),
        })
    }

    #[must_use]
    pub fn layout(&self) -> OutputLayout {
        OutputLayout {
            manifest_file: self.layout.manifest_file.clone(),
            artifact_stem: self.layout.artifact_stem.clone(),
        }
    }

    #[must_use]
    pub fn dispatch_options(&self) -> DispatchOptions {
        DispatchOptions {
            concurrency: self.concurrency,
            target_dir: self.target_dir.clone(),
            redownload: self.redownload,
            layout: self.layout(),
        }
    }

    #[must_use]
    pub fn reconcile_options(&self) -> ReconcileOptions {
        ReconcileOptions {
            layout: self.layout(),
            unmatched: self.unmatched,
            ..ReconcileOptions::default()
        }
    }

    /// Sentinel Hub connection settings, falling back to the environment
    /// for credentials.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Auth`] if credentials are missing.
    pub fn sentinel_hub(&self) -> Result<SentinelHubConfig, TransferError> {
        let section = self.sentinel_hub.clone();
        SentinelHubConfig::resolve(
            section.base_url,
            section.token_url,
            section.client_id,
            section.client_secret,
        )
    }
}

#[cfg(test)]
mod tests {
    use spill_chips_request::RequestBuilder;

    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config: FetchConfig = toml::from_str("").unwrap();
        assert_eq!(config, FetchConfig::default());
        assert_eq!(config.concurrency, 5);
        assert_eq!(config.target_dir, PathBuf::from("./satelite_data"));

        let request = config.request_config().unwrap();
        assert_eq!(request.window.half_width_days, 5);
        assert_eq!(request.window.half_edge_km, 25);
        assert_eq!(request.window.resolution_m, 100);
        assert_eq!(request.data_collection, Some(DataCollection::Sentinel2L1c));
        assert_eq!(request.mosaicking_order, MosaickingOrder::LeastCloudCover);
        assert!(request.evalscript.is_empty());
    }

    #[test]
    fn parses_full_file() {
        let config: FetchConfig = toml::from_str(
            r#"
            time_half_width_days = 3
            box_edge_km = 21
            resolution_m = 20
            concurrency = 8
            mosaicking_order = "mostRecent"
            output_format = "image/tiff"
            evalscript_preset = "sar-vv"
            target_dir = "/data/chips"
            unmatched = "fail"
            redownload = true

            [layout]
            manifest_file = "manifest.json"
            artifact_stem = "artifact"

            [sentinel_hub]
            client_id = "abc"

            [records]
            identifier = "id"
            identifier_prefix = ""
            "#,
        )
        .unwrap();

        assert_eq!(config.unmatched, UnmatchedPolicy::Fail);
        assert_eq!(config.records.identifier, "id");
        assert_eq!(config.records.latitude, "Latitude");
        assert_eq!(config.layout().artifact_file("tif"), "artifact.tif");
        assert_eq!(config.sentinel_hub.client_id.as_deref(), Some("abc"));

        let request = config.request_config().unwrap();
        assert_eq!(request.window.half_edge_km, 10);
        assert_eq!(request.data_collection, Some(DataCollection::Sentinel1Grd));
        assert_eq!(request.mosaicking_order, MosaickingOrder::MostRecent);
        assert_eq!(request.output_format, MimeType::Tiff);
        assert_eq!(request.evalscript, EvalscriptPreset::SarVv.script());
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(toml::from_str::<FetchConfig>("box_edge = 50").is_err());
    }

    #[test]
    fn flags_override_file() {
        let mut config: FetchConfig =
            toml::from_str("concurrency = 2\nevalscript = \"//VERSION=3\"").unwrap();
        config.apply(&Overrides {
            concurrency: Some(9),
            evalscript_preset: Some(EvalscriptPreset::TrueColor),
            data_collection: Some(DataCollection::Sentinel2L2a),
            redownload: true,
            ..Overrides::default()
        });

        assert_eq!(config.concurrency, 9);
        assert!(config.redownload);
        let request = config.request_config().unwrap();
        assert_eq!(request.evalscript, EvalscriptPreset::TrueColor.script());
        assert_eq!(request.data_collection, Some(DataCollection::Sentinel2L2a));
    }

    #[test]
    fn radar_preset_defaults_to_an_ordering_it_supports() {
        let mut config = FetchConfig::default();
        config.apply(&Overrides {
            evalscript_preset: Some(EvalscriptPreset::SarVv),
            ..Overrides::default()
        });

        let request = config.request_config().unwrap();
        assert_eq!(request.data_collection, Some(DataCollection::Sentinel1Grd));
        assert_eq!(request.mosaicking_order, MosaickingOrder::MostRecent);
        assert!(RequestBuilder::new(request).is_ok());

        config.apply(&Overrides {
            mosaicking_order: Some(MosaickingOrder::LeastRecent),
            ..Overrides::default()
        });
        assert_eq!(
            config.request_config().unwrap().mosaicking_order,
            MosaickingOrder::LeastRecent
        );
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("absent.toml");
        assert!(matches!(
            FetchConfig::load(Some(&missing)),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn reads_evalscript_file() {
        let tmp = tempfile::tempdir().unwrap();
        let script = tmp.path().join("ndwi.js");
        std::fs::write(&script, "//VERSION=3\n// ndwi").unwrap();

        let mut config = FetchConfig::default();
        config.apply(&Overrides {
            evalscript_file: Some(script),
            ..Overrides::default()
        });
        assert_eq!(config.request_config().unwrap().evalscript, "//VERSION=3\n// ndwi");
    }
}
