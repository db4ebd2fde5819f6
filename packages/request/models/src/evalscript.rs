//! Built-in evaluation scripts.
//!
//! Scripts are opaque to the pipeline; these presets only save users from
//! pasting the common ones into their config.

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::{DataCollection, MosaickingOrder};

/// Sentinel-2 true colour (B04, B03, B02).
pub const TRUE_COLOR: &str = r#"//VERSION=3

function setup() {
    return {
        input: [{
            bands: ["B02", "B03", "B04"]
        }],
        output: {
            bands: 3
        }
    };
}

function evaluatePixel(sample) {
    return [sample.B04, sample.B03, sample.B02];
}
"#;

/// Sentinel-1 VV backscatter rendered as greyscale with a data mask.
pub const SAR_VV: &str = r#"//VERSION=3

function setup() {
  return {
    input: ["VV", "dataMask"],
    output: [
      { id: "default", bands: 4 },
      { id: "eobrowserStats", bands: 1 },
      { id: "dataMask", bands: 1 },
    ],
  };
}

function evaluatePixel(samples) {
  const value = Math.max(0, Math.log(samples.VV) * 0.21714724095 + 1);
  return {
    default: [value, value, value, samples.dataMask],
    eobrowserStats: [Math.max(-30, (10 * Math.log10(samples.VV)))],
    dataMask: [samples.dataMask],
  };
}
"#;

/// Named evaluation script presets.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum EvalscriptPreset {
    /// [`TRUE_COLOR`].
    TrueColor,
    /// [`SAR_VV`].
    SarVv,
}

impl EvalscriptPreset {
    /// The script source.
    #[must_use]
    pub const fn script(self) -> &'static str {
        match self {
            Self::TrueColor => TRUE_COLOR,
            Self::SarVv => SAR_VV,
        }
    }

    /// The data collection the script's input bands come from.
    #[must_use]
    pub const fn data_collection(self) -> DataCollection {
        match self {
            Self::TrueColor => DataCollection::Sentinel2L1c,
            Self::SarVv => DataCollection::Sentinel1Grd,
        }
    }

    /// Scene ordering valid for [`Self::data_collection`].
    #[must_use]
    pub const fn mosaicking_order(self) -> MosaickingOrder {
        match self {
            Self::TrueColor => MosaickingOrder::LeastCloudCover,
            Self::SarVv => MosaickingOrder::MostRecent,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr as _;

    use super::*;

    #[test]
    fn parses_preset_names() {
        assert_eq!(
            EvalscriptPreset::from_str("true-color").unwrap(),
            EvalscriptPreset::TrueColor
        );
        assert_eq!(
            EvalscriptPreset::from_str("sar-vv").unwrap(),
            EvalscriptPreset::SarVv
        );
    }

    #[test]
    fn presets_use_version_three_scripts() {
        for preset in [EvalscriptPreset::TrueColor, EvalscriptPreset::SarVv] {
            assert!(preset.script().starts_with("//VERSION=3"));
        }
        assert_eq!(
            EvalscriptPreset::SarVv.data_collection(),
            DataCollection::Sentinel1Grd
        );
    }

    #[test]
    fn preset_orderings_suit_their_collections() {
        for preset in [EvalscriptPreset::TrueColor, EvalscriptPreset::SarVv] {
            if !preset.data_collection().has_cloud_cover() {
                assert_ne!(preset.mosaicking_order(), MosaickingOrder::LeastCloudCover);
            }
        }
        assert_eq!(
            EvalscriptPreset::SarVv.mosaicking_order(),
            MosaickingOrder::MostRecent
        );
    }
}
