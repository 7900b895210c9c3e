use serde::{Deserialize, Serialize};
use std::fmt;

/// Measurement unit of an observation or model column
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ObsUnit {
    /// Mass concentration, ugm-3
    MassConcentration,
    /// Volume mixing ratio, ppbv
    Ppbv,
    /// Volume mixing ratio labelled ppb
    Ppb,
    /// Volume mixing ratio, ppmv
    Ppmv,
    /// Volume mixing ratio labelled ppm
    Ppm,
    Unitless,
    /// Any other label, kept verbatim
    Unknown(String),
}

impl ObsUnit {
    pub fn parse(label: &str) -> Self {
        match label.trim() {
            "ugm-3" => ObsUnit::MassConcentration,
            "ppbv" => ObsUnit::Ppbv,
            "ppb" => ObsUnit::Ppb,
            "ppmv" => ObsUnit::Ppmv,
            "ppm" => ObsUnit::Ppm,
            "unitless" => ObsUnit::Unitless,
            other => ObsUnit::Unknown(other.to_string()),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            ObsUnit::MassConcentration => "ugm-3",
            ObsUnit::Ppbv => "ppbv",
            ObsUnit::Ppb => "ppb",
            ObsUnit::Ppmv => "ppmv",
            ObsUnit::Ppm => "ppm",
            ObsUnit::Unitless => "unitless",
            ObsUnit::Unknown(label) => label,
        }
    }

    pub fn is_mixing_ratio(&self) -> bool {
        matches!(self, ObsUnit::Ppbv | ObsUnit::Ppb | ObsUnit::Ppmv | ObsUnit::Ppm)
    }
}

impl From<String> for ObsUnit {
    fn from(label: String) -> Self {
        ObsUnit::parse(&label)
    }
}

impl From<ObsUnit> for String {
    fn from(unit: ObsUnit) -> Self {
        unit.label().to_string()
    }
}

impl fmt::Display for ObsUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}
