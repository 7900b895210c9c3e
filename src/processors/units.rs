use tracing::warn;

use crate::error::{ProcessingError, Result};
use crate::models::{GriddedField, GriddedFields, ObsUnit};
use crate::utils::constants::{PPM_TO_PPB, R_GAS};

/// Factor converting ugm-3 to ppbv at temperature `t` (K) and pressure `p` (Pa)
///
/// # Examples
/// ```
/// use cfobs_processor::processors::units::conversion_factor_ugm3_to_ppbv;
///
/// let o3 = conversion_factor_ugm3_to_ppbv(298.15, 101325.0, 48.0);
/// assert!((o3 - 0.5097).abs() < 1e-4);
/// ```
pub fn conversion_factor_ugm3_to_ppbv(t: f64, p: f64, mw: f64) -> f64 {
    t * R_GAS * 1.0e-6 / (p * mw) * 1.0e9
}

/// Gridded ugm-3 to ppbv factor, `None` when temperature or pressure is unavailable
pub fn conversion_field(
    fields: &GriddedFields,
    temperature_name: &str,
    pressure_name: &str,
    mw: f64,
) -> Option<GriddedField> {
    let temperature = fields.get(temperature_name)?;
    let pressure = fields.get(pressure_name)?;

    match temperature.zip_with(pressure, "conv_ugm3_to_ppbv", |t, p| {
        conversion_factor_ugm3_to_ppbv(t, p, mw)
    }) {
        Ok(field) => Some(field),
        Err(e) => {
            warn!("Cannot build unit conversion field: {}", e);
            None
        }
    }
}

/// How a value in a given unit becomes ppbv
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConversionRule {
    /// Multiply by the gridded conversion factor and the molar scale
    ConversionFactor,
    Scale(f64),
    Identity,
    /// No rule exists, the value is kept and flagged
    Unsupported,
}

impl ConversionRule {
    pub fn to_ppbv(unit: &ObsUnit) -> Self {
        match unit {
            ObsUnit::MassConcentration => ConversionRule::ConversionFactor,
            ObsUnit::Ppmv | ObsUnit::Ppm => ConversionRule::Scale(PPM_TO_PPB),
            ObsUnit::Ppbv | ObsUnit::Ppb => ConversionRule::Identity,
            ObsUnit::Unitless | ObsUnit::Unknown(_) => ConversionRule::Unsupported,
        }
    }
}

/// Result of a single value conversion
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Converted {
    Value(f64),
    /// Unit had no conversion rule
    Unknown(f64),
}

impl Converted {
    pub fn value(&self) -> f64 {
        match self {
            Converted::Value(v) | Converted::Unknown(v) => *v,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Converted::Value(_))
    }
}

/// Convert an observation value to ppbv.
///
/// `conv_factor` is the nearest-cell value of the conversion field built with a
/// molecular weight of 1; `molar_scale` is `1 / mw` of the species.
pub fn convert_to_ppbv(
    value: f64,
    unit: &ObsUnit,
    conv_factor: Option<f64>,
    molar_scale: f64,
) -> Result<Converted> {
    match ConversionRule::to_ppbv(unit) {
        ConversionRule::ConversionFactor => {
            let conv = conv_factor.ok_or_else(|| ProcessingError::UnitConversion {
                entry: unit.to_string(),
                reason: "meteorological fields are missing".to_string(),
            })?;
            Ok(Converted::Value(value * conv * molar_scale))
        }
        ConversionRule::Scale(factor) => Ok(Converted::Value(value * factor)),
        ConversionRule::Identity => Ok(Converted::Value(value)),
        ConversionRule::Unsupported => Ok(Converted::Unknown(value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::sync::Arc;

    #[test]
    fn test_factor_scaling() {
        let base = conversion_factor_ugm3_to_ppbv(290.0, 95000.0, 30.0);
        assert!((conversion_factor_ugm3_to_ppbv(290.0, 95000.0, 60.0) - base / 2.0).abs() < 1e-12);
        assert!((conversion_factor_ugm3_to_ppbv(580.0, 95000.0, 30.0) - base * 2.0).abs() < 1e-12);
        assert!((conversion_factor_ugm3_to_ppbv(290.0, 190000.0, 30.0) - base / 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_ppmv_to_ppbv_is_exact() -> Result<()> {
        let converted = convert_to_ppbv(1.0, &ObsUnit::Ppmv, None, 1.0)?;
        assert_eq!(converted, Converted::Value(1000.0));
        assert_eq!(convert_to_ppbv(0.3, &ObsUnit::Ppm, None, 1.0)?, Converted::Value(300.0));
        assert_eq!(convert_to_ppbv(3.0, &ObsUnit::Ppb, None, 1.0)?, Converted::Value(3.0));
        Ok(())
    }

    #[test]
    fn test_mass_concentration_uses_factor() -> Result<()> {
        let converted = convert_to_ppbv(10.0, &ObsUnit::MassConcentration, Some(24.0), 1.0 / 48.0)?;
        assert!((converted.value() - 5.0).abs() < 1e-12);

        let missing = convert_to_ppbv(10.0, &ObsUnit::MassConcentration, None, 1.0);
        assert!(matches!(missing, Err(ProcessingError::UnitConversion { .. })));
        Ok(())
    }

    #[test]
    fn test_passthrough_units() -> Result<()> {
        assert_eq!(
            convert_to_ppbv(40.0, &ObsUnit::Ppbv, None, 1.0)?,
            Converted::Value(40.0)
        );
        let unknown = convert_to_ppbv(0.3, &ObsUnit::Unitless, None, 1.0)?;
        assert_eq!(unknown.value(), 0.3);
        assert!(!unknown.is_known());
        Ok(())
    }

    #[test]
    fn test_conversion_field() {
        let lats = Arc::new(vec![0.0]);
        let lons = Arc::new(vec![0.0, 1.0]);
        let mut fields = GriddedFields::new();
        fields.insert(
            GriddedField::new("t10m", lats.clone(), lons.clone(), array![[290.0, 300.0]]).unwrap(),
        );
        assert!(conversion_field(&fields, "t10m", "ps", 1.0).is_none());

        fields.insert(
            GriddedField::new("ps", lats, lons, array![[100000.0, 100000.0]]).unwrap(),
        );
        let conv = conversion_field(&fields, "t10m", "ps", 1.0).unwrap();
        let expected = conversion_factor_ugm3_to_ppbv(300.0, 100000.0, 1.0);
        assert!((conv.values[[0, 1]] - expected).abs() < 1e-12);
    }
}
