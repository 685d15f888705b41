use crate::protocol::RawFields;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

// The instant voltage is sent as a biased ADC code
const INSTANT_VOLTAGE_BIAS: f64 = 10000.0;
const INSTANT_VOLTAGE_SCALE: f64 = 0.00015;

/// Quantity surfaced in the cell matrix.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "String", into = "String"))]
pub enum MeasurementMode {
    #[default]
    InstantaneousCellVoltage,
    InternalResistance,
    OpenCircuitVoltage,
}

impl MeasurementMode {
    pub const ALL: [Self; 3] = [
        Self::InstantaneousCellVoltage,
        Self::InternalResistance,
        Self::OpenCircuitVoltage,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Self::InstantaneousCellVoltage => "Instantaneous Cell Voltage",
            Self::InternalResistance => "Internal Resistance",
            Self::OpenCircuitVoltage => "Open Circuit Voltage",
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::InstantaneousCellVoltage => "instantaneous-cell-voltage",
            Self::InternalResistance => "internal-resistance",
            Self::OpenCircuitVoltage => "open-circuit-voltage",
        }
    }

    fn short_name(&self) -> &'static str {
        match self {
            Self::InstantaneousCellVoltage => "icv",
            Self::InternalResistance => "ir",
            Self::OpenCircuitVoltage => "ocv",
        }
    }

    /// Selects the raw payload field this mode reads.
    pub fn raw_value(&self, raw: &RawFields) -> u16 {
        match self {
            Self::InstantaneousCellVoltage => raw.instant_voltage,
            Self::InternalResistance => raw.resistance,
            Self::OpenCircuitVoltage => raw.open_circuit_voltage,
        }
    }

    /// Converts the relevant raw field into the displayed value.
    ///
    /// Resistance and open circuit voltage are not calibrated yet, the raw
    /// code is passed through unchanged.
    pub fn decode(&self, raw: &RawFields) -> CellValue {
        let value = self.raw_value(raw);
        match self {
            Self::InstantaneousCellVoltage => {
                let volts = (f64::from(value) + INSTANT_VOLTAGE_BIAS) * INSTANT_VOLTAGE_SCALE;
                CellValue::Volts(round_millis(volts))
            }
            Self::InternalResistance | Self::OpenCircuitVoltage => CellValue::Raw(value),
        }
    }
}

// Rounds the exact binary value to three decimals, like `{:.3}` does.
fn round_millis(value: f64) -> f64 {
    format!("{value:.3}").parse().unwrap_or(value)
}

/// Pure conversion of one frame's raw fields under `mode`.
pub fn decode(mode: MeasurementMode, raw: &RawFields) -> CellValue {
    mode.decode(raw)
}

impl fmt::Display for MeasurementMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Error indicating an unrecognized measurement mode
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown measurement mode '{0}', expected one of: icv, ir, ocv")]
pub struct ErrorUnknownMode(pub String);

impl FromStr for MeasurementMode {
    type Err = ErrorUnknownMode;

    /// Accepts the label ("Internal Resistance"), the kebab-case name
    /// ("internal-resistance") or the short form ("ir"), ignoring case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|mode| {
                s.eq_ignore_ascii_case(mode.label())
                    || s.eq_ignore_ascii_case(mode.name())
                    || s.eq_ignore_ascii_case(mode.short_name())
            })
            .ok_or_else(|| ErrorUnknownMode(s.to_string()))
    }
}

impl TryFrom<String> for MeasurementMode {
    type Error = ErrorUnknownMode;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MeasurementMode> for String {
    fn from(mode: MeasurementMode) -> String {
        mode.name().to_string()
    }
}

/// Last known displayed value of a cell.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum CellValue {
    #[default]
    Unknown,
    Volts(f64),
    Raw(u16),
}

impl CellValue {
    /// Placeholder written for cells without a reading.
    pub const UNKNOWN_TOKEN: &'static str = "NA";

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Unknown => f.write_str(Self::UNKNOWN_TOKEN),
            Self::Volts(volts) => write!(f, "{volts}"),
            Self::Raw(raw) => write!(f, "{raw}"),
        }
    }
}
