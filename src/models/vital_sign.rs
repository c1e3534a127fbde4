use serde::{Deserialize, Serialize};

use super::enums::AlertSeverity;

/// Vital parameter scored by the risk analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VitalType {
    HeartRate,
    BloodPressure,
    Temperature,
    OxygenSaturation,
    PainLevel,
}

impl VitalType {
    pub fn as_str(self) -> &'static str {
        match self {
            VitalType::HeartRate => "heart_rate",
            VitalType::BloodPressure => "blood_pressure",
            VitalType::Temperature => "temperature",
            VitalType::OxygenSaturation => "oxygen_saturation",
            VitalType::PainLevel => "pain_level",
        }
    }

    /// Default unit for this vital type.
    pub fn default_unit(self) -> &'static str {
        match self {
            VitalType::HeartRate => "bpm",
            VitalType::BloodPressure => "mmHg",
            VitalType::Temperature => "°C",
            VitalType::OxygenSaturation => "%",
            VitalType::PainLevel => "0-10",
        }
    }
}

/// Snapshot of vitals captured during a live session. Absent values are skipped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VitalSigns {
    pub heart_rate: Option<f64>,
    pub systolic: Option<f64>,
    pub diastolic: Option<f64>,
    pub temperature: Option<f64>,
    pub oxygen_saturation: Option<f64>,
    pub pain_level: Option<f64>,
}

/// One abnormal finding produced by the risk analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VitalAlert {
    pub vital_type: VitalType,
    pub severity: AlertSeverity,
    pub message: String,
    pub score: u32,
}

/// Result of scoring a vitals snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VitalAnalysis {
    pub analysis: String,
    pub alerts: Vec<VitalAlert>,
    /// 0..=100
    pub risk_score: u32,
}
