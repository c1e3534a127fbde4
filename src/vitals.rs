//! Vital-sign risk analyzer.
//!
//! Stateless scoring of a vitals snapshot against fixed clinical thresholds.
//! Each present vital yields at most one alert; contributions are summed and
//! capped at 100.

use crate::models::{AlertSeverity, VitalAlert, VitalAnalysis, VitalSigns, VitalType};

pub const MAX_RISK_SCORE: u32 = 100;

pub const ANALYSIS_NORMAL: &str = "Vital signs within normal ranges";
pub const ANALYSIS_MILD: &str = "Mild abnormalities detected, monitor";
pub const ANALYSIS_SIGNIFICANT: &str = "Significant abnormalities detected, immediate attention required";

/// Name of the first present vital that is not a finite number.
pub fn non_finite_field(vitals: &VitalSigns) -> Option<&'static str> {
    [
        ("heart_rate", vitals.heart_rate),
        ("systolic", vitals.systolic),
        ("diastolic", vitals.diastolic),
        ("temperature", vitals.temperature),
        ("oxygen_saturation", vitals.oxygen_saturation),
        ("pain_level", vitals.pain_level),
    ]
    .into_iter()
    .find(|(_, value)| value.is_some_and(|v| !v.is_finite()))
    .map(|(name, _)| name)
}

/// Score a vitals snapshot. Callers reject non-finite values first
/// (see `non_finite_field`); any that slip through are treated as absent.
pub fn analyze(vitals: &VitalSigns) -> VitalAnalysis {
    let finite = |v: Option<f64>| v.filter(|v| v.is_finite());
    let alerts: Vec<VitalAlert> = [
        finite(vitals.heart_rate).and_then(check_heart_rate),
        check_blood_pressure(finite(vitals.systolic), finite(vitals.diastolic)),
        finite(vitals.temperature).and_then(check_temperature),
        finite(vitals.oxygen_saturation).and_then(check_oxygen_saturation),
        finite(vitals.pain_level).and_then(check_pain_level),
    ]
    .into_iter()
    .flatten()
    .collect();

    let risk_score = alerts
        .iter()
        .map(|a| a.score)
        .sum::<u32>()
        .min(MAX_RISK_SCORE);

    let analysis = if alerts.is_empty() {
        ANALYSIS_NORMAL
    } else if alerts.iter().any(|a| a.severity.is_urgent()) {
        ANALYSIS_SIGNIFICANT
    } else {
        ANALYSIS_MILD
    };

    VitalAnalysis {
        analysis: analysis.to_string(),
        alerts,
        risk_score,
    }
}

fn alert(vital_type: VitalType, severity: AlertSeverity, score: u32, message: String) -> VitalAlert {
    VitalAlert {
        vital_type,
        severity,
        message,
        score,
    }
}

fn check_heart_rate(bpm: f64) -> Option<VitalAlert> {
    if (60.0..=100.0).contains(&bpm) {
        return None;
    }
    let direction = if bpm < 60.0 { "Bradycardia" } else { "Tachycardia" };
    let message = format!("{direction}: heart rate {bpm} bpm");
    Some(if bpm < 50.0 || bpm > 120.0 {
        alert(VitalType::HeartRate, AlertSeverity::High, 20, message)
    } else {
        alert(VitalType::HeartRate, AlertSeverity::Medium, 10, message)
    })
}

fn check_blood_pressure(systolic: Option<f64>, diastolic: Option<f64>) -> Option<VitalAlert> {
    if systolic.is_none() && diastolic.is_none() {
        return None;
    }
    let sys = systolic.unwrap_or(0.0);
    let dia = diastolic.unwrap_or(0.0);
    if sys < 140.0 && dia < 90.0 {
        return None;
    }
    let reading = match (systolic, diastolic) {
        (Some(s), Some(d)) => format!("{s}/{d} mmHg"),
        (Some(s), None) => format!("systolic {s} mmHg"),
        (None, Some(d)) => format!("diastolic {d} mmHg"),
        (None, None) => return None,
    };
    Some(if sys >= 160.0 || dia >= 100.0 {
        alert(
            VitalType::BloodPressure,
            AlertSeverity::High,
            25,
            format!("Stage 2 hypertension: {reading}"),
        )
    } else {
        alert(
            VitalType::BloodPressure,
            AlertSeverity::Medium,
            15,
            format!("Elevated blood pressure: {reading}"),
        )
    })
}

fn check_temperature(celsius: f64) -> Option<VitalAlert> {
    if (35.0..37.8).contains(&celsius) {
        return None;
    }
    let direction = if celsius < 35.0 { "Hypothermia" } else { "Fever" };
    let message = format!("{direction}: temperature {celsius} °C");
    Some(if celsius >= 39.0 || celsius < 34.0 {
        alert(VitalType::Temperature, AlertSeverity::High, 20, message)
    } else {
        alert(VitalType::Temperature, AlertSeverity::Medium, 10, message)
    })
}

fn check_oxygen_saturation(pct: f64) -> Option<VitalAlert> {
    if pct >= 95.0 {
        return None;
    }
    Some(if pct < 90.0 {
        alert(
            VitalType::OxygenSaturation,
            AlertSeverity::Critical,
            40,
            format!("Severe hypoxemia: SpO2 {pct}%"),
        )
    } else {
        alert(
            VitalType::OxygenSaturation,
            AlertSeverity::Medium,
            25,
            format!("Low oxygen saturation: SpO2 {pct}%"),
        )
    })
}

fn check_pain_level(level: f64) -> Option<VitalAlert> {
    if level < 7.0 {
        return None;
    }
    Some(if level >= 9.0 {
        alert(
            VitalType::PainLevel,
            AlertSeverity::High,
            15,
            format!("Severe pain reported: {level}/10"),
        )
    } else {
        alert(
            VitalType::PainLevel,
            AlertSeverity::Medium,
            10,
            format!("High pain reported: {level}/10"),
        )
    })
}
