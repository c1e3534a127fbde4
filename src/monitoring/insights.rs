//! Derived per-parameter trend summaries. Recomputed from the durable log;
//! never authoritative.

use std::collections::BTreeMap;

use crate::models::{MonitoringMeasurement, ParameterInsight, Trend};

/// Relative band around the first-half mean inside which a series is stable.
pub const TREND_BAND: f64 = 0.05;

/// Minimum number of values before a trend other than stable is reported.
const MIN_TREND_POINTS: usize = 4;

/// Summaries for every parameter in `measurements` (assumed oldest first),
/// sorted by parameter name.
pub fn compute(measurements: &[MonitoringMeasurement]) -> Vec<ParameterInsight> {
    let mut by_parameter: BTreeMap<&str, Vec<&MonitoringMeasurement>> = BTreeMap::new();
    for m in measurements {
        by_parameter.entry(m.parameter.as_str()).or_default().push(m);
    }

    by_parameter
        .into_iter()
        .filter_map(|(parameter, series)| summarize(parameter, &series))
        .collect()
}

fn summarize(parameter: &str, series: &[&MonitoringMeasurement]) -> Option<ParameterInsight> {
    let latest = series.last()?.value;
    let values: Vec<f64> = series.iter().map(|m| m.value).collect();
    let count = values.len();
    let mean = values.iter().sum::<f64>() / count as f64;
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    Some(ParameterInsight {
        parameter: parameter.to_string(),
        count,
        mean,
        min,
        max,
        latest,
        anomaly_count: series.iter().filter(|m| m.is_anomaly).count(),
        trend: trend(&values),
    })
}

/// Compare the mean of the second half against the first half.
pub fn trend(values: &[f64]) -> Trend {
    if values.len() < MIN_TREND_POINTS {
        return Trend::Stable;
    }
    let (first, second) = values.split_at(values.len() / 2);
    let first_mean = first.iter().sum::<f64>() / first.len() as f64;
    let second_mean = second.iter().sum::<f64>() / second.len() as f64;
    let band = first_mean.abs() * TREND_BAND;
    let delta = second_mean - first_mean;

    if delta > band {
        Trend::Rising
    } else if delta < -band {
        Trend::Falling
    } else {
        Trend::Stable
    }
}
