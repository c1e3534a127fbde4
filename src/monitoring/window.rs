//! Bounded trailing windows and the z-score anomaly detector.

use std::collections::VecDeque;

use crate::config::EngineConfig;

/// Trailing values for one (program, parameter) pair, oldest first.
/// Holds at most `cap` entries; the oldest is evicted first.
#[derive(Debug, Clone)]
pub struct MeasurementWindow {
    values: VecDeque<f64>,
    cap: usize,
}

impl MeasurementWindow {
    pub fn new(cap: usize) -> Self {
        let cap = cap.max(1);
        Self {
            values: VecDeque::with_capacity(cap.min(64)),
            cap,
        }
    }

    /// Rebuild a window from historical values (oldest first).
    pub fn from_history(cap: usize, history: impl IntoIterator<Item = f64>) -> Self {
        let mut window = Self::new(cap);
        for value in history {
            window.push(value);
        }
        window
    }

    pub fn push(&mut self, value: f64) {
        if self.values.len() == self.cap {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Most recent value, if any.
    pub fn latest(&self) -> Option<f64> {
        self.values.back().copied()
    }

    /// Up to `n` most recent values, oldest first.
    pub fn tail(&self, n: usize) -> impl Iterator<Item = f64> + '_ {
        let skip = self.values.len().saturating_sub(n);
        self.values.iter().skip(skip).copied()
    }
}

/// Result of scoring one value against its window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Assessment {
    pub is_anomaly: bool,
    /// `None` when there is too little history or no spread.
    pub z_score: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnomalyDetector {
    lookback: usize,
    min_history: usize,
    z_threshold: f64,
}

impl AnomalyDetector {
    pub fn new(lookback: usize, min_history: usize, z_threshold: f64) -> Self {
        Self {
            lookback: lookback.max(1),
            min_history,
            z_threshold,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.anomaly_lookback,
            config.anomaly_min_history,
            config.anomaly_z_threshold,
        )
    }

    /// Score `value` against `window`, which must not contain it yet.
    ///
    /// Below `min_history` prior values nothing is anomalous. Otherwise the
    /// statistics cover the trailing lookback ending with `value` (the new
    /// value plus up to `lookback - 1` priors, population standard deviation).
    pub fn assess(&self, window: &MeasurementWindow, value: f64) -> Assessment {
        let not_anomalous = Assessment {
            is_anomaly: false,
            z_score: None,
        };
        if window.len() < self.min_history {
            return not_anomalous;
        }

        let sample: Vec<f64> = window
            .tail(self.lookback - 1)
            .chain(std::iter::once(value))
            .collect();
        let n = sample.len() as f64;
        let mean = sample.iter().sum::<f64>() / n;
        let variance = sample.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let std_dev = variance.sqrt();
        if std_dev == 0.0 {
            return not_anomalous;
        }

        let z = (value - mean).abs() / std_dev;
        Assessment {
            is_anomaly: z > self.z_threshold,
            z_score: Some(z),
        }
    }
}

impl Default for AnomalyDetector {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}
