//! Keystroke-dynamics feature extraction.
//!
//! A typing session is an ordered sequence of [`KeystrokeEvent`]s. Adjacent
//! events define flight times and digraphs, so the order is significant.

mod template;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::BiometricError;
use crate::stats;

pub use template::{
    KeystrokeStats, KeystrokeTemplate, KeystrokeTemplateRecord, DEFAULT_KEYSTROKE_THRESHOLD,
    MIN_KEYSTROKE_SAMPLES, STD_EPSILON,
};

/// Length of a [`KeystrokeFeatures`] vector.
pub const FEATURE_DIM: usize = 19;

/// Minimum number of events needed to extract features.
pub const MIN_KEYSTROKES: usize = 2;

/// Pressure assumed for devices that do not report it.
pub const DEFAULT_PRESSURE: f64 = 0.5;

/// One key press/release, times in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeystrokeEvent {
    pub key: String,
    pub press_time: f64,
    pub release_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pressure: Option<f64>,
}

impl KeystrokeEvent {
    pub fn new(key: &str, press_time: f64, release_time: f64) -> Self {
        Self {
            key: key.to_string(),
            press_time,
            release_time,
            pressure: None,
        }
    }

    pub fn with_pressure(mut self, pressure: f64) -> Self {
        self.pressure = Some(pressure);
        self
    }

    pub fn dwell(&self) -> f64 {
        self.release_time - self.press_time
    }

    fn pressure_or_default(&self) -> f64 {
        self.pressure.unwrap_or(DEFAULT_PRESSURE)
    }
}

/// Fixed-length keystroke feature vector.
///
/// Layout: dwell `{mean, std, var, median, min, max}`, flight (same six),
/// pressure `{mean, std, var}`, dwell-delta `{mean, std}`, flight-delta `{mean, std}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KeystrokeFeatures([f64; FEATURE_DIM]);

impl KeystrokeFeatures {
    pub fn from_array(values: [f64; FEATURE_DIM]) -> Self {
        Self(values)
    }

    pub fn from_slice(values: &[f64]) -> Result<Self, BiometricError> {
        let arr: [f64; FEATURE_DIM] =
            values
                .try_into()
                .map_err(|_| BiometricError::DimensionMismatch {
                    expected: FEATURE_DIM,
                    got: values.len(),
                })?;
        Ok(Self(arr))
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn dwell_mean(&self) -> f64 {
        self.0[0]
    }

    pub fn flight_mean(&self) -> f64 {
        self.0[6]
    }

    pub fn pressure_mean(&self) -> f64 {
        self.0[12]
    }
}

/// Inter-press timing of one ordered key pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DigraphTiming {
    pub mean: f64,
    pub std: f64,
    pub count: usize,
}

/// Extract the fixed-length feature vector from a typing session.
pub fn extract_features(events: &[KeystrokeEvent]) -> Result<KeystrokeFeatures, BiometricError> {
    if events.len() < MIN_KEYSTROKES {
        return Err(BiometricError::InsufficientData {
            required: MIN_KEYSTROKES,
            got: events.len(),
        });
    }
    if let Some(index) = events.iter().position(|e| e.release_time < e.press_time) {
        return Err(BiometricError::InvalidKeystroke { index });
    }

    let dwell: Vec<f64> = events.iter().map(KeystrokeEvent::dwell).collect();
    let flight: Vec<f64> = events
        .windows(2)
        .map(|w| w[1].press_time - w[0].release_time)
        .collect();
    let pressure: Vec<f64> = events.iter().map(|e| e.pressure_or_default()).collect();

    let mut out = [0.0; FEATURE_DIM];
    out[0..6].copy_from_slice(&stats::describe(&dwell));
    out[6..12].copy_from_slice(&stats::describe(&flight));
    out[12..15].copy_from_slice(&stats::mean_std_var(&pressure));
    out[15..17].copy_from_slice(&stats::diff_mean_std(&dwell));
    out[17..19].copy_from_slice(&stats::diff_mean_std(&flight));

    Ok(KeystrokeFeatures(out))
}

/// Inter-press interval statistics keyed by ordered key pair.
///
/// Supplementary to the fixed vector; not used by [`KeystrokeTemplate::verify`].
pub fn extract_digraphs(events: &[KeystrokeEvent]) -> BTreeMap<(String, String), DigraphTiming> {
    let mut timings: BTreeMap<(String, String), Vec<f64>> = BTreeMap::new();
    for pair in events.windows(2) {
        timings
            .entry((pair[0].key.clone(), pair[1].key.clone()))
            .or_default()
            .push(pair[1].press_time - pair[0].press_time);
    }

    timings
        .into_iter()
        .map(|(digraph, values)| {
            let [mean, std, _] = stats::mean_std_var(&values);
            (
                digraph,
                DigraphTiming {
                    mean,
                    std,
                    count: values.len(),
                },
            )
        })
        .collect()
}
