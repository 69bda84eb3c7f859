use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{KeystrokeFeatures, FEATURE_DIM};
use crate::error::BiometricError;
use crate::stats;
use crate::types::MatchVerdict;

/// Minimum enrollment sessions before a template can be fitted.
pub const MIN_KEYSTROKE_SAMPLES: usize = 5;

/// Acceptance radius in standard deviations per dimension.
pub const DEFAULT_KEYSTROKE_THRESHOLD: f64 = 3.0;

/// Substituted for a zero standard deviation on constant dimensions.
pub const STD_EPSILON: f64 = 1e-10;

/// Fitted per-dimension statistics of the enrollment vectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeystrokeStats {
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
    pub min: Vec<f64>,
    pub max: Vec<f64>,
    pub num_samples: usize,
}

/// Flat persistence record of a [`KeystrokeTemplate`].
///
/// Enrollment vectors are not persisted; only their count survives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeystrokeTemplateRecord {
    pub user_id: String,
    pub template: Option<KeystrokeStats>,
    pub num_samples: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Statistical keystroke template for one user.
///
/// Created empty, filled with one sample per enrollment session, then
/// [`fit`](Self::fit) once. Matching requires a fitted template.
#[derive(Debug, Clone)]
pub struct KeystrokeTemplate {
    user_id: String,
    samples: Vec<KeystrokeFeatures>,
    stats: Option<KeystrokeStats>,
    sample_count: usize,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl KeystrokeTemplate {
    pub fn new(user_id: &str) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.to_string(),
            samples: Vec::new(),
            stats: None,
            sample_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Build and fit a template in one step.
    pub fn enroll(user_id: &str, vectors: &[KeystrokeFeatures]) -> Result<Self, BiometricError> {
        let mut template = Self::new(user_id);
        for v in vectors {
            template.add_sample(*v);
        }
        template.fit(MIN_KEYSTROKE_SAMPLES)?;
        Ok(template)
    }

    pub fn add_sample(&mut self, features: KeystrokeFeatures) {
        self.samples.push(features);
        self.sample_count = self.samples.len();
        self.updated_at = Utc::now();
    }

    pub fn fit(&mut self, min_samples: usize) -> Result<&KeystrokeStats, BiometricError> {
        if self.samples.len() < min_samples {
            return Err(BiometricError::InsufficientSamples {
                required: min_samples,
                got: self.samples.len(),
            });
        }

        let rows: Vec<&[f64]> = self.samples.iter().map(KeystrokeFeatures::as_slice).collect();
        let columns = stats::column_stats(&rows)?;

        self.updated_at = Utc::now();
        Ok(&*self.stats.insert(KeystrokeStats {
            mean: columns.mean,
            std: columns.std,
            min: columns.min,
            max: columns.max,
            num_samples: self.samples.len(),
        }))
    }

    /// Match a probe vector against the fitted statistics.
    ///
    /// The distance is the Euclidean norm of the per-dimension z-scores, and
    /// the acceptance radius grows with `sqrt(FEATURE_DIM)`.
    pub fn verify(
        &self,
        probe: &KeystrokeFeatures,
        threshold: f64,
    ) -> Result<MatchVerdict, BiometricError> {
        let stats = self.stats.as_ref().ok_or(BiometricError::NotEnrolled)?;

        let distance = stats::l2_norm(
            probe
                .as_slice()
                .iter()
                .zip(stats.mean.iter().zip(stats.std.iter()))
                .map(|(&p, (&m, &s))| {
                    (p - m) / s.max(STD_EPSILON)
                }),
        );

        let dims = probe.as_slice().len() as f64;
        Ok(MatchVerdict {
            accepted: distance < threshold * dims.sqrt(),
            similarity: 1.0 / (1.0 + distance),
            distance,
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn stats(&self) -> Option<&KeystrokeStats> {
        self.stats.as_ref()
    }

    pub fn is_fitted(&self) -> bool {
        self.stats.is_some()
    }

    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn to_record(&self) -> KeystrokeTemplateRecord {
        KeystrokeTemplateRecord {
            user_id: self.user_id.clone(),
            template: self.stats.clone(),
            num_samples: self.sample_count,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    pub fn from_record(record: KeystrokeTemplateRecord) -> Result<Self, BiometricError> {
        if let Some(stats) = &record.template {
            for column in [&stats.mean, &stats.std, &stats.min, &stats.max] {
                if column.len() != FEATURE_DIM {
                    return Err(BiometricError::DimensionMismatch {
                        expected: FEATURE_DIM,
                        got: column.len(),
                    });
                }
            }
        }

        Ok(Self {
            user_id: record.user_id,
            samples: Vec::new(),
            stats: record.template,
            sample_count: record.num_samples,
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystroke::{extract_features, KeystrokeEvent};

    fn vector(offset: f64) -> KeystrokeFeatures {
        let mut values = [0.0; FEATURE_DIM];
        for (i, v) in values.iter_mut().enumerate() {
            *v = 0.1 * (i as f64 + 1.0) + offset;
        }
        KeystrokeFeatures::from_array(values)
    }

    fn enrolled(n: usize) -> KeystrokeTemplate {
        let vectors: Vec<_> = (0..n).map(|i| vector(i as f64 * 0.01)).collect();
        KeystrokeTemplate::enroll("alice", &vectors).unwrap()
    }

    #[test]
    fn test_four_sessions_rejected() {
        let vectors: Vec<_> = (0..4).map(|i| vector(i as f64 * 0.01)).collect();
        let err = KeystrokeTemplate::enroll("alice", &vectors).unwrap_err();
        assert_eq!(
            err,
            BiometricError::InsufficientSamples {
                required: 5,
                got: 4
            }
        );
    }

    #[test]
    fn test_five_sessions_accepted() {
        let template = enrolled(5);
        assert!(template.is_fitted());
        assert_eq!(template.stats().unwrap().num_samples, 5);
        assert_eq!(template.stats().unwrap().mean.len(), FEATURE_DIM);
    }

    #[test]
    fn test_verify_requires_fit() {
        let template = KeystrokeTemplate::new("alice");
        let err = template.verify(&vector(0.0), 3.0).unwrap_err();
        assert_eq!(err, BiometricError::NotEnrolled);
    }

    #[test]
    fn test_mean_vector_is_exact_match() {
        let template = enrolled(6);
        let mean = KeystrokeFeatures::from_slice(&template.stats().unwrap().mean).unwrap();
        let verdict = template.verify(&mean, DEFAULT_KEYSTROKE_THRESHOLD).unwrap();
        assert_eq!(verdict.distance, 0.0);
        assert_eq!(verdict.similarity, 1.0);
        assert!(verdict.accepted);
    }

    #[test]
    fn test_constant_dimensions_use_epsilon() {
        // Identical sessions: every std is zero.
        let vectors = vec![vector(0.0); 5];
        let template = KeystrokeTemplate::enroll("alice", &vectors).unwrap();

        // The fitted mean can sit a few ulps off the samples, which the
        // epsilon floor magnifies into a tiny nonzero distance.
        let same = template.verify(&vector(0.0), 3.0).unwrap();
        assert!(same.accepted);
        assert!(1.0 - same.similarity < 1e-4);

        let shifted = template.verify(&vector(0.001), 3.0).unwrap();
        assert!(!shifted.accepted);
        assert!(shifted.distance.is_finite());
        assert!(shifted.similarity < 1e-6);
    }

    #[test]
    fn test_subepsilon_std_is_floored() {
        let mut vectors = vec![KeystrokeFeatures::from_array([0.0; FEATURE_DIM]); 4];
        let mut last = [0.0; FEATURE_DIM];
        last[0] = 1e-13;
        vectors.push(KeystrokeFeatures::from_array(last));
        let template = KeystrokeTemplate::enroll("alice", &vectors).unwrap();
        assert!(template.stats().unwrap().std[0] > 0.0);

        let mut probe = [0.0; FEATURE_DIM];
        probe[0] = 1e-9;
        let verdict = template
            .verify(&KeystrokeFeatures::from_array(probe), DEFAULT_KEYSTROKE_THRESHOLD)
            .unwrap();
        assert!((verdict.distance - 10.0).abs() < 1e-2);
        assert!(verdict.accepted);
    }

    #[test]
    fn test_far_probe_rejected() {
        let template = enrolled(5);
        let verdict = template.verify(&vector(5.0), 3.0).unwrap();
        assert!(!verdict.accepted);
        assert!(verdict.similarity < 0.5);
    }

    #[test]
    fn test_record_roundtrip_is_bit_identical() {
        let sessions: Vec<Vec<KeystrokeEvent>> = (0..5)
            .map(|s| {
                (0..8)
                    .map(|i| {
                        let t = i as f64 * 0.15 + s as f64 * 0.003;
                        KeystrokeEvent::new("k", t, t + 0.1 + 0.007 * (i % 3) as f64)
                            .with_pressure(0.5 + 0.01 * i as f64)
                    })
                    .collect()
            })
            .collect();
        let vectors: Vec<_> = sessions
            .iter()
            .map(|s| extract_features(s).unwrap())
            .collect();
        let template = KeystrokeTemplate::enroll("alice", &vectors).unwrap();

        let json = serde_json::to_string(&template.to_record()).unwrap();
        let record: KeystrokeTemplateRecord = serde_json::from_str(&json).unwrap();
        let restored = KeystrokeTemplate::from_record(record).unwrap();

        let (a, b) = (template.stats().unwrap(), restored.stats().unwrap());
        for (x, y) in [(&a.mean, &b.mean), (&a.std, &b.std), (&a.min, &b.min), (&a.max, &b.max)] {
            let xb: Vec<u64> = x.iter().map(|v| v.to_bits()).collect();
            let yb: Vec<u64> = y.iter().map(|v| v.to_bits()).collect();
            assert_eq!(xb, yb);
        }
        assert_eq!(restored.sample_count(), 5);
        assert_eq!(restored.created_at(), template.created_at());

        let probe = vectors[2];
        assert_eq!(
            template.verify(&probe, 3.0).unwrap(),
            restored.verify(&probe, 3.0).unwrap()
        );
    }

    #[test]
    fn test_unfitted_record_roundtrip() {
        let template = KeystrokeTemplate::new("bob");
        let record = template.to_record();
        assert!(record.template.is_none());
        let json = serde_json::to_value(&record).unwrap();
        assert!(json["template"].is_null());
        let restored = KeystrokeTemplate::from_record(record).unwrap();
        assert!(!restored.is_fitted());
    }

    #[test]
    fn test_record_with_wrong_dimension_rejected() {
        let mut record = enrolled(5).to_record();
        if let Some(stats) = record.template.as_mut() {
            stats.std.pop();
        }
        let err = KeystrokeTemplate::from_record(record).unwrap_err();
        assert!(matches!(err, BiometricError::DimensionMismatch { .. }));
    }
}
