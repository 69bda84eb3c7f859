use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BiometricError;
use crate::stats;
use crate::types::{FaceEmbedding, MatchVerdict, EMBEDDING_DIM};

/// Minimum valid embeddings before a face template can be fitted.
pub const MIN_FACE_SAMPLES: usize = 3;

/// Maximum Euclidean distance to the mean encoding for a match.
pub const DEFAULT_FACE_TOLERANCE: f64 = 0.6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceStats {
    pub mean_encoding: Vec<f64>,
    pub std: Vec<f64>,
    pub num_samples: usize,
}

/// Flat persistence record of a [`FaceTemplate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceTemplateRecord {
    pub user_id: String,
    pub template: Option<FaceStats>,
    pub num_samples: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Statistical face template: the mean of the enrollment embeddings.
#[derive(Debug, Clone)]
pub struct FaceTemplate {
    user_id: String,
    embeddings: Vec<FaceEmbedding>,
    stats: Option<FaceStats>,
    sample_count: usize,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl FaceTemplate {
    pub fn new(user_id: &str) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.to_string(),
            embeddings: Vec::new(),
            stats: None,
            sample_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Build and fit a template from already-extracted embeddings.
    ///
    /// Images that failed extraction must be dropped by the caller; every
    /// embedding passed here counts towards [`MIN_FACE_SAMPLES`].
    pub fn enroll(user_id: &str, embeddings: Vec<FaceEmbedding>) -> Result<Self, BiometricError> {
        let mut template = Self::new(user_id);
        for embedding in embeddings {
            template.add_embedding(embedding)?;
        }
        template.fit(MIN_FACE_SAMPLES)?;
        Ok(template)
    }

    pub fn add_embedding(&mut self, embedding: FaceEmbedding) -> Result<(), BiometricError> {
        validate_embedding(&embedding)?;
        self.embeddings.push(embedding);
        self.sample_count = self.embeddings.len();
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn fit(&mut self, min_samples: usize) -> Result<&FaceStats, BiometricError> {
        if self.embeddings.len() < min_samples {
            return Err(BiometricError::InsufficientSamples {
                required: min_samples,
                got: self.embeddings.len(),
            });
        }

        let rows: Vec<&[f64]> = self.embeddings.iter().map(|e| e.values.as_slice()).collect();
        let columns = stats::column_stats(&rows)?;

        self.updated_at = Utc::now();
        Ok(&*self.stats.insert(FaceStats {
            mean_encoding: columns.mean,
            std: columns.std,
            num_samples: self.embeddings.len(),
        }))
    }

    /// Match a probe embedding: accept iff `‖probe − mean‖₂ ≤ tolerance`.
    pub fn verify(
        &self,
        probe: &FaceEmbedding,
        tolerance: f64,
    ) -> Result<MatchVerdict, BiometricError> {
        let stats = self.stats.as_ref().ok_or(BiometricError::NotEnrolled)?;
        validate_embedding(probe)?;

        let distance = stats::l2_norm(
            probe
                .values
                .iter()
                .zip(stats.mean_encoding.iter())
                .map(|(p, m)| p - m),
        );

        Ok(MatchVerdict {
            accepted: distance <= tolerance,
            similarity: 1.0 / (1.0 + distance),
            distance,
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn stats(&self) -> Option<&FaceStats> {
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

    pub fn to_record(&self) -> FaceTemplateRecord {
        FaceTemplateRecord {
            user_id: self.user_id.clone(),
            template: self.stats.clone(),
            num_samples: self.sample_count,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    pub fn from_record(record: FaceTemplateRecord) -> Result<Self, BiometricError> {
        if let Some(stats) = &record.template {
            for column in [&stats.mean_encoding, &stats.std] {
                if column.len() != EMBEDDING_DIM {
                    return Err(BiometricError::DimensionMismatch {
                        expected: EMBEDDING_DIM,
                        got: column.len(),
                    });
                }
            }
        }

        Ok(Self {
            user_id: record.user_id,
            embeddings: Vec::new(),
            stats: record.template,
            sample_count: record.num_samples,
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }
}

fn validate_embedding(embedding: &FaceEmbedding) -> Result<(), BiometricError> {
    if embedding.values.len() != EMBEDDING_DIM {
        return Err(BiometricError::DimensionMismatch {
            expected: EMBEDDING_DIM,
            got: embedding.values.len(),
        });
    }
    if embedding.values.iter().any(|v| !v.is_finite()) {
        return Err(BiometricError::InvalidEmbeddingValue);
    }
    Ok(())
}
