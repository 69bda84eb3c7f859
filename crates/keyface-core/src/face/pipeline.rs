use image::DynamicImage;

use super::liveness::{LivenessAnalyzer, LivenessConfig};
use super::template::{FaceTemplate, DEFAULT_FACE_TOLERANCE};
use crate::error::{BiometricError, ProviderError};
use crate::types::{BoundingBox, FaceEmbedding, FaceLandmarks, Modality, ModalityResult};

/// External face detection / landmark / embedding backend.
///
/// Implementations typically wrap a neural model and are not thread-safe,
/// hence `&mut self`.
pub trait FaceProvider: Send {
    fn detect_faces(&mut self, image: &DynamicImage) -> Result<Vec<BoundingBox>, ProviderError>;

    /// One landmark map per requested face, in the same order.
    fn extract_landmarks(
        &mut self,
        image: &DynamicImage,
        faces: &[BoundingBox],
    ) -> Result<Vec<FaceLandmarks>, ProviderError>;

    /// Embedding of `face`, or of the most prominent face when `None`.
    fn extract_encoding(
        &mut self,
        image: &DynamicImage,
        face: Option<&BoundingBox>,
    ) -> Result<FaceEmbedding, ProviderError>;
}

impl<P: FaceProvider + ?Sized> FaceProvider for Box<P> {
    fn detect_faces(&mut self, image: &DynamicImage) -> Result<Vec<BoundingBox>, ProviderError> {
        (**self).detect_faces(image)
    }

    fn extract_landmarks(
        &mut self,
        image: &DynamicImage,
        faces: &[BoundingBox],
    ) -> Result<Vec<FaceLandmarks>, ProviderError> {
        (**self).extract_landmarks(image, faces)
    }

    fn extract_encoding(
        &mut self,
        image: &DynamicImage,
        face: Option<&BoundingBox>,
    ) -> Result<FaceEmbedding, ProviderError> {
        (**self).extract_encoding(image, face)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceAuthConfig {
    pub tolerance: f64,
    pub liveness_enabled: bool,
    pub liveness: LivenessConfig,
}

impl Default for FaceAuthConfig {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_FACE_TOLERANCE,
            liveness_enabled: true,
            liveness: LivenessConfig::default(),
        }
    }
}

/// Embeddings gathered from a batch of enrollment images.
#[derive(Debug, Clone)]
pub struct EnrollmentBatch {
    pub embeddings: Vec<FaceEmbedding>,
    /// Indices of images that produced no usable embedding.
    pub skipped: Vec<usize>,
}

/// Single-frame face authentication: detect, gate on liveness, then match.
#[derive(Debug, Clone)]
pub struct FaceAuthenticator {
    config: FaceAuthConfig,
    liveness: LivenessAnalyzer,
}

impl FaceAuthenticator {
    pub fn new(config: FaceAuthConfig) -> Self {
        Self {
            liveness: LivenessAnalyzer::new(config.liveness),
            config,
        }
    }

    pub fn config(&self) -> &FaceAuthConfig {
        &self.config
    }

    /// Authenticate one probe image against a fitted template.
    ///
    /// Frames with zero or several faces are rejected as errors. A failed
    /// liveness check is a rejection (`accepted = false`, score 0) and no
    /// embedding is requested from the provider.
    pub fn authenticate<P: FaceProvider + ?Sized>(
        &self,
        provider: &mut P,
        template: &FaceTemplate,
        image: &DynamicImage,
    ) -> Result<ModalityResult, BiometricError> {
        if !template.is_fitted() {
            return Err(BiometricError::NotEnrolled);
        }

        let faces = provider.detect_faces(image).map_err(no_face)?;
        let face = match faces.as_slice() {
            [] => return Err(BiometricError::NoFaceDetected),
            [face] => *face,
            many => return Err(BiometricError::MultipleFacesDetected(many.len())),
        };

        let mut result = ModalityResult::new(Modality::Face, false, 0.0)
            .with_meta("liveness_check", self.config.liveness_enabled);

        if self.config.liveness_enabled {
            let landmarks = provider
                .extract_landmarks(image, std::slice::from_ref(&face))
                .map_err(no_face)?
                .into_iter()
                .next();
            let verdict = self.liveness.analyze(image, &face, landmarks.as_ref())?;
            result = result
                .with_meta("texture_score", verdict.texture_score)
                .with_meta("blink_detected", verdict.blink_detected)
                .with_meta("liveness_score", verdict.liveness_score);

            if let Err(e) = self.liveness.require_live(&verdict) {
                tracing::warn!(
                    user = template.user_id(),
                    liveness_score = verdict.liveness_score,
                    "face rejected: {e}"
                );
                return Ok(result.with_meta("rejection", "liveness_failed"));
            }
        }

        let embedding = provider
            .extract_encoding(image, Some(&face))
            .map_err(no_face)?;
        let verdict = template.verify(&embedding, self.config.tolerance)?;

        result.accepted = verdict.accepted;
        result.score = verdict.similarity;
        Ok(result
            .with_meta("similarity", verdict.similarity)
            .with_meta("distance", verdict.distance)
            .with_meta("tolerance", self.config.tolerance))
    }

    /// Extract one embedding per image, skipping images the provider cannot
    /// encode. Backend failures other than "no face" abort the batch.
    pub fn collect_embeddings<P: FaceProvider + ?Sized>(
        &self,
        provider: &mut P,
        images: &[DynamicImage],
    ) -> Result<EnrollmentBatch, BiometricError> {
        let mut batch = EnrollmentBatch {
            embeddings: Vec::with_capacity(images.len()),
            skipped: Vec::new(),
        };

        for (i, image) in images.iter().enumerate() {
            match provider.extract_encoding(image, None) {
                Ok(embedding) => batch.embeddings.push(embedding),
                Err(ProviderError::NoFace) => {
                    tracing::warn!(image = i, "enroll: no face found, skipping image");
                    batch.skipped.push(i);
                }
                Err(e) => return Err(e.into()),
            }
        }

        tracing::debug!(
            usable = batch.embeddings.len(),
            skipped = batch.skipped.len(),
            "enroll: embeddings collected"
        );
        Ok(batch)
    }
}

fn no_face(e: ProviderError) -> BiometricError {
    match e {
        ProviderError::NoFace => BiometricError::NoFaceDetected,
        other => BiometricError::Provider(other),
    }
}
