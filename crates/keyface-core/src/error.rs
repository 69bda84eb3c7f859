use thiserror::Error;

/// Failures raised by the biometric core.
///
/// Input-precondition failures (`InsufficientData`, `NoFaceDetected`, …) are
/// kept apart from "no match" outcomes: a probe that simply does not match
/// yields `Ok` with `accepted = false`, never an error.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BiometricError {
    #[error("insufficient data: need at least {required} keystrokes, got {got}")]
    InsufficientData { required: usize, got: usize },
    #[error("insufficient samples: need at least {required}, got {got}")]
    InsufficientSamples { required: usize, got: usize },
    #[error("keystroke {index} is released before it is pressed")]
    InvalidKeystroke { index: usize },
    #[error("no fitted template for this user")]
    NotEnrolled,
    #[error("no face detected")]
    NoFaceDetected,
    #[error("multiple faces detected ({0})")]
    MultipleFacesDetected(usize),
    #[error("face region is empty")]
    EmptyRegion,
    #[error("liveness check failed")]
    LivenessFailed,
    #[error("vector dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("invalid embedding value (NaN/Inf)")]
    InvalidEmbeddingValue,
    #[error("length mismatch: {left} vs {right}")]
    LengthMismatch { left: usize, right: usize },
    #[error("unknown fusion strategy: {0}")]
    UnknownStrategy(String),
    #[error("empty input")]
    EmptyInput,
    #[error("fusion weights must sum to a positive value")]
    InvalidWeights,
    #[error("invalid ground-truth label {0} (expected 0 or 1)")]
    InvalidLabel(u8),
    #[error("face provider error: {0}")]
    Provider(#[from] ProviderError),
}

/// Failures reported by an external [`crate::FaceProvider`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("no face found in image")]
    NoFace,
    #[error("provider backend failure: {0}")]
    Backend(String),
}
