//! keyface-core: biometric verification engine.
//!
//! Keystroke-dynamics and face templates, heuristic face liveness,
//! multi-modal score/decision fusion, and offline FAR/FRR/EER evaluation.
//! Face detection, landmarks and embeddings come from an external
//! [`FaceProvider`].

pub mod error;
pub mod face;
pub mod fusion;
pub mod keystroke;
pub mod metrics;
mod stats;
pub mod types;

pub use error::{BiometricError, ProviderError};
pub use face::{
    FaceAuthConfig, FaceAuthenticator, FaceProvider, FaceTemplate, LivenessAnalyzer,
    LivenessConfig,
};
pub use fusion::{DecisionRule, FusionWeights, ScoreRule};
pub use keystroke::{KeystrokeEvent, KeystrokeFeatures, KeystrokeTemplate};
pub use types::{
    BoundingBox, FaceEmbedding, FaceLandmarks, FusedResult, LivenessVerdict, MatchVerdict,
    Modality, ModalityResult,
};
