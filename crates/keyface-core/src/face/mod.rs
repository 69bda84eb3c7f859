//! Face verification: template matching, liveness gating, and the
//! authentication pipeline over an external [`FaceProvider`].

pub mod liveness;
pub mod pipeline;
pub mod template;

pub use liveness::{eye_aspect_ratio, LivenessAnalyzer, LivenessConfig};
pub use pipeline::{EnrollmentBatch, FaceAuthConfig, FaceAuthenticator, FaceProvider};
pub use template::{
    FaceStats, FaceTemplate, FaceTemplateRecord, DEFAULT_FACE_TOLERANCE, MIN_FACE_SAMPLES,
};
