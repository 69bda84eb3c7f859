use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::fusion::ScoreRule;

/// Dimensionality of embeddings produced by the face provider.
pub const EMBEDDING_DIM: usize = 128;

/// Face bounding box in image pixel coordinates, `(top, right, bottom, left)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
    pub left: u32,
}

impl BoundingBox {
    pub fn new(top: u32, right: u32, bottom: u32, left: u32) -> Self {
        Self {
            top,
            right,
            bottom,
            left,
        }
    }

    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }
}

/// Named facial landmark groups (`left_eye`, `right_eye`, `chin`, …).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FaceLandmarks {
    pub groups: HashMap<String, Vec<(f64, f64)>>,
}

impl FaceLandmarks {
    pub fn with_eyes(left_eye: Vec<(f64, f64)>, right_eye: Vec<(f64, f64)>) -> Self {
        let mut groups = HashMap::new();
        groups.insert("left_eye".to_string(), left_eye);
        groups.insert("right_eye".to_string(), right_eye);
        Self { groups }
    }

    pub fn group(&self, name: &str) -> &[(f64, f64)] {
        self.groups.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn left_eye(&self) -> &[(f64, f64)] {
        self.group("left_eye")
    }

    pub fn right_eye(&self) -> &[(f64, f64)] {
        self.group("right_eye")
    }
}

/// Opaque face embedding vector produced by the external provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceEmbedding {
    pub values: Vec<f64>,
}

impl FaceEmbedding {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }
}

/// Outcome of matching one probe against a fitted template.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchVerdict {
    pub accepted: bool,
    /// `1 / (1 + distance)`, in (0, 1].
    pub similarity: f64,
    pub distance: f64,
}

/// Per-attempt liveness assessment. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LivenessVerdict {
    pub texture_score: f64,
    /// `None` when eye landmarks were unavailable.
    pub blink_detected: Option<bool>,
    pub liveness_score: f64,
    pub is_live: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Keystroke,
    Face,
}

impl Modality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Keystroke => "keystroke",
            Modality::Face => "face",
        }
    }
}

impl std::fmt::Display for Modality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Modality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keystroke" => Ok(Modality::Keystroke),
            "face" => Ok(Modality::Face),
            other => Err(format!("unknown modality '{other}'")),
        }
    }
}

/// Result of one modality within an authentication attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModalityResult {
    pub modality: Modality,
    pub accepted: bool,
    pub score: f64,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl ModalityResult {
    pub fn new(modality: Modality, accepted: bool, score: f64) -> Self {
        Self {
            modality,
            accepted,
            score,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Terminal output of a multi-factor attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FusedResult {
    pub accepted: bool,
    /// Reported for observability; the decision is the AND of per-modality verdicts.
    pub fused_score: f64,
    pub method: ScoreRule,
    pub per_modality: Vec<ModalityResult>,
}
