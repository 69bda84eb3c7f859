use std::path::{Path, PathBuf};

use keyface_core::face::{DEFAULT_FACE_TOLERANCE, MIN_FACE_SAMPLES};
use keyface_core::keystroke::{DEFAULT_KEYSTROKE_THRESHOLD, MIN_KEYSTROKE_SAMPLES};
use keyface_core::{FaceAuthConfig, FusionWeights, LivenessConfig};
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("config validation error: {0}")]
    Validation(String),
}

/// Service configuration.
///
/// Built from defaults, optionally overlaid with a TOML file, then with
/// `KEYFACE_*` environment variables (highest priority).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the SQLite template database.
    pub db_path: PathBuf,
    /// Template encryption key file (default: `.key` next to the database).
    pub key_path: Option<PathBuf>,
    /// Directory for daily JSONL audit files. Audit goes to tracing only when unset.
    pub audit_dir: Option<PathBuf>,
    /// Z-score distance threshold, scaled by `sqrt(FEATURE_DIM)` at match time.
    pub keystroke_threshold: f64,
    /// Maximum Euclidean distance to the mean face encoding.
    pub face_tolerance: f64,
    pub min_keystroke_samples: usize,
    pub min_face_samples: usize,
    pub liveness_enabled: bool,
    pub liveness: LivenessConfig,
    pub fusion_keystroke_weight: f64,
    pub fusion_face_weight: f64,
    /// Bounded queue depth in front of the face worker thread.
    pub face_queue_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("keyface");

        Self {
            db_path: data_dir.join("templates.db"),
            key_path: None,
            audit_dir: None,
            keystroke_threshold: DEFAULT_KEYSTROKE_THRESHOLD,
            face_tolerance: DEFAULT_FACE_TOLERANCE,
            min_keystroke_samples: MIN_KEYSTROKE_SAMPLES,
            min_face_samples: MIN_FACE_SAMPLES,
            liveness_enabled: true,
            liveness: LivenessConfig::default(),
            fusion_keystroke_weight: 0.4,
            fusion_face_weight: 0.6,
            face_queue_depth: 4,
        }
    }
}

impl Config {
    /// Load configuration from `KEYFACE_*` environment variables with defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply `KEYFACE_*` overrides read through `var`.
    /// Unparseable values are ignored and keep the current setting.
    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("KEYFACE_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = var("KEYFACE_KEY_PATH") {
            self.key_path = Some(PathBuf::from(v));
        }
        if let Some(v) = var("KEYFACE_AUDIT_DIR") {
            self.audit_dir = Some(PathBuf::from(v));
        }
        self.keystroke_threshold =
            env_or(&var, "KEYFACE_KEYSTROKE_THRESHOLD", self.keystroke_threshold);
        self.face_tolerance = env_or(&var, "KEYFACE_FACE_TOLERANCE", self.face_tolerance);
        self.min_keystroke_samples = env_or(
            &var,
            "KEYFACE_MIN_KEYSTROKE_SAMPLES",
            self.min_keystroke_samples,
        );
        self.min_face_samples =
            env_or(&var, "KEYFACE_MIN_FACE_SAMPLES", self.min_face_samples);
        self.liveness_enabled = var("KEYFACE_LIVENESS_ENABLED")
            .map(|v| v != "0")
            .unwrap_or(self.liveness_enabled);
        self.liveness.live_threshold = env_or(
            &var,
            "KEYFACE_LIVENESS_THRESHOLD",
            self.liveness.live_threshold,
        );
        self.liveness.ear_threshold = env_or(
            &var,
            "KEYFACE_LIVENESS_EAR_THRESHOLD",
            self.liveness.ear_threshold,
        );
        self.fusion_keystroke_weight = env_or(
            &var,
            "KEYFACE_FUSION_KEYSTROKE_WEIGHT",
            self.fusion_keystroke_weight,
        );
        self.fusion_face_weight =
            env_or(&var, "KEYFACE_FUSION_FACE_WEIGHT", self.fusion_face_weight);
        self.face_queue_depth =
            env_or(&var, "KEYFACE_FACE_QUEUE_DEPTH", self.face_queue_depth);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.keystroke_threshold > 0.0) {
            return Err(ConfigError::Validation(
                "keystroke_threshold must be positive".to_string(),
            ));
        }
        if !(self.face_tolerance > 0.0) {
            return Err(ConfigError::Validation(
                "face_tolerance must be positive".to_string(),
            ));
        }
        if self.min_keystroke_samples == 0 || self.min_face_samples == 0 {
            return Err(ConfigError::Validation(
                "minimum sample counts must be at least 1".to_string(),
            ));
        }
        if self.fusion_keystroke_weight < 0.0
            || self.fusion_face_weight < 0.0
            || !(self.fusion_keystroke_weight + self.fusion_face_weight > 0.0)
        {
            return Err(ConfigError::Validation(
                "fusion weights must be non-negative with a positive sum".to_string(),
            ));
        }
        if self.face_queue_depth == 0 {
            return Err(ConfigError::Validation(
                "face_queue_depth must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Key file location: explicit `key_path`, else `.key` beside the database.
    pub fn resolved_key_path(&self) -> PathBuf {
        self.key_path.clone().unwrap_or_else(|| {
            self.db_path
                .parent()
                .unwrap_or(Path::new("."))
                .join(".key")
        })
    }

    pub fn face_auth(&self) -> FaceAuthConfig {
        FaceAuthConfig {
            tolerance: self.face_tolerance,
            liveness_enabled: self.liveness_enabled,
            liveness: self.liveness,
        }
    }

    pub fn fusion_weights(&self) -> FusionWeights {
        FusionWeights {
            keystroke: self.fusion_keystroke_weight,
            face: self.fusion_face_weight,
        }
    }
}

fn env_or<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
    current: T,
) -> T {
    var(key).and_then(|v| v.parse().ok()).unwrap_or(current)
}
