//! Authentication service: enrollment and verification for both modalities.
//!
//! Every operation for a given user runs inside that user's critical
//! section. The template is fetched, decrypted and used (or rebuilt and
//! saved) while the section is held, so an authentication never observes a
//! half-written re-enrollment. Operations for different users share no lock
//! beyond the brief lookup in the lock table.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use image::DynamicImage;
use keyface_core::fusion::fuse_modalities;
use keyface_core::keystroke::{extract_features, KeystrokeTemplateRecord};
use keyface_core::face::FaceTemplateRecord;
use keyface_core::{
    BiometricError, FaceProvider, FaceTemplate, FusedResult, FusionWeights, KeystrokeEvent,
    KeystrokeTemplate, Modality, ModalityResult, ScoreRule,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::audit::{AuditEvent, AuditEventType, AuditSink, JsonlAuditLog, TracingAudit};
use crate::config::Config;
use crate::crypto::TemplateCipher;
use crate::engine::{spawn_face_engine, EngineError, FaceEngineHandle};
use crate::store::{AuthMethod, AuthMetrics, TemplateInfo, TemplateStore};

/// Lock table size above which idle entries are pruned.
const LOCK_TABLE_PRUNE_AT: usize = 1024;

/// Which templates a user has on file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrollmentStatus {
    pub user_id: String,
    pub keystroke_enrolled: bool,
    pub face_enrolled: bool,
    /// Both modalities enrolled, so multi-factor authentication is possible.
    pub mfa_enabled: bool,
    pub templates: Vec<TemplateInfo>,
}

#[derive(Debug, Clone, Copy)]
struct Policy {
    keystroke_threshold: f64,
    min_keystroke_samples: usize,
    min_face_samples: usize,
    weights: FusionWeights,
}

struct Inner {
    store: TemplateStore,
    cipher: TemplateCipher,
    audit: Arc<dyn AuditSink>,
    face: Option<FaceEngineHandle>,
    policy: Policy,
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// Clone-safe handle to the authentication service.
#[derive(Clone)]
pub struct AuthService {
    inner: Arc<Inner>,
}

impl AuthService {
    /// Assemble a service from already-built collaborators.
    ///
    /// Without a face engine, face operations fail with
    /// [`EngineError::FaceUnavailable`].
    pub fn new(
        store: TemplateStore,
        cipher: TemplateCipher,
        audit: Arc<dyn AuditSink>,
        face: Option<FaceEngineHandle>,
        config: &Config,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                cipher,
                audit,
                face,
                policy: Policy {
                    keystroke_threshold: config.keystroke_threshold,
                    min_keystroke_samples: config.min_keystroke_samples,
                    min_face_samples: config.min_face_samples,
                    weights: config.fusion_weights(),
                },
                locks: std::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Open the store, load the key, pick the audit sink and, when a
    /// provider is given, start the face engine, all as configured.
    pub async fn open(
        config: &Config,
        provider: Option<Box<dyn FaceProvider>>,
    ) -> Result<Self, EngineError> {
        let store = TemplateStore::open(&config.db_path).await?;
        let cipher = if config.db_path == Path::new(":memory:") {
            TemplateCipher::ephemeral()
        } else {
            TemplateCipher::from_key_file(&config.resolved_key_path())?
        };

        let audit: Arc<dyn AuditSink> = match &config.audit_dir {
            Some(dir) => match JsonlAuditLog::new(dir) {
                Ok(log) => Arc::new(log),
                Err(e) => {
                    tracing::error!(dir = %dir.display(), "audit directory unusable, using tracing: {e}");
                    Arc::new(TracingAudit)
                }
            },
            None => Arc::new(TracingAudit),
        };

        let face = match provider {
            Some(p) => Some(spawn_face_engine(
                p,
                config.face_auth(),
                config.face_queue_depth,
            )?),
            None => None,
        };

        tracing::info!(
            db = %config.db_path.display(),
            face = face.is_some(),
            "authentication service ready"
        );
        Ok(Self::new(store, cipher, audit, face, config))
    }

    // ── Keystroke ─────────────────────────────────────────────────────────────

    /// Build a template from typing sessions. Sessions that fail extraction
    /// are skipped; enrollment fails if fewer than the minimum remain.
    pub async fn enroll_keystroke(
        &self,
        user: &str,
        sessions: &[Vec<KeystrokeEvent>],
    ) -> Result<KeystrokeTemplate, EngineError> {
        let lock = self.user_lock(user);
        let _guard = lock.lock().await;

        let result = self.enroll_keystroke_locked(user, sessions).await;
        let event = AuditEvent::new(AuditEventType::KeystrokeEnrollment, user, result.is_ok())
            .detail("sessions", sessions.len());
        self.audit(match &result {
            Ok(t) => event.detail("num_samples", t.sample_count()),
            Err(e) => event.detail("error", e.to_string()),
        })
        .await;
        result
    }

    async fn enroll_keystroke_locked(
        &self,
        user: &str,
        sessions: &[Vec<KeystrokeEvent>],
    ) -> Result<KeystrokeTemplate, EngineError> {
        let mut template = KeystrokeTemplate::new(user);
        for (i, session) in sessions.iter().enumerate() {
            match extract_features(session) {
                Ok(features) => template.add_sample(features),
                Err(e) => tracing::warn!(user, session = i, "enroll: skipping session: {e}"),
            }
        }
        template.fit(self.inner.policy.min_keystroke_samples)?;

        self.save_record(user, Modality::Keystroke, &template.to_record())
            .await?;
        tracing::info!(
            user,
            samples = template.sample_count(),
            "keystroke template enrolled"
        );
        Ok(template)
    }

    pub async fn authenticate_keystroke(
        &self,
        user: &str,
        events: &[KeystrokeEvent],
    ) -> Result<ModalityResult, EngineError> {
        let lock = self.user_lock(user);
        let _guard = lock.lock().await;

        let result = self.authenticate_keystroke_locked(user, events).await;
        self.record_attempt(user, AuthMethod::Keystroke, accepted(&result))
            .await;
        self.audit(outcome_event(
            AuditEventType::KeystrokeAuthentication,
            user,
            &result,
        ))
        .await;
        result
    }

    async fn authenticate_keystroke_locked(
        &self,
        user: &str,
        events: &[KeystrokeEvent],
    ) -> Result<ModalityResult, EngineError> {
        let record: KeystrokeTemplateRecord = self
            .load_record(user, Modality::Keystroke)
            .await?
            .ok_or(BiometricError::NotEnrolled)?;
        let template = KeystrokeTemplate::from_record(record)?;

        let features = extract_features(events)?;
        let threshold = self.inner.policy.keystroke_threshold;
        let verdict = template.verify(&features, threshold)?;

        tracing::debug!(user, accepted = verdict.accepted, "keystroke verified");
        Ok(
            ModalityResult::new(Modality::Keystroke, verdict.accepted, verdict.similarity)
                .with_meta("distance", verdict.distance)
                .with_meta("threshold", threshold),
        )
    }

    // ── Face ──────────────────────────────────────────────────────────────────

    /// Build a template from enrollment images. Images without a usable face
    /// are skipped; enrollment fails if fewer than the minimum remain.
    pub async fn enroll_face(
        &self,
        user: &str,
        images: Vec<DynamicImage>,
    ) -> Result<FaceTemplate, EngineError> {
        let lock = self.user_lock(user);
        let _guard = lock.lock().await;

        let submitted = images.len();
        let result = self.enroll_face_locked(user, images).await;
        let event = AuditEvent::new(AuditEventType::FaceEnrollment, user, result.is_ok())
            .detail("images", submitted);
        self.audit(match &result {
            Ok(t) => event.detail("num_samples", t.sample_count()),
            Err(e) => event.detail("error", e.to_string()),
        })
        .await;
        result
    }

    async fn enroll_face_locked(
        &self,
        user: &str,
        images: Vec<DynamicImage>,
    ) -> Result<FaceTemplate, EngineError> {
        let engine = self.face_engine()?;
        let template = engine
            .enroll(user, images, self.inner.policy.min_face_samples)
            .await?;

        self.save_record(user, Modality::Face, &template.to_record())
            .await?;
        tracing::info!(
            user,
            samples = template.sample_count(),
            "face template enrolled"
        );
        Ok(template)
    }

    pub async fn authenticate_face(
        &self,
        user: &str,
        image: DynamicImage,
    ) -> Result<ModalityResult, EngineError> {
        let lock = self.user_lock(user);
        let _guard = lock.lock().await;

        let result = self.authenticate_face_locked(user, image).await;
        self.record_attempt(user, AuthMethod::Face, accepted(&result))
            .await;
        self.audit(outcome_event(
            AuditEventType::FaceAuthentication,
            user,
            &result,
        ))
        .await;
        result
    }

    async fn authenticate_face_locked(
        &self,
        user: &str,
        image: DynamicImage,
    ) -> Result<ModalityResult, EngineError> {
        let engine = self.face_engine()?;
        let record: FaceTemplateRecord = self
            .load_record(user, Modality::Face)
            .await?
            .ok_or(BiometricError::NotEnrolled)?;
        let template = FaceTemplate::from_record(record)?;

        engine.authenticate(template, image).await
    }

    // ── Multi-factor ──────────────────────────────────────────────────────────

    /// Authenticate with every supplied modality and fuse the results.
    ///
    /// A supplied modality with no enrolled template fails the whole call
    /// with `NotEnrolled`. The decision is the AND of the per-modality
    /// verdicts; `rule` only shapes the reported fused score.
    pub async fn authenticate_mfa(
        &self,
        user: &str,
        events: Option<&[KeystrokeEvent]>,
        image: Option<DynamicImage>,
        rule: ScoreRule,
    ) -> Result<FusedResult, EngineError> {
        if events.is_none() && image.is_none() {
            self.record_attempt(user, AuthMethod::Mfa, false).await;
            self.audit(
                AuditEvent::new(AuditEventType::MfaAuthentication, user, false)
                    .detail("error", EngineError::NoBiometricData.to_string()),
            )
            .await;
            return Err(EngineError::NoBiometricData);
        }

        let lock = self.user_lock(user);
        let _guard = lock.lock().await;

        let result = self.authenticate_mfa_locked(user, events, image, rule).await;
        let success = matches!(&result, Ok(r) if r.accepted);
        self.record_attempt(user, AuthMethod::Mfa, success).await;
        let event = AuditEvent::new(AuditEventType::MfaAuthentication, user, success)
            .detail("method", serde_json::to_value(rule).unwrap_or_default());
        self.audit(match &result {
            Ok(r) => event
                .detail("fused_score", r.fused_score)
                .detail(
                    "modalities",
                    r.per_modality
                        .iter()
                        .map(|m| m.modality.as_str())
                        .collect::<Vec<_>>(),
                ),
            Err(e) => event.detail("error", e.to_string()),
        })
        .await;
        result
    }

    async fn authenticate_mfa_locked(
        &self,
        user: &str,
        events: Option<&[KeystrokeEvent]>,
        image: Option<DynamicImage>,
        rule: ScoreRule,
    ) -> Result<FusedResult, EngineError> {
        let mut results = Vec::with_capacity(2);
        if let Some(events) = events {
            results.push(self.authenticate_keystroke_locked(user, events).await?);
        }
        if let Some(image) = image {
            results.push(self.authenticate_face_locked(user, image).await?);
        }

        let fused = fuse_modalities(results, rule, &self.inner.policy.weights)?;
        tracing::info!(
            user,
            accepted = fused.accepted,
            fused_score = fused.fused_score,
            "multi-factor authentication"
        );
        Ok(fused)
    }

    // ── Administration ────────────────────────────────────────────────────────

    /// Delete one template. Returns whether anything was removed.
    pub async fn remove_template(&self, user: &str, modality: Modality) -> Result<bool, EngineError> {
        let lock = self.user_lock(user);
        let _guard = lock.lock().await;

        let result = self.inner.store.remove(user, modality).await;
        let event = AuditEvent::new(AuditEventType::TemplateRemoval, user, result.is_ok())
            .detail("modality", modality.as_str());
        self.audit(match &result {
            Ok(removed) => event.detail("removed", *removed),
            Err(e) => event.detail("error", e.to_string()),
        })
        .await;
        Ok(result?)
    }

    pub async fn enrollment_status(&self, user: &str) -> Result<EnrollmentStatus, EngineError> {
        let templates = self.inner.store.list_for_user(user).await?;
        let has = |m: Modality| templates.iter().any(|t| t.modality == m);
        let (keystroke_enrolled, face_enrolled) = (has(Modality::Keystroke), has(Modality::Face));
        Ok(EnrollmentStatus {
            user_id: user.to_string(),
            keystroke_enrolled,
            face_enrolled,
            mfa_enabled: keystroke_enrolled && face_enrolled,
            templates,
        })
    }

    /// Authentication attempt totals and success rate across all users.
    pub async fn system_metrics(&self) -> Result<AuthMetrics, EngineError> {
        Ok(self.inner.store.attempt_metrics().await?)
    }

    /// Stored template counts per modality, across all users.
    pub async fn template_counts(&self) -> Result<BTreeMap<Modality, u64>, EngineError> {
        Ok(self.inner.store.count_by_modality().await?)
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn face_engine(&self) -> Result<&FaceEngineHandle, EngineError> {
        self.inner.face.as_ref().ok_or(EngineError::FaceUnavailable)
    }

    fn user_lock(&self, user: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .inner
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if locks.len() >= LOCK_TABLE_PRUNE_AT {
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        locks
            .entry(user.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn save_record<T: Serialize>(
        &self,
        user: &str,
        modality: Modality,
        record: &T,
    ) -> Result<(), EngineError> {
        let plaintext = serde_json::to_vec(record)?;
        let blob = self.inner.cipher.encrypt(&plaintext)?;
        self.inner
            .store
            .save(user, modality, blob)
            .await
            .map_err(|e| {
                tracing::error!(user, modality = %modality, "failed to save template: {e}");
                EngineError::from(e)
            })
    }

    async fn load_record<T: DeserializeOwned>(
        &self,
        user: &str,
        modality: Modality,
    ) -> Result<Option<T>, EngineError> {
        let Some(blob) = self.inner.store.load(user, modality).await? else {
            return Ok(None);
        };
        let plaintext = self.inner.cipher.decrypt(&blob)?;
        Ok(Some(serde_json::from_slice(&plaintext)?))
    }

    /// Failing to record an attempt never fails the authentication.
    async fn record_attempt(&self, user: &str, method: AuthMethod, success: bool) {
        if let Err(e) = self.inner.store.record_attempt(user, method, success).await {
            tracing::error!(user, method = method.as_str(), "failed to record attempt: {e}");
        }
    }

    /// Sinks may block on file I/O, so recording runs on the blocking pool.
    async fn audit(&self, event: AuditEvent) {
        let sink = Arc::clone(&self.inner.audit);
        if let Err(e) = tokio::task::spawn_blocking(move || sink.record(event)).await {
            tracing::error!("audit sink task failed: {e}");
        }
    }
}

fn accepted(result: &Result<ModalityResult, EngineError>) -> bool {
    matches!(result, Ok(r) if r.accepted)
}

fn outcome_event(
    event_type: AuditEventType,
    user: &str,
    result: &Result<ModalityResult, EngineError>,
) -> AuditEvent {
    match result {
        Ok(r) => {
            let mut event = AuditEvent::new(event_type, user, r.accepted).detail("score", r.score);
            if let Some(reason) = r.metadata.get("rejection") {
                event = event.detail("rejection", reason.clone());
            }
            event
        }
        Err(e) => AuditEvent::new(event_type, user, false).detail("error", e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use keyface_core::types::EMBEDDING_DIM;
    use keyface_core::{BoundingBox, FaceEmbedding, FaceLandmarks, ProviderError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct MemoryAudit {
        events: std::sync::Mutex<Vec<AuditEvent>>,
    }

    impl MemoryAudit {
        fn events(&self) -> Vec<AuditEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl AuditSink for MemoryAudit {
        fn record(&self, event: AuditEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    /// Provider that derives everything from pixel data. Images narrower
    /// than 8 px contain no face; the embedding encodes the top-left pixel.
    struct PixelProvider {
        encode_calls: Arc<AtomicUsize>,
    }

    impl FaceProvider for PixelProvider {
        fn detect_faces(&mut self, image: &DynamicImage) -> Result<Vec<BoundingBox>, ProviderError> {
            if image.width() < 8 {
                return Ok(vec![]);
            }
            Ok(vec![BoundingBox::new(0, image.width(), image.height(), 0)])
        }

        fn extract_landmarks(
            &mut self,
            _image: &DynamicImage,
            faces: &[BoundingBox],
        ) -> Result<Vec<FaceLandmarks>, ProviderError> {
            Ok(vec![FaceLandmarks::default(); faces.len()])
        }

        fn extract_encoding(
            &mut self,
            image: &DynamicImage,
            _face: Option<&BoundingBox>,
        ) -> Result<FaceEmbedding, ProviderError> {
            self.encode_calls.fetch_add(1, Ordering::SeqCst);
            if image.width() < 8 {
                return Err(ProviderError::NoFace);
            }
            let level = f64::from(image.to_luma8().get_pixel(0, 0).0[0]) / 255.0;
            Ok(FaceEmbedding::new(vec![level; EMBEDDING_DIM]))
        }
    }

    /// High-contrast checkerboard; `dark` selects the identity.
    fn person(dark: u8) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(32, 32, |x, y| {
            let v = if (x + y) % 2 == 0 { dark } else { 230 };
            Rgb([v, v, v])
        }))
    }

    fn photo_of_photo() -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(32, 32, Rgb([20, 20, 20])))
    }

    fn no_face() -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, Rgb([20, 20, 20])))
    }

    fn session(k: usize) -> Vec<KeystrokeEvent> {
        "password"
            .chars()
            .enumerate()
            .map(|(i, c)| {
                let press = i as f64 * 0.25 + 0.01 * ((i * k) % 3) as f64;
                let dwell = 0.1 + 0.005 * ((i + k) % 4) as f64;
                KeystrokeEvent::new(&c.to_string(), press, press + dwell)
            })
            .collect()
    }

    fn impostor_session() -> Vec<KeystrokeEvent> {
        "password"
            .chars()
            .enumerate()
            .map(|(i, c)| {
                let press = i as f64 * 0.6;
                KeystrokeEvent::new(&c.to_string(), press, press + 0.3)
            })
            .collect()
    }

    struct Harness {
        service: AuthService,
        audit: Arc<MemoryAudit>,
        encode_calls: Arc<AtomicUsize>,
        store: TemplateStore,
    }

    async fn harness() -> Harness {
        let config = Config {
            db_path: ":memory:".into(),
            ..Config::default()
        };
        let store = TemplateStore::open(Path::new(":memory:")).await.unwrap();
        let audit = Arc::new(MemoryAudit::default());
        let encode_calls = Arc::new(AtomicUsize::new(0));
        let face = spawn_face_engine(
            Box::new(PixelProvider {
                encode_calls: encode_calls.clone(),
            }),
            config.face_auth(),
            config.face_queue_depth,
        )
        .unwrap();
        let service = AuthService::new(
            store.clone(),
            TemplateCipher::ephemeral(),
            audit.clone(),
            Some(face),
            &config,
        );
        Harness {
            service,
            audit,
            encode_calls,
            store,
        }
    }

    fn sessions(n: usize) -> Vec<Vec<KeystrokeEvent>> {
        (0..n).map(session).collect()
    }

    #[tokio::test]
    async fn test_keystroke_enroll_needs_five_sessions() {
        let h = harness().await;

        let err = h
            .service
            .enroll_keystroke("alice", &sessions(4))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Biometric(BiometricError::InsufficientSamples {
                required: 5,
                got: 4
            })
        ));

        let template = h
            .service
            .enroll_keystroke("alice", &sessions(5))
            .await
            .unwrap();
        assert_eq!(template.sample_count(), 5);
    }

    #[tokio::test]
    async fn test_keystroke_invalid_sessions_skipped() {
        let h = harness().await;

        let mut input = sessions(5);
        input.push(vec![KeystrokeEvent::new("a", 0.0, 0.1)]);
        input.push(vec![
            KeystrokeEvent::new("a", 0.0, 0.1),
            KeystrokeEvent::new("b", 0.5, 0.2),
        ]);

        let template = h.service.enroll_keystroke("alice", &input).await.unwrap();
        assert_eq!(template.sample_count(), 5);
    }

    #[tokio::test]
    async fn test_keystroke_genuine_and_impostor() {
        let h = harness().await;
        h.service
            .enroll_keystroke("alice", &sessions(6))
            .await
            .unwrap();

        let genuine = h
            .service
            .authenticate_keystroke("alice", &session(2))
            .await
            .unwrap();
        assert!(genuine.accepted);
        assert_eq!(genuine.modality, Modality::Keystroke);
        assert!(genuine.score > 0.0 && genuine.score <= 1.0);

        let impostor = h
            .service
            .authenticate_keystroke("alice", &impostor_session())
            .await
            .unwrap();
        assert!(!impostor.accepted);
        assert!(impostor.score < genuine.score);
    }

    #[tokio::test]
    async fn test_not_enrolled() {
        let h = harness().await;
        let err = h
            .service
            .authenticate_keystroke("nobody", &session(0))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Biometric(BiometricError::NotEnrolled)
        ));

        let err = h
            .service
            .authenticate_face("nobody", person(20))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Biometric(BiometricError::NotEnrolled)
        ));
    }

    #[tokio::test]
    async fn test_face_enroll_skips_images_without_face() {
        let h = harness().await;

        let template = h
            .service
            .enroll_face("alice", vec![person(20), no_face(), person(20), person(20)])
            .await
            .unwrap();
        assert_eq!(template.sample_count(), 3);

        let err = h
            .service
            .enroll_face("bob", vec![person(60), no_face(), person(60)])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Biometric(BiometricError::InsufficientSamples {
                required: 3,
                got: 2
            })
        ));
    }

    #[tokio::test]
    async fn test_face_genuine_impostor_and_spoof() {
        let h = harness().await;
        h.service
            .enroll_face("alice", vec![person(20), person(20), person(20)])
            .await
            .unwrap();

        let genuine = h.service.authenticate_face("alice", person(20)).await.unwrap();
        assert!(genuine.accepted);
        assert!((genuine.score - 1.0).abs() < 1e-9);

        let impostor = h.service.authenticate_face("alice", person(60)).await.unwrap();
        assert!(!impostor.accepted);

        let before = h.encode_calls.load(Ordering::SeqCst);
        let spoof = h
            .service
            .authenticate_face("alice", photo_of_photo())
            .await
            .unwrap();
        assert!(!spoof.accepted);
        assert_eq!(spoof.score, 0.0);
        assert_eq!(spoof.metadata["rejection"], "liveness_failed");
        assert_eq!(h.encode_calls.load(Ordering::SeqCst), before);

        let err = h.service.authenticate_face("alice", no_face()).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Biometric(BiometricError::NoFaceDetected)
        ));
    }

    #[tokio::test]
    async fn test_mfa_fuses_both_modalities() {
        let h = harness().await;
        h.service
            .enroll_keystroke("alice", &sessions(5))
            .await
            .unwrap();
        h.service
            .enroll_face("alice", vec![person(20), person(20), person(20)])
            .await
            .unwrap();

        let probe = session(1);
        let fused = h
            .service
            .authenticate_mfa("alice", Some(&probe), Some(person(20)), ScoreRule::WeightedSum)
            .await
            .unwrap();
        assert!(fused.accepted);
        assert_eq!(fused.per_modality.len(), 2);
        let (ks, face) = (fused.per_modality[0].score, fused.per_modality[1].score);
        assert!((fused.fused_score - (0.4 * ks + 0.6 * face)).abs() < 1e-12);

        // One modality rejecting fails the attempt.
        let impostor = impostor_session();
        let fused = h
            .service
            .authenticate_mfa("alice", Some(&impostor), Some(person(20)), ScoreRule::Max)
            .await
            .unwrap();
        assert!(!fused.accepted);
        assert_eq!(fused.fused_score, fused.per_modality[1].score);
    }

    #[tokio::test]
    async fn test_mfa_input_errors() {
        let h = harness().await;
        h.service
            .enroll_keystroke("alice", &sessions(5))
            .await
            .unwrap();

        let err = h
            .service
            .authenticate_mfa("alice", None, None, ScoreRule::Mean)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NoBiometricData));

        // Face supplied but never enrolled.
        let probe = session(0);
        let err = h
            .service
            .authenticate_mfa("alice", Some(&probe), Some(person(20)), ScoreRule::Mean)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Biometric(BiometricError::NotEnrolled)
        ));
    }

    #[tokio::test]
    async fn test_templates_are_encrypted_at_rest() {
        let h = harness().await;
        h.service
            .enroll_keystroke("alice", &sessions(5))
            .await
            .unwrap();

        let blob = h
            .store
            .load("alice", Modality::Keystroke)
            .await
            .unwrap()
            .unwrap();
        assert!(!blob.windows(5).any(|w| w == b"alice"));
        assert!(TemplateCipher::new([9u8; 32]).decrypt(&blob).is_err());

        let plaintext = TemplateCipher::ephemeral().decrypt(&blob).unwrap();
        let record: KeystrokeTemplateRecord = serde_json::from_slice(&plaintext).unwrap();
        assert_eq!(record.user_id, "alice");
        assert_eq!(record.num_samples, 5);
    }

    #[tokio::test]
    async fn test_template_survives_service_restart() {
        let h = harness().await;
        h.service
            .enroll_keystroke("alice", &sessions(5))
            .await
            .unwrap();
        let before = h
            .service
            .authenticate_keystroke("alice", &session(3))
            .await
            .unwrap();

        let config = Config {
            db_path: ":memory:".into(),
            ..Config::default()
        };
        let restarted = AuthService::new(
            h.store.clone(),
            TemplateCipher::ephemeral(),
            Arc::new(TracingAudit),
            None,
            &config,
        );
        let after = restarted
            .authenticate_keystroke("alice", &session(3))
            .await
            .unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_face_unavailable_without_engine() {
        let config = Config {
            db_path: ":memory:".into(),
            ..Config::default()
        };
        let service = AuthService::open(&config, None).await.unwrap();
        let err = service
            .enroll_face("alice", vec![person(20)])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::FaceUnavailable));
    }

    #[tokio::test]
    async fn test_remove_and_status() {
        let h = harness().await;
        h.service
            .enroll_keystroke("alice", &sessions(5))
            .await
            .unwrap();

        let status = h.service.enrollment_status("alice").await.unwrap();
        assert!(status.keystroke_enrolled);
        assert!(!status.face_enrolled);
        assert!(!status.mfa_enabled);

        h.service
            .enroll_face("alice", vec![person(20), person(20), person(20)])
            .await
            .unwrap();
        let status = h.service.enrollment_status("alice").await.unwrap();
        assert!(status.mfa_enabled);
        assert!(h
            .service
            .remove_template("alice", Modality::Face)
            .await
            .unwrap());

        assert!(h
            .service
            .remove_template("alice", Modality::Keystroke)
            .await
            .unwrap());
        assert!(!h
            .service
            .remove_template("alice", Modality::Keystroke)
            .await
            .unwrap());

        let status = h.service.enrollment_status("alice").await.unwrap();
        assert!(!status.keystroke_enrolled);
        assert!(h.service.template_counts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_every_operation_is_audited() {
        let h = harness().await;
        let _ = h.service.enroll_keystroke("alice", &sessions(3)).await;
        h.service
            .enroll_keystroke("alice", &sessions(5))
            .await
            .unwrap();
        h.service
            .authenticate_keystroke("alice", &session(0))
            .await
            .unwrap();
        let _ = h.service.authenticate_mfa("alice", None, None, ScoreRule::Mean).await;

        let events = h.audit.events();
        let kinds: Vec<_> = events.iter().map(|e| (e.event_type, e.success)).collect();
        assert_eq!(
            kinds,
            vec![
                (AuditEventType::KeystrokeEnrollment, false),
                (AuditEventType::KeystrokeEnrollment, true),
                (AuditEventType::KeystrokeAuthentication, true),
                (AuditEventType::MfaAuthentication, false),
            ]
        );
        assert!(events[0].details.contains_key("error"));
        assert!(events.iter().all(|e| e.user_id == "alice"));
    }

    #[tokio::test]
    async fn test_same_user_serialized_other_users_parallel() {
        let h = harness().await;

        let lock = h.service.user_lock("alice");
        let guard = lock.lock().await;

        let service = h.service.clone();
        let blocked = tokio::spawn(async move {
            service.remove_template("alice", Modality::Face).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        // A different user is not held up by alice's critical section.
        tokio::time::timeout(
            Duration::from_secs(1),
            h.service.remove_template("bob", Modality::Face),
        )
        .await
        .unwrap()
        .unwrap();

        drop(guard);
        assert!(!blocked.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_attempts_counted_in_system_metrics() {
        let h = harness().await;
        h.service
            .enroll_keystroke("alice", &sessions(6))
            .await
            .unwrap();

        let genuine = h
            .service
            .authenticate_keystroke("alice", &session(2))
            .await
            .unwrap();
        assert!(genuine.accepted);
        let impostor = h
            .service
            .authenticate_keystroke("alice", &impostor_session())
            .await
            .unwrap();
        assert!(!impostor.accepted);
        assert!(h
            .service
            .authenticate_face("nobody", person(20))
            .await
            .is_err());
        let _ = h.service.authenticate_mfa("alice", None, None, ScoreRule::Mean).await;

        let metrics = h.service.system_metrics().await.unwrap();
        assert_eq!(metrics.total_authentications, 4);
        assert_eq!(metrics.successful_authentications, 1);
        assert_eq!(metrics.failed_authentications, 3);
        assert_eq!(metrics.success_rate, 0.25);
        assert_eq!(metrics.attempts_by_method["keystroke"], 2);
        assert_eq!(metrics.attempts_by_method["face"], 1);
        assert_eq!(metrics.attempts_by_method["mfa"], 1);

        // Enrollment is not an authentication attempt.
        assert_eq!(h.store.attempt_metrics().await.unwrap(), metrics);
    }

    #[tokio::test]
    async fn test_jsonl_audit_through_service() {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("keyface-service-audit-{nanos}"));
        let config = Config {
            db_path: ":memory:".into(),
            audit_dir: Some(dir.clone()),
            ..Config::default()
        };
        let service = AuthService::open(&config, None).await.unwrap();
        service
            .enroll_keystroke("alice", &sessions(5))
            .await
            .unwrap();
        service
            .authenticate_keystroke("alice", &session(2))
            .await
            .unwrap();

        let events = JsonlAuditLog::new(&dir)
            .unwrap()
            .user_events("alice", 10)
            .unwrap();
        let kinds: Vec<_> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(
            kinds,
            vec![
                AuditEventType::KeystrokeAuthentication,
                AuditEventType::KeystrokeEnrollment,
            ]
        );

        std::fs::remove_dir_all(&dir).ok();
    }
}
