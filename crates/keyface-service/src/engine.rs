use image::DynamicImage;
use keyface_core::{
    BiometricError, FaceAuthConfig, FaceAuthenticator, FaceProvider, FaceTemplate, ModalityResult,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::crypto::CryptoError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Biometric(#[from] BiometricError),
    #[error("template store error: {0}")]
    Store(#[from] StoreError),
    #[error("template crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("template serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("no biometric data supplied")]
    NoBiometricData,
    #[error("face authentication is not configured")]
    FaceUnavailable,
    #[error("failed to start face engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("face engine thread exited")]
    ChannelClosed,
}

/// Messages sent from service callers to the face engine thread.
enum EngineRequest {
    Enroll {
        user: String,
        images: Vec<DynamicImage>,
        min_samples: usize,
        reply: oneshot::Sender<Result<FaceTemplate, BiometricError>>,
    },
    Authenticate {
        template: FaceTemplate,
        image: DynamicImage,
        reply: oneshot::Sender<Result<ModalityResult, BiometricError>>,
    },
}

/// Clone-safe handle to the face engine thread.
#[derive(Clone)]
pub struct FaceEngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl FaceEngineHandle {
    /// Extract embeddings from every usable image and fit a template.
    pub async fn enroll(
        &self,
        user: &str,
        images: Vec<DynamicImage>,
        min_samples: usize,
    ) -> Result<FaceTemplate, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Enroll {
                user: user.to_string(),
                images,
                min_samples,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }

    /// Liveness-gated match of one probe image against `template`.
    pub async fn authenticate(
        &self,
        template: FaceTemplate,
        image: DynamicImage,
    ) -> Result<ModalityResult, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Authenticate {
                template,
                image,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }
}

/// Spawn the face engine on a dedicated OS thread.
///
/// The thread owns the provider; liveness analysis and embedding extraction
/// both run there, one request at a time. The thread exits once every
/// handle has been dropped.
pub fn spawn_face_engine(
    provider: Box<dyn FaceProvider>,
    config: FaceAuthConfig,
    queue_depth: usize,
) -> Result<FaceEngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(queue_depth.max(1));
    let authenticator = FaceAuthenticator::new(config);
    let mut provider = provider;

    std::thread::Builder::new()
        .name("keyface-face".into())
        .spawn(move || {
            tracing::info!(
                liveness = authenticator.config().liveness_enabled,
                tolerance = authenticator.config().tolerance,
                "face engine thread started"
            );
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Enroll {
                        user,
                        images,
                        min_samples,
                        reply,
                    } => {
                        let result =
                            run_enroll(&authenticator, &mut provider, &user, &images, min_samples);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Authenticate {
                        template,
                        image,
                        reply,
                    } => {
                        let result = authenticator.authenticate(&mut provider, &template, &image);
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("face engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(FaceEngineHandle { tx })
}

/// Embeddings that fail validation are skipped like images without a face;
/// only the final count is held against `min_samples`.
fn run_enroll(
    authenticator: &FaceAuthenticator,
    provider: &mut Box<dyn FaceProvider>,
    user: &str,
    images: &[DynamicImage],
    min_samples: usize,
) -> Result<FaceTemplate, BiometricError> {
    let batch = authenticator.collect_embeddings(provider, images)?;

    let mut template = FaceTemplate::new(user);
    for (i, embedding) in batch.embeddings.into_iter().enumerate() {
        if let Err(e) = template.add_embedding(embedding) {
            tracing::warn!(user, embedding = i, "enroll: discarding embedding: {e}");
        }
    }
    template.fit(min_samples)?;

    tracing::info!(
        user,
        samples = template.sample_count(),
        skipped_images = batch.skipped.len(),
        "face template fitted"
    );
    Ok(template)
}
