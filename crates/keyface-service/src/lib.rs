//! keyface-service: authentication service around the biometric core.
//!
//! Owns everything with side effects: the encrypted SQLite template store,
//! the audit trail, configuration, and the face engine thread.

pub mod audit;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod service;
pub mod store;

pub use audit::{AuditEvent, AuditEventType, AuditSink, JsonlAuditLog, TracingAudit};
pub use config::{Config, ConfigError};
pub use crypto::{CryptoError, TemplateCipher};
pub use engine::{spawn_face_engine, EngineError, FaceEngineHandle};
pub use service::{AuthService, EnrollmentStatus};
pub use store::{AuthMethod, AuthMetrics, StoreError, TemplateInfo, TemplateStore};
