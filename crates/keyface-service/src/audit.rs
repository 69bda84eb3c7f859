//! Security audit trail.
//!
//! Recording is fire-and-forget: a sink never reports failure back to the
//! authentication path. Write errors are logged and dropped.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    KeystrokeEnrollment,
    FaceEnrollment,
    KeystrokeAuthentication,
    FaceAuthentication,
    MfaAuthentication,
    TemplateRemoval,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    pub user_id: String,
    pub success: bool,
    pub details: BTreeMap<String, serde_json::Value>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, user_id: &str, success: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event_type,
            user_id: user_id.to_string(),
            success,
            details: BTreeMap::new(),
        }
    }

    pub fn detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Emits each event as a `tracing` event on target `audit`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAudit;

impl AuditSink for TracingAudit {
    fn record(&self, event: AuditEvent) {
        let details = serde_json::to_string(&event.details).unwrap_or_default();
        tracing::info!(
            target: "audit",
            id = %event.id,
            event_type = ?event.event_type,
            user = %event.user_id,
            success = event.success,
            details = %details,
            "audit event"
        );
    }
}

/// Appends events as JSON lines to daily files `audit_YYYY-MM-DD.log`.
#[derive(Debug)]
pub struct JsonlAuditLog {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlAuditLog {
    pub fn new(dir: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            write_lock: Mutex::new(()),
        })
    }

    fn file_for(&self, timestamp: &DateTime<Utc>) -> PathBuf {
        self.dir
            .join(format!("audit_{}.log", timestamp.format("%Y-%m-%d")))
    }

    fn append(&self, event: &AuditEvent) -> std::io::Result<()> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.file_for(&event.timestamp))?;
        f.write_all(line.as_bytes())
    }

    /// Up to `limit` events for `user_id`, newest first.
    ///
    /// Lines that fail to parse are skipped.
    pub fn user_events(&self, user_id: &str, limit: usize) -> std::io::Result<Vec<AuditEvent>> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("audit_") && n.ends_with(".log"))
            })
            .collect();
        files.sort_unstable_by(|a, b| b.cmp(a));

        let mut events = Vec::new();
        for path in files {
            let file = match std::fs::File::open(&path) {
                Ok(f) => f,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };

            let mut in_file: Vec<AuditEvent> = BufReader::new(file)
                .lines()
                .map_while(Result::ok)
                .filter_map(|line| serde_json::from_str::<AuditEvent>(&line).ok())
                .filter(|event| event.user_id == user_id)
                .collect();
            in_file.reverse();

            for event in in_file {
                if events.len() >= limit {
                    return Ok(events);
                }
                events.push(event);
            }
        }
        Ok(events)
    }
}

impl AuditSink for JsonlAuditLog {
    fn record(&self, event: AuditEvent) {
        if let Err(e) = self.append(&event) {
            tracing::error!(
                dir = %self.dir.display(),
                event_type = ?event.event_type,
                "failed to write audit event: {e}"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("keyface-audit-{tag}-{nanos}"))
    }

    #[test]
    fn test_jsonl_roundtrip() {
        let dir = temp_dir("roundtrip");
        let log = JsonlAuditLog::new(&dir).unwrap();

        let event = AuditEvent::new(AuditEventType::FaceAuthentication, "alice", false)
            .detail("rejection", "liveness_failed")
            .detail("score", 0.0);
        log.record(event.clone());

        let events = log.user_events("alice", 10).unwrap();
        assert_eq!(events, vec![event]);

        let files: Vec<_> = std::fs::read_dir(&dir).unwrap().collect();
        assert_eq!(files.len(), 1);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_user_events_newest_first_with_limit() {
        let dir = temp_dir("limit");
        let log = JsonlAuditLog::new(&dir).unwrap();

        for i in 0..5 {
            log.record(
                AuditEvent::new(AuditEventType::KeystrokeAuthentication, "alice", true)
                    .detail("attempt", i),
            );
        }
        log.record(AuditEvent::new(AuditEventType::FaceEnrollment, "bob", true));

        let events = log.user_events("alice", 3).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].details["attempt"], 4);
        assert_eq!(events[2].details["attempt"], 2);
        assert!(events.iter().all(|e| e.user_id == "alice"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_older_files_read_after_newer() {
        let dir = temp_dir("files");
        let log = JsonlAuditLog::new(&dir).unwrap();

        let mut old = AuditEvent::new(AuditEventType::KeystrokeEnrollment, "alice", true);
        old.timestamp = "2024-01-01T08:00:00Z".parse().unwrap();
        log.record(old.clone());
        let recent = AuditEvent::new(AuditEventType::TemplateRemoval, "alice", true);
        log.record(recent.clone());

        std::fs::write(dir.join("audit_2023-12-31.log"), "not json\n").unwrap();

        let events = log.user_events("alice", 10).unwrap();
        assert_eq!(events, vec![recent, old]);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_event_type_wire_names() {
        let json = serde_json::to_string(&AuditEventType::MfaAuthentication).unwrap();
        assert_eq!(json, "\"mfa_authentication\"");
    }
}
