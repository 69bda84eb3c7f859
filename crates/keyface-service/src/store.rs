use std::collections::BTreeMap;
use std::path::Path;

use keyface_core::Modality;
use rusqlite::OptionalExtension;
use thiserror::Error;
use tokio_rusqlite::Connection;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[error("unknown modality in store: {0}")]
    InvalidModality(String),
}

/// Metadata about a stored template (no template data).
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct TemplateInfo {
    pub modality: Modality,
    pub size_bytes: usize,
    pub updated_at: String,
}

/// Which authentication operation an attempt came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    Keystroke,
    Face,
    Mfa,
}

impl AuthMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthMethod::Keystroke => "keystroke",
            AuthMethod::Face => "face",
            AuthMethod::Mfa => "mfa",
        }
    }
}

/// Aggregate authentication outcomes across all users.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct AuthMetrics {
    pub total_authentications: u64,
    pub successful_authentications: u64,
    pub failed_authentications: u64,
    /// `successful / total`, or 0 before any attempt.
    pub success_rate: f64,
    pub attempts_by_method: BTreeMap<String, u64>,
}

/// SQLite-backed template storage, one row per `(user, modality)`, plus an
/// append-only log of authentication attempts.
///
/// Blobs are opaque: callers encrypt before `save` and decrypt after `load`.
#[derive(Clone)]
pub struct TemplateStore {
    conn: Connection,
}

impl TemplateStore {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if db_path != Path::new(":memory:") {
            if let Some(parent) = db_path.parent() {
                std::fs::create_dir_all(parent).ok();
            }
        }

        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 CREATE TABLE IF NOT EXISTS templates (
                     user TEXT NOT NULL,
                     modality TEXT NOT NULL,
                     blob BLOB NOT NULL,
                     updated_at TEXT NOT NULL,
                     PRIMARY KEY (user, modality)
                 );
                 CREATE TABLE IF NOT EXISTS auth_attempts (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     user TEXT NOT NULL,
                     method TEXT NOT NULL,
                     success INTEGER NOT NULL,
                     attempted_at TEXT NOT NULL
                 );",
            )?;
            Ok(())
        })
        .await?;

        tracing::debug!(path = %db_path.display(), "template store opened");
        Ok(Self { conn })
    }

    /// Insert or replace the template for `(user, modality)`.
    pub async fn save(
        &self,
        user: &str,
        modality: Modality,
        blob: Vec<u8>,
    ) -> Result<(), StoreError> {
        let user = user.to_string();
        let updated_at = chrono::Utc::now().to_rfc3339();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO templates (user, modality, blob, updated_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT (user, modality)
                     DO UPDATE SET blob = excluded.blob, updated_at = excluded.updated_at",
                    rusqlite::params![user, modality.as_str(), blob, updated_at],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn load(&self, user: &str, modality: Modality) -> Result<Option<Vec<u8>>, StoreError> {
        let user = user.to_string();
        self.conn
            .call(move |conn| {
                let blob = conn
                    .query_row(
                        "SELECT blob FROM templates WHERE user = ?1 AND modality = ?2",
                        rusqlite::params![user, modality.as_str()],
                        |row| row.get::<_, Vec<u8>>(0),
                    )
                    .optional()?;
                Ok(blob)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Remove one template. Returns whether a row was deleted.
    pub async fn remove(&self, user: &str, modality: Modality) -> Result<bool, StoreError> {
        let user = user.to_string();
        self.conn
            .call(move |conn| {
                let affected = conn.execute(
                    "DELETE FROM templates WHERE user = ?1 AND modality = ?2",
                    rusqlite::params![user, modality.as_str()],
                )?;
                Ok(affected > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Templates stored for a user, ordered by modality name.
    pub async fn list_for_user(&self, user: &str) -> Result<Vec<TemplateInfo>, StoreError> {
        let user = user.to_string();
        let rows: Vec<(String, usize, String)> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT modality, length(blob), updated_at
                     FROM templates WHERE user = ?1 ORDER BY modality",
                )?;
                let rows = stmt.query_map([&user], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, usize>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;

        rows.into_iter()
            .map(|(modality, size_bytes, updated_at)| {
                Ok(TemplateInfo {
                    modality: parse_modality(&modality)?,
                    size_bytes,
                    updated_at,
                })
            })
            .collect()
    }

    /// Number of stored templates per modality, across all users.
    pub async fn count_by_modality(&self) -> Result<BTreeMap<Modality, u64>, StoreError> {
        let rows: Vec<(String, u64)> = self
            .conn
            .call(|conn| {
                let mut stmt =
                    conn.prepare("SELECT modality, COUNT(*) FROM templates GROUP BY modality")?;
                let rows = stmt.query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;

        rows.into_iter()
            .map(|(modality, count)| Ok((parse_modality(&modality)?, count)))
            .collect()
    }

    /// Append one authentication outcome.
    pub async fn record_attempt(
        &self,
        user: &str,
        method: AuthMethod,
        success: bool,
    ) -> Result<(), StoreError> {
        let user = user.to_string();
        let attempted_at = chrono::Utc::now().to_rfc3339();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO auth_attempts (user, method, success, attempted_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![user, method.as_str(), success, attempted_at],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn attempt_metrics(&self) -> Result<AuthMetrics, StoreError> {
        let rows: Vec<(String, u64, u64)> = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT method, COUNT(*), COALESCE(SUM(success), 0)
                     FROM auth_attempts GROUP BY method",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, u64>(1)?,
                        row.get::<_, u64>(2)?,
                    ))
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;

        let total: u64 = rows.iter().map(|(_, n, _)| n).sum();
        let successful: u64 = rows.iter().map(|(_, _, ok)| ok).sum();
        Ok(AuthMetrics {
            total_authentications: total,
            successful_authentications: successful,
            failed_authentications: total - successful,
            success_rate: if total == 0 {
                0.0
            } else {
                successful as f64 / total as f64
            },
            attempts_by_method: rows.into_iter().map(|(m, n, _)| (m, n)).collect(),
        })
    }
}

fn parse_modality(s: &str) -> Result<Modality, StoreError> {
    s.parse().map_err(|_| StoreError::InvalidModality(s.to_string()))
}
