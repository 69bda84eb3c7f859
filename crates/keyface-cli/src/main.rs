use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use keyface_core::metrics::evaluate_system;
use keyface_core::{KeystrokeEvent, Modality};
use keyface_service::{AuthService, Config, JsonlAuditLog};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "keyface", version, about = "Keystroke and face biometric verification")]
struct Cli {
    /// TOML configuration file; `KEYFACE_*` environment variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a keystroke template from a JSON array of typing sessions.
    EnrollKeystroke {
        #[arg(long)]
        user: String,
        #[arg(long)]
        sessions: PathBuf,
    },
    /// Verify one typing session (JSON array of keystroke events).
    VerifyKeystroke {
        #[arg(long)]
        user: String,
        #[arg(long)]
        events: PathBuf,
    },
    /// FAR/FRR/EER evaluation of labeled scores (`{"labels": [...], "scores": [...]}`).
    Evaluate {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        threshold: Option<f64>,
    },
    /// Enrollment status for one user, or template counts for the whole store.
    Status {
        #[arg(long)]
        user: Option<String>,
    },
    /// Authentication attempt totals and success rate.
    Metrics,
    /// Delete a stored template.
    Remove {
        #[arg(long)]
        user: String,
        #[arg(long)]
        modality: Modality,
    },
    /// Recent audit events for a user, newest first.
    Audit {
        #[arg(long)]
        user: String,
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
}

#[derive(Deserialize)]
struct LabeledScores {
    labels: Vec<u8>,
    scores: Vec<f64>,
}

#[derive(Serialize)]
struct EnrollmentSummary<'a> {
    user_id: &'a str,
    modality: Modality,
    num_samples: usize,
    created_at: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => Config::from_env().context("invalid KEYFACE_* environment")?,
    };

    match cli.cmd {
        Commands::EnrollKeystroke { user, sessions } => {
            let sessions: Vec<Vec<KeystrokeEvent>> = read_json(&sessions)?;
            let service = AuthService::open(&config, None).await?;
            let template = service.enroll_keystroke(&user, &sessions).await?;
            print_json(&EnrollmentSummary {
                user_id: template.user_id(),
                modality: Modality::Keystroke,
                num_samples: template.sample_count(),
                created_at: template.created_at().to_rfc3339(),
            })?;
        }
        Commands::VerifyKeystroke { user, events } => {
            let events: Vec<KeystrokeEvent> = read_json(&events)?;
            let service = AuthService::open(&config, None).await?;
            let result = service.authenticate_keystroke(&user, &events).await?;
            print_json(&result)?;
        }
        Commands::Evaluate { input, threshold } => {
            let data: LabeledScores = read_json(&input)?;
            let evaluation = evaluate_system(&data.labels, &data.scores, threshold)?;
            print_json(&evaluation)?;
        }
        Commands::Status { user } => {
            let service = AuthService::open(&config, None).await?;
            match user {
                Some(user) => print_json(&service.enrollment_status(&user).await?)?,
                None => print_json(&service.template_counts().await?)?,
            }
        }
        Commands::Metrics => {
            let service = AuthService::open(&config, None).await?;
            print_json(&service.system_metrics().await?)?;
        }
        Commands::Remove { user, modality } => {
            let service = AuthService::open(&config, None).await?;
            let removed = service.remove_template(&user, modality).await?;
            if !removed {
                tracing::warn!(user, modality = %modality, "no template to remove");
            }
            print_json(&serde_json::json!({ "removed": removed }))?;
        }
        Commands::Audit { user, limit } => {
            let Some(dir) = &config.audit_dir else {
                bail!("audit_dir is not configured (set KEYFACE_AUDIT_DIR)");
            };
            let log = JsonlAuditLog::new(dir)
                .with_context(|| format!("failed to open audit dir {}", dir.display()))?;
            let events =
                tokio::task::spawn_blocking(move || log.user_events(&user, limit)).await??;
            print_json(&events)?;
        }
    }

    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("invalid JSON in {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
