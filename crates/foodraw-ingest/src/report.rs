use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::info;
use uuid::Uuid;

use crate::{IngestRunSummary, RunOutcome, RunState};

pub const RUN_REPORT_FILE: &str = "ingest_run.json";
pub const CHECKPOINT_FILE: &str = "checkpoint.json";

/// Latest terminal run, used by `ingest --resume`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: Uuid,
    pub status: RunState,
    pub resume_offset: u64,
    pub page_size: u32,
    /// Item offset just past the run's window (`start_offset + limit`).
    #[serde(default)]
    pub end_offset: Option<u64>,
    pub finished_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn from_summary(summary: &IngestRunSummary) -> Self {
        let resume_offset = match &summary.outcome {
            RunOutcome::Failed { resume_offset, .. } => *resume_offset,
            RunOutcome::Done { .. } => 0,
        };
        Self {
            run_id: summary.run_id,
            status: summary.outcome.state(),
            resume_offset,
            page_size: summary.params.page_size,
            end_offset: Some(summary.params.start_offset.saturating_add(summary.params.limit)),
            finished_at: summary.finished_at,
        }
    }

    /// Start offset for a follow-up run with `page_size`.
    ///
    /// A finished run starts over from 0. A failed run restarts at its resume
    /// offset, rounded down to a page boundary when the page size changed.
    pub fn resume_offset_for(&self, page_size: u32) -> u64 {
        if self.status != RunState::Failed {
            return 0;
        }
        let page_size = u64::from(page_size.max(1));
        self.resume_offset - self.resume_offset % page_size
    }

    /// Limit that finishes a failed run's window from
    /// [`resume_offset_for`](Self::resume_offset_for). `None` when the run
    /// finished or the checkpoint predates window tracking.
    pub fn remaining_limit_for(&self, page_size: u32) -> Option<u64> {
        if self.status != RunState::Failed {
            return None;
        }
        self.end_offset
            .map(|end| end.saturating_sub(self.resume_offset_for(page_size)))
            .filter(|remaining| *remaining > 0)
    }
}

/// Writes `<reports_dir>/<run_id>/ingest_run.json`.
pub async fn write_run_report(reports_dir: &Path, summary: &IngestRunSummary) -> Result<PathBuf> {
    let run_dir = reports_dir.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let bytes = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    let path = run_dir.join(RUN_REPORT_FILE);
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    info!(path = %path.display(), "run report written");
    Ok(path)
}

/// Replaces `<reports_dir>/checkpoint.json` through a rename so readers see
/// either the old or the new checkpoint.
pub async fn write_checkpoint(reports_dir: &Path, checkpoint: &Checkpoint) -> Result<PathBuf> {
    fs::create_dir_all(reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let bytes = serde_json::to_vec_pretty(checkpoint).context("serializing checkpoint")?;
    let path = reports_dir.join(CHECKPOINT_FILE);
    let temp = reports_dir.join(format!(".{CHECKPOINT_FILE}.{}.tmp", Uuid::new_v4()));
    fs::write(&temp, bytes)
        .await
        .with_context(|| format!("writing {}", temp.display()))?;
    if let Err(err) = fs::rename(&temp, &path).await {
        let _ = fs::remove_file(&temp).await;
        return Err(err).with_context(|| format!("replacing {}", path.display()));
    }
    Ok(path)
}

pub async fn read_checkpoint(reports_dir: &Path) -> Result<Option<Checkpoint>> {
    let path = reports_dir.join(CHECKPOINT_FILE);
    let bytes = match fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
    };
    let checkpoint = serde_json::from_slice(&bytes)
        .with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(checkpoint))
}
