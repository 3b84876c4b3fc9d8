//! Spool of heal proposals whose approval card was not delivered.
//!
//! One JSON document per line in `<dir>/pending.jsonl`. Writers serialize on
//! a `pending.jsonl.lock` file created with `create_new`, so an `analyze` run
//! appending while `redeliver` rewrites never loses an entry.

use anyhow::{bail, Context, Result};
use notify::CardVariables;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::decision::HealAction;
use crate::dispatch::ApprovalRequest;

const FILE_NAME: &str = "pending.jsonl";
const LOCK_POLL: Duration = Duration::from_millis(25);
const LOCK_WAIT: Duration = Duration::from_secs(10);
/// Lock holders only do file I/O; an older lock belongs to a dead process.
const LOCK_STALE: Duration = Duration::from_secs(30);

/// A proposal waiting for re-notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingNotification {
    pub heal: HealAction,
    pub variables: CardVariables,
    pub approval: ApprovalRequest,
    pub last_error: String,
    pub attempts: u32,
}

/// Entries read for redelivery, remembering the lines they came from.
#[derive(Debug, Default)]
pub struct SpoolSnapshot {
    pub entries: Vec<PendingNotification>,
    lines: HashSet<String>,
}

#[derive(Debug, Clone)]
pub struct PendingStore {
    path: PathBuf,
}

/// Held while the spool file is written. Removes the lock file on drop.
struct SpoolLock {
    path: PathBuf,
}

impl Drop for SpoolLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to release spool lock");
        }
    }
}

impl PendingStore {
    #[must_use]
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(FILE_NAME),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("jsonl.lock")
    }

    async fn lock(&self) -> Result<SpoolLock> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let path = self.lock_path();
        let started = Instant::now();
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => return Ok(SpoolLock { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if lock_is_stale(&path).await {
                        warn!(path = %path.display(), "Removing stale spool lock");
                        let _ = fs::remove_file(&path).await;
                        continue;
                    }
                    if started.elapsed() >= LOCK_WAIT {
                        bail!("Timed out waiting for spool lock {}", path.display());
                    }
                    tokio::time::sleep(LOCK_POLL).await;
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to create {}", path.display()))
                }
            }
        }
    }

    pub async fn append(&self, entry: &PendingNotification) -> Result<()> {
        let mut line = serde_json::to_string(entry).context("Failed to serialize pending entry")?;
        line.push('\n');

        let _lock = self.lock().await?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .await
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        file.flush().await?;
        Ok(())
    }

    async fn read_lines(&self) -> Result<Vec<String>> {
        match fs::read_to_string(&self.path).await {
            Ok(content) => Ok(content
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(str::to_string)
                .collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", self.path.display())),
        }
    }

    /// Read all entries. A missing file is an empty spool; corrupt lines are skipped.
    pub async fn load(&self) -> Result<Vec<PendingNotification>> {
        Ok(self.snapshot().await?.entries)
    }

    /// Read all entries for a later [`commit`](Self::commit).
    pub async fn snapshot(&self) -> Result<SpoolSnapshot> {
        let mut snapshot = SpoolSnapshot::default();
        for (index, line) in self.read_lines().await?.into_iter().enumerate() {
            match serde_json::from_str(&line) {
                Ok(entry) => {
                    snapshot.entries.push(entry);
                    snapshot.lines.insert(line);
                }
                Err(e) => warn!(line = index + 1, error = %e, "Skipping corrupt pending entry"),
            }
        }
        Ok(snapshot)
    }

    /// Replace the snapshot's entries with `remaining`.
    ///
    /// Lines appended since the snapshot and lines that do not parse are kept.
    /// The file is removed when nothing is left.
    pub async fn commit(
        &self,
        snapshot: &SpoolSnapshot,
        remaining: &[PendingNotification],
    ) -> Result<()> {
        let _lock = self.lock().await?;

        let mut request_ids: HashSet<String> = remaining
            .iter()
            .map(|entry| entry.approval.request_id.clone())
            .collect();
        let mut content = String::new();
        for entry in remaining {
            content.push_str(&serde_json::to_string(entry)?);
            content.push('\n');
        }

        for line in self.read_lines().await? {
            if snapshot.lines.contains(&line) {
                continue;
            }
            if let Ok(entry) = serde_json::from_str::<PendingNotification>(&line) {
                // already rewritten by a concurrent redelivery
                if !request_ids.insert(entry.approval.request_id) {
                    continue;
                }
            }
            content.push_str(&line);
            content.push('\n');
        }

        if content.is_empty() {
            return match fs::remove_file(&self.path).await {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e)
                    .with_context(|| format!("Failed to remove {}", self.path.display())),
                _ => Ok(()),
            };
        }

        let tmp = self.path.with_extension("jsonl.tmp");
        fs::write(&tmp, content)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

async fn lock_is_stale(path: &Path) -> bool {
    let Ok(metadata) = fs::metadata(path).await else {
        return false;
    };
    metadata
        .modified()
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > LOCK_STALE)
}
