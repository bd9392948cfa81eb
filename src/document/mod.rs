//! Keeps the managed region of an external markdown document in sync with
//! the store through minimal per-bullet edits.
//!
//! Only the first write of a region is a bulk write (creating the file, or
//! appending the region to a file that has none). Afterwards the document is
//! parsed, diffed against a freshly rendered region, and patched line by
//! line; every line the diff does not touch is copied verbatim. An empty
//! diff performs no write at all, and a malformed region is never edited.

pub mod delta;
pub mod history;
pub mod parse;
pub mod render;

use std::path::{Path, PathBuf};

use crate::config::Paths;
use crate::error::{PlaybookError, Result};
use crate::store::Pattern;
use crate::time::iso_now;

pub use delta::{BulletChange, Delta};
pub use parse::{MANAGED_END, MANAGED_START};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The managed region was written for the first time.
    Created { bullets: usize },
    Applied {
        additions: usize,
        updates: usize,
        deletions: usize,
    },
    Unchanged,
    /// The existing document could not be parsed safely; nothing was written.
    Refused { reason: String },
}

impl SyncOutcome {
    pub fn wrote(&self) -> bool {
        matches!(self, Self::Created { .. } | Self::Applied { .. })
    }

    pub fn summary(&self) -> String {
        match self {
            Self::Created { bullets } => format!("created managed region with {bullets} bullets"),
            Self::Applied {
                additions,
                updates,
                deletions,
            } => format!("applied delta: +{additions} ~{updates} -{deletions}"),
            Self::Unchanged => "document already up to date".to_string(),
            Self::Refused { reason } => format!("refused to edit document: {reason}"),
        }
    }
}

pub struct DocumentSync {
    document: PathBuf,
    history: PathBuf,
}

impl DocumentSync {
    pub fn new(document: impl Into<PathBuf>, history: impl Into<PathBuf>) -> Self {
        Self {
            document: document.into(),
            history: history.into(),
        }
    }

    pub fn from_paths(paths: &Paths) -> Self {
        Self::new(paths.document.clone(), paths.history.clone())
    }

    pub fn document_path(&self) -> &Path {
        &self.document
    }

    /// Bring the managed region in line with `patterns`.
    pub async fn sync(&self, patterns: &[Pattern]) -> Result<SyncOutcome> {
        let desired_text = render::render_region(patterns);
        let desired = parse::parse(&desired_text)
            .map_err(|e| PlaybookError::Other(format!("rendered region does not parse: {e}")))?;

        let existing_text = match tokio::fs::read(&self.document).await {
            Ok(bytes) => match String::from_utf8(bytes) {
                Ok(text) => Some(text),
                Err(_) => return Ok(self.refuse("document is not valid UTF-8")),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        let Some(existing_text) = existing_text else {
            return self.establish("", desired.bullet_count(), &desired_text).await;
        };

        let existing = match parse::parse(&existing_text) {
            Ok(doc) => doc,
            Err(e) => return Ok(self.refuse(&e.to_string())),
        };
        if existing.region.is_none() {
            return self
                .establish(&existing_text, desired.bullet_count(), &desired_text)
                .await;
        }

        let delta = delta::diff(&existing, &desired);
        if delta.is_empty() {
            tracing::debug!("sync: {} unchanged", self.document.display());
            return Ok(SyncOutcome::Unchanged);
        }
        let Some(updated) = delta::apply(&existing, &desired, &delta) else {
            return Ok(self.refuse("managed region disappeared during apply"));
        };

        atomic_write(&self.document, &updated).await?;
        self.log(&history::format_delta_entry(&iso_now(), &delta)).await;
        tracing::info!(
            additions = delta.additions.len(),
            updates = delta.updates.len(),
            deletions = delta.deletions.len(),
            "sync: delta applied to {}",
            self.document.display()
        );
        Ok(SyncOutcome::Applied {
            additions: delta.additions.len(),
            updates: delta.updates.len(),
            deletions: delta.deletions.len(),
        })
    }

    /// First write: the region is appended after any existing content.
    async fn establish(&self, existing: &str, bullets: usize, region: &str) -> Result<SyncOutcome> {
        let separator = if existing.is_empty() {
            ""
        } else if existing.ends_with('\n') {
            "\n"
        } else {
            "\n\n"
        };
        let text = format!("{existing}{separator}{region}\n");
        if let Some(parent) = self.document.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        atomic_write(&self.document, &text).await?;
        self.log(&history::format_created_entry(&iso_now(), bullets)).await;
        tracing::info!(bullets, "sync: managed region created in {}", self.document.display());
        Ok(SyncOutcome::Created { bullets })
    }

    fn refuse(&self, reason: &str) -> SyncOutcome {
        tracing::warn!(
            "sync: refusing to edit {}: {reason}",
            self.document.display()
        );
        SyncOutcome::Refused {
            reason: reason.to_string(),
        }
    }

    async fn log(&self, entry: &str) {
        if let Err(e) = history::append(&self.history, entry).await {
            tracing::warn!("sync: failed to append history {}: {e}", self.history.display());
        }
    }
}

/// Atomic write: write to temp file, then rename.
/// Temp filename includes PID to avoid cross-process collisions.
async fn atomic_write(path: &Path, content: &str) -> std::io::Result<()> {
    let tmp_path = path.with_extension(format!("tmp.{}", std::process::id()));
    tokio::fs::write(&tmp_path, content.as_bytes()).await?;
    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e);
    }
    Ok(())
}
