use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::CommandSpec;
use crate::error::Result;
use crate::process::run_json;

use super::{Evidence, FileContext, PatternObservation};

/// Proposes candidate pattern observations for one file.
#[async_trait]
pub trait Discovery: Send + Sync {
    fn name(&self) -> &'static str;

    async fn discover(
        &self,
        source: &str,
        evidence: &Evidence,
        file: &FileContext,
    ) -> Result<Vec<PatternObservation>>;
}

/// Discovers nothing. Also serves as a fixed-response stub.
#[derive(Debug, Default, Clone)]
pub struct NoopDiscovery {
    fixed: Vec<PatternObservation>,
}

impl NoopDiscovery {
    pub fn returning(fixed: Vec<PatternObservation>) -> Self {
        Self { fixed }
    }
}

#[async_trait]
impl Discovery for NoopDiscovery {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn discover(&self, _: &str, _: &Evidence, _: &FileContext) -> Result<Vec<PatternObservation>> {
        Ok(self.fixed.clone())
    }
}

#[derive(Serialize)]
struct DiscoveryRequest<'a> {
    source: &'a str,
    evidence: &'a Evidence,
    file: &'a FileContext,
}

/// Accepts either a bare list or `{"patterns": [...]}`.
#[derive(Deserialize)]
#[serde(untagged)]
enum DiscoveryResponse {
    List(Vec<PatternObservation>),
    Wrapped { patterns: Vec<PatternObservation> },
}

impl DiscoveryResponse {
    fn into_vec(self) -> Vec<PatternObservation> {
        match self {
            Self::List(v) | Self::Wrapped { patterns: v } => v,
        }
    }
}

/// External analyzer: request JSON on stdin, observations JSON on stdout.
pub struct CommandDiscovery {
    command: CommandSpec,
    timeout: Duration,
}

impl CommandDiscovery {
    pub fn new(command: CommandSpec, timeout: Duration) -> Self {
        Self { command, timeout }
    }
}

#[async_trait]
impl Discovery for CommandDiscovery {
    fn name(&self) -> &'static str {
        "command"
    }

    async fn discover(
        &self,
        source: &str,
        evidence: &Evidence,
        file: &FileContext,
    ) -> Result<Vec<PatternObservation>> {
        let request = serde_json::to_string(&DiscoveryRequest {
            source,
            evidence,
            file,
        })?;
        let response: DiscoveryResponse =
            run_json(&self.command, request, self.timeout, "discovery").await?;
        Ok(response.into_vec())
    }
}

/// Caches discovery responses on disk, keyed by file identity.
///
/// Without an inner discovery it only serves what is already cached, which
/// is how previously produced agent responses are replayed.
pub struct CachedDiscovery {
    dir: PathBuf,
    inner: Option<Box<dyn Discovery>>,
}

impl CachedDiscovery {
    pub fn new(dir: impl Into<PathBuf>, inner: Option<Box<dyn Discovery>>) -> Self {
        Self {
            dir: dir.into(),
            inner,
        }
    }

    /// sha256 of path and content; a changed file is a new identity.
    pub fn key(file: &FileContext, source: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(file.path.as_bytes());
        hasher.update([0u8]);
        hasher.update(source.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    async fn read(path: &Path) -> Option<Vec<PatternObservation>> {
        let text = tokio::fs::read_to_string(path).await.ok()?;
        match serde_json::from_str::<DiscoveryResponse>(&text) {
            Ok(resp) => Some(resp.into_vec()),
            Err(e) => {
                tracing::warn!("discovery: ignoring unreadable cache entry {}: {e}", path.display());
                None
            }
        }
    }

    async fn write(path: &Path, observations: &[PatternObservation]) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(observations)?).await?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl Discovery for CachedDiscovery {
    fn name(&self) -> &'static str {
        "cached"
    }

    async fn discover(
        &self,
        source: &str,
        evidence: &Evidence,
        file: &FileContext,
    ) -> Result<Vec<PatternObservation>> {
        let path = self.entry_path(&Self::key(file, source));
        if let Some(hit) = Self::read(&path).await {
            tracing::debug!(file = %file.path, "discovery: cache hit");
            return Ok(hit);
        }
        let Some(inner) = &self.inner else {
            return Ok(Vec::new());
        };
        let found = inner.discover(source, evidence, file).await?;
        if let Err(e) = Self::write(&path, &found).await {
            tracing::warn!("discovery: failed to cache {}: {e}", path.display());
        }
        Ok(found)
    }
}
