use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{PlaybookError, Result};

/// Name of the per-project data directory.
pub const DATA_DIR: &str = ".playbook";

/// Default managed document, relative to the project root.
pub const DEFAULT_DOCUMENT: &str = "CLAUDE.md";

/// Curation and convergence thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct Thresholds {
    /// Similarity at or above which a candidate merges into an existing pattern.
    pub merge: f64,
    /// Confidence below which an aggregate with enough observations is pruned.
    pub prune: f64,
    /// Observations an aggregate needs before it can be pruned.
    pub min_observations_before_prune: u64,
    /// Observations a pattern needs before it can be called converged.
    pub min_observations_for_convergence: u64,
    /// Confidence snapshots a pattern needs before convergence is assessed.
    pub min_snapshots_for_convergence: usize,
    /// Std dev of recent snapshots below which a pattern is converged.
    pub confidence_variance: f64,
    pub max_epochs: u32,
    /// Taxonomy refresh fires whenever the pattern count crosses a multiple of this.
    pub taxonomy_modulus: u64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            merge: 0.85,
            prune: 0.30,
            min_observations_before_prune: 10,
            min_observations_for_convergence: 20,
            min_snapshots_for_convergence: 5,
            confidence_variance: 0.05,
            max_epochs: 5,
            taxonomy_modulus: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Timeouts {
    pub discovery: Duration,
    pub evidence: Duration,
    pub scorer: Duration,
    pub embedding: Duration,
    pub taxonomy: Duration,
    /// Lock files older than this whose holder is gone are reclaimed.
    pub lock_stale: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            discovery: Duration::from_secs(120),
            evidence: Duration::from_secs(30),
            scorer: Duration::from_secs(10),
            embedding: Duration::from_secs(10),
            taxonomy: Duration::from_secs(30),
            lock_stale: Duration::from_secs(600),
        }
    }
}

/// An external program invoked without a shell.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    /// Split a shell-style command line (quotes and escapes honoured, no
    /// expansion). `Ok(None)` for a blank line.
    pub fn parse(line: &str) -> std::result::Result<Option<Self>, shell_words::ParseError> {
        let mut parts = shell_words::split(line)?.into_iter();
        Ok(parts.next().map(|program| Self {
            program,
            args: parts.collect(),
        }))
    }
}

/// OpenAI-compatible embedding endpoint.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EmbeddingConfig {
    pub base_url: String,
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

/// On-disk locations, all derived from the project root unless overridden.
#[derive(Debug, Clone, PartialEq)]
pub struct Paths {
    pub data_dir: PathBuf,
    pub store: PathBuf,
    pub embedding_cache: PathBuf,
    pub document: PathBuf,
    pub history: PathBuf,
    pub lock: PathBuf,
    pub discovery_cache: PathBuf,
    pub taxonomy: PathBuf,
}

impl Paths {
    pub fn under(root: &Path) -> Self {
        let data_dir = root.join(DATA_DIR);
        Self {
            store: data_dir.join("patterns.duckdb"),
            embedding_cache: data_dir.join("embeddings.duckdb"),
            document: root.join(DEFAULT_DOCUMENT),
            history: data_dir.join("playbook_delta_history.log"),
            lock: data_dir.join("cycle.lock"),
            discovery_cache: data_dir.join("discovery"),
            taxonomy: data_dir.join("domain_taxonomy.json"),
            data_dir,
        }
    }
}

/// Explicit configuration handed to every component.
#[derive(Debug, Clone)]
pub struct Config {
    pub root: PathBuf,
    /// Project label recorded in exports.
    pub project: String,
    pub paths: Paths,
    pub thresholds: Thresholds,
    pub timeouts: Timeouts,
    pub scorer: Option<CommandSpec>,
    pub embedding: Option<EmbeddingConfig>,
    pub discovery: Option<CommandSpec>,
    pub evidence: Option<CommandSpec>,
}

/// Shape of `.playbook/config.toml`. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    project: Option<String>,
    document: Option<PathBuf>,
    store: Option<PathBuf>,
    history: Option<PathBuf>,
    thresholds: FileThresholds,
    timeouts: FileTimeouts,
    scorer: Option<CommandSpec>,
    embedding: Option<EmbeddingConfig>,
    discovery: Option<CommandSpec>,
    evidence: Option<CommandSpec>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileThresholds {
    merge: Option<f64>,
    prune: Option<f64>,
    min_observations_before_prune: Option<u64>,
    min_observations_for_convergence: Option<u64>,
    confidence_variance: Option<f64>,
    max_epochs: Option<u32>,
    taxonomy_modulus: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileTimeouts {
    discovery_secs: Option<u64>,
    evidence_secs: Option<u64>,
    scorer_secs: Option<u64>,
    embedding_secs: Option<u64>,
    taxonomy_secs: Option<u64>,
    lock_stale_secs: Option<u64>,
}

impl Config {
    /// Defaults only: no config file, no environment.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let project = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project".to_string());
        Self {
            paths: Paths::under(&root),
            project,
            root,
            thresholds: Thresholds::default(),
            timeouts: Timeouts::default(),
            scorer: None,
            embedding: None,
            discovery: None,
            evidence: None,
        }
    }

    /// Defaults, then `.playbook/config.toml`, then `PLAYBOOK_*` environment overrides.
    ///
    /// A malformed config file is ignored with a warning; a collaborator
    /// command in the environment that cannot be split is an error.
    pub fn load(root: impl Into<PathBuf>) -> Result<Self> {
        let mut config = Self::with_root(root);
        let file_path = config.paths.data_dir.join("config.toml");
        match std::fs::read_to_string(&file_path) {
            Ok(text) => match toml::from_str::<FileConfig>(&text) {
                Ok(file) => config.apply_file(file),
                Err(e) => {
                    tracing::warn!("config: ignoring {}: {e}", file_path.display());
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("config: cannot read {}: {e}", file_path.display()),
        }
        config.apply_env()?;
        config.clamp();
        Ok(config)
    }

    fn resolve(&self, path: PathBuf) -> PathBuf {
        if path.is_absolute() {
            path
        } else {
            self.root.join(path)
        }
    }

    fn apply_file(&mut self, file: FileConfig) {
        if let Some(project) = file.project {
            self.project = project;
        }
        if let Some(doc) = file.document {
            self.paths.document = self.resolve(doc);
        }
        if let Some(store) = file.store {
            self.paths.store = self.resolve(store);
        }
        if let Some(history) = file.history {
            self.paths.history = self.resolve(history);
        }

        let t = file.thresholds;
        let th = &mut self.thresholds;
        th.merge = t.merge.unwrap_or(th.merge);
        th.prune = t.prune.unwrap_or(th.prune);
        th.min_observations_before_prune = t
            .min_observations_before_prune
            .unwrap_or(th.min_observations_before_prune);
        th.min_observations_for_convergence = t
            .min_observations_for_convergence
            .unwrap_or(th.min_observations_for_convergence);
        th.confidence_variance = t.confidence_variance.unwrap_or(th.confidence_variance);
        th.max_epochs = t.max_epochs.unwrap_or(th.max_epochs);
        th.taxonomy_modulus = t.taxonomy_modulus.unwrap_or(th.taxonomy_modulus);

        let secs = Duration::from_secs;
        let to = file.timeouts;
        let tm = &mut self.timeouts;
        tm.discovery = to.discovery_secs.map(secs).unwrap_or(tm.discovery);
        tm.evidence = to.evidence_secs.map(secs).unwrap_or(tm.evidence);
        tm.scorer = to.scorer_secs.map(secs).unwrap_or(tm.scorer);
        tm.embedding = to.embedding_secs.map(secs).unwrap_or(tm.embedding);
        tm.taxonomy = to.taxonomy_secs.map(secs).unwrap_or(tm.taxonomy);
        tm.lock_stale = to.lock_stale_secs.map(secs).unwrap_or(tm.lock_stale);

        self.scorer = file.scorer.or(self.scorer.take());
        self.embedding = file.embedding.or(self.embedding.take());
        self.discovery = file.discovery.or(self.discovery.take());
        self.evidence = file.evidence.or(self.evidence.take());
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(doc) = env::var("PLAYBOOK_DOCUMENT") {
            self.paths.document = self.resolve(PathBuf::from(doc));
        }
        if let Ok(store) = env::var("PLAYBOOK_STORE") {
            self.paths.store = self.resolve(PathBuf::from(store));
        }
        if let Some(cmd) = env_command("PLAYBOOK_SCORER_CMD")? {
            self.scorer = Some(cmd);
        }
        if let Some(cmd) = env_command("PLAYBOOK_DISCOVERY_CMD")? {
            self.discovery = Some(cmd);
        }
        if let Some(cmd) = env_command("PLAYBOOK_EVIDENCE_CMD")? {
            self.evidence = Some(cmd);
        }
        if let Ok(base_url) = env::var("PLAYBOOK_EMBEDDING_URL") {
            let model = env::var("PLAYBOOK_EMBEDDING_MODEL")
                .unwrap_or_else(|_| "text-embedding-3-small".to_string());
            let api_key = env::var("PLAYBOOK_EMBEDDING_API_KEY").ok();
            self.embedding = Some(EmbeddingConfig {
                base_url,
                model,
                api_key,
            });
        }
        if self.embedding.is_none() && self.scorer.is_none() {
            tracing::debug!("config: no scorer or embedding endpoint, similarity uses jaccard only");
        }
        Ok(())
    }

    /// Keep thresholds inside their meaningful ranges.
    fn clamp(&mut self) {
        let th = &mut self.thresholds;
        th.merge = th.merge.clamp(0.0, 1.0);
        th.prune = th.prune.clamp(0.0, 1.0);
        if th.max_epochs == 0 {
            tracing::warn!("config: max_epochs must be at least 1, using 1");
            th.max_epochs = 1;
        }
        if th.taxonomy_modulus == 0 {
            th.taxonomy_modulus = Thresholds::default().taxonomy_modulus;
        }
    }
}

fn env_command(key: &str) -> Result<Option<CommandSpec>> {
    match env::var(key) {
        Ok(line) => command_from(key, &line),
        Err(_) => Ok(None),
    }
}

fn command_from(key: &str, line: &str) -> Result<Option<CommandSpec>> {
    CommandSpec::parse(line).map_err(|e| PlaybookError::Config(format!("{key}: {e}")))
}
