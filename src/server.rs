use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Implementation, ServerCapabilities, ServerInfo};
use rmcp::{ErrorData as McpError, ServerHandler, tool, tool_handler, tool_router};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::curator::Curator;
use crate::cycle::{Collaborators, CycleOrchestrator, CycleRequest};
use crate::document::{DocumentSync, SyncOutcome};
use crate::epoch::convergence;
use crate::error::{PlaybookError, Result};
use crate::feedback;
use crate::lock::CycleLock;
use crate::portability::{self, ImportStrategy};
use crate::report::{self, PatternFilter};
use crate::response::{ContentKind, ToolMetadata, ToolResponse};
use crate::similarity::SimilarityEngine;
use crate::store::{Pattern, PatternStore};
use crate::tools::cycle::{RunCycleRequest, TrainRequest};
use crate::tools::patterns::{FeedbackRequest, ListPatternsRequest, RetrieveRequest};
use crate::tools::snapshot::{ExportRequest, ImportRequest};
use crate::training::{Trainer, TrainingRequest};

type Body = (String, ContentKind);

struct Engine {
    config: Config,
    similarity: SimilarityEngine,
    collaborators: Collaborators,
    /// DuckDB allows one open handle per file per process; every tool call
    /// that touches the store goes through this gate.
    gate: Mutex<()>,
}

#[derive(Clone)]
pub struct PlaybookServer {
    engine: Arc<Engine>,
    tool_router: ToolRouter<Self>,
}

fn json_body<T: Serialize>(value: &T) -> Result<Body> {
    Ok((serde_json::to_string_pretty(value)?, ContentKind::Json))
}

#[derive(Serialize)]
struct WithDocument<T: Serialize> {
    #[serde(flatten)]
    result: T,
    document: Option<String>,
}

#[tool_router]
impl PlaybookServer {
    pub fn new(config: Config) -> Self {
        let similarity = SimilarityEngine::from_config(&config);
        let collaborators = Collaborators::from_config(&config);
        Self::with_parts(config, similarity, collaborators)
    }

    /// Build with explicit similarity tiers and collaborators.
    pub fn with_parts(config: Config, similarity: SimilarityEngine, collaborators: Collaborators) -> Self {
        tracing::info!(
            root = %config.root.display(),
            tiers = ?similarity.tier_methods(),
            "playbook: engine ready"
        );
        Self {
            engine: Arc::new(Engine {
                config,
                similarity,
                collaborators,
                gate: Mutex::new(()),
            }),
            tool_router: Self::tool_router(),
        }
    }

    fn respond(&self, tool: &str, start: Instant, result: Result<Body>) -> CallToolResult {
        let metadata = ToolMetadata {
            tool_name: tool.to_string(),
            project: self.engine.config.project.clone(),
            duration_seconds: start.elapsed().as_secs_f64(),
        };
        let response = match result {
            Ok((content, kind)) => ToolResponse::success(content, kind, metadata),
            Err(e) => {
                tracing::warn!("{tool} failed: {e}");
                ToolResponse::error(&e, metadata)
            }
        };
        response.into_call_tool_result()
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = PathBuf::from(path);
        if path.is_absolute() {
            path
        } else {
            self.engine.config.root.join(path)
        }
    }

    fn open_store(&self) -> Result<PatternStore> {
        PatternStore::open(&self.engine.config.paths.store)
    }

    /// Takes owned patterns: a store borrow must not be held across an await.
    async fn sync(&self, patterns: Vec<Pattern>) -> Result<SyncOutcome> {
        DocumentSync::from_paths(&self.engine.config.paths)
            .sync(&patterns)
            .await
    }

    /// Store writers share the cycle's lock so they never interleave with a
    /// cycle or training run in another process.
    fn hold_cycle_lock(&self) -> Result<CycleLock> {
        let config = &self.engine.config;
        CycleLock::try_acquire(&config.paths.lock, config.timeouts.lock_stale)?
            .ok_or(PlaybookError::LockHeld)
    }

    fn curator(&self) -> Curator<'_> {
        Curator::new(&self.engine.similarity, &self.engine.config.thresholds)
    }

    #[tool(
        name = "run_cycle",
        description = "Run one learning cycle for a file: gather evidence, discover candidate patterns, curate them into the store, and sync the managed document. Never fails the caller; a running cycle makes this a no-op."
    )]
    async fn run_cycle(
        &self,
        Parameters(req): Parameters<RunCycleRequest>,
    ) -> Result<CallToolResult, McpError> {
        if req.file_path.trim().is_empty() {
            return Err(McpError::invalid_params("file_path must not be empty", None));
        }
        let start = Instant::now();
        let _gate = self.engine.gate.lock().await;
        let orchestrator = CycleOrchestrator::new(
            &self.engine.config,
            &self.engine.similarity,
            &self.engine.collaborators,
        );
        let outcome = orchestrator
            .run(&CycleRequest {
                file_path: req.file_path,
                source: req.source,
                language: req.language,
            })
            .await;
        Ok(self.respond("run_cycle", start, json_body(&outcome)))
    }

    #[tool(
        name = "list_patterns",
        description = "List learned patterns grouped by confidence band, optionally filtered by domain/language and minimum confidence.",
        annotations(read_only_hint = true)
    )]
    async fn list_patterns(
        &self,
        Parameters(req): Parameters<ListPatternsRequest>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let _gate = self.engine.gate.lock().await;
        let filter = PatternFilter {
            domain: req.domain,
            min_confidence: req.min_confidence.unwrap_or(0.0).clamp(0.0, 1.0),
        };
        let result = self
            .open_store()
            .and_then(|store| report::list_patterns(&store, &filter))
            .map(|patterns| (report::render_listing(&patterns), ContentKind::Markdown));
        Ok(self.respond("list_patterns", start, result))
    }

    #[tool(
        name = "stats",
        description = "Aggregate statistics: confidence bands, observations, success rate, per-domain breakdown, top patterns, prunable count and epochs.",
        annotations(read_only_hint = true)
    )]
    async fn stats(&self) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let _gate = self.engine.gate.lock().await;
        let result = self
            .open_store()
            .and_then(|store| report::stats(&store, &self.engine.config.thresholds))
            .map(|stats| (stats.to_markdown(), ContentKind::Markdown));
        Ok(self.respond("stats", start, result))
    }

    #[tool(
        name = "retrieve",
        description = "Patterns most relevant for a context, ranked by confidence, helpful feedback and success rate.",
        annotations(read_only_hint = true)
    )]
    async fn retrieve(
        &self,
        Parameters(req): Parameters<RetrieveRequest>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let _gate = self.engine.gate.lock().await;
        let limit = req.limit();
        let result = self.open_store().and_then(|store| {
            let ranked = report::retrieve(store.list_all()?, req.domain.as_deref(), limit);
            json_body(&ranked)
        });
        Ok(self.respond("retrieve", start, result))
    }

    #[tool(
        name = "feedback",
        description = "Tag document bullets as helpful, harmful or neutral. Adjusts pattern confidence and syncs the managed document."
    )]
    async fn feedback(
        &self,
        Parameters(req): Parameters<FeedbackRequest>,
    ) -> Result<CallToolResult, McpError> {
        let ids = feedback::collect_bullet_ids(
            req.bullet_ids.as_deref().unwrap_or_default(),
            req.text.as_deref(),
        );
        if ids.is_empty() {
            return Err(McpError::invalid_params(
                "no bullet ids given: pass bullet_ids or text containing [prefix-NNNNN] tokens",
                None,
            ));
        }
        let start = Instant::now();
        let _gate = self.engine.gate.lock().await;
        let result = async {
            let _lock = self.hold_cycle_lock()?;
            let mut store = self.open_store()?;
            let report = feedback::apply(&mut store, &ids, req.feedback)?;
            let document = if report.changed() {
                Some(self.sync(store.list_all()?).await?.summary())
            } else {
                None
            };
            json_body(&WithDocument {
                result: report,
                document,
            })
        }
        .await;
        Ok(self.respond("feedback", start, result))
    }

    #[tool(
        name = "consolidate",
        description = "Session-end pass: merge near-duplicate patterns within each domain and type, then prune patterns that met the observation floor with low confidence."
    )]
    async fn consolidate(&self) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let _gate = self.engine.gate.lock().await;
        let result = async {
            let _lock = self.hold_cycle_lock()?;
            let mut store = self.open_store()?;
            let report = self.curator().consolidate(&mut store).await?;
            let document = if report.changed() {
                Some(self.sync(store.list_all()?).await?.summary())
            } else {
                None
            };
            json_body(&WithDocument {
                result: serde_json::json!({
                    "merged": report.merged,
                    "pruned": report.pruned,
                }),
                document,
            })
        }
        .await;
        Ok(self.respond("consolidate", start, result))
    }

    #[tool(
        name = "train",
        description = "Run offline training epochs over a corpus directory. The first epoch analyzes the corpus; later epochs replay cached files. Epochs are capped."
    )]
    async fn train(
        &self,
        Parameters(req): Parameters<TrainRequest>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let corpus = self.resolve(&req.corpus);
        if !corpus.is_dir() {
            return Err(McpError::invalid_params(
                format!("corpus is not a directory: {}", corpus.display()),
                None,
            ));
        }
        let _gate = self.engine.gate.lock().await;
        let trainer = Trainer::new(
            &self.engine.config,
            &self.engine.similarity,
            self.engine.collaborators.discovery.as_ref(),
        );
        let request = TrainingRequest {
            corpus,
            epochs: req.epochs(),
            extensions: req.extensions.clone().unwrap_or_default(),
        };
        let result = trainer.train(&request).await.and_then(|report| json_body(&report));
        Ok(self.respond("train", start, result))
    }

    #[tool(
        name = "convergence",
        description = "Convergence report: which patterns have stable confidence, which are still learning, and which lack data.",
        annotations(read_only_hint = true)
    )]
    async fn convergence(&self) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let _gate = self.engine.gate.lock().await;
        let result = self
            .open_store()
            .and_then(|store| convergence::check_all(&store, &self.engine.config.thresholds))
            .map(|report| (report.to_markdown(), ContentKind::Markdown));
        Ok(self.respond("convergence", start, result))
    }

    #[tool(
        name = "export",
        description = "Export patterns, insights and observations as a portable JSON snapshot, to a file or inline.",
        annotations(read_only_hint = true)
    )]
    async fn export(
        &self,
        Parameters(req): Parameters<ExportRequest>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let _gate = self.engine.gate.lock().await;
        let result = async {
            let snapshot = {
                let store = self.open_store()?;
                portability::export(&store, &self.engine.config.project)?
            };
            match req.path.as_deref() {
                Some(path) => {
                    let path = self.resolve(path);
                    portability::write_snapshot(&path, &snapshot).await?;
                    Ok((
                        format!(
                            "Exported {} patterns, {} insights, {} observations to {}",
                            snapshot.totals.patterns,
                            snapshot.totals.insights,
                            snapshot.totals.observations,
                            path.display()
                        ),
                        ContentKind::Text,
                    ))
                }
                None => json_body(&snapshot),
            }
        }
        .await;
        Ok(self.respond("export", start, result))
    }

    #[tool(
        name = "import",
        description = "Import a JSON snapshot with strategy merge (curator decides), overwrite, or skip-existing. Syncs the managed document afterwards."
    )]
    async fn import(
        &self,
        Parameters(req): Parameters<ImportRequest>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let path = self.resolve(&req.path);
        let strategy = req.strategy.unwrap_or(ImportStrategy::Merge);
        let _gate = self.engine.gate.lock().await;
        let result = async {
            let _lock = self.hold_cycle_lock()?;
            let snapshot = portability::read_snapshot(&path).await?;
            let mut store = self.open_store()?;
            let report =
                portability::import(&mut store, &self.curator(), &snapshot, strategy).await?;
            let document = Some(self.sync(store.list_all()?).await?.summary());
            json_body(&WithDocument {
                result: report,
                document,
            })
        }
        .await;
        Ok(self.respond("import", start, result))
    }

    #[tool(
        name = "sync_document",
        description = "Bring the managed region of the instruction document in line with the store using minimal per-bullet edits."
    )]
    async fn sync_document(&self) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let _gate = self.engine.gate.lock().await;
        let result = async {
            let _lock = self.hold_cycle_lock()?;
            let store = self.open_store()?;
            let outcome = self.sync(store.list_all()?).await?;
            if let SyncOutcome::Refused { reason } = &outcome {
                return Err(PlaybookError::MalformedDocument {
                    path: self.engine.config.paths.document.display().to_string(),
                    reason: reason.clone(),
                });
            }
            Ok((outcome.summary(), ContentKind::Text))
        }
        .await;
        Ok(self.respond("sync_document", start, result))
    }
}

#[tool_handler]
impl ServerHandler for PlaybookServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            server_info: Implementation {
                name: "playbook".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            instructions: Some(
                "Playbook: learns coding patterns from observed outcomes and keeps a managed \
                 region of the project's instruction document in sync.\n\n\
                 Workflow:\n\
                 1. After editing a file, call `run_cycle` with its path. It never blocks or fails.\n\
                 2. Call `retrieve` or `list_patterns` before writing code in a domain.\n\
                 3. Tag bullets you followed with `feedback` (helpful/harmful).\n\
                 4. At session end call `consolidate`.\n\n\
                 Offline: `train` replays a corpus for several epochs; `convergence` shows which \
                 patterns have stabilized. `export`/`import` move patterns between projects."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn temp_root(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("playbook-test-server-{tag}-{}-{nanos}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn envelope(result: &CallToolResult) -> serde_json::Value {
        let value = serde_json::to_value(result).unwrap();
        let text = value["content"][0]["text"].as_str().unwrap().to_string();
        serde_json::from_str(&text).unwrap()
    }

    #[tokio::test]
    async fn writers_wait_for_a_running_cycle() {
        let root = temp_root("locked");
        let config = Config::with_root(&root);
        let server = PlaybookServer::with_parts(
            config.clone(),
            SimilarityEngine::jaccard_only(),
            Collaborators::noop(),
        );

        let held = CycleLock::try_acquire(&config.paths.lock, Duration::from_secs(3600))
            .unwrap()
            .unwrap();

        let synced = envelope(&server.sync_document().await.unwrap());
        assert_eq!(synced["status"], "error");
        assert_eq!(synced["content"], "another cycle is running, try again shortly");
        assert!(!config.paths.document.exists());

        let consolidated = envelope(&server.consolidate().await.unwrap());
        assert_eq!(consolidated["status"], "error");
        assert_eq!(consolidated["content"], "another cycle is running, try again shortly");

        drop(held);
        let synced = envelope(&server.sync_document().await.unwrap());
        assert_eq!(synced["status"], "success");
        assert!(config.paths.document.exists());
        std::fs::remove_dir_all(&root).ok();
    }
}
