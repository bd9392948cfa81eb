use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::CommandSpec;
use crate::error::{PlaybookError, Result};
use crate::process;

use super::{Method, PatternText, SimilarityTier};

/// Semantic scorer behind an external command.
///
/// Receives `{"text_a", "text_b", "name_a", "name_b"}` on stdin and must print
/// `{"similarity": <0..1>, "reasoning": "..."}`.
pub struct ExternalScorer {
    command: CommandSpec,
    timeout: Duration,
}

#[derive(Serialize)]
struct ScoreRequest<'a> {
    text_a: String,
    text_b: String,
    name_a: &'a str,
    name_b: &'a str,
}

#[derive(Deserialize)]
struct ScoreResponse {
    similarity: f64,
    #[serde(default)]
    reasoning: Option<String>,
}

impl ExternalScorer {
    pub fn new(command: CommandSpec, timeout: Duration) -> Self {
        Self { command, timeout }
    }
}

#[async_trait]
impl SimilarityTier for ExternalScorer {
    fn method(&self) -> Method {
        Method::External
    }

    async fn score(&self, a: &PatternText, b: &PatternText) -> Result<f64> {
        let request = serde_json::to_string(&ScoreRequest {
            text_a: a.combined(),
            text_b: b.combined(),
            name_a: &a.name,
            name_b: &b.name,
        })?;
        let response: ScoreResponse =
            process::run_json(&self.command, request, self.timeout, "scorer").await?;
        if !(0.0..=1.0).contains(&response.similarity) {
            return Err(PlaybookError::Collaborator {
                collaborator: "scorer",
                message: format!("similarity {} out of range", response.similarity),
            });
        }
        if let Some(reasoning) = response.reasoning {
            tracing::debug!(similarity = response.similarity, %reasoning, "scorer verdict");
        }
        Ok(response.similarity)
    }
}
