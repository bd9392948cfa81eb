use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::CommandSpec;
use crate::error::{PlaybookError, Result, tail_chars};
use crate::process::run_command;

use super::{Evidence, EvidenceStatus};

/// Characters of test output kept per stream.
const LOG_TAIL_CHARS: usize = 2000;

#[async_trait]
pub trait EvidenceSource: Send + Sync {
    async fn gather(&self) -> Result<Evidence>;
}

/// No evidence: every cycle sees status `none`.
#[derive(Debug, Default, Clone)]
pub struct NoEvidence;

#[async_trait]
impl EvidenceSource for NoEvidence {
    async fn gather(&self) -> Result<Evidence> {
        Ok(Evidence::none())
    }
}

/// Runs a test command in the project root.
pub struct CommandEvidence {
    command: CommandSpec,
    timeout: Duration,
    working_dir: PathBuf,
}

impl CommandEvidence {
    pub fn new(command: CommandSpec, timeout: Duration, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            command,
            timeout,
            working_dir: working_dir.into(),
        }
    }
}

#[async_trait]
impl EvidenceSource for CommandEvidence {
    async fn gather(&self) -> Result<Evidence> {
        match run_command(&self.command, None, self.timeout, Some(&self.working_dir)).await {
            Ok(out) => Ok(Evidence {
                status: if out.success() {
                    EvidenceStatus::Passed
                } else {
                    EvidenceStatus::Failed
                },
                logs: tail_chars(out.stderr.trim(), LOG_TAIL_CHARS),
                output: tail_chars(out.stdout.trim(), LOG_TAIL_CHARS),
            }),
            Err(PlaybookError::Timeout(ms)) => {
                tracing::warn!(program = %self.command.program, ms, "evidence: test command timed out");
                Ok(Evidence {
                    status: EvidenceStatus::Timeout,
                    logs: format!("timed out after {ms}ms"),
                    output: String::new(),
                })
            }
            Err(e) => Err(e),
        }
    }
}
