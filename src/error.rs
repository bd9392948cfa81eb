use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlaybookError {
    #[error("store error: {0}")]
    Store(#[from] duckdb::Error),

    #[error("schema migration failed: {0}")]
    Migration(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("pattern not found: {0}")]
    PatternNotFound(String),

    #[error("malformed managed region in {path}: {reason}")]
    MalformedDocument { path: String, reason: String },

    #[error("timeout after {0}ms")]
    Timeout(u64),

    #[error("{collaborator} unavailable: {message}")]
    Collaborator {
        collaborator: &'static str,
        message: String,
    },

    #[error("process exited with code {code}: {stderr}")]
    ProcessExit { code: i32, stderr: String },

    #[error("cycle lock held by another process")]
    LockHeld,

    #[error("invalid config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T, E = PlaybookError> = std::result::Result<T, E>;

impl PlaybookError {
    /// Errors a cycle can absorb and still report `continue`.
    ///
    /// Every error is survivable at the cycle boundary; this distinguishes the
    /// expected degradations (collaborators, contention, malformed documents)
    /// from the ones worth a louder log line.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_)
                | Self::Collaborator { .. }
                | Self::ProcessExit { .. }
                | Self::Request(_)
                | Self::LockHeld
                | Self::MalformedDocument { .. }
        )
    }

    /// Sanitized message safe for returning to MCP clients.
    pub fn user_message(&self) -> String {
        match self {
            Self::Store(_) => "pattern store unavailable".to_string(),
            Self::Migration(msg) => format!("pattern store schema error: {msg}"),
            Self::Io(e) => format!("file error: {e}"),
            Self::Json(_) => "malformed JSON payload".to_string(),
            Self::Request(_) => "embedding request failed".to_string(),
            Self::PatternNotFound(id) => format!("pattern not found: {id}"),
            Self::MalformedDocument { path, reason } => {
                format!("refusing to edit {path}: {reason}")
            }
            Self::Timeout(ms) => format!("timed out after {ms}ms"),
            Self::Collaborator { collaborator, .. } => format!("{collaborator} unavailable"),
            Self::ProcessExit { code, stderr } => {
                let tail = tail_chars(stderr.trim(), 200);
                if tail.is_empty() {
                    format!("process exited with code {code}")
                } else {
                    format!("process exited with code {code}: {tail}")
                }
            }
            Self::LockHeld => "another cycle is running, try again shortly".to_string(),
            Self::Config(msg) => format!("invalid config: {msg}"),
            Self::Other(msg) => msg.clone(),
        }
    }
}

/// Last `max` chars of `s`, prefixed with "..." when truncated.
pub(crate) fn tail_chars(s: &str, max: usize) -> String {
    let count = s.chars().count();
    if count <= max {
        return s.to_string();
    }
    let tail: String = s.chars().skip(count - max).collect();
    format!("...{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_chars_truncates_from_front() {
        assert_eq!(tail_chars("abcdef", 3), "...def");
        assert_eq!(tail_chars("abc", 3), "abc");
    }

    #[test]
    fn lock_contention_is_recoverable() {
        assert!(PlaybookError::LockHeld.is_recoverable());
        assert!(PlaybookError::Timeout(10).is_recoverable());
        assert!(!PlaybookError::Other("boom".into()).is_recoverable());
    }

    #[test]
    fn user_message_hides_store_internals() {
        let err = PlaybookError::Migration("bad ddl".into());
        assert!(err.user_message().contains("bad ddl"));
        let err = PlaybookError::ProcessExit {
            code: 2,
            stderr: "  ".into(),
        };
        assert_eq!(err.user_message(), "process exited with code 2");
    }
}
