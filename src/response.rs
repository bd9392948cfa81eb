use rmcp::model::{CallToolResult, Content};
use serde::Serialize;

use crate::error::PlaybookError;

/// Envelope returned by every tool, serialized as JSON text.
#[derive(Debug, Serialize)]
pub struct ToolResponse {
    pub status: &'static str,
    pub content: String,
    pub content_type: &'static str,
    pub metadata: ToolMetadata,
}

#[derive(Debug, Serialize)]
pub struct ToolMetadata {
    pub tool_name: String,
    pub project: String,
    #[serde(serialize_with = "serialize_finite_f64")]
    pub duration_seconds: f64,
}

/// Serialize f64, clamping non-finite values (NaN, Inf) to 0.0.
fn serialize_finite_f64<S: serde::Serializer>(v: &f64, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(if v.is_finite() { *v } else { 0.0 })
}

/// How `content` should be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Markdown,
    Json,
    Text,
}

impl ContentKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Markdown => "markdown",
            Self::Json => "json",
            Self::Text => "text",
        }
    }
}

impl ToolResponse {
    pub fn success(content: String, kind: ContentKind, metadata: ToolMetadata) -> Self {
        Self {
            status: "success",
            content,
            content_type: kind.as_str(),
            metadata,
        }
    }

    pub fn error(err: &PlaybookError, metadata: ToolMetadata) -> Self {
        Self {
            status: "error",
            content: err.user_message(),
            content_type: ContentKind::Text.as_str(),
            metadata,
        }
    }

    /// Pretty JSON body for structured results.
    pub fn json<T: Serialize>(value: &T, metadata: ToolMetadata) -> Self {
        match serde_json::to_string_pretty(value) {
            Ok(body) => Self::success(body, ContentKind::Json, metadata),
            Err(e) => Self::error(&PlaybookError::Json(e), metadata),
        }
    }

    /// Convert to MCP CallToolResult.
    /// Always success at the transport level; failures live in `status`.
    pub fn into_call_tool_result(self) -> CallToolResult {
        match serde_json::to_string(&self) {
            Ok(json) => CallToolResult::success(vec![Content::text(json)]),
            Err(e) => {
                let escaped = e.to_string().replace('\\', "\\\\").replace('"', "\\\"");
                CallToolResult::success(vec![Content::text(format!(
                    r#"{{"status":"error","content":"serialization failed: {escaped}","content_type":"text","metadata":{{}}}}"#
                ))])
            }
        }
    }
}
