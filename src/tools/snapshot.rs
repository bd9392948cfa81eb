use schemars::JsonSchema;
use serde::Deserialize;

use crate::portability::ImportStrategy;

/// Request to export the store as a JSON snapshot.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExportRequest {
    /// Output file, relative to the project root or absolute. When omitted the
    /// snapshot is returned inline.
    pub path: Option<String>,
}

/// Request to import a JSON snapshot.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ImportRequest {
    /// Snapshot file, relative to the project root or absolute.
    pub path: String,
    /// "merge" (default), "overwrite" or "skip-existing".
    pub strategy: Option<ImportStrategy>,
}
