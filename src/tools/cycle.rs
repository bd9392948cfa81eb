use schemars::JsonSchema;
use serde::Deserialize;

/// Request to run one learning cycle over a file.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct RunCycleRequest {
    /// File the cycle is about, relative to the project root or absolute.
    pub file_path: String,
    /// File content. Read from `file_path` when omitted.
    pub source: Option<String>,
    /// Language hint passed to discovery (e.g. "python").
    pub language: Option<String>,
}

/// Request to run offline training epochs over a corpus directory.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct TrainRequest {
    /// Corpus directory, relative to the project root or absolute.
    pub corpus: String,
    /// Number of epochs to run (default 1). Stops early at the epoch cap.
    pub epochs: Option<u32>,
    /// File extensions to include, without the dot (default: common source extensions).
    pub extensions: Option<Vec<String>>,
}

impl TrainRequest {
    pub fn epochs(&self) -> u32 {
        self.epochs.unwrap_or(1).max(1)
    }
}
