use schemars::JsonSchema;
use serde::Deserialize;

use crate::store::Feedback;

/// Request to list stored patterns.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListPatternsRequest {
    /// Case-insensitive substring matched against domain or language.
    pub domain: Option<String>,
    /// Minimum confidence, 0.0 to 1.0 (default 0.0).
    pub min_confidence: Option<f64>,
}

/// Request for the patterns most relevant to a context.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct RetrieveRequest {
    /// Restrict to a domain or language (substring match).
    pub domain: Option<String>,
    /// Maximum patterns to return (default 10).
    pub limit: Option<usize>,
}

impl RetrieveRequest {
    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(10).clamp(1, 100)
    }
}

/// Request to tag bullets as helpful, harmful or neutral.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct FeedbackRequest {
    /// "helpful", "harmful" or "neutral".
    pub feedback: Feedback,
    /// Bullet ids such as "py-00042" or "[py-00042]".
    pub bullet_ids: Option<Vec<String>>,
    /// Free text; every `[prefix-NNNNN]` token in it is tagged too.
    pub text: Option<String>,
}
