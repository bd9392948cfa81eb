//! Collaborator ports: discovery, evidence, taxonomy refresh.
//!
//! The engine never analyzes source itself. It asks a [`Discovery`] for
//! candidate observations, an [`EvidenceSource`] for test status, and tells a
//! [`TaxonomyRefresh`] when the pattern population grows. Each port ships a
//! no-op implementation and a concrete one.

pub mod discovery;
pub mod evidence;
pub mod taxonomy;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::store::{Counts, Outcome, Pattern, PatternDelta, PatternType};

pub use discovery::{CachedDiscovery, CommandDiscovery, Discovery, NoopDiscovery};
pub use evidence::{CommandEvidence, EvidenceSource, NoEvidence};
pub use taxonomy::{FileTaxonomy, NoopTaxonomy, TaxonomyRefresh};

/// One candidate pattern reported by discovery for one file.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct PatternObservation {
    pub id: String,
    pub name: String,
    pub domain: String,
    #[serde(rename = "type")]
    pub pattern_type: PatternType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub language: String,
    /// Discovery's own confidence in the observation, 0..=1.
    #[serde(default)]
    pub confidence: Option<f64>,
    /// Explicit outcome; when absent the cycle derives it from evidence.
    #[serde(default)]
    pub outcome: Option<Outcome>,
    #[serde(default)]
    pub insight: String,
    #[serde(default)]
    pub recommendation: String,
    #[serde(default = "default_true")]
    pub applied_correctly: bool,
}

fn default_true() -> bool {
    true
}

impl PatternObservation {
    pub fn resolved_outcome(&self, evidence: &Evidence) -> Outcome {
        self.outcome.unwrap_or_else(|| evidence.status.outcome())
    }

    /// Re-observation of a stored pattern, used when replaying cached files.
    pub fn replay(pattern: &Pattern) -> Self {
        Self {
            id: pattern.id.clone(),
            name: pattern.name.clone(),
            domain: pattern.domain.clone(),
            pattern_type: pattern.pattern_type,
            description: pattern.description.clone(),
            language: pattern.language.clone(),
            confidence: Some(pattern.confidence),
            outcome: None,
            insight: String::new(),
            recommendation: String::new(),
            applied_correctly: true,
        }
    }

    /// Single-observation delta for the curator.
    pub fn to_delta(&self, outcome: Outcome, seen_at: i64) -> PatternDelta {
        PatternDelta {
            id: self.id.clone(),
            name: self.name.clone(),
            domain: self.domain.clone(),
            pattern_type: self.pattern_type,
            description: self.description.clone(),
            language: self.language.clone(),
            counts: Counts::single(outcome),
            seen_at,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EvidenceStatus {
    Passed,
    Failed,
    Timeout,
    #[default]
    None,
}

impl EvidenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::None => "none",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "passed" => Self::Passed,
            "failed" => Self::Failed,
            "timeout" => Self::Timeout,
            _ => Self::None,
        }
    }

    pub fn outcome(&self) -> Outcome {
        match self {
            Self::Passed => Outcome::Success,
            Self::Failed => Outcome::Failure,
            Self::Timeout | Self::None => Outcome::Neutral,
        }
    }
}

/// Test/build evidence gathered before discovery.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct Evidence {
    pub status: EvidenceStatus,
    #[serde(default)]
    pub logs: String,
    #[serde(default)]
    pub output: String,
}

impl Evidence {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_status(status: EvidenceStatus) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    /// Error text worth attaching to an observation, if any.
    pub fn error_logs(&self) -> Option<String> {
        match self.status {
            EvidenceStatus::Failed | EvidenceStatus::Timeout if !self.logs.trim().is_empty() => {
                Some(self.logs.clone())
            }
            _ => None,
        }
    }
}

/// The file a cycle is about.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct FileContext {
    pub path: String,
    #[serde(default)]
    pub language: Option<String>,
}
