use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Whether a heuristic should be followed, avoided, or is merely noted.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PatternType {
    Helpful,
    Harmful,
    Neutral,
}

impl PatternType {
    pub const ALL: [PatternType; 3] = [Self::Helpful, Self::Harmful, Self::Neutral];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Helpful => "helpful",
            Self::Harmful => "harmful",
            Self::Neutral => "neutral",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "helpful" => Some(Self::Helpful),
            "harmful" => Some(Self::Harmful),
            "neutral" => Some(Self::Neutral),
            _ => None,
        }
    }
}

/// Result of one application of a pattern.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
    Neutral,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Neutral => "neutral",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "success" => Some(Self::Success),
            "failure" => Some(Self::Failure),
            "neutral" => Some(Self::Neutral),
            _ => None,
        }
    }
}

/// User feedback on a bullet in the managed document.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Feedback {
    Helpful,
    Harmful,
    Neutral,
}

/// Observation and feedback tallies. Summed component-wise on merge.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Counts {
    pub observations: u64,
    pub successes: u64,
    pub failures: u64,
    pub neutrals: u64,
    #[serde(rename = "helpful_count")]
    pub helpful: u64,
    #[serde(rename = "harmful_count")]
    pub harmful: u64,
}

impl Counts {
    /// One observation with its outcome tallied.
    pub fn single(outcome: Outcome) -> Self {
        let mut counts = Self {
            observations: 1,
            ..Self::default()
        };
        match outcome {
            Outcome::Success => counts.successes = 1,
            Outcome::Failure => counts.failures = 1,
            Outcome::Neutral => counts.neutrals = 1,
        }
        counts
    }

    pub fn absorb(&mut self, other: &Counts) {
        self.observations += other.observations;
        self.successes += other.successes;
        self.failures += other.failures;
        self.neutrals += other.neutrals;
        self.helpful += other.helpful;
        self.harmful += other.harmful;
    }

    pub fn sum(&self, other: &Counts) -> Counts {
        let mut out = *self;
        out.absorb(other);
        out
    }

    /// `(successes + helpful) / max(observations + helpful + harmful, 1)`
    pub fn confidence(&self) -> f64 {
        let numerator = (self.successes + self.helpful) as f64;
        let denominator = (self.observations + self.helpful + self.harmful).max(1) as f64;
        numerator / denominator
    }
}

/// A curated heuristic with its running statistics.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Pattern {
    pub id: String,
    /// Display token without brackets, e.g. `py-00042`.
    pub bullet_id: String,
    pub name: String,
    pub domain: String,
    #[serde(rename = "type")]
    pub pattern_type: PatternType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub language: String,
    #[serde(flatten)]
    pub counts: Counts,
    pub confidence: f64,
    pub last_seen: i64,
    pub created_at: i64,
}

impl Pattern {
    /// Helpful-feedback share of all feedback, 0 when there is none.
    pub fn helpful_ratio(&self) -> f64 {
        let total = self.counts.helpful + self.counts.harmful;
        if total == 0 {
            0.0
        } else {
            self.counts.helpful as f64 / total as f64
        }
    }

    pub fn success_ratio(&self) -> f64 {
        if self.counts.observations == 0 {
            0.0
        } else {
            self.counts.successes as f64 / self.counts.observations as f64
        }
    }
}

/// Counts to fold into a pattern, creating it if the id is new.
#[derive(Debug, Clone, PartialEq)]
pub struct PatternDelta {
    pub id: String,
    pub name: String,
    pub domain: String,
    pub pattern_type: PatternType,
    pub description: String,
    pub language: String,
    pub counts: Counts,
    pub seen_at: i64,
}

impl PatternDelta {
    /// The would-be aggregate if this delta were folded into `existing`.
    pub fn aggregate_with(&self, existing: Option<&Pattern>) -> Counts {
        match existing {
            Some(p) => p.counts.sum(&self.counts),
            None => self.counts,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Insight {
    #[serde(default)]
    pub id: i64,
    pub pattern_id: String,
    pub timestamp: i64,
    pub insight: String,
    #[serde(default)]
    pub recommendation: String,
    pub confidence: f64,
    #[serde(default = "default_true")]
    pub applied_correctly: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Observation {
    #[serde(default)]
    pub id: i64,
    pub pattern_id: String,
    pub timestamp: i64,
    pub outcome: Outcome,
    #[serde(default)]
    pub test_status: Option<String>,
    #[serde(default)]
    pub error_logs: Option<String>,
    #[serde(default)]
    pub file_path: Option<String>,
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_formula() {
        let counts = Counts {
            observations: 10,
            successes: 2,
            ..Counts::default()
        };
        assert!((counts.confidence() - 0.2).abs() < 1e-9);

        let counts = Counts {
            observations: 4,
            successes: 2,
            helpful: 2,
            harmful: 2,
            ..Counts::default()
        };
        assert!((counts.confidence() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn empty_counts_have_zero_confidence() {
        assert_eq!(Counts::default().confidence(), 0.0);
    }

    #[test]
    fn single_outcome_tallies() {
        assert_eq!(Counts::single(Outcome::Success).confidence(), 1.0);
        let fail = Counts::single(Outcome::Failure);
        assert_eq!((fail.observations, fail.failures), (1, 1));
        assert_eq!(fail.confidence(), 0.0);
    }

    #[test]
    fn sum_is_order_independent() {
        let a = Counts::single(Outcome::Success);
        let b = Counts {
            observations: 3,
            failures: 2,
            neutrals: 1,
            harmful: 1,
            ..Counts::default()
        };
        assert_eq!(a.sum(&b), b.sum(&a));
        assert_eq!(a.sum(&b).observations, 4);
    }

    #[test]
    fn pattern_json_uses_flat_counts() {
        let pattern = Pattern {
            id: "py-typed".into(),
            bullet_id: "py-00001".into(),
            name: "Typed dicts".into(),
            domain: "python".into(),
            pattern_type: PatternType::Helpful,
            description: String::new(),
            language: "python".into(),
            counts: Counts::single(Outcome::Success),
            confidence: 1.0,
            last_seen: 1,
            created_at: 1,
        };
        let json = serde_json::to_value(&pattern).unwrap();
        assert_eq!(json["type"], "helpful");
        assert_eq!(json["observations"], 1);
        assert_eq!(json["helpful_count"], 0);
        let back: Pattern = serde_json::from_value(json).unwrap();
        assert_eq!(back, pattern);
    }
}
