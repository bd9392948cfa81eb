//! Helpful / harmful tags applied to document bullets.

use serde::Serialize;

use crate::error::Result;
use crate::store::{Feedback, PatternStore, extract_bullet_ids};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedbackApplied {
    pub bullet_id: String,
    pub pattern_id: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FeedbackReport {
    pub applied: Vec<FeedbackApplied>,
    /// Bullets that matched no stored pattern.
    pub unknown: Vec<String>,
}

impl FeedbackReport {
    pub fn changed(&self) -> bool {
        !self.applied.is_empty()
    }
}

/// Explicit ids plus any `[prefix-NNNNN]` tokens found in `text`, deduplicated
/// in first-seen order.
pub fn collect_bullet_ids(explicit: &[String], text: Option<&str>) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    let from_text = text.map(extract_bullet_ids).unwrap_or_default();
    for raw in explicit.iter().cloned().chain(from_text) {
        let id = raw.trim().trim_start_matches('[').trim_end_matches(']').to_string();
        if !id.is_empty() && !ids.contains(&id) {
            ids.push(id);
        }
    }
    ids
}

pub fn apply(store: &mut PatternStore, bullet_ids: &[String], feedback: Feedback) -> Result<FeedbackReport> {
    let mut report = FeedbackReport::default();
    for bullet in bullet_ids {
        match store.record_feedback(bullet, feedback)? {
            Some(pattern) => report.applied.push(FeedbackApplied {
                bullet_id: pattern.bullet_id,
                pattern_id: pattern.id,
                confidence: pattern.confidence,
            }),
            None => {
                tracing::debug!(bullet = %bullet, "store: feedback for unknown bullet");
                report.unknown.push(bullet.clone());
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Counts, Outcome, PatternDelta, PatternType};

    #[test]
    fn ids_from_text_and_explicit_are_merged() {
        let ids = collect_bullet_ids(
            &["[py-00001]".into(), "go-00002".into()],
            Some("followed [py-00001] and [rs-00003] today"),
        );
        assert_eq!(ids, vec!["py-00001", "go-00002", "rs-00003"]);
    }

    #[test]
    fn feedback_moves_confidence_and_reports_unknowns() {
        let mut store = PatternStore::open_in_memory().unwrap();
        let created = store
            .upsert(&PatternDelta {
                id: "py-guard".into(),
                name: "guard clauses".into(),
                domain: "python".into(),
                pattern_type: PatternType::Helpful,
                description: String::new(),
                language: "python".into(),
                counts: Counts::single(Outcome::Failure),
                seen_at: 0,
            })
            .unwrap()
            .pattern;
        assert_eq!(created.confidence, 0.0);

        let report = apply(
            &mut store,
            &[created.bullet_id.clone(), "zz-99999".into()],
            Feedback::Helpful,
        )
        .unwrap();
        assert_eq!(report.applied.len(), 1);
        assert!((report.applied[0].confidence - 0.5).abs() < 1e-9);
        assert_eq!(report.unknown, vec!["zz-99999".to_string()]);
    }
}
