//! Renders the desired managed region from store state.

use crate::store::{Pattern, PatternType};

use super::parse::{MANAGED_END, MANAGED_START};

const TITLE: &str = "# Learned Coding Patterns";
const PREAMBLE: &str = "Curated automatically from observed outcomes. \
Lines between the markers are maintained by playbook; edit outside them.";

/// Section heading for each pattern type, in document order.
pub fn section_title(pattern_type: PatternType) -> &'static str {
    match pattern_type {
        PatternType::Helpful => "Strategies and Hard Rules",
        PatternType::Harmful => "Troubleshooting and Pitfalls",
        PatternType::Neutral => "Observations",
    }
}

/// One bullet line. Confidence renders as a whole percent so tiny moves don't churn lines.
pub fn bullet_line(p: &Pattern) -> String {
    let helpful = p.counts.successes + p.counts.helpful;
    let harmful = p.counts.failures + p.counts.harmful;
    let confidence = (p.confidence * 100.0).round() as i64;
    let name = one_line(&p.name);
    let description = one_line(&p.description);
    let mut line = format!(
        "[{}] helpful={helpful} harmful={harmful} confidence={confidence}% :: **{name}**",
        p.bullet_id
    );
    if !description.is_empty() {
        line.push_str(" - ");
        line.push_str(&description);
    }
    if !p.language.trim().is_empty() && p.language != p.domain {
        line.push_str(&format!(" _({}, {})_", one_line(&p.domain), one_line(&p.language)));
    } else if !p.domain.trim().is_empty() {
        line.push_str(&format!(" _({})_", one_line(&p.domain)));
    }
    line
}

fn one_line(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// The full managed region, markers included, without a trailing newline.
pub fn render_region(patterns: &[Pattern]) -> String {
    let mut lines: Vec<String> = vec![
        MANAGED_START.to_string(),
        TITLE.to_string(),
        String::new(),
        PREAMBLE.to_string(),
    ];

    for pattern_type in PatternType::ALL {
        let mut members: Vec<&Pattern> = patterns
            .iter()
            .filter(|p| p.pattern_type == pattern_type)
            .collect();
        members.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| a.bullet_id.cmp(&b.bullet_id))
        });

        lines.push(String::new());
        lines.push(format!("## {}", section_title(pattern_type)));
        lines.push(String::new());
        lines.extend(members.into_iter().map(bullet_line));
    }

    lines.push(String::new());
    lines.push(MANAGED_END.to_string());
    lines.join("\n")
}
