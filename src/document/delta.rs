//! Per-section bullet diff and in-place application.

use std::collections::{BTreeMap, HashMap, HashSet};

use super::parse::ParsedDocument;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulletChange {
    pub section: String,
    pub bullet_id: String,
    /// Desired line text; empty for deletions.
    pub line: String,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Delta {
    pub additions: Vec<BulletChange>,
    pub updates: Vec<BulletChange>,
    pub deletions: Vec<BulletChange>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.updates.is_empty() && self.deletions.is_empty()
    }
}

/// Diff `existing` against `desired`, section by section, keyed by bullet id.
pub fn diff(existing: &ParsedDocument<'_>, desired: &ParsedDocument<'_>) -> Delta {
    let mut delta = Delta::default();

    for want in &desired.sections {
        match existing.section(&want.title) {
            Some(have) => {
                for bullet in &want.bullets {
                    match have.bullet(&bullet.id) {
                        None => delta.additions.push(change(&want.title, &bullet.id, &bullet.text)),
                        Some(current) if current.text != bullet.text => {
                            delta.updates.push(change(&want.title, &bullet.id, &bullet.text))
                        }
                        Some(_) => {}
                    }
                }
            }
            None => {
                for bullet in &want.bullets {
                    delta.additions.push(change(&want.title, &bullet.id, &bullet.text));
                }
            }
        }
    }

    for have in &existing.sections {
        let want = desired.section(&have.title);
        for bullet in &have.bullets {
            if want.and_then(|s| s.bullet(&bullet.id)).is_none() {
                delta.deletions.push(change(&have.title, &bullet.id, ""));
            }
        }
    }

    delta
}

fn change(section: &str, bullet_id: &str, line: &str) -> BulletChange {
    BulletChange {
        section: section.to_string(),
        bullet_id: bullet_id.to_string(),
        line: line.to_string(),
    }
}

/// Apply `delta` to the text `existing` was parsed from.
///
/// Untouched lines are copied verbatim. Additions go after the last
/// non-blank line of their section; additions for a section missing from
/// the document arrive as a new section just before the end marker.
/// Returns `None` when `existing` has no managed region.
pub fn apply(existing: &ParsedDocument<'_>, desired: &ParsedDocument<'_>, delta: &Delta) -> Option<String> {
    let region = existing.region?;
    let eol = if existing.uses_crlf() { "\r" } else { "" };

    let mut replace: HashMap<usize, &str> = HashMap::new();
    let mut remove: HashSet<usize> = HashSet::new();
    let mut insert_before: BTreeMap<usize, Vec<String>> = BTreeMap::new();

    let locate = |c: &BulletChange| {
        existing
            .section(&c.section)
            .and_then(|s| s.bullet(&c.bullet_id))
            .map(|b| b.line)
    };
    for update in &delta.updates {
        if let Some(line) = locate(update) {
            replace.insert(line, &update.line);
        }
    }
    for deletion in &delta.deletions {
        if let Some(line) = locate(deletion) {
            remove.insert(line);
        }
    }

    let mut new_sections: Vec<(&str, Vec<&str>)> = Vec::new();
    for addition in &delta.additions {
        match existing.section(&addition.section) {
            Some(section) => {
                let anchor = (section.heading_line..section.end_line)
                    .rev()
                    .find(|&i| !existing.lines[i].trim().is_empty())
                    .unwrap_or(section.heading_line);
                insert_before
                    .entry(anchor + 1)
                    .or_default()
                    .push(format!("{}{eol}", addition.line));
            }
            None => match new_sections.iter_mut().find(|(t, _)| *t == addition.section) {
                Some((_, lines)) => lines.push(&addition.line),
                None => new_sections.push((&addition.section, vec![&addition.line])),
            },
        }
    }

    if !new_sections.is_empty() {
        // Keep desired section order for sections created in this pass.
        new_sections.sort_by_key(|(title, _)| {
            desired
                .sections
                .iter()
                .position(|s| s.title == *title)
                .unwrap_or(usize::MAX)
        });
        let block = insert_before.entry(region.end_line).or_default();
        let before_end = existing.lines[region.end_line - 1].trim();
        if !before_end.is_empty() || !block.is_empty() {
            block.push(eol.to_string());
        }
        for (title, lines) in new_sections {
            block.push(format!("## {title}{eol}"));
            block.push(eol.to_string());
            block.extend(lines.into_iter().map(|l| format!("{l}{eol}")));
            block.push(eol.to_string());
        }
    }

    let mut out: Vec<String> = Vec::with_capacity(existing.lines.len() + delta.additions.len());
    for (i, raw) in existing.lines.iter().enumerate() {
        if let Some(lines) = insert_before.remove(&i) {
            out.extend(lines);
        }
        if remove.contains(&i) {
            continue;
        }
        match replace.get(&i) {
            Some(line) => out.push(format!("{line}{eol}")),
            None => out.push((*raw).to_string()),
        }
    }
    Some(out.join("\n"))
}
