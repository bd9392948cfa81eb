//! Line-oriented parser for the managed document.
//!
//! Only the managed region (between the start/end markers) is structured:
//! `##`/`###` headings open sections, and a line starting with a
//! `[prefix-NNNNN]` token is a bullet keyed by that token.

use std::collections::HashSet;

use crate::store::bullet::leading_bullet_id;

pub const MANAGED_START: &str = "<!-- PLAYBOOK-START -->";
pub const MANAGED_END: &str = "<!-- PLAYBOOK-END -->";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulletLine {
    pub id: String,
    /// Line text without any trailing `\r`.
    pub text: String,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub title: String,
    pub heading_line: usize,
    /// Exclusive: the next heading or the end marker.
    pub end_line: usize,
    pub bullets: Vec<BulletLine>,
}

impl Section {
    pub fn bullet(&self, id: &str) -> Option<&BulletLine> {
        self.bullets.iter().find(|b| b.id == id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub start_line: usize,
    pub end_line: usize,
}

/// A parsed document. Line indices refer to `text.split('\n')`.
#[derive(Debug, Clone)]
pub struct ParsedDocument<'a> {
    pub lines: Vec<&'a str>,
    pub region: Option<Region>,
    pub sections: Vec<Section>,
}

impl ParsedDocument<'_> {
    pub fn section(&self, title: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.title == title)
    }

    pub fn bullet_count(&self) -> usize {
        self.sections.iter().map(|s| s.bullets.len()).sum()
    }

    /// True when lines end with `\r\n`.
    pub fn uses_crlf(&self) -> bool {
        self.lines.first().is_some_and(|l| l.ends_with('\r'))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    DuplicateMarker(&'static str),
    UnterminatedRegion,
    UnopenedRegion,
    DuplicateSection(String),
    DuplicateBullet(String),
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateMarker(m) => write!(f, "marker {m} appears more than once"),
            Self::UnterminatedRegion => write!(f, "start marker without end marker"),
            Self::UnopenedRegion => write!(f, "end marker without preceding start marker"),
            Self::DuplicateSection(t) => write!(f, "section '{t}' appears more than once"),
            Self::DuplicateBullet(id) => write!(f, "bullet [{id}] appears more than once"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Heading title for `## Title` / `### Title`; other levels are not sections.
fn heading_title(line: &str) -> Option<&str> {
    let hashes = line.len() - line.trim_start_matches('#').len();
    if !(2..=3).contains(&hashes) {
        return None;
    }
    let rest = &line[hashes..];
    rest.starts_with(' ').then(|| rest.trim())
}

pub fn parse(text: &str) -> Result<ParsedDocument<'_>, ParseError> {
    let lines: Vec<&str> = text.split('\n').collect();

    let mut start = None;
    let mut end = None;
    for (i, raw) in lines.iter().enumerate() {
        match raw.trim() {
            MANAGED_START => {
                if start.replace(i).is_some() {
                    return Err(ParseError::DuplicateMarker(MANAGED_START));
                }
            }
            MANAGED_END => {
                if end.replace(i).is_some() {
                    return Err(ParseError::DuplicateMarker(MANAGED_END));
                }
            }
            _ => {}
        }
    }

    let region = match (start, end) {
        (None, None) => None,
        (Some(_), None) => return Err(ParseError::UnterminatedRegion),
        (None, Some(_)) => return Err(ParseError::UnopenedRegion),
        (Some(s), Some(e)) if e < s => return Err(ParseError::UnopenedRegion),
        (Some(s), Some(e)) => Some(Region {
            start_line: s,
            end_line: e,
        }),
    };

    let mut sections: Vec<Section> = Vec::new();
    if let Some(region) = region {
        let mut seen_bullets = HashSet::new();
        let body = lines
            .iter()
            .enumerate()
            .take(region.end_line)
            .skip(region.start_line + 1);
        for (i, raw) in body {
            let line = raw.trim_end_matches('\r');
            if let Some(title) = heading_title(line) {
                if let Some(prev) = sections.last_mut() {
                    prev.end_line = i;
                }
                if sections.iter().any(|s| s.title == title) {
                    return Err(ParseError::DuplicateSection(title.to_string()));
                }
                sections.push(Section {
                    title: title.to_string(),
                    heading_line: i,
                    end_line: region.end_line,
                    bullets: Vec::new(),
                });
            } else if let Some(id) = leading_bullet_id(line)
                && let Some(section) = sections.last_mut()
            {
                if !seen_bullets.insert(id.to_string()) {
                    return Err(ParseError::DuplicateBullet(id.to_string()));
                }
                section.bullets.push(BulletLine {
                    id: id.to_string(),
                    text: line.to_string(),
                    line: i,
                });
            }
        }
    }

    Ok(ParsedDocument {
        lines,
        region,
        sections,
    })
}
