//! Bullet ids: the `[prefix-NNNNN]` tokens that key lines in the managed document.

use sha2::{Digest, Sha256};

/// Numbers live in `1..=MAX_BULLET_NUMBER` and always render as five digits.
pub const MAX_BULLET_NUMBER: u32 = 99_999;

/// Prefix from the id's first hyphen-delimited token, else the domain's first 3 chars.
pub fn bullet_prefix(pattern_id: &str, domain: &str) -> String {
    let from_id = pattern_id
        .split_once('-')
        .map(|(head, _)| sanitize(head))
        .filter(|p| !p.is_empty());
    match from_id {
        Some(prefix) => prefix,
        None => {
            let prefix: String = sanitize(domain).chars().take(3).collect();
            if prefix.is_empty() {
                "pat".to_string()
            } else {
                prefix
            }
        }
    }
}

fn sanitize(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Starting number for an id: sha256 of the id reduced into range.
pub fn bullet_seed(pattern_id: &str) -> u32 {
    let hash = Sha256::digest(pattern_id.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&hash[..8]);
    (u64::from_be_bytes(head) % MAX_BULLET_NUMBER as u64) as u32 + 1
}

pub fn format_bullet(prefix: &str, number: u32) -> String {
    format!("{prefix}-{number:05}")
}

/// Deterministic bullet id, probing upward (with wraparound) past taken numbers.
///
/// Returns `None` only when every number for the prefix is taken.
pub fn generate_bullet_id<F>(pattern_id: &str, domain: &str, mut is_taken: F) -> Option<String>
where
    F: FnMut(&str) -> bool,
{
    let prefix = bullet_prefix(pattern_id, domain);
    let seed = bullet_seed(pattern_id);
    for step in 0..MAX_BULLET_NUMBER {
        let number = (seed - 1 + step) % MAX_BULLET_NUMBER + 1;
        let candidate = format_bullet(&prefix, number);
        if !is_taken(&candidate) {
            return Some(candidate);
        }
    }
    None
}

/// Parse a leading `[prefix-NNNNN]` token, returning the id without brackets.
pub fn leading_bullet_id(line: &str) -> Option<&str> {
    let rest = line.trim_start().strip_prefix('[')?;
    let end = rest.find(']')?;
    let token = &rest[..end];
    is_bullet_token(token).then_some(token)
}

/// Every `[prefix-NNNNN]` token in free text, in order of appearance, deduplicated.
pub fn extract_bullet_ids(text: &str) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find('[') {
        rest = &rest[open + 1..];
        if let Some(close) = rest.find(']') {
            let token = &rest[..close];
            if is_bullet_token(token) && !found.iter().any(|f| f == token) {
                found.push(token.to_string());
            }
        }
    }
    found
}

/// Canonical form of a stored or imported bullet id: brackets stripped and
/// the `prefix-NNNNN` shape checked. `None` when the shape is wrong.
pub fn normalize_bullet_id(raw: &str) -> Option<String> {
    let token = raw.trim().trim_start_matches('[').trim_end_matches(']').trim();
    is_bullet_token(token).then(|| token.to_string())
}

fn is_bullet_token(token: &str) -> bool {
    let Some((prefix, digits)) = token.rsplit_once('-') else {
        return false;
    };
    !prefix.is_empty()
        && prefix.chars().all(|c| c.is_ascii_alphanumeric())
        && digits.len() == 5
        && digits.chars().all(|c| c.is_ascii_digit())
}
