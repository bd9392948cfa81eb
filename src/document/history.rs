//! Append-only plaintext log of every change made to the managed document.

use std::fmt::Write as _;
use std::path::Path;

use tokio::io::AsyncWriteExt;

use super::delta::{BulletChange, Delta};

pub fn format_delta_entry(timestamp: &str, delta: &Delta) -> String {
    let mut entry = String::new();
    let _ = writeln!(entry, "--- Delta Applied: {timestamp} ---");
    let _ = writeln!(entry, "Additions: {}", delta.additions.len());
    let _ = writeln!(entry, "Updates: {}", delta.updates.len());
    let _ = writeln!(entry, "Deletions: {}", delta.deletions.len());
    for (label, changes) in [
        ("Added", &delta.additions),
        ("Updated", &delta.updates),
        ("Deleted", &delta.deletions),
    ] {
        if !changes.is_empty() {
            let _ = writeln!(entry, "{label}:");
            push_changes(&mut entry, changes);
        }
    }
    entry.push('\n');
    entry
}

pub fn format_created_entry(timestamp: &str, bullets: usize) -> String {
    format!("--- Managed Region Created: {timestamp} ---\nBullets: {bullets}\n\n")
}

fn push_changes(entry: &mut String, changes: &[BulletChange]) {
    for c in changes {
        let _ = writeln!(entry, "  - [{}] in '{}'", c.bullet_id, c.section);
    }
}

pub async fn append(path: &Path, entry: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(entry.as_bytes()).await?;
    file.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_lists_counts_and_ids() {
        let delta = Delta {
            additions: vec![BulletChange {
                section: "Rules".into(),
                bullet_id: "py-00001".into(),
                line: "[py-00001] x".into(),
            }],
            updates: vec![],
            deletions: vec![BulletChange {
                section: "Pitfalls".into(),
                bullet_id: "py-00002".into(),
                line: String::new(),
            }],
        };
        let entry = format_delta_entry("2025-01-01T00:00:00Z", &delta);
        assert_eq!(
            entry,
            "--- Delta Applied: 2025-01-01T00:00:00Z ---\nAdditions: 1\nUpdates: 0\nDeletions: 1\nAdded:\n  - [py-00001] in 'Rules'\nDeleted:\n  - [py-00002] in 'Pitfalls'\n\n"
        );
    }

    #[tokio::test]
    async fn append_accumulates() {
        let dir = std::env::temp_dir().join(format!("playbook-history-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let path = dir.join("nested").join("history.log");
        append(&path, "one\n").await.unwrap();
        append(&path, "two\n").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "one\ntwo\n");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
