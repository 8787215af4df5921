//! Unified diffs between file maps.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use similar::{ChangeTag, TextDiff};

use crate::validate::FileMap;

/// Lines added and removed in one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDiffStat {
    pub path: String,
    pub insertions: usize,
    pub deletions: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DiffSummary {
    /// Git-style unified diff of every changed file.
    pub unified_diff: String,
    pub stats: Vec<FileDiffStat>,
}

impl DiffSummary {
    pub fn is_empty(&self) -> bool {
        self.unified_diff.is_empty()
    }

    /// SHA-256 of the diff text, hex encoded.
    pub fn hash(&self) -> String {
        hash_diff(&self.unified_diff)
    }

    /// `N files changed, X insertions(+), Y deletions(-)`
    pub fn shortstat(&self) -> String {
        let insertions: usize = self.stats.iter().map(|s| s.insertions).sum();
        let deletions: usize = self.stats.iter().map(|s| s.deletions).sum();
        format!(
            "{} files changed, {insertions} insertions(+), {deletions} deletions(-)",
            self.stats.len()
        )
    }
}

pub fn hash_diff(diff: &str) -> String {
    format!("{:x}", Sha256::digest(diff.as_bytes()))
}

/// Diff `after` against `before`: new, changed, and deleted files, in path order.
pub fn diff_file_maps(before: &FileMap, after: &FileMap) -> DiffSummary {
    let mut paths: Vec<&String> = before.keys().chain(after.keys()).collect();
    paths.sort();
    paths.dedup();

    let mut summary = DiffSummary::default();
    for path in paths {
        let old = before.get(path);
        let new = after.get(path);
        if old == new {
            continue;
        }
        let (patch, stat) = file_patch(path, old.map(String::as_str), new.map(String::as_str));
        summary.unified_diff.push_str(&patch);
        summary.stats.push(stat);
    }
    summary
}

fn file_patch(path: &str, old: Option<&str>, new: Option<&str>) -> (String, FileDiffStat) {
    let diff = TextDiff::from_lines(old.unwrap_or(""), new.unwrap_or(""));

    let mut stat = FileDiffStat {
        path: path.to_string(),
        insertions: 0,
        deletions: 0,
    };
    for change in diff.iter_all_changes() {
        match change.tag() {
            ChangeTag::Insert => stat.insertions += 1,
            ChangeTag::Delete => stat.deletions += 1,
            ChangeTag::Equal => {}
        }
    }

    let a = format!("a/{path}");
    let b = format!("b/{path}");
    let (mode_line, old_header, new_header) = match (old, new) {
        (None, _) => (Some("new file mode 100644"), "/dev/null", b.as_str()),
        (_, None) => (Some("deleted file mode 100644"), a.as_str(), "/dev/null"),
        _ => (None, a.as_str(), b.as_str()),
    };

    let mut out = format!("diff --git a/{path} b/{path}\n");
    if let Some(mode_line) = mode_line {
        out.push_str(mode_line);
        out.push('\n');
    }
    out.push_str(
        &diff
            .unified_diff()
            .context_radius(3)
            .header(old_header, new_header)
            .to_string(),
    );
    (out, stat)
}
