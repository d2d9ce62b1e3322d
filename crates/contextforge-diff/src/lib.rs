//! Line-level diff computation and application.
//!
//! A `FileDiff` is transient: computed per edit attempt against the
//! current on-disk content, applied at most once, never persisted.
//! Application is index-verified: the recorded base hash must match the
//! current content and every deleted line must still sit at its recorded
//! index, so a shifted or externally edited file can never have the wrong
//! physical line removed.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use similar::{ChangeTag, TextDiff};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineEditKind {
    Insert,
    Delete,
}

/// One line-level change. `old_index` addresses the old file: the removed
/// line's position for a delete, the insertion point for an insert. A
/// removed line immediately followed by an added line stays two entries;
/// no modify-pair merging happens at this layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineEdit {
    pub kind: LineEditKind,
    pub old_index: usize,
    pub text: String,
}

/// The set of line-level changes between a file's on-disk content and a
/// proposed replacement, plus derived counts and a rendered unified diff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDiff {
    pub path: PathBuf,
    /// SHA-256 of the content the diff was computed against.
    pub base_hash: String,
    pub new_content: String,
    pub edits: Vec<LineEdit>,
    pub additions: usize,
    pub deletions: usize,
    pub unified: String,
}

impl FileDiff {
    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct DiffEngine {
    context_lines: usize,
}

impl Default for DiffEngine {
    fn default() -> Self {
        Self { context_lines: 3 }
    }
}

impl DiffEngine {
    pub fn new(context_lines: usize) -> Self {
        Self { context_lines }
    }

    /// Compute the diff from the file's current content (empty if the file
    /// does not exist yet) to `new_content`. Returns `None` only on read
    /// failure.
    pub fn compute_diff(&self, path: &Path, new_content: &str) -> Option<FileDiff> {
        let old_content = match fs::read(path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(err) if err.kind() == ErrorKind::NotFound => String::new(),
            Err(_) => return None,
        };

        let diff = TextDiff::from_lines(old_content.as_str(), new_content);
        let mut edits = Vec::new();
        let mut additions = 0;
        let mut deletions = 0;
        for change in diff.iter_all_changes() {
            let text = change.value().trim_end_matches('\n').to_string();
            match change.tag() {
                ChangeTag::Equal => {}
                ChangeTag::Delete => {
                    deletions += 1;
                    edits.push(LineEdit {
                        kind: LineEditKind::Delete,
                        old_index: change.old_index().unwrap_or(0),
                        text,
                    });
                }
                ChangeTag::Insert => {
                    additions += 1;
                    edits.push(LineEdit {
                        kind: LineEditKind::Insert,
                        // Insertion point in the old file.
                        old_index: edits
                            .last()
                            .map(|e| e.old_index)
                            .unwrap_or_default(),
                        text,
                    });
                }
            }
        }

        let display = path.display().to_string();
        let unified = diff
            .unified_diff()
            .context_radius(self.context_lines)
            .header(&format!("a/{display}"), &format!("b/{display}"))
            .to_string();

        Some(FileDiff {
            path: path.to_path_buf(),
            base_hash: sha256_hex(old_content.as_bytes()),
            new_content: new_content.to_string(),
            edits,
            additions,
            deletions,
            unified,
        })
    }

    /// Apply a previously computed diff. The current content must still
    /// hash to the diff's `base_hash` and every deleted line must match at
    /// its recorded index; otherwise nothing is written and `false` is
    /// returned. I/O failures also return `false`; this boundary never
    /// panics or propagates errors.
    pub fn apply_diff(&self, diff: &FileDiff, dry_run: bool) -> bool {
        let current = match fs::read(&diff.path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(err) if err.kind() == ErrorKind::NotFound => String::new(),
            Err(_) => return false,
        };
        if sha256_hex(current.as_bytes()) != diff.base_hash {
            return false;
        }

        let current_lines: Vec<&str> = current.lines().collect();
        for edit in &diff.edits {
            if edit.kind == LineEditKind::Delete
                && current_lines.get(edit.old_index) != Some(&edit.text.as_str())
            {
                return false;
            }
        }

        if dry_run {
            return true;
        }
        fs::write(&diff.path, &diff.new_content).is_ok()
    }

    /// Up to `context_lines` lines before and after the 1-based
    /// `line_number`, clamped to file bounds.
    pub fn context_around_line(&self, path: &Path, line_number: usize) -> Vec<String> {
        let Ok(content) = fs::read_to_string(path) else {
            return Vec::new();
        };
        let lines: Vec<&str> = content.lines().collect();
        if lines.is_empty() || line_number == 0 {
            return Vec::new();
        }
        let center = (line_number - 1).min(lines.len() - 1);
        let start = center.saturating_sub(self.context_lines);
        let end = (center + self.context_lines + 1).min(lines.len());
        lines[start..end].iter().map(|l| l.to_string()).collect()
    }
}
