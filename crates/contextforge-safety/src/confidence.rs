//! Per-file trust scores, clamped to [0, 100], with a reason trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Baseline score assigned when an adjustment lands on an untracked file.
pub const NEUTRAL_BASELINE: f64 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceLevel {
    /// Below 40: stop for human review.
    Critical,
    /// 40–79: re-read the file before further edits.
    Low,
    /// 80–89.
    Medium,
    /// 90 and above.
    High,
}

impl ConfidenceLevel {
    pub fn from_score(score: f64) -> Self {
        if score < 40.0 {
            ConfidenceLevel::Critical
        } else if score < 80.0 {
            ConfidenceLevel::Low
        } else if score < 90.0 {
            ConfidenceLevel::Medium
        } else {
            ConfidenceLevel::High
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConfidence {
    pub path: PathBuf,
    pub score: f64,
    pub reasons: Vec<String>,
    pub last_updated: DateTime<Utc>,
}

impl FileConfidence {
    pub fn level(&self) -> ConfidenceLevel {
        ConfidenceLevel::from_score(self.score)
    }
}

fn clamp(score: f64) -> f64 {
    score.clamp(0.0, 100.0)
}

#[derive(Debug, Default)]
pub struct ConfidenceTracker {
    scores: BTreeMap<PathBuf, FileConfidence>,
}

impl ConfidenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite with a fresh entry at the given (clamped) score.
    pub fn set_confidence(&mut self, path: &Path, score: f64, reasons: Vec<String>) {
        self.scores.insert(
            path.to_path_buf(),
            FileConfidence {
                path: path.to_path_buf(),
                score: clamp(score),
                reasons,
                last_updated: Utc::now(),
            },
        );
    }

    /// Add `delta` (clamped) and append the reason. An untracked file is
    /// treated as if it started at the neutral baseline of 50.
    pub fn adjust_confidence(&mut self, path: &Path, delta: f64, reason: &str) {
        match self.scores.get_mut(path) {
            Some(entry) => {
                entry.score = clamp(entry.score + delta);
                entry.reasons.push(reason.to_string());
                entry.last_updated = Utc::now();
            }
            None => {
                self.set_confidence(
                    path,
                    NEUTRAL_BASELINE + delta,
                    vec![reason.to_string()],
                );
            }
        }
    }

    pub fn get_confidence(&self, path: &Path) -> Option<&FileConfidence> {
        self.scores.get(path)
    }

    pub fn is_tracked(&self, path: &Path) -> bool {
        self.scores.contains_key(path)
    }

    pub fn critical_files(&self) -> Vec<&FileConfidence> {
        self.scores
            .values()
            .filter(|c| c.level() == ConfidenceLevel::Critical)
            .collect()
    }

    pub fn low_confidence_files(&self) -> Vec<&FileConfidence> {
        self.scores
            .values()
            .filter(|c| matches!(c.level(), ConfidenceLevel::Critical | ConfidenceLevel::Low))
            .collect()
    }

    /// Arithmetic mean across tracked files. Returns 100.0 when nothing is
    /// tracked — vacuous optimism, documented behavior.
    pub fn overall_confidence(&self) -> f64 {
        if self.scores.is_empty() {
            return 100.0;
        }
        self.scores.values().map(|c| c.score).sum::<f64>() / self.scores.len() as f64
    }

    /// Path → score map for result assembly.
    pub fn snapshot(&self) -> BTreeMap<String, f64> {
        self.scores
            .iter()
            .map(|(path, c)| (path.display().to_string(), c.score))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjustment_clamps_at_floor_and_ceiling() {
        let mut tracker = ConfidenceTracker::new();
        let path = Path::new("a.py");
        tracker.set_confidence(path, 100.0, vec!["Initial state".into()]);

        tracker.adjust_confidence(path, -1000.0, "x");
        assert_eq!(tracker.get_confidence(path).unwrap().score, 0.0);

        tracker.adjust_confidence(path, 1000.0, "x");
        assert_eq!(tracker.get_confidence(path).unwrap().score, 100.0);
    }

    #[test]
    fn adjusting_untracked_file_seeds_neutral_baseline() {
        let mut tracker = ConfidenceTracker::new();
        let path = Path::new("a.py");
        tracker.adjust_confidence(path, -10.0, "Moderate drift detected");
        assert_eq!(tracker.get_confidence(path).unwrap().score, 40.0);
    }

    #[test]
    fn levels_follow_thresholds() {
        assert_eq!(ConfidenceLevel::from_score(39.9), ConfidenceLevel::Critical);
        assert_eq!(ConfidenceLevel::from_score(40.0), ConfidenceLevel::Low);
        assert_eq!(ConfidenceLevel::from_score(79.9), ConfidenceLevel::Low);
        assert_eq!(ConfidenceLevel::from_score(80.0), ConfidenceLevel::Medium);
        assert_eq!(ConfidenceLevel::from_score(90.0), ConfidenceLevel::High);
    }

    #[test]
    fn critical_and_low_filters() {
        let mut tracker = ConfidenceTracker::new();
        tracker.set_confidence(Path::new("bad.py"), 10.0, vec![]);
        tracker.set_confidence(Path::new("shaky.py"), 60.0, vec![]);
        tracker.set_confidence(Path::new("good.py"), 95.0, vec![]);

        assert_eq!(tracker.critical_files().len(), 1);
        assert_eq!(tracker.low_confidence_files().len(), 2);
    }

    #[test]
    fn overall_confidence_empty_is_optimistic() {
        let tracker = ConfidenceTracker::new();
        assert_eq!(tracker.overall_confidence(), 100.0);
    }

    #[test]
    fn overall_confidence_is_mean() {
        let mut tracker = ConfidenceTracker::new();
        tracker.set_confidence(Path::new("a.py"), 100.0, vec![]);
        tracker.set_confidence(Path::new("b.py"), 50.0, vec![]);
        assert!((tracker.overall_confidence() - 75.0).abs() < f64::EPSILON);
    }

    #[test]
    fn reasons_accumulate_in_order() {
        let mut tracker = ConfidenceTracker::new();
        let path = Path::new("a.py");
        tracker.set_confidence(path, 100.0, vec!["Initial state".into()]);
        tracker.adjust_confidence(path, -10.0, "first");
        tracker.adjust_confidence(path, -10.0, "second");

        let reasons = &tracker.get_confidence(path).unwrap().reasons;
        assert_eq!(reasons, &["Initial state", "first", "second"]);
    }
}
