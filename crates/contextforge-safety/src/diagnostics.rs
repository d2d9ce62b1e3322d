//! The combined drift + confidence + limit review run before any
//! state-mutating operation.
//!
//! Diagnostics are pure functions of current state plus the shared mutable
//! trackers the agent passes in — no network, no model calls — so the
//! safety gate stays deterministic and auditable regardless of any backend.

use crate::confidence::{ConfidenceLevel, ConfidenceTracker};
use chrono::{DateTime, Utc};
use contextforge_core::{AgentMode, OperationLimits, OperationMetrics};
use contextforge_drift::{DriftDetector, DriftSeverity};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};

/// Bookkeeping confidence penalty for moderate drift.
const MODERATE_DRIFT_PENALTY: f64 = -10.0;
/// Bookkeeping confidence penalty for major drift (or a missing file).
const MAJOR_DRIFT_PENALTY: f64 = -30.0;
/// Warning band starts at this fraction of any limit.
const LIMIT_WARNING_PERCENT: f64 = 80.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

/// One diagnostic check's verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticResult {
    pub passed: bool,
    pub severity: DiagnosticSeverity,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl DiagnosticResult {
    fn new(
        passed: bool,
        severity: DiagnosticSeverity,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> Self {
        Self {
            passed,
            severity,
            message: message.into(),
            details,
            timestamp: Utc::now(),
        }
    }
}

/// Composes drift, confidence, and limit checks into a single reviewable
/// verdict stream. Owns only the audit trail; the trackers it inspects are
/// owned by the agent and passed into each check.
#[derive(Debug, Default)]
pub struct InternalDiagnosticAgent {
    diagnostic_history: Vec<DiagnosticResult>,
}

impl InternalDiagnosticAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full audit trail, append-only: never pruned or rewritten.
    pub fn history(&self) -> &[DiagnosticResult] {
        &self.diagnostic_history
    }

    fn record(&mut self, result: DiagnosticResult) -> DiagnosticResult {
        self.diagnostic_history.push(result.clone());
        result
    }

    /// Drift check for one file: registers it if untracked, scans it, and
    /// applies the bookkeeping confidence penalty on drift.
    pub fn check_drift(
        &mut self,
        detector: &mut DriftDetector,
        tracker: &mut ConfidenceTracker,
        path: &Path,
    ) -> DiagnosticResult {
        // A file that was never tracked and is not on disk yet is about to
        // be created; there is nothing to drift against.
        if !detector.is_registered(path) && !detector.register_file(path, None) {
            return self.record(DiagnosticResult::new(
                true,
                DiagnosticSeverity::Info,
                format!("{} not yet present; nothing to compare", path.display()),
                None,
            ));
        }

        let scan = detector.detect_drift(Some(std::slice::from_ref(&path.to_path_buf())));
        if !scan.missing_files.is_empty() {
            tracker.adjust_confidence(path, MAJOR_DRIFT_PENALTY, "Major drift detected");
            return self.record(DiagnosticResult::new(
                false,
                DiagnosticSeverity::Error,
                format!("{} no longer exists", path.display()),
                None,
            ));
        }

        let result = match scan.max_severity() {
            DriftSeverity::None | DriftSeverity::Minor => DiagnosticResult::new(
                true,
                DiagnosticSeverity::Info,
                format!("no drift on {}", path.display()),
                None,
            ),
            DriftSeverity::Moderate => {
                tracker.adjust_confidence(path, MODERATE_DRIFT_PENALTY, "Moderate drift detected");
                DiagnosticResult::new(
                    true,
                    DiagnosticSeverity::Warning,
                    format!("moderate drift on {}: content changed", path.display()),
                    drift_details(&scan),
                )
            }
            DriftSeverity::Major => {
                tracker.adjust_confidence(path, MAJOR_DRIFT_PENALTY, "Major drift detected");
                DiagnosticResult::new(
                    false,
                    DiagnosticSeverity::Error,
                    format!("major drift on {}: symbols changed", path.display()),
                    drift_details(&scan),
                )
            }
        };
        self.record(result)
    }

    /// Confidence check for one file. An explicit score overrides the
    /// tracked one first; an untracked file is initialized at 50.0.
    pub fn check_confidence(
        &mut self,
        tracker: &mut ConfidenceTracker,
        path: &Path,
        explicit: Option<f64>,
    ) -> DiagnosticResult {
        if let Some(score) = explicit {
            tracker.set_confidence(path, score, vec!["Explicit confidence signal".to_string()]);
        } else if !tracker.is_tracked(path) {
            tracker.set_confidence(path, 50.0, vec!["Initialized untracked file".to_string()]);
        }

        let score = tracker
            .get_confidence(path)
            .map(|entry| entry.score)
            .unwrap_or(50.0);
        let result = match ConfidenceLevel::from_score(score) {
            ConfidenceLevel::High | ConfidenceLevel::Medium => DiagnosticResult::new(
                true,
                DiagnosticSeverity::Info,
                format!("confidence {:.1} on {}", score, path.display()),
                None,
            ),
            ConfidenceLevel::Low => DiagnosticResult::new(
                true,
                DiagnosticSeverity::Warning,
                format!(
                    "confidence {:.1} on {}: re-read recommended before editing",
                    score,
                    path.display()
                ),
                None,
            ),
            ConfidenceLevel::Critical => DiagnosticResult::new(
                false,
                DiagnosticSeverity::Critical,
                format!(
                    "confidence {:.1} on {}: human review required",
                    score,
                    path.display()
                ),
                None,
            ),
        };
        self.record(result)
    }

    /// Compare every live counter against its ceiling: any dimension at
    /// 100% fails the check; any at 80% produces a warning.
    pub fn check_loop_limits(
        &mut self,
        metrics: &OperationMetrics,
        limits: &OperationLimits,
    ) -> DiagnosticResult {
        let usage = metrics.utilization(limits);
        let violated: Vec<String> = usage
            .iter()
            .filter(|u| u.percent >= 100.0)
            .map(|u| format!("{} {}/{}", u.dimension, u.used, u.limit))
            .collect();
        let near: Vec<String> = usage
            .iter()
            .filter(|u| u.percent >= LIMIT_WARNING_PERCENT && u.percent < 100.0)
            .map(|u| format!("{} {}/{}", u.dimension, u.used, u.limit))
            .collect();

        let result = if !violated.is_empty() {
            DiagnosticResult::new(
                false,
                DiagnosticSeverity::Error,
                format!("operation limits exceeded: {}", violated.join(", ")),
                Some(json!({ "violated": violated })),
            )
        } else if !near.is_empty() {
            DiagnosticResult::new(
                true,
                DiagnosticSeverity::Warning,
                format!("approaching operation limits: {}", near.join(", ")),
                Some(json!({ "near_limit": near })),
            )
        } else {
            DiagnosticResult::new(
                true,
                DiagnosticSeverity::Info,
                "all counters within limits",
                None,
            )
        };
        self.record(result)
    }

    /// Full review: drift checks for every file, then confidence checks for
    /// every file, then one aggregate limits check. Not interleaved per
    /// file — all drift scans complete before any confidence check runs.
    #[allow(clippy::too_many_arguments)]
    pub fn review_task(
        &mut self,
        detector: &mut DriftDetector,
        tracker: &mut ConfidenceTracker,
        files: &[PathBuf],
        metrics: &OperationMetrics,
        limits: &OperationLimits,
        mode: AgentMode,
    ) -> Vec<DiagnosticResult> {
        let mut results = Vec::with_capacity(files.len() * 2 + 1);
        for path in files {
            results.push(self.check_drift(detector, tracker, path));
        }
        for path in files {
            results.push(self.check_confidence(tracker, path, None));
        }
        let mut limits_result = self.check_loop_limits(metrics, limits);
        limits_result.message = format!("[{mode}] {}", limits_result.message);
        results.push(limits_result);
        results
    }

    /// True iff any result failed with error or critical severity.
    pub fn has_critical_issues(results: &[DiagnosticResult]) -> bool {
        results.iter().any(|r| {
            !r.passed
                && matches!(
                    r.severity,
                    DiagnosticSeverity::Error | DiagnosticSeverity::Critical
                )
        })
    }
}

fn drift_details(scan: &contextforge_drift::DriftDetectionResult) -> Option<serde_json::Value> {
    scan.drifted_files.first().map(|event| {
        json!({
            "expected_hash": event.expected_hash,
            "actual_hash": event.actual_hash,
            "added_symbols": event.added_symbols(),
            "removed_symbols": event.removed_symbols(),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn workspace() -> tempfile::TempDir {
        tempfile::tempdir().expect("tempdir")
    }

    #[test]
    fn drift_check_registers_untracked_file() {
        let ws = workspace();
        let file = ws.path().join("a.py");
        fs::write(&file, "def f(): pass\n").unwrap();

        let mut diagnostics = InternalDiagnosticAgent::new();
        let mut detector = DriftDetector::new();
        let mut tracker = ConfidenceTracker::new();

        let result = diagnostics.check_drift(&mut detector, &mut tracker, &file);
        assert!(result.passed);
        assert_eq!(result.severity, DiagnosticSeverity::Info);
        assert!(detector.is_registered(&file));
    }

    #[test]
    fn moderate_drift_warns_and_penalizes_ten() {
        let ws = workspace();
        let file = ws.path().join("a.py");
        fs::write(&file, "def f():\n    return \"one\"\n").unwrap();

        let mut diagnostics = InternalDiagnosticAgent::new();
        let mut detector = DriftDetector::new();
        let mut tracker = ConfidenceTracker::new();
        detector.register_file(&file, None);
        tracker.set_confidence(&file, 100.0, vec!["Initial state".into()]);

        fs::write(&file, "def f():\n    return \"two\"\n").unwrap();
        let result = diagnostics.check_drift(&mut detector, &mut tracker, &file);
        assert!(result.passed);
        assert_eq!(result.severity, DiagnosticSeverity::Warning);
        assert_eq!(tracker.get_confidence(&file).unwrap().score, 90.0);
    }

    #[test]
    fn major_drift_fails_and_penalizes_thirty() {
        let ws = workspace();
        let file = ws.path().join("a.py");
        fs::write(&file, "def f(): pass\n").unwrap();

        let mut diagnostics = InternalDiagnosticAgent::new();
        let mut detector = DriftDetector::new();
        let mut tracker = ConfidenceTracker::new();
        detector.register_file(&file, None);
        tracker.set_confidence(&file, 100.0, vec!["Initial state".into()]);

        fs::write(&file, "def g(): pass\n").unwrap();
        let result = diagnostics.check_drift(&mut detector, &mut tracker, &file);
        assert!(!result.passed);
        assert_eq!(result.severity, DiagnosticSeverity::Error);
        assert_eq!(tracker.get_confidence(&file).unwrap().score, 70.0);
    }

    #[test]
    fn confidence_check_initializes_untracked_at_fifty() {
        let mut diagnostics = InternalDiagnosticAgent::new();
        let mut tracker = ConfidenceTracker::new();
        let path = Path::new("a.py");

        let result = diagnostics.check_confidence(&mut tracker, path, None);
        assert!(result.passed);
        assert_eq!(result.severity, DiagnosticSeverity::Warning);
        assert_eq!(tracker.get_confidence(path).unwrap().score, 50.0);
    }

    #[test]
    fn explicit_confidence_signal_is_applied_first() {
        let mut diagnostics = InternalDiagnosticAgent::new();
        let mut tracker = ConfidenceTracker::new();
        let path = Path::new("a.py");

        let result = diagnostics.check_confidence(&mut tracker, path, Some(20.0));
        assert!(!result.passed);
        assert_eq!(result.severity, DiagnosticSeverity::Critical);
        assert!(result.message.contains("human review required"));
    }

    #[test]
    fn limits_pass_warn_and_fail_bands() {
        let mut diagnostics = InternalDiagnosticAgent::new();
        let limits = OperationLimits {
            max_tool_calls: 10,
            ..OperationLimits::default()
        };
        let mut metrics = OperationMetrics::new();

        metrics.tool_calls = 5;
        assert!(diagnostics.check_loop_limits(&metrics, &limits).passed);

        metrics.tool_calls = 8;
        let warning = diagnostics.check_loop_limits(&metrics, &limits);
        assert!(warning.passed);
        assert_eq!(warning.severity, DiagnosticSeverity::Warning);

        metrics.tool_calls = 10;
        let violation = diagnostics.check_loop_limits(&metrics, &limits);
        assert!(!violation.passed);
        assert!(violation.message.contains("tool_calls 10/10"));
    }

    #[test]
    fn review_runs_drift_before_confidence_then_limits() {
        let ws = workspace();
        let a = ws.path().join("a.py");
        let b = ws.path().join("b.py");
        fs::write(&a, "def f(): pass\n").unwrap();
        fs::write(&b, "def g(): pass\n").unwrap();

        let mut diagnostics = InternalDiagnosticAgent::new();
        let mut detector = DriftDetector::new();
        let mut tracker = ConfidenceTracker::new();
        let limits = OperationLimits::default();
        let metrics = OperationMetrics::new();

        let results = diagnostics.review_task(
            &mut detector,
            &mut tracker,
            &[a.clone(), b.clone()],
            &metrics,
            &limits,
            AgentMode::Review,
        );
        // 2 drift + 2 confidence + 1 limits, in that order.
        assert_eq!(results.len(), 5);
        assert!(results[0].message.contains("drift"));
        assert!(results[1].message.contains("drift"));
        assert!(results[2].message.contains("confidence"));
        assert!(results[3].message.contains("confidence"));
        assert!(results[4].message.contains("[review]"));
        assert!(!InternalDiagnosticAgent::has_critical_issues(&results));
    }

    #[test]
    fn history_is_append_only_across_checks() {
        let mut diagnostics = InternalDiagnosticAgent::new();
        let mut tracker = ConfidenceTracker::new();
        let limits = OperationLimits::default();
        let metrics = OperationMetrics::new();

        for i in 0..4 {
            if i % 2 == 0 {
                diagnostics.check_confidence(&mut tracker, Path::new("a.py"), None);
            } else {
                diagnostics.check_loop_limits(&metrics, &limits);
            }
        }
        assert_eq!(diagnostics.history().len(), 4);
    }

    #[test]
    fn untracked_nonexistent_file_passes_as_pending_creation() {
        let ws = workspace();
        let file = ws.path().join("new.py");

        let mut diagnostics = InternalDiagnosticAgent::new();
        let mut detector = DriftDetector::new();
        let mut tracker = ConfidenceTracker::new();

        let result = diagnostics.check_drift(&mut detector, &mut tracker, &file);
        assert!(result.passed);
        assert_eq!(result.severity, DiagnosticSeverity::Info);
        assert!(!detector.is_registered(&file));
    }

    #[test]
    fn missing_file_drift_check_is_an_error() {
        let ws = workspace();
        let file = ws.path().join("gone.py");
        fs::write(&file, "def f(): pass\n").unwrap();

        let mut diagnostics = InternalDiagnosticAgent::new();
        let mut detector = DriftDetector::new();
        let mut tracker = ConfidenceTracker::new();
        detector.register_file(&file, None);
        tracker.set_confidence(&file, 100.0, vec![]);

        fs::remove_file(&file).unwrap();
        let result = diagnostics.check_drift(&mut detector, &mut tracker, &file);
        assert!(!result.passed);
        assert_eq!(tracker.get_confidence(&file).unwrap().score, 70.0);
    }
}
