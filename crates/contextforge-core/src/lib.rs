use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub type Result<T> = anyhow::Result<T>;

pub fn runtime_dir(workspace: &Path) -> PathBuf {
    workspace.join(".contextforge")
}

/// The kind of work an operation performs. Modes are a parameter threaded
/// through one state machine, not separate state-machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    Plan,
    Implement,
    Review,
    Index,
    Test,
}

impl AgentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentMode::Plan => "plan",
            AgentMode::Implement => "implement",
            AgentMode::Review => "review",
            AgentMode::Index => "index",
            AgentMode::Test => "test",
        }
    }
}

impl fmt::Display for AgentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One proposed file edit: the workspace-relative target path and the full
/// replacement content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub new_content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanTask {
    pub description: String,
    #[serde(default)]
    pub context_files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImplementTask {
    pub target_files: Vec<String>,
    pub changes: Vec<FileChange>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewTask {
    pub files_to_review: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexTask {
    pub files_to_index: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestTask {
    #[serde(default)]
    pub test_files: Vec<String>,
    /// Override for the configured test command.
    #[serde(default)]
    pub command: Option<String>,
}

/// A fully typed task payload. Each mode carries exactly the fields it
/// needs; there is no catch-all key/value bag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum ModeTask {
    Plan(PlanTask),
    Implement(ImplementTask),
    Review(ReviewTask),
    Index(IndexTask),
    Test(TestTask),
}

impl ModeTask {
    pub fn mode(&self) -> AgentMode {
        match self {
            ModeTask::Plan(_) => AgentMode::Plan,
            ModeTask::Implement(_) => AgentMode::Implement,
            ModeTask::Review(_) => AgentMode::Review,
            ModeTask::Index(_) => AgentMode::Index,
            ModeTask::Test(_) => AgentMode::Test,
        }
    }

    /// Workspace-relative paths this task puts in scope.
    pub fn files_in_scope(&self) -> Vec<String> {
        match self {
            ModeTask::Plan(t) => t.context_files.clone(),
            ModeTask::Implement(t) => t.target_files.clone(),
            ModeTask::Review(t) => t.files_to_review.clone(),
            ModeTask::Index(t) => t.files_to_index.clone(),
            ModeTask::Test(t) => t.test_files.clone(),
        }
    }
}

/// Static ceilings for a single operation. Immutable once the operation
/// begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationLimits {
    #[serde(default = "default_max_tool_calls")]
    pub max_tool_calls: u64,
    #[serde(default = "default_max_revisions")]
    pub max_revisions: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u64,
    #[serde(default = "default_max_files_per_operation")]
    pub max_files_per_operation: u64,
    #[serde(default = "default_max_loop_iterations")]
    pub max_loop_iterations: u64,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_max_tool_calls() -> u64 {
    50
}
fn default_max_revisions() -> u64 {
    10
}
fn default_max_tokens() -> u64 {
    100_000
}
fn default_max_files_per_operation() -> u64 {
    20
}
fn default_max_loop_iterations() -> u64 {
    25
}
fn default_timeout_seconds() -> u64 {
    120
}

impl Default for OperationLimits {
    fn default() -> Self {
        Self {
            max_tool_calls: default_max_tool_calls(),
            max_revisions: default_max_revisions(),
            max_tokens: default_max_tokens(),
            max_files_per_operation: default_max_files_per_operation(),
            max_loop_iterations: default_max_loop_iterations(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

/// Utilization of one limited dimension, as a percentage of its ceiling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitUsage {
    pub dimension: String,
    pub used: u64,
    pub limit: u64,
    pub percent: f64,
}

impl LimitUsage {
    fn new(dimension: &str, used: u64, limit: u64) -> Self {
        let percent = if limit == 0 {
            100.0
        } else {
            used as f64 / limit as f64 * 100.0
        };
        Self {
            dimension: dimension.to_string(),
            used,
            limit,
            percent,
        }
    }
}

/// Live counters for the current operation. Reset at `begin_operation`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationMetrics {
    pub tool_calls: u64,
    pub revisions: u64,
    pub tokens_used: u64,
    pub files_accessed: BTreeSet<String>,
    pub loop_iterations: u64,
    pub started_at: DateTime<Utc>,
}

impl Default for OperationMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationMetrics {
    pub fn new() -> Self {
        Self {
            tool_calls: 0,
            revisions: 0,
            tokens_used: 0,
            files_accessed: BTreeSet::new(),
            loop_iterations: 0,
            started_at: Utc::now(),
        }
    }

    pub fn record_file_access(&mut self, path: &str) {
        self.files_accessed.insert(path.to_string());
    }

    /// Per-dimension usage against the given limits, in a stable order.
    pub fn utilization(&self, limits: &OperationLimits) -> Vec<LimitUsage> {
        vec![
            LimitUsage::new("tool_calls", self.tool_calls, limits.max_tool_calls),
            LimitUsage::new("revisions", self.revisions, limits.max_revisions),
            LimitUsage::new("tokens_used", self.tokens_used, limits.max_tokens),
            LimitUsage::new(
                "files_accessed",
                self.files_accessed.len() as u64,
                limits.max_files_per_operation,
            ),
            LimitUsage::new(
                "loop_iterations",
                self.loop_iterations,
                limits.max_loop_iterations,
            ),
        ]
    }
}

/// A safety-gate failure. Carried inside `OperationResult`; never raised
/// across the agent's public boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SafetyViolation {
    #[error("major drift on {path}: {detail}")]
    DriftMajor { path: String, detail: String },
    #[error("operation limits exceeded: {detail}")]
    LimitExceeded { detail: String },
    #[error("confidence critical on {path}: score {score:.1}")]
    ConfidenceCritical { path: String, score: f64 },
    #[error("non-progressing loop detected: {detail}")]
    LoopDetected { detail: String },
    #[error("i/o failure on {path}: {detail}")]
    IoFailure { path: String, detail: String },
    #[error("internal failure: {detail}")]
    Internal { detail: String },
}

/// The externally visible outcome of one `execute()` call. Immutable once
/// constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResult {
    pub operation_id: Uuid,
    pub success: bool,
    pub mode: AgentMode,
    pub files_modified: Vec<String>,
    /// Unified-diff text for every diff applied, in application order.
    pub diffs_applied: Vec<String>,
    pub drift_detected: bool,
    pub confidence_scores: BTreeMap<String, f64>,
    pub metrics: OperationMetrics,
    pub error: Option<SafetyViolation>,
    pub execution_log: Vec<String>,
    pub finished_at: DateTime<Utc>,
}

impl OperationResult {
    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(|e| e.to_string())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Workspace configuration, loaded from `<runtime_dir>/settings.json` with
/// overlay merge: defaults first, then the settings file, then
/// `settings.local.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub limits: OperationLimits,
    /// Command TEST mode shells out to.
    #[serde(default = "default_test_command")]
    pub test_command: String,
    /// Lines of context returned around a line by the diff engine.
    #[serde(default = "default_diff_context_lines")]
    pub diff_context_lines: usize,
    /// Mtime tolerance, in seconds, for the fingerprint fast path.
    #[serde(default = "default_drift_mtime_tolerance_seconds")]
    pub drift_mtime_tolerance_seconds: f64,
    /// Identical canonicalized states before the loop detector fires.
    #[serde(default = "default_max_identical_states")]
    pub max_identical_states: usize,
    #[serde(default)]
    pub verbose: bool,
}

fn default_test_command() -> String {
    "pytest".to_string()
}
fn default_diff_context_lines() -> usize {
    3
}
fn default_drift_mtime_tolerance_seconds() -> f64 {
    2.0
}
fn default_max_identical_states() -> usize {
    3
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            limits: OperationLimits::default(),
            test_command: default_test_command(),
            diff_context_lines: default_diff_context_lines(),
            drift_mtime_tolerance_seconds: default_drift_mtime_tolerance_seconds(),
            max_identical_states: default_max_identical_states(),
            verbose: false,
        }
    }
}

impl AppConfig {
    pub fn settings_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("settings.json")
    }

    pub fn local_settings_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("settings.local.json")
    }

    pub fn load(workspace: &Path) -> Result<Self> {
        let mut merged = serde_json::to_value(Self::default())?;
        for path in [
            Self::settings_path(workspace),
            Self::local_settings_path(workspace),
        ] {
            if !path.exists() {
                continue;
            }
            let raw = fs::read_to_string(path)?;
            let value: serde_json::Value = serde_json::from_str(&raw)?;
            merge_json_value(&mut merged, &value);
        }
        Ok(serde_json::from_value(merged)?)
    }

    /// Load if any settings file exists, otherwise write defaults and
    /// return them.
    pub fn ensure(workspace: &Path) -> Result<Self> {
        let path = Self::settings_path(workspace);
        if path.exists() || Self::local_settings_path(workspace).exists() {
            return Self::load(workspace);
        }
        fs::create_dir_all(
            path.parent()
                .ok_or_else(|| anyhow::anyhow!("invalid settings path"))?,
        )?;
        let cfg = Self::default();
        cfg.save(workspace)?;
        Ok(cfg)
    }

    pub fn save(&self, workspace: &Path) -> Result<()> {
        let path = Self::settings_path(workspace);
        fs::create_dir_all(
            path.parent()
                .ok_or_else(|| anyhow::anyhow!("invalid settings path"))?,
        )?;
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

fn merge_json_value(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_obj), serde_json::Value::Object(overlay_obj)) => {
            for (key, overlay_value) in overlay_obj {
                if let Some(base_value) = base_obj.get_mut(key) {
                    merge_json_value(base_value, overlay_value);
                } else {
                    base_obj.insert(key.clone(), overlay_value.clone());
                }
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_round_trips_through_serde() {
        for mode in [
            AgentMode::Plan,
            AgentMode::Implement,
            AgentMode::Review,
            AgentMode::Index,
            AgentMode::Test,
        ] {
            let json = serde_json::to_string(&mode).unwrap();
            assert_eq!(json, format!("\"{}\"", mode.as_str()));
            let back: AgentMode = serde_json::from_str(&json).unwrap();
            assert_eq!(back, mode);
        }
    }

    #[test]
    fn mode_task_reports_mode_and_scope() {
        let task = ModeTask::Implement(ImplementTask {
            target_files: vec!["a.py".into(), "b.py".into()],
            changes: vec![],
        });
        assert_eq!(task.mode(), AgentMode::Implement);
        assert_eq!(task.files_in_scope(), vec!["a.py", "b.py"]);
    }

    #[test]
    fn mode_task_serializes_with_mode_tag() {
        let task = ModeTask::Test(TestTask {
            test_files: vec!["tests/test_a.py".into()],
            command: None,
        });
        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["mode"], "test");
        assert_eq!(value["test_files"][0], "tests/test_a.py");

        let back: ModeTask = serde_json::from_value(value).unwrap();
        assert_eq!(back.mode(), AgentMode::Test);
    }

    #[test]
    fn metrics_utilization_against_limits() {
        let limits = OperationLimits {
            max_tool_calls: 10,
            ..OperationLimits::default()
        };
        let mut metrics = OperationMetrics::new();
        metrics.tool_calls = 8;
        let usage = metrics.utilization(&limits);
        let tool_calls = usage.iter().find(|u| u.dimension == "tool_calls").unwrap();
        assert!((tool_calls.percent - 80.0).abs() < f64::EPSILON);
    }

    #[test]
    fn utilization_with_zero_limit_is_full() {
        let limits = OperationLimits {
            max_revisions: 0,
            ..OperationLimits::default()
        };
        let metrics = OperationMetrics::new();
        let usage = metrics.utilization(&limits);
        let revisions = usage.iter().find(|u| u.dimension == "revisions").unwrap();
        assert!(revisions.percent >= 100.0);
    }

    #[test]
    fn safety_violation_messages_are_stable() {
        let violation = SafetyViolation::DriftMajor {
            path: "a.py".into(),
            detail: "symbols changed".into(),
        };
        assert_eq!(violation.to_string(), "major drift on a.py: symbols changed");
    }

    #[test]
    fn config_ensure_writes_defaults_then_loads() {
        let ws = tempfile::tempdir().unwrap();
        let cfg = AppConfig::ensure(ws.path()).unwrap();
        assert_eq!(cfg.test_command, "pytest");
        assert!(AppConfig::settings_path(ws.path()).exists());

        // Second call loads the persisted file.
        let again = AppConfig::ensure(ws.path()).unwrap();
        assert_eq!(again.limits, cfg.limits);
    }

    #[test]
    fn config_local_settings_overlay_wins() {
        let ws = tempfile::tempdir().unwrap();
        AppConfig::default().save(ws.path()).unwrap();
        fs::write(
            AppConfig::local_settings_path(ws.path()),
            r#"{"test_command": "cargo test", "limits": {"max_revisions": 3}}"#,
        )
        .unwrap();

        let cfg = AppConfig::load(ws.path()).unwrap();
        assert_eq!(cfg.test_command, "cargo test");
        assert_eq!(cfg.limits.max_revisions, 3);
        // Untouched keys keep their defaults.
        assert_eq!(cfg.limits.max_tool_calls, 50);
    }
}
