//! The drift-safe multi-mode agent execution loop.
//!
//! One `MultiModeAgent` runs one operation at a time: begin registers
//! fingerprints and seed confidence for the files in scope, a drift check
//! and conditional re-ground bring the agent onto the freshest state, the
//! safety gate (drift + confidence + limits + loop detection) decides
//! whether to proceed, and only then do diffs get applied — with a second
//! gate immediately before every write. Conflicting edits from outside the
//! agent's write path are detected by content hash, not prevented by
//! locking.

mod shell;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use contextforge_core::{
    AgentMode, AppConfig, ImplementTask, IndexTask, ModeTask, OperationLimits, OperationMetrics,
    OperationResult, PlanTask, ReviewTask, SafetyViolation, TestTask,
};
use contextforge_diff::{DiffEngine, FileDiff};
use contextforge_drift::{DriftDetectionResult, DriftDetector, DriftSeverity};
use contextforge_observe::Observer;
use contextforge_safety::{
    ConfidenceTracker, DiagnosticResult, InternalDiagnosticAgent, LoopDetector,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub use shell::{PlatformShellRunner, ShellRunResult, ShellRunner};

/// Typed outcome of a TEST-mode subprocess run. Lives on the context, not
/// on `OperationResult` — test outcomes are deliberately less structured
/// than diff outcomes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestOutcome {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

/// Live state of one in-progress operation. Exactly one may exist per
/// agent; created by `begin_operation`, consumed by `end_operation`.
#[derive(Debug)]
pub struct ModeContext {
    pub mode: AgentMode,
    pub files_in_scope: BTreeSet<PathBuf>,
    pub plan: Option<String>,
    pub review_findings: Vec<String>,
    pub index_summary: BTreeMap<String, usize>,
    pub test_outcome: Option<TestOutcome>,
    pub planned_diffs: Vec<FileDiff>,
    pub files_modified: Vec<String>,
    pub diffs_applied: Vec<String>,
    pub drift_detected: bool,
    pub execution_log: Vec<String>,
    pub started_at: DateTime<Utc>,
}

impl ModeContext {
    fn new(mode: AgentMode) -> Self {
        Self {
            mode,
            files_in_scope: BTreeSet::new(),
            plan: None,
            review_findings: Vec::new(),
            index_summary: BTreeMap::new(),
            test_outcome: None,
            planned_diffs: Vec::new(),
            files_modified: Vec::new(),
            diffs_applied: Vec::new(),
            drift_detected: false,
            execution_log: Vec::new(),
            started_at: Utc::now(),
        }
    }

    fn log(&mut self, msg: impl Into<String>) {
        self.execution_log
            .push(format!("{} {}", Utc::now().to_rfc3339(), msg.into()));
    }
}

/// Per-operation state machine over PLAN / IMPLEMENT / REVIEW / INDEX /
/// TEST. The drift detector, confidence tracker, loop detector, and
/// diagnostics live for the agent's lifetime; context and metrics are
/// reset per operation, so trust accumulates across operations while loop
/// detection never does.
pub struct MultiModeAgent {
    workspace: PathBuf,
    config: AppConfig,
    limits: OperationLimits,
    drift: DriftDetector,
    confidence: ConfidenceTracker,
    loops: LoopDetector,
    diagnostics: InternalDiagnosticAgent,
    diff_engine: DiffEngine,
    observer: Observer,
    runner: Arc<dyn ShellRunner + Send + Sync>,
    context: Option<ModeContext>,
    metrics: OperationMetrics,
    last_mode: AgentMode,
}

impl MultiModeAgent {
    pub fn new(workspace: &Path) -> Result<Self> {
        let config = AppConfig::ensure(workspace)?;
        Self::with_runner(workspace, config, Arc::new(PlatformShellRunner))
    }

    pub fn with_config(workspace: &Path, config: AppConfig) -> Result<Self> {
        Self::with_runner(workspace, config, Arc::new(PlatformShellRunner))
    }

    pub fn with_runner(
        workspace: &Path,
        config: AppConfig,
        runner: Arc<dyn ShellRunner + Send + Sync>,
    ) -> Result<Self> {
        let mut observer = Observer::new(workspace)?;
        observer.set_verbose(config.verbose);
        Ok(Self {
            workspace: workspace.to_path_buf(),
            limits: config.limits,
            loops: LoopDetector::new(config.max_identical_states),
            diff_engine: DiffEngine::new(config.diff_context_lines),
            config,
            drift: DriftDetector::new(),
            confidence: ConfidenceTracker::new(),
            diagnostics: InternalDiagnosticAgent::new(),
            observer,
            runner,
            context: None,
            metrics: OperationMetrics::new(),
            last_mode: AgentMode::Plan,
        })
    }

    pub fn diagnostic_history(&self) -> &[DiagnosticResult] {
        self.diagnostics.history()
    }

    pub fn confidence_tracker(&self) -> &ConfidenceTracker {
        &self.confidence
    }

    pub fn drift_detector(&self) -> &DriftDetector {
        &self.drift
    }

    pub fn context(&self) -> Option<&ModeContext> {
        self.context.as_ref()
    }

    fn resolve(&self, rel: &str) -> PathBuf {
        let p = Path::new(rel);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.workspace.join(p)
        }
    }

    fn rel_display(&self, path: &Path) -> String {
        path.strip_prefix(&self.workspace)
            .unwrap_or(path)
            .display()
            .to_string()
    }

    fn ctx_mut(&mut self) -> Result<&mut ModeContext> {
        self.context
            .as_mut()
            .ok_or_else(|| anyhow!("no operation in progress"))
    }

    /// Switch mode, build a fresh context, reset metrics and loop
    /// detection, and register fingerprint + initial confidence for every
    /// in-scope file that exists. Files not yet on disk are silently
    /// skipped — they are about to be created.
    pub fn begin_operation(&mut self, mode: AgentMode, files: &[String]) -> Result<()> {
        self.last_mode = mode;
        self.metrics = OperationMetrics::new();
        self.loops.reset();

        let mut ctx = ModeContext::new(mode);
        for rel in files {
            let path = self.resolve(rel);
            self.metrics.record_file_access(rel);
            if path.exists() {
                self.drift.register_file(&path, None);
                self.confidence
                    .set_confidence(&path, 100.0, vec!["Initial state".to_string()]);
            }
            ctx.files_in_scope.insert(path);
        }
        ctx.log(format!(
            "begin {mode} operation over {} file(s)",
            files.len()
        ));
        self.observer
            .record_event(&format!("begin {mode} ({} files)", files.len()))?;
        self.context = Some(ctx);
        Ok(())
    }

    /// Drift scan over the context scope (or an explicit subset), applying
    /// the agent's own pre-edit confidence penalties on top of whatever the
    /// diagnostic agent's bookkeeping has already charged.
    pub fn check_drift(&mut self, files: Option<&[PathBuf]>) -> DriftDetectionResult {
        let scope: Vec<PathBuf> = match files {
            Some(f) => f.to_vec(),
            None => self
                .context
                .as_ref()
                .map(|c| c.files_in_scope.iter().cloned().collect())
                .unwrap_or_default(),
        };
        self.metrics.tool_calls += 1;
        let result = self.drift.detect_drift(Some(&scope));

        for event in &result.drifted_files {
            match event.severity {
                DriftSeverity::Major => self.confidence.set_confidence(
                    &event.file_path,
                    0.0,
                    vec!["Major drift: trust revoked".to_string()],
                ),
                DriftSeverity::Moderate => self.confidence.adjust_confidence(
                    &event.file_path,
                    -50.0,
                    "Moderate drift before edit",
                ),
                DriftSeverity::Minor => self.confidence.adjust_confidence(
                    &event.file_path,
                    -20.0,
                    "Minor drift before edit",
                ),
                DriftSeverity::None => {}
            }
        }
        for path in &result.missing_files {
            self.confidence
                .set_confidence(path, 0.0, vec!["File missing".to_string()]);
        }

        if result.has_drift() {
            let summary = format!(
                "drift detected: {} drifted, {} missing",
                result.drifted_files.len(),
                result.missing_files.len()
            );
            if let Some(ctx) = self.context.as_mut() {
                ctx.drift_detected = true;
                ctx.log(summary.clone());
            }
            self.observer.verbose_log(&summary);
        }
        result
    }

    /// Accept external changes on the given files: re-capture their
    /// fingerprints and restore confidence to 100.0. History before the
    /// drift is superseded, not merged. Missing files drop to 0.0.
    pub fn scoped_reground(&mut self, drifted_files: &[PathBuf]) {
        for path in drifted_files {
            let msg = if path.exists() && self.drift.update_fingerprint(path, None) {
                self.confidence
                    .set_confidence(path, 100.0, vec!["Re-grounded".to_string()]);
                format!("re-grounded {}", self.rel_display(path))
            } else {
                self.confidence
                    .set_confidence(path, 0.0, vec!["File missing".to_string()]);
                format!("cannot re-ground {}: missing", self.rel_display(path))
            };
            if let Some(ctx) = self.context.as_mut() {
                ctx.log(msg);
            }
        }
    }

    /// The full diagnostic review over the operation scope, plus one extra
    /// loop-detector check over (mode, sorted scope, loop_iterations).
    /// Returns the violation when unsafe; never panics or errors.
    pub fn check_safety(&mut self) -> Option<SafetyViolation> {
        let (mode, scope) = match self.context.as_ref() {
            Some(ctx) => (
                ctx.mode,
                ctx.files_in_scope.iter().cloned().collect::<Vec<_>>(),
            ),
            None => (self.last_mode, Vec::new()),
        };

        let results = self.diagnostics.review_task(
            &mut self.drift,
            &mut self.confidence,
            &scope,
            &self.metrics,
            &self.limits,
            mode,
        );
        if InternalDiagnosticAgent::has_critical_issues(&results) {
            return Some(self.classify_failures(&results, &scope));
        }

        // Independent of and additional to the diagnostic agent's checks.
        let mut state = BTreeMap::new();
        state.insert("mode".to_string(), mode.as_str().to_string());
        state.insert(
            "files".to_string(),
            scope
                .iter()
                .map(|p| self.rel_display(p))
                .collect::<Vec<_>>()
                .join(","),
        );
        state.insert(
            "loop_iterations".to_string(),
            self.metrics.loop_iterations.to_string(),
        );
        if self.loops.record_state(&state) {
            return Some(SafetyViolation::LoopDetected {
                detail: format!(
                    "identical {mode} state repeated {} times without progress",
                    self.config.max_identical_states
                ),
            });
        }
        None
    }

    fn classify_failures(
        &self,
        results: &[DiagnosticResult],
        scope: &[PathBuf],
    ) -> SafetyViolation {
        let detail = results
            .iter()
            .filter(|r| !r.passed)
            .map(|r| r.message.clone())
            .collect::<Vec<_>>()
            .join("; ");

        if self
            .metrics
            .utilization(&self.limits)
            .iter()
            .any(|u| u.percent >= 100.0)
        {
            return SafetyViolation::LimitExceeded { detail };
        }
        if let Some(worst) = self
            .confidence
            .critical_files()
            .into_iter()
            .min_by(|a, b| {
                a.score
                    .partial_cmp(&b.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
        {
            return SafetyViolation::ConfidenceCritical {
                path: self.rel_display(&worst.path),
                score: worst.score,
            };
        }
        if let Some(path) = scope
            .iter()
            .find(|p| self.drift.is_registered(p) && !p.exists())
        {
            return SafetyViolation::DriftMajor {
                path: self.rel_display(path),
                detail,
            };
        }
        if let Some(event) = self
            .drift
            .drift_history()
            .iter()
            .rev()
            .find(|e| e.severity == DriftSeverity::Major)
        {
            return SafetyViolation::DriftMajor {
                path: self.rel_display(&event.file_path),
                detail,
            };
        }
        SafetyViolation::Internal { detail }
    }

    /// Compute a diff against the freshest known state: any drift on the
    /// target is re-grounded first so the diff never addresses a stale
    /// snapshot. Records the result on the context's planned-diffs list.
    pub fn prepare_diff(&mut self, rel: &str, new_content: &str) -> Option<FileDiff> {
        let path = self.resolve(rel);
        if self.drift.is_registered(&path) {
            let scan = self.check_drift(Some(std::slice::from_ref(&path)));
            if scan.has_drift() {
                let drifted: Vec<PathBuf> = scan
                    .drifted_files
                    .iter()
                    .map(|e| e.file_path.clone())
                    .chain(scan.missing_files.iter().cloned())
                    .collect();
                self.scoped_reground(&drifted);
            }
        }

        self.metrics.tool_calls += 1;
        let diff = self.diff_engine.compute_diff(&path, new_content)?;
        let summary = format!(
            "prepared diff for {}: +{} -{}",
            rel, diff.additions, diff.deletions
        );
        if let Some(ctx) = self.context.as_mut() {
            ctx.planned_diffs.push(diff.clone());
            ctx.log(summary);
        }
        Some(diff)
    }

    /// Apply a prepared diff. Returns `false` on any safety failure,
    /// baseline mismatch, or I/O failure; never panics.
    pub fn apply_diff(&mut self, diff: &FileDiff, dry_run: bool) -> bool {
        match self.try_apply_diff(diff, dry_run) {
            Ok(()) => true,
            Err(violation) => {
                let msg = format!("apply aborted: {violation}");
                if let Some(ctx) = self.context.as_mut() {
                    ctx.log(msg.clone());
                }
                self.observer.warn_log(&msg);
                false
            }
        }
    }

    fn try_apply_diff(&mut self, diff: &FileDiff, dry_run: bool) -> Result<(), SafetyViolation> {
        // Second safety gate, immediately before the write. Distinct from
        // the gate in the mode handler: time has passed since then.
        if let Some(violation) = self.check_safety() {
            return Err(violation);
        }

        // A file that changed between diff preparation and application is
        // too risky to patch; no re-ground attempt at this point.
        if self.drift.is_registered(&diff.path) {
            self.metrics.tool_calls += 1;
            let scan = self
                .drift
                .detect_drift(Some(std::slice::from_ref(&diff.path)));
            if !scan.missing_files.is_empty() || scan.max_severity() == DriftSeverity::Major {
                return Err(SafetyViolation::DriftMajor {
                    path: self.rel_display(&diff.path),
                    detail: "file changed between diff preparation and application".to_string(),
                });
            }
        }

        self.metrics.tool_calls += 1;
        if !self.diff_engine.apply_diff(diff, dry_run) {
            return Err(SafetyViolation::IoFailure {
                path: self.rel_display(&diff.path),
                detail: "diff application failed (baseline mismatch or write error)".to_string(),
            });
        }

        if !dry_run {
            // Close the loop: the just-written state is the new baseline.
            self.drift.update_fingerprint(&diff.path, None);
            self.metrics.revisions += 1;
            let rel = self.rel_display(&diff.path);
            let unified = diff.unified.clone();
            if let Some(ctx) = self.context.as_mut() {
                ctx.files_modified.push(rel.clone());
                ctx.diffs_applied.push(unified);
                ctx.log(format!("applied diff to {rel}"));
            }
        }
        Ok(())
    }

    /// Assemble the operation result and return the agent to the
    /// no-operation state.
    pub fn end_operation(
        &mut self,
        success: bool,
        error: Option<SafetyViolation>,
    ) -> OperationResult {
        match self.context.take() {
            Some(mut ctx) => {
                ctx.log(format!("end {} operation: success={success}", ctx.mode));
                let _ = self
                    .observer
                    .record_event(&format!("end {}: success={success}", ctx.mode));

                let confidence_scores: BTreeMap<String, f64> = ctx
                    .files_in_scope
                    .iter()
                    .filter_map(|path| {
                        self.confidence
                            .get_confidence(path)
                            .map(|c| (self.rel_display(path), c.score))
                    })
                    .collect();

                OperationResult {
                    operation_id: Uuid::now_v7(),
                    success,
                    mode: ctx.mode,
                    files_modified: ctx.files_modified,
                    diffs_applied: ctx.diffs_applied,
                    drift_detected: ctx.drift_detected,
                    confidence_scores,
                    metrics: self.metrics.clone(),
                    error,
                    execution_log: ctx.execution_log,
                    finished_at: Utc::now(),
                }
            }
            None => self.bare_result(self.last_mode, success, error),
        }
    }

    fn bare_result(
        &self,
        mode: AgentMode,
        success: bool,
        error: Option<SafetyViolation>,
    ) -> OperationResult {
        OperationResult {
            operation_id: Uuid::now_v7(),
            success,
            mode,
            files_modified: Vec::new(),
            diffs_applied: Vec::new(),
            drift_detected: false,
            confidence_scores: BTreeMap::new(),
            metrics: self.metrics.clone(),
            error,
            execution_log: Vec::new(),
            finished_at: Utc::now(),
        }
    }

    /// Run one operation end to end. Never panics and never returns an
    /// error: every failure path lands in the `OperationResult`.
    pub fn execute(&mut self, task: ModeTask) -> OperationResult {
        let mode = task.mode();
        match self.run_mode(task) {
            Ok(result) => result,
            Err(err) => {
                let violation = SafetyViolation::Internal {
                    detail: err.to_string(),
                };
                if self.context.is_some() {
                    self.end_operation(false, Some(violation))
                } else {
                    self.bare_result(mode, false, Some(violation))
                }
            }
        }
    }

    fn run_mode(&mut self, task: ModeTask) -> Result<OperationResult> {
        let mode = task.mode();
        let files = task.files_in_scope();
        self.begin_operation(mode, &files)?;

        // Shared skeleton: drift check, conditional re-ground, safety gate.
        let scan = self.check_drift(None);
        if scan.has_drift() {
            let drifted: Vec<PathBuf> = scan
                .drifted_files
                .iter()
                .map(|e| e.file_path.clone())
                .chain(scan.missing_files.iter().cloned())
                .collect();
            self.scoped_reground(&drifted);
        }
        if let Some(violation) = self.check_safety() {
            let msg = format!("safety gate failed: {violation}");
            self.ctx_mut()?.log(msg.clone());
            self.observer.warn_log(&msg);
            return Ok(self.end_operation(false, Some(violation)));
        }

        let failure = match task {
            ModeTask::Plan(t) => {
                self.run_plan(&t)?;
                None
            }
            ModeTask::Implement(t) => self.run_implement(&t)?,
            ModeTask::Review(t) => {
                self.run_review(&t)?;
                None
            }
            ModeTask::Index(t) => {
                self.run_index(&t)?;
                None
            }
            ModeTask::Test(t) => self.run_test(&t)?,
        };

        match failure {
            Some(violation) => Ok(self.end_operation(false, Some(violation))),
            None => Ok(self.end_operation(true, None)),
        }
    }

    fn run_plan(&mut self, task: &PlanTask) -> Result<()> {
        self.metrics.loop_iterations += 1;
        let mut lines = vec![format!("objective: {}", task.description)];
        for rel in &task.context_files {
            let path = self.resolve(rel);
            match self.drift.fingerprint(&path) {
                Some(fp) => lines.push(format!("{rel}: {} known symbol(s)", fp.symbols.len())),
                None => lines.push(format!("{rel}: not yet present")),
            }
        }
        let plan = lines.join("\n");
        let ctx = self.ctx_mut()?;
        ctx.plan = Some(plan);
        ctx.log("plan drafted");
        Ok(())
    }

    fn run_implement(&mut self, task: &ImplementTask) -> Result<Option<SafetyViolation>> {
        for change in &task.changes {
            self.metrics.loop_iterations += 1;
            let Some(diff) = self.prepare_diff(&change.path, &change.new_content) else {
                return Ok(Some(SafetyViolation::IoFailure {
                    path: change.path.clone(),
                    detail: "could not read current content to compute diff".to_string(),
                }));
            };
            if diff.is_empty() {
                self.ctx_mut()?
                    .log(format!("{}: already at target content", change.path));
                continue;
            }
            // First failed application aborts the whole operation.
            if let Err(violation) = self.try_apply_diff(&diff, false) {
                return Ok(Some(violation));
            }
        }
        Ok(None)
    }

    fn run_review(&mut self, task: &ReviewTask) -> Result<()> {
        let mut findings = Vec::new();
        for rel in &task.files_to_review {
            self.metrics.loop_iterations += 1;
            let path = self.resolve(rel);
            let finding = match self.confidence.get_confidence(&path) {
                Some(c) => {
                    let symbols = self
                        .drift
                        .fingerprint(&path)
                        .map(|fp| fp.symbols.len())
                        .unwrap_or(0);
                    format!(
                        "{rel}: confidence {:.1} ({:?}), {symbols} symbol(s)",
                        c.score,
                        c.level()
                    )
                }
                None => format!("{rel}: not present on disk"),
            };
            findings.push(finding);
        }
        let ctx = self.ctx_mut()?;
        ctx.review_findings = findings;
        ctx.log("review findings collected");
        Ok(())
    }

    fn run_index(&mut self, task: &IndexTask) -> Result<()> {
        let mut summary = BTreeMap::new();
        for rel in &task.files_to_index {
            self.metrics.loop_iterations += 1;
            let path = self.resolve(rel);
            if !self.drift.is_registered(&path) && !self.drift.register_file(&path, None) {
                continue;
            }
            if let Some(fp) = self.drift.fingerprint(&path) {
                summary.insert(rel.clone(), fp.symbols.len());
            }
        }
        let indexed = summary.len();
        let ctx = self.ctx_mut()?;
        ctx.index_summary = summary;
        ctx.log(format!("indexed {indexed} file(s)"));
        Ok(())
    }

    fn run_test(&mut self, task: &TestTask) -> Result<Option<SafetyViolation>> {
        self.metrics.loop_iterations += 1;
        self.metrics.tool_calls += 1;

        let base = task
            .command
            .clone()
            .unwrap_or_else(|| self.config.test_command.clone());
        let command = if task.test_files.is_empty() {
            base
        } else {
            format!("{base} {}", task.test_files.join(" "))
        };
        let timeout_seconds = self.limits.timeout_seconds;
        let timeout = Duration::from_secs(timeout_seconds);

        let run = self.runner.run(&command, &self.workspace, timeout);
        match run {
            Ok(result) => {
                let timed_out = result.timed_out;
                let status = result.status;
                let ctx = self.ctx_mut()?;
                ctx.test_outcome = Some(TestOutcome {
                    status,
                    stdout: result.stdout,
                    stderr: result.stderr,
                    timed_out,
                });
                if timed_out {
                    ctx.log(format!("test command '{command}' timed out"));
                    return Ok(Some(SafetyViolation::LimitExceeded {
                        detail: format!("test command timed out after {timeout_seconds}s"),
                    }));
                }
                ctx.log(format!(
                    "test command '{command}' exited with {:?}",
                    status
                ));
                Ok(None)
            }
            Err(err) => {
                self.ctx_mut()?
                    .log(format!("test command '{command}' failed to spawn"));
                Ok(Some(SafetyViolation::IoFailure {
                    path: command,
                    detail: err.to_string(),
                }))
            }
        }
    }
}
