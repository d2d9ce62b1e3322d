//! Safety mechanisms guarding autonomous edits: per-file confidence
//! scoring, non-progress loop detection, and the internal diagnostic agent
//! that composes them with drift and limit checks into a single verdict.

mod confidence;
mod diagnostics;
mod loop_detect;

pub use confidence::{ConfidenceLevel, ConfidenceTracker, FileConfidence, NEUTRAL_BASELINE};
pub use diagnostics::{DiagnosticResult, DiagnosticSeverity, InternalDiagnosticAgent};
pub use loop_detect::{DEFAULT_MAX_IDENTICAL_STATES, LoopDetector};
