use anyhow::Result;
use chrono::Utc;
use contextforge_core::runtime_dir;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Append-only operation log under the workspace runtime dir, plus
/// optional verbose logging to stderr.
pub struct Observer {
    log_path: PathBuf,
    verbose: bool,
}

impl Observer {
    pub fn new(workspace: &Path) -> Result<Self> {
        let dir = runtime_dir(workspace);
        fs::create_dir_all(&dir)?;
        Ok(Self {
            log_path: dir.join("observe.log"),
            verbose: false,
        })
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Record one event line, RFC 3339-stamped.
    pub fn record_event(&self, msg: &str) -> Result<()> {
        self.append_log_line(&format!("{} EVENT {msg}", Utc::now().to_rfc3339()))
    }

    /// Log to stderr with a `[contextforge]` prefix when verbose is on.
    pub fn verbose_log(&self, msg: &str) {
        if self.verbose {
            eprintln!("[contextforge] {msg}");
        }
    }

    /// Warnings always reach both the log file and stderr.
    pub fn warn_log(&self, msg: &str) {
        eprintln!("[contextforge WARN] {msg}");
        let _ = self.append_log_line(&format!("{} WARN {msg}", Utc::now().to_rfc3339()));
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    fn append_log_line(&self, line: &str) -> Result<()> {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        writeln!(f, "{line}")?;
        Ok(())
    }
}
