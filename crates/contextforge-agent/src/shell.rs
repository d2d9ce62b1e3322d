//! Shell execution for TEST mode: one command string, one working
//! directory, one hard timeout.

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;
use wait_timeout::ChildExt;

/// Captured output of one test-command run. `status` is `None` when the
/// process was killed (timeout) or terminated by signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellRunResult {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

/// The subprocess boundary TEST mode runs through. Swapping the
/// implementation is how tests stub out the real shell.
pub trait ShellRunner {
    fn run(&self, cmd: &str, cwd: &Path, timeout: Duration) -> Result<ShellRunResult>;
}

/// Runs through the platform shell: `sh -c` on unix, `cmd /C` on
/// windows. A command that outlives the timeout is killed and reported
/// as timed out rather than as an error.
#[derive(Debug, Default)]
pub struct PlatformShellRunner;

impl ShellRunner for PlatformShellRunner {
    fn run(&self, cmd: &str, cwd: &Path, timeout: Duration) -> Result<ShellRunResult> {
        let mut child = shell_command(cmd)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn '{cmd}' in {}", cwd.display()))?;

        let timed_out = child.wait_timeout(timeout)?.is_none();
        if timed_out {
            child.kill()?;
        }
        let output = child.wait_with_output()?;
        Ok(ShellRunResult {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            timed_out,
        })
    }
}

#[cfg(not(target_os = "windows"))]
fn shell_command(cmd: &str) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(cmd);
    command
}

#[cfg(target_os = "windows")]
fn shell_command(cmd: &str) -> Command {
    let mut command = Command::new("cmd");
    command.arg("/C").arg(cmd);
    command
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout_of_a_successful_command() {
        let runner = PlatformShellRunner;
        let out = runner
            .run("echo contextforge", Path::new("."), Duration::from_secs(2))
            .expect("run command");
        assert!(!out.timed_out);
        assert_eq!(out.status, Some(0));
        assert!(out.stdout.to_lowercase().contains("contextforge"));
    }

    #[test]
    fn failing_command_reports_its_exit_status() {
        let runner = PlatformShellRunner;
        let out = runner
            .run("exit 3", Path::new("."), Duration::from_secs(2))
            .expect("run command");
        assert!(!out.timed_out);
        assert_eq!(out.status, Some(3));
    }

    #[test]
    fn overrunning_command_is_killed_and_flagged() {
        let runner = PlatformShellRunner;
        let out = runner
            .run("sleep 5", Path::new("."), Duration::from_millis(200))
            .expect("run command");
        assert!(out.timed_out);
        assert_eq!(out.status, None);
    }
}
