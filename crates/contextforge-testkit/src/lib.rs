//! Shared helpers for tests that need a throwaway workspace.

use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};

/// A temp directory posing as a workspace root. Dropped files go with it.
pub struct TempWorkspace {
    dir: tempfile::TempDir,
}

impl TempWorkspace {
    pub fn new() -> Result<Self> {
        Ok(Self {
            dir: tempfile::tempdir()?,
        })
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Write a workspace-relative file, creating parent dirs as needed, and
    /// return its absolute path.
    pub fn write_file(&self, rel: &str, content: &str) -> Result<PathBuf> {
        let path = self.dir.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, content)?;
        Ok(path)
    }

    pub fn read_file(&self, rel: &str) -> Result<String> {
        Ok(fs::read_to_string(self.dir.path().join(rel))?)
    }

    pub fn exists(&self, rel: &str) -> bool {
        self.dir.path().join(rel).exists()
    }
}
