//! Local cache store
//!
//! Per-user cache directory holding the last-fetched index JSON and any
//! downloaded artifacts, named by identifier. Pure I/O; all policy lives
//! in the sync and download engines.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tempfile::NamedTempFile;

use crate::config::ARTIFACT_EXT;

const INDEX_FILE: &str = "games_index.json";

/// Handle to the on-disk cache directory
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    /// Open (creating if needed) the cache at an explicit location.
    pub fn at(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create cache dir {}", root.display()))?;
        Ok(Self { root })
    }

    /// Open the default per-user cache directory.
    pub fn open() -> Result<Self> {
        let base = dirs::cache_dir().context("No cache directory for this user")?;
        Self::at(base.join("luapatch"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the cached index document
    pub fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    /// Path an artifact is cached at, by identifier
    pub fn artifact_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}.{}", id, ARTIFACT_EXT))
    }

    pub fn has_index(&self) -> bool {
        self.index_path().exists()
    }

    /// Read the raw cached index payload, if present.
    pub fn read_index(&self) -> Result<Option<String>> {
        let path = self.index_path();
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(Some(data))
    }

    /// Overwrite the cached index payload atomically.
    pub fn write_index(&self, payload: &str) -> Result<()> {
        write_atomic(&self.index_path(), payload.as_bytes())
    }

    /// Place artifact bytes at their cache path atomically.
    pub fn write_artifact(&self, id: &str, data: &[u8]) -> Result<PathBuf> {
        let path = self.artifact_path(id);
        write_atomic(&path, data)?;
        Ok(path)
    }
}

/// Write-then-rename so a reader never observes a half-written file.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .with_context(|| format!("No parent directory for {}", path.display()))?;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
    std::io::Write::write_all(&mut tmp, data).context("Failed to write temp file")?;
    tmp.persist(path)
        .with_context(|| format!("Failed to persist {}", path.display()))?;
    Ok(())
}
