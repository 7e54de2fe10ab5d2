//! Shared generation state and the resumable progress file
//!
//! Workers mutate the accumulated name map and the completed-identifier
//! set under one lock. The completed set contains every identifier a
//! lookup was *started* for, success or not, so a resumed run never
//! repeats an attempt.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cache::write_atomic;

/// Display name rendered for an identifier no source could name
pub fn placeholder_name(id: &str) -> String {
    format!("Unknown Game {id}")
}

/// True for names produced by `placeholder_name`; these are never trusted
/// when harvesting a previously generated index.
pub fn is_placeholder(name: &str) -> bool {
    name.starts_with("Unknown Game ") || name.trim().is_empty()
}

/// On-disk shape of the resumable progress file
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    pub names: HashMap<String, String>,
    pub completed_ids: Vec<String>,
}

/// Working state of one generation run
#[derive(Debug)]
pub struct GenerationState {
    /// Names resolved by per-item lookups (this run and prior runs)
    lookup_names: HashMap<String, String>,
    /// Every identifier a lookup was started for
    completed: HashSet<String>,
    completions_since_checkpoint: usize,
    started: Instant,
}

impl GenerationState {
    pub fn new() -> Self {
        Self {
            lookup_names: HashMap::new(),
            completed: HashSet::new(),
            completions_since_checkpoint: 0,
            started: Instant::now(),
        }
    }

    /// Resume from a progress file if one exists.
    pub fn load(progress_path: &Path) -> Result<Self> {
        let mut state = Self::new();
        if progress_path.exists() {
            let data = std::fs::read_to_string(progress_path)
                .with_context(|| format!("Failed to read {}", progress_path.display()))?;
            let checkpoint: Checkpoint =
                serde_json::from_str(&data).context("Invalid progress file")?;
            info!(
                "Resuming: {} completed ids, {} names from previous run",
                checkpoint.completed_ids.len(),
                checkpoint.names.len()
            );
            state.lookup_names = checkpoint.names;
            state.completed = checkpoint.completed_ids.into_iter().collect();
        }
        Ok(state)
    }

    pub fn is_completed(&self, id: &str) -> bool {
        self.completed.contains(id)
    }

    /// Mark an identifier attempted. Called when the lookup starts, so an
    /// interruption mid-lookup still counts it as processed.
    pub fn record_attempt(&mut self, id: &str) {
        self.completed.insert(id.to_string());
    }

    pub fn record_name(&mut self, id: &str, name: String) {
        self.lookup_names.insert(id.to_string(), name);
    }

    /// Count one finished lookup; true every `interval` completions.
    pub fn bump_and_check_checkpoint(&mut self, interval: usize) -> bool {
        self.completions_since_checkpoint += 1;
        if self.completions_since_checkpoint >= interval {
            self.completions_since_checkpoint = 0;
            true
        } else {
            false
        }
    }

    pub fn lookup_names(&self) -> &HashMap<String, String> {
        &self.lookup_names
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.started.elapsed()
    }

    pub fn to_checkpoint(&self) -> Checkpoint {
        let mut completed_ids: Vec<String> = self.completed.iter().cloned().collect();
        completed_ids.sort();
        Checkpoint {
            names: self.lookup_names.clone(),
            completed_ids,
        }
    }

    /// Persist the progress file atomically.
    pub fn save(&self, progress_path: &Path) -> Result<()> {
        let checkpoint = self.to_checkpoint();
        let data = serde_json::to_string(&checkpoint).context("Failed to encode progress")?;
        write_atomic(progress_path, data.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_placeholder_detection() {
        assert!(is_placeholder(&placeholder_name("730")));
        assert!(is_placeholder(""));
        assert!(!is_placeholder("Counter-Strike 2"));
    }

    #[test]
    fn test_save_and_resume() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("progress.json");

        let mut state = GenerationState::new();
        state.record_attempt("730");
        state.record_name("730", "Counter-Strike 2".to_string());
        state.record_attempt("440");
        state.save(&path).unwrap();

        let resumed = GenerationState::load(&path).unwrap();
        assert!(resumed.is_completed("730"));
        assert!(resumed.is_completed("440"));
        assert!(!resumed.is_completed("570"));
        assert_eq!(
            resumed.lookup_names().get("730").map(String::as_str),
            Some("Counter-Strike 2")
        );
    }

    #[test]
    fn test_missing_progress_file_starts_fresh() {
        let dir = tempdir().unwrap();
        let state = GenerationState::load(&dir.path().join("none.json")).unwrap();
        assert_eq!(state.completed_count(), 0);
    }

    #[test]
    fn test_checkpoint_interval() {
        let mut state = GenerationState::new();
        assert!(!state.bump_and_check_checkpoint(3));
        assert!(!state.bump_and_check_checkpoint(3));
        assert!(state.bump_and_check_checkpoint(3));
        assert!(!state.bump_and_check_checkpoint(3));
    }

    #[test]
    fn test_attempt_recorded_even_without_name() {
        let mut state = GenerationState::new();
        state.record_attempt("123");
        assert!(state.is_completed("123"));
        assert!(state.lookup_names().get("123").is_none());
    }
}
