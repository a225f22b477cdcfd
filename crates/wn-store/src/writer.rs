//! Per-run persistence: trial results, space snapshots and removal logs.
//!
//! A run directory holds `run_config.json`, then per round `result_{n}.json`,
//! `search_space_{n}.json` and `removed_space_{n}.json`, plus a shared
//! `error_models.json`. The store is the only reader and writer of these
//! files and assumes a single writing process.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use wn_types::{
    Choice, FailedTrial, RemovalRecord, Round, SearchSpace, StoreError, TrialRecord, WnResult,
};

const RESULT_PREFIX: &str = "result_";
const SNAPSHOT_PREFIX: &str = "search_space_";
const REMOVAL_PREFIX: &str = "removed_space_";
const RUN_CONFIG_FILE: &str = "run_config.json";
const ERROR_LOG_FILE: &str = "error_models.json";

/// Bounded retry for reads that observe a half-written document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            delay: Duration::from_secs(1),
        }
    }
}

/// Storage for one named run.
#[derive(Debug, Clone)]
pub struct RunStore {
    root: PathBuf,
    retry: RetryPolicy,
}

impl RunStore {
    pub fn open<P: AsRef<Path>>(results_dir: P, run_name: &str) -> WnResult<Self> {
        let root = results_dir.as_ref().join(run_name);
        std::fs::create_dir_all(&root)?;
        debug!("Opened run directory {}", root.display());
        Ok(Self {
            root,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = RetryPolicy {
            attempts: retry.attempts.max(1),
            delay: retry.delay,
        };
        self
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn result_path(&self, round: usize) -> PathBuf {
        self.root.join(format!("{RESULT_PREFIX}{round}.json"))
    }

    pub fn snapshot_path(&self, round: usize) -> PathBuf {
        self.root.join(format!("{SNAPSHOT_PREFIX}{round}.json"))
    }

    pub fn removal_path(&self, round: usize) -> PathBuf {
        self.root.join(format!("{REMOVAL_PREFIX}{round}.json"))
    }

    pub fn run_config_path(&self) -> PathBuf {
        self.root.join(RUN_CONFIG_FILE)
    }

    pub fn error_log_path(&self) -> PathBuf {
        self.root.join(ERROR_LOG_FILE)
    }

    /// Delete everything in the run directory.
    pub fn wipe(&self) -> WnResult<()> {
        for entry in std::fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.is_dir() {
                std::fs::remove_dir_all(&path)?;
            } else {
                std::fs::remove_file(&path)?;
            }
        }
        info!("Wiped run directory {}", self.root.display());
        Ok(())
    }

    /// Persist a document atomically and durably: write and sync a sibling
    /// temp file, rename it over the target, then sync the directory.
    pub fn dump<T: Serialize + ?Sized>(&self, content: &T, path: &Path) -> WnResult<()> {
        let json = serde_json::to_vec_pretty(content)?;
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        let mut file = File::create(&tmp)?;
        file.write_all(&json)?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&tmp, path)?;
        if let Some(parent) = path.parent() {
            // directories cannot be opened for syncing on every platform
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }

    /// Read a document, retrying on truncated or malformed JSON. A document
    /// that is well-formed but has the wrong shape fails immediately.
    pub fn load<T: DeserializeOwned>(&self, path: &Path) -> WnResult<T> {
        let mut last_error = String::new();
        for attempt in 1..=self.retry.attempts {
            let text = std::fs::read_to_string(path)?;
            match serde_json::from_str(&text) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_eof() || e.is_syntax() => {
                    warn!(
                        attempt,
                        path = %path.display(),
                        error = %e,
                        "Corrupt read, retrying"
                    );
                    last_error = e.to_string();
                    if attempt < self.retry.attempts {
                        std::thread::sleep(self.retry.delay);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(StoreError::Corruption {
            path: path.display().to_string(),
            attempts: self.retry.attempts,
            message: last_error,
        }
        .into())
    }

    fn load_or_default<T: DeserializeOwned + Default>(&self, path: &Path) -> WnResult<T> {
        if path.exists() {
            self.load(path)
        } else {
            Ok(T::default())
        }
    }

    /// Round indices present for a file prefix, in numeric order.
    fn indexed(&self, prefix: &str) -> WnResult<Vec<usize>> {
        let mut indices = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(index) = name
                .strip_prefix(prefix)
                .and_then(|rest| rest.strip_suffix(".json"))
                .and_then(|n| n.parse::<usize>().ok())
            {
                indices.push(index);
            }
        }
        indices.sort_unstable();
        Ok(indices)
    }

    /// The active round: one less than the number of result files, or 0.
    pub fn get_index(&self) -> WnResult<usize> {
        Ok(self.indexed(RESULT_PREFIX)?.len().saturating_sub(1))
    }

    /// Make sure `result_{round}.json` exists so the round counts as started.
    pub fn start_round(&self, round: usize) -> WnResult<()> {
        let path = self.result_path(round);
        if !path.exists() {
            self.dump(&Vec::<TrialRecord>::new(), &path)?;
        }
        Ok(())
    }

    pub fn results(&self, round: usize) -> WnResult<Vec<TrialRecord>> {
        self.load_or_default(&self.result_path(round))
    }

    /// Append one trial to its round and return the round's new size.
    pub fn append_result(&self, record: &TrialRecord) -> WnResult<usize> {
        let path = self.result_path(record.round);
        let mut results: Vec<TrialRecord> = self.load_or_default(&path)?;
        results.push(record.clone());
        self.dump(&results, &path)?;
        Ok(results.len())
    }

    /// Trials of every round, oldest first.
    pub fn all_results(&self) -> WnResult<Vec<TrialRecord>> {
        let mut all = Vec::new();
        for round in self.indexed(RESULT_PREFIX)? {
            all.extend(self.results(round)?);
        }
        Ok(all)
    }

    pub fn snapshot(&self, round: usize) -> WnResult<Option<SearchSpace>> {
        let path = self.snapshot_path(round);
        if path.exists() {
            Ok(Some(self.load(&path)?))
        } else {
            Ok(None)
        }
    }

    pub fn save_snapshot(&self, round: usize, space: &SearchSpace) -> WnResult<()> {
        self.dump(space, &self.snapshot_path(round))
    }

    pub fn removals(&self, round: usize) -> WnResult<Vec<RemovalRecord>> {
        self.load_or_default(&self.removal_path(round))
    }

    pub fn append_removals(&self, round: usize, records: &[RemovalRecord]) -> WnResult<()> {
        let path = self.removal_path(round);
        let mut removals: Vec<RemovalRecord> = self.load_or_default(&path)?;
        removals.extend_from_slice(records);
        self.dump(&removals, &path)
    }

    /// Every removal ever recorded, in the order it was made.
    pub fn all_removals(&self) -> WnResult<Vec<RemovalRecord>> {
        let mut all = Vec::new();
        for round in self.indexed(REMOVAL_PREFIX)? {
            all.extend(self.removals(round)?);
        }
        Ok(all)
    }

    /// Everything persisted for one round, or `None` before its snapshot
    /// exists.
    pub fn round(&self, index: usize) -> WnResult<Option<Round>> {
        let Some(search_space) = self.snapshot(index)? else {
            return Ok(None);
        };
        let mut round = Round::new(index, search_space);
        round.trials = self.results(index)?;
        round.removals = self.removals(index)?;
        Ok(Some(round))
    }

    /// The space `round` is currently operating on: its snapshot minus the
    /// removals already made in it. Without a snapshot, the previous round's
    /// snapshot and removals stand in. `None` means nothing was persisted.
    pub fn working_space(&self, round: usize) -> WnResult<Option<SearchSpace>> {
        let replay = |space: SearchSpace, round: usize| -> WnResult<SearchSpace> {
            let choices: Vec<Choice> = self
                .removals(round)?
                .iter()
                .map(RemovalRecord::choice)
                .collect();
            space.without(&choices)
        };
        if let Some(space) = self.snapshot(round)? {
            return replay(space, round).map(Some);
        }
        if round == 0 {
            return Ok(None);
        }
        match self.snapshot(round - 1)? {
            Some(previous) => replay(previous, round - 1).map(Some),
            None => Err(StoreError::Layout {
                path: self.root.display().to_string(),
                message: format!("no search space snapshot for round {} or {}", round, round - 1),
            }
            .into()),
        }
    }

    pub fn log_failure(&self, failure: &FailedTrial) -> WnResult<()> {
        let path = self.error_log_path();
        let mut failures: Vec<FailedTrial> = self.load_or_default(&path)?;
        failures.push(failure.clone());
        self.dump(&failures, &path)
    }

    pub fn failures(&self) -> WnResult<Vec<FailedTrial>> {
        self.load_or_default(&self.error_log_path())
    }

    /// Persist the run configuration on first use; afterwards require the
    /// requested configuration to match it exactly.
    pub fn ensure_run_config<T: Serialize>(&self, config: &T) -> WnResult<()> {
        let path = self.run_config_path();
        let requested = serde_json::to_value(config)?;
        if !path.exists() {
            info!("Writing run configuration to {}", path.display());
            return self.dump(&requested, &path);
        }

        let stored: serde_json::Value = self.load(&path)?;
        if stored == requested {
            return Ok(());
        }
        let differing = match (stored.as_object(), requested.as_object()) {
            (Some(a), Some(b)) => {
                let mut keys: Vec<String> = a
                    .keys()
                    .chain(b.keys())
                    .filter(|k| a.get(*k) != b.get(*k))
                    .cloned()
                    .collect();
                keys.sort();
                keys.dedup();
                keys
            }
            _ => vec!["<root>".to_string()],
        };
        Err(StoreError::ConfigMismatch {
            path: path.display().to_string(),
            differing,
        }
        .into())
    }
}
