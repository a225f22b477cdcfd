// Round controller: fill, analyze, narrow, advance, until nothing is left to
// narrow. Every step is persisted before the next one starts, so a killed
// process resumes where it stopped.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use wn_optimizer::{
    analyze, canonicalize, narrow, AnalysisTable, ConfigSampler, ConstraintSet, InputShape,
    NarrowingConfig, ObjectiveDirection, ObjectiveStrategy, SearchState, SearchStatus,
};
use wn_store::RunStore;
use wn_types::{
    config_error, internal_error, valid_trials, FailedTrial, SearchError, SearchSpace, TrialRecord, WnError,
    WnResult,
};

use crate::trainer::{Trainer, TrainerError};

/// Everything that defines a run. Persisted as `run_config.json`; a resumed
/// run must ask for exactly the same configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub name: String,

    /// Trials to collect in each round before analyzing.
    pub trials_per_round: usize,

    /// Valid trials needed before any narrowing pass.
    pub min_samples: usize,

    pub narrowing: NarrowingConfig,
    pub objective: ObjectiveStrategy,
    /// Input dimensions and class count, used by budget constraints and
    /// handed to the trainer.
    pub input_shape: InputShape,

    /// Sampler seed. Draws are keyed by (seed, round, trial number).
    pub seed: u64,

    /// Per-trial draw budget, shared by constraint rejections, duplicate
    /// draws and unbuildable configs.
    pub max_attempts: usize,

    pub constraints: ConstraintSet,

    /// Opaque settings handed through to the trainer (epochs, batch size).
    pub trainer: serde_json::Value,

    /// Wipe the run directory before starting. Not part of the persisted
    /// configuration.
    #[serde(skip)]
    pub fresh: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            name: "winnow".to_string(),
            trials_per_round: 500,
            min_samples: 32,
            narrowing: NarrowingConfig::default(),
            objective: ObjectiveStrategy::default(),
            input_shape: InputShape::default(),
            seed: 0,
            max_attempts: 1000,
            constraints: ConstraintSet::new(),
            trainer: serde_json::json!({ "epochs": 10, "batch_size": 256, "lr": 0.001 }),
            fresh: false,
        }
    }
}

impl RunConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_trials_per_round(mut self, n: usize) -> Self {
        self.trials_per_round = n;
        self
    }

    pub fn with_min_samples(mut self, n: usize) -> Self {
        self.min_samples = n;
        self
    }

    pub fn with_narrowing(mut self, narrowing: NarrowingConfig) -> Self {
        self.narrowing = narrowing;
        self
    }

    pub fn with_objective(mut self, objective: ObjectiveStrategy, direction: ObjectiveDirection) -> Self {
        self.objective = objective;
        self.narrowing.direction = direction;
        self
    }

    pub fn with_input_shape(mut self, input_shape: InputShape) -> Self {
        self.input_shape = input_shape;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_max_attempts(mut self, n: usize) -> Self {
        self.max_attempts = n;
        self
    }

    pub fn with_constraints(mut self, constraints: ConstraintSet) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn with_trainer_settings(mut self, settings: serde_json::Value) -> Self {
        self.trainer = settings;
        self
    }

    pub fn with_fresh(mut self, fresh: bool) -> Self {
        self.fresh = fresh;
        self
    }

    pub fn direction(&self) -> ObjectiveDirection {
        self.narrowing.direction
    }

    pub fn validate(&self) -> WnResult<()> {
        if self.name.trim().is_empty() {
            return Err(config_error!("run name must not be empty"));
        }
        if self.trials_per_round == 0 {
            return Err(config_error!("trials_per_round must be at least 1"));
        }
        if self.max_attempts == 0 {
            return Err(config_error!("max_attempts must be at least 1"));
        }
        if !self.narrowing.threshold.is_finite() || self.narrowing.threshold < 0.0 {
            return Err(config_error!(
                "narrowing threshold must be a non-negative number, got {}",
                self.narrowing.threshold
            ));
        }
        Ok(())
    }
}

/// Drives a run through its rounds.
pub struct SearchController {
    config: RunConfig,
    store: RunStore,
    trainer: Box<dyn Trainer>,
    sampler: ConfigSampler,
    status: SearchStatus,
    /// Working space of the current round, with this round's removals applied.
    space: SearchSpace,
    /// Table computed by the last analysis, consumed by the next narrowing.
    table: Option<AnalysisTable>,
    round_exhausted: bool,
}

impl SearchController {
    /// Open or resume the run stored in `store`.
    ///
    /// `initial_space` is only used when the run has no persisted rounds yet.
    pub fn new(
        config: RunConfig,
        initial_space: SearchSpace,
        store: RunStore,
        trainer: Box<dyn Trainer>,
    ) -> WnResult<Self> {
        config.validate()?;
        if config.fresh {
            store.wipe()?;
        }
        store.ensure_run_config(&config)?;
        let initial_space = initial_space.validate()?;

        let round = store.get_index()?;
        let space = match store.working_space(round)? {
            Some(space) => {
                if round == 0 && store.snapshot(0)?.as_ref() != Some(&initial_space) {
                    warn!("Resuming with the persisted search space, ignoring the supplied one");
                }
                space
            }
            None => {
                store.save_snapshot(0, &initial_space)?;
                initial_space
            }
        };
        if store.snapshot(round)?.is_none() {
            store.save_snapshot(round, &space)?;
        }
        store.start_round(round)?;

        let mut status = SearchStatus::new(config.name.clone(), config.direction());
        status.round = round;
        let history = store.all_results()?;
        status.trials_completed = history.len();
        for trial in &history {
            status.update_best(trial);
        }
        status.removals = store.all_removals()?.len();
        status.trainer_failures = store.failures()?.len();

        info!(
            run = %config.name,
            round,
            trials = history.len(),
            trainer = trainer.name(),
            "Opened search run"
        );
        debug!(metrics = ?config.objective.required_metrics(), "Objective inputs");

        Ok(Self {
            sampler: ConfigSampler::new(config.seed, config.max_attempts),
            config,
            store,
            trainer,
            status,
            space,
            table: None,
            round_exhausted: false,
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn status(&self) -> &SearchStatus {
        &self.status
    }

    pub fn space(&self) -> &SearchSpace {
        &self.space
    }

    pub fn store(&self) -> &RunStore {
        &self.store
    }

    /// Run until the search completes or fails.
    pub async fn run(&mut self) -> WnResult<SearchStatus> {
        self.status.mark_started();
        info!("Starting search {}", self.config.name);
        while !self.status.state.is_terminal() {
            self.step().await?;
        }
        Ok(self.status.clone())
    }

    /// Perform one state transition and return the new state.
    pub async fn step(&mut self) -> WnResult<SearchState> {
        let result = match self.status.state {
            SearchState::Filling => self.fill().await,
            SearchState::Analyzing => self.analyze().await,
            SearchState::Narrowing => self.narrow().await,
            SearchState::Advancing => self.advance(),
            terminal => Ok(terminal),
        };

        match result {
            Ok(next) => {
                if next == SearchState::Complete && !self.status.state.is_terminal() {
                    self.status.mark_completed();
                    info!(
                        round = self.status.round,
                        trials = self.status.trials_completed,
                        removals = self.status.removals,
                        "Search complete"
                    );
                }
                self.status.state = next;
                Ok(next)
            }
            Err(e) => {
                error!(round = self.status.round, error = %e, "Search stopped");
                self.status.mark_failed(e.to_string());
                Err(e)
            }
        }
    }

    /// Collect one trial for the current round.
    async fn fill(&mut self) -> WnResult<SearchState> {
        let round = self.status.round;
        let (trials, failures) = self
            .with_store(move |store| Ok((store.results(round)?, store.failures()?)))
            .await?;
        if trials.len() >= self.config.trials_per_round {
            return Ok(SearchState::Analyzing);
        }
        let number = trials.len();

        // configs already trained or already found unbuildable this round
        let mut seen: HashSet<String> = trials.iter().map(|t| t.config.fingerprint()).collect();
        seen.extend(
            failures
                .iter()
                .filter(|f| f.round == round)
                .map(|f| f.config.fingerprint()),
        );

        self.sampler.reseed(round, number);
        let mut wasted = 0;
        loop {
            if wasted >= self.sampler.max_attempts() {
                return Ok(self.exhaust(round, number, wasted));
            }

            let sampled = self.sampler.sample(
                &self.space,
                &self.config.constraints,
                canonicalize,
                &self.config.input_shape,
            );
            self.status.constraint_rejections = self.sampler.stats().rejections;
            let config = match sampled {
                Ok(config) => config,
                Err(e) if !e.is_fatal() => {
                    return Ok(self.exhaust(round, number, self.sampler.max_attempts()))
                }
                Err(e) => return Err(e),
            };

            let fingerprint = config.fingerprint();
            if seen.contains(&fingerprint) {
                debug!(round, number, "Duplicate draw");
                self.status.duplicate_draws += 1;
                wasted += 1;
                continue;
            }

            let started = Instant::now();
            match self.trainer.train(&config, &self.config.input_shape).await {
                Ok(metrics) => {
                    let score = self.config.objective.score(&metrics)?;
                    let record = TrialRecord::new(
                        round,
                        number,
                        config,
                        metrics,
                        score,
                        started.elapsed().as_secs_f64(),
                    );
                    let persisted = record.clone();
                    let count = self
                        .with_store(move |store| store.append_result(&persisted))
                        .await?;
                    self.status.trials_completed += 1;
                    self.status.update_best(&record);
                    info!(
                        round,
                        number,
                        score,
                        "Recorded trial {}/{}",
                        count,
                        self.config.trials_per_round
                    );
                    return Ok(if count >= self.config.trials_per_round {
                        SearchState::Analyzing
                    } else {
                        SearchState::Filling
                    });
                }
                Err(TrainerError::Unbuildable(reason)) => {
                    warn!(round, number, %reason, "Config could not be trained, resampling");
                    let failure = FailedTrial::new(round, config, reason);
                    self.with_store(move |store| store.log_failure(&failure))
                        .await?;
                    self.status.trainer_failures += 1;
                    seen.insert(fingerprint);
                    wasted += 1;
                }
                Err(TrainerError::Fatal(message)) => {
                    return Err(SearchError::TrainerFatal { message }.into())
                }
            }
        }
    }

    fn exhaust(&mut self, round: usize, number: usize, attempts: usize) -> SearchState {
        warn!(
            round,
            trials = number,
            attempts,
            "No new valid config could be drawn, analyzing early"
        );
        self.status.exhausted_rounds += 1;
        self.round_exhausted = true;
        SearchState::Analyzing
    }

    async fn analyze(&mut self) -> WnResult<SearchState> {
        let round = self.status.round;
        let (removals, history) = self
            .with_store(|store| Ok((store.all_removals()?, store.all_results()?)))
            .await?;
        let valid = valid_trials(&history, &removals);
        let table = analyze(&self.space, &valid);
        let removable = table.has_removable(&self.space, &self.config.narrowing);
        let narrowed_this_round = removals.iter().any(|r| r.round == round);

        info!(
            round,
            valid = valid.len(),
            total = history.len(),
            removable,
            "Analyzed trial history"
        );

        if removable && valid.len() >= self.config.min_samples {
            self.table = Some(table);
            return Ok(SearchState::Narrowing);
        }
        if !removable {
            return Ok(if narrowed_this_round {
                SearchState::Advancing
            } else {
                SearchState::Complete
            });
        }

        // removable rows but too little evidence to act on them
        let round_trials = history.iter().filter(|t| t.round == round).count();
        if self.round_exhausted && round_trials == 0 {
            warn!(round, valid = valid.len(), "Space yields no new trials, stopping");
            return Ok(SearchState::Complete);
        }
        debug!(
            round,
            valid = valid.len(),
            min_samples = self.config.min_samples,
            "Too few valid trials to narrow"
        );
        Ok(SearchState::Advancing)
    }

    async fn narrow(&mut self) -> WnResult<SearchState> {
        let round = self.status.round;
        let Some(table) = self.table.take() else {
            return Ok(SearchState::Analyzing);
        };
        let outcome = narrow(&table, &self.space, &self.config.narrowing, round)?;
        if !outcome.changed {
            return Ok(SearchState::Advancing);
        }

        let removals = outcome.removals.clone();
        self.with_store(move |store| store.append_removals(round, &removals))
            .await?;
        self.status.removals += outcome.removals.len();
        self.space = outcome.space;

        if self.space.is_exhausted() {
            warn!(round, "Search space exhausted by narrowing");
            return Ok(SearchState::Complete);
        }
        Ok(SearchState::Analyzing)
    }

    /// Store reads may sleep between retries, so store work runs on the
    /// blocking pool rather than on the executor thread.
    async fn with_store<T, F>(&self, work: F) -> WnResult<T>
    where
        F: FnOnce(&RunStore) -> WnResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || work(&store))
            .await
            .map_err(|e| internal_error!("store task failed: {e}"))?
    }

    fn advance(&mut self) -> WnResult<SearchState> {
        let next = self.status.round + 1;
        // snapshot first: the round only counts once its result file exists
        self.store.save_snapshot(next, &self.space)?;
        self.store.start_round(next)?;
        self.status.round = next;
        self.round_exhausted = false;
        info!(round = next, "Advanced to round {}", next);
        Ok(SearchState::Filling)
    }
}

impl std::fmt::Debug for SearchController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchController")
            .field("run", &self.config.name)
            .field("trainer", &self.trainer.name())
            .field("status", &self.status)
            .finish()
    }
}

/// Errors that stop the run but leave it resumable.
pub fn is_resumable(error: &WnError) -> bool {
    matches!(
        error,
        WnError::Search(SearchError::TrainerFatal { .. }) | WnError::Io(_)
    )
}
