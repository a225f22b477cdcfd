//! Progress tracking for a narrowing search.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use wn_types::TrialRecord;

use crate::objective::ObjectiveDirection;

/// Where the round controller currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchState {
    Filling,
    Analyzing,
    Narrowing,
    Advancing,
    Complete,
    Failed,
}

impl SearchState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

/// Best trial seen so far, without its full metric history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestTrial {
    pub trial_id: Uuid,
    pub round: usize,
    pub number: usize,
    pub objective: f64,
    pub fingerprint: String,
}

impl From<&TrialRecord> for BestTrial {
    fn from(trial: &TrialRecord) -> Self {
        Self {
            trial_id: trial.id,
            round: trial.round,
            number: trial.number,
            objective: trial.objective_score,
            fingerprint: trial.config.fingerprint(),
        }
    }
}

/// Aggregate status of a search run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchStatus {
    pub run_name: String,
    pub state: SearchState,
    pub direction: ObjectiveDirection,
    pub round: usize,
    pub trials_completed: usize,
    pub constraint_rejections: usize,
    pub duplicate_draws: usize,
    pub trainer_failures: usize,
    pub exhausted_rounds: usize,
    pub removals: usize,
    pub best_trial: Option<BestTrial>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl SearchStatus {
    pub fn new(run_name: impl Into<String>, direction: ObjectiveDirection) -> Self {
        Self {
            run_name: run_name.into(),
            state: SearchState::Filling,
            direction,
            round: 0,
            trials_completed: 0,
            constraint_rejections: 0,
            duplicate_draws: 0,
            trainer_failures: 0,
            exhausted_rounds: 0,
            removals: 0,
            best_trial: None,
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    pub fn mark_started(&mut self) {
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    pub fn mark_completed(&mut self) {
        self.state = SearchState::Complete;
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: String) {
        self.state = SearchState::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(error);
    }

    /// Update the best trial if `trial` improves on the current best.
    pub fn update_best(&mut self, trial: &TrialRecord) {
        let dominated = match &self.best_trial {
            None => true,
            Some(current_best) => self
                .direction
                .improves(trial.objective_score, current_best.objective),
        };
        if dominated {
            self.best_trial = Some(BestTrial::from(trial));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wn_types::{ArchConfig, Metrics};

    fn trial(number: usize, score: f64) -> TrialRecord {
        TrialRecord::new(0, number, ArchConfig::new(1, 0), Metrics::new(), score, 1.0)
    }

    #[test]
    fn status_lifecycle() {
        let mut status = SearchStatus::new("accdoa_v_0", ObjectiveDirection::Minimize);
        assert_eq!(status.state, SearchState::Filling);
        assert!(status.started_at.is_none());

        status.mark_started();
        let started = status.started_at;
        status.mark_started();
        assert_eq!(status.started_at, started);

        status.mark_completed();
        assert!(status.state.is_terminal());
        assert!(status.finished_at.is_some());
    }

    #[test]
    fn best_trial_tracking_minimize() {
        let mut status = SearchStatus::new("run", ObjectiveDirection::Minimize);
        status.update_best(&trial(0, 0.5));
        status.update_best(&trial(1, 0.3));
        status.update_best(&trial(2, 0.4));
        let best = status.best_trial.unwrap();
        assert_eq!(best.number, 1);
        assert_eq!(best.objective, 0.3);
    }

    #[test]
    fn best_trial_tracking_maximize() {
        let mut status = SearchStatus::new("run", ObjectiveDirection::Maximize);
        status.update_best(&trial(0, 0.5));
        status.update_best(&trial(1, 0.3));
        assert_eq!(status.best_trial.unwrap().number, 0);
    }

    #[test]
    fn failure_records_error() {
        let mut status = SearchStatus::new("run", ObjectiveDirection::Minimize);
        status.mark_failed("store corrupted".into());
        assert_eq!(status.state, SearchState::Failed);
        assert_eq!(status.error.as_deref(), Some("store corrupted"));
    }
}
