//! Trial outcomes and the removal audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::config::ArchConfig;
use crate::errors::WnResult;
use crate::space::{Choice, DimensionPath, SearchSpace};
use crate::value::Value;

/// A reported metric: a scalar or a per-epoch series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Scalar(f64),
    Series(Vec<f64>),
}

impl MetricValue {
    /// Most recent value (last epoch for a series).
    pub fn latest(&self) -> Option<f64> {
        match self {
            Self::Scalar(v) => Some(*v),
            Self::Series(v) => v.last().copied(),
        }
    }
}

pub type Metrics = BTreeMap<String, MetricValue>;

/// One evaluated configuration. Never mutated after it is written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub id: Uuid,
    pub round: usize,
    pub number: usize,
    pub config: ArchConfig,
    pub metrics: Metrics,
    pub objective_score: f64,
    /// Seconds spent in the trainer.
    pub wall_time: f64,
    pub recorded_at: DateTime<Utc>,
}

impl TrialRecord {
    pub fn new(
        round: usize,
        number: usize,
        config: ArchConfig,
        metrics: Metrics,
        objective_score: f64,
        wall_time: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            round,
            number,
            config,
            metrics,
            objective_score,
            wall_time,
            recorded_at: Utc::now(),
        }
    }

    /// Whether this trial touched any eliminated choice.
    pub fn uses_any<'a>(&self, removed: impl IntoIterator<Item = &'a Choice>) -> bool {
        removed.into_iter().any(|c| self.config.uses(c))
    }
}

/// Aggregated statistic that justified a removal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub mean: f64,
    pub support: usize,
    pub best_value: Value,
    pub best_mean: f64,
    pub margin: f64,
    /// Set when the removal was forced by emptying a hyperparameter domain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cascaded_from: Option<Choice>,
}

/// Audit entry marking a value as excluded. Trials are never deleted; this
/// record filters them out of later aggregation instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemovalRecord {
    pub round: usize,
    pub dimension_path: DimensionPath,
    pub removed_value: Value,
    pub evidence: Evidence,
    pub removed_at: DateTime<Utc>,
}

impl RemovalRecord {
    pub fn new(round: usize, choice: Choice, evidence: Evidence) -> Self {
        Self {
            round,
            dimension_path: choice.path,
            removed_value: choice.value,
            evidence,
            removed_at: Utc::now(),
        }
    }

    pub fn choice(&self) -> Choice {
        Choice::new(self.dimension_path, self.removed_value.clone())
    }
}

/// A config the trainer could not build or train.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedTrial {
    pub round: usize,
    pub config: ArchConfig,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

impl FailedTrial {
    pub fn new(round: usize, config: ArchConfig, reason: impl Into<String>) -> Self {
        Self {
            round,
            config,
            reason: reason.into(),
            recorded_at: Utc::now(),
        }
    }
}

/// One generation of the search loop under a fixed space snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Round {
    pub index: usize,
    pub search_space: SearchSpace,
    pub trials: Vec<TrialRecord>,
    pub removals: Vec<RemovalRecord>,
}

impl Round {
    pub fn new(index: usize, search_space: SearchSpace) -> Self {
        Self {
            index,
            search_space,
            trials: Vec::new(),
            removals: Vec::new(),
        }
    }

    /// The space the next round starts from.
    pub fn next_space(&self) -> WnResult<SearchSpace> {
        let choices: Vec<Choice> = self.removals.iter().map(RemovalRecord::choice).collect();
        self.search_space.without(&choices)
    }
}

/// Drop every trial that used an eliminated choice.
pub fn valid_trials<'a>(
    trials: impl IntoIterator<Item = &'a TrialRecord>,
    removals: &[RemovalRecord],
) -> Vec<TrialRecord> {
    let removed: Vec<Choice> = removals.iter().map(RemovalRecord::choice).collect();
    trials
        .into_iter()
        .filter(|t| !t.uses_any(&removed))
        .cloned()
        .collect()
}
