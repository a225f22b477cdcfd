//! Reducing trainer metrics to one ranking scalar.

use serde::{Deserialize, Serialize};
use wn_types::{Metrics, SearchError, WnResult};

/// Whether larger or smaller objective values are better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectiveDirection {
    Maximize,
    Minimize,
}

impl Default for ObjectiveDirection {
    fn default() -> Self {
        Self::Minimize
    }
}

impl ObjectiveDirection {
    /// True if `candidate` strictly improves on `incumbent`.
    pub fn improves(&self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Self::Maximize => candidate > incumbent,
            Self::Minimize => candidate < incumbent,
        }
    }

    /// How much worse `value` is than `best`; positive means worse.
    pub fn shortfall(&self, value: f64, best: f64) -> f64 {
        match self {
            Self::Maximize => best - value,
            Self::Minimize => value - best,
        }
    }
}

/// How a trial's metrics are turned into its objective score. Chosen once per
/// run and applied uniformly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum ObjectiveStrategy {
    /// Mean of error rate, (1 - F1), normalized DOA error and (1 - DOA
    /// recall). Lower is better.
    SeldComposite,
    /// The latest value of one reported metric.
    Metric { name: String },
}

impl Default for ObjectiveStrategy {
    fn default() -> Self {
        Self::SeldComposite
    }
}

fn latest(metrics: &Metrics, name: &str) -> WnResult<f64> {
    metrics
        .get(name)
        .and_then(|m| m.latest())
        .ok_or_else(|| {
            SearchError::MissingMetric {
                metric: name.to_string(),
            }
            .into()
        })
}

impl ObjectiveStrategy {
    pub fn metric(name: impl Into<String>) -> Self {
        Self::Metric { name: name.into() }
    }

    pub fn score(&self, metrics: &Metrics) -> WnResult<f64> {
        match self {
            Self::SeldComposite => {
                let er = latest(metrics, "val_error_rate")?;
                let f = latest(metrics, "val_f1score")?;
                let der = latest(metrics, "val_der")?;
                let derf = latest(metrics, "val_derf")?;
                Ok((er + (1.0 - f) + der / 180.0 + (1.0 - derf)) / 4.0)
            }
            Self::Metric { name } => latest(metrics, name),
        }
    }

    /// The metrics a trainer must report for this strategy.
    pub fn required_metrics(&self) -> Vec<&str> {
        match self {
            Self::SeldComposite => vec!["val_error_rate", "val_f1score", "val_der", "val_derf"],
            Self::Metric { name } => vec![name.as_str()],
        }
    }
}
