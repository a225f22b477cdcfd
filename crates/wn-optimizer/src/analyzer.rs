//! Per-choice aggregation of trial outcomes and statistical elimination.
//!
//! `analyze` turns the still-valid trial history into one row per
//! `(dimension, value)` pair. `narrow` picks the values whose mean objective
//! trails the best value of the same dimension by more than the threshold,
//! and removes them from a copy of the space.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};
use wn_types::{
    Choice, DimensionPath, Evidence, RemovalRecord, SearchSpace, StageFamily, StageKind,
    TrialRecord, Value, WnResult,
};

use crate::objective::ObjectiveDirection;

/// How the gap between a value and the best value is measured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarginMode {
    /// `worse - best`
    #[default]
    Absolute,
    /// `(worse - best) / |best|`
    Relative,
}

/// How many values one narrowing pass may remove.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NarrowingMode {
    /// The single qualifying value with the largest margin.
    #[default]
    OnePerPass,
    /// The worst qualifying value of every dimension.
    PerDimension,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NarrowingConfig {
    pub threshold: f64,
    pub margin: MarginMode,
    pub direction: ObjectiveDirection,
    /// Dimensions ranked in the opposite sense of `direction`.
    #[serde(default)]
    pub overrides: BTreeMap<DimensionPath, ObjectiveDirection>,
    /// Trials a value needs before it can be compared.
    pub min_support: usize,
    pub mode: NarrowingMode,
}

impl Default for NarrowingConfig {
    fn default() -> Self {
        Self {
            threshold: 0.05,
            margin: MarginMode::Absolute,
            direction: ObjectiveDirection::Minimize,
            overrides: BTreeMap::new(),
            min_support: 1,
            mode: NarrowingMode::OnePerPass,
        }
    }
}

impl NarrowingConfig {
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_margin(mut self, margin: MarginMode) -> Self {
        self.margin = margin;
        self
    }

    pub fn with_direction(mut self, direction: ObjectiveDirection) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_override(mut self, path: DimensionPath, direction: ObjectiveDirection) -> Self {
        self.overrides.insert(path, direction);
        self
    }

    pub fn with_min_support(mut self, min_support: usize) -> Self {
        self.min_support = min_support.max(1);
        self
    }

    pub fn with_mode(mut self, mode: NarrowingMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn direction_for(&self, path: &DimensionPath) -> ObjectiveDirection {
        self.overrides.get(path).copied().unwrap_or(self.direction)
    }

    fn margin(&self, direction: ObjectiveDirection, value: f64, best: f64) -> f64 {
        let gap = direction.shortfall(value, best);
        match self.margin {
            MarginMode::Absolute => gap,
            MarginMode::Relative if best != 0.0 => gap / best.abs(),
            MarginMode::Relative if gap > 0.0 => f64::INFINITY,
            MarginMode::Relative => 0.0,
        }
    }
}

/// Aggregate for one `(dimension, value)` pair. `mean` is `None` when no
/// valid trial used the value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRow {
    pub path: DimensionPath,
    pub value: Value,
    pub mean: Option<f64>,
    pub support: usize,
}

impl AnalysisRow {
    pub fn choice(&self) -> Choice {
        Choice::new(self.path, self.value.clone())
    }

    /// Stage-type rows only compete with stage types of the same family.
    fn group(&self) -> (DimensionPath, Option<StageFamily>) {
        let family = match self.path {
            DimensionPath::Stage(_) => self
                .value
                .as_str()
                .and_then(|s| s.parse::<StageKind>().ok())
                .map(|k| k.family()),
            _ => None,
        };
        (self.path, family)
    }
}

/// A value the narrowing policy would remove, with its justification.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub choice: Choice,
    pub evidence: Evidence,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisTable {
    pub rows: Vec<AnalysisRow>,
}

fn rows_for(path: DimensionPath, values: Vec<Value>, trials: &[TrialRecord]) -> Vec<AnalysisRow> {
    values
        .into_iter()
        .map(|value| {
            let (sum, support) = trials
                .iter()
                .filter(|t| t.config.value_at(&path).as_ref() == Some(&value))
                .fold((0.0, 0usize), |(sum, n), t| (sum + t.objective_score, n + 1));
            AnalysisRow {
                path,
                value,
                mean: (support > 0).then(|| sum / support as f64),
                support,
            }
        })
        .collect()
}

/// Build the per-choice table from trials that are valid under `space`.
pub fn analyze(space: &SearchSpace, trials: &[TrialRecord]) -> AnalysisTable {
    let per_dimension: Vec<Vec<AnalysisRow>> = space
        .dimensions()
        .into_par_iter()
        .map(|(path, values)| rows_for(path, values, trials))
        .collect();
    let rows: Vec<AnalysisRow> = per_dimension.into_iter().flatten().collect();
    debug!(rows = rows.len(), trials = trials.len(), "Built analysis table");
    AnalysisTable { rows }
}

impl AnalysisTable {
    /// Rows with no supporting trial.
    pub fn unsupported(&self) -> impl Iterator<Item = &AnalysisRow> {
        self.rows.iter().filter(|r| r.mean.is_none())
    }

    /// Every dimension's worst value whose margin exceeds the threshold.
    ///
    /// Dimensions with a single remaining value are frozen, and only rows
    /// still present in `space` take part.
    pub fn candidates(&self, space: &SearchSpace, config: &NarrowingConfig) -> Vec<Candidate> {
        let mut groups: BTreeMap<(DimensionPath, Option<StageFamily>), Vec<&AnalysisRow>> =
            BTreeMap::new();
        for row in self.rows.iter().filter(|r| space.contains(&r.choice())) {
            groups.entry(row.group()).or_default().push(row);
        }

        let mut out = Vec::new();
        for ((path, _), rows) in groups {
            if rows.len() < 2 {
                continue;
            }
            let direction = config.direction_for(&path);
            let scored: Vec<(&AnalysisRow, f64)> = rows
                .into_iter()
                .filter(|r| r.support >= config.min_support)
                .filter_map(|r| r.mean.map(|m| (r, m)))
                .collect();
            if scored.len() < 2 {
                continue;
            }

            let mut best = scored[0];
            let mut worst = scored[0];
            for entry in &scored[1..] {
                if direction.improves(entry.1, best.1) {
                    best = *entry;
                }
                if direction.improves(worst.1, entry.1) {
                    worst = *entry;
                }
            }

            let margin = config.margin(direction, worst.1, best.1);
            if margin > config.threshold {
                out.push(Candidate {
                    choice: worst.0.choice(),
                    evidence: Evidence {
                        mean: worst.1,
                        support: worst.0.support,
                        best_value: best.0.value.clone(),
                        best_mean: best.1,
                        margin,
                        cascaded_from: None,
                    },
                });
            }
        }
        out
    }

    pub fn has_removable(&self, space: &SearchSpace, config: &NarrowingConfig) -> bool {
        !self.candidates(space, config).is_empty()
    }
}

/// Result of one narrowing pass.
#[derive(Debug, Clone)]
pub struct NarrowOutcome {
    pub changed: bool,
    pub space: SearchSpace,
    pub removals: Vec<RemovalRecord>,
}

/// Apply one narrowing pass. The input space is left untouched.
pub fn narrow(
    table: &AnalysisTable,
    space: &SearchSpace,
    config: &NarrowingConfig,
    round: usize,
) -> WnResult<NarrowOutcome> {
    let mut candidates = table.candidates(space, config);
    if config.mode == NarrowingMode::OnePerPass {
        let mut chosen: Option<Candidate> = None;
        for candidate in candidates {
            let wider = chosen
                .as_ref()
                .map_or(true, |c| candidate.evidence.margin > c.evidence.margin);
            if wider {
                chosen = Some(candidate);
            }
        }
        candidates = chosen.into_iter().collect();
    }

    let mut next = space.clone();
    let mut removals = Vec::new();
    for candidate in candidates {
        // an earlier removal in this pass may already have dropped it
        if !next.contains(&candidate.choice) {
            continue;
        }
        let narrowed = next.remove(&candidate.choice.path, &candidate.choice.value)?;
        for removed in narrowed.removed {
            let mut evidence = candidate.evidence.clone();
            if removed != candidate.choice {
                evidence.cascaded_from = Some(candidate.choice.clone());
            }
            info!(
                round,
                choice = %removed,
                mean = evidence.mean,
                best = evidence.best_mean,
                margin = evidence.margin,
                "Removing choice"
            );
            removals.push(RemovalRecord::new(round, removed, evidence));
        }
        next = narrowed.space;
    }

    Ok(NarrowOutcome {
        changed: !removals.is_empty(),
        space: next,
        removals,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wn_types::{
        valid_trials, values, ArchConfig, BiGruStage, DprnnStage, Metrics, RnnCell,
        SimpleDenseStage, SlotDomain, SlotId, Stage, StageDomain, StructuralDim,
        TransformerStage,
    };

    fn transformer_space(kernels: Vec<Value>, key_dims: Vec<Value>) -> SearchSpace {
        SearchSpace::new()
            .with_blocks(StructuralDim::TwoDimBlocks, vec![0])
            .with_blocks(StructuralDim::OneDimBlocks, vec![1])
            .with_slot(
                SlotId::Block(0),
                SlotDomain::new().with_stage(
                    StageKind::Transformer,
                    StageDomain::new()
                        .with("depth", values![1])
                        .with("n_head", values![1])
                        .with("key_dim", key_dims)
                        .with("ff_multiplier", values![1.0])
                        .with("kernel_size", kernels),
                ),
            )
            .validate()
            .unwrap()
    }

    fn transformer_trial(kernel_size: u32, key_dim: u32, score: f64) -> TrialRecord {
        let stage = Stage::Transformer(TransformerStage {
            depth: 1,
            n_head: 1,
            key_dim,
            ff_multiplier: 1.0,
            kernel_size,
        });
        let config = ArchConfig::new(0, 1).with_stage(SlotId::Block(0), stage);
        TrialRecord::new(0, 0, config, Metrics::new(), score, 1.0)
    }

    fn kernel_trials() -> Vec<TrialRecord> {
        vec![
            transformer_trial(1, 4, 0.35),
            transformer_trial(1, 4, 0.45),
            transformer_trial(3, 4, 0.30),
            transformer_trial(3, 4, 0.30),
            transformer_trial(5, 4, 0.55),
            transformer_trial(5, 4, 0.55),
        ]
    }

    fn kernel_path() -> DimensionPath {
        DimensionPath::hyper(SlotId::Block(0), StageKind::Transformer, "kernel_size").unwrap()
    }

    #[test]
    fn table_reports_means_and_support() {
        let space = transformer_space(values![1, 3, 5, 7], values![4]);
        let table = analyze(&space, &kernel_trials());
        let row = |v: i64| {
            table
                .rows
                .iter()
                .find(|r| r.path == kernel_path() && r.value == Value::Int(v))
                .unwrap()
                .clone()
        };
        assert_eq!(row(3).support, 2);
        assert!((row(1).mean.unwrap() - 0.40).abs() < 1e-9);
        assert_eq!(row(7).mean, None);
        assert_eq!(row(7).support, 0);
        assert_eq!(table.unsupported().count(), 1);
    }

    #[test]
    fn removes_worst_kernel_then_next() {
        let config = NarrowingConfig::default().with_threshold(0.05);
        let space = transformer_space(values![1, 3, 5], values![4]);
        let trials = kernel_trials();

        let first = narrow(&analyze(&space, &trials), &space, &config, 0).unwrap();
        assert!(first.changed);
        assert_eq!(first.removals.len(), 1);
        let removal = &first.removals[0];
        assert_eq!(removal.removed_value, Value::Int(5));
        assert!((removal.evidence.margin - 0.25).abs() < 1e-9);
        assert_eq!(removal.evidence.best_value, Value::Int(3));
        assert_eq!(first.space.domain(&kernel_path()).unwrap(), values![1, 3]);

        let remaining = valid_trials(&trials, &first.removals);
        assert_eq!(remaining.len(), 4);
        let second = narrow(&analyze(&first.space, &remaining), &first.space, &config, 0).unwrap();
        assert_eq!(second.removals[0].removed_value, Value::Int(1));
        assert_eq!(second.space.domain(&kernel_path()).unwrap(), values![3]);

        // a single remaining value is frozen
        let third_trials = valid_trials(&remaining, &second.removals);
        let third = narrow(&analyze(&second.space, &third_trials), &second.space, &config, 0).unwrap();
        assert!(!third.changed);
    }

    #[test]
    fn margin_below_threshold_is_kept() {
        let config = NarrowingConfig::default().with_threshold(0.15);
        let space = transformer_space(values![1, 3], values![4]);
        let trials: Vec<TrialRecord> = kernel_trials()
            .into_iter()
            .filter(|t| t.config.value_at(&kernel_path()) != Some(Value::Int(5)))
            .collect();
        let table = analyze(&space, &trials);
        assert!(!table.has_removable(&space, &config));
    }

    #[test]
    fn relative_margin() {
        let space = transformer_space(values![1, 3], values![4]);
        let trials = vec![transformer_trial(1, 4, 0.40), transformer_trial(3, 4, 0.30)];
        let table = analyze(&space, &trials);

        let absolute = NarrowingConfig::default().with_threshold(0.3);
        assert!(!table.has_removable(&space, &absolute));

        let relative = absolute.with_margin(MarginMode::Relative);
        let candidates = table.candidates(&space, &relative);
        assert_eq!(candidates.len(), 1);
        assert!((candidates[0].evidence.margin - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn direction_override_flips_ranking() {
        let space = transformer_space(values![1, 3, 5], values![4]);
        let config = NarrowingConfig::default()
            .with_override(kernel_path(), ObjectiveDirection::Maximize);
        let outcome = narrow(&analyze(&space, &kernel_trials()), &space, &config, 0).unwrap();
        assert_eq!(outcome.removals[0].removed_value, Value::Int(3));
    }

    #[test]
    fn min_support_excludes_thin_values() {
        let space = transformer_space(values![1, 3, 5], values![4]);
        let mut trials = kernel_trials();
        trials.pop();
        let config = NarrowingConfig::default().with_min_support(2);
        let outcome = narrow(&analyze(&space, &trials), &space, &config, 0).unwrap();
        assert_eq!(outcome.removals[0].removed_value, Value::Int(1));
    }

    #[test]
    fn one_per_pass_versus_per_dimension() {
        let space = transformer_space(values![1, 3, 5], values![4, 8]);
        let trials = vec![
            transformer_trial(1, 4, 0.30),
            transformer_trial(3, 4, 0.30),
            transformer_trial(5, 8, 0.90),
            transformer_trial(1, 8, 0.60),
        ];
        let table = analyze(&space, &trials);

        let one = narrow(&table, &space, &NarrowingConfig::default(), 0).unwrap();
        assert_eq!(one.removals.len(), 1);
        assert_eq!(one.removals[0].dimension_path, kernel_path());
        assert_eq!(one.removals[0].removed_value, Value::Int(5));

        let per_dim = NarrowingConfig::default().with_mode(NarrowingMode::PerDimension);
        let all = narrow(&table, &space, &per_dim, 0).unwrap();
        assert_eq!(all.removals.len(), 2);
        let key_dim =
            DimensionPath::hyper(SlotId::Block(0), StageKind::Transformer, "key_dim").unwrap();
        assert_eq!(all.space.domain(&key_dim).unwrap(), values![4]);
        assert_eq!(space.domain(&key_dim).unwrap(), values![4, 8]);
    }

    #[test]
    fn stage_types_compete_within_their_family() {
        let space = SearchSpace::new()
            .with_blocks(StructuralDim::TwoDimBlocks, vec![0])
            .with_blocks(StructuralDim::OneDimBlocks, vec![1])
            .with_slot(
                SlotId::Block(0),
                SlotDomain::new()
                    .with_stage(
                        StageKind::BiGru,
                        StageDomain::new().with("depth", values![1]).with("units", values![16]),
                    )
                    .with_stage(
                        StageKind::SimpleDense,
                        StageDomain::new()
                            .with("depth", values![1])
                            .with("units", values![8])
                            .with("activation", values!["relu"])
                            .with("dropout_rate", values![0.0]),
                    )
                    .with_stage(
                        StageKind::Dprnn,
                        StageDomain::new()
                            .with("depth", values![1])
                            .with("units", values![16])
                            .with("bidirectional", values![true])
                            .with("rnn", values!["GRU"]),
                    ),
            )
            .validate()
            .unwrap();

        let trial = |stage: Stage, score: f64| {
            let config = ArchConfig::new(0, 1).with_stage(SlotId::Block(0), stage);
            TrialRecord::new(0, 0, config, Metrics::new(), score, 1.0)
        };
        let trials = vec![
            trial(Stage::BiGru(BiGruStage { depth: 1, units: 16 }), 0.9),
            trial(
                Stage::SimpleDense(SimpleDenseStage {
                    depth: 1,
                    units: 8,
                    activation: "relu".into(),
                    dropout_rate: 0.0,
                }),
                0.2,
            ),
            trial(
                Stage::Dprnn(DprnnStage {
                    depth: 1,
                    units: 16,
                    bidirectional: true,
                    rnn: RnnCell::Gru,
                }),
                0.95,
            ),
        ];

        let outcome = narrow(&analyze(&space, &trials), &space, &NarrowingConfig::default(), 3).unwrap();
        assert_eq!(outcome.removals.len(), 1);
        assert_eq!(
            outcome.removals[0].choice(),
            Choice::stage(SlotId::Block(0), StageKind::BiGru)
        );
        assert_eq!(outcome.removals[0].round, 3);
        assert!(outcome.space.contains(&Choice::stage(SlotId::Block(0), StageKind::Dprnn)));
    }

    #[test]
    fn no_trials_means_nothing_removable() {
        let space = transformer_space(values![1, 3, 5], values![4, 8]);
        let table = analyze(&space, &[]);
        assert!(table.rows.iter().all(|r| r.mean.is_none()));
        let outcome = narrow(&table, &space, &NarrowingConfig::default(), 0).unwrap();
        assert!(!outcome.changed);
        assert_eq!(outcome.space, space);
    }
}
