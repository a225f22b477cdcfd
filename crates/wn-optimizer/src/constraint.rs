//! Hard structural and resource-budget rules applied to sampled configs.

use serde::{Deserialize, Serialize};
use wn_types::{ArchConfig, SlotId, Stage, StageKind, StructuralDim};

use crate::complexity::{estimate, InputShape};

/// A side-effect-free accept/reject check. Rejection is an expected outcome
/// that makes the sampler draw again, never an error.
pub trait Constraint: Send + Sync {
    fn allows(&self, config: &ArchConfig, input: &InputShape) -> bool;
}

impl<F> Constraint for F
where
    F: Fn(&ArchConfig, &InputShape) -> bool + Send + Sync,
{
    fn allows(&self, config: &ArchConfig, input: &InputShape) -> bool {
        self(config, input)
    }
}

/// One declarative rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum Rule {
    /// Estimated FLOPs per example must fall within the bounds.
    FlopsBudget { min: Option<u64>, max: Option<u64> },
    /// Estimated parameter count must fall within the bounds.
    ParamsBudget { min: Option<u64>, max: Option<u64> },
    /// When `slot` is active it must use `stage`.
    FixedStage { slot: SlotId, stage: StageKind },
    /// `slot` must never use `stage`.
    ForbiddenStage { slot: SlotId, stage: StageKind },
    /// A lone convolution must be `filters1`; two convolutions that include
    /// `filters1` must downsample.
    MotherConvLayout,
    MaxOneDimBlocks { max: usize },
}

fn within(value: u64, min: Option<u64>, max: Option<u64>) -> bool {
    min.map_or(true, |m| value >= m) && max.map_or(true, |m| value <= m)
}

impl Rule {
    fn allows(&self, config: &ArchConfig, input: &InputShape) -> bool {
        match self {
            Rule::FlopsBudget { min, max } => {
                estimate(config, input).map_or(false, |c| within(c.flops, *min, *max))
            }
            Rule::ParamsBudget { min, max } => {
                estimate(config, input).map_or(false, |c| within(c.params, *min, *max))
            }
            Rule::FixedStage { slot, stage } => config
                .slots
                .get(slot)
                .map_or(true, |s| s.kind() == *stage),
            Rule::ForbiddenStage { slot, stage } => config
                .slots
                .get(slot)
                .map_or(true, |s| s.kind() != *stage),
            Rule::MotherConvLayout => config.slots.values().all(|stage| match stage {
                Stage::Mother(m) => match m.active_convs() {
                    1 => m.filters1 > 0,
                    2 => m.filters1 == 0 || m.strides != [1, 1],
                    _ => true,
                },
                _ => true,
            }),
            Rule::MaxOneDimBlocks { max } => config.count(StructuralDim::OneDimBlocks) <= *max,
        }
    }
}

/// A conjunction of rules. Every config must also be buildable on the input
/// shape, so unbuildable configs are rejected even with no rules.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConstraintSet {
    pub rules: Vec<Rule>,
}

impl ConstraintSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    /// The rules used by the ACCDOA search: a parameter cap and the mother
    /// block layout rule.
    pub fn accdoa(max_params: u64) -> Self {
        Self::new()
            .with(Rule::ParamsBudget {
                min: None,
                max: Some(max_params),
            })
            .with(Rule::MotherConvLayout)
    }
}

impl Constraint for ConstraintSet {
    fn allows(&self, config: &ArchConfig, input: &InputShape) -> bool {
        estimate(config, input).is_some() && self.rules.iter().all(|r| r.allows(config, input))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wn_types::{BiGruStage, MotherStage, SimpleDenseStage};

    fn mother(filters: [u32; 3], strides: [u32; 2]) -> Stage {
        Stage::Mother(MotherStage {
            depth: 1,
            filters0: filters[0],
            filters1: filters[1],
            filters2: filters[2],
            kernel_size0: 3,
            kernel_size1: 3,
            kernel_size2: 3,
            connect0: [1],
            connect1: [1, 1],
            connect2: [1, 1, 1],
            strides,
        })
    }

    fn config(block: Stage) -> ArchConfig {
        ArchConfig::new(1, 0)
            .with_stage(SlotId::Block(0), block)
            .with_stage(SlotId::Doa, Stage::BiGru(BiGruStage { depth: 1, units: 16 }))
    }

    #[test]
    fn conv_layout_rule() {
        let input = InputShape::default();
        let rule = Rule::MotherConvLayout;
        assert!(rule.allows(&config(mother([0, 8, 0], [1, 1])), &input));
        assert!(!rule.allows(&config(mother([8, 0, 0], [1, 2])), &input));
        assert!(!rule.allows(&config(mother([8, 8, 0], [1, 1])), &input));
        assert!(rule.allows(&config(mother([8, 8, 0], [1, 2])), &input));
        assert!(rule.allows(&config(mother([8, 0, 8], [1, 1])), &input));
    }

    #[test]
    fn budgets_use_the_estimator() {
        let input = InputShape::default();
        let cfg = config(mother([0, 8, 0], [1, 2]));
        let params = estimate(&cfg, &input).unwrap().params;

        let tight = ConstraintSet::new().with(Rule::ParamsBudget {
            min: None,
            max: Some(params - 1),
        });
        let loose = ConstraintSet::accdoa(params);
        assert!(!tight.allows(&cfg, &input));
        assert!(loose.allows(&cfg, &input));

        let floor = ConstraintSet::new().with(Rule::FlopsBudget {
            min: Some(u64::MAX),
            max: None,
        });
        assert!(!floor.allows(&cfg, &input));
    }

    #[test]
    fn params_budget_counts_head_outputs() {
        let cfg = config(mother([0, 8, 0], [1, 2]));
        let few = InputShape::default().with_classes(3);
        let many = InputShape::default().with_classes(13);
        let small = estimate(&cfg, &few).unwrap().params;
        let large = estimate(&cfg, &many).unwrap().params;
        assert!(large > small);

        let budget = ConstraintSet::accdoa(small + (large - small) / 2);
        assert!(budget.allows(&cfg, &few));
        assert!(!budget.allows(&cfg, &many));
    }

    #[test]
    fn stage_pins_and_bans() {
        let input = InputShape::default();
        let cfg = config(mother([0, 8, 0], [1, 2]));
        let pin_doa = Rule::FixedStage {
            slot: SlotId::Doa,
            stage: StageKind::SimpleDense,
        };
        assert!(!pin_doa.allows(&cfg, &input));
        let pin_sed = Rule::FixedStage {
            slot: SlotId::Sed,
            stage: StageKind::SimpleDense,
        };
        assert!(pin_sed.allows(&cfg, &input));

        let ban = Rule::ForbiddenStage {
            slot: SlotId::Block(0),
            stage: StageKind::Mother,
        };
        assert!(!ban.allows(&cfg, &input));
    }

    #[test]
    fn unbuildable_configs_are_always_rejected() {
        let input = InputShape::from([300, 2, 7]);
        let cfg = config(mother([0, 8, 0], [1, 3]));
        assert!(!ConstraintSet::new().allows(&cfg, &input));
    }

    #[test]
    fn closures_are_constraints() {
        let only_small = |c: &ArchConfig, _: &InputShape| c.count(StructuralDim::TwoDimBlocks) <= 1;
        let cfg = ArchConfig::new(1, 1)
            .with_stage(SlotId::Block(0), mother([0, 8, 0], [1, 1]))
            .with_stage(
                SlotId::Block(1),
                Stage::SimpleDense(SimpleDenseStage {
                    depth: 1,
                    units: 8,
                    activation: "relu".into(),
                    dropout_rate: 0.0,
                }),
            );
        assert!(only_small.allows(&cfg, &InputShape::default()));
        assert!(Rule::MaxOneDimBlocks { max: 1 }.allows(&cfg, &InputShape::default()));
        assert!(!Rule::MaxOneDimBlocks { max: 0 }.allows(&cfg, &InputShape::default()));
    }

    #[test]
    fn rules_serialize_with_tag() {
        let set = ConstraintSet::accdoa(10_000_000);
        let json = serde_json::to_value(&set).unwrap();
        assert_eq!(json[0]["rule"], "params_budget");
        assert_eq!(json[1]["rule"], "mother_conv_layout");
        let back: ConstraintSet = serde_json::from_value(json).unwrap();
        assert_eq!(back, set);
    }
}
