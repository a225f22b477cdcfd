//! Deterministic compute and size estimates for sampled architectures.
//!
//! The estimate walks the blocks in order, tracking the feature shape, and
//! counts weights plus multiply-accumulates per frame. Each output head ends
//! in a linear projection onto the class outputs: `classes` for SED and
//! `3 * classes` for DOA. It is used for budget constraints, not for
//! reporting exact model size.

use serde::{Deserialize, Serialize};
use wn_types::{ArchConfig, SlotId, Stage, StageFamily};

const DEFAULT_CLASSES: u64 = 12;

fn default_classes() -> u64 {
    DEFAULT_CLASSES
}

/// Shape of one example: frames x frequency bins x channels in, and the
/// number of sound event classes the heads predict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputShape {
    pub time: u64,
    pub freq: u64,
    pub channels: u64,
    #[serde(default = "default_classes")]
    pub classes: u64,
}

impl InputShape {
    pub fn with_classes(mut self, classes: u64) -> Self {
        self.classes = classes;
        self
    }
}

impl Default for InputShape {
    fn default() -> Self {
        Self {
            time: 300,
            freq: 64,
            channels: 7,
            classes: DEFAULT_CLASSES,
        }
    }
}

impl From<[u64; 3]> for InputShape {
    fn from([time, freq, channels]: [u64; 3]) -> Self {
        Self {
            time,
            freq,
            channels,
            classes: DEFAULT_CLASSES,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Complexity {
    pub flops: u64,
    pub params: u64,
}

impl Complexity {
    fn add(&mut self, params: u64, flops: u64) {
        self.params += params;
        self.flops += flops;
    }
}

#[derive(Debug, Clone, Copy)]
enum Shape {
    Map { time: u64, freq: u64, channels: u64 },
    Seq { time: u64, features: u64 },
}

impl Shape {
    fn flatten(self) -> (u64, u64) {
        match self {
            Shape::Map {
                time,
                freq,
                channels,
            } => (time, freq * channels),
            Shape::Seq { time, features } => (time, features),
        }
    }
}

/// Estimate cost, or `None` when the architecture cannot be built on this
/// input (a stride collapses an axis, or a 2D stage follows a 1D one).
pub fn estimate(config: &ArchConfig, input: &InputShape) -> Option<Complexity> {
    let mut total = Complexity::default();
    let mut shape = Shape::Map {
        time: input.time,
        freq: input.freq,
        channels: input.channels,
    };

    for (_, stage) in config.blocks() {
        shape = apply(stage, shape, &mut total)?;
    }
    for (slot, stage) in &config.slots {
        let outputs = match slot {
            SlotId::Sed => input.classes,
            SlotId::Doa => 3 * input.classes,
            SlotId::Block(_) => continue,
        };
        let (time, features) = shape.flatten();
        let head = apply(stage, Shape::Seq { time, features }, &mut total)?;
        let (time, features) = head.flatten();
        total.add(features * outputs + outputs, 2 * features * outputs * time);
    }
    Some(total)
}

fn apply(stage: &Stage, shape: Shape, total: &mut Complexity) -> Option<Shape> {
    match (stage.kind().family(), shape) {
        (
            StageFamily::TwoDim,
            Shape::Map {
                time,
                freq,
                channels,
            },
        ) => two_dim(stage, time, freq, channels, total),
        (StageFamily::TwoDim, Shape::Seq { .. }) => None,
        (StageFamily::OneDim, shape) => {
            let (time, features) = shape.flatten();
            one_dim(stage, time, features, total)
        }
    }
}

fn two_dim(
    stage: &Stage,
    mut time: u64,
    mut freq: u64,
    mut channels: u64,
    total: &mut Complexity,
) -> Option<Shape> {
    match stage {
        Stage::Mother(s) => {
            let branches = [
                (s.filters0 as u64, s.kernel_size0 as u64),
                (s.filters1 as u64, s.kernel_size1 as u64),
                (s.filters2 as u64, s.kernel_size2 as u64),
            ];
            let out = branches.iter().rev().find(|(f, _)| *f > 0)?.0;
            for rep in 0..s.depth {
                for (filters, kernel) in branches.iter().filter(|(f, _)| *f > 0) {
                    let weights = kernel * kernel * channels * filters;
                    total.add(weights + filters, 2 * weights * time * freq);
                }
                channels = out;
                if rep == 0 {
                    time = time.checked_div(s.strides[0] as u64)?;
                    freq = freq.checked_div(s.strides[1] as u64)?;
                    if time == 0 || freq == 0 {
                        return None;
                    }
                }
            }
        }
        Stage::Dprnn(s) => {
            let directions = if s.bidirectional { 2 } else { 1 };
            let units = s.units as u64;
            for _ in 0..s.depth {
                let rnn = directions * s.rnn.gates() * (units * channels + units * units + units);
                let projection = directions * units * channels + channels;
                let params = 2 * (rnn + projection);
                total.add(params, 2 * params * time * freq);
            }
        }
        _ => return None,
    }
    Some(Shape::Map {
        time,
        freq,
        channels,
    })
}

fn one_dim(stage: &Stage, time: u64, mut features: u64, total: &mut Complexity) -> Option<Shape> {
    match stage {
        Stage::BiGru(s) => {
            let units = s.units as u64;
            for _ in 0..s.depth {
                let params = 2 * 3 * (units * features + units * units + 2 * units);
                total.add(params, 2 * params * time);
                features = 2 * units;
            }
        }
        Stage::Transformer(s) => {
            let inner = (s.n_head * s.key_dim) as u64;
            let hidden = ((features as f64 * s.ff_multiplier).round() as u64).max(1);
            for _ in 0..s.depth {
                let attention = 4 * features * inner;
                let feed_forward = 2 * features * hidden + hidden + features;
                let conv = s.kernel_size as u64 * features;
                let params = attention + feed_forward + conv;
                total.add(params, 2 * params * time + 2 * time * time * inner);
            }
        }
        Stage::SimpleDense(s) => {
            let units = s.units as u64;
            for _ in 0..s.depth {
                total.add(features * units + units, 2 * features * units * time);
                features = units;
            }
        }
        Stage::Conformer(s) => {
            let inner = (s.n_head * s.key_dim) as u64;
            let expanded = features * s.multiplier as u64;
            for _ in 0..s.depth {
                let attention = 4 * features * inner;
                let feed_forward = 2 * (2 * features * expanded + expanded + features);
                let conv = 2 * features * features + s.kernel_size as u64 * features + features * features;
                let params = attention + feed_forward + conv;
                total.add(params, 2 * params * time + 2 * time * time * inner);
            }
        }
        _ => return None,
    }
    Some(Shape::Seq { time, features })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wn_types::{BiGruStage, MotherStage, SimpleDenseStage};

    fn mother(filters: [u32; 3], strides: [u32; 2], depth: u32) -> Stage {
        Stage::Mother(MotherStage {
            depth,
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

    #[test]
    fn bigru_head_matches_hand_count() {
        let config = ArchConfig::new(0, 0)
            .with_stage(SlotId::Doa, Stage::BiGru(BiGruStage { depth: 1, units: 8 }));
        let input = InputShape::from([10, 4, 2]);
        let c = estimate(&config, &input).unwrap();
        // features = 4 * 2 = 8, then 16 GRU outputs onto 3 * 12 DOA outputs
        let gru = 2 * 3 * (8 * 8 + 8 * 8 + 2 * 8);
        let projection = 16 * 36 + 36;
        assert_eq!(c.params, gru + projection);
        assert_eq!(c.flops, 2 * gru * 10 + 2 * 16 * 36 * 10);
    }

    #[test]
    fn heads_project_onto_class_outputs() {
        let dense = || {
            Stage::SimpleDense(SimpleDenseStage {
                depth: 1,
                units: 10,
                activation: "relu".to_string(),
                dropout_rate: 0.0,
            })
        };
        let config = ArchConfig::new(0, 0)
            .with_stage(SlotId::Sed, dense())
            .with_stage(SlotId::Doa, dense());
        let input = InputShape::from([5, 4, 2]);
        let twelve = estimate(&config, &input).unwrap();
        let three = estimate(&config, &input.with_classes(3)).unwrap();
        // SED 10 -> n, DOA 10 -> 3n
        let heads = |n: u64| (10 * n + n) + (10 * 3 * n + 3 * n);
        assert_eq!(twelve.params - three.params, heads(12) - heads(3));
        assert_eq!(twelve.params, 2 * (8 * 10 + 10) + heads(12));
    }

    #[test]
    fn more_filters_cost_more() {
        let input = InputShape::default();
        let small = ArchConfig::new(1, 0).with_stage(SlotId::Block(0), mother([0, 4, 0], [1, 2], 1));
        let large = ArchConfig::new(1, 0).with_stage(SlotId::Block(0), mother([0, 32, 0], [1, 2], 1));
        let a = estimate(&small, &input).unwrap();
        let b = estimate(&large, &input).unwrap();
        assert!(b.params > a.params);
        assert!(b.flops > a.flops);
    }

    #[test]
    fn collapsing_strides_are_unbuildable() {
        let mut config = ArchConfig::new(4, 0);
        for i in 0..4 {
            config = config.with_stage(SlotId::Block(i), mother([0, 4, 0], [1, 3], 1));
        }
        // 64 -> 21 -> 7 -> 2 -> 0
        assert!(estimate(&config, &InputShape::default()).is_none());
    }

    #[test]
    fn two_dim_after_one_dim_is_unbuildable() {
        let config = ArchConfig::new(1, 1)
            .with_stage(SlotId::Block(0), Stage::BiGru(BiGruStage { depth: 1, units: 8 }))
            .with_stage(SlotId::Block(1), mother([0, 4, 0], [1, 1], 1));
        assert!(estimate(&config, &InputShape::default()).is_none());
    }

    #[test]
    fn mother_without_active_conv_is_unbuildable() {
        let config = ArchConfig::new(1, 0).with_stage(SlotId::Block(0), mother([0, 0, 0], [1, 1], 1));
        assert!(estimate(&config, &InputShape::default()).is_none());
    }
}
