//! Drawing valid, canonical configurations from a search space.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;
use wn_types::{
    ArchConfig, SearchError, SearchSpace, SlotId, Stage, StageDomain, StageFamily, StageKind,
    StructuralDim, Value, WnResult,
};

use crate::complexity::InputShape;
use crate::constraint::Constraint;

/// Running counters for one sampler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplerStats {
    pub draws: usize,
    /// Draws that could not fill a slot (no stage type of the needed family).
    pub unfillable: usize,
    pub rejections: usize,
    pub exhausted: usize,
}

/// Uniform hierarchical sampler: block counts, then one stage type per active
/// slot, then one value per hyperparameter of that stage type.
///
/// The random stream is keyed by `(seed, round, trial number)` through
/// [`ConfigSampler::reseed`], so a resumed run draws the same sequence an
/// uninterrupted run would have.
#[derive(Debug, Clone)]
pub struct ConfigSampler {
    seed: u64,
    rng: ChaCha8Rng,
    max_attempts: usize,
    stats: SamplerStats,
}

impl ConfigSampler {
    pub fn new(seed: u64, max_attempts: usize) -> Self {
        Self {
            seed,
            rng: ChaCha8Rng::seed_from_u64(seed),
            max_attempts: max_attempts.max(1),
            stats: SamplerStats::default(),
        }
    }

    pub fn stats(&self) -> SamplerStats {
        self.stats
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Restart the random stream for one trial slot.
    pub fn reseed(&mut self, round: usize, number: usize) {
        let key = self
            .seed
            .wrapping_mul(0x9E37_79B9_7F4A_7C15)
            .wrapping_add((round as u64) << 32)
            .wrapping_add(number as u64);
        self.rng = ChaCha8Rng::seed_from_u64(key);
    }

    /// Draw until `constraint` accepts a postprocessed config, giving up
    /// after `max_attempts` consecutive rejections.
    pub fn sample<C, P>(
        &mut self,
        space: &SearchSpace,
        constraint: &C,
        postprocess: P,
        input: &InputShape,
    ) -> WnResult<ArchConfig>
    where
        C: Constraint + ?Sized,
        P: Fn(ArchConfig) -> ArchConfig,
    {
        for attempt in 1..=self.max_attempts {
            self.stats.draws += 1;
            let Some(raw) = self.draw(space)? else {
                self.stats.unfillable += 1;
                continue;
            };
            let config = postprocess(raw);
            if constraint.allows(&config, input) {
                debug!(attempt, "Sampled config");
                return Ok(config);
            }
            self.stats.rejections += 1;
        }
        self.stats.exhausted += 1;
        Err(SearchError::SamplerExhausted {
            attempts: self.max_attempts,
        }
        .into())
    }

    fn pick<'a, T>(&mut self, items: &'a [T]) -> Option<&'a T> {
        if items.is_empty() {
            None
        } else {
            Some(&items[self.rng.gen_range(0..items.len())])
        }
    }

    fn draw_count(&mut self, space: &SearchSpace, dim: StructuralDim) -> Option<usize> {
        let counts = space.counts(dim);
        self.pick(&counts).copied()
    }

    fn draw_stage(&mut self, kind: StageKind, domain: &StageDomain) -> WnResult<Option<Stage>> {
        let mut values: BTreeMap<String, Value> = BTreeMap::new();
        for (name, _) in kind.hyperparameters() {
            let Some(choices) = domain.hyperparameters.get(*name) else {
                return Ok(None);
            };
            let Some(value) = self.pick(choices) else {
                return Ok(None);
            };
            values.insert(name.to_string(), value.clone());
        }
        Stage::from_assignment(kind, &values).map(Some)
    }

    fn draw_slot(
        &mut self,
        space: &SearchSpace,
        slot: SlotId,
        family: StageFamily,
    ) -> WnResult<Option<Stage>> {
        let Some(domain) = space.slots.get(&slot) else {
            return Ok(None);
        };
        let kinds = domain.kinds(family);
        let Some(kind) = self.pick(&kinds).copied() else {
            return Ok(None);
        };
        match domain.stages.get(&kind) {
            Some(stage_domain) => self.draw_stage(kind, stage_domain),
            None => Ok(None),
        }
    }

    /// One raw draw, or `None` when some active slot has nothing to offer.
    fn draw(&mut self, space: &SearchSpace) -> WnResult<Option<ArchConfig>> {
        let (Some(num_2d), Some(num_1d)) = (
            self.draw_count(space, StructuralDim::TwoDimBlocks),
            self.draw_count(space, StructuralDim::OneDimBlocks),
        ) else {
            return Ok(None);
        };

        let mut config = ArchConfig::new(num_2d, num_1d);
        for i in 0..num_2d + num_1d {
            let family = if i < num_2d {
                StageFamily::TwoDim
            } else {
                StageFamily::OneDim
            };
            match self.draw_slot(space, SlotId::Block(i), family)? {
                Some(stage) => config.slots.insert(SlotId::Block(i), stage),
                None => return Ok(None),
            };
        }

        let heads: Vec<SlotId> = space.slots.keys().copied().filter(SlotId::is_head).collect();
        for head in heads {
            match self.draw_slot(space, head, StageFamily::OneDim)? {
                Some(stage) => config.slots.insert(head, stage),
                None => return Ok(None),
            };
        }
        Ok(Some(config))
    }
}

/// The default postprocess step: canonical form of every stage.
pub fn canonicalize(config: ArchConfig) -> ArchConfig {
    config.canonicalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraint::ConstraintSet;
    use wn_types::presets::accdoa_space;
    use wn_types::{DimensionPath, Choice};

    fn accept_all(_: &ArchConfig, _: &InputShape) -> bool {
        true
    }

    #[test]
    fn samples_stay_inside_the_space() {
        let space = accdoa_space().unwrap();
        let mut sampler = ConfigSampler::new(7, 100);
        let input = InputShape::default();
        for n in 0..50 {
            sampler.reseed(0, n);
            let config = sampler
                .sample(&space, &ConstraintSet::new(), canonicalize, &input)
                .unwrap();
            let blocks = config.count(StructuralDim::TwoDimBlocks)
                + config.count(StructuralDim::OneDimBlocks);
            assert_eq!(config.blocks().count(), blocks);
            for (i, stage) in config.blocks() {
                let family = stage.kind().family();
                if i < config.count(StructuralDim::TwoDimBlocks) {
                    assert_eq!(family, StageFamily::TwoDim);
                } else {
                    assert_eq!(family, StageFamily::OneDim);
                }
            }
            assert!(config.head(SlotId::Doa).is_some());
            assert_eq!(config.clone().canonicalize(), config);
        }
    }

    #[test]
    fn reseeding_reproduces_draws() {
        let space = accdoa_space().unwrap();
        let input = InputShape::default();
        let mut a = ConfigSampler::new(11, 100);
        let mut b = ConfigSampler::new(11, 100);

        a.reseed(2, 5);
        let first = a.sample(&space, &accept_all, canonicalize, &input).unwrap();
        // b consumes some unrelated draws first
        b.reseed(0, 0);
        b.sample(&space, &accept_all, canonicalize, &input).unwrap();
        b.reseed(2, 5);
        let second = b.sample(&space, &accept_all, canonicalize, &input).unwrap();
        assert_eq!(first, second);

        a.reseed(2, 6);
        let other = a.sample(&space, &accept_all, canonicalize, &input).unwrap();
        assert_ne!(first.fingerprint(), other.fingerprint());
    }

    #[test]
    fn removed_values_are_never_sampled() {
        let space = accdoa_space().unwrap();
        let path = DimensionPath::Stage(SlotId::Doa);
        let removed = [
            Choice::stage(SlotId::Doa, StageKind::Transformer),
            Choice::stage(SlotId::Doa, StageKind::Conformer),
            Choice::stage(SlotId::Doa, StageKind::SimpleDense),
        ];
        let narrowed = space.without(&removed).unwrap();
        let mut sampler = ConfigSampler::new(3, 100);
        for n in 0..20 {
            sampler.reseed(1, n);
            let config = sampler
                .sample(&narrowed, &accept_all, canonicalize, &InputShape::default())
                .unwrap();
            assert_eq!(config.value_at(&path), Some(Value::text("bidirectional_GRU_stage")));
        }
    }

    #[test]
    fn impossible_constraint_exhausts() {
        let space = accdoa_space().unwrap();
        let reject = |_: &ArchConfig, _: &InputShape| false;
        let mut sampler = ConfigSampler::new(1, 25);
        let err = sampler
            .sample(&space, &reject, canonicalize, &InputShape::default())
            .unwrap_err();
        assert!(!err.is_fatal());
        let stats = sampler.stats();
        assert_eq!(stats.draws, 25);
        assert_eq!(stats.rejections + stats.unfillable, 25);
        assert_eq!(stats.exhausted, 1);
    }

    #[test]
    fn unfillable_slots_count_as_attempts() {
        // BLOCK0 offers only 1D stages but every draw needs a 2D block there
        let space = accdoa_space().unwrap();
        let removed = [
            Choice::stage(SlotId::Block(0), StageKind::Mother),
            Choice::stage(SlotId::Block(0), StageKind::Dprnn),
        ];
        let narrowed = space.without(&removed).unwrap();
        let mut sampler = ConfigSampler::new(1, 10);
        assert!(sampler
            .sample(&narrowed, &accept_all, canonicalize, &InputShape::default())
            .is_err());
        assert_eq!(sampler.stats().unfillable, 10);
    }
}
