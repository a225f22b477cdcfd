//! Concrete architecture configurations.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::space::{Choice, DimensionPath, SlotId, StructuralDim};
use crate::stage::Stage;
use crate::value::Value;

/// One concrete assignment: block counts plus a typed stage for every
/// active slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchConfig {
    pub structure: BTreeMap<StructuralDim, usize>,
    pub slots: BTreeMap<SlotId, Stage>,
}

impl ArchConfig {
    pub fn new(num_2d: usize, num_1d: usize) -> Self {
        let mut structure = BTreeMap::new();
        structure.insert(StructuralDim::TwoDimBlocks, num_2d);
        structure.insert(StructuralDim::OneDimBlocks, num_1d);
        Self {
            structure,
            slots: BTreeMap::new(),
        }
    }

    pub fn with_stage(mut self, slot: SlotId, stage: Stage) -> Self {
        self.slots.insert(slot, stage);
        self
    }

    pub fn count(&self, dim: StructuralDim) -> usize {
        self.structure.get(&dim).copied().unwrap_or(0)
    }

    /// Active blocks in positional order.
    pub fn blocks(&self) -> impl Iterator<Item = (usize, &Stage)> {
        self.slots.iter().filter_map(|(slot, stage)| match slot {
            SlotId::Block(i) => Some((*i, stage)),
            _ => None,
        })
    }

    pub fn head(&self, slot: SlotId) -> Option<&Stage> {
        self.slots.get(&slot).filter(|_| slot.is_head())
    }

    /// The value this config used at `path`, if that dimension was active.
    pub fn value_at(&self, path: &DimensionPath) -> Option<Value> {
        match path {
            DimensionPath::Structure(dim) => {
                self.structure.get(dim).map(|c| Value::Int(*c as i64))
            }
            DimensionPath::Stage(slot) => self
                .slots
                .get(slot)
                .map(|s| Value::text(s.kind().as_str())),
            DimensionPath::Hyper { slot, stage, name } => self
                .slots
                .get(slot)
                .filter(|s| s.kind() == *stage)
                .and_then(|s| s.get(name)),
        }
    }

    pub fn uses(&self, choice: &Choice) -> bool {
        self.value_at(&choice.path).as_ref() == Some(&choice.value)
    }

    /// Canonical form: every stage with its inactive fields neutralized.
    pub fn canonicalize(mut self) -> Self {
        self.slots = self
            .slots
            .into_iter()
            .map(|(slot, stage)| (slot, stage.canonicalize()))
            .collect();
        self
    }

    /// Stable deduplication key. Maps are ordered, so equal configs always
    /// serialize identically.
    pub fn fingerprint(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{self:?}"))
    }
}
