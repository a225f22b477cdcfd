//! The search-space model: every currently valid choice, as an immutable
//! snapshot. Narrowing never mutates a space in place; it produces a new one.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::errors::{SpaceError, WnError, WnResult};
use crate::stage::{StageFamily, StageKind, ValueKind};
use crate::validation_error;
use crate::value::Value;

/// A structural position in the model that selects one stage type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum SlotId {
    /// Positional block; 2D blocks come first, 1D blocks after.
    Block(usize),
    /// Sound-event-detection output head.
    Sed,
    /// Direction-of-arrival output head.
    Doa,
}

impl SlotId {
    pub fn is_head(&self) -> bool {
        matches!(self, Self::Sed | Self::Doa)
    }

    /// Heads sit on top of sequence features and only take 1D stages.
    pub fn accepts(&self, family: StageFamily) -> bool {
        match self {
            Self::Block(_) => true,
            Self::Sed | Self::Doa => family == StageFamily::OneDim,
        }
    }
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Block(i) => write!(f, "BLOCK{i}"),
            Self::Sed => write!(f, "SED"),
            Self::Doa => write!(f, "DOA"),
        }
    }
}

impl FromStr for SlotId {
    type Err = SpaceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SED" => Ok(Self::Sed),
            "DOA" => Ok(Self::Doa),
            _ => s
                .strip_prefix("BLOCK")
                .and_then(|i| i.parse::<usize>().ok())
                .map(Self::Block)
                .ok_or_else(|| SpaceError::UnknownSlot { name: s.to_string() }),
        }
    }
}

impl From<SlotId> for String {
    fn from(slot: SlotId) -> Self {
        slot.to_string()
    }
}

impl TryFrom<String> for SlotId {
    type Error = SpaceError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Global dimensions that decide how many blocks of each family exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StructuralDim {
    #[serde(rename = "num2d")]
    TwoDimBlocks,
    #[serde(rename = "num1d")]
    OneDimBlocks,
}

impl StructuralDim {
    pub const ALL: [StructuralDim; 2] = [Self::TwoDimBlocks, Self::OneDimBlocks];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TwoDimBlocks => "num2d",
            Self::OneDimBlocks => "num1d",
        }
    }
}

/// Address of one removable dimension. The set of valid paths is closed:
/// parsing rejects anything that is not a known slot, stage type, or
/// hyperparameter of that stage type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(into = "String")]
pub enum DimensionPath {
    Structure(StructuralDim),
    Stage(SlotId),
    Hyper {
        slot: SlotId,
        stage: StageKind,
        name: &'static str,
    },
}

impl DimensionPath {
    pub fn hyper(slot: SlotId, stage: StageKind, name: &str) -> WnResult<Self> {
        let (name, _) = stage
            .hyperparameter(name)
            .ok_or_else(|| SpaceError::UnknownHyperparameter {
                stage: stage.to_string(),
                name: name.to_string(),
            })?;
        Ok(Self::Hyper { slot, stage, name })
    }
}

impl std::fmt::Display for DimensionPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Structure(dim) => f.write_str(dim.as_str()),
            Self::Stage(slot) => write!(f, "{slot}"),
            Self::Hyper { slot, stage, name } => write!(f, "{slot}.{stage}.{name}"),
        }
    }
}

impl FromStr for DimensionPath {
    type Err = SpaceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unknown = || SpaceError::UnknownDimension { path: s.to_string() };
        let parts: Vec<&str> = s.split('.').collect();
        match parts.as_slice() {
            [single] => {
                if let Some(dim) = StructuralDim::ALL.into_iter().find(|d| d.as_str() == *single) {
                    return Ok(Self::Structure(dim));
                }
                single.parse().map(Self::Stage).map_err(|_| unknown())
            }
            [slot, stage, name] => {
                let slot: SlotId = slot.parse().map_err(|_| unknown())?;
                let stage: StageKind = stage.parse().map_err(|_| unknown())?;
                let (name, _) = stage.hyperparameter(name).ok_or_else(unknown)?;
                Ok(Self::Hyper { slot, stage, name })
            }
            _ => Err(unknown()),
        }
    }
}

impl From<DimensionPath> for String {
    fn from(path: DimensionPath) -> Self {
        path.to_string()
    }
}

// Hand-written: the derive would tie `name` to the input lifetime.
impl<'de> Deserialize<'de> for DimensionPath {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One value at one dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    pub path: DimensionPath,
    pub value: Value,
}

impl Choice {
    pub fn new(path: DimensionPath, value: Value) -> Self {
        Self { path, value }
    }

    pub fn stage(slot: SlotId, kind: StageKind) -> Self {
        Self::new(DimensionPath::Stage(slot), Value::text(kind.as_str()))
    }
}

impl std::fmt::Display for Choice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.path, self.value)
    }
}

/// Per-hyperparameter domains of one stage type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageDomain {
    pub hyperparameters: BTreeMap<String, Vec<Value>>,
}

impl StageDomain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, values: Vec<Value>) -> Self {
        self.hyperparameters.insert(name.into(), values);
        self
    }
}

/// Stage types currently selectable in one slot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotDomain {
    pub stages: BTreeMap<StageKind, StageDomain>,
}

impl SlotDomain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stage(mut self, kind: StageKind, domain: StageDomain) -> Self {
        self.stages.insert(kind, domain);
        self
    }

    pub fn kinds(&self, family: StageFamily) -> Vec<StageKind> {
        self.stages
            .keys()
            .copied()
            .filter(|k| k.family() == family)
            .collect()
    }
}

/// Result of a single removal: the new space plus the choices that were
/// actually eliminated (a cascade replaces the requested choice with the
/// stage-type choice that owned it).
#[derive(Debug, Clone)]
pub struct Narrowed {
    pub space: SearchSpace,
    pub removed: Vec<Choice>,
}

/// All currently valid choices.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    pub structure: BTreeMap<StructuralDim, Vec<Value>>,
    pub slots: BTreeMap<SlotId, SlotDomain>,
}

fn dedup(values: &[Value]) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::with_capacity(values.len());
    for v in values {
        if !out.contains(v) {
            out.push(v.clone());
        }
    }
    out
}

fn invalid_removal(choice: &DimensionPath, value: &Value, reason: &str) -> WnError {
    SpaceError::InvalidRemoval {
        path: choice.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

impl SearchSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_blocks(mut self, dim: StructuralDim, counts: Vec<usize>) -> Self {
        self.structure
            .insert(dim, counts.into_iter().map(|c| Value::Int(c as i64)).collect());
        self
    }

    pub fn with_slot(mut self, slot: SlotId, domain: SlotDomain) -> Self {
        self.slots.insert(slot, domain);
        self
    }

    /// Check and normalize a space: names must be known, value shapes must
    /// match their hyperparameter, and no domain may be empty.
    pub fn validate(mut self) -> WnResult<Self> {
        for dim in StructuralDim::ALL {
            let values = self.structure.get_mut(&dim).ok_or_else(|| SpaceError::EmptyDomain {
                path: dim.as_str().to_string(),
            })?;
            if values.is_empty() {
                return Err(SpaceError::EmptyDomain {
                    path: dim.as_str().to_string(),
                }
                .into());
            }
            for v in values.iter_mut() {
                *v = ValueKind::Int.coerce(v).ok_or_else(|| SpaceError::InvalidValue {
                    path: dim.as_str().to_string(),
                    value: v.to_string(),
                })?;
            }
        }

        for i in 0..self.block_slots() {
            if !self.slots.contains_key(&SlotId::Block(i)) {
                return Err(validation_error!(
                    "block counts allow {} blocks but slot BLOCK{} is not defined",
                    self.block_slots(),
                    i
                ));
            }
        }

        for (slot, domain) in self.slots.iter_mut() {
            for (kind, stage) in domain.stages.iter_mut() {
                if !slot.accepts(kind.family()) {
                    return Err(SpaceError::FamilyMismatch {
                        slot: slot.to_string(),
                        stage: kind.to_string(),
                    }
                    .into());
                }
                for name in stage.hyperparameters.keys() {
                    if kind.hyperparameter(name).is_none() {
                        return Err(SpaceError::UnknownHyperparameter {
                            stage: kind.to_string(),
                            name: name.clone(),
                        }
                        .into());
                    }
                }
                for (name, value_kind) in kind.hyperparameters() {
                    let path = format!("{slot}.{kind}.{name}");
                    let values = stage.hyperparameters.get_mut(*name).ok_or_else(|| {
                        SpaceError::MissingHyperparameter {
                            stage: kind.to_string(),
                            name: name.to_string(),
                        }
                    })?;
                    if values.is_empty() {
                        return Err(SpaceError::EmptyDomain { path }.into());
                    }
                    for v in values.iter_mut() {
                        *v = value_kind.coerce(v).ok_or_else(|| SpaceError::InvalidValue {
                            path: path.clone(),
                            value: v.to_string(),
                        })?;
                    }
                }
            }
        }
        Ok(self)
    }

    fn max_count(&self, dim: StructuralDim) -> usize {
        self.structure
            .get(&dim)
            .into_iter()
            .flatten()
            .filter_map(|v| v.as_i64())
            .max()
            .unwrap_or(0) as usize
    }

    /// Number of block slots the structural dimensions can reach.
    pub fn block_slots(&self) -> usize {
        self.max_count(StructuralDim::TwoDimBlocks) + self.max_count(StructuralDim::OneDimBlocks)
    }

    /// Distinct allowed counts for a structural dimension.
    pub fn counts(&self, dim: StructuralDim) -> Vec<usize> {
        dedup(self.structure.get(&dim).map(Vec::as_slice).unwrap_or(&[]))
            .iter()
            .filter_map(|v| v.as_i64())
            .map(|v| v as usize)
            .collect()
    }

    /// True if every stage type under `slot` has been eliminated.
    pub fn is_empty(&self, slot: SlotId) -> bool {
        self.slots.get(&slot).map_or(true, |d| d.stages.is_empty())
    }

    /// True once any slot or structural dimension has nothing left to offer.
    pub fn is_exhausted(&self) -> bool {
        self.slots.keys().any(|slot| self.is_empty(*slot))
            || StructuralDim::ALL
                .iter()
                .any(|d| self.structure.get(d).map_or(true, Vec::is_empty))
    }

    /// Current distinct values at `path`, or `None` for a path that is not
    /// (or no longer) part of this space.
    pub fn domain(&self, path: &DimensionPath) -> Option<Vec<Value>> {
        match path {
            DimensionPath::Structure(dim) => self.structure.get(dim).map(|v| dedup(v)),
            DimensionPath::Stage(slot) => self.slots.get(slot).map(|d| {
                d.stages
                    .keys()
                    .map(|k| Value::text(k.as_str()))
                    .collect()
            }),
            DimensionPath::Hyper { slot, stage, name } => self
                .slots
                .get(slot)
                .and_then(|d| d.stages.get(stage))
                .and_then(|s| s.hyperparameters.get(*name))
                .map(|v| dedup(v)),
        }
    }

    pub fn contains(&self, choice: &Choice) -> bool {
        self.domain(&choice.path)
            .map_or(false, |d| d.contains(&choice.value))
    }

    /// Enumerate every addressable dimension with its distinct values.
    pub fn dimensions(&self) -> Vec<(DimensionPath, Vec<Value>)> {
        let mut dims = Vec::new();
        for dim in StructuralDim::ALL {
            if let Some(values) = self.structure.get(&dim) {
                dims.push((DimensionPath::Structure(dim), dedup(values)));
            }
        }
        for (slot, domain) in &self.slots {
            let path = DimensionPath::Stage(*slot);
            if let Some(values) = self.domain(&path) {
                dims.push((path, values));
            }
            for (kind, stage) in &domain.stages {
                for (name, _) in kind.hyperparameters() {
                    if let Some(values) = stage.hyperparameters.get(*name) {
                        let path = DimensionPath::Hyper {
                            slot: *slot,
                            stage: *kind,
                            name,
                        };
                        dims.push((path, dedup(values)));
                    }
                }
            }
        }
        dims
    }

    /// Return a new space without `value` at `path`.
    ///
    /// Removing the last value of a hyperparameter removes the owning stage
    /// type from the slot instead. Removing the last structural count is
    /// rejected.
    pub fn remove(&self, path: &DimensionPath, value: &Value) -> WnResult<Narrowed> {
        let mut space = self.clone();
        let removed = match path {
            DimensionPath::Structure(dim) => {
                let values = space
                    .structure
                    .get_mut(dim)
                    .ok_or_else(|| invalid_removal(path, value, "dimension not present"))?;
                if !values.contains(value) {
                    return Err(invalid_removal(path, value, "value not present"));
                }
                values.retain(|v| v != value);
                if values.is_empty() {
                    return Err(invalid_removal(path, value, "would empty a structural dimension"));
                }
                vec![Choice::new(*path, value.clone())]
            }
            DimensionPath::Stage(slot) => {
                let kind: StageKind = value
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| invalid_removal(path, value, "not a stage type"))?;
                let domain = space
                    .slots
                    .get_mut(slot)
                    .ok_or_else(|| invalid_removal(path, value, "slot not present"))?;
                if domain.stages.remove(&kind).is_none() {
                    return Err(invalid_removal(path, value, "stage type not present"));
                }
                vec![Choice::new(*path, value.clone())]
            }
            DimensionPath::Hyper { slot, stage, name } => {
                let domain = space
                    .slots
                    .get_mut(slot)
                    .ok_or_else(|| invalid_removal(path, value, "slot not present"))?;
                let values = domain
                    .stages
                    .get_mut(stage)
                    .and_then(|s| s.hyperparameters.get_mut(*name))
                    .ok_or_else(|| invalid_removal(path, value, "stage type not present"))?;
                if !values.contains(value) {
                    return Err(invalid_removal(path, value, "value not present"));
                }
                values.retain(|v| v != value);
                if values.is_empty() {
                    domain.stages.remove(stage);
                    vec![Choice::stage(*slot, *stage)]
                } else {
                    vec![Choice::new(*path, value.clone())]
                }
            }
        };
        Ok(Narrowed { space, removed })
    }

    /// Apply already-recorded removals in order.
    pub fn without<'a>(&self, choices: impl IntoIterator<Item = &'a Choice>) -> WnResult<Self> {
        let mut space = self.clone();
        for choice in choices {
            space = space.remove(&choice.path, &choice.value)?.space;
        }
        Ok(space)
    }
}
