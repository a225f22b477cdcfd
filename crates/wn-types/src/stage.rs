//! Stage types and their strongly-typed hyperparameter records.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::errors::{SpaceError, WnResult};
use crate::value::Value;

/// Which tensor layout a stage operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StageFamily {
    /// Time x frequency x channel feature maps.
    #[serde(rename = "2d")]
    TwoDim,
    /// Time x feature sequences.
    #[serde(rename = "1d")]
    OneDim,
}

/// The shape a hyperparameter's values must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Int,
    Float,
    Bool,
    Text,
    OptionalText,
    Tuple(usize),
}

impl ValueKind {
    /// Coerce a raw domain value into this kind, widening integers to floats
    /// where a float is expected. Returns `None` when the value cannot fit.
    pub fn coerce(&self, value: &Value) -> Option<Value> {
        match (self, value) {
            (Self::Int, Value::Int(v)) if *v >= 0 => Some(Value::Int(*v)),
            (Self::Float, Value::Int(v)) => Some(Value::Float(*v as f64)),
            (Self::Float, Value::Float(v)) => Some(Value::Float(*v)),
            (Self::Bool, Value::Bool(v)) => Some(Value::Bool(*v)),
            (Self::Text, Value::Text(s)) => Some(Value::Text(s.clone())),
            (Self::OptionalText, Value::Null) => Some(Value::Null),
            (Self::OptionalText, Value::Text(s)) => Some(Value::Text(s.clone())),
            (Self::Tuple(len), Value::Tuple(v)) if v.len() == *len && v.iter().all(|x| *x >= 0) => {
                Some(Value::Tuple(v.clone()))
            }
            _ => None,
        }
    }
}

/// Architectural alternatives a slot can select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StageKind {
    #[serde(rename = "mother_stage")]
    Mother,
    #[serde(rename = "DPRNN_stage")]
    Dprnn,
    #[serde(rename = "bidirectional_GRU_stage")]
    BiGru,
    #[serde(rename = "transformer_encoder_stage")]
    Transformer,
    #[serde(rename = "simple_dense_stage")]
    SimpleDense,
    #[serde(rename = "conformer_encoder_stage")]
    Conformer,
}

const MOTHER_PARAMS: &[(&str, ValueKind)] = &[
    ("depth", ValueKind::Int),
    ("filters0", ValueKind::Int),
    ("filters1", ValueKind::Int),
    ("filters2", ValueKind::Int),
    ("kernel_size0", ValueKind::Int),
    ("kernel_size1", ValueKind::Int),
    ("kernel_size2", ValueKind::Int),
    ("connect0", ValueKind::Tuple(1)),
    ("connect1", ValueKind::Tuple(2)),
    ("connect2", ValueKind::Tuple(3)),
    ("strides", ValueKind::Tuple(2)),
];

const DPRNN_PARAMS: &[(&str, ValueKind)] = &[
    ("depth", ValueKind::Int),
    ("units", ValueKind::Int),
    ("bidirectional", ValueKind::Bool),
    ("rnn", ValueKind::Text),
];

const BIGRU_PARAMS: &[(&str, ValueKind)] = &[("depth", ValueKind::Int), ("units", ValueKind::Int)];

const TRANSFORMER_PARAMS: &[(&str, ValueKind)] = &[
    ("depth", ValueKind::Int),
    ("n_head", ValueKind::Int),
    ("key_dim", ValueKind::Int),
    ("ff_multiplier", ValueKind::Float),
    ("kernel_size", ValueKind::Int),
];

const DENSE_PARAMS: &[(&str, ValueKind)] = &[
    ("depth", ValueKind::Int),
    ("units", ValueKind::Int),
    ("activation", ValueKind::Text),
    ("dropout_rate", ValueKind::Float),
];

const CONFORMER_PARAMS: &[(&str, ValueKind)] = &[
    ("depth", ValueKind::Int),
    ("key_dim", ValueKind::Int),
    ("n_head", ValueKind::Int),
    ("kernel_size", ValueKind::Int),
    ("multiplier", ValueKind::Int),
    ("pos_encoding", ValueKind::OptionalText),
];

impl StageKind {
    pub const ALL: [StageKind; 6] = [
        Self::Mother,
        Self::Dprnn,
        Self::BiGru,
        Self::Transformer,
        Self::SimpleDense,
        Self::Conformer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mother => "mother_stage",
            Self::Dprnn => "DPRNN_stage",
            Self::BiGru => "bidirectional_GRU_stage",
            Self::Transformer => "transformer_encoder_stage",
            Self::SimpleDense => "simple_dense_stage",
            Self::Conformer => "conformer_encoder_stage",
        }
    }

    pub fn family(&self) -> StageFamily {
        match self {
            Self::Mother | Self::Dprnn => StageFamily::TwoDim,
            Self::BiGru | Self::Transformer | Self::SimpleDense | Self::Conformer => {
                StageFamily::OneDim
            }
        }
    }

    /// The closed list of hyperparameters this stage type is defined by.
    pub fn hyperparameters(&self) -> &'static [(&'static str, ValueKind)] {
        match self {
            Self::Mother => MOTHER_PARAMS,
            Self::Dprnn => DPRNN_PARAMS,
            Self::BiGru => BIGRU_PARAMS,
            Self::Transformer => TRANSFORMER_PARAMS,
            Self::SimpleDense => DENSE_PARAMS,
            Self::Conformer => CONFORMER_PARAMS,
        }
    }

    /// Resolve a hyperparameter name to its interned name and kind.
    pub fn hyperparameter(&self, name: &str) -> Option<(&'static str, ValueKind)> {
        self.hyperparameters()
            .iter()
            .find(|(n, _)| *n == name)
            .copied()
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageKind {
    type Err = SpaceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| SpaceError::UnknownStage { name: s.to_string() })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RnnCell {
    #[serde(rename = "RNN")]
    Rnn,
    #[serde(rename = "GRU")]
    Gru,
    #[serde(rename = "LSTM")]
    Lstm,
}

impl RnnCell {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rnn => "RNN",
            Self::Gru => "GRU",
            Self::Lstm => "LSTM",
        }
    }

    /// Gate count used by the complexity estimator.
    pub fn gates(&self) -> u64 {
        match self {
            Self::Rnn => 1,
            Self::Gru => 3,
            Self::Lstm => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PosEncoding {
    Basic,
    Rff,
}

impl PosEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Rff => "rff",
        }
    }
}

/// Convolutional "mother" block: up to three conv branches with skip masks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotherStage {
    pub depth: u32,
    pub filters0: u32,
    pub filters1: u32,
    pub filters2: u32,
    pub kernel_size0: u32,
    pub kernel_size1: u32,
    pub kernel_size2: u32,
    pub connect0: [u8; 1],
    pub connect1: [u8; 2],
    pub connect2: [u8; 3],
    pub strides: [u32; 2],
}

impl MotherStage {
    pub fn active_convs(&self) -> usize {
        [self.filters0, self.filters1, self.filters2]
            .iter()
            .filter(|f| **f > 0)
            .count()
    }

    /// Neutralize fields made irrelevant by disabled branches.
    fn canonicalize(mut self) -> Self {
        if self.filters2 == 0 {
            if self.filters1 != 0 {
                self.connect2[2] = 1;
            } else if self.filters0 != 0 {
                self.connect2[1] = 1;
            }
        }
        if self.filters0 == 0 {
            self.kernel_size0 = 0;
            self.connect1[1] = 0;
            self.connect2[1] = 0;
        }
        if self.filters1 == 0 {
            self.kernel_size1 = 0;
            self.connect2[2] = 0;
            self.strides = [1, 1];
        }
        if self.filters2 == 0 {
            self.kernel_size2 = 0;
        }
        self
    }
}

/// Dual-path recurrent block over time and frequency axes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DprnnStage {
    pub depth: u32,
    pub units: u32,
    pub bidirectional: bool,
    pub rnn: RnnCell,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiGruStage {
    pub depth: u32,
    pub units: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformerStage {
    pub depth: u32,
    pub n_head: u32,
    pub key_dim: u32,
    pub ff_multiplier: f64,
    pub kernel_size: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimpleDenseStage {
    pub depth: u32,
    pub units: u32,
    pub activation: String,
    pub dropout_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConformerStage {
    pub depth: u32,
    pub key_dim: u32,
    pub n_head: u32,
    pub kernel_size: u32,
    pub multiplier: u32,
    pub pos_encoding: Option<PosEncoding>,
}

/// A concrete stage choice with every hyperparameter bound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage")]
pub enum Stage {
    #[serde(rename = "mother_stage")]
    Mother(MotherStage),
    #[serde(rename = "DPRNN_stage")]
    Dprnn(DprnnStage),
    #[serde(rename = "bidirectional_GRU_stage")]
    BiGru(BiGruStage),
    #[serde(rename = "transformer_encoder_stage")]
    Transformer(TransformerStage),
    #[serde(rename = "simple_dense_stage")]
    SimpleDense(SimpleDenseStage),
    #[serde(rename = "conformer_encoder_stage")]
    Conformer(ConformerStage),
}

fn tuple<const N: usize>(values: &[u32; N]) -> Value {
    Value::Tuple(values.iter().map(|v| *v as i64).collect())
}

fn mask<const N: usize>(values: &[u8; N]) -> Value {
    Value::Tuple(values.iter().map(|v| *v as i64).collect())
}

fn count(v: u32) -> Value {
    Value::Int(v as i64)
}

/// Typed extraction of one drawn assignment into a stage record.
struct Draw<'a> {
    kind: StageKind,
    values: &'a BTreeMap<String, Value>,
}

impl<'a> Draw<'a> {
    fn raw(&self, name: &str) -> WnResult<&'a Value> {
        self.values.get(name).ok_or_else(|| {
            SpaceError::MissingHyperparameter {
                stage: self.kind.to_string(),
                name: name.to_string(),
            }
            .into()
        })
    }

    fn invalid(&self, name: &str, value: &Value) -> crate::errors::WnError {
        SpaceError::InvalidValue {
            path: format!("{}.{}", self.kind, name),
            value: value.to_string(),
        }
        .into()
    }

    fn count(&self, name: &str) -> WnResult<u32> {
        let v = self.raw(name)?;
        v.as_i64()
            .and_then(|x| u32::try_from(x).ok())
            .ok_or_else(|| self.invalid(name, v))
    }

    fn real(&self, name: &str) -> WnResult<f64> {
        let v = self.raw(name)?;
        v.as_f64().ok_or_else(|| self.invalid(name, v))
    }

    fn flag(&self, name: &str) -> WnResult<bool> {
        match self.raw(name)? {
            Value::Bool(b) => Ok(*b),
            other => Err(self.invalid(name, other)),
        }
    }

    fn text(&self, name: &str) -> WnResult<&'a str> {
        let v = self.raw(name)?;
        v.as_str().ok_or_else(|| self.invalid(name, v))
    }

    fn array<const N: usize>(&self, name: &str) -> WnResult<[u32; N]> {
        let v = self.raw(name)?;
        match v {
            Value::Tuple(items) if items.len() == N => {
                let mut out = [0u32; N];
                for (slot, item) in out.iter_mut().zip(items) {
                    *slot = u32::try_from(*item).map_err(|_| self.invalid(name, v))?;
                }
                Ok(out)
            }
            _ => Err(self.invalid(name, v)),
        }
    }

    fn bits<const N: usize>(&self, name: &str) -> WnResult<[u8; N]> {
        let wide: [u32; N] = self.array(name)?;
        let mut out = [0u8; N];
        for (slot, bit) in out.iter_mut().zip(wide) {
            if bit > 1 {
                return Err(self.invalid(name, self.raw(name)?));
            }
            *slot = bit as u8;
        }
        Ok(out)
    }
}

impl Stage {
    pub fn kind(&self) -> StageKind {
        match self {
            Self::Mother(_) => StageKind::Mother,
            Self::Dprnn(_) => StageKind::Dprnn,
            Self::BiGru(_) => StageKind::BiGru,
            Self::Transformer(_) => StageKind::Transformer,
            Self::SimpleDense(_) => StageKind::SimpleDense,
            Self::Conformer(_) => StageKind::Conformer,
        }
    }

    /// Build a typed record from one drawn value per hyperparameter.
    pub fn from_assignment(kind: StageKind, values: &BTreeMap<String, Value>) -> WnResult<Self> {
        let d = Draw { kind, values };
        let stage = match kind {
            StageKind::Mother => Self::Mother(MotherStage {
                depth: d.count("depth")?,
                filters0: d.count("filters0")?,
                filters1: d.count("filters1")?,
                filters2: d.count("filters2")?,
                kernel_size0: d.count("kernel_size0")?,
                kernel_size1: d.count("kernel_size1")?,
                kernel_size2: d.count("kernel_size2")?,
                connect0: d.bits("connect0")?,
                connect1: d.bits("connect1")?,
                connect2: d.bits("connect2")?,
                strides: d.array("strides")?,
            }),
            StageKind::Dprnn => {
                let rnn = match d.text("rnn")? {
                    "RNN" => RnnCell::Rnn,
                    "GRU" => RnnCell::Gru,
                    "LSTM" => RnnCell::Lstm,
                    _ => return Err(d.invalid("rnn", d.raw("rnn")?)),
                };
                Self::Dprnn(DprnnStage {
                    depth: d.count("depth")?,
                    units: d.count("units")?,
                    bidirectional: d.flag("bidirectional")?,
                    rnn,
                })
            }
            StageKind::BiGru => Self::BiGru(BiGruStage {
                depth: d.count("depth")?,
                units: d.count("units")?,
            }),
            StageKind::Transformer => Self::Transformer(TransformerStage {
                depth: d.count("depth")?,
                n_head: d.count("n_head")?,
                key_dim: d.count("key_dim")?,
                ff_multiplier: d.real("ff_multiplier")?,
                kernel_size: d.count("kernel_size")?,
            }),
            StageKind::SimpleDense => Self::SimpleDense(SimpleDenseStage {
                depth: d.count("depth")?,
                units: d.count("units")?,
                activation: d.text("activation")?.to_string(),
                dropout_rate: d.real("dropout_rate")?,
            }),
            StageKind::Conformer => {
                let pos_encoding = match d.raw("pos_encoding")? {
                    Value::Null => None,
                    Value::Text(s) if s == "basic" => Some(PosEncoding::Basic),
                    Value::Text(s) if s == "rff" => Some(PosEncoding::Rff),
                    other => return Err(d.invalid("pos_encoding", other)),
                };
                Self::Conformer(ConformerStage {
                    depth: d.count("depth")?,
                    key_dim: d.count("key_dim")?,
                    n_head: d.count("n_head")?,
                    kernel_size: d.count("kernel_size")?,
                    multiplier: d.count("multiplier")?,
                    pos_encoding,
                })
            }
        };
        Ok(stage)
    }

    /// The value bound to `name`, in the same shape domains use.
    pub fn get(&self, name: &str) -> Option<Value> {
        let value = match (self, name) {
            (Self::Mother(s), "depth") => count(s.depth),
            (Self::Mother(s), "filters0") => count(s.filters0),
            (Self::Mother(s), "filters1") => count(s.filters1),
            (Self::Mother(s), "filters2") => count(s.filters2),
            (Self::Mother(s), "kernel_size0") => count(s.kernel_size0),
            (Self::Mother(s), "kernel_size1") => count(s.kernel_size1),
            (Self::Mother(s), "kernel_size2") => count(s.kernel_size2),
            (Self::Mother(s), "connect0") => mask(&s.connect0),
            (Self::Mother(s), "connect1") => mask(&s.connect1),
            (Self::Mother(s), "connect2") => mask(&s.connect2),
            (Self::Mother(s), "strides") => tuple(&s.strides),
            (Self::Dprnn(s), "depth") => count(s.depth),
            (Self::Dprnn(s), "units") => count(s.units),
            (Self::Dprnn(s), "bidirectional") => Value::Bool(s.bidirectional),
            (Self::Dprnn(s), "rnn") => Value::text(s.rnn.as_str()),
            (Self::BiGru(s), "depth") => count(s.depth),
            (Self::BiGru(s), "units") => count(s.units),
            (Self::Transformer(s), "depth") => count(s.depth),
            (Self::Transformer(s), "n_head") => count(s.n_head),
            (Self::Transformer(s), "key_dim") => count(s.key_dim),
            (Self::Transformer(s), "ff_multiplier") => Value::Float(s.ff_multiplier),
            (Self::Transformer(s), "kernel_size") => count(s.kernel_size),
            (Self::SimpleDense(s), "depth") => count(s.depth),
            (Self::SimpleDense(s), "units") => count(s.units),
            (Self::SimpleDense(s), "activation") => Value::text(s.activation.as_str()),
            (Self::SimpleDense(s), "dropout_rate") => Value::Float(s.dropout_rate),
            (Self::Conformer(s), "depth") => count(s.depth),
            (Self::Conformer(s), "key_dim") => count(s.key_dim),
            (Self::Conformer(s), "n_head") => count(s.n_head),
            (Self::Conformer(s), "kernel_size") => count(s.kernel_size),
            (Self::Conformer(s), "multiplier") => count(s.multiplier),
            (Self::Conformer(s), "pos_encoding") => match s.pos_encoding {
                Some(p) => Value::text(p.as_str()),
                None => Value::Null,
            },
            _ => return None,
        };
        Some(value)
    }

    /// Every hyperparameter binding, in declaration order.
    pub fn assignment(&self) -> Vec<(&'static str, Value)> {
        self.kind()
            .hyperparameters()
            .iter()
            .filter_map(|(name, _)| self.get(name).map(|v| (*name, v)))
            .collect()
    }

    /// Deterministic normalization of structurally inactive fields.
    pub fn canonicalize(self) -> Self {
        match self {
            Self::Mother(s) => Self::Mother(s.canonicalize()),
            Self::Dprnn(_)
            | Self::BiGru(_)
            | Self::Transformer(_)
            | Self::SimpleDense(_)
            | Self::Conformer(_) => self,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mother(filters: [u32; 3]) -> MotherStage {
        MotherStage {
            depth: 1,
            filters0: filters[0],
            filters1: filters[1],
            filters2: filters[2],
            kernel_size0: 3,
            kernel_size1: 5,
            kernel_size2: 3,
            connect0: [1],
            connect1: [1, 1],
            connect2: [0, 0, 0],
            strides: [1, 2],
        }
    }

    #[test]
    fn disabled_branches_are_neutralized() {
        let stage = Stage::Mother(mother([0, 0, 8])).canonicalize();
        match stage {
            Stage::Mother(s) => {
                assert_eq!(s.kernel_size0, 0);
                assert_eq!(s.kernel_size1, 0);
                assert_eq!(s.kernel_size2, 3);
                assert_eq!(s.connect1, [1, 0]);
                assert_eq!(s.connect2, [0, 0, 0]);
                assert_eq!(s.strides, [1, 1]);
            }
            other => panic!("unexpected stage {other:?}"),
        }
    }

    #[test]
    fn missing_last_branch_forces_cascade_flag() {
        match Stage::Mother(mother([4, 8, 0])).canonicalize() {
            Stage::Mother(s) => {
                assert_eq!(s.connect2, [0, 0, 1]);
                assert_eq!(s.kernel_size2, 0);
            }
            other => panic!("unexpected stage {other:?}"),
        }
        match Stage::Mother(mother([4, 0, 0])).canonicalize() {
            Stage::Mother(s) => assert_eq!(s.connect2, [0, 1, 0]),
            other => panic!("unexpected stage {other:?}"),
        }
    }

    #[test]
    fn canonicalization_is_idempotent() {
        for filters in [[0, 0, 0], [0, 3, 0], [3, 0, 0], [3, 3, 3], [0, 0, 3], [3, 0, 3]] {
            let once = Stage::Mother(mother(filters)).canonicalize();
            let twice = once.clone().canonicalize();
            assert_eq!(once, twice, "filters {filters:?}");
        }
    }

    #[test]
    fn assignment_round_trips_through_from_assignment() {
        let stage = Stage::Conformer(ConformerStage {
            depth: 1,
            key_dim: 8,
            n_head: 2,
            kernel_size: 16,
            multiplier: 2,
            pos_encoding: None,
        });
        let values: BTreeMap<String, Value> = stage
            .assignment()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let rebuilt = Stage::from_assignment(StageKind::Conformer, &values).unwrap();
        assert_eq!(rebuilt, stage);
    }

    #[test]
    fn from_assignment_rejects_bad_values() {
        let mut values = BTreeMap::new();
        values.insert("depth".to_string(), Value::Int(1));
        values.insert("units".to_string(), Value::Int(32));
        values.insert("bidirectional".to_string(), Value::Bool(true));
        values.insert("rnn".to_string(), Value::text("TCN"));
        assert!(Stage::from_assignment(StageKind::Dprnn, &values).is_err());

        values.remove("rnn");
        assert!(Stage::from_assignment(StageKind::Dprnn, &values).is_err());
    }

    #[test]
    fn stage_serializes_with_tag() {
        let stage = Stage::BiGru(BiGruStage { depth: 2, units: 64 });
        let json = serde_json::to_value(&stage).unwrap();
        assert_eq!(json["stage"], "bidirectional_GRU_stage");
        assert_eq!(json["units"], 64);
        let back: Stage = serde_json::from_value(json).unwrap();
        assert_eq!(back, stage);
    }

    #[test]
    fn kinds_parse_and_know_their_family() {
        assert_eq!("DPRNN_stage".parse::<StageKind>().unwrap(), StageKind::Dprnn);
        assert!("identity_block".parse::<StageKind>().is_err());
        assert_eq!(StageKind::Dprnn.family(), StageFamily::TwoDim);
        assert_eq!(StageKind::Conformer.family(), StageFamily::OneDim);
        assert!(StageKind::Mother.hyperparameter("strides").is_some());
        assert!(StageKind::Mother.hyperparameter("units").is_none());
    }

    #[test]
    fn coerce_widens_ints_for_float_params() {
        assert_eq!(ValueKind::Float.coerce(&Value::Int(2)), Some(Value::Float(2.0)));
        assert_eq!(ValueKind::Int.coerce(&Value::Float(2.0)), None);
        assert_eq!(ValueKind::Tuple(2).coerce(&Value::Tuple(vec![1])), None);
        assert_eq!(ValueKind::OptionalText.coerce(&Value::Null), Some(Value::Null));
    }
}
