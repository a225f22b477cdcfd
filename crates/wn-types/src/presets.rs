//! Built-in search spaces.

use crate::errors::WnResult;
use crate::space::{SearchSpace, SlotDomain, SlotId, StageDomain, StructuralDim};
use crate::stage::StageKind;
use crate::value::Value;
use crate::values;

fn tuples(items: &[&[i64]]) -> Vec<Value> {
    items.iter().map(|t| Value::Tuple(t.to_vec())).collect()
}

pub fn mother_domain() -> StageDomain {
    StageDomain::new()
        .with("depth", values![1, 2, 3])
        .with("filters0", values![0, 3, 4, 6, 8, 12, 16, 24, 32])
        .with("filters1", values![3, 4, 6, 8, 12, 16, 24, 32])
        .with("filters2", values![0, 3, 4, 6, 8, 12, 16, 24, 32])
        .with("kernel_size0", values![1, 3, 5])
        .with("kernel_size1", values![1, 3, 5])
        .with("kernel_size2", values![1, 3, 5])
        .with("connect0", tuples(&[&[0], &[1]]))
        .with("connect1", tuples(&[&[0, 0], &[0, 1], &[1, 0], &[1, 1]]))
        .with(
            "connect2",
            tuples(&[
                &[0, 0, 0],
                &[0, 0, 1],
                &[0, 1, 0],
                &[0, 1, 1],
                &[1, 0, 0],
                &[1, 0, 1],
                &[1, 1, 0],
                &[1, 1, 1],
            ]),
        )
        .with("strides", tuples(&[&[1, 1], &[1, 2], &[1, 3]]))
}

pub fn dprnn_domain() -> StageDomain {
    StageDomain::new()
        .with("depth", values![1, 2])
        .with("units", values![16, 32, 64, 96, 128])
        .with("bidirectional", values![true, false])
        .with("rnn", values!["RNN", "GRU", "LSTM"])
}

pub fn bigru_domain() -> StageDomain {
    StageDomain::new()
        .with("depth", values![1, 2])
        .with("units", values![16, 24, 32, 48, 64, 96, 128, 192, 256])
}

pub fn transformer_domain() -> StageDomain {
    StageDomain::new()
        .with("depth", values![1, 2])
        .with("n_head", values![1, 2, 4])
        .with("key_dim", values![2, 3, 4, 6, 8, 12, 16, 24, 32])
        .with("ff_multiplier", values![0.25, 0.5, 1.0, 2.0])
        .with("kernel_size", values![1, 3, 5])
}

pub fn dense_domain() -> StageDomain {
    StageDomain::new()
        .with("depth", values![1, 2])
        .with("units", values![4, 6, 8, 12, 16, 24, 32, 48, 64, 96, 128, 256])
        .with("activation", values!["relu"])
        .with("dropout_rate", values![0.0, 0.2, 0.5])
}

pub fn conformer_domain() -> StageDomain {
    StageDomain::new()
        .with("depth", values![1])
        .with("key_dim", values![2, 3, 4, 6, 8, 12, 16])
        .with("n_head", values![1, 2, 4])
        .with("kernel_size", values![4, 6, 8, 12, 16, 24, 32])
        .with("multiplier", values![1, 2, 3])
        .with("pos_encoding", vec![Value::Null, Value::text("basic"), Value::text("rff")])
}

fn one_dim_slot() -> SlotDomain {
    SlotDomain::new()
        .with_stage(StageKind::BiGru, bigru_domain())
        .with_stage(StageKind::Transformer, transformer_domain())
        .with_stage(StageKind::SimpleDense, dense_domain())
        .with_stage(StageKind::Conformer, conformer_domain())
}

fn any_slot() -> SlotDomain {
    one_dim_slot()
        .with_stage(StageKind::Mother, mother_domain())
        .with_stage(StageKind::Dprnn, dprnn_domain())
}

/// The ACCDOA search space: one to three 2D blocks, up to two 1D blocks, and
/// a single DOA head.
pub fn accdoa_space() -> WnResult<SearchSpace> {
    let space = SearchSpace::new()
        .with_blocks(StructuralDim::TwoDimBlocks, vec![1, 2, 3])
        .with_blocks(StructuralDim::OneDimBlocks, vec![0, 1, 2]);
    let slots = space.block_slots();
    (0..slots)
        .fold(space, |space, i| space.with_slot(SlotId::Block(i), any_slot()))
        .with_slot(SlotId::Doa, one_dim_slot())
        .validate()
}

/// Like [`accdoa_space`] with an additional SED head.
pub fn seld_space() -> WnResult<SearchSpace> {
    Ok(accdoa_space()?.with_slot(SlotId::Sed, one_dim_slot()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::DimensionPath;
    use crate::stage::StageFamily;

    #[test]
    fn accdoa_space_is_valid() {
        let space = accdoa_space().unwrap();
        assert_eq!(space.block_slots(), 5);
        assert_eq!(space.slots.len(), 6);
        assert!(!space.is_exhausted());

        let doa = &space.slots[&SlotId::Doa];
        assert!(doa.kinds(StageFamily::TwoDim).is_empty());
        assert_eq!(doa.kinds(StageFamily::OneDim).len(), 4);
    }

    #[test]
    fn float_domains_are_normalized() {
        let space = accdoa_space().unwrap();
        let path =
            DimensionPath::hyper(SlotId::Block(4), StageKind::Transformer, "ff_multiplier").unwrap();
        assert_eq!(space.domain(&path).unwrap(), values![0.25, 0.5, 1.0, 2.0]);
    }

    #[test]
    fn seld_space_adds_head() {
        let space = seld_space().unwrap();
        assert!(space.slots.contains_key(&SlotId::Sed));
        assert!(space.clone().validate().is_ok());
    }
}
