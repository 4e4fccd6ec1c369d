use super::*;

/// Approximate per-node cost on a GPU ALU.
///
/// Integer powers are expanded into multiplications by the emitter, so `pow`
/// is priced just under a multiplication; this makes the extractor prefer
/// merged powers. Transcendental calls dominate everything else.
pub struct GpuCostFn;

pub(super) fn node_cost(enode: &MathLanguage) -> f64 {
    match enode {
        MathLanguage::Constant(_) | MathLanguage::Pi | MathLanguage::Euler => 0.5,
        MathLanguage::Symbol(_) => 1.0,
        MathLanguage::Add(_) | MathLanguage::Sub(_) => 2.0,
        MathLanguage::Mul(_) => 2.0,
        MathLanguage::Pow(_) => 1.5,
        MathLanguage::Div(_) | MathLanguage::Mod(_) => 3.0,
        MathLanguage::Min(_) | MathLanguage::Max(_) | MathLanguage::Dot(_) => 2.0,
        MathLanguage::Abs(_)
        | MathLanguage::Floor(_)
        | MathLanguage::Ceil(_)
        | MathLanguage::Fract(_)
        | MathLanguage::Sign(_)
        | MathLanguage::Length(_)
        | MathLanguage::Normalize(_) => 2.0,
        MathLanguage::Sqrt(_) => 4.0,
        MathLanguage::Atan2(_) => 10.0,
        _ => 8.0,
    }
}

impl CostFunction<MathLanguage> for GpuCostFn {
    type Cost = f64;
    fn cost<C>(&mut self, enode: &MathLanguage, mut costs: C) -> Self::Cost
    where
        C: FnMut(Id) -> Self::Cost,
    {
        enode.fold(node_cost(enode), |acc, id| acc + costs(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcendental_calls_outweigh_arithmetic() {
        let id = Id::from(0);
        assert!(node_cost(&MathLanguage::Sin(id)) > node_cost(&MathLanguage::Mul([id, id])));
        assert!(node_cost(&MathLanguage::Pow([id, id])) < node_cost(&MathLanguage::Mul([id, id])));
    }
}
