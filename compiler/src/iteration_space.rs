// iteration_space.rs — Per-operation iteration spaces
//
// The iteration space of an operation is the list of loops it is nested in
// plus a mapping from the operation domain to those loops, followed by the
// domain dimensions no loop covers. Operations without a loop nest attribute
// get an empty iteration space (no loops, identity mapping). The space is
// fully specified when the loops iterate every domain dimension.
//
// Preconditions: program passed `verify_structure`; loop nests passed the
//                well-formedness check of the fusion analysis.
// Postconditions: `get` returns the same iteration space for the lifetime of
//                 the analysis.
// Failure modes: `translate_mapping` reports E0307 when shared loops cannot
//                be aligned.
// Side effects: none (lazy per-operation cache).

use std::cell::OnceCell;

use crate::diag::{codes, Diagnostic, Location};
use crate::id::OpId;
use crate::mapping::{Mapping, MappingExpr};
use crate::program::{Operation, Program};

// ── Iteration space ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationSpace {
    loop_names: Vec<String>,
    mapping: Mapping,
    fully_specified: bool,
}

impl IterationSpace {
    fn of(op: &Operation) -> Self {
        let num_dims = op.domain_size();
        let Some(nest) = &op.loop_nest else {
            return Self {
                loop_names: Vec::new(),
                mapping: Mapping::identity(num_dims),
                fully_specified: false,
            };
        };

        let mut exprs: Vec<MappingExpr> = nest
            .iter()
            .map(|l| {
                if l.iter.dims().all(|d| d < num_dims) {
                    l.iter
                } else {
                    MappingExpr::Unknown
                }
            })
            .collect();

        // Dimensions the loops do not iterate entirely, stripes included,
        // follow the loops.
        let uncovered: Vec<usize> = Mapping::from_parts(num_dims, exprs.clone())
            .inverse()
            .exprs()
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_unknown())
            .map(|(d, _)| d)
            .collect();
        let fully_specified = uncovered.is_empty();
        exprs.extend(uncovered.into_iter().map(MappingExpr::Dim));

        Self {
            loop_names: nest.iter().map(|l| l.name.clone()).collect(),
            mapping: Mapping::from_parts(num_dims, exprs),
            fully_specified,
        }
    }

    pub fn loop_names(&self) -> &[String] {
        &self.loop_names
    }

    pub fn num_loops(&self) -> usize {
        self.loop_names.len()
    }

    /// Mapping from the operation domain to the iteration space.
    pub fn mapping(&self) -> &Mapping {
        &self.mapping
    }

    /// Every domain dimension is iterated by the loops.
    pub fn fully_specified(&self) -> bool {
        self.fully_specified
    }

    /// Mapping from the operation domain to its loops only.
    pub fn mapping_to_loops(&self) -> Mapping {
        self.mapping.resize(self.num_loops())
    }

    pub fn num_common_loops(&self, other: &IterationSpace) -> usize {
        common_prefix_len(&self.loop_names, &other.loop_names)
    }

    pub fn num_common_loops_with(&self, names: &[String]) -> usize {
        common_prefix_len(&self.loop_names, names)
    }
}

/// Length of the longest common prefix of two loop-name sequences.
pub fn common_prefix_len(a: &[String], b: &[String]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

// ── Analysis ────────────────────────────────────────────────────────────────

pub struct IterationSpaceAnalysis<'p> {
    program: &'p Program,
    spaces: Vec<OnceCell<IterationSpace>>,
}

impl<'p> IterationSpaceAnalysis<'p> {
    pub fn new(program: &'p Program) -> Self {
        Self {
            program,
            spaces: (0..program.ops.len()).map(|_| OnceCell::new()).collect(),
        }
    }

    /// Iteration space of `op`, computed on first request.
    pub fn get(&self, op: OpId) -> &IterationSpace {
        self.spaces[op.index()].get_or_init(|| IterationSpace::of(self.program.op(op)))
    }

    /// Rewrite `mapping` (from the domain of `from` to the domain of `to`)
    /// into a mapping from the iteration space of `from` to the iteration
    /// space of `to`. Common loops are mapped with the identity; dimensions
    /// that are not shared stay unknown unless the mapping fixes them.
    pub fn try_translate_mapping(&self, from: OpId, to: OpId, mapping: &Mapping) -> Option<Mapping> {
        let from_space = self.get(from);
        let to_space = self.get(to);
        let translated = from_space
            .mapping
            .inverse()
            .compose(mapping)
            .compose(&to_space.mapping);
        let common = from_space.num_common_loops(to_space);
        let common_identity = Mapping::identity(common)
            .extend_use_domain(from_space.mapping.size())
            .resize(to_space.mapping.size());
        translated.unify(&common_identity)
    }

    pub fn translate_mapping(
        &self,
        from: OpId,
        to: OpId,
        mapping: &Mapping,
    ) -> Result<Mapping, Diagnostic> {
        self.try_translate_mapping(from, to, mapping).ok_or_else(|| {
            let common = self.get(from).num_common_loops(self.get(to));
            Diagnostic::error(
                codes::E0307,
                Location::Op(from),
                format!(
                    "cannot align the {} common loop(s) with {} when translating mapping {}",
                    common, to, mapping
                ),
            )
            .with_related(Location::Op(to), "other operation nested in the common loops")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ValueRef;
    use crate::program::{DomainDim, LoopAttr};
    use MappingExpr::Dim;

    fn dims(n: usize) -> Vec<DomainDim> {
        (0..n).map(|i| DomainDim::new(format!("R{}", i))).collect()
    }

    fn loops(entries: &[(&str, usize)]) -> Vec<LoopAttr> {
        entries.iter().map(|(n, d)| LoopAttr::new(*n, Dim(*d))).collect()
    }

    fn pair(producer: &[(&str, usize)], consumer: &[(&str, usize)]) -> Program {
        let mut p = Program::new("spaces");
        let a = p.add(Operation::compute(dims(2)).with_loop_nest(loops(producer)));
        p.add(
            Operation::compute(dims(2))
                .with_operand(ValueRef::new(a, 0), vec![Dim(0), Dim(1)])
                .with_loop_nest(loops(consumer)),
        );
        p
    }

    #[test]
    fn missing_loop_nest_gives_empty_space() {
        let mut p = Program::new("empty");
        let id = p.add(Operation::compute(dims(3)));
        let analysis = IterationSpaceAnalysis::new(&p);
        let space = analysis.get(id);
        assert_eq!(space.num_loops(), 0);
        assert!(space.mapping().is_identity());
        assert!(!space.fully_specified());
    }

    #[test]
    fn uncovered_dimensions_follow_loops() {
        let mut p = Program::new("partial");
        let id = p.add(Operation::compute(dims(3)).with_loop_nest(loops(&[("k", 2)])));
        let analysis = IterationSpaceAnalysis::new(&p);
        let space = analysis.get(id);
        assert_eq!(space.loop_names(), ["k".to_string()]);
        assert_eq!(space.mapping(), &Mapping::parse(3, "d2, d0, d1").unwrap());
        assert_eq!(space.mapping_to_loops(), Mapping::parse(3, "d2").unwrap());
        assert!(!space.fully_specified());
    }

    #[test]
    fn loops_over_every_dimension_are_fully_specified() {
        let mut p = Program::new("full");
        let id = p.add(Operation::compute(dims(2)).with_loop_nest(loops(&[("j", 1), ("i", 0)])));
        let analysis = IterationSpaceAnalysis::new(&p);
        let space = analysis.get(id);
        assert!(space.fully_specified());
        assert_eq!(space.mapping(), &Mapping::parse(2, "d1, d0").unwrap());
    }

    fn strip_mined(factors_inner: &[usize]) -> Vec<LoopAttr> {
        vec![
            LoopAttr::new("ii", MappingExpr::stripe(0, &[4]).unwrap()),
            LoopAttr::new("j", Dim(1)),
            LoopAttr::new("i", MappingExpr::stripe(0, factors_inner).unwrap()),
        ]
    }

    #[test]
    fn strip_mined_dimension_is_covered_by_all_its_strips() {
        let mut p = Program::new("stripes");
        let id = p.add(Operation::compute(dims(2)).with_loop_nest(strip_mined(&[4, 1])));
        let analysis = IterationSpaceAnalysis::new(&p);
        let space = analysis.get(id);
        assert!(space.fully_specified());
        assert_eq!(space.num_loops(), 3);
        assert_eq!(
            space.mapping().inverse(),
            Mapping::parse(3, "unstripe(d0, d2, [4, 1]), d1").unwrap()
        );
    }

    #[test]
    fn shared_strip_loops_translate_to_identity() {
        let mut p = Program::new("stripes");
        let a = p.add(Operation::compute(dims(2)).with_loop_nest(strip_mined(&[4, 1])));
        p.add(
            Operation::compute(dims(2))
                .with_operand(ValueRef::new(a, 0), vec![Dim(0), Dim(1)])
                .with_loop_nest(strip_mined(&[4, 1])),
        );
        let analysis = IterationSpaceAnalysis::new(&p);
        let translated = analysis
            .translate_mapping(OpId(1), a, &Mapping::identity(2))
            .unwrap();
        assert_eq!(translated, Mapping::identity(3));
    }

    #[test]
    fn translate_partially_shared_loops() {
        let p = pair(&[("i", 0), ("j", 1)], &[("i", 0), ("k", 1)]);
        let analysis = IterationSpaceAnalysis::new(&p);
        assert_eq!(analysis.get(OpId(0)).num_common_loops(analysis.get(OpId(1))), 1);
        let translated = analysis
            .translate_mapping(OpId(1), OpId(0), &Mapping::identity(2))
            .unwrap();
        assert_eq!(translated, Mapping::identity(2));
        assert_eq!(translated.min_domain_size(), 2);
    }

    #[test]
    fn translate_with_permuted_loops() {
        let p = pair(&[("i", 0), ("j", 1)], &[("j", 1), ("i", 0)]);
        let analysis = IterationSpaceAnalysis::new(&p);
        let translated = analysis
            .translate_mapping(OpId(1), OpId(0), &Mapping::identity(2))
            .unwrap();
        // No loop is shared: producer loop i is consumer loop 1 and j is loop 0.
        assert_eq!(translated, Mapping::parse(2, "d1, d0").unwrap());
    }

    #[test]
    fn misaligned_common_loops_are_rejected() {
        let p = pair(&[("i", 0), ("j", 1)], &[("i", 1), ("j", 0)]);
        let analysis = IterationSpaceAnalysis::new(&p);
        assert!(analysis
            .try_translate_mapping(OpId(1), OpId(0), &Mapping::identity(2))
            .is_none());
        let err = analysis
            .translate_mapping(OpId(1), OpId(0), &Mapping::identity(2))
            .unwrap_err();
        assert_eq!(err.code, Some(codes::E0307));
        assert_eq!(err.location, Location::Op(OpId(1)));
    }

    #[test]
    fn common_prefix() {
        let a = ["i".to_string(), "j".to_string()];
        let b = ["i".to_string(), "k".to_string()];
        assert_eq!(common_prefix_len(&a, &b), 1);
        assert_eq!(common_prefix_len(&a, &a), 2);
        assert_eq!(common_prefix_len(&a, &[]), 0);
    }
}
