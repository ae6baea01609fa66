// sequence.rs — Total order of compute operations and backward slices
//
// `SequenceAnalysis` orders every compute operation. Operations with a
// `sequence` attribute keep their relative order, ties broken by position in
// the program. Operations without one are placed as late as possible but
// still before the first sequenced operation that transitively uses them:
// before each sequenced operation, its not-yet-placed unsequenced producers
// are placed in depth-first post-order (operands in operand order, looking
// through non-compute operations). Remaining unsequenced operations follow in
// program order, each preceded by its own unplaced producers.
//
// `BackwardSliceAnalysis` records, for every operation, the compute
// operations whose results it uses (its frontier) and lazily computes the
// transitive closure of frontiers.
//
// Preconditions: program passed `verify_structure`.
// Postconditions: every compute operation has exactly one position.
// Failure modes: E0200 on a use-def cycle among unsequenced operations.
// Side effects: none (the slice cache is internal).

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::rc::Rc;

use log::trace;

use crate::diag::{codes, Diagnostic, Location};
use crate::id::OpId;
use crate::program::Program;
use crate::program_query::compute_ops;

// ── Sequence analysis ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SequenceAnalysis {
    order: Vec<OpId>,
    positions: HashMap<OpId, usize>,
}

impl SequenceAnalysis {
    pub fn new(program: &Program) -> Result<Self, Diagnostic> {
        let mut builder = SequenceBuilder {
            program,
            order: Vec::new(),
            placed: vec![false; program.ops.len()],
            on_stack: vec![false; program.ops.len()],
            explored: vec![false; program.ops.len()],
        };

        let mut sequenced: Vec<OpId> = compute_ops(program)
            .filter(|&id| program.op(id).sequence.is_some())
            .collect();
        // Stable: equal sequence numbers keep program order.
        sequenced.sort_by_key(|&id| program.op(id).sequence);
        for id in sequenced {
            builder.place_with_producers(id)?;
        }
        for id in compute_ops(program) {
            if !builder.placed[id.index()] {
                builder.place_with_producers(id)?;
            }
        }

        let positions = builder
            .order
            .iter()
            .enumerate()
            .map(|(pos, &id)| (id, pos))
            .collect();
        trace!("sequence of {}: {:?}", program.name, builder.order);
        Ok(Self {
            order: builder.order,
            positions,
        })
    }

    /// `(position, op)` pairs in execution order.
    pub fn ops(&self) -> impl Iterator<Item = (usize, OpId)> + '_ {
        self.order.iter().copied().enumerate()
    }

    /// Compute operations sequenced strictly before `op`.
    pub fn ops_before(&self, op: OpId) -> &[OpId] {
        match self.position(op) {
            Some(pos) => &self.order[..pos],
            None => &[],
        }
    }

    /// Position of a compute operation; `None` for non-compute operations.
    pub fn position(&self, op: OpId) -> Option<usize> {
        self.positions.get(&op).copied()
    }

    /// True if both operations are sequenced and `a` comes first.
    pub fn is_before(&self, a: OpId, b: OpId) -> bool {
        match (self.position(a), self.position(b)) {
            (Some(pa), Some(pb)) => pa < pb,
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

struct SequenceBuilder<'p> {
    program: &'p Program,
    order: Vec<OpId>,
    placed: Vec<bool>,
    on_stack: Vec<bool>,
    /// Non-compute operations whose producers are all placed.
    explored: Vec<bool>,
}

impl SequenceBuilder<'_> {
    /// Place `root` after its unplaced unsequenced producers (iterative
    /// depth-first post-order).
    fn place_with_producers(&mut self, root: OpId) -> Result<(), Diagnostic> {
        let mut stack = vec![(root, 0usize)];
        self.on_stack[root.index()] = true;

        while let Some((op, next)) = stack.pop() {
            let operands = &self.program.op(op).operands;
            if next == operands.len() {
                self.on_stack[op.index()] = false;
                if self.program.op(op).is_compute() {
                    self.placed[op.index()] = true;
                    self.order.push(op);
                } else {
                    self.explored[op.index()] = true;
                }
                continue;
            }
            stack.push((op, next + 1));

            let producer = operands[next].value.op;
            let producer_op = self.program.op(producer);
            if self.placed[producer.index()]
                || self.explored[producer.index()]
                || (producer_op.is_compute() && producer_op.sequence.is_some())
            {
                continue;
            }
            if self.on_stack[producer.index()] {
                return Err(Diagnostic::error(
                    codes::E0200,
                    Location::Op(producer),
                    format!("use-def cycle through {} and {}", producer, op),
                )
                .with_related(Location::Op(op), "uses a value of the cycle")
                .with_hint("add sequence attributes or break the cycle"));
            }
            self.on_stack[producer.index()] = true;
            stack.push((producer, 0));
        }
        Ok(())
    }
}

// ── Backward slices ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct BackwardSliceAnalysis {
    frontiers: Vec<BTreeSet<OpId>>,
    slice_cache: RefCell<HashMap<OpId, Rc<BTreeSet<OpId>>>>,
}

impl BackwardSliceAnalysis {
    pub fn new(program: &Program) -> Self {
        let frontiers = program.op_ids().map(|id| frontier_of(program, id)).collect();
        Self {
            frontiers,
            slice_cache: RefCell::new(HashMap::new()),
        }
    }

    /// Compute operations whose results `op` uses, possibly through
    /// non-compute operations.
    pub fn frontier(&self, op: OpId) -> &BTreeSet<OpId> {
        &self.frontiers[op.index()]
    }

    /// Compute operations whose results `op` transitively uses.
    pub fn slice(&self, op: OpId) -> Rc<BTreeSet<OpId>> {
        if let Some(cached) = self.slice_cache.borrow().get(&op) {
            return Rc::clone(cached);
        }

        let mut slice = BTreeSet::new();
        let mut work: VecDeque<OpId> = self.frontier(op).iter().copied().collect();
        while let Some(id) = work.pop_front() {
            if !slice.insert(id) {
                continue;
            }
            if let Some(cached) = self.slice_cache.borrow().get(&id) {
                slice.extend(cached.iter().copied());
                continue;
            }
            work.extend(self.frontier(id).iter().copied());
        }

        let slice = Rc::new(slice);
        self.slice_cache.borrow_mut().insert(op, Rc::clone(&slice));
        slice
    }
}

fn frontier_of(program: &Program, op: OpId) -> BTreeSet<OpId> {
    let mut frontier = BTreeSet::new();
    let mut seen = BTreeSet::new();
    let mut work: Vec<OpId> = program.op(op).operands.iter().map(|o| o.value.op).collect();
    while let Some(id) = work.pop() {
        if !seen.insert(id) {
            continue;
        }
        let producer = program.op(id);
        if producer.is_compute() {
            frontier.insert(id);
        } else {
            work.extend(producer.operands.iter().map(|o| o.value.op));
        }
    }
    frontier
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ValueRef;
    use crate::mapping::MappingExpr::Dim;
    use crate::program::{DomainDim, Operation};

    fn op() -> Operation {
        Operation::compute(vec![DomainDim::new("N")])
    }

    fn uses(op: Operation, producers: &[OpId]) -> Operation {
        producers
            .iter()
            .fold(op, |op, &p| op.with_operand(ValueRef::new(p, 0), vec![Dim(0)]))
    }

    fn order(p: &Program) -> Vec<u32> {
        SequenceAnalysis::new(p)
            .unwrap()
            .ops()
            .map(|(_, id)| id.0)
            .collect()
    }

    #[test]
    fn unsequenced_ops_follow_program_order() {
        let mut p = Program::new("plain");
        let a = p.add(op());
        let b = p.add(uses(op(), &[a]));
        p.add(uses(op(), &[b]));
        assert_eq!(order(&p), vec![0, 1, 2]);
    }

    #[test]
    fn sequence_attributes_win_over_program_order() {
        let mut p = Program::new("explicit");
        p.add(op().with_sequence(5));
        p.add(op().with_sequence(1));
        p.add(op().with_sequence(1));
        assert_eq!(order(&p), vec![1, 2, 0]);
    }

    #[test]
    fn producers_are_placed_before_their_sequenced_user() {
        let mut p = Program::new("producers");
        let a = p.add(op()); // 0
        let b = p.add(op()); // 1
        let c = p.add(uses(op(), &[b, a])); // 2
        p.add(uses(op(), &[c]).with_sequence(0)); // 3
        p.add(op().with_sequence(1)); // 4
        p.add(op()); // 5
        assert_eq!(order(&p), vec![1, 0, 2, 3, 4, 5]);
    }

    #[test]
    fn producers_are_found_through_non_compute_ops() {
        let mut p = Program::new("through");
        let a = p.add(op()); // 0
        let store = p.add(Operation::to_memref(
            "out",
            vec![DomainDim::new("N")],
            crate::program::Operand {
                value: ValueRef::new(a, 0),
                mapping: vec![Dim(0)],
            },
        ));
        let analysis = SequenceAnalysis::new(&p).unwrap();
        assert_eq!(analysis.position(store), None);
        assert_eq!(analysis.position(a), Some(0));
    }

    #[test]
    fn contradicting_hints_are_kept() {
        let mut p = Program::new("contradiction");
        let a = p.add(op().with_sequence(2));
        p.add(uses(op(), &[a]).with_sequence(1));
        assert_eq!(order(&p), vec![1, 0]);
    }

    #[test]
    fn cycle_among_unsequenced_ops_is_an_error() {
        let mut p = Program::new("cycle");
        p.add(uses(op(), &[OpId(1)]));
        p.add(uses(op(), &[OpId(0)]));
        let err = SequenceAnalysis::new(&p).unwrap_err();
        assert_eq!(err.code, Some(codes::E0200));
    }

    #[test]
    fn ops_before_and_is_before() {
        let mut p = Program::new("queries");
        let a = p.add(op().with_sequence(1));
        let b = p.add(op().with_sequence(0));
        let analysis = SequenceAnalysis::new(&p).unwrap();
        assert_eq!(analysis.ops_before(a), &[b]);
        assert!(analysis.is_before(b, a));
        assert!(!analysis.is_before(a, a));
        assert_eq!(analysis.len(), 2);
    }

    #[test]
    fn slices_are_transitive_and_cached() {
        let mut p = Program::new("slices");
        let a = p.add(op());
        let b = p.add(uses(op(), &[a]));
        let c = p.add(uses(op(), &[b, a]));
        let slices = BackwardSliceAnalysis::new(&p);
        assert_eq!(slices.frontier(c).len(), 2);
        assert_eq!(*slices.slice(b), BTreeSet::from([a]));
        assert_eq!(*slices.slice(c), BTreeSet::from([a, b]));
        assert!(Rc::ptr_eq(&slices.slice(c), &slices.slice(c)));
        assert!(slices.slice(a).is_empty());
    }

    #[test]
    fn slices_tolerate_cycles() {
        let mut p = Program::new("cyclic");
        p.add(uses(op(), &[OpId(1)]));
        p.add(uses(op(), &[OpId(0)]));
        let slices = BackwardSliceAnalysis::new(&p);
        assert_eq!(*slices.slice(OpId(0)), BTreeSet::from([OpId(0), OpId(1)]));
    }
}
