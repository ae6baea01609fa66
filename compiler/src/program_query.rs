// program_query.rs — Shared helpers for querying program-level data
//
// Eliminates duplicated use-list and name-collection patterns across the
// analyses and passes.

use std::collections::{HashMap, HashSet};

use crate::id::{OpId, ValueRef};
use crate::program::{OpKind, Program};

/// A use of a value: consuming operation and operand index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueUse {
    pub consumer: OpId,
    pub operand: usize,
}

/// Compute operations in program order.
pub fn compute_ops(program: &Program) -> impl Iterator<Item = OpId> + '_ {
    program.op_ids().filter(|&id| program.op(id).is_compute())
}

/// Every value's uses, in program order.
pub fn value_uses(program: &Program) -> HashMap<ValueRef, Vec<ValueUse>> {
    let mut uses: HashMap<ValueRef, Vec<ValueUse>> = HashMap::new();
    for consumer in program.op_ids() {
        for (operand, o) in program.op(consumer).operands.iter().enumerate() {
            uses.entry(o.value)
                .or_default()
                .push(ValueUse { consumer, operand });
        }
    }
    uses
}

/// Loop names mentioned by any loop nest attribute.
pub fn loop_names_in_use(program: &Program) -> HashSet<String> {
    program
        .ops
        .iter()
        .flat_map(|op| op.loop_names().map(str::to_string))
        .collect()
}

/// Buffer names mentioned by memref operations or storage attributes.
pub fn buffer_names_in_use(program: &Program) -> HashSet<String> {
    let mut names = HashSet::new();
    for op in &program.ops {
        match &op.kind {
            OpKind::FromMemref { buffer } | OpKind::ToMemref { buffer } => {
                names.insert(buffer.clone());
            }
            OpKind::Compute => {}
        }
        for attr in op.storage.iter().flatten() {
            if let Some(name) = &attr.name {
                names.insert(name.clone());
            }
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::MappingExpr::Dim;
    use crate::program::{BufferAttr, DomainDim, LoopAttr, MemorySpace, Operation};

    #[test]
    fn uses_and_names() {
        let mut p = Program::new("q");
        let src = p.add(Operation::from_memref("input", vec![DomainDim::new("N")]));
        let a = p.add(
            Operation::compute(vec![DomainDim::new("N")])
                .with_operand(ValueRef::new(src, 0), vec![Dim(0)])
                .with_loop_nest(vec![LoopAttr::new("i", Dim(0))])
                .with_storage(vec![Some(BufferAttr {
                    space: MemorySpace::Memory,
                    name: Some("tmp".into()),
                    layout: None,
                })]),
        );
        p.add(
            Operation::compute(vec![DomainDim::new("N")])
                .with_operand(ValueRef::new(a, 0), vec![Dim(0)])
                .with_operand(ValueRef::new(a, 0), vec![Dim(0)]),
        );

        assert_eq!(compute_ops(&p).collect::<Vec<_>>(), vec![OpId(1), OpId(2)]);
        let uses = value_uses(&p);
        assert_eq!(uses[&ValueRef::new(a, 0)].len(), 2);
        assert_eq!(uses[&ValueRef::new(a, 0)][1].operand, 1);
        assert!(loop_names_in_use(&p).contains("i"));
        let buffers = buffer_names_in_use(&p);
        assert!(buffers.contains("input") && buffers.contains("tmp"));
    }
}
