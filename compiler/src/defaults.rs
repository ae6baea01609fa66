// defaults.rs — Default sequence, loop nest and storage attributes
//
// Three passes, each filling in one lowering attribute of compute operations
// where it is missing and keeping every attribute already present:
//
//   default_sequence   — sequence attribute = position in the total order
//   default_loop_nest  — one fresh loop per domain dimension, in domain order
//   default_storage    — register unless a consumer reads the value outside
//                        the loops it shares with the producer, in which case
//                        the value gets a buffer wide enough for the data
//                        communicated between them
//
// Preconditions: program passed `verify_structure`; default_storage requires
//                every compute operation to carry a loop nest.
// Postconditions: on an empty diagnostic list the attribute is set on every
//                 compute operation; on errors the program is unchanged.
// Failure modes: analysis errors (E01xx, E0200), E0300, E0301, E0302-E0307,
//                hazards (E0400/E0401) with an E0402 summary.
// Side effects: writes attributes on the program.

use log::debug;

use crate::diag::{codes, Diagnostic, Location};
use crate::id::{OpId, ValueRef};
use crate::iteration_space::{IterationSpace, IterationSpaceAnalysis};
use crate::loop_fusion::LoopFusionAnalysis;
use crate::mapping::{Mapping, MappingExpr};
use crate::program::{BufferAttr, ElementType, LoopAttr, MemorySpace, NamedMapping, Program};
use crate::program_query::compute_ops;
use crate::sequence::{BackwardSliceAnalysis, SequenceAnalysis};
use crate::storage::{StorageAnalysis, ValueStorage};

fn one(diag: Diagnostic) -> Vec<Diagnostic> {
    vec![diag]
}

// ── Sequence ────────────────────────────────────────────────────────────────

/// Set the sequence attribute of every compute operation to its position.
pub fn default_sequence(program: &mut Program) -> Vec<Diagnostic> {
    let sequence = match SequenceAnalysis::new(program) {
        Ok(sequence) => sequence,
        Err(diag) => return one(diag),
    };
    for (pos, id) in sequence.ops() {
        program.op_mut(id).sequence = Some(pos as i64);
    }
    debug!("sequenced {} operation(s) of {}", sequence.len(), program.name);
    Vec::new()
}

// ── Loop nest ───────────────────────────────────────────────────────────────

/// Complete `prefix` into a loop nest iterating every one of the `num_dims`
/// domain dimensions, with fresh loop names for the new loops.
pub fn get_default_loop_nest(
    fusion: &mut LoopFusionAnalysis,
    num_dims: usize,
    prefix: &[LoopAttr],
) -> Result<Vec<LoopAttr>, Diagnostic> {
    let iters = prefix.iter().map(|l| l.iter).collect();
    let prefix_mapping = Mapping::new(num_dims, iters).map_err(|e| {
        Diagnostic::error(
            codes::E0100,
            Location::Program,
            format!("loop nest prefix does not fit a {}-dimensional domain: {}", num_dims, e),
        )
    })?;
    let to_domain = prefix_mapping.inverse();
    let mut strip_mined = prefix.iter().filter_map(|l| match l.iter {
        MappingExpr::Stripe { dim, .. } => Some(dim),
        _ => None,
    });
    if let Some(dim) = strip_mined.find(|&d| to_domain.expr(d).is_unknown()) {
        return Err(Diagnostic::error(
            codes::E0100,
            Location::Program,
            format!("loop nest prefix strip-mines d{} without reaching steps of 1", dim),
        ));
    }
    let iters = to_domain.make_surjective().inverse();

    let mut nest = prefix.to_vec();
    for &iter in &iters.exprs()[prefix.len()..] {
        nest.push(LoopAttr::new(fusion.get_fresh_loop_name(), iter));
    }
    Ok(nest)
}

/// Give every compute operation without a loop nest one loop per dimension.
pub fn default_loop_nest(program: &mut Program) -> Vec<Diagnostic> {
    let sequence = match SequenceAnalysis::new(program) {
        Ok(sequence) => sequence,
        Err(diag) => return one(diag),
    };
    let mut fusion = match LoopFusionAnalysis::new(program, &sequence) {
        Ok(fusion) => fusion,
        Err(diag) => return one(diag),
    };

    let missing: Vec<OpId> = compute_ops(program)
        .filter(|&id| program.op(id).loop_nest.is_none())
        .collect();
    for id in missing {
        let nest = match get_default_loop_nest(&mut fusion, program.op(id).domain_size(), &[]) {
            Ok(nest) => nest,
            Err(diag) => return one(diag),
        };
        debug!(
            "default loop nest of {}: [{}]",
            id,
            nest.iter().map(|l| l.name.as_str()).collect::<Vec<_>>().join(", ")
        );
        program.op_mut(id).loop_nest = Some(nest);
    }
    Vec::new()
}

// ── Storage ─────────────────────────────────────────────────────────────────

/// Pick a storage for every value produced by a compute operation.
pub fn default_storage(program: &mut Program) -> Vec<Diagnostic> {
    match infer_storage(program) {
        Ok(committed) => {
            for (id, storage) in committed {
                program.op_mut(id).storage = storage;
            }
            Vec::new()
        }
        Err(diags) => diags,
    }
}

type CommittedStorage = Vec<(OpId, Vec<Option<BufferAttr>>)>;

fn infer_storage(program: &Program) -> Result<CommittedStorage, Vec<Diagnostic>> {
    require_loop_nests(program).map_err(one)?;
    let sequence = SequenceAnalysis::new(program).map_err(one)?;
    let fusion = LoopFusionAnalysis::new(program, &sequence).map_err(one)?;
    let spaces = IterationSpaceAnalysis::new(program);
    let slices = BackwardSliceAnalysis::new(program);
    let mut storage = StorageAnalysis::new(program, &spaces, &fusion).map_err(one)?;

    create_buffers(program, &spaces, &mut storage).map_err(one)?;
    initialize_storage(program, &spaces, &mut storage).map_err(one)?;
    extend_layouts(program, &spaces, &fusion, &mut storage).map_err(one)?;
    make_layouts_fully_specified(program, &mut storage).map_err(one)?;

    let mut violations = storage.verify_and_minimize_buffer_loop_nests(&spaces);
    violations.extend(storage.verify_values_not_overwritten(&sequence, &slices));
    violations.extend(storage.verify_register_values_defined_before_use(&sequence));
    if !violations.is_empty() {
        let summary = violations.iter().fold(
            Diagnostic::error(
                codes::E0402,
                Location::Program,
                format!(
                    "default storage of {} is invalid: {} violation(s)",
                    program.name,
                    violations.len()
                ),
            ),
            |summary, v| summary.with_cause(v.message.clone(), Some(v.location)),
        );
        violations.push(summary);
        return Err(violations);
    }

    commit(program, &spaces, &storage).map_err(one)
}

fn require_loop_nests(program: &Program) -> Result<(), Diagnostic> {
    match compute_ops(program).find(|&id| program.op(id).loop_nest.is_none()) {
        Some(id) => Err(Diagnostic::error(
            codes::E0300,
            Location::Op(id),
            "operation has no loop nest",
        )
        .with_hint("run the default loop nest pass first")),
        None => Ok(()),
    }
}

/// True if `consumer` can read the value through `mapping` (consumer domain
/// to producer domain) from registers: only the loops it shares with the
/// producer are involved.
pub fn fits_in_registers(
    spaces: &IterationSpaceAnalysis<'_>,
    consumer: OpId,
    producer: OpId,
    mapping: &Mapping,
) -> Result<bool, Diagnostic> {
    let translated = spaces.translate_mapping(consumer, producer, mapping)?;
    let common = spaces.get(consumer).num_common_loops(spaces.get(producer));
    Ok(translated.min_domain_size() <= common)
}

/// Dimensions of a value of rank `value_rank` that cross the boundary of the
/// loops `def` and `use_` share: a mapping from the value domain to the
/// producer iteration dimensions outside the common loops.
pub fn communication_volume(
    value_rank: usize,
    def: &IterationSpace,
    use_: &IterationSpace,
) -> Mapping {
    let common = def.num_common_loops(use_);
    let domain_to_common = def.mapping().resize(common);
    debug_assert_eq!(domain_to_common.use_domain_size(), value_rank);
    domain_to_common
        .inverse()
        .make_surjective()
        .inverse()
        .drop_front(common)
}

fn create_buffers(
    program: &Program,
    spaces: &IterationSpaceAnalysis<'_>,
    storage: &mut StorageAnalysis<'_>,
) -> Result<(), Diagnostic> {
    for consumer in program.op_ids() {
        for (index, operand) in program.op(consumer).operands.iter().enumerate() {
            let value = operand.value;
            if storage.get_storage(value).space().is_some() {
                continue;
            }
            let at = Location::Operand { op: consumer, index };
            let mapping = Mapping::new(program.op(consumer).domain_size(), operand.mapping.clone())
                .map_err(|e| Diagnostic::error(codes::E0001, at, e.to_string()))?;
            if fits_in_registers(spaces, consumer, value.op, &mapping)? {
                continue;
            }
            if program.element_type(value) == ElementType::Index {
                return Err(Diagnostic::error(
                    codes::E0301,
                    at,
                    format!("{} is an index value and cannot get a default buffer", value),
                )
                .with_hint("give the value an explicit storage attribute"));
            }
            storage.create_buffer(value, spaces.get(consumer).loop_names(), spaces)?;
        }
    }
    Ok(())
}

/// Default to registers and give every value a layout of the right rank.
fn initialize_storage(
    program: &Program,
    spaces: &IterationSpaceAnalysis<'_>,
    storage: &mut StorageAnalysis<'_>,
) -> Result<(), Diagnostic> {
    for id in program.op_ids() {
        for result in 0..program.op(id).results.len() {
            let value = ValueRef::new(id, result);
            let current = storage.get_storage(value).clone();
            let layout = match current.layout() {
                Some(_) => None,
                None => {
                    let rank = current
                        .buffer_name()
                        .and_then(|name| storage.get_buffer(name))
                        .map_or(0, |buffer| buffer.rank());
                    Some(Mapping::unknown(spaces.get(id).mapping().size(), rank))
                }
            };
            let space = current.space().unwrap_or(MemorySpace::Register);
            storage.merge_storage(value, &ValueStorage::new(Some(space), None, layout))?;
        }
    }
    Ok(())
}

/// Make every layout cover the data its consumers read outside the loops
/// they share with the producer, adding buffer dimensions where needed.
fn extend_layouts(
    program: &Program,
    spaces: &IterationSpaceAnalysis<'_>,
    fusion: &LoopFusionAnalysis,
    storage: &mut StorageAnalysis<'_>,
) -> Result<(), Diagnostic> {
    for consumer in program.op_ids() {
        for (index, operand) in program.op(consumer).operands.iter().enumerate() {
            let value = operand.value;
            let producer = value.op;
            let current = storage.get_storage(value).clone();
            let Some(layout) = current.layout() else {
                continue;
            };
            let def = spaces.get(producer);
            let cv = communication_volume(program.op(producer).domain_size(), def, spaces.get(consumer));
            let layout_to_cv = def.mapping().compose(layout).inverse().compose(&cv);
            if layout_to_cv.is_surjective() {
                continue;
            }

            let at = Location::Operand { op: consumer, index };
            let Some(name) = current.buffer_name() else {
                return Err(Diagnostic::error(
                    codes::E0304,
                    at,
                    format!(
                        "{} is kept in registers but read outside the loops of its producer",
                        value
                    ),
                )
                .with_related(Location::Op(producer), "produced here")
                .with_hint("store the value in memory"));
            };
            if storage.get_buffer(name).is_some_and(|b| b.is_external()) {
                return Err(Diagnostic::error(
                    codes::E0303,
                    at,
                    format!(
                        "reading {} needs more dimensions than external buffer '{}' has",
                        value, name
                    ),
                ));
            }

            let rank = layout.size();
            let extended = layout_to_cv.make_surjective();
            let num_new = extended.use_domain_size() - rank;
            // New dimensions first, existing ones after them.
            let permutation = Mapping::identity(rank)
                .shift_right(num_new)
                .add_suffix(Mapping::identity(num_new).exprs());
            let extended = permutation.compose(&extended);
            let new_layout = def
                .mapping()
                .inverse()
                .compose(&cv)
                .compose(&extended.inverse());
            let prefixed = layout.add_prefix(&vec![MappingExpr::Unknown; num_new]);
            let new_layout = new_layout.unify(&prefixed).ok_or_else(|| {
                Diagnostic::error(
                    codes::E0302,
                    at,
                    format!("cannot extend layout {} of {} to {}", layout, value, new_layout),
                )
            })?;

            debug!("extending layout of {} from {} to {}", value, layout, new_layout);
            storage.add_dimensions_to_buffer(name, producer, spaces, fusion, &new_layout)?;
            storage.merge_storage(value, &ValueStorage::new(None, None, Some(new_layout)))?;
        }
    }
    Ok(())
}

fn make_layouts_fully_specified(
    program: &Program,
    storage: &mut StorageAnalysis<'_>,
) -> Result<(), Diagnostic> {
    for id in program.op_ids() {
        for result in 0..program.op(id).results.len() {
            let value = ValueRef::new(id, result);
            let Some(layout) = storage.get_storage(value).layout() else {
                continue;
            };
            let layout = layout.make_fully_specified();
            storage.merge_storage(value, &ValueStorage::new(None, None, Some(layout)))?;
        }
    }
    Ok(())
}

/// Storage attributes of every compute operation, layouts keyed by the names
/// of the loops they index.
fn commit(
    program: &Program,
    spaces: &IterationSpaceAnalysis<'_>,
    storage: &StorageAnalysis<'_>,
) -> Result<CommittedStorage, Diagnostic> {
    let mut committed = Vec::new();
    for id in compute_ops(program) {
        let space = spaces.get(id);
        let mut attrs = Vec::with_capacity(program.op(id).results.len());
        for result in 0..program.op(id).results.len() {
            let value = ValueRef::new(id, result);
            let record = storage.get_storage(value);
            let layout = match record.layout() {
                Some(layout) => Some(named_layout(id, value, space, layout)?),
                None => None,
            };
            attrs.push(Some(BufferAttr {
                space: record.space().unwrap_or(MemorySpace::Register),
                name: record.buffer_name().map(str::to_string),
                layout,
            }));
        }
        committed.push((id, attrs));
    }
    Ok(committed)
}

fn named_layout(
    id: OpId,
    value: ValueRef,
    space: &IterationSpace,
    layout: &Mapping,
) -> Result<NamedMapping, Diagnostic> {
    let mut names = Vec::new();
    let mut renaming = vec![MappingExpr::None; layout.use_domain_size()];
    for (dim, used) in layout.dependency_mask().into_iter().enumerate() {
        if !used {
            continue;
        }
        let Some(name) = space.loop_names().get(dim) else {
            return Err(Diagnostic::error(
                codes::E0305,
                Location::Op(id),
                format!("layout of {} indexes d{}, which no loop iterates", value, dim),
            ));
        };
        renaming[dim] = MappingExpr::Dim(names.len());
        names.push(name.clone());
    }
    let renaming = Mapping::from_parts(names.len(), renaming);
    Ok(NamedMapping {
        names,
        exprs: renaming.compose(layout).exprs().to_vec(),
    })
}
