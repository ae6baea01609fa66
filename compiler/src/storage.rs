// storage.rs — Value storage and buffer bookkeeping
//
// Tracks, for every value, where it lives (register or memory), which buffer
// holds it and how the producer's iteration space maps onto the buffer
// dimensions. Records are only ever refined: merging unifies layouts and
// rejects conflicting concrete fields. Buffers only grow, new dimensions
// always in front of the existing ones.
//
// Initial records come from the program: `from_memref`/`to_memref` declare
// external buffers, storage attributes of compute operations are converted
// from loop-name keyed layouts to iteration-space indexed ones.
//
// Preconditions: program passed `verify_structure`; iteration spaces and
//                loop fusion classes are available.
// Postconditions: every value stored in a buffer is registered with it and
//                 its layout rank equals the buffer rank.
// Failure modes: E0302 (conflicting merge), E0305 (malformed storage
//                attribute), E0306 (buffer dimension depends on a loop
//                outside the buffer loop nest), E0400/E0401 (hazards).
// Side effects: none.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

use log::{debug, trace};

use crate::diag::{codes, Diagnostic, Location};
use crate::id::{NameAllocator, OpId, ValueRef};
use crate::iteration_space::IterationSpaceAnalysis;
use crate::loop_fusion::LoopFusionAnalysis;
use crate::mapping::{Mapping, MappingExpr};
use crate::program::{BufferAttr, DomainDim, ElementType, MemorySpace, OpKind, Program};
use crate::program_query::{buffer_names_in_use, compute_ops, value_uses, ValueUse};
use crate::sequence::{BackwardSliceAnalysis, SequenceAnalysis};

// ── Value storage ───────────────────────────────────────────────────────────

/// Storage decision for one value; every field may still be unset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValueStorage {
    space: Option<MemorySpace>,
    buffer_name: Option<String>,
    /// Mapping from the producer iteration space to buffer dimensions.
    layout: Option<Mapping>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeError {
    Space { old: MemorySpace, new: MemorySpace },
    BufferName { old: String, new: String },
    Layout { old: Mapping, new: Mapping },
}

impl fmt::Display for MergeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeError::Space { old, new } => {
                write!(f, "memory space {} conflicts with {}", new, old)
            }
            MergeError::BufferName { old, new } => {
                write!(f, "buffer '{}' conflicts with '{}'", new, old)
            }
            MergeError::Layout { old, new } => write!(f, "layout {} conflicts with {}", new, old),
        }
    }
}

impl ValueStorage {
    pub fn new(
        space: Option<MemorySpace>,
        buffer_name: Option<String>,
        layout: Option<Mapping>,
    ) -> Self {
        Self {
            space,
            buffer_name,
            layout,
        }
    }

    pub fn space(&self) -> Option<MemorySpace> {
        self.space
    }

    pub fn buffer_name(&self) -> Option<&str> {
        self.buffer_name.as_deref()
    }

    pub fn layout(&self) -> Option<&Mapping> {
        self.layout.as_ref()
    }

    pub fn merge_space(&mut self, space: MemorySpace) -> Result<(), MergeError> {
        match self.space {
            Some(old) if old != space => Err(MergeError::Space { old, new: space }),
            _ => {
                self.space = Some(space);
                Ok(())
            }
        }
    }

    pub fn merge_buffer_name(&mut self, name: &str) -> Result<(), MergeError> {
        match &self.buffer_name {
            Some(old) if old != name => Err(MergeError::BufferName {
                old: old.clone(),
                new: name.to_string(),
            }),
            _ => {
                self.buffer_name = Some(name.to_string());
                Ok(())
            }
        }
    }

    /// Unify the layout with `layout`.
    pub fn merge_layout(&mut self, layout: &Mapping) -> Result<(), MergeError> {
        let merged = match &self.layout {
            None => layout.clone(),
            Some(old) => old.unify(layout).ok_or_else(|| MergeError::Layout {
                old: old.clone(),
                new: layout.clone(),
            })?,
        };
        self.layout = Some(merged);
        Ok(())
    }

    pub fn merge(&mut self, other: &ValueStorage) -> Result<(), MergeError> {
        if let Some(space) = other.space {
            self.merge_space(space)?;
        }
        if let Some(name) = &other.buffer_name {
            self.merge_buffer_name(name)?;
        }
        if let Some(layout) = &other.layout {
            self.merge_layout(layout)?;
        }
        Ok(())
    }
}

// ── Buffers ─────────────────────────────────────────────────────────────────

/// One buffer dimension: its extent and the loops the extent depends on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferDim {
    pub range: Option<String>,
    pub depends_on_loops: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Buffer {
    name: String,
    element_type: ElementType,
    external: bool,
    loop_nest: Vec<String>,
    dims: Vec<BufferDim>,
    values: BTreeSet<ValueRef>,
}

impl Buffer {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    /// External buffers are provided by the caller; their rank is fixed.
    pub fn is_external(&self) -> bool {
        self.external
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Loops the buffer is allocated in.
    pub fn loop_nest(&self) -> &[String] {
        &self.loop_nest
    }

    pub fn dims(&self) -> &[BufferDim] {
        &self.dims
    }

    pub fn values(&self) -> &BTreeSet<ValueRef> {
        &self.values
    }
}

fn memref_dims(domain: &[DomainDim]) -> Vec<BufferDim> {
    domain
        .iter()
        .map(|d| BufferDim {
            range: Some(d.range.clone()),
            depends_on_loops: Vec::new(),
        })
        .collect()
}

fn malformed(location: Location, message: impl Into<String>) -> Diagnostic {
    Diagnostic::error(codes::E0305, location, message)
}

// ── Analysis ────────────────────────────────────────────────────────────────

pub struct StorageAnalysis<'p> {
    program: &'p Program,
    storages: HashMap<ValueRef, ValueStorage>,
    buffers: BTreeMap<String, Buffer>,
    uses: HashMap<ValueRef, Vec<ValueUse>>,
    names_in_use: HashSet<String>,
    allocator: NameAllocator,
}

impl<'p> StorageAnalysis<'p> {
    /// Build the initial storage records from the program.
    pub fn new(
        program: &'p Program,
        spaces: &IterationSpaceAnalysis<'_>,
        fusion: &LoopFusionAnalysis,
    ) -> Result<Self, Diagnostic> {
        let mut analysis = Self {
            program,
            storages: HashMap::new(),
            buffers: BTreeMap::new(),
            uses: value_uses(program),
            names_in_use: buffer_names_in_use(program),
            allocator: NameAllocator::new("buffer"),
        };
        for id in program.op_ids() {
            for result in 0..program.op(id).results.len() {
                analysis
                    .storages
                    .insert(ValueRef::new(id, result), ValueStorage::default());
            }
        }

        analysis.init_memrefs(spaces)?;
        analysis.init_from_attributes(spaces, fusion)?;
        debug!(
            "storage of {}: {} buffer(s) declared",
            program.name,
            analysis.buffers.len()
        );
        Ok(analysis)
    }

    fn init_memrefs(&mut self, spaces: &IterationSpaceAnalysis<'_>) -> Result<(), Diagnostic> {
        let program = self.program;
        for id in program.op_ids() {
            let op = program.op(id);
            match &op.kind {
                OpKind::Compute => {}
                OpKind::FromMemref { buffer } => {
                    let value = ValueRef::new(id, 0);
                    self.declare_external(id, buffer, memref_dims(&op.domain), value)?;
                    let layout = Mapping::identity(spaces.get(id).mapping().size());
                    let storage = ValueStorage::new(
                        Some(MemorySpace::Memory),
                        Some(buffer.clone()),
                        Some(layout),
                    );
                    self.merge_storage(value, &storage)?;
                }
                OpKind::ToMemref { buffer } => {
                    let operand = &op.operands[0];
                    let value = operand.value;
                    let at = Location::Operand { op: id, index: 0 };
                    let mapping = Mapping::new(op.domain_size(), operand.mapping.clone())
                        .map_err(|e| malformed(at, e.to_string()))?;
                    let layout = spaces
                        .get(value.op)
                        .mapping()
                        .inverse()
                        .compose(&mapping.inverse());
                    if !layout.is_fully_specified() {
                        return Err(malformed(
                            at,
                            format!(
                                "every dimension of buffer '{}' must be indexed by the stored value",
                                buffer
                            ),
                        ));
                    }
                    self.declare_external(id, buffer, memref_dims(&op.domain), value)?;
                    let storage = ValueStorage::new(
                        Some(MemorySpace::Memory),
                        Some(buffer.clone()),
                        Some(layout),
                    );
                    self.merge_storage(value, &storage)?;
                }
            }
        }
        Ok(())
    }

    fn declare_external(
        &mut self,
        declared_by: OpId,
        name: &str,
        dims: Vec<BufferDim>,
        value: ValueRef,
    ) -> Result<(), Diagnostic> {
        if let Some(existing) = self.buffers.get(name) {
            if existing.rank() != dims.len() {
                return Err(malformed(
                    Location::Op(declared_by),
                    format!(
                        "external buffer '{}' is declared with rank {} and {}",
                        name,
                        existing.rank(),
                        dims.len()
                    ),
                ));
            }
            return Ok(());
        }
        self.buffers.insert(
            name.to_string(),
            Buffer {
                name: name.to_string(),
                element_type: self.program.element_type(value),
                external: true,
                loop_nest: Vec::new(),
                dims,
                values: BTreeSet::new(),
            },
        );
        Ok(())
    }

    fn init_from_attributes(
        &mut self,
        spaces: &IterationSpaceAnalysis<'_>,
        fusion: &LoopFusionAnalysis,
    ) -> Result<(), Diagnostic> {
        let program = self.program;
        let mut declared: Vec<(ValueRef, ValueStorage)> = Vec::new();
        for id in compute_ops(program) {
            for (result, attr) in program.op(id).storage.iter().enumerate() {
                if let Some(attr) = attr {
                    let value = ValueRef::new(id, result);
                    declared.push((value, storage_from_attr(value, attr, spaces)?));
                }
            }
        }

        // Buffers named only by storage attributes.
        let mut ranks: BTreeMap<&str, (usize, ValueRef)> = BTreeMap::new();
        for (value, storage) in &declared {
            let (Some(name), Some(layout)) = (storage.buffer_name(), storage.layout()) else {
                continue;
            };
            let expected = match self.buffers.get(name) {
                Some(buffer) => Some(buffer.rank()),
                None => ranks.get(name).map(|(rank, _)| *rank),
            };
            match expected {
                Some(rank) if rank != layout.size() => {
                    return Err(malformed(
                        Location::Op(value.op),
                        format!(
                            "layout of {} has rank {} but buffer '{}' has rank {}",
                            value,
                            layout.size(),
                            name,
                            rank
                        ),
                    ));
                }
                Some(_) => {}
                None => {
                    ranks.insert(name, (layout.size(), *value));
                }
            }
        }
        for (value, storage) in &declared {
            let Some(name) = storage.buffer_name() else {
                continue;
            };
            if self.buffers.contains_key(name) {
                continue;
            }
            let rank = ranks.get(name).map(|(rank, _)| *rank).unwrap_or(0);
            let mut dims = vec![BufferDim::default(); rank];
            for (k, dim) in dims.iter_mut().enumerate() {
                let writer = declared.iter().find_map(|(v, s)| {
                    let expr = s.layout().filter(|_| s.buffer_name() == Some(name))?.expr(k);
                    expr.as_dim().map(|d| (v.op, d))
                });
                if let Some((producer, space_dim)) = writer {
                    *dim = self.buffer_dim(producer, space_dim, spaces, fusion)?;
                }
            }
            self.buffers.insert(
                name.to_string(),
                Buffer {
                    name: name.to_string(),
                    element_type: program.element_type(*value),
                    external: false,
                    loop_nest: spaces.get(value.op).loop_names().to_vec(),
                    dims,
                    values: BTreeSet::new(),
                },
            );
        }

        for (value, storage) in &declared {
            self.merge_storage(*value, storage)?;
        }
        Ok(())
    }

    /// Extent of dimension `space_dim` of the iteration space of `producer`,
    /// as a buffer dimension.
    fn buffer_dim(
        &self,
        producer: OpId,
        space_dim: usize,
        spaces: &IterationSpaceAnalysis<'_>,
        fusion: &LoopFusionAnalysis,
    ) -> Result<BufferDim, Diagnostic> {
        let space = spaces.get(producer);
        let loop_names = space.loop_names();
        if space_dim < space.num_loops() {
            let shape = fusion.get_loop_nest(loop_names)?.normalized_shape();
            let dim = &shape[space_dim];
            return Ok(BufferDim {
                range: Some(dim.range.clone()),
                depends_on_loops: dim
                    .dependency
                    .exprs()
                    .iter()
                    .filter_map(|e| e.as_dim())
                    .map(|l| loop_names[l].clone())
                    .collect(),
            });
        }

        let Some(op_dim) = space.mapping().expr(space_dim).as_dim() else {
            return Ok(BufferDim::default());
        };
        let extent = &self.program.op(producer).domain[op_dim];
        let to_loops = space.mapping_to_loops();
        let depends_on_loops = extent
            .depends_on
            .iter()
            .filter_map(|dep| {
                to_loops
                    .exprs()
                    .iter()
                    .position(|e| e.dims().any(|d| d == *dep))
                    .map(|pos| loop_names[pos].clone())
            })
            .collect();
        Ok(BufferDim {
            range: Some(extent.range.clone()),
            depends_on_loops,
        })
    }

    // ── Queries ──

    pub fn get_storage(&self, value: ValueRef) -> &ValueStorage {
        static EMPTY: ValueStorage = ValueStorage {
            space: None,
            buffer_name: None,
            layout: None,
        };
        self.storages.get(&value).unwrap_or(&EMPTY)
    }

    pub fn get_buffer(&self, name: &str) -> Option<&Buffer> {
        self.buffers.get(name)
    }

    pub fn buffers(&self) -> impl Iterator<Item = &Buffer> {
        self.buffers.values()
    }

    // ── Mutation ──

    /// Merge `storage` into the record of `value` and register the value with
    /// its buffer.
    pub fn merge_storage(
        &mut self,
        value: ValueRef,
        storage: &ValueStorage,
    ) -> Result<(), Diagnostic> {
        let conflict = |message: String| {
            Diagnostic::error(codes::E0302, Location::Op(value.op), message)
        };
        let mut merged = self.get_storage(value).clone();
        merged
            .merge(storage)
            .map_err(|e| conflict(format!("conflicting storage for {}: {}", value, e)))?;

        if let Some(name) = merged.buffer_name() {
            let element_type = self.program.element_type(value);
            let buffer = self
                .buffers
                .get_mut(name)
                .ok_or_else(|| conflict(format!("{} is stored in unknown buffer '{}'", value, name)))?;
            if let Some(layout) = merged.layout() {
                if layout.size() != buffer.rank() {
                    return Err(conflict(format!(
                        "layout {} of {} does not match the rank {} of buffer '{}'",
                        layout,
                        value,
                        buffer.rank(),
                        name
                    )));
                }
            }
            if buffer.element_type != element_type {
                return Err(conflict(format!(
                    "buffer '{}' holds {:?} values, {} is {:?}",
                    name, buffer.element_type, value, element_type
                )));
            }
            buffer.values.insert(value);
        }
        self.storages.insert(value, merged);
        Ok(())
    }

    /// Create a rank-0 buffer for `value`, allocated in the loops of `loop_names`
    /// shared with the producer. Returns the buffer name.
    pub fn create_buffer(
        &mut self,
        value: ValueRef,
        loop_names: &[String],
        spaces: &IterationSpaceAnalysis<'_>,
    ) -> Result<String, Diagnostic> {
        let names_in_use = &self.names_in_use;
        let buffers = &self.buffers;
        let name = self
            .allocator
            .fresh(|n| names_in_use.contains(n) || buffers.contains_key(n));

        let producer_space = spaces.get(value.op);
        let common = producer_space.num_common_loops_with(loop_names);
        self.buffers.insert(
            name.clone(),
            Buffer {
                name: name.clone(),
                element_type: self.program.element_type(value),
                external: false,
                loop_nest: loop_names[..common].to_vec(),
                dims: Vec::new(),
                values: BTreeSet::new(),
            },
        );
        debug!("created buffer {} for {}", name, value);

        let storage = ValueStorage::new(
            Some(MemorySpace::Memory),
            Some(name.clone()),
            Some(Mapping::empty(producer_space.mapping().size())),
        );
        self.merge_storage(value, &storage)?;
        Ok(name)
    }

    /// Grow buffer `name` to the rank of `new_layout`, a layout of a value
    /// produced by `producer`. The new dimensions are the leading expressions
    /// of `new_layout`; layouts of values already in the buffer get unknown
    /// expressions for them.
    pub fn add_dimensions_to_buffer(
        &mut self,
        name: &str,
        producer: OpId,
        spaces: &IterationSpaceAnalysis<'_>,
        fusion: &LoopFusionAnalysis,
        new_layout: &Mapping,
    ) -> Result<(), Diagnostic> {
        let Some(buffer) = self.buffers.get(name) else {
            return Err(Diagnostic::error(
                codes::E0302,
                Location::Op(producer),
                format!("unknown buffer '{}'", name),
            ));
        };
        let old_rank = buffer.rank();
        if new_layout.size() < old_rank {
            return Err(Diagnostic::error(
                codes::E0302,
                Location::Op(producer),
                format!("buffer '{}' cannot shrink from rank {}", name, old_rank),
            ));
        }
        let num_new = new_layout.size() - old_rank;

        let mut new_dims = Vec::with_capacity(num_new);
        for k in 0..num_new {
            let dim = match new_layout.expr(k).as_dim() {
                Some(space_dim) => self.buffer_dim(producer, space_dim, spaces, fusion)?,
                None => BufferDim::default(),
            };
            if let Some(outside) = dim
                .depends_on_loops
                .iter()
                .find(|l| !buffer.loop_nest.contains(l))
            {
                return Err(Diagnostic::error(
                    codes::E0306,
                    Location::Op(producer),
                    format!(
                        "new dimension of buffer '{}' depends on loop '{}', outside the buffer loop nest",
                        name, outside
                    ),
                )
                .with_hint("materializing a dependent domain needs an explicit storage attribute"));
            }
            new_dims.push(dim);
        }

        let prefix = vec![MappingExpr::Unknown; num_new];
        let values: Vec<ValueRef> = buffer.values.iter().copied().collect();
        for value in values {
            if let Some(storage) = self.storages.get_mut(&value) {
                if let Some(layout) = &storage.layout {
                    storage.layout = Some(layout.add_prefix(&prefix));
                }
            }
        }
        if let Some(buffer) = self.buffers.get_mut(name) {
            new_dims.append(&mut buffer.dims);
            buffer.dims = new_dims;
            trace!("buffer {} now has rank {}", name, buffer.rank());
        }
        Ok(())
    }

    // ── Verification ──

    /// Trim each buffer loop nest to the loops shared by every access, check
    /// that dimension extents only depend on those loops, then keep the
    /// shortest prefix the extents need.
    pub fn verify_and_minimize_buffer_loop_nests(
        &mut self,
        spaces: &IterationSpaceAnalysis<'_>,
    ) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        let program = self.program;
        for buffer in self.buffers.values_mut() {
            if buffer.external {
                continue;
            }
            let mut accessors: BTreeSet<OpId> = BTreeSet::new();
            for value in &buffer.values {
                accessors.insert(value.op);
                for u in self.uses.get(value).into_iter().flatten() {
                    accessors.insert(u.consumer);
                }
            }
            let mut len = buffer.loop_nest.len();
            for op in accessors.iter().filter(|&&op| program.op(op).is_compute()) {
                len = len.min(spaces.get(*op).num_common_loops_with(&buffer.loop_nest[..len]));
            }
            buffer.loop_nest.truncate(len);

            let mut needed = 0;
            for dim in &buffer.dims {
                for dep in &dim.depends_on_loops {
                    match buffer.loop_nest.iter().position(|l| l == dep) {
                        Some(pos) => needed = needed.max(pos + 1),
                        None => {
                            let at = accessors.iter().next().copied().map_or(Location::Program, Location::Op);
                            diags.push(Diagnostic::error(
                                codes::E0306,
                                at,
                                format!(
                                    "buffer '{}' has a dimension depending on loop '{}', which does not enclose every access",
                                    buffer.name, dep
                                ),
                            ));
                        }
                    }
                }
            }
            buffer.loop_nest.truncate(needed);
            trace!("buffer {} allocated in [{}]", buffer.name, buffer.loop_nest.join(", "));
        }
        diags
    }

    /// Check that no compute operation reads a buffer before the value it
    /// reads is written, or after another write overwrote it.
    pub fn verify_values_not_overwritten(
        &self,
        sequence: &SequenceAnalysis,
        slices: &BackwardSliceAnalysis,
    ) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for buffer in self.buffers.values() {
            let writers: BTreeSet<OpId> = buffer
                .values
                .iter()
                .map(|v| v.op)
                .filter(|&op| self.program.op(op).is_compute())
                .collect();
            for value in &buffer.values {
                let producer = value.op;
                let producer_pos = sequence.position(producer);
                for u in self.uses.get(value).into_iter().flatten() {
                    let Some(use_pos) = sequence.position(u.consumer) else {
                        continue;
                    };
                    let at = Location::Operand {
                        op: u.consumer,
                        index: u.operand,
                    };
                    let slice = slices.slice(u.consumer);
                    for &writer in &writers {
                        let Some(writer_pos) = sequence.position(writer) else {
                            continue;
                        };
                        let feeds_use = writer == producer || slice.contains(&writer);
                        if feeds_use && writer_pos >= use_pos {
                            diags.push(
                                Diagnostic::error(
                                    codes::E0400,
                                    at,
                                    format!(
                                        "buffer '{}' is read before {} writes it",
                                        buffer.name, writer
                                    ),
                                )
                                .with_related(Location::Op(writer), "written here"),
                            );
                        } else if writer != producer
                            && producer_pos.map_or(true, |p| p < writer_pos)
                            && writer_pos < use_pos
                        {
                            diags.push(
                                Diagnostic::error(
                                    codes::E0401,
                                    at,
                                    format!(
                                        "{} in buffer '{}' is overwritten by {} before it is read",
                                        value, buffer.name, writer
                                    ),
                                )
                                .with_related(Location::Op(writer), "overwritten here"),
                            );
                        }
                    }
                }
            }
        }
        diags
    }
    /// Check that values kept in registers are computed before the compute
    /// operations reading them.
    pub fn verify_register_values_defined_before_use(
        &self,
        sequence: &SequenceAnalysis,
    ) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for producer in compute_ops(self.program) {
            let Some(producer_pos) = sequence.position(producer) else {
                continue;
            };
            for result in 0..self.program.op(producer).results.len() {
                let value = ValueRef::new(producer, result);
                if self.get_storage(value).space() != Some(MemorySpace::Register) {
                    continue;
                }
                for u in self.uses.get(&value).into_iter().flatten() {
                    let Some(use_pos) = sequence.position(u.consumer) else {
                        continue;
                    };
                    if use_pos <= producer_pos {
                        diags.push(
                            Diagnostic::error(
                                codes::E0400,
                                Location::Operand {
                                    op: u.consumer,
                                    index: u.operand,
                                },
                                format!("{} is read from registers before {} computes it", value, producer),
                            )
                            .with_related(Location::Op(producer), "computed here"),
                        );
                    }
                }
            }
        }
        diags
    }
}

/// Convert a storage attribute (layout keyed by loop names) into a storage
/// record (layout over the producer iteration space).
fn storage_from_attr(
    value: ValueRef,
    attr: &BufferAttr,
    spaces: &IterationSpaceAnalysis<'_>,
) -> Result<ValueStorage, Diagnostic> {
    let at = Location::Op(value.op);
    match (attr.space, &attr.name) {
        (MemorySpace::Memory, None) => {
            return Err(malformed(at, format!("memory storage of {} needs a buffer name", value)));
        }
        (MemorySpace::Register, Some(name)) => {
            return Err(malformed(
                at,
                format!("register storage of {} cannot name buffer '{}'", value, name),
            ));
        }
        _ => {}
    }

    let space = spaces.get(value.op);
    let layout = match &attr.layout {
        None => None,
        Some(named) => {
            let positions = named
                .names
                .iter()
                .map(|name| {
                    space
                        .loop_names()
                        .iter()
                        .position(|l| l == name)
                        .map(MappingExpr::Dim)
                        .ok_or_else(|| {
                            malformed(
                                at,
                                format!("layout of {} refers to loop '{}', which does not enclose it", value, name),
                            )
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;
            let by_name = Mapping::new(named.names.len(), named.exprs.clone())
                .map_err(|e| malformed(at, format!("layout of {}: {}", value, e)))?;
            let to_space = Mapping::new(space.mapping().size(), positions)
                .map_err(|e| malformed(at, e.to_string()))?;
            Some(to_space.compose(&by_name))
        }
    };
    if attr.space == MemorySpace::Register && layout.as_ref().is_some_and(|l| !l.is_empty()) {
        return Err(malformed(
            at,
            format!("register storage of {} cannot have buffer dimensions", value),
        ));
    }
    Ok(ValueStorage::new(Some(attr.space), attr.name.clone(), layout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{DomainDim, LoopAttr, NamedMapping, Operation};
    use MappingExpr::Dim;

    fn dims(n: usize) -> Vec<DomainDim> {
        (0..n).map(|i| DomainDim::new(format!("R{}", i))).collect()
    }

    fn nest(entries: &[(&str, usize)]) -> Vec<LoopAttr> {
        entries.iter().map(|(n, d)| LoopAttr::new(*n, Dim(*d))).collect()
    }

    fn memory(name: &str, names: &[&str], exprs: &[MappingExpr]) -> Option<BufferAttr> {
        Some(BufferAttr {
            space: MemorySpace::Memory,
            name: Some(name.into()),
            layout: Some(NamedMapping {
                names: names.iter().map(|s| s.to_string()).collect(),
                exprs: exprs.to_vec(),
            }),
        })
    }

    /// Run `check` against fresh analyses of `p`.
    fn with_analyses(p: &Program, check: impl FnOnce(Result<StorageAnalysis<'_>, Diagnostic>, &IterationSpaceAnalysis<'_>, &LoopFusionAnalysis)) {
        let sequence = SequenceAnalysis::new(p).expect("sequence");
        let fusion = LoopFusionAnalysis::new(p, &sequence).expect("fusion");
        let spaces = IterationSpaceAnalysis::new(p);
        let storage = StorageAnalysis::new(p, &spaces, &fusion);
        check(storage, &spaces, &fusion);
    }

    #[test]
    fn merge_refines_and_rejects_conflicts() {
        let mut s = ValueStorage::default();
        s.merge_space(MemorySpace::Memory).unwrap();
        s.merge_layout(&Mapping::parse(2, "?, d1").unwrap()).unwrap();
        s.merge_layout(&Mapping::parse(2, "d0, ?").unwrap()).unwrap();
        assert_eq!(s.layout(), Some(&Mapping::parse(2, "d0, d1").unwrap()));
        assert!(matches!(
            s.merge_space(MemorySpace::Register),
            Err(MergeError::Space { .. })
        ));
        assert!(s.merge_layout(&Mapping::parse(2, "d1, d1").unwrap()).is_err());
        s.merge_buffer_name("a").unwrap();
        assert!(s.merge_buffer_name("b").is_err());
    }

    #[test]
    fn memrefs_declare_external_buffers() {
        let mut p = Program::new("memrefs");
        let input = p.add(Operation::from_memref("in", dims(2)));
        let a = p.add(
            Operation::compute(dims(2))
                .with_operand(ValueRef::new(input, 0), vec![Dim(0), Dim(1)])
                .with_loop_nest(nest(&[("i", 1), ("j", 0)])),
        );
        p.add(Operation::to_memref(
            "out",
            dims(2),
            crate::program::Operand {
                value: ValueRef::new(a, 0),
                mapping: vec![Dim(0), Dim(1)],
            },
        ));
        with_analyses(&p, |storage, _, _| {
            let storage = storage.unwrap();
            let input_buffer = storage.get_buffer("in").unwrap();
            assert!(input_buffer.is_external());
            assert_eq!(input_buffer.rank(), 2);
            let out = storage.get_storage(ValueRef::new(a, 0));
            assert_eq!(out.space(), Some(MemorySpace::Memory));
            assert_eq!(out.buffer_name(), Some("out"));
            // Loop i iterates d1: buffer dimension 0 (d0 of the domain) is loop 1.
            assert_eq!(out.layout(), Some(&Mapping::parse(2, "d1, d0").unwrap()));
        });
    }

    #[test]
    fn attributes_are_converted_to_iteration_space_layouts() {
        let mut p = Program::new("attrs");
        p.add(
            Operation::compute(dims(2))
                .with_loop_nest(nest(&[("i", 0), ("j", 1)]))
                .with_storage(vec![memory("buf", &["j"], &[Dim(0)])]),
        );
        with_analyses(&p, |storage, _, _| {
            let storage = storage.unwrap();
            let value = ValueRef::new(OpId(0), 0);
            assert_eq!(
                storage.get_storage(value).layout(),
                Some(&Mapping::parse(2, "d1").unwrap())
            );
            let buffer = storage.get_buffer("buf").unwrap();
            assert!(!buffer.is_external());
            assert_eq!(buffer.rank(), 1);
            assert_eq!(buffer.dims()[0].range.as_deref(), Some("R1"));
            assert_eq!(buffer.loop_nest(), ["i".to_string(), "j".to_string()]);
            assert!(buffer.values().contains(&value));
        });
    }

    #[test]
    fn malformed_attributes_are_rejected() {
        let cases = vec![
            Some(BufferAttr {
                space: MemorySpace::Memory,
                name: None,
                layout: None,
            }),
            Some(BufferAttr {
                space: MemorySpace::Register,
                name: Some("r".into()),
                layout: None,
            }),
            memory("buf", &["k"], &[Dim(0)]),
        ];
        for attr in cases {
            let mut p = Program::new("malformed");
            p.add(
                Operation::compute(dims(1))
                    .with_loop_nest(nest(&[("i", 0)]))
                    .with_storage(vec![attr]),
            );
            with_analyses(&p, |storage, _, _| {
                assert_eq!(storage.err().and_then(|d| d.code), Some(codes::E0305));
            });
        }
    }

    #[test]
    fn create_and_grow_buffer() {
        let mut p = Program::new("grow");
        let a = p.add(Operation::compute(dims(2)).with_loop_nest(nest(&[("i", 0), ("j", 1)])));
        p.add(
            Operation::compute(dims(2))
                .with_operand(ValueRef::new(a, 0), vec![Dim(0), Dim(1)])
                .with_loop_nest(nest(&[("i", 0), ("k", 1)])),
        );
        with_analyses(&p, |storage, spaces, fusion| {
            let mut storage = storage.unwrap();
            let value = ValueRef::new(a, 0);
            let consumer_loops = vec!["i".to_string(), "k".to_string()];
            let name = storage.create_buffer(value, &consumer_loops, spaces).unwrap();
            assert_eq!(name, "buffer_0");
            assert_eq!(storage.get_buffer(&name).unwrap().loop_nest(), ["i".to_string()]);
            assert_eq!(storage.get_storage(value).layout().unwrap().size(), 0);

            let new_layout = Mapping::parse(2, "d1").unwrap();
            storage
                .add_dimensions_to_buffer(&name, a, spaces, fusion, &new_layout)
                .unwrap();
            assert_eq!(
                storage.get_storage(value).layout(),
                Some(&Mapping::parse(2, "?").unwrap())
            );
            let grown = ValueStorage::new(None, None, Some(new_layout));
            storage.merge_storage(value, &grown).unwrap();
            assert_eq!(storage.get_buffer(&name).unwrap().rank(), 1);

            assert!(storage.verify_and_minimize_buffer_loop_nests(spaces).is_empty());
            assert!(storage.get_buffer(&name).unwrap().loop_nest().is_empty());
        });
    }

    #[test]
    fn conflicting_storage_is_a_merge_error() {
        let mut p = Program::new("conflict");
        p.add(
            Operation::compute(dims(1))
                .with_loop_nest(nest(&[("i", 0)]))
                .with_storage(vec![memory("buf", &["i"], &[Dim(0)])]),
        );
        with_analyses(&p, |storage, _, _| {
            let mut storage = storage.unwrap();
            let other = ValueStorage::new(Some(MemorySpace::Register), None, None);
            let err = storage
                .merge_storage(ValueRef::new(OpId(0), 0), &other)
                .unwrap_err();
            assert_eq!(err.code, Some(codes::E0302));
        });
    }

    fn writer_reader(writer_seq: i64, reader_seq: i64) -> Program {
        let mut p = Program::new("hazard");
        let a = p.add(
            Operation::compute(dims(1))
                .with_loop_nest(nest(&[("L", 0)]))
                .with_sequence(writer_seq)
                .with_storage(vec![memory("buf", &["L"], &[Dim(0)])]),
        );
        p.add(
            Operation::compute(dims(1))
                .with_operand(ValueRef::new(a, 0), vec![Dim(0)])
                .with_loop_nest(nest(&[("L", 0)]))
                .with_sequence(reader_seq),
        );
        p
    }

    fn hazards(p: &Program) -> Vec<Diagnostic> {
        let sequence = SequenceAnalysis::new(p).unwrap();
        let slices = BackwardSliceAnalysis::new(p);
        let mut result = Vec::new();
        with_analyses(p, |storage, _, _| {
            result = storage.unwrap().verify_values_not_overwritten(&sequence, &slices);
        });
        result
    }

    #[test]
    fn register_value_read_before_it_is_computed() {
        let mut p = Program::new("early");
        let a = p.add(
            Operation::compute(dims(1))
                .with_loop_nest(nest(&[("L", 0)]))
                .with_sequence(1)
                .with_storage(vec![Some(BufferAttr {
                    space: MemorySpace::Register,
                    name: None,
                    layout: None,
                })]),
        );
        p.add(
            Operation::compute(dims(1))
                .with_operand(ValueRef::new(a, 0), vec![Dim(0)])
                .with_loop_nest(nest(&[("L", 0)]))
                .with_sequence(0),
        );
        let sequence = SequenceAnalysis::new(&p).unwrap();
        with_analyses(&p, |storage, _, _| {
            let diags = storage
                .unwrap()
                .verify_register_values_defined_before_use(&sequence);
            assert_eq!(diags.len(), 1);
            assert_eq!(diags[0].code, Some(codes::E0400));
            assert_eq!(diags[0].location, Location::Operand { op: OpId(1), index: 0 });
            assert_eq!(diags[0].related[0].location, Location::Op(a));
        });

        p.op_mut(a).sequence = Some(0);
        p.op_mut(OpId(1)).sequence = Some(1);
        let sequence = SequenceAnalysis::new(&p).unwrap();
        with_analyses(&p, |storage, _, _| {
            assert!(storage
                .unwrap()
                .verify_register_values_defined_before_use(&sequence)
                .is_empty());
        });
    }

    #[test]
    fn write_then_read_is_sound() {
        assert!(hazards(&writer_reader(0, 1)).is_empty());
    }

    #[test]
    fn read_before_write_is_reported() {
        let diags = hazards(&writer_reader(1, 0));
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].code, Some(codes::E0400));
        assert_eq!(
            diags[0].location,
            Location::Operand {
                op: OpId(1),
                index: 0
            }
        );
    }

    #[test]
    fn overwrite_before_read_is_reported() {
        let mut p = writer_reader(0, 2);
        p.add(
            Operation::compute(dims(1))
                .with_loop_nest(nest(&[("L", 0)]))
                .with_sequence(1)
                .with_storage(vec![memory("buf", &["L"], &[Dim(0)])]),
        );
        let diags = hazards(&p);
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].code, Some(codes::E0401));
        assert_eq!(diags[0].related[0].location, Location::Op(OpId(2)));
    }
}
