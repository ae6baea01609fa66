// loop_fusion.rs — Loop fusion classes
//
// Every loop name denotes one fused loop shared by all operations that list
// it. The first occurrence (in sequence order, outer loops first) creates the
// loop's fusion class: its enclosing loop names, the domain defining its
// extent and the iter expression over that domain. Later occurrences must
// nest the loop in the same outer loops, iterate a dimension with the same
// extent and agree on the iter expression. Strip-mined loops of one
// dimension share a single domain dimension, added by the outermost strip.
//
// Preconditions: program passed `verify_structure`.
// Postconditions: for every class, the domain of each outer class is a prefix
//                 of its domain.
// Failure modes: E0100 (malformed loop nest), E0101 (different outer loops),
//                E0102 (incompatible extents), E0103 (conflicting iter
//                expressions), E0104 (extent depends on a non-iterated
//                dimension), E0105 (unknown loop requested).
// Side effects: none.

use std::collections::{HashMap, HashSet};

use log::{debug, trace};

use crate::diag::{codes, Diagnostic, Location};
use crate::id::{NameAllocator, OpId};
use crate::mapping::{Mapping, MappingExpr, StripeList};
use crate::program::{Operation, Program};
use crate::program_query::loop_names_in_use;
use crate::sequence::SequenceAnalysis;

// ── Public types ────────────────────────────────────────────────────────────

/// One dimension of a loop domain: its extent and the mapping from the
/// earlier domain dimensions to the dimensions the extent depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainAccess {
    pub range: String,
    pub dependency: Mapping,
}

#[derive(Debug, Clone)]
pub struct LoopFusionClass {
    loop_nest: Vec<String>,
    num_dependencies: usize,
    domain: Vec<DomainAccess>,
    iter_expr: MappingExpr,
    first_op: OpId,
    last_op: OpId,
}

impl LoopFusionClass {
    pub fn name(&self) -> &str {
        self.loop_nest.last().map(String::as_str).unwrap_or_default()
    }

    /// Names of the enclosing loops, this one included.
    pub fn loop_nest(&self) -> &[String] {
        &self.loop_nest
    }

    /// Outer loops the extent of this loop depends on.
    pub fn dependencies(&self) -> &[String] {
        &self.loop_nest[..self.num_dependencies]
    }

    pub fn domain(&self) -> &[DomainAccess] {
        &self.domain
    }

    /// Expression of the loop index over the class domain.
    pub fn iter_expr(&self) -> MappingExpr {
        self.iter_expr
    }

    /// Index of the class domain dimension the loop iterates.
    fn domain_dim(&self) -> usize {
        self.iter_expr.dims().next().unwrap_or_default()
    }

    /// Location of the first occurrence of the loop.
    pub fn location(&self) -> Location {
        Location::Op(self.first_op)
    }

    /// Last operation (in sequence order) nested in the loop.
    pub fn last_op(&self) -> OpId {
        self.last_op
    }
}

/// Unified loop nest shared by several operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopNest {
    domain: Vec<DomainAccess>,
    domain_to_loops: Mapping,
}

impl LoopNest {
    pub fn domain(&self) -> &[DomainAccess] {
        &self.domain
    }

    pub fn domain_to_loops(&self) -> &Mapping {
        &self.domain_to_loops
    }

    pub fn num_loops(&self) -> usize {
        self.domain_to_loops.size()
    }

    /// Shape of the domain the loops are defined from.
    pub fn domain_shape(&self) -> Vec<DomainAccess> {
        self.domain.clone()
    }

    /// Shape of the loops: one dimension per loop, dependencies expressed
    /// over loop indices. Strip loops report the extent of the whole
    /// dimension.
    pub fn shape(&self) -> Vec<DomainAccess> {
        let loops_to_domain = self.domain_to_loops.inverse();
        self.domain_to_loops
            .exprs()
            .iter()
            .enumerate()
            .filter_map(|(pos, e)| e.dims().next().map(|d| (pos, d)))
            .map(|(pos, d)| {
                let access = &self.domain[d];
                let to_loops = loops_to_domain
                    .resize(access.dependency.use_domain_size())
                    .compose(&access.dependency);
                let use_size = pos.max(to_loops.min_domain_size());
                DomainAccess {
                    range: access.range.clone(),
                    dependency: Mapping::from_parts(use_size, to_loops.exprs().to_vec()),
                }
            })
            .collect()
    }

    /// Shape of the loops where each dependency is the identity over the
    /// loops it depends on.
    pub fn normalized_shape(&self) -> Vec<DomainAccess> {
        self.shape()
            .into_iter()
            .map(|access| {
                let use_size = access.dependency.use_domain_size();
                let exprs = access
                    .dependency
                    .dependency_mask()
                    .iter()
                    .enumerate()
                    .filter(|(_, used)| **used)
                    .map(|(d, _)| MappingExpr::Dim(d))
                    .collect();
                DomainAccess {
                    range: access.range,
                    dependency: Mapping::from_parts(use_size, exprs),
                }
            })
            .collect()
    }
}

// ── Analysis ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LoopFusionAnalysis {
    classes: HashMap<String, LoopFusionClass>,
    names_in_use: HashSet<String>,
    allocator: NameAllocator,
}

impl LoopFusionAnalysis {
    /// Register the loops of every compute operation, in sequence order.
    pub fn new(program: &Program, sequence: &SequenceAnalysis) -> Result<Self, Diagnostic> {
        let mut analysis = Self {
            classes: HashMap::new(),
            names_in_use: loop_names_in_use(program),
            allocator: NameAllocator::new("loop"),
        };
        for (_, id) in sequence.ops() {
            let op = program.op(id);
            if op.loop_nest.is_none() {
                continue;
            }
            verify_loop_nest_well_formed(id, op)?;
            analysis.register_op(id, op)?;
        }
        debug!(
            "loop fusion of {}: {} fusion class(es)",
            program.name,
            analysis.classes.len()
        );
        Ok(analysis)
    }

    pub fn class(&self, name: &str) -> Option<&LoopFusionClass> {
        self.classes.get(name)
    }

    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    /// Unified loop nest of the given loop names, which must form the loop
    /// nest of their innermost loop.
    pub fn get_loop_nest(&self, names: &[String]) -> Result<LoopNest, Diagnostic> {
        let mut iter_exprs = Vec::with_capacity(names.len());
        let mut domain: &[DomainAccess] = &[];
        for (pos, name) in names.iter().enumerate() {
            let class = self.classes.get(name).ok_or_else(|| {
                Diagnostic::error(
                    codes::E0105,
                    Location::Program,
                    format!("unknown loop '{}'", name),
                )
            })?;
            if class.loop_nest() != &names[..=pos] {
                return Err(Diagnostic::error(
                    codes::E0101,
                    class.location(),
                    format!(
                        "loop '{}' is nested in [{}], not in [{}]",
                        name,
                        class.loop_nest()[..class.loop_nest().len() - 1].join(", "),
                        names[..pos].join(", ")
                    ),
                ));
            }
            iter_exprs.push(class.iter_expr());
            domain = class.domain();
        }
        Ok(LoopNest {
            domain: domain.to_vec(),
            domain_to_loops: Mapping::from_parts(domain.len(), iter_exprs),
        })
    }

    /// Unified loop nest of a compute operation.
    pub fn get_op_loop_nest(&self, op: &Operation) -> Result<LoopNest, Diagnostic> {
        let names: Vec<String> = op.loop_names().map(str::to_string).collect();
        self.get_loop_nest(&names)
    }

    /// A loop name not used anywhere in the program nor returned before.
    pub fn get_fresh_loop_name(&mut self) -> String {
        let classes = &self.classes;
        let in_use = &self.names_in_use;
        self.allocator
            .fresh(|name| classes.contains_key(name) || in_use.contains(name))
    }

    fn register_op(&mut self, id: OpId, op: &Operation) -> Result<(), Diagnostic> {
        let Some(nest) = &op.loop_nest else {
            return Ok(());
        };
        // Op dimension -> index in the loop domain, filled as loops are visited.
        let mut op_to_domain = vec![MappingExpr::Unknown; op.domain_size()];
        // Op dimension -> innermost loop visited so far that iterates it.
        let mut last_loop: Vec<Option<usize>> = vec![None; op.domain_size()];
        let names: Vec<String> = nest.iter().map(|l| l.name.clone()).collect();

        for (pos, attr) in nest.iter().enumerate() {
            // Well-formedness guarantees a dimension or a strip of one.
            let (dim, factors) = match attr.iter {
                MappingExpr::Dim(d) => (d, None),
                MappingExpr::Stripe { dim, factors } => (dim, Some(factors)),
                _ => continue,
            };
            let extent = &op.domain[dim];
            let deps: Vec<MappingExpr> = extent
                .depends_on
                .iter()
                .map(|&d| op_to_domain[d])
                .collect();
            let prefix = &names[..=pos];

            match self.classes.get_mut(&attr.name) {
                Some(class) => {
                    if class.loop_nest != prefix {
                        return Err(Diagnostic::error(
                            codes::E0101,
                            Location::Op(id),
                            format!(
                                "loop '{}' is nested in [{}] here but in [{}] where it is defined",
                                attr.name,
                                names[..pos].join(", "),
                                class.loop_nest[..class.loop_nest.len() - 1].join(", ")
                            ),
                        )
                        .with_related(class.location(), "loop defined here")
                        .with_hint("a loop must be referenced with the same outer loops everywhere"));
                    }
                    let class_dim = class.domain_dim();
                    let access = &class.domain[class_dim];
                    if access.range != extent.range || access.dependency.exprs() != deps.as_slice() {
                        return Err(Diagnostic::error(
                            codes::E0102,
                            Location::Op(id),
                            format!(
                                "loop '{}' iterates over '{}' here but over '{}' where it is defined",
                                attr.name, extent.range, access.range
                            ),
                        )
                        .with_related(class.location(), "loop defined here"));
                    }
                    let bound = op_to_domain[dim]
                        .unify(MappingExpr::Dim(class_dim))
                        .filter(|_| stripe_factors(class.iter_expr) == factors);
                    match bound {
                        Some(expr) => op_to_domain[dim] = expr,
                        None => {
                            return Err(Diagnostic::error(
                                codes::E0103,
                                Location::Op(id),
                                format!(
                                    "conflicting iter expressions for loop '{}': {} here, {} over its domain where it is defined",
                                    attr.name, attr.iter, class.iter_expr
                                ),
                            )
                            .with_related(class.location(), "loop defined here"));
                        }
                    }
                    class.last_op = id;
                }
                None => {
                    let mut domain = match pos {
                        0 => Vec::new(),
                        _ => self
                            .classes
                            .get(&names[pos - 1])
                            .map(|outer| outer.domain.clone())
                            .unwrap_or_default(),
                    };
                    let (class_dim, num_dependencies) = match (factors, op_to_domain[dim]) {
                        // Inner strips reuse the dimension of the outermost
                        // strip and depend on the enclosing strip.
                        (Some(f), MappingExpr::Dim(k)) if f.len() > 1 => {
                            (k, last_loop[dim].map_or(0, |p| p + 1))
                        }
                        (_, MappingExpr::Unknown) => {
                            if deps.iter().any(|e| e.as_dim().is_none()) {
                                return Err(Diagnostic::error(
                                    codes::E0104,
                                    Location::Op(id),
                                    format!(
                                        "the extent of loop '{}' depends on a dimension not iterated by outer loops",
                                        attr.name
                                    ),
                                )
                                .with_hint("iterate the dimensions the extent depends on in outer loops"));
                            }
                            let num_dependencies = extent
                                .depends_on
                                .iter()
                                .filter_map(|&d| last_loop[d])
                                .map(|p| p + 1)
                                .max()
                                .unwrap_or(0);
                            let k = domain.len();
                            domain.push(DomainAccess {
                                range: extent.range.clone(),
                                dependency: Mapping::from_parts(k, deps),
                            });
                            (k, num_dependencies)
                        }
                        _ => {
                            return Err(Diagnostic::error(
                                codes::E0103,
                                Location::Op(id),
                                format!(
                                    "loop '{}' iterates d{}, already iterated by an outer loop",
                                    attr.name, dim
                                ),
                            ));
                        }
                    };
                    let iter_expr = match factors {
                        Some(factors) => MappingExpr::Stripe {
                            dim: class_dim,
                            factors,
                        },
                        None => MappingExpr::Dim(class_dim),
                    };
                    op_to_domain[dim] = MappingExpr::Dim(class_dim);
                    trace!("new fusion class '{}' at {}", attr.name, id);
                    self.classes.insert(
                        attr.name.clone(),
                        LoopFusionClass {
                            loop_nest: prefix.to_vec(),
                            num_dependencies,
                            domain,
                            iter_expr,
                            first_op: id,
                            last_op: id,
                        },
                    );
                }
            }
            last_loop[dim] = Some(pos);
        }
        Ok(())
    }
}

fn stripe_factors(expr: MappingExpr) -> Option<StripeList> {
    match expr {
        MappingExpr::Stripe { factors, .. } => Some(factors),
        _ => None,
    }
}

/// How a loop nest iterates one domain dimension, while it is checked.
#[derive(Clone, Copy)]
enum Coverage {
    None,
    Whole,
    Strips(StripeList),
}

/// Check that a loop nest iterates every domain dimension, either with one
/// dimension iterator or with strips going from the outermost to a step of 1,
/// and does not repeat a loop name.
pub fn verify_loop_nest_well_formed(id: OpId, op: &Operation) -> Result<(), Diagnostic> {
    let Some(nest) = &op.loop_nest else {
        return Ok(());
    };
    let malformed = |message: String| Diagnostic::error(codes::E0100, Location::Op(id), message);
    let num_dims = op.domain_size();
    let mut coverage = vec![Coverage::None; num_dims];
    let mut seen = HashSet::new();
    for attr in nest {
        match attr.iter {
            MappingExpr::Dim(d) if d < num_dims => {
                if let Coverage::Strips(_) = coverage[d] {
                    return Err(malformed(format!(
                        "loop '{}' iterates d{}, which is also strip-mined",
                        attr.name, d
                    )));
                }
                coverage[d] = Coverage::Whole;
            }
            MappingExpr::Stripe { dim, factors } if dim < num_dims => {
                let follows = match coverage[dim] {
                    Coverage::None => factors.len() == 1,
                    Coverage::Strips(outer) => {
                        factors.len() == outer.len() + 1 && factors.starts_with(&outer)
                    }
                    Coverage::Whole => false,
                };
                if !follows {
                    return Err(malformed(format!(
                        "loop '{}' iterates {}, which does not refine the strips of d{} outside it",
                        attr.name, attr.iter, dim
                    ))
                    .with_hint("strips of a dimension go from the outermost to the innermost"));
                }
                coverage[dim] = Coverage::Strips(factors);
            }
            other => {
                return Err(malformed(format!(
                    "loop '{}' has iterator {}, expected a dimension of the {}-dimensional domain or a strip of one",
                    attr.name, other, num_dims
                )));
            }
        }
        if !seen.insert(attr.name.as_str()) {
            return Err(malformed(format!(
                "loop '{}' appears twice in the loop nest",
                attr.name
            )));
        }
    }
    for (d, covered) in coverage.iter().enumerate() {
        match covered {
            Coverage::Whole => {}
            Coverage::None => {
                return Err(malformed(format!("d{} is not iterated by any loop", d))
                    .with_hint("a loop nest must iterate every dimension of the operation domain"));
            }
            Coverage::Strips(factors) if factors.last() != 1 => {
                return Err(malformed(format!(
                    "d{} is strip-mined down to steps of {}, not 1",
                    d,
                    factors.last()
                )));
            }
            Coverage::Strips(_) => {}
        }
    }
    Ok(())
}
