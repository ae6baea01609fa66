// pass.rs — Pass descriptor module: metadata, dependency resolution, artifact IDs
//
// Declares the three default-attribute passes, their dependency edges and the
// attributes they produce. Used by the pipeline runner to compute the pass
// subset needed for each --stop-after target. Structural verification runs
// before the runner and has no PassId.

use std::collections::HashSet;

// ── Pass and Artifact identifiers ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassId {
    DefaultSequence,
    DefaultLoopNest,
    DefaultStorage,
}

/// Attributes written onto compute operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactId {
    Sequence, // Operation::sequence
    LoopNest, // Operation::loop_nest
    Storage,  // Operation::storage
}

// ── Pass descriptor ────────────────────────────────────────────────────────

/// Static metadata about a pass.
pub struct PassDescriptor {
    /// Name used in diagnostics and verbose output.
    pub name: &'static str,
    /// Passes whose outputs this pass consumes.
    pub inputs: &'static [PassId],
    pub outputs: &'static [ArtifactId],
    /// What invalidates this pass's output.
    pub invalidation_key: &'static str,
    /// Postconditions (documentation only).
    pub invariants: &'static str,
}

pub fn descriptor(id: PassId) -> PassDescriptor {
    match id {
        PassId::DefaultSequence => PassDescriptor {
            name: "default_sequence",
            inputs: &[],
            outputs: &[ArtifactId::Sequence],
            invalidation_key: "operands + sequence attributes",
            invariants: "compute ops carry sequence 0..n, producers before consumers unless pinned",
        },
        PassId::DefaultLoopNest => PassDescriptor {
            name: "default_loop_nest",
            inputs: &[PassId::DefaultSequence],
            outputs: &[ArtifactId::LoopNest],
            invalidation_key: "domains + loop nest attributes + sequence",
            invariants: "every compute op has a loop nest, loop names are fresh",
        },
        PassId::DefaultStorage => PassDescriptor {
            name: "default_storage",
            inputs: &[PassId::DefaultLoopNest],
            outputs: &[ArtifactId::Storage],
            invalidation_key: "operands + loop nests + sequence + storage attributes",
            invariants: "every result has a storage, buffers cover communicated data, no hazards",
        },
    }
}

// ── Dependency resolution ──────────────────────────────────────────────────

/// All pass IDs in declaration order.
pub const ALL_PASSES: [PassId; 3] = [
    PassId::DefaultSequence,
    PassId::DefaultLoopNest,
    PassId::DefaultStorage,
];

/// Compute the minimal ordered set of passes needed to produce `terminal`.
/// Returns passes in topological (execution) order.
pub fn required_passes(terminal: PassId) -> Vec<PassId> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    visit(terminal, &mut visited, &mut order);
    order
}

fn visit(id: PassId, visited: &mut HashSet<PassId>, order: &mut Vec<PassId>) {
    if !visited.insert(id) {
        return;
    }
    for &dep in descriptor(id).inputs {
        visit(dep, visited, order);
    }
    order.push(id);
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_passes_storage_includes_all() {
        assert_eq!(required_passes(PassId::DefaultStorage), ALL_PASSES.to_vec());
    }

    #[test]
    fn required_passes_loop_nest_skips_storage() {
        let passes = required_passes(PassId::DefaultLoopNest);
        assert_eq!(passes, vec![PassId::DefaultSequence, PassId::DefaultLoopNest]);
    }

    #[test]
    fn required_passes_sequence_is_minimal() {
        assert_eq!(
            required_passes(PassId::DefaultSequence),
            vec![PassId::DefaultSequence]
        );
    }

    #[test]
    fn all_descriptors_have_outputs() {
        for pass in &ALL_PASSES {
            let desc = descriptor(*pass);
            assert!(
                !desc.outputs.is_empty(),
                "pass {:?} has no outputs declared",
                pass
            );
        }
    }

    #[test]
    fn dependency_edges_are_consistent() {
        for pass in &ALL_PASSES {
            let order = required_passes(*pass);
            for dep in descriptor(*pass).inputs {
                let dep_pos = order.iter().position(|p| p == dep);
                let self_pos = order.iter().position(|p| p == pass);
                assert!(
                    dep_pos.unwrap() < self_pos.unwrap(),
                    "{:?} depends on {:?} but it comes later in topological order",
                    pass,
                    dep
                );
            }
        }
    }
}
