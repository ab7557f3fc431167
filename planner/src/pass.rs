// pass.rs — Pass descriptor module: metadata, dependency resolution, artifact IDs
//
// Declares the planner's 4 semantic passes (parse is outside the runner),
// their dependency edges, and the artifacts they produce. Used by the pipeline
// runner to compute minimal pass subsets for each --emit target.

use std::collections::HashSet;

// ── Pass and Artifact identifiers ──────────────────────────────────────────

/// Identifies each planner pass (parse excluded; it runs before the pass runner).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassId {
    Lower,
    Analyze,
    Default,
    Extract,
}

/// Machine-readable artifact identifiers. Each maps to a concrete type
/// in the compilation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactId {
    Module,      // ir::Module
    Constraints, // rendered DeviceDomains after analysis
    Defaulted,   // DeviceDomains with every function settled
    Plan,        // PlanResult
}

// ── Pass descriptor ────────────────────────────────────────────────────────

/// Static metadata about a planner pass.
pub struct PassDescriptor {
    /// Human-readable name for diagnostics/verbose output.
    pub name: &'static str,
    /// Pass dependencies (other passes whose outputs this pass consumes).
    pub inputs: &'static [PassId],
    /// Artifacts this pass produces.
    pub outputs: &'static [ArtifactId],
    /// What invalidates this pass's output.
    pub invalidation_key: &'static str,
    /// Pre/post conditions (documentation only).
    pub invariants: &'static str,
}

/// Return the static descriptor for a given pass.
pub fn descriptor(id: PassId) -> PassDescriptor {
    match id {
        PassId::Lower => PassDescriptor {
            name: "lower",
            inputs: &[],
            outputs: &[ArtifactId::Module],
            invalidation_key: "source",
            invariants: "all names resolved, every expression typed, call_ids assigned",
        },
        PassId::Analyze => PassDescriptor {
            name: "analyze",
            inputs: &[PassId::Lower],
            outputs: &[ArtifactId::Constraints],
            invalidation_key: "module + config + intrinsics",
            invariants: "every structural constraint unified without conflict",
        },
        PassId::Default => PassDescriptor {
            name: "default",
            inputs: &[PassId::Analyze],
            outputs: &[ArtifactId::Defaulted],
            invalidation_key: "constraints + default primitive placement",
            invariants: "every function, callee and let-bound domain fully constrained",
        },
        PassId::Extract => PassDescriptor {
            name: "extract",
            inputs: &[PassId::Default],
            outputs: &[ArtifactId::Plan],
            invalidation_key: "defaulted constraints",
            invariants: "one fully constrained placement per value expression",
        },
    }
}

// ── Dependency resolution ──────────────────────────────────────────────────

/// All 4 pass IDs in declaration order (used for iteration).
pub const ALL_PASSES: [PassId; 4] = [
    PassId::Lower,
    PassId::Analyze,
    PassId::Default,
    PassId::Extract,
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
    fn required_passes_lower_is_minimal() {
        assert_eq!(required_passes(PassId::Lower), vec![PassId::Lower]);
    }

    #[test]
    fn required_passes_analyze_skips_default_and_extract() {
        let passes = required_passes(PassId::Analyze);
        assert_eq!(passes, vec![PassId::Lower, PassId::Analyze]);
        assert!(!passes.contains(&PassId::Default));
    }

    #[test]
    fn required_passes_extract_includes_all() {
        let passes = required_passes(PassId::Extract);
        assert_eq!(passes.len(), 4);
        assert_eq!(passes, ALL_PASSES.to_vec());
    }

    #[test]
    fn no_parse_in_pass_id() {
        // Parse is handled outside the runner; PassId has no Parse variant.
        for pass in &ALL_PASSES {
            assert_ne!(descriptor(*pass).name, "parse");
        }
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
            let desc = descriptor(*pass);
            for dep in desc.inputs {
                let dep_passes = required_passes(*pass);
                let dep_pos = dep_passes.iter().position(|p| p == dep);
                let self_pos = dep_passes.iter().position(|p| p == pass);
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
