// pass.rs: The four compiler passes and what each one needs
//
// `pgc compile --emit dot` stops after loading, `--emit lir` after lowering,
// and `pgc verify` runs everything. The pipeline runner asks
// `required_passes` for the prefix it has to execute.

use std::collections::HashSet;

// ── Pass and Artifact identifiers ──────────────────────────────────────────

/// Identifies each compiler pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassId {
    Load,
    Lower,
    Codegen,
    Verify,
}

/// What a pass leaves in `CompilationState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactId {
    Graph,     // Graph
    Lir,       // LirProgram
    Cert,      // Cert
    Generated, // GeneratedCode
    Report,    // EquivalenceReport
}

// ── Pass descriptor ────────────────────────────────────────────────────────

/// Name, edges and products of one pass.
pub struct PassDescriptor {
    /// Shown in `--verbose` output and failure lines.
    pub name: &'static str,
    /// Passes that must have run first.
    pub inputs: &'static [PassId],
    pub outputs: &'static [ArtifactId],
    /// What holds once the pass succeeds. Informational.
    pub invariants: &'static str,
}

pub fn descriptor(id: PassId) -> PassDescriptor {
    match id {
        PassId::Load => PassDescriptor {
            name: "load",
            inputs: &[],
            outputs: &[ArtifactId::Graph],
            invariants: "frame_width positive, ids unique, params scalar",
        },
        PassId::Lower => PassDescriptor {
            name: "lower",
            inputs: &[PassId::Load],
            outputs: &[ArtifactId::Lir, ArtifactId::Cert],
            invariants: "every kernel in bounds, one writer per state slot",
        },
        PassId::Codegen => PassDescriptor {
            name: "codegen",
            inputs: &[PassId::Lower],
            outputs: &[ArtifactId::Generated],
            invariants: "deterministic C++ text",
        },
        PassId::Verify => PassDescriptor {
            name: "verify",
            inputs: &[PassId::Codegen],
            outputs: &[ArtifactId::Report],
            invariants: "artifact re-parses; zero pixel mismatches",
        },
    }
}

// ── Dependency resolution ──────────────────────────────────────────────────

/// All pass IDs in declaration order.
pub const ALL_PASSES: [PassId; 4] = [PassId::Load, PassId::Lower, PassId::Codegen, PassId::Verify];

/// Passes to run, in execution order, so that `terminal` completes.
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
