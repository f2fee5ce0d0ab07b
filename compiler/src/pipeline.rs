// pipeline.rs: Compilation state and pass orchestration
//
// Holds every pass artifact in one struct and runs the minimal set of passes
// for a given terminal PassId. Also owns build provenance and the
// `load_checked` / `lower_checked` / `compile` conveniences that fold phase
// diagnostics into `PgcError`.
//
// Preconditions: `CompilationState::new` received the raw graph source text.
// Postconditions: all artifacts for required passes are populated, or
//   `run_pipeline` returns the failing pass together with its `PgcError`.
// Failure modes: any pass emitting error-level diagnostics; a failed
//   obligation cert; an artifact that does not re-parse or does not match.
// Side effects: calls on_pass_complete callback after each pass for immediate display.

use std::time::Instant;

use crate::codegen::{CodegenOptions, GeneratedCode, TargetProfile};
use crate::diag::{codes, has_errors, DiagLevel, Diagnostic};
use crate::error::{PgcError, PgcResult};
use crate::graph::Graph;
use crate::lir::LirProgram;
use crate::lower::Cert;
use crate::pass::{descriptor, required_passes, PassId};
use crate::verify::{EquivalenceReport, VerifyOptions};

// ── Provenance ─────────────────────────────────────────────────────────────

/// Provenance metadata for reproducible builds.
///
/// `source_hash`: SHA-256 of the raw graph description text.
/// `table_fingerprint`: SHA-256 of `registry::canonical_json()`.
/// `compiler_version`: crate version from `Cargo.toml`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provenance {
    pub source_hash: [u8; 32],
    pub table_fingerprint: [u8; 32],
    pub compiler_version: &'static str,
}

impl Provenance {
    /// Hex string of the source hash (64 characters).
    pub fn source_hash_hex(&self) -> String {
        bytes_to_hex(&self.source_hash)
    }

    /// Hex string of the lowering-table fingerprint (64 characters).
    pub fn table_fingerprint_hex(&self) -> String {
        bytes_to_hex(&self.table_fingerprint)
    }

    /// Serialize provenance as a JSON string for `--emit build-info`.
    pub fn to_json(&self, profile: TargetProfile) -> String {
        format!(
            "{{\n  \"graph_sha256\": \"{}\",\n  \"lowering_table_fingerprint\": \"{}\",\n  \"profile\": \"{}\",\n  \"compiler_version\": \"{}\"\n}}\n",
            self.source_hash_hex(),
            self.table_fingerprint_hex(),
            profile.name(),
            self.compiler_version,
        )
    }
}

fn bytes_to_hex(bytes: &[u8; 32]) -> String {
    let mut s = String::with_capacity(64);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(s, "{:02x}", b);
    }
    s
}

fn sha256(bytes: &[u8]) -> [u8; 32] {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

/// Compute provenance from the graph source text and the lowering table.
pub fn compute_provenance(source: &str) -> Provenance {
    Provenance {
        source_hash: sha256(source.as_bytes()),
        table_fingerprint: sha256(crate::registry::canonical_json().as_bytes()),
        compiler_version: env!("CARGO_PKG_VERSION"),
    }
}

// ── Checked phase entry points ─────────────────────────────────────────────

/// Load a graph description, failing on any schema error.
pub fn load_checked(source: &str) -> PgcResult<Graph> {
    let result = crate::graph::load_graph(source);
    match result.graph {
        Some(graph) if !has_errors(&result.diagnostics) => Ok(graph),
        _ => Err(PgcError::Schema(errors_only(result.diagnostics))),
    }
}

/// Lower a graph, failing on any lowering error or failed obligation.
pub fn lower_checked(graph: &Graph) -> PgcResult<LirProgram> {
    let result = crate::lower::lower(graph);
    match result.lir {
        Some(lir) if !has_errors(&result.diagnostics) => Ok(lir),
        _ => Err(PgcError::Lowering(errors_only(result.diagnostics))),
    }
}

fn errors_only(diags: Vec<Diagnostic>) -> Vec<Diagnostic> {
    diags.into_iter().filter(Diagnostic::is_error).collect()
}

/// Everything one successful compilation produces.
#[derive(Debug, Clone)]
pub struct Compiled {
    pub graph: Graph,
    pub lir: LirProgram,
    pub generated: GeneratedCode,
    pub provenance: Provenance,
    /// Non-fatal diagnostics from all passes.
    pub warnings: Vec<Diagnostic>,
}

/// Load, lower and emit in one call.
pub fn compile(source: &str, options: &CodegenOptions) -> PgcResult<Compiled> {
    let mut state = CompilationState::new(source);
    run_pipeline(
        &mut state,
        PassId::Codegen,
        options,
        &VerifyOptions::default(),
        |_, _| {},
    )?;
    let CompilationState {
        graph,
        lir,
        generated,
        provenance,
        diagnostics,
        ..
    } = state;
    match (graph, lir, generated) {
        (Some(graph), Some(lir), Some(generated)) => Ok(Compiled {
            graph,
            lir,
            generated,
            provenance,
            warnings: diagnostics,
        }),
        _ => Err(PgcError::Lowering(diagnostics)),
    }
}

// ── Compilation state ──────────────────────────────────────────────────────

/// Holds all compilation artifacts and accumulated diagnostics.
pub struct CompilationState {
    pub source: String,
    pub provenance: Provenance,
    pub graph: Option<Graph>,
    pub lir: Option<LirProgram>,
    pub cert: Option<Cert>,
    pub generated: Option<GeneratedCode>,
    pub report: Option<EquivalenceReport>,
    pub diagnostics: Vec<Diagnostic>,
    pub has_error: bool,
}

impl CompilationState {
    pub fn new(source: impl Into<String>) -> Self {
        let source = source.into();
        let provenance = compute_provenance(&source);
        Self {
            source,
            provenance,
            graph: None,
            lir: None,
            cert: None,
            generated: None,
            report: None,
            diagnostics: Vec::new(),
            has_error: false,
        }
    }
}

// ── Error type ─────────────────────────────────────────────────────────────

/// Pipeline execution stopped in `failing_pass`.
/// Diagnostics are also available in `CompilationState.diagnostics`.
#[derive(Debug, thiserror::Error)]
#[error("{} failed: {error}", pass_name(.failing_pass))]
pub struct PipelineError {
    /// The pass that produced the error.
    pub failing_pass: PassId,
    #[source]
    pub error: PgcError,
}

fn pass_name(id: &PassId) -> &'static str {
    descriptor(*id).name
}

impl From<PipelineError> for PgcError {
    fn from(e: PipelineError) -> Self {
        e.error
    }
}

/// Per-pass post-processing: callback, accumulate, timing, error check.
fn finish_pass(
    state: &mut CompilationState,
    pass_id: PassId,
    diags: Vec<Diagnostic>,
    elapsed: std::time::Duration,
    on_pass_complete: &mut impl FnMut(PassId, &[Diagnostic]),
    to_error: impl FnOnce(Vec<Diagnostic>) -> PgcError,
) -> Result<(), PipelineError> {
    on_pass_complete(pass_id, &diags);
    let is_err = has_errors(&diags);
    state.diagnostics.extend(diags.iter().cloned());
    tracing::debug!(
        pass = descriptor(pass_id).name,
        elapsed_ms = elapsed.as_secs_f64() * 1000.0,
        "pass complete"
    );
    if is_err {
        state.has_error = true;
        return Err(PipelineError {
            failing_pass: pass_id,
            error: to_error(errors_only(diags)),
        });
    }
    Ok(())
}

fn missing(pass_id: PassId, what: &str) -> PipelineError {
    PipelineError {
        failing_pass: pass_id,
        error: PgcError::Lowering(vec![Diagnostic::new(
            DiagLevel::Error,
            format!("{} ran without its input: {}", descriptor(pass_id).name, what),
        )]),
    }
}

// ── Pipeline runner ────────────────────────────────────────────────────────

/// Run the minimal set of passes to produce `terminal`.
///
/// Per-pass sequence: execute → on_pass_complete(callback) → trace → error check.
///
/// Postconditions: artifacts for all passes in `required_passes(terminal)` are populated,
///   or the failing pass is returned and `state.has_error` is true.
/// Side effects: calls `on_pass_complete` after each pass for immediate diagnostic display.
pub fn run_pipeline(
    state: &mut CompilationState,
    terminal: PassId,
    codegen_options: &CodegenOptions,
    verify_options: &VerifyOptions,
    mut on_pass_complete: impl FnMut(PassId, &[Diagnostic]),
) -> Result<(), PipelineError> {
    for pass_id in required_passes(terminal) {
        let t = Instant::now();
        match pass_id {
            PassId::Load => {
                let result = {
                    let _span = tracing::debug_span!("load", bytes = state.source.len()).entered();
                    crate::graph::load_graph(&state.source)
                };
                if let Some(graph) = &result.graph {
                    tracing::debug!(nodes = graph.node_count(), frame_width = graph.frame_width, "loaded");
                }
                state.graph = result.graph;
                finish_pass(
                    state,
                    PassId::Load,
                    result.diagnostics,
                    t.elapsed(),
                    &mut on_pass_complete,
                    PgcError::Schema,
                )?;
            }
            PassId::Lower => {
                let graph = state.graph.as_ref().ok_or_else(|| missing(pass_id, "graph"))?;
                let result = crate::lower::lower(graph);
                state.lir = result.lir;
                state.cert = result.cert;
                finish_pass(
                    state,
                    PassId::Lower,
                    result.diagnostics,
                    t.elapsed(),
                    &mut on_pass_complete,
                    PgcError::Lowering,
                )?;
            }
            PassId::Codegen => {
                let lir = state.lir.as_ref().ok_or_else(|| missing(pass_id, "LIR"))?;
                state.generated = Some(crate::codegen::codegen(lir, &state.provenance, codegen_options));
                finish_pass(
                    state,
                    PassId::Codegen,
                    Vec::new(),
                    t.elapsed(),
                    &mut on_pass_complete,
                    PgcError::Lowering,
                )?;
            }
            PassId::Verify => {
                let graph = state.graph.as_ref().ok_or_else(|| missing(pass_id, "graph"))?;
                let generated = state
                    .generated
                    .as_ref()
                    .ok_or_else(|| missing(pass_id, "artifact"))?;
                let outcome = crate::verify::verify(graph, &generated.cpp_source, verify_options);
                let (diags, failure) = match outcome {
                    Ok(report) => {
                        let failure = report.ensure_passed().err();
                        let diags = match &failure {
                            Some(f) => vec![Diagnostic::error(
                                codes::E_EQUIVALENCE,
                                format!(
                                    "{} of {} pixels differ; first: {}",
                                    report.mismatches, report.pixels_compared, f
                                ),
                            )],
                            None => Vec::new(),
                        };
                        state.report = Some(report);
                        (diags, failure.map(PgcError::Equivalence))
                    }
                    Err(e) => {
                        let diag = match &e {
                            PgcError::Artifact(_) => {
                                Diagnostic::error(codes::E_ARTIFACT_PARSE, e.to_string())
                            }
                            _ => Diagnostic::new(DiagLevel::Error, e.to_string()),
                        };
                        (vec![diag], Some(e))
                    }
                };
                finish_pass(
                    state,
                    PassId::Verify,
                    diags,
                    t.elapsed(),
                    &mut on_pass_complete,
                    |d| failure.unwrap_or(PgcError::Lowering(d)),
                )?;
            }
        }
    }
    Ok(())
}

// ── Tests ──────────────────────────────────────────────────────────────────
