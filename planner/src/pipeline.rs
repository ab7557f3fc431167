// pipeline.rs — Planning state and pass orchestration
//
// Holds all pass artifacts and runs the minimal set of passes for a given
// terminal PassId. The three planning passes share one `DeviceDomains`,
// which borrows the lowered module and the configuration, so they run in a
// scoped block after lowering.
//
// Preconditions: Program and CompilationConfig must be set before calling run_pipeline.
// Postconditions: all artifacts for required passes are populated, or has_error is set.
// Failure modes: lowering errors; any planning error (fatal for the run).
// Side effects: calls on_pass_complete callback after each pass for immediate display.

use std::collections::BTreeMap;
use std::time::Instant;

use serde::Serialize;

use crate::ast::Program;
use crate::binding::{DeviceDomains, PlanError};
use crate::config::CompilationConfig;
use crate::diag::codes;
use crate::diag::{line_col, DiagLevel, Diagnostic};
use crate::intrinsics::IntrinsicTable;
use crate::ir::Module;
use crate::pass::{descriptor, required_passes, PassId};
use crate::placement::Placement;
use crate::planner::{self, PlanResult};

// ── Provenance ─────────────────────────────────────────────────────────────

/// Provenance metadata for reproducible plans and cache-key use.
///
/// `source_hash`: SHA-256 of the raw source text.
/// `config_fingerprint`: SHA-256 of `CompilationConfig::canonical_json()`.
/// `planner_version`: crate version from `Cargo.toml`.
#[derive(Debug, Clone)]
pub struct Provenance {
    pub source_hash: [u8; 32],
    pub config_fingerprint: [u8; 32],
    pub planner_version: &'static str,
}

impl Provenance {
    /// Hex string of the source hash (64 characters).
    pub fn source_hash_hex(&self) -> String {
        bytes_to_hex(&self.source_hash)
    }

    /// Hex string of the config fingerprint (64 characters).
    pub fn config_fingerprint_hex(&self) -> String {
        bytes_to_hex(&self.config_fingerprint)
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

/// Compute provenance from source text and configuration.
///
/// The fingerprint is taken over the compact canonical JSON so that it is
/// independent of how the config file was formatted.
pub fn compute_provenance(source: &str, config: &CompilationConfig) -> Provenance {
    Provenance {
        source_hash: sha256(source.as_bytes()),
        config_fingerprint: sha256(config.canonical_json().as_bytes()),
        planner_version: env!("CARGO_PKG_VERSION"),
    }
}

// ── Compilation state ──────────────────────────────────────────────────────

/// Holds all planning artifacts and accumulated diagnostics.
pub struct CompilationState {
    pub program: Program,
    pub config: CompilationConfig,
    pub intrinsics: IntrinsicTable,
    pub module: Option<Module>,
    /// Constraint system rendered right after analysis.
    pub constraints: Option<String>,
    pub plan: Option<PlanResult>,
    pub diagnostics: Vec<Diagnostic>,
    pub has_error: bool,
    pub provenance: Option<Provenance>,
}

impl CompilationState {
    /// The intrinsic table is the standard one extended by the config.
    pub fn new(program: Program, config: CompilationConfig) -> Self {
        let intrinsics = IntrinsicTable::with_extensions(&config.intrinsics);
        Self {
            program,
            config,
            intrinsics,
            module: None,
            constraints: None,
            plan: None,
            diagnostics: Vec::new(),
            has_error: false,
            provenance: None,
        }
    }
}

// ── Error type ─────────────────────────────────────────────────────────────

/// Pipeline execution failed due to error-level diagnostics in a pass.
/// The specific diagnostics are available in `CompilationState.diagnostics`.
#[derive(Debug)]
pub struct PipelineError {
    /// The pass that produced the error.
    pub failing_pass: PassId,
}

// ── Helper: check diagnostics for errors ───────────────────────────────────

fn has_error_diags(diags: &[Diagnostic]) -> bool {
    diags.iter().any(|d| d.level == DiagLevel::Error)
}

/// Per-pass post-processing: callback, accumulate, verbose, error check.
/// Takes split borrows so the planning block can keep the module borrowed.
fn finish_pass(
    all_diags: &mut Vec<Diagnostic>,
    has_error: &mut bool,
    pass_id: PassId,
    diags: Vec<Diagnostic>,
    elapsed: std::time::Duration,
    verbose: bool,
    on_pass_complete: &mut impl FnMut(PassId, &[Diagnostic]),
) -> Result<(), PipelineError> {
    on_pass_complete(pass_id, &diags);
    let is_err = has_error_diags(&diags);
    all_diags.extend(diags);
    if verbose {
        eprintln!(
            "dplan: {} complete, {:.1}ms",
            descriptor(pass_id).name,
            elapsed.as_secs_f64() * 1000.0
        );
    }
    if is_err {
        *has_error = true;
        return Err(PipelineError {
            failing_pass: pass_id,
        });
    }
    Ok(())
}

// ── Planning errors as diagnostics ─────────────────────────────────────────

/// Render a fatal planning error as a coded diagnostic.
pub fn plan_error_diagnostic(err: &PlanError, module: &Module) -> Diagnostic {
    let diag = Diagnostic::new(DiagLevel::Error, err.span(), err.to_string());
    match err {
        PlanError::Conflict {
            lhs,
            rhs,
            lhs_domain,
            rhs_domain,
            ..
        } => {
            let mut diag = diag
                .with_code(codes::E0200)
                .with_cause(
                    format!("{} ({}) has domain {}", module.label(*lhs), lhs, lhs_domain),
                    Some(module.span(*lhs)),
                )
                .with_hint("insert a device_copy where the value changes placement");
            match rhs {
                Some(rhs) => {
                    diag = diag
                        .with_related(
                            module.span(*rhs),
                            format!("{} ({}) has domain {}", module.label(*rhs), rhs, rhs_domain),
                        )
                        .with_cause(
                            format!("{} ({}) has domain {}", module.label(*rhs), rhs, rhs_domain),
                            Some(module.span(*rhs)),
                        );
                }
                None => {
                    diag = diag.with_cause(format!("required domain {}", rhs_domain), None);
                }
            }
            diag
        }
        PlanError::Intrinsic { .. } => diag.with_code(codes::E0201),
        PlanError::Config { .. } => diag
            .with_code(codes::E0202)
            .with_hint("check the targets declared in the configuration"),
        PlanError::Unconstrained { .. } => diag
            .with_code(codes::E0114)
            .with_hint("omit the annotation instead of writing '?:?:?'"),
    }
}

// ── Pipeline runner ────────────────────────────────────────────────────────

/// Run the minimal set of passes to produce `terminal`.
///
/// Per-pass sequence: execute → on_pass_complete(callback) → verbose → error check.
///
/// Preconditions: `state.program` and `state.config` are set.
/// Postconditions: artifacts for all passes in `required_passes(terminal)` are populated,
///   or `state.has_error` is true.
/// Failure modes: lowering errors; the first planning error.
/// Side effects: calls `on_pass_complete` after each pass for immediate diagnostic display.
pub fn run_pipeline(
    state: &mut CompilationState,
    terminal: PassId,
    verbose: bool,
    mut on_pass_complete: impl FnMut(PassId, &[Diagnostic]),
) -> Result<(), PipelineError> {
    let passes = required_passes(terminal);

    if passes.contains(&PassId::Lower) {
        let t = Instant::now();
        let result = crate::lower::lower(&state.program);
        let elapsed = t.elapsed();
        state.module = Some(result.module);
        finish_pass(
            &mut state.diagnostics,
            &mut state.has_error,
            PassId::Lower,
            result.diagnostics,
            elapsed,
            verbose,
            &mut on_pass_complete,
        )?;
    }

    if passes.iter().any(|p| *p != PassId::Lower) {
        run_planning(state, &passes, verbose, &mut on_pass_complete)?;
    }
    Ok(())
}

// ── DeviceDomains scoped block ─────────────────────────────────────────────

fn run_planning(
    state: &mut CompilationState,
    passes: &[PassId],
    verbose: bool,
    on_pass_complete: &mut impl FnMut(PassId, &[Diagnostic]),
) -> Result<(), PipelineError> {
    let Some(module) = state.module.as_ref() else {
        state.has_error = true;
        return Err(PipelineError {
            failing_pass: PassId::Lower,
        });
    };
    let mut domains = DeviceDomains::new(module, &state.config, &state.intrinsics);

    for &pass_id in passes {
        let t = Instant::now();
        let outcome = match pass_id {
            PassId::Lower => continue,
            PassId::Analyze => match planner::analyze(&mut domains) {
                Ok(()) => {
                    state.constraints = Some(domains.render_system());
                    Ok(())
                }
                Err(e) => Err(e),
            },
            PassId::Default => planner::default(&mut domains),
            PassId::Extract => {
                state.plan = Some(planner::extract(&mut domains));
                Ok(())
            }
        };
        let elapsed = t.elapsed();
        let diags = match outcome {
            Ok(()) => Vec::new(),
            Err(e) => vec![plan_error_diagnostic(&e, module)],
        };
        finish_pass(
            &mut state.diagnostics,
            &mut state.has_error,
            pass_id,
            diags,
            elapsed,
            verbose,
            on_pass_complete,
        )?;
    }
    // domains drops here, releasing the module borrow
    Ok(())
}

// ── JSON report ────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ReportProvenance {
    source_hash: String,
    config_fingerprint: String,
    planner_version: &'static str,
}

#[derive(Debug, Serialize)]
struct ReportPlacement {
    expr: String,
    label: String,
    line: usize,
    col: usize,
    placement: Placement,
    domain: String,
}

#[derive(Debug, Serialize)]
struct Report {
    provenance: Option<ReportProvenance>,
    host: Placement,
    default_primitive: Placement,
    placements: Vec<ReportPlacement>,
    callees: BTreeMap<String, String>,
}

/// The `--emit json` report: provenance, one entry per placed expression,
/// and the callee domain of every call site.
pub fn report_json(state: &CompilationState, source: &str) -> Option<String> {
    let module = state.module.as_ref()?;
    let plan = state.plan.as_ref()?;
    let placements = plan
        .placements
        .iter()
        .map(|(id, placement)| {
            let (line, col) = line_col(source, module.span(*id).start);
            ReportPlacement {
                expr: id.to_string(),
                label: module.label(*id),
                line,
                col,
                placement: placement.clone(),
                domain: plan.expr_domains.get(id).cloned().unwrap_or_default(),
            }
        })
        .collect();
    let report = Report {
        provenance: state.provenance.as_ref().map(|p| ReportProvenance {
            source_hash: p.source_hash_hex(),
            config_fingerprint: p.config_fingerprint_hex(),
            planner_version: p.planner_version,
        }),
        host: state.config.host_placement().clone(),
        default_primitive: state.config.default_primitive_placement().clone(),
        placements,
        callees: plan
            .callee_domains
            .iter()
            .map(|(call, d)| (call.to_string(), d.clone()))
            .collect(),
    };
    serde_json::to_string_pretty(&report).ok()
}

/// Human-readable placements, one line per expression.
pub fn render_placements(module: &Module, plan: &PlanResult) -> String {
    use std::fmt::Write;

    let mut out = String::new();
    for (id, placement) in &plan.placements {
        let _ = writeln!(
            out,
            "{:<5} {:<28} {}",
            id.to_string(),
            module.label(*id),
            placement
        );
    }
    out
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn state_for(source: &str) -> CompilationState {
        let parsed = crate::parser::parse(source);
        assert!(parsed.errors.is_empty(), "parse errors: {:?}", parsed.errors);
        CompilationState::new(parsed.program.expect("program"), CompilationConfig::default())
    }

    #[test]
    fn analyze_terminal_stops_before_defaulting() {
        let mut state = state_for("def @main(%x: Tensor) { add(%x, %x) }");
        let mut seen = Vec::new();
        run_pipeline(&mut state, PassId::Analyze, false, |p, _| seen.push(p)).expect("ok");
        assert_eq!(seen, vec![PassId::Lower, PassId::Analyze]);
        let constraints = state.constraints.expect("constraints");
        assert!(constraints.contains("<?:?:?>"), "{constraints}");
        assert!(state.plan.is_none());
    }

    #[test]
    fn full_pipeline_places_everything() {
        let mut state = state_for("def @main(%x: Tensor) { add(%x, %x) }");
        run_pipeline(&mut state, PassId::Extract, false, |_, _| {}).expect("ok");
        let plan = state.plan.as_ref().expect("plan");
        assert!(plan
            .placements
            .values()
            .all(|p| p == &Placement::new("llvm", 0, "")));
        let module = state.module.as_ref().expect("module");
        let text = render_placements(module, plan);
        assert!(text.contains("call to add"), "{text}");
    }

    #[test]
    fn lowering_errors_stop_the_run() {
        let mut state = state_for("def @main(%x: Tensor) { %y }");
        let err = run_pipeline(&mut state, PassId::Extract, false, |_, _| {}).expect_err("error");
        assert_eq!(err.failing_pass, PassId::Lower);
        assert!(state.has_error);
        assert!(state.plan.is_none());
    }

    #[test]
    fn conflict_becomes_e0200_with_related_span() {
        let mut state = state_for(
            r#"def @main(%x: Tensor @ "cpu:0:", %y: Tensor @ "cpu:0:") {
                on_device(add(%x, %y), scope = "cpu:0:global", fixed = true)
            }"#,
        );
        let err = run_pipeline(&mut state, PassId::Extract, false, |_, _| {}).expect_err("conflict");
        assert_eq!(err.failing_pass, PassId::Analyze);
        let diag = &state.diagnostics[0];
        assert_eq!(diag.code, Some(codes::E0200));
        assert!(diag.hint.is_some());
        assert!(!diag.cause_chain.is_empty());
    }

    #[test]
    fn bad_pin_becomes_e0202() {
        let mut state = state_for(r#"def @main(%x: Tensor @ "tpu") { %x }"#);
        run_pipeline(&mut state, PassId::Extract, false, |_, _| {}).expect_err("unknown target");
        assert_eq!(state.diagnostics[0].code, Some(codes::E0202));
    }

    #[test]
    fn provenance_is_stable() {
        let config = CompilationConfig::default();
        let a = compute_provenance("def @main() { 1 }", &config);
        let b = compute_provenance("def @main() { 1 }", &config);
        let c = compute_provenance("def @main() { 2 }", &config);
        assert_eq!(a.source_hash_hex(), b.source_hash_hex());
        assert_ne!(a.source_hash_hex(), c.source_hash_hex());
        assert_eq!(a.config_fingerprint_hex().len(), 64);
    }

    #[test]
    fn json_report_lists_placements() {
        let source = "def @main(%x: Tensor) { add(%x, %x) }";
        let mut state = state_for(source);
        state.provenance = Some(compute_provenance(source, &state.config));
        run_pipeline(&mut state, PassId::Extract, false, |_, _| {}).expect("ok");
        let json = report_json(&state, source).expect("report");
        let value: serde_json::Value = serde_json::from_str(&json).expect("valid json");
        assert_eq!(value["host"], "llvm:0:");
        assert_eq!(value["callees"]["c0"], "fn(<llvm:0:>, <llvm:0:>):<llvm:0:>");
        let placements = value["placements"].as_array().expect("array");
        assert!(placements
            .iter()
            .any(|p| p["label"] == "call to add" && p["placement"] == "llvm:0:"));
        assert_eq!(value["provenance"]["source_hash"].as_str().map(str::len), Some(64));
    }
}
