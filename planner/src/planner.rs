// planner.rs — Placement planning: analysis, defaulting, extraction
//
// Walks the IR three times over one `DeviceDomains`:
//   1. analyze: collect equality constraints implied by program structure
//   2. default: settle functions, callees and let-bound variables that are
//               still open to the default primitive placement
//   3. extract: read off one placement per expression
//
// Preconditions: `module` lowered without errors; `config` validated.
// Postconditions: `PlanResult::placements` holds a fully constrained
//   placement for every expression that has a placement.
// Failure modes: the first conflicting constraint aborts the run with
//   `PlanError`; nothing is recovered.
// Side effects: `tracing` events at debug level per phase.

use std::collections::BTreeMap;

use tracing::debug;

use crate::binding::{DeviceDomains, PlanError};
use crate::config::CompilationConfig;
use crate::id::{CallId, ExprId};
use crate::intrinsics::IntrinsicTable;
use crate::ir::{ExprKind, Module, Pattern};
use crate::placement::Placement;

// ── Output ──────────────────────────────────────────────────────────────────

/// Final placements and the resolved constraint system.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanResult {
    /// One fully constrained placement per value expression.
    pub placements: BTreeMap<ExprId, Placement>,
    /// Rendered domain of every value expression.
    pub expr_domains: BTreeMap<ExprId, String>,
    /// Rendered callee domain of every call site.
    pub callee_domains: BTreeMap<CallId, String>,
    /// The whole constraint system after defaulting.
    pub system: String,
}

impl PlanResult {
    pub fn placement(&self, expr: ExprId) -> Option<&Placement> {
        self.placements.get(&expr)
    }
}

/// Run all three phases.
pub fn plan(
    module: &Module,
    config: &CompilationConfig,
    intrinsics: &IntrinsicTable,
) -> Result<PlanResult, PlanError> {
    let mut domains = DeviceDomains::new(module, config, intrinsics);
    analyze(&mut domains)?;
    default(&mut domains)?;
    Ok(extract(&mut domains))
}

// ── Analysis ────────────────────────────────────────────────────────────────

/// Collect constraints from every global.
pub fn analyze(domains: &mut DeviceDomains<'_>) -> Result<(), PlanError> {
    let module = domains.module();
    for global in &module.globals {
        debug!(global = %global.name, "analyzing");
        domains.unify_exprs_exact(global.var, global.func)?;
        analyze_expr(domains, global.func)?;
    }
    let (exprs, calls) = domains.bound_counts();
    debug!(exprs, calls, "analysis complete");
    Ok(())
}

fn analyze_expr(domains: &mut DeviceDomains<'_>, expr: ExprId) -> Result<(), PlanError> {
    let module = domains.module();
    match &module.expr(expr).kind {
        ExprKind::Call { callee, args, .. } => {
            // fn(arg domains...):call domain must match the callee.
            let callee_domain = domains.domain_for_callee(expr)?;
            let mut implied: Vec<_> = args.iter().map(|a| domains.domain_for(*a)).collect();
            implied.push(domains.domain_for(expr));
            let implied = domains.store_mut().make_higher_order(implied);
            if domains.store_mut().unify_or_null(callee_domain, implied).is_none() {
                return Err(domains.conflict(*callee, Some(expr), callee_domain, implied));
            }
        }
        ExprKind::Let { var, value, body } => {
            domains.unify_exprs_exact(*var, *value)?;
            domains.unify_exprs_exact(expr, *body)?;
        }
        ExprKind::Function {
            params,
            body,
            result_placement,
        } => {
            let func_domain = domains.domain_for(expr);
            let parts = domains.function_parts(func_domain).unwrap_or_default();
            if let Some((result, param_domains)) = parts.split_last() {
                domains.unify_expr_exact(*body, *result)?;
                for (param, d) in params.iter().zip(param_domains) {
                    domains.unify_expr_exact(*param, *d)?;
                }
            }
            for param in params {
                if let ExprKind::Var {
                    placement: Some(pin),
                    ..
                } = &module.expr(*param).kind
                {
                    let pinned = domains.for_placement(module.ty(*param), pin, module.span(*param))?;
                    domains.unify_expr_exact(*param, pinned)?;
                }
            }
            if let Some(pin) = result_placement {
                let pinned = domains.for_placement(module.ty(*body), pin, module.span(expr))?;
                domains.unify_expr_exact(*body, pinned)?;
            }
        }
        ExprKind::Tuple(fields) => {
            for field in fields {
                domains.unify_exprs_collapsed(expr, *field)?;
            }
        }
        ExprKind::Proj { tuple, .. } => domains.unify_exprs_collapsed(*tuple, expr)?,
        ExprKind::If {
            cond,
            then_branch,
            else_branch,
        } => {
            domains.unify_exprs_collapsed(*cond, expr)?;
            domains.unify_exprs_exact(expr, *then_branch)?;
            domains.unify_exprs_exact(expr, *else_branch)?;
        }
        ExprKind::RefCreate(value) => domains.unify_exprs_collapsed(expr, *value)?,
        ExprKind::RefRead(reference) => domains.unify_exprs_collapsed(*reference, expr)?,
        ExprKind::RefWrite { reference, value } => {
            domains.unify_exprs_collapsed(*reference, *value)?;
            domains.unify_exprs_exact(expr, *reference)?;
        }
        ExprKind::Match { data, clauses } => {
            for clause in clauses {
                if let Pattern::Constructor { binders, .. } = &clause.pattern {
                    for binder in binders {
                        domains.unify_exprs_collapsed(*data, *binder)?;
                    }
                }
                domains.unify_exprs_exact(expr, clause.body)?;
            }
        }
        ExprKind::Var { .. }
        | ExprKind::Global { .. }
        | ExprKind::Constant(_)
        | ExprKind::Op(_)
        | ExprKind::Constructor(_) => {}
    }

    for child in module.expr(expr).kind.children() {
        if !module.expr(child).kind.is_callee_only() {
            analyze_expr(domains, child)?;
        }
    }
    Ok(())
}

// ── Defaulting ──────────────────────────────────────────────────────────────

/// Settle open functions, callees and let-bound variables, result first.
pub fn default(domains: &mut DeviceDomains<'_>) -> Result<(), PlanError> {
    let module = domains.module();
    let fallback = domains.config().default_primitive_placement().clone();
    for global in &module.globals {
        default_expr(domains, global.func, &fallback)?;
    }
    debug!(placement = %fallback, "defaulting complete");
    Ok(())
}

fn default_expr(
    domains: &mut DeviceDomains<'_>,
    expr: ExprId,
    fallback: &Placement,
) -> Result<(), PlanError> {
    let module = domains.module();
    let open = match &module.expr(expr).kind {
        ExprKind::Function { .. } => Some(domains.domain_for(expr)),
        ExprKind::Call { .. } => Some(domains.domain_for_callee(expr)?),
        ExprKind::Let { var, .. } => Some(domains.domain_for(*var)),
        _ => None,
    };
    if let Some(d) = open {
        let store = domains.store_mut();
        if !store.is_fully_constrained(d) {
            store.set_result_default_then_params(d, fallback);
        }
    }
    for child in module.expr(expr).kind.children() {
        default_expr(domains, child, fallback)?;
    }
    Ok(())
}

// ── Extraction ──────────────────────────────────────────────────────────────

/// One placement per value expression. Anything still open (an expression
/// never linked to a function) falls back to the default primitive placement.
pub fn extract(domains: &mut DeviceDomains<'_>) -> PlanResult {
    let module = domains.module();
    let fallback = domains.config().default_primitive_placement().clone();
    let mut placements = BTreeMap::new();
    let mut expr_domains = BTreeMap::new();
    for id in module.ids() {
        if module.expr(id).kind.is_callee_only() {
            continue;
        }
        let d = domains.domain_for(id);
        let store = domains.store_mut();
        if !store.is_fully_constrained(d) {
            store.set_default(d, &fallback);
        }
        placements.insert(id, store.result_placement(d));
        expr_domains.insert(id, store.render(d));
    }

    let mut callee_domains = BTreeMap::new();
    for id in module.ids() {
        if let ExprKind::Call { call, .. } = &module.expr(id).kind {
            if let Some(d) = domains.callee_domain(*call) {
                callee_domains.insert(*call, domains.store().render(d));
            }
        }
    }
    debug!(placements = placements.len(), "extraction complete");
    PlanResult {
        placements,
        expr_domains,
        callee_domains,
        system: domains.render_system(),
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TargetConfig;

    fn lowered(source: &str) -> Module {
        let parsed = crate::parser::parse(source);
        assert!(parsed.errors.is_empty(), "parse errors: {:?}", parsed.errors);
        let result = crate::lower::lower(&parsed.program.expect("program"));
        assert!(!result.has_errors(), "{:#?}", result.diagnostics);
        result.module
    }

    fn config() -> CompilationConfig {
        CompilationConfig::new(
            vec![
                TargetConfig {
                    name: "llvm".into(),
                    kind: Some("cpu".into()),
                    devices: 1,
                },
                TargetConfig {
                    name: "cuda".into(),
                    kind: Some("gpu".into()),
                    devices: 2,
                },
            ],
            Placement::new("llvm", 0, ""),
            Some(Placement::new("cuda", 0, "global")),
        )
        .expect("valid config")
    }

    fn plan_src(source: &str) -> (Module, Result<PlanResult, PlanError>) {
        let m = lowered(source);
        let config = config();
        let result = plan(&m, &config, &IntrinsicTable::standard());
        (m, result)
    }

    /// Placement of the first node whose label matches.
    fn placement_of(m: &Module, plan: &PlanResult, label: &str) -> String {
        let id = m
            .ids()
            .find(|id| m.label(*id) == label)
            .unwrap_or_else(|| panic!("no node labelled {label}"));
        plan.placement(id).expect("placed").to_string()
    }

    #[test]
    fn unconstrained_program_uses_default_primitive() {
        let (m, result) = plan_src("def @main(%x: Tensor) { add(%x, %x) }");
        let plan = result.expect("plan");
        assert_eq!(placement_of(&m, &plan, "%x"), "cuda:0:global");
        assert_eq!(placement_of(&m, &plan, "call to add"), "cuda:0:global");
    }

    #[test]
    fn partial_pin_is_completed_field_by_field() {
        let (m, result) = plan_src(r#"def @main(%x: Tensor @ "cpu") { add(%x, %x) }"#);
        let plan = result.expect("plan");
        // Target from the pin; device and scope from the default primitive.
        assert_eq!(placement_of(&m, &plan, "%x"), "llvm:0:global");
        assert_eq!(placement_of(&m, &plan, "call to add"), "llvm:0:global");
    }

    #[test]
    fn device_copy_splits_placements() {
        let (m, result) = plan_src(
            r#"def @main(%x: Tensor @ "cuda:1:global") {
                let %y = device_copy(%x, src = "cuda:1:global", dst = "cpu:0:");
                add(%y, %y)
            }"#,
        );
        let plan = result.expect("plan");
        assert_eq!(placement_of(&m, &plan, "%x"), "cuda:1:global");
        assert_eq!(placement_of(&m, &plan, "%y"), "llvm:0:");
        assert_eq!(placement_of(&m, &plan, "call to add"), "llvm:0:");
    }

    #[test]
    fn conflicting_pins_are_fatal() {
        let (_, result) = plan_src(
            r#"def @main(%x: Tensor @ "cpu:0:", %y: Tensor @ "cuda:0:global") { add(%x, %y) }"#,
        );
        let err = result.expect_err("conflict");
        assert!(matches!(err, PlanError::Conflict { .. }), "{err}");
    }

    #[test]
    fn on_device_fixed_pins_result() {
        let (m, result) = plan_src(
            r#"def @main(%x: Tensor) -> Tensor @ "cpu:0:" {
                on_device(add(%x, %x), scope = "cpu:0:", fixed = true)
            }"#,
        );
        let plan = result.expect("plan");
        assert_eq!(placement_of(&m, &plan, "call to add"), "llvm:0:");
        assert_eq!(placement_of(&m, &plan, "%x"), "llvm:0:");
    }

    #[test]
    fn function_through_tuple_is_collapsed() {
        let (m, result) = plan_src(
            r#"def @main(%x: Tensor @ "cpu:0:", %f: fn(Tensor) -> Tensor) {
                let %t = (%x, %f);
                %t.1(%x)
            }"#,
        );
        let plan = result.expect("plan");
        let f = m.ids().find(|id| m.label(*id) == "%f").expect("f");
        assert_eq!(plan.expr_domains[&f], "fn(<llvm:0:>):<llvm:0:>");
    }

    #[test]
    fn shape_of_result_is_host() {
        let (m, result) = plan_src("def @main(%x: Tensor) { shape_of(%x) }");
        let plan = result.expect("plan");
        assert_eq!(placement_of(&m, &plan, "call to shape_of"), "llvm:0:");
        assert_eq!(placement_of(&m, &plan, "%x"), "llvm:0:");
    }

    #[test]
    fn globals_are_unified_with_their_functions() {
        let (m, result) = plan_src(
            r#"def @id(%a: Tensor) -> Tensor { %a }
               def @main(%x: Tensor @ "cpu:0:") { @id(%x) }"#,
        );
        let plan = result.expect("plan");
        let id = m.global("id").expect("id").var;
        assert_eq!(plan.expr_domains[&id], "fn(<llvm:0:>):<llvm:0:>");
        assert_eq!(placement_of(&m, &plan, "%a"), "llvm:0:");
    }

    #[test]
    fn let_var_defaults_before_callers_see_it() {
        let (m, result) = plan_src(
            "def @main(%x: Tensor) {\n\
               let %g = fn(%a: Tensor) { %a };\n\
               %g\n\
             }",
        );
        let plan = result.expect("plan");
        let g = m.ids().find(|id| m.label(*id) == "%g").expect("g");
        assert_eq!(plan.expr_domains[&g], "fn(<cuda:0:global>):<cuda:0:global>");
    }

    #[test]
    fn isolated_constant_still_placed() {
        let (m, result) = plan_src("def @main() { 1.5 }");
        let plan = result.expect("plan");
        assert_eq!(placement_of(&m, &plan, "constant 1.5"), "cuda:0:global");
    }

    #[test]
    fn match_binders_follow_data() {
        let (m, result) = plan_src(
            r#"type L { Cons(Tensor, L), Nil }
               def @head(%l: L @ "cpu:0:", %d: Tensor) { match (%l) { Cons(%h, %t) => %h, _ => %d } }"#,
        );
        let plan = result.expect("plan");
        assert_eq!(placement_of(&m, &plan, "%h"), "llvm:0:");
        assert_eq!(placement_of(&m, &plan, "%d"), "llvm:0:");
        assert_eq!(placement_of(&m, &plan, "match"), "llvm:0:");
    }

    #[test]
    fn constructed_value_lives_with_its_fields() {
        let (m, result) = plan_src(
            r#"type B { W(Tensor) }
               def @main(%x: Tensor @ "cuda:1:global") { match (W(%x)) { W(%h) => %h } }"#,
        );
        let plan = result.expect("plan");
        assert_eq!(placement_of(&m, &plan, "call to W"), "cuda:1:global");
        assert_eq!(placement_of(&m, &plan, "%h"), "cuda:1:global");
    }

    #[test]
    fn field_moved_out_of_data_without_copy_conflicts() {
        let (_, result) = plan_src(
            r#"type B { W(Tensor) }
               def @main(%x: Tensor @ "cuda:0:global", %y: Tensor @ "cpu:0:") {
                 match (W(%x)) { W(%h) => add(%h, %y) }
               }"#,
        );
        let err = result.expect_err("tensor field cannot change device");
        assert!(matches!(err, PlanError::Conflict { .. }), "{err}");
    }

    #[test]
    fn references_collapse_through_cells() {
        let (m, result) = plan_src(
            r#"def @main(%x: Tensor @ "cpu:0:") {
                let %r = ref(%x);
                ref_read(%r)
            }"#,
        );
        let plan = result.expect("plan");
        assert_eq!(placement_of(&m, &plan, "ref"), "llvm:0:");
        assert_eq!(placement_of(&m, &plan, "ref_read"), "llvm:0:");
    }

    #[test]
    fn every_call_has_a_rendered_callee() {
        let (m, result) = plan_src("def @main(%x: Tensor) { add(mul(%x, %x), %x) }");
        let plan = result.expect("plan");
        assert_eq!(plan.callee_domains.len(), m.call_count());
        assert!(plan
            .callee_domains
            .values()
            .all(|d| d == "fn(<cuda:0:global>, <cuda:0:global>):<cuda:0:global>"));
    }
}
