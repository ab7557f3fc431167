// binding.rs — Expression and call-site domain tables
//
// `DeviceDomains` owns the `DomainStore` for one planning run and binds IR
// expressions (by `ExprId`) and call sites (by `CallId`) to domains. Callee
// domains are keyed by call site, so one primitive may run at different
// placements at different calls. Special operators get their callee domain
// from the `IntrinsicTable` handed in by the caller.
//
// Preconditions: `module` lowered without errors; `config` validated.
// Postconditions: every expression queried has exactly one bound domain for
//   the lifetime of the run.
// Failure modes: exact unification failures and bad placement annotations
//   surface as `PlanError`; these are fatal for the run.
// Side effects: `tracing` events at debug level for new callee domains.

use std::collections::HashMap;
use std::fmt;
use std::fmt::Write as _;

use tracing::debug;

use crate::ast::Span;
use crate::config::{CompilationConfig, ConfigError};
use crate::domain::{Domain, DomainStore};
use crate::id::{CallId, DomainId, ExprId};
use crate::intrinsics::{CalleeRule, IntrinsicTable, Slot};
use crate::ir::{CallAttrs, ExprKind, Module, Type};
use crate::placement::Placement;

// ── Errors ──────────────────────────────────────────────────────────────────

/// A fatal planning failure.
#[derive(Debug)]
pub enum PlanError {
    /// Two expressions that must share a placement cannot.
    Conflict {
        lhs: ExprId,
        rhs: Option<ExprId>,
        lhs_domain: String,
        rhs_domain: String,
        span: Span,
    },
    /// A special operator was called without what its rule requires.
    Intrinsic {
        call: CallId,
        op: String,
        message: String,
        span: Span,
    },
    /// A placement annotation the configuration rejects.
    Config { error: ConfigError, span: Span },
    /// A placement annotation that constrains nothing.
    Unconstrained { span: Span },
}

impl PlanError {
    pub fn span(&self) -> Span {
        match self {
            PlanError::Conflict { span, .. }
            | PlanError::Intrinsic { span, .. }
            | PlanError::Config { span, .. }
            | PlanError::Unconstrained { span } => *span,
        }
    }
}

impl fmt::Display for PlanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanError::Conflict {
                lhs,
                rhs,
                lhs_domain,
                rhs_domain,
                ..
            } => match rhs {
                Some(rhs) => write!(
                    f,
                    "conflicting placements: {} is {} but {} is {}",
                    lhs, lhs_domain, rhs, rhs_domain
                ),
                None => write!(
                    f,
                    "conflicting placements: {} is {} but must be {}",
                    lhs, lhs_domain, rhs_domain
                ),
            },
            PlanError::Intrinsic { call, op, message, .. } => {
                write!(f, "{} ({}): {}", op, call, message)
            }
            PlanError::Config { error, .. } => write!(f, "{}", error),
            PlanError::Unconstrained { .. } => {
                write!(f, "placement annotation '?:?:?' constrains nothing")
            }
        }
    }
}

impl std::error::Error for PlanError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PlanError::Config { error, .. } => Some(error),
            _ => None,
        }
    }
}

// ── Domain tables ───────────────────────────────────────────────────────────

pub struct DeviceDomains<'a> {
    module: &'a Module,
    config: &'a CompilationConfig,
    intrinsics: &'a IntrinsicTable,
    store: DomainStore,
    host: DomainId,
    expr_domains: HashMap<ExprId, DomainId>,
    callee_domains: HashMap<CallId, DomainId>,
}

impl<'a> DeviceDomains<'a> {
    pub fn new(
        module: &'a Module,
        config: &'a CompilationConfig,
        intrinsics: &'a IntrinsicTable,
    ) -> Self {
        let mut store = DomainStore::new();
        let host = store.make_first_order(config.host_placement().clone());
        DeviceDomains {
            module,
            config,
            intrinsics,
            store,
            host,
            expr_domains: HashMap::new(),
            callee_domains: HashMap::new(),
        }
    }

    pub fn module(&self) -> &'a Module {
        self.module
    }

    pub fn config(&self) -> &'a CompilationConfig {
        self.config
    }

    pub fn store(&self) -> &DomainStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut DomainStore {
        &mut self.store
    }

    /// The interned host domain.
    pub fn host(&self) -> DomainId {
        self.host
    }

    /// Bound domain of `expr`, if any was created.
    pub fn expr_domain(&self, expr: ExprId) -> Option<DomainId> {
        self.expr_domains.get(&expr).copied()
    }

    /// Bound callee domain of `call`, if any was created.
    pub fn callee_domain(&self, call: CallId) -> Option<DomainId> {
        self.callee_domains.get(&call).copied()
    }

    /// Number of bound expressions and call sites.
    pub fn bound_counts(&self) -> (usize, usize) {
        (self.expr_domains.len(), self.callee_domains.len())
    }

    // ── Construction ────────────────────────────────────────────────────────

    /// A domain of shape `ty` whose result is the canonical form of
    /// `placement`. Rejects fully unconstrained placements.
    pub fn for_placement(
        &mut self,
        ty: &Type,
        placement: &Placement,
        span: Span,
    ) -> Result<DomainId, PlanError> {
        if placement.is_fully_unconstrained() {
            return Err(PlanError::Unconstrained { span });
        }
        let canonical = self
            .config
            .canonical(placement)
            .map_err(|error| PlanError::Config { error, span })?;
        Ok(self.store.make_domain(ty, &canonical))
    }

    /// The domain bound to `expr`, created free on first use.
    pub fn domain_for(&mut self, expr: ExprId) -> DomainId {
        if let Some(&d) = self.expr_domains.get(&expr) {
            return d;
        }
        let d = self.store.free(self.module.ty(expr));
        self.expr_domains.insert(expr, d);
        d
    }

    /// The domain of the callee of the call expression `call_expr`.
    ///
    /// Operators with a rule in the intrinsic table get a domain built from
    /// that rule; other operators get one shared first-order domain for all
    /// arguments and the result; constructors share the result's domain with
    /// every field, collapsing function-typed ones onto it. Any other callee uses its own expression domain.
    pub fn domain_for_callee(&mut self, call_expr: ExprId) -> Result<DomainId, PlanError> {
        let module = self.module;
        let node = module.expr(call_expr);
        let ExprKind::Call {
            call,
            callee,
            args,
            attrs,
        } = &node.kind
        else {
            return Ok(self.domain_for(call_expr));
        };
        if let Some(&d) = self.callee_domains.get(call) {
            return Ok(d);
        }

        let arg_types: Vec<&Type> = args.iter().map(|a| module.ty(*a)).collect();
        let d = match &module.expr(*callee).kind {
            ExprKind::Op(op) => match self.intrinsics.lookup(op) {
                Some(rule) => {
                    let rule = rule.clone();
                    self.special_domain(&rule, op, *call, &arg_types, &node.ty, attrs, node.span)?
                }
                None => self.primitive_domain(&arg_types, &node.ty),
            },
            ExprKind::Constructor(_) => {
                // Data values are opaque: every field lives where the value does.
                let result = self.store.free(&node.ty);
                let mut children = Vec::with_capacity(args.len() + 1);
                for ty in arg_types.iter().copied() {
                    children.push(self.mirror_onto(result, ty));
                }
                children.push(result);
                self.store.make_higher_order(children)
            }
            _ => self.domain_for(*callee),
        };
        debug!(%call, domain = %self.store.render(d), "callee domain");
        self.callee_domains.insert(*call, d);
        Ok(d)
    }

    fn primitive_domain(&mut self, arg_types: &[&Type], result_ty: &Type) -> DomainId {
        let shared = self.store.free(&Type::Tensor);
        let mut children = Vec::with_capacity(arg_types.len() + 1);
        for ty in arg_types.iter().copied().chain(std::iter::once(result_ty)) {
            children.push(self.mirror_onto(shared, ty));
        }
        self.store.make_higher_order(children)
    }

    /// `first_order` itself for a non-function shape, otherwise a fresh
    /// domain of shape `ty` collapsed onto it.
    fn mirror_onto(&mut self, first_order: DomainId, ty: &Type) -> DomainId {
        if !ty.is_func() {
            return first_order;
        }
        let d = self.store.free(ty);
        self.store.collapse_or_false(first_order, d);
        d
    }

    #[allow(clippy::too_many_arguments)]
    fn special_domain(
        &mut self,
        rule: &CalleeRule,
        op: &str,
        call: CallId,
        arg_types: &[&Type],
        result_ty: &Type,
        attrs: &CallAttrs,
        span: Span,
    ) -> Result<DomainId, PlanError> {
        let intrinsic_error = |message: String| PlanError::Intrinsic {
            call,
            op: op.to_string(),
            message,
            span,
        };
        if rule.arity() != arg_types.len() {
            return Err(intrinsic_error(format!(
                "expects {} argument(s), found {}",
                rule.arity(),
                arg_types.len()
            )));
        }
        match rule {
            CalleeRule::OnDevice => {
                let scope = attrs
                    .placement("scope")
                    .ok_or_else(|| intrinsic_error("missing 'scope' placement".to_string()))?
                    .clone();
                let param = self.for_placement(arg_types[0], &scope, span)?;
                let result = if attrs.flag("fixed") {
                    self.for_placement(result_ty, &scope, span)?
                } else {
                    self.store.free(result_ty)
                };
                Ok(self.store.make_higher_order(vec![param, result]))
            }
            CalleeRule::Slots { params, result } => {
                let mut shared = None;
                let mut children = Vec::with_capacity(params.len() + 1);
                let slots = params.iter().zip(arg_types.iter().copied());
                for (slot, ty) in slots.chain(std::iter::once((result, result_ty))) {
                    let d = match slot {
                        Slot::Host => {
                            let host = self.config.host_placement().clone();
                            self.store.make_domain(ty, &host)
                        }
                        Slot::Shared => {
                            let shared =
                                *shared.get_or_insert_with(|| self.store.free(&Type::Tensor));
                            self.mirror_onto(shared, ty)
                        }
                        Slot::Free => self.store.free(ty),
                        Slot::Attr(name) => {
                            let placement = attrs.placement(name).ok_or_else(|| {
                                intrinsic_error(format!("missing '{}' placement", name))
                            })?;
                            let placement = placement.clone();
                            self.for_placement(ty, &placement, span)?
                        }
                    };
                    children.push(d);
                }
                Ok(self.store.make_higher_order(children))
            }
        }
    }

    // ── Unification of expressions ──────────────────────────────────────────

    /// Unify the domain of `expr` with `domain`. Failure is fatal.
    pub fn unify_expr_exact(&mut self, expr: ExprId, domain: DomainId) -> Result<(), PlanError> {
        let d = self.domain_for(expr);
        if self.store.unify_or_null(d, domain).is_some() {
            return Ok(());
        }
        Err(self.conflict(expr, None, d, domain))
    }

    /// Unify the domains of two expressions. Failure is fatal.
    pub fn unify_exprs_exact(&mut self, lhs: ExprId, rhs: ExprId) -> Result<(), PlanError> {
        let l = self.domain_for(lhs);
        let r = self.domain_for(rhs);
        if self.store.unify_or_null(l, r).is_some() {
            return Ok(());
        }
        Err(self.conflict(lhs, Some(rhs), l, r))
    }

    /// Unify the first-order domain of `expr` with `domain`, collapsing
    /// `domain` onto it when it is higher-order. Failure is fatal.
    pub fn unify_expr_collapsed(&mut self, expr: ExprId, domain: DomainId) -> Result<(), PlanError> {
        self.collapse_or_conflict(expr, None, domain)
    }

    /// `unify_expr_collapsed` against the domain of another expression.
    pub fn unify_exprs_collapsed(&mut self, first_order: ExprId, other: ExprId) -> Result<(), PlanError> {
        let domain = self.domain_for(other);
        self.collapse_or_conflict(first_order, Some(other), domain)
    }

    fn collapse_or_conflict(
        &mut self,
        expr: ExprId,
        other: Option<ExprId>,
        domain: DomainId,
    ) -> Result<(), PlanError> {
        let d = self.domain_for(expr);
        if self.store.unify_collapsed_or_false(d, domain) {
            return Ok(());
        }
        Err(self.conflict(expr, other, d, domain))
    }

    pub(crate) fn conflict(
        &self,
        lhs: ExprId,
        rhs: Option<ExprId>,
        lhs_domain: DomainId,
        rhs_domain: DomainId,
    ) -> PlanError {
        PlanError::Conflict {
            lhs,
            rhs,
            lhs_domain: self.store.render(lhs_domain),
            rhs_domain: self.store.render(rhs_domain),
            span: self.module.span(lhs),
        }
    }

    // ── Rendering ───────────────────────────────────────────────────────────

    /// Every bound expression and call site with its current domain.
    pub fn render_system(&self) -> String {
        let mut out = String::new();
        let mut exprs: Vec<_> = self.expr_domains.iter().collect();
        exprs.sort();
        for (expr, d) in exprs {
            let _ = writeln!(
                out,
                "{} {}: {}",
                expr,
                self.module.label(*expr),
                self.store.render(*d)
            );
        }
        let mut calls: Vec<_> = self.callee_domains.iter().collect();
        calls.sort();
        for (call, d) in calls {
            let _ = writeln!(out, "{} callee: {}", call, self.store.render(*d));
        }
        out
    }

    /// Parameter and result domains of a higher-order `d`.
    pub fn function_parts(&mut self, d: DomainId) -> Option<Vec<DomainId>> {
        let rep = self.store.lookup(d);
        match self.store.domain(rep) {
            Domain::HigherOrder(children) => Some(children.clone()),
            Domain::FirstOrder(_) => None,
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
