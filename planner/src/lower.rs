// lower.rs — AST → IR lowering with name resolution and shape checking
//
// Resolves locals, globals, operators and constructors, synthesizes a shape
// `Type` for every expression, parses placement annotations, and assigns
// identities: one `ExprId` per binder (shared by all its uses), one `Global`
// node per global, one `CallId` per call site.
//
// Preconditions: `program` is a well-formed AST from the parser.
// Postconditions: when `has_errors()` is false, every node in the module is
//   well-shaped (callees are functions, arities and argument shapes match,
//   branches agree, projections are in range).
// Failure modes: unknown names, duplicate definitions, shape mismatches and
//   malformed placements produce `Diagnostic` entries. Lowering continues
//   past errors; a failed subexpression suppresses errors that depend on it.
// Side effects: none.

use std::collections::HashMap;

use crate::ast::{self, Span};
use crate::diag::codes;
use crate::diag::{DiagCode, DiagLevel, Diagnostic};
use crate::id::{ExprId, IdAllocator};
use crate::ir::{AdtDef, CallAttrs, Clause, CtorDef, ExprKind, GlobalDef, Module, Pattern, Type};
use crate::placement::Placement;

// ── Output types ────────────────────────────────────────────────────────────

/// Result of lowering.
#[derive(Debug)]
pub struct LowerResult {
    pub module: Module,
    pub diagnostics: Vec<Diagnostic>,
}

impl LowerResult {
    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(|d| d.level == DiagLevel::Error)
    }
}

/// Lower a parsed program into the arena IR.
pub fn lower(program: &ast::Program) -> LowerResult {
    let mut ctx = LowerCtx::new();
    ctx.declare_types(program);
    ctx.declare_globals(program);
    ctx.lower_globals(program);
    LowerResult {
        module: ctx.module,
        diagnostics: ctx.diagnostics,
    }
}

/// Operators whose result has the shape of their first argument.
fn passes_through_shape(op: &str) -> bool {
    matches!(op, "on_device" | "device_copy")
}

// ── Internal context ────────────────────────────────────────────────────────

struct GlobalEntry {
    node: ExprId,
    /// False until the global's type is known (annotated or lowered).
    typed: bool,
    span: Span,
}

struct LowerCtx {
    module: Module,
    diagnostics: Vec<Diagnostic>,
    ids: IdAllocator,
    adts: HashMap<String, usize>,
    /// Constructor name → (ADT name, field types).
    ctors: HashMap<String, (String, Vec<Type>)>,
    globals: HashMap<String, GlobalEntry>,
    scopes: Vec<(String, ExprId)>,
}

impl LowerCtx {
    fn new() -> Self {
        LowerCtx {
            module: Module::new(),
            diagnostics: Vec::new(),
            ids: IdAllocator::new(),
            adts: HashMap::new(),
            ctors: HashMap::new(),
            globals: HashMap::new(),
            scopes: Vec::new(),
        }
    }

    fn error(&mut self, code: DiagCode, span: Span, message: String) {
        self.diagnostics
            .push(Diagnostic::new(DiagLevel::Error, span, message).with_code(code));
    }

    fn error_with_hint(&mut self, code: DiagCode, span: Span, message: String, hint: String) {
        self.diagnostics.push(
            Diagnostic::new(DiagLevel::Error, span, message)
                .with_code(code)
                .with_hint(hint),
        );
    }

    // ── Declarations ────────────────────────────────────────────────────────

    fn declare_types(&mut self, program: &ast::Program) {
        // Names first, so constructors may refer to any declared type.
        let mut decls = Vec::new();
        for item in &program.items {
            if let ast::ItemKind::Type(decl) = &item.kind {
                if self.adts.contains_key(&decl.name.name) || decl.name.name == "Tensor" {
                    self.error(
                        codes::E0102,
                        decl.name.span,
                        format!("type '{}' is defined more than once", decl.name.name),
                    );
                    continue;
                }
                self.adts
                    .insert(decl.name.name.clone(), self.module.adts.len());
                self.module.adts.push(AdtDef {
                    name: decl.name.name.clone(),
                    constructors: Vec::new(),
                });
                decls.push(decl);
            }
        }

        for decl in decls {
            let adt_index = self.adts[&decl.name.name];
            for ctor in &decl.constructors {
                if self.ctors.contains_key(&ctor.name.name) {
                    self.error(
                        codes::E0102,
                        ctor.name.span,
                        format!("constructor '{}' is defined more than once", ctor.name.name),
                    );
                    continue;
                }
                let fields: Option<Vec<Type>> =
                    ctor.fields.iter().map(|f| self.lower_type(f)).collect();
                let Some(fields) = fields else { continue };
                self.ctors.insert(
                    ctor.name.name.clone(),
                    (decl.name.name.clone(), fields.clone()),
                );
                self.module.adts[adt_index].constructors.push(CtorDef {
                    name: ctor.name.name.clone(),
                    fields,
                });
            }
        }
    }

    /// Create the shared `Global` node of every def. Globals with a result
    /// annotation get their type now; the rest once their body is lowered.
    fn declare_globals(&mut self, program: &ast::Program) {
        for item in &program.items {
            let ast::ItemKind::Def(def) = &item.kind else {
                continue;
            };
            if let Some(prev) = self.globals.get(&def.name.name) {
                let prev_span = prev.span;
                self.diagnostics.push(
                    Diagnostic::new(
                        DiagLevel::Error,
                        def.name.span,
                        format!("global '@{}' is defined more than once", def.name.name),
                    )
                    .with_code(codes::E0102)
                    .with_related(prev_span, "first defined here"),
                );
                continue;
            }
            // Signature errors are reported when the body is lowered.
            let mark = self.diagnostics.len();
            let declared = match &def.func.ret {
                Some(ret) => {
                    let params: Option<Vec<Type>> =
                        def.func.params.iter().map(|p| self.lower_type(&p.ty)).collect();
                    let ret = self.lower_type(ret);
                    params.zip(ret).map(|(params, ret)| Type::func(params, ret))
                }
                None => None,
            };
            self.diagnostics.truncate(mark);
            let typed = declared.is_some();
            let node = self.module.push(
                ExprKind::Global {
                    name: def.name.name.clone(),
                },
                declared.unwrap_or_else(Type::unit),
                def.name.span,
            );
            self.globals.insert(
                def.name.name.clone(),
                GlobalEntry {
                    node,
                    typed,
                    span: def.name.span,
                },
            );
        }
    }

    fn lower_globals(&mut self, program: &ast::Program) {
        for item in &program.items {
            let ast::ItemKind::Def(def) = &item.kind else {
                continue;
            };
            let Some(entry) = self.globals.get(&def.name.name) else {
                continue;
            };
            // A duplicate def shares the first def's name but not its span.
            if entry.span != def.name.span {
                continue;
            }
            let node = entry.node;
            let Some(func) = self.lower_fn(&def.func, item.span) else {
                continue;
            };
            let func_ty = self.module.ty(func).clone();
            self.module.exprs[node.index()].ty = func_ty;
            if let Some(entry) = self.globals.get_mut(&def.name.name) {
                entry.typed = true;
            }
            self.module.globals.push(GlobalDef {
                name: def.name.name.clone(),
                var: node,
                func,
            });
        }
    }

    // ── Types and annotations ───────────────────────────────────────────────

    fn lower_type(&mut self, ty: &ast::TypeExpr) -> Option<Type> {
        match &ty.kind {
            ast::TypeExprKind::Named(name) if name.name == "Tensor" => Some(Type::Tensor),
            ast::TypeExprKind::Named(name) => {
                if self.adts.contains_key(&name.name) {
                    Some(Type::Adt(name.name.clone()))
                } else {
                    self.error(
                        codes::E0103,
                        name.span,
                        format!("unknown type '{}'", name.name),
                    );
                    None
                }
            }
            ast::TypeExprKind::Tuple(fields) => {
                let fields: Vec<Option<Type>> = fields.iter().map(|f| self.lower_type(f)).collect();
                Some(Type::Tuple(fields.into_iter().collect::<Option<Vec<_>>>()?))
            }
            ast::TypeExprKind::Func(params, ret) => {
                let params: Vec<Option<Type>> = params.iter().map(|p| self.lower_type(p)).collect();
                let ret = self.lower_type(ret);
                Some(Type::func(params.into_iter().collect::<Option<Vec<_>>>()?, ret?))
            }
            ast::TypeExprKind::Ref(inner) => Some(Type::Ref(Box::new(self.lower_type(inner)?))),
        }
    }

    fn lower_placement(&mut self, lit: &ast::PlacementLit) -> Option<Placement> {
        match lit.text.parse::<Placement>() {
            Ok(p) => Some(p),
            Err(e) => {
                self.error_with_hint(
                    codes::E0114,
                    lit.span,
                    e.to_string(),
                    "placements are written target:device:scope, with '?' for unknown fields"
                        .to_string(),
                );
                None
            }
        }
    }

    fn lower_attrs(&mut self, attrs: &[ast::Attr]) -> Option<CallAttrs> {
        let mut out = CallAttrs::default();
        let mut ok = true;
        for attr in attrs {
            let name = attr.name.name.clone();
            if out.placements.contains_key(&name) || out.flags.contains_key(&name) {
                self.diagnostics.push(
                    Diagnostic::new(
                        DiagLevel::Warning,
                        attr.name.span,
                        format!("duplicate attribute '{}'; the last one wins", name),
                    )
                    .with_code(codes::W0100),
                );
                out.placements.remove(&name);
                out.flags.remove(&name);
            }
            match &attr.value {
                ast::AttrValue::Placement(lit) => match self.lower_placement(lit) {
                    Some(p) => {
                        out.placements.insert(name, p);
                    }
                    None => ok = false,
                },
                ast::AttrValue::Bool(b, _) => {
                    out.flags.insert(name, *b);
                }
            }
        }
        ok.then_some(out)
    }

    fn check_shape(&mut self, code: DiagCode, span: Span, expected: &Type, found: &Type, what: &str) -> bool {
        if expected == found {
            return true;
        }
        self.error(
            code,
            span,
            format!("{} has shape {}, expected {}", what, found, expected),
        );
        false
    }

    // ── Scopes ──────────────────────────────────────────────────────────────

    fn lookup_local(&self, name: &str) -> Option<ExprId> {
        self.scopes
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, id)| *id)
    }

    fn bind(&mut self, name: &ast::Ident, ty: Type, placement: Option<Placement>) -> ExprId {
        let id = self.module.push(
            ExprKind::Var {
                name: name.name.clone(),
                placement,
            },
            ty,
            name.span,
        );
        self.scopes.push((name.name.clone(), id));
        id
    }

    // ── Functions ───────────────────────────────────────────────────────────

    fn lower_fn(&mut self, func: &ast::FnExpr, span: Span) -> Option<ExprId> {
        let mark = self.scopes.len();
        let mut params = Vec::new();
        let mut param_types = Vec::new();
        let mut ok = true;
        for param in &func.params {
            let ty = self.lower_type(&param.ty);
            let placement = match &param.placement {
                Some(lit) => match self.lower_placement(lit) {
                    Some(p) => Some(p),
                    None => {
                        ok = false;
                        None
                    }
                },
                None => None,
            };
            let Some(ty) = ty else {
                ok = false;
                continue;
            };
            param_types.push(ty.clone());
            params.push(self.bind(&param.name, ty, placement));
        }
        let ret = func.ret.as_ref().map(|r| self.lower_type(r));
        let result_placement = match &func.ret_placement {
            Some(lit) => {
                let p = self.lower_placement(lit);
                ok &= p.is_some();
                p
            }
            None => None,
        };

        let body = if ok { self.lower_expr(&func.body) } else { None };
        self.scopes.truncate(mark);
        let body = body?;

        let body_ty = self.module.ty(body).clone();
        if let Some(ret) = ret {
            let ret = ret?;
            if !self.check_shape(codes::E0110, func.body.span, &ret, &body_ty, "function body") {
                return None;
            }
        }
        Some(self.module.push(
            ExprKind::Function {
                params,
                body,
                result_placement,
            },
            Type::func(param_types, body_ty),
            span,
        ))
    }

    // ── Expressions ─────────────────────────────────────────────────────────

    fn lower_all(&mut self, exprs: &[ast::Expr]) -> Option<Vec<ExprId>> {
        let lowered: Vec<Option<ExprId>> = exprs.iter().map(|e| self.lower_expr(e)).collect();
        lowered.into_iter().collect()
    }

    fn lower_expr(&mut self, expr: &ast::Expr) -> Option<ExprId> {
        let span = expr.span;
        match &expr.kind {
            ast::ExprKind::Local(name) => match self.lookup_local(&name.name) {
                Some(id) => Some(id),
                None => {
                    self.error(
                        codes::E0100,
                        name.span,
                        format!("unknown variable '%{}'", name.name),
                    );
                    None
                }
            },
            ast::ExprKind::Global(name) => self.lower_global_ref(name),
            ast::ExprKind::Number(v) => {
                Some(self.module.push(ExprKind::Constant(*v), Type::Tensor, span))
            }
            ast::ExprKind::Name(name) => {
                // A bare nullary constructor is a call with no arguments.
                if let Some((_, fields)) = self.ctors.get(&name.name) {
                    if fields.is_empty() {
                        return self.lower_ctor_call(name, &[], &[], span);
                    }
                }
                self.error_with_hint(
                    codes::E0105,
                    name.span,
                    format!("'{}' can only be used in callee position", name.name),
                    format!("wrap it in a function: fn(%x: Tensor) {{ {}(%x) }}", name.name),
                );
                None
            }
            ast::ExprKind::Tuple(items) => {
                let fields = self.lower_all(items)?;
                let ty = Type::Tuple(fields.iter().map(|f| self.module.ty(*f).clone()).collect());
                Some(self.module.push(ExprKind::Tuple(fields), ty, span))
            }
            ast::ExprKind::Proj(tuple, index) => {
                let tuple_id = self.lower_expr(tuple)?;
                let field_ty = match self.module.ty(tuple_id) {
                    Type::Tuple(fields) => fields.get(*index).cloned(),
                    _ => None,
                };
                match field_ty {
                    Some(ty) => Some(self.module.push(
                        ExprKind::Proj {
                            tuple: tuple_id,
                            index: *index,
                        },
                        ty,
                        span,
                    )),
                    None => {
                        let found = self.module.ty(tuple_id).clone();
                        self.error(
                            codes::E0111,
                            span,
                            format!("cannot project field {} of shape {}", index, found),
                        );
                        None
                    }
                }
            }
            ast::ExprKind::Call {
                callee,
                args,
                attrs,
            } => self.lower_call(callee, args, attrs, span),
            ast::ExprKind::Let {
                name,
                ty,
                value,
                body,
            } => {
                let value_id = self.lower_expr(value)?;
                let value_ty = self.module.ty(value_id).clone();
                if let Some(annot) = ty {
                    let annot = self.lower_type(annot)?;
                    if !self.check_shape(codes::E0110, value.span, &annot, &value_ty, "let value") {
                        return None;
                    }
                }
                let mark = self.scopes.len();
                let var = self.bind(name, value_ty, None);
                let body_id = self.lower_expr(body);
                self.scopes.truncate(mark);
                let body_id = body_id?;
                let ty = self.module.ty(body_id).clone();
                Some(self.module.push(
                    ExprKind::Let {
                        var,
                        value: value_id,
                        body: body_id,
                    },
                    ty,
                    span,
                ))
            }
            ast::ExprKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                let cond = self.lower_expr(cond);
                let then_id = self.lower_expr(then_branch);
                let else_id = self.lower_expr(else_branch);
                let (cond, then_id, else_id) = (cond?, then_id?, else_id?);
                let then_ty = self.module.ty(then_id).clone();
                let else_ty = self.module.ty(else_id).clone();
                if !self.check_shape(codes::E0109, else_branch.span, &then_ty, &else_ty, "else branch") {
                    return None;
                }
                Some(self.module.push(
                    ExprKind::If {
                        cond,
                        then_branch: then_id,
                        else_branch: else_id,
                    },
                    then_ty,
                    span,
                ))
            }
            ast::ExprKind::Fn(func) => self.lower_fn(func, span),
            ast::ExprKind::RefCreate(value) => {
                let value = self.lower_expr(value)?;
                let ty = Type::Ref(Box::new(self.module.ty(value).clone()));
                Some(self.module.push(ExprKind::RefCreate(value), ty, span))
            }
            ast::ExprKind::RefRead(reference) => {
                let reference_id = self.lower_expr(reference)?;
                let inner = self.ref_inner(reference_id, reference.span)?;
                Some(self.module.push(ExprKind::RefRead(reference_id), inner, span))
            }
            ast::ExprKind::RefWrite(reference, value) => {
                let reference_id = self.lower_expr(reference);
                let value_id = self.lower_expr(value);
                let (reference_id, value_id) = (reference_id?, value_id?);
                let inner = self.ref_inner(reference_id, reference.span)?;
                let value_ty = self.module.ty(value_id).clone();
                if !self.check_shape(codes::E0108, value.span, &inner, &value_ty, "written value") {
                    return None;
                }
                Some(self.module.push(
                    ExprKind::RefWrite {
                        reference: reference_id,
                        value: value_id,
                    },
                    Type::unit(),
                    span,
                ))
            }
            ast::ExprKind::Match { data, clauses } => self.lower_match(data, clauses, span),
        }
    }

    fn lower_global_ref(&mut self, name: &ast::Ident) -> Option<ExprId> {
        match self.globals.get(&name.name) {
            Some(entry) if entry.typed => Some(entry.node),
            Some(_) => {
                self.error_with_hint(
                    codes::E0110,
                    name.span,
                    format!("the type of '@{}' is not known here", name.name),
                    "annotate the global's result type to reference it before its definition"
                        .to_string(),
                );
                None
            }
            None => {
                self.error(
                    codes::E0101,
                    name.span,
                    format!("unknown global '@{}'", name.name),
                );
                None
            }
        }
    }

    fn ref_inner(&mut self, reference: ExprId, span: Span) -> Option<Type> {
        match self.module.ty(reference) {
            Type::Ref(inner) => Some((**inner).clone()),
            other => {
                let found = other.clone();
                self.error(
                    codes::E0112,
                    span,
                    format!("expected a reference, found shape {}", found),
                );
                None
            }
        }
    }

    // ── Calls ───────────────────────────────────────────────────────────────

    fn lower_call(
        &mut self,
        callee: &ast::Expr,
        args: &[ast::Expr],
        attrs: &[ast::Attr],
        span: Span,
    ) -> Option<ExprId> {
        if let ast::ExprKind::Name(name) = &callee.kind {
            if self.ctors.contains_key(&name.name) {
                return self.lower_ctor_call(name, args, attrs, span);
            }
            return self.lower_op_call(name, args, attrs, span);
        }

        let callee_id = self.lower_expr(callee);
        let arg_ids = self.lower_all(args);
        let (callee_id, arg_ids) = (callee_id?, arg_ids?);
        if let Some(attr) = attrs.first() {
            self.error(
                codes::E0115,
                attr.name.span,
                "attributes are only allowed on operator calls".to_string(),
            );
            return None;
        }
        let Some(func) = self.module.ty(callee_id).as_func().cloned() else {
            let found = self.module.ty(callee_id).clone();
            self.error(
                codes::E0106,
                callee.span,
                format!("cannot call a value of shape {}", found),
            );
            return None;
        };
        if !self.check_args(&func.params, &arg_ids, args, span) {
            return None;
        }
        let call = self.ids.alloc_call();
        Some(self.module.push(
            ExprKind::Call {
                call,
                callee: callee_id,
                args: arg_ids,
                attrs: CallAttrs::default(),
            },
            *func.ret,
            span,
        ))
    }

    fn check_args(&mut self, params: &[Type], arg_ids: &[ExprId], args: &[ast::Expr], span: Span) -> bool {
        if params.len() != arg_ids.len() {
            self.error(
                codes::E0107,
                span,
                format!(
                    "expected {} argument(s), found {}",
                    params.len(),
                    arg_ids.len()
                ),
            );
            return false;
        }
        let mut ok = true;
        for ((param, arg), ast_arg) in params.iter().zip(arg_ids).zip(args) {
            let found = self.module.ty(*arg).clone();
            ok &= self.check_shape(codes::E0108, ast_arg.span, param, &found, "argument");
        }
        ok
    }

    fn lower_op_call(
        &mut self,
        name: &ast::Ident,
        args: &[ast::Expr],
        attrs: &[ast::Attr],
        span: Span,
    ) -> Option<ExprId> {
        let arg_ids = self.lower_all(args);
        let attrs = self.lower_attrs(attrs);
        let (arg_ids, attrs) = (arg_ids?, attrs?);
        let param_types: Vec<Type> = arg_ids.iter().map(|a| self.module.ty(*a).clone()).collect();
        let ret = match param_types.first() {
            Some(first) if passes_through_shape(&name.name) => first.clone(),
            _ => Type::Tensor,
        };
        let op = self.module.push(
            ExprKind::Op(name.name.clone()),
            Type::func(param_types, ret.clone()),
            name.span,
        );
        let call = self.ids.alloc_call();
        Some(self.module.push(
            ExprKind::Call {
                call,
                callee: op,
                args: arg_ids,
                attrs,
            },
            ret,
            span,
        ))
    }

    fn lower_ctor_call(
        &mut self,
        name: &ast::Ident,
        args: &[ast::Expr],
        attrs: &[ast::Attr],
        span: Span,
    ) -> Option<ExprId> {
        let (adt, fields) = self.ctors.get(&name.name).cloned()?;
        let arg_ids = self.lower_all(args)?;
        if let Some(attr) = attrs.first() {
            self.error(
                codes::E0115,
                attr.name.span,
                "attributes are only allowed on operator calls".to_string(),
            );
            return None;
        }
        if !self.check_args(&fields, &arg_ids, args, span) {
            return None;
        }
        let ctor = self.module.push(
            ExprKind::Constructor(name.name.clone()),
            Type::func(fields, Type::Adt(adt.clone())),
            name.span,
        );
        let call = self.ids.alloc_call();
        Some(self.module.push(
            ExprKind::Call {
                call,
                callee: ctor,
                args: arg_ids,
                attrs: CallAttrs::default(),
            },
            Type::Adt(adt),
            span,
        ))
    }

    // ── Match ───────────────────────────────────────────────────────────────

    fn lower_match(
        &mut self,
        data: &ast::Expr,
        clauses: &[ast::MatchClause],
        span: Span,
    ) -> Option<ExprId> {
        let data_id = self.lower_expr(data)?;
        let adt = match self.module.ty(data_id) {
            Type::Adt(name) => name.clone(),
            other => {
                let found = other.clone();
                self.error(
                    codes::E0113,
                    data.span,
                    format!("cannot match on a value of shape {}", found),
                );
                return None;
            }
        };

        let mut lowered = Vec::new();
        let mut result_ty: Option<Type> = None;
        let mut ok = true;
        for clause in clauses {
            let mark = self.scopes.len();
            let pattern = self.lower_pattern(&clause.pattern, &adt);
            let body = match pattern {
                Some(_) => self.lower_expr(&clause.body),
                None => None,
            };
            self.scopes.truncate(mark);
            let (Some(pattern), Some(body)) = (pattern, body) else {
                ok = false;
                continue;
            };
            let body_ty = self.module.ty(body).clone();
            match &result_ty {
                None => result_ty = Some(body_ty),
                Some(expected) => {
                    let expected = expected.clone();
                    ok &= self.check_shape(codes::E0109, clause.body.span, &expected, &body_ty, "match clause");
                }
            }
            lowered.push(Clause { pattern, body });
        }
        if !ok {
            return None;
        }
        let ty = result_ty?;
        Some(self.module.push(
            ExprKind::Match {
                data: data_id,
                clauses: lowered,
            },
            ty,
            span,
        ))
    }

    fn lower_pattern(&mut self, pattern: &ast::Pattern, adt: &str) -> Option<Pattern> {
        match pattern {
            ast::Pattern::Wildcard(_) => Some(Pattern::Wildcard),
            ast::Pattern::Ctor { name, binders } => {
                let Some((owner, fields)) = self.ctors.get(&name.name).cloned() else {
                    self.error(
                        codes::E0104,
                        name.span,
                        format!("unknown constructor '{}'", name.name),
                    );
                    return None;
                };
                if owner != adt {
                    self.error(
                        codes::E0113,
                        name.span,
                        format!(
                            "constructor '{}' belongs to type {}, not {}",
                            name.name, owner, adt
                        ),
                    );
                    return None;
                }
                if fields.len() != binders.len() {
                    self.error(
                        codes::E0113,
                        name.span,
                        format!(
                            "constructor '{}' has {} field(s), pattern binds {}",
                            name.name,
                            fields.len(),
                            binders.len()
                        ),
                    );
                    return None;
                }
                let binders = binders
                    .iter()
                    .zip(fields)
                    .map(|(binder, ty)| self.bind(binder, ty, None))
                    .collect();
                Some(Pattern::Constructor {
                    name: name.name.clone(),
                    binders,
                })
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn lower_src(source: &str) -> LowerResult {
        let parsed = crate::parser::parse(source);
        assert!(parsed.errors.is_empty(), "parse errors: {:?}", parsed.errors);
        lower(&parsed.program.expect("parse failed"))
    }

    fn lower_ok(source: &str) -> Module {
        let result = lower_src(source);
        assert!(
            !result.has_errors(),
            "unexpected diagnostics: {:#?}",
            result.diagnostics
        );
        result.module
    }

    fn error_codes(source: &str) -> Vec<&'static str> {
        lower_src(source)
            .diagnostics
            .iter()
            .filter(|d| d.level == DiagLevel::Error)
            .filter_map(|d| d.code.map(|c| c.0))
            .collect()
    }

    #[test]
    fn variable_uses_share_binder_identity() {
        let m = lower_ok("def @main(%x: Tensor) { (%x, %x) }");
        let func = m.global("main").expect("main").func;
        let ExprKind::Function { params, body, .. } = &m.expr(func).kind else {
            panic!("expected function")
        };
        let ExprKind::Tuple(fields) = &m.expr(*body).kind else {
            panic!("expected tuple")
        };
        assert_eq!(fields, &vec![params[0], params[0]]);
        assert_eq!(m.ty(*body), &Type::Tuple(vec![Type::Tensor, Type::Tensor]));
    }

    #[test]
    fn globals_share_one_node() {
        let m = lower_ok(
            "def @id(%x: Tensor) -> Tensor { %x }\n\
             def @main(%x: Tensor) { @id(@id(%x)) }",
        );
        let id_node = m.global("id").expect("id").var;
        let uses = m
            .exprs
            .iter()
            .filter(|n| matches!(&n.kind, ExprKind::Call { callee, .. } if *callee == id_node))
            .count();
        assert_eq!(uses, 2);
        assert_eq!(m.ty(id_node), &Type::func(vec![Type::Tensor], Type::Tensor));
    }

    #[test]
    fn unannotated_global_is_typed_after_lowering() {
        let m = lower_ok(
            "def @f(%x: Tensor) { (%x, %x) }\n\
             def @main(%x: Tensor) { @f(%x).0 }",
        );
        let f = m.global("f").expect("f").var;
        assert!(m.ty(f).is_func());
    }

    #[test]
    fn forward_reference_needs_annotation() {
        let codes = error_codes(
            "def @main(%x: Tensor) { @f(%x) }\n\
             def @f(%x: Tensor) { %x }",
        );
        assert_eq!(codes, vec!["E0110"]);
    }

    #[test]
    fn forward_reference_with_annotation() {
        lower_ok(
            "def @main(%x: Tensor) { @f(%x) }\n\
             def @f(%x: Tensor) -> Tensor { %x }",
        );
    }

    #[test]
    fn operator_calls_get_call_ids_and_attrs() {
        let m = lower_ok(
            r#"def @main(%x: Tensor) {
                on_device(add(%x, %x), scope = "cuda:0", fixed = true)
            }"#,
        );
        let calls: Vec<_> = m
            .exprs
            .iter()
            .filter_map(|n| match &n.kind {
                ExprKind::Call { call, attrs, .. } => Some((*call, attrs.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0 .0, 0);
        assert_eq!(calls[1].0 .0, 1);
        assert!(calls[1].1.flag("fixed"));
        assert_eq!(
            calls[1].1.placement("scope").map(|p| p.to_string()),
            Some("cuda:0:?".to_string())
        );
    }

    #[test]
    fn device_copy_keeps_argument_shape() {
        let m = lower_ok(
            r#"def @main(%t: (Tensor, Tensor)) { device_copy(%t, src = "cuda", dst = "llvm") }"#,
        );
        let func = m.global("main").expect("main").func;
        assert_eq!(
            m.ty(func),
            &Type::func(
                vec![Type::Tuple(vec![Type::Tensor, Type::Tensor])],
                Type::Tuple(vec![Type::Tensor, Type::Tensor])
            )
        );
    }

    #[test]
    fn constructors_and_match() {
        let m = lower_ok(
            "type List { Cons(Tensor, List), Nil }\n\
             def @head(%l: List, %d: Tensor) -> Tensor { match (%l) { Cons(%h, %t) => %h, Nil => %d } }\n\
             def @main(%x: Tensor) { @head(Cons(%x, Nil), %x) }",
        );
        assert_eq!(m.adts.len(), 1);
        assert_eq!(m.adts[0].constructors.len(), 2);
        assert!(m
            .exprs
            .iter()
            .any(|n| matches!(&n.kind, ExprKind::Constructor(c) if c == "Nil")));
    }

    #[test]
    fn refs_and_lambdas() {
        let m = lower_ok(
            "def @main(%x: Tensor) {\n\
               let %r = ref(fn(%a: Tensor) { %a });\n\
               let %u = ref_write(%r, fn(%b: Tensor) { %x });\n\
               ref_read(%r)(%x)\n\
             }",
        );
        let func = m.global("main").expect("main").func;
        assert_eq!(m.ty(func), &Type::func(vec![Type::Tensor], Type::Tensor));
    }

    #[test]
    fn unknown_names() {
        assert_eq!(error_codes("def @main() { %y }"), vec!["E0100"]);
        assert_eq!(error_codes("def @main() { @g }"), vec!["E0101"]);
        assert_eq!(error_codes("def @main(%x: Foo) { %x }"), vec!["E0103"]);
    }

    #[test]
    fn duplicates() {
        assert_eq!(
            error_codes("def @f() { 1 }\ndef @f() { 2 }"),
            vec!["E0102"]
        );
        assert_eq!(
            error_codes("type A { X }\ntype A { Y }\ndef @main() { 1 }"),
            vec!["E0102"]
        );
    }

    #[test]
    fn operator_as_value() {
        assert_eq!(error_codes("def @main() { add }"), vec!["E0105"]);
    }

    #[test]
    fn shape_errors() {
        assert_eq!(error_codes("def @main(%x: Tensor) { %x(%x) }"), vec!["E0106"]);
        assert_eq!(
            error_codes("def @main(%f: fn(Tensor) -> Tensor, %x: Tensor) { %f(%x, %x) }"),
            vec!["E0107"]
        );
        assert_eq!(
            error_codes("def @main(%f: fn(Tensor) -> Tensor, %x: Tensor) { %f((%x, %x)) }"),
            vec!["E0108"]
        );
        assert_eq!(
            error_codes("def @main(%c: Tensor, %x: Tensor) { if (%c) { %x } else { (%x, %x) } }"),
            vec!["E0109"]
        );
        assert_eq!(
            error_codes("def @main(%x: Tensor) -> (Tensor, Tensor) { %x }"),
            vec!["E0110"]
        );
        assert_eq!(error_codes("def @main(%x: Tensor) { (%x, %x).2 }"), vec!["E0111"]);
        assert_eq!(error_codes("def @main(%x: Tensor) { ref_read(%x) }"), vec!["E0112"]);
    }

    #[test]
    fn annotation_errors() {
        assert_eq!(
            error_codes(r#"def @main(%x: Tensor @ "cuda:zero") { %x }"#),
            vec!["E0114"]
        );
        assert_eq!(
            error_codes(r#"def @main(%f: fn(Tensor) -> Tensor, %x: Tensor) { %f(%x, scope = "cuda") }"#),
            vec!["E0115"]
        );
    }

    #[test]
    fn duplicate_attribute_warns() {
        let result = lower_src(
            r#"def @main(%x: Tensor) { device_copy(%x, src = "cuda", src = "llvm", dst = "llvm") }"#,
        );
        assert!(!result.has_errors());
        assert_eq!(result.diagnostics.len(), 1);
        assert_eq!(result.diagnostics[0].code, Some(codes::W0100));
    }

    #[test]
    fn bad_patterns() {
        let src = "type A { X(Tensor) }\ntype B { Y }\n";
        assert_eq!(
            error_codes(&format!("{src}def @f(%a: A) {{ match (%a) {{ Y => 1 }} }}")),
            vec!["E0113"]
        );
        assert_eq!(
            error_codes(&format!("{src}def @f(%a: A) {{ match (%a) {{ X => 1 }} }}")),
            vec!["E0113"]
        );
        assert_eq!(
            error_codes(&format!("{src}def @f(%a: A) {{ match (%a) {{ Z(%q) => 1 }} }}")),
            vec!["E0104"]
        );
    }
}
