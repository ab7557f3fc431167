// ir.rs — Arena IR consumed by the placement planner
//
// Expressions live in one arena and are addressed by `ExprId`. Identity, not
// structure, is what the planner keys on: every use of a variable shares the
// binder's `ExprId`, and every global has exactly one `Global` node shared by
// all references to it. Each node carries its synthesized shape `Type`, which
// the planner mirrors when building domains.
//
// Preconditions: produced by `lower` from a checked AST.
// Postconditions: every `ExprId` stored in a node indexes `Module::exprs`;
//   every call owns a distinct `CallId`.
// Failure modes: none (data-only module).
// Side effects: none.

use std::collections::BTreeMap;
use std::fmt;

use crate::ast::Span;
use crate::id::{CallId, ExprId};
use crate::placement::Placement;

// ── Types ───────────────────────────────────────────────────────────────────

/// Shape of an expression. Only the function/non-function distinction
/// matters to placement; the rest is kept for checking and display.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Tensor,
    Tuple(Vec<Type>),
    Func(FuncType),
    Ref(Box<Type>),
    Adt(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FuncType {
    pub params: Vec<Type>,
    pub ret: Box<Type>,
}

impl Type {
    pub fn unit() -> Self {
        Type::Tuple(Vec::new())
    }

    pub fn func(params: Vec<Type>, ret: Type) -> Self {
        Type::Func(FuncType {
            params,
            ret: Box::new(ret),
        })
    }

    pub fn as_func(&self) -> Option<&FuncType> {
        match self {
            Type::Func(f) => Some(f),
            _ => None,
        }
    }

    pub fn is_func(&self) -> bool {
        matches!(self, Type::Func(_))
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Tensor => write!(f, "Tensor"),
            Type::Tuple(fields) => {
                write!(f, "(")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", field)?;
                }
                write!(f, ")")
            }
            Type::Func(func) => {
                write!(f, "fn(")?;
                for (i, param) in func.params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", param)?;
                }
                write!(f, ") -> {}", func.ret)
            }
            Type::Ref(inner) => write!(f, "Ref[{}]", inner),
            Type::Adt(name) => write!(f, "{}", name),
        }
    }
}

// ── Expressions ─────────────────────────────────────────────────────────────

/// Placement and flag attributes attached to a call site.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallAttrs {
    pub placements: BTreeMap<String, Placement>,
    pub flags: BTreeMap<String, bool>,
}

impl CallAttrs {
    pub fn placement(&self, name: &str) -> Option<&Placement> {
        self.placements.get(name)
    }

    pub fn flag(&self, name: &str) -> bool {
        self.flags.get(name).copied().unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.placements.is_empty() && self.flags.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    /// A bound variable: function parameter, let binder or pattern binder.
    /// Parameters may carry a placement pin.
    Var {
        name: String,
        placement: Option<Placement>,
    },
    /// The shared reference node for a global function.
    Global { name: String },
    /// A tensor constant.
    Constant(f64),
    /// A primitive operator, only ever in callee position.
    Op(String),
    /// An ADT constructor, only ever in callee position.
    Constructor(String),
    Tuple(Vec<ExprId>),
    Proj { tuple: ExprId, index: usize },
    Call {
        call: CallId,
        callee: ExprId,
        args: Vec<ExprId>,
        attrs: CallAttrs,
    },
    Let {
        var: ExprId,
        value: ExprId,
        body: ExprId,
    },
    If {
        cond: ExprId,
        then_branch: ExprId,
        else_branch: ExprId,
    },
    Function {
        params: Vec<ExprId>,
        body: ExprId,
        result_placement: Option<Placement>,
    },
    RefCreate(ExprId),
    RefRead(ExprId),
    RefWrite { reference: ExprId, value: ExprId },
    Match { data: ExprId, clauses: Vec<Clause> },
}

impl ExprKind {
    /// Direct subexpressions in evaluation order. Binders are not children.
    pub fn children(&self) -> Vec<ExprId> {
        match self {
            ExprKind::Var { .. }
            | ExprKind::Global { .. }
            | ExprKind::Constant(_)
            | ExprKind::Op(_)
            | ExprKind::Constructor(_) => Vec::new(),
            ExprKind::Tuple(fields) => fields.clone(),
            ExprKind::Proj { tuple, .. } => vec![*tuple],
            ExprKind::Call { callee, args, .. } => {
                let mut out = vec![*callee];
                out.extend(args.iter().copied());
                out
            }
            ExprKind::Let { value, body, .. } => vec![*value, *body],
            ExprKind::If {
                cond,
                then_branch,
                else_branch,
            } => vec![*cond, *then_branch, *else_branch],
            ExprKind::Function { body, .. } => vec![*body],
            ExprKind::RefCreate(value) => vec![*value],
            ExprKind::RefRead(reference) => vec![*reference],
            ExprKind::RefWrite { reference, value } => vec![*reference, *value],
            ExprKind::Match { data, clauses } => {
                let mut out = vec![*data];
                out.extend(clauses.iter().map(|c| c.body));
                out
            }
        }
    }

    /// Operators and constructors only appear in callee position and have
    /// no placement of their own.
    pub fn is_callee_only(&self) -> bool {
        matches!(self, ExprKind::Op(_) | ExprKind::Constructor(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    pub pattern: Pattern,
    pub body: ExprId,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Pattern {
    Wildcard,
    Constructor { name: String, binders: Vec<ExprId> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExprNode {
    pub kind: ExprKind,
    pub ty: Type,
    pub span: Span,
}

// ── Module ──────────────────────────────────────────────────────────────────

/// A global function definition. `var` is the shared `Global` node.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalDef {
    pub name: String,
    pub var: ExprId,
    pub func: ExprId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdtDef {
    pub name: String,
    pub constructors: Vec<CtorDef>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CtorDef {
    pub name: String,
    pub fields: Vec<Type>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Module {
    pub exprs: Vec<ExprNode>,
    pub globals: Vec<GlobalDef>,
    pub adts: Vec<AdtDef>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a node and return its identity.
    pub fn push(&mut self, kind: ExprKind, ty: Type, span: Span) -> ExprId {
        let id = ExprId(self.exprs.len() as u32);
        self.exprs.push(ExprNode { kind, ty, span });
        id
    }

    pub fn expr(&self, id: ExprId) -> &ExprNode {
        &self.exprs[id.index()]
    }

    pub fn ty(&self, id: ExprId) -> &Type {
        &self.exprs[id.index()].ty
    }

    pub fn span(&self, id: ExprId) -> Span {
        self.exprs[id.index()].span
    }

    pub fn len(&self) -> usize {
        self.exprs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exprs.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = ExprId> {
        (0..self.exprs.len() as u32).map(ExprId)
    }

    pub fn global(&self, name: &str) -> Option<&GlobalDef> {
        self.globals.iter().find(|g| g.name == name)
    }

    /// Number of call sites.
    pub fn call_count(&self) -> usize {
        self.exprs
            .iter()
            .filter(|n| matches!(n.kind, ExprKind::Call { .. }))
            .count()
    }

    /// Short human-readable description of a node, for diagnostics.
    pub fn label(&self, id: ExprId) -> String {
        match &self.expr(id).kind {
            ExprKind::Var { name, .. } => format!("%{}", name),
            ExprKind::Global { name } => format!("@{}", name),
            ExprKind::Constant(v) => format!("constant {}", v),
            ExprKind::Op(name) => format!("operator {}", name),
            ExprKind::Constructor(name) => format!("constructor {}", name),
            ExprKind::Tuple(fields) => format!("{}-tuple", fields.len()),
            ExprKind::Proj { index, .. } => format!("projection .{}", index),
            ExprKind::Call { callee, .. } => match &self.expr(*callee).kind {
                ExprKind::Op(name) | ExprKind::Constructor(name) => format!("call to {}", name),
                _ => format!("call to {}", self.label(*callee)),
            },
            ExprKind::Let { var, .. } => format!("let {}", self.label(*var)),
            ExprKind::If { .. } => "if".to_string(),
            ExprKind::Function { params, .. } => format!("function of {} params", params.len()),
            ExprKind::RefCreate(_) => "ref".to_string(),
            ExprKind::RefRead(_) => "ref_read".to_string(),
            ExprKind::RefWrite { .. } => "ref_write".to_string(),
            ExprKind::Match { .. } => "match".to_string(),
        }
    }
}

fn write_ids(f: &mut fmt::Formatter<'_>, ids: &[ExprId]) -> fmt::Result {
    for (i, id) in ids.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", id)?;
    }
    Ok(())
}

/// Arena dump: one line per node, then the globals.
impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for adt in &self.adts {
            write!(f, "type {} {{ ", adt.name)?;
            for (i, ctor) in adt.constructors.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", ctor.name)?;
                if !ctor.fields.is_empty() {
                    write!(f, "{}", Type::Tuple(ctor.fields.clone()))?;
                }
            }
            writeln!(f, " }}")?;
        }
        for id in self.ids() {
            let node = self.expr(id);
            write!(f, "{}: {} = ", id, node.ty)?;
            match &node.kind {
                ExprKind::Var { name, placement } => {
                    write!(f, "%{}", name)?;
                    if let Some(p) = placement {
                        write!(f, " @ {}", p)?;
                    }
                }
                ExprKind::Global { name } => write!(f, "@{}", name)?,
                ExprKind::Constant(v) => write!(f, "{}", v)?,
                ExprKind::Op(name) => write!(f, "op {}", name)?,
                ExprKind::Constructor(name) => write!(f, "ctor {}", name)?,
                ExprKind::Tuple(fields) => {
                    write!(f, "(")?;
                    write_ids(f, fields)?;
                    write!(f, ")")?;
                }
                ExprKind::Proj { tuple, index } => write!(f, "{}.{}", tuple, index)?,
                ExprKind::Call {
                    call,
                    callee,
                    args,
                    attrs,
                } => {
                    write!(f, "{} {}(", call, callee)?;
                    write_ids(f, args)?;
                    for (name, p) in &attrs.placements {
                        write!(f, ", {}={}", name, p)?;
                    }
                    for (name, b) in &attrs.flags {
                        write!(f, ", {}={}", name, b)?;
                    }
                    write!(f, ")")?;
                }
                ExprKind::Let { var, value, body } => {
                    write!(f, "let {} = {}; {}", var, value, body)?
                }
                ExprKind::If {
                    cond,
                    then_branch,
                    else_branch,
                } => write!(f, "if {} then {} else {}", cond, then_branch, else_branch)?,
                ExprKind::Function {
                    params,
                    body,
                    result_placement,
                } => {
                    write!(f, "fn(")?;
                    write_ids(f, params)?;
                    write!(f, ") {{ {} }}", body)?;
                    if let Some(p) = result_placement {
                        write!(f, " @ {}", p)?;
                    }
                }
                ExprKind::RefCreate(value) => write!(f, "ref({})", value)?,
                ExprKind::RefRead(reference) => write!(f, "ref_read({})", reference)?,
                ExprKind::RefWrite { reference, value } => {
                    write!(f, "ref_write({}, {})", reference, value)?
                }
                ExprKind::Match { data, clauses } => {
                    write!(f, "match {} {{ ", data)?;
                    for (i, clause) in clauses.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        match &clause.pattern {
                            Pattern::Wildcard => write!(f, "_")?,
                            Pattern::Constructor { name, binders } => {
                                write!(f, "{}(", name)?;
                                write_ids(f, binders)?;
                                write!(f, ")")?;
                            }
                        }
                        write!(f, " => {}", clause.body)?;
                    }
                    write!(f, " }}")?;
                }
            }
            writeln!(f)?;
        }
        for global in &self.globals {
            writeln!(f, "@{} = {}", global.name, global.func)?;
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
