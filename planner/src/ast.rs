// AST node types for placement IR (.dp) source files.
//
// Every node carries a `SimpleSpan` for error reporting in downstream phases.
// Names are unresolved here; `lower` resolves them and assigns identities.
//
// Preconditions: produced by the parser from a valid or partially-valid token stream.
// Postconditions: each node's span covers the source range of the construct.
// Failure modes: none (data-only module).
// Side effects: none.

use chumsky::span::SimpleSpan;

/// Byte-offset span (alias for chumsky's `SimpleSpan`).
pub type Span = SimpleSpan;

// ── Root ──

/// A complete program: type declarations and global function definitions.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub items: Vec<Item>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub kind: ItemKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ItemKind {
    Type(TypeDecl),
    Def(DefItem),
}

// ── type_decl: 'type' IDENT '{' ctor (',' ctor)* '}' ──

#[derive(Debug, Clone, PartialEq)]
pub struct TypeDecl {
    pub name: Ident,
    pub constructors: Vec<CtorDecl>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CtorDecl {
    pub name: Ident,
    pub fields: Vec<TypeExpr>,
    pub span: Span,
}

// ── def_item: 'def' GLOBAL fn_sig block ──

#[derive(Debug, Clone, PartialEq)]
pub struct DefItem {
    pub name: Ident,
    pub func: FnExpr,
}

/// Function parameters, optional result annotation, and body.
#[derive(Debug, Clone, PartialEq)]
pub struct FnExpr {
    pub params: Vec<Param>,
    pub ret: Option<TypeExpr>,
    /// `-> T @ "placement"` pins the function result.
    pub ret_placement: Option<PlacementLit>,
    pub body: Box<Expr>,
}

/// `%name: T` with an optional `@ "placement"` pin.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: Ident,
    pub ty: TypeExpr,
    pub placement: Option<PlacementLit>,
    pub span: Span,
}

/// A placement literal as written, e.g. `"cuda:0:global"`.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacementLit {
    pub text: String,
    pub span: Span,
}

// ── Types ──

#[derive(Debug, Clone, PartialEq)]
pub struct TypeExpr {
    pub kind: TypeExprKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypeExprKind {
    /// `Tensor` or a declared ADT name.
    Named(Ident),
    Tuple(Vec<TypeExpr>),
    Func(Vec<TypeExpr>, Box<TypeExpr>),
    Ref(Box<TypeExpr>),
}

// ── Expressions ──

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Local(Ident),
    Global(Ident),
    Number(f64),
    /// Operator or constructor name (resolved during lowering).
    Name(Ident),
    Tuple(Vec<Expr>),
    Proj(Box<Expr>, usize),
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
        attrs: Vec<Attr>,
    },
    Let {
        name: Ident,
        ty: Option<TypeExpr>,
        value: Box<Expr>,
        body: Box<Expr>,
    },
    If {
        cond: Box<Expr>,
        then_branch: Box<Expr>,
        else_branch: Box<Expr>,
    },
    Fn(FnExpr),
    RefCreate(Box<Expr>),
    RefRead(Box<Expr>),
    RefWrite(Box<Expr>, Box<Expr>),
    Match {
        data: Box<Expr>,
        clauses: Vec<MatchClause>,
    },
}

/// `name = value` inside a call's argument list.
#[derive(Debug, Clone, PartialEq)]
pub struct Attr {
    pub name: Ident,
    pub value: AttrValue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Placement(PlacementLit),
    Bool(bool, Span),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchClause {
    pub pattern: Pattern,
    pub body: Expr,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Pattern {
    Wildcard(Span),
    Ctor { name: Ident, binders: Vec<Ident> },
}

// ── Leaf types ──

#[derive(Debug, Clone, PartialEq)]
pub struct Ident {
    pub name: String,
    pub span: Span,
}
