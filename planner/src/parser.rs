// Parser for placement IR (.dp) source files.
//
// Parses a token stream (from the lexer) into an AST. Uses chumsky
// combinators.
//
// Grammar (informal):
//   program  := item*
//   item     := 'type' IDENT '{' ctor (',' ctor)* '}'
//             | 'def' GLOBAL '(' params ')' ret? '{' expr '}'
//   ret      := '->' type ('@' STRING)?
//   expr     := postfix ( '(' args ')' | '.' NUMBER )*   over the atoms below
//   atom     := 'let' LOCAL (':' type)? '=' expr ';' expr
//             | 'if' '(' expr ')' '{' expr '}' 'else' '{' expr '}'
//             | 'match' '(' expr ')' '{' clause (',' clause)* '}'
//             | 'fn' '(' params ')' ret? '{' expr '}'
//             | 'ref' '(' expr ')' | 'ref_read' '(' expr ')'
//             | 'ref_write' '(' expr ',' expr ')'
//             | '(' ')' | '(' expr ')' | '(' expr ',' expr (',' expr)* ')'
//             | LOCAL | GLOBAL | NUMBER | IDENT
//
// Preconditions: input is a valid token stream from `lexer::lex()`.
// Postconditions: returns an AST plus any parse errors (non-fatal).
// Failure modes: syntax errors produce `Rich` diagnostics.
// Side effects: none.

use chumsky::input::{Stream, ValueInput};
use chumsky::prelude::*;
use chumsky::span::SimpleSpan;

use crate::ast::*;
use crate::lexer::Token;

/// Result of parsing: AST plus any errors.
#[derive(Debug)]
pub struct ParseResult {
    pub program: Option<Program>,
    pub errors: Vec<Rich<'static, Token, SimpleSpan>>,
}

/// Parse a placement IR source string. Lexes then parses.
pub fn parse(source: &str) -> ParseResult {
    let lex_result = crate::lexer::lex(source);
    let len = source.len();

    // Convert lexer output to chumsky stream.
    let token_iter = lex_result.tokens.into_iter().map(|(tok, span)| {
        let cspan: SimpleSpan = (span.start..span.end).into();
        (tok, cspan)
    });
    let eoi: SimpleSpan = (len..len).into();
    let stream = Stream::from_iter(token_iter).map(eoi, |(t, s): (_, _)| (t, s));

    let parser = program_parser(source);
    let (program, parse_errors) = parser.parse(stream).into_output_errors();

    // Merge lex errors + parse errors.
    let mut all_errors: Vec<Rich<'static, Token, SimpleSpan>> = lex_result
        .errors
        .into_iter()
        .map(|e| {
            let span: SimpleSpan = (e.span.start..e.span.end).into();
            Rich::custom(span, e.message)
        })
        .collect();
    all_errors.extend(parse_errors.into_iter().map(|e| e.into_owned()));

    ParseResult {
        program,
        errors: all_errors,
    }
}

/// A postfix operation applied to an atom.
enum Postfix {
    Call(Vec<CallArg>, SimpleSpan),
    Proj(usize, SimpleSpan),
}

enum CallArg {
    Expr(Expr),
    Attr(Attr),
}

// ── Main parser builder ──
//
// All grammar rules are built inside `program_parser` so that the `source`
// reference is captured once and shared by all combinators.

fn program_parser<'tokens, 'src: 'tokens, I>(
    source: &'src str,
) -> impl Parser<'tokens, I, Program, extra::Err<Rich<'tokens, Token, SimpleSpan>>> + 'src
where
    'tokens: 'src,
    I: ValueInput<'tokens, Token = Token, Span = SimpleSpan>,
{
    // ── Names ──

    let ident = just(Token::Ident).map_with(move |_, e| {
        let span: SimpleSpan = e.span();
        Ident {
            name: source[span.start()..span.end()].to_string(),
            span,
        }
    });

    let local = select! {
        Token::Local(name) = e => Ident { name, span: e.span() },
    };

    let global = select! {
        Token::Global(name) = e => Ident { name, span: e.span() },
    };

    let placement_lit = select! {
        Token::StringLit(text) = e => PlacementLit { text, span: e.span() },
    };

    // ── Types ──

    let ty = recursive(|ty| {
        let named = ident
            .clone()
            .then(
                ty.clone()
                    .delimited_by(just(Token::LBracket), just(Token::RBracket))
                    .or_not(),
            )
            .try_map(|(name, arg): (Ident, Option<TypeExpr>), span| match arg {
                None => Ok(TypeExpr {
                    span,
                    kind: TypeExprKind::Named(name),
                }),
                Some(inner) if name.name == "Ref" => Ok(TypeExpr {
                    span,
                    kind: TypeExprKind::Ref(Box::new(inner)),
                }),
                Some(_) => Err(Rich::custom(
                    span,
                    format!("type '{}' takes no type argument", name.name),
                )),
            });

        let tuple = ty
            .clone()
            .separated_by(just(Token::Comma))
            .allow_trailing()
            .collect::<Vec<_>>()
            .delimited_by(just(Token::LParen), just(Token::RParen))
            .map_with(|fields, e| TypeExpr {
                kind: TypeExprKind::Tuple(fields),
                span: e.span(),
            });

        let func = just(Token::Fn)
            .ignore_then(
                ty.clone()
                    .separated_by(just(Token::Comma))
                    .allow_trailing()
                    .collect::<Vec<_>>()
                    .delimited_by(just(Token::LParen), just(Token::RParen)),
            )
            .then_ignore(just(Token::Arrow))
            .then(ty.clone())
            .map_with(|(params, ret), e| TypeExpr {
                kind: TypeExprKind::Func(params, Box::new(ret)),
                span: e.span(),
            });

        choice((func, tuple, named))
    });

    // ── Function signature pieces ──

    let param = local
        .clone()
        .then_ignore(just(Token::Colon))
        .then(ty.clone())
        .then(just(Token::At).ignore_then(placement_lit.clone()).or_not())
        .map_with(|((name, ty), placement), e| Param {
            name,
            ty,
            placement,
            span: e.span(),
        });

    let params = param
        .separated_by(just(Token::Comma))
        .allow_trailing()
        .collect::<Vec<_>>()
        .delimited_by(just(Token::LParen), just(Token::RParen));

    let ret = just(Token::Arrow)
        .ignore_then(ty.clone())
        .then(just(Token::At).ignore_then(placement_lit.clone()).or_not());

    // ── Expressions ──

    let expr = recursive(|expr| {
        let block = expr
            .clone()
            .delimited_by(just(Token::LBrace), just(Token::RBrace));
        let parens = expr
            .clone()
            .delimited_by(just(Token::LParen), just(Token::RParen));

        let let_expr = just(Token::Let)
            .ignore_then(local.clone())
            .then(just(Token::Colon).ignore_then(ty.clone()).or_not())
            .then_ignore(just(Token::Equals))
            .then(expr.clone())
            .then_ignore(just(Token::Semi))
            .then(expr.clone())
            .map_with(|(((name, ty), value), body), e| Expr {
                kind: ExprKind::Let {
                    name,
                    ty,
                    value: Box::new(value),
                    body: Box::new(body),
                },
                span: e.span(),
            });

        let if_expr = just(Token::If)
            .ignore_then(parens.clone())
            .then(block.clone())
            .then_ignore(just(Token::Else))
            .then(block.clone())
            .map_with(|((cond, then_branch), else_branch), e| Expr {
                kind: ExprKind::If {
                    cond: Box::new(cond),
                    then_branch: Box::new(then_branch),
                    else_branch: Box::new(else_branch),
                },
                span: e.span(),
            });

        let pattern = ident
            .clone()
            .then(
                local
                    .clone()
                    .separated_by(just(Token::Comma))
                    .allow_trailing()
                    .collect::<Vec<_>>()
                    .delimited_by(just(Token::LParen), just(Token::RParen))
                    .or_not(),
            )
            .map(|(name, binders)| match binders {
                None if name.name == "_" => Pattern::Wildcard(name.span),
                binders => Pattern::Ctor {
                    name,
                    binders: binders.unwrap_or_default(),
                },
            });

        let clause = pattern
            .then_ignore(just(Token::FatArrow))
            .then(expr.clone())
            .map_with(|(pattern, body), e| MatchClause {
                pattern,
                body,
                span: e.span(),
            });

        let match_expr = just(Token::Match)
            .ignore_then(parens.clone())
            .then(
                clause
                    .separated_by(just(Token::Comma))
                    .allow_trailing()
                    .at_least(1)
                    .collect::<Vec<_>>()
                    .delimited_by(just(Token::LBrace), just(Token::RBrace)),
            )
            .map_with(|(data, clauses), e| Expr {
                kind: ExprKind::Match {
                    data: Box::new(data),
                    clauses,
                },
                span: e.span(),
            });

        let fn_expr = just(Token::Fn)
            .ignore_then(params.clone())
            .then(ret.clone().or_not())
            .then(block.clone())
            .map_with(|((params, ret), body), e| {
                let (ret, ret_placement) = match ret {
                    Some((ty, placement)) => (Some(ty), placement),
                    None => (None, None),
                };
                Expr {
                    kind: ExprKind::Fn(FnExpr {
                        params,
                        ret,
                        ret_placement,
                        body: Box::new(body),
                    }),
                    span: e.span(),
                }
            });

        let ref_create = just(Token::Ref)
            .ignore_then(parens.clone())
            .map_with(|value, e| Expr {
                kind: ExprKind::RefCreate(Box::new(value)),
                span: e.span(),
            });

        let ref_read = just(Token::RefRead)
            .ignore_then(parens.clone())
            .map_with(|reference, e| Expr {
                kind: ExprKind::RefRead(Box::new(reference)),
                span: e.span(),
            });

        let ref_write = just(Token::RefWrite)
            .ignore_then(
                expr.clone()
                    .then_ignore(just(Token::Comma))
                    .then(expr.clone())
                    .delimited_by(just(Token::LParen), just(Token::RParen)),
            )
            .map_with(|(reference, value), e| Expr {
                kind: ExprKind::RefWrite(Box::new(reference), Box::new(value)),
                span: e.span(),
            });

        // `()` is the unit tuple, `(e)` is grouping, `(a, b, ...)` a tuple.
        let paren_or_tuple = expr
            .clone()
            .separated_by(just(Token::Comma))
            .collect::<Vec<_>>()
            .delimited_by(just(Token::LParen), just(Token::RParen))
            .map_with(|mut items: Vec<Expr>, e| {
                if items.len() == 1 {
                    if let Some(inner) = items.pop() {
                        return inner;
                    }
                }
                Expr {
                    kind: ExprKind::Tuple(items),
                    span: e.span(),
                }
            });

        let leaf = select! {
            Token::Local(name) = e => Expr {
                kind: ExprKind::Local(Ident { name, span: e.span() }),
                span: e.span(),
            },
            Token::Global(name) = e => Expr {
                kind: ExprKind::Global(Ident { name, span: e.span() }),
                span: e.span(),
            },
            Token::Number(n) = e => Expr {
                kind: ExprKind::Number(n),
                span: e.span(),
            },
        }
        .or(ident.clone().map(|id| Expr {
            span: id.span,
            kind: ExprKind::Name(id),
        }));

        let atom = choice((
            let_expr,
            if_expr,
            match_expr,
            fn_expr,
            ref_create,
            ref_read,
            ref_write,
            paren_or_tuple,
            leaf,
        ))
        .boxed();

        // ── Postfix: calls and projections ──

        let attr_value = placement_lit
            .clone()
            .map(AttrValue::Placement)
            .or(select! {
                Token::True = e => AttrValue::Bool(true, e.span()),
                Token::False = e => AttrValue::Bool(false, e.span()),
            });

        let attr = ident
            .clone()
            .then_ignore(just(Token::Equals))
            .then(attr_value)
            .map(|(name, value)| CallArg::Attr(Attr { name, value }));

        let call_arg = attr.or(expr.clone().map(CallArg::Expr));

        let call_args = call_arg
            .separated_by(just(Token::Comma))
            .allow_trailing()
            .collect::<Vec<_>>()
            .delimited_by(just(Token::LParen), just(Token::RParen))
            .map_with(|args, e| Postfix::Call(args, e.span()));

        let proj_index = select! {
            Token::Number(n) if n >= 0.0 && n.fract() == 0.0 && n <= u32::MAX as f64 => n as usize,
        };

        let proj = just(Token::Dot)
            .ignore_then(proj_index)
            .map_with(|index, e| Postfix::Proj(index, e.span()));

        atom.then(call_args.or(proj).repeated().collect::<Vec<_>>())
            .map(|(head, ops)| {
                ops.into_iter().fold(head, |lhs, op| {
                    let start = lhs.span.start();
                    match op {
                        Postfix::Call(args, span) => {
                            let mut exprs = Vec::new();
                            let mut attrs = Vec::new();
                            for arg in args {
                                match arg {
                                    CallArg::Expr(e) => exprs.push(e),
                                    CallArg::Attr(a) => attrs.push(a),
                                }
                            }
                            Expr {
                                kind: ExprKind::Call {
                                    callee: Box::new(lhs),
                                    args: exprs,
                                    attrs,
                                },
                                span: (start..span.end()).into(),
                            }
                        }
                        Postfix::Proj(index, span) => Expr {
                            kind: ExprKind::Proj(Box::new(lhs), index),
                            span: (start..span.end()).into(),
                        },
                    }
                })
            })
    });

    // ── Items ──

    let ctor_decl = ident
        .clone()
        .then(
            ty.clone()
                .separated_by(just(Token::Comma))
                .allow_trailing()
                .collect::<Vec<_>>()
                .delimited_by(just(Token::LParen), just(Token::RParen))
                .or_not(),
        )
        .map_with(|(name, fields), e| CtorDecl {
            name,
            fields: fields.unwrap_or_default(),
            span: e.span(),
        });

    let type_decl = just(Token::Type)
        .ignore_then(ident.clone())
        .then(
            ctor_decl
                .separated_by(just(Token::Comma))
                .allow_trailing()
                .at_least(1)
                .collect::<Vec<_>>()
                .delimited_by(just(Token::LBrace), just(Token::RBrace)),
        )
        .map(|(name, constructors)| ItemKind::Type(TypeDecl { name, constructors }));

    let def_item = just(Token::Def)
        .ignore_then(global)
        .then(params)
        .then(ret.or_not())
        .then(
            expr.clone()
                .delimited_by(just(Token::LBrace), just(Token::RBrace)),
        )
        .map(|(((name, params), ret), body)| {
            let (ret, ret_placement) = match ret {
                Some((ty, placement)) => (Some(ty), placement),
                None => (None, None),
            };
            ItemKind::Def(DefItem {
                name,
                func: FnExpr {
                    params,
                    ret,
                    ret_placement,
                    body: Box::new(body),
                },
            })
        });

    let item = type_decl.or(def_item).map_with(|kind, e| Item {
        kind,
        span: e.span(),
    });

    item.repeated()
        .collect::<Vec<_>>()
        .map_with(|items, e| Program {
            items,
            span: e.span(),
        })
}

// ── Tests ──
