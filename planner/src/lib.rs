// dplan — device placement planner
//
// Library root. Front-end (lexer, parser, ast), IR (ir, lower), the domain
// engine (placement, domain, binding, intrinsics, config) and the planner
// passes (planner, pass, pipeline).

pub mod ast;
pub mod binding;
pub mod config;
pub mod diag;
pub mod domain;
pub mod id;
pub mod intrinsics;
pub mod ir;
pub mod lexer;
pub mod lower;
pub mod parser;
pub mod pass;
pub mod pipeline;
pub mod placement;
pub mod planner;
