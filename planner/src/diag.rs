// diag.rs — Unified diagnostics model
//
// Provides the shared diagnostic types used by the front-end, lowering and
// the placement planner, plus the table of stable diagnostic codes.
//
// Preconditions: none (types only).
// Postconditions: none (types only).
// Failure modes: none.
// Side effects: none.

use std::fmt;

use crate::ast::Span;

// ── Diagnostic code ──────────────────────────────────────────────────────

/// A stable diagnostic code (e.g., `E0001`, `W0300`).
///
/// Codes are `&'static str` constants defined in the `codes` module.
/// Once assigned, a code must never be reassigned to a different meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiagCode(pub &'static str);

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Severity level ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagLevel {
    Error,
    Warning,
}

// ── Related span ─────────────────────────────────────────────────────────

/// A secondary source location providing context for a diagnostic.
#[derive(Debug, Clone)]
pub struct RelatedSpan {
    pub span: Span,
    pub label: String,
}

// ── Cause record ─────────────────────────────────────────────────────────

/// One link in a cause chain explaining a propagated constraint failure.
#[derive(Debug, Clone)]
pub struct CauseRecord {
    pub message: String,
    pub span: Option<Span>,
}

// ── Diagnostic ───────────────────────────────────────────────────────────

/// A compiler diagnostic emitted by any phase.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub code: Option<DiagCode>,
    pub level: DiagLevel,
    pub span: Span,
    pub message: String,
    pub hint: Option<String>,
    pub related_spans: Vec<RelatedSpan>,
    pub cause_chain: Vec<CauseRecord>,
}

impl Diagnostic {
    /// Create a new diagnostic with no code, hint, related spans, or causes.
    pub fn new(level: DiagLevel, span: Span, message: impl Into<String>) -> Self {
        Self {
            code: None,
            level,
            span,
            message: message.into(),
            hint: None,
            related_spans: Vec::new(),
            cause_chain: Vec::new(),
        }
    }

    /// Attach a stable diagnostic code.
    pub fn with_code(mut self, code: DiagCode) -> Self {
        self.code = Some(code);
        self
    }

    /// Attach a remediation hint.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Attach a related span.
    pub fn with_related(mut self, span: Span, label: impl Into<String>) -> Self {
        self.related_spans.push(RelatedSpan {
            span,
            label: label.into(),
        });
        self
    }

    /// Attach a cause record to the chain.
    pub fn with_cause(mut self, message: impl Into<String>, span: Option<Span>) -> Self {
        self.cause_chain.push(CauseRecord {
            message: message.into(),
            span,
        });
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            DiagLevel::Error => "error",
            DiagLevel::Warning => "warning",
        };
        if let Some(code) = &self.code {
            write!(f, "{}[{}]: {}", level, code, self.message)?;
        } else {
            write!(f, "{}: {}", level, self.message)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\n  hint: {}", hint)?;
        }
        Ok(())
    }
}

// ── Source locations ─────────────────────────────────────────────────────

/// 1-based line and column of a byte offset in `source`.
pub fn line_col(source: &str, offset: usize) -> (usize, usize) {
    let offset = offset.min(source.len());
    let before = &source[..offset];
    let line = before.matches('\n').count() + 1;
    let col = match before.rfind('\n') {
        Some(nl) => before[nl + 1..].chars().count() + 1,
        None => before.chars().count() + 1,
    };
    (line, col)
}

// ── Stable codes ─────────────────────────────────────────────────────────

pub mod codes {
    use super::DiagCode;

    // Front-end
    pub const E0001: DiagCode = DiagCode("E0001"); // syntax error

    // Lowering: names
    pub const E0100: DiagCode = DiagCode("E0100"); // unknown local variable
    pub const E0101: DiagCode = DiagCode("E0101"); // unknown global
    pub const E0102: DiagCode = DiagCode("E0102"); // duplicate global or type
    pub const E0103: DiagCode = DiagCode("E0103"); // unknown type
    pub const E0104: DiagCode = DiagCode("E0104"); // unknown constructor
    pub const E0105: DiagCode = DiagCode("E0105"); // operator or constructor used as a value

    // Lowering: shapes
    pub const E0106: DiagCode = DiagCode("E0106"); // callee is not a function
    pub const E0107: DiagCode = DiagCode("E0107"); // call arity mismatch
    pub const E0108: DiagCode = DiagCode("E0108"); // argument shape mismatch
    pub const E0109: DiagCode = DiagCode("E0109"); // branch or clause shape mismatch
    pub const E0110: DiagCode = DiagCode("E0110"); // annotation mismatch
    pub const E0111: DiagCode = DiagCode("E0111"); // bad tuple projection
    pub const E0112: DiagCode = DiagCode("E0112"); // not a reference
    pub const E0113: DiagCode = DiagCode("E0113"); // bad match pattern

    // Lowering: annotations
    pub const E0114: DiagCode = DiagCode("E0114"); // malformed placement literal
    pub const E0115: DiagCode = DiagCode("E0115"); // attribute on a non-operator call
    pub const W0100: DiagCode = DiagCode("W0100"); // duplicate attribute

    // Planning
    pub const E0200: DiagCode = DiagCode("E0200"); // conflicting placements
    pub const E0201: DiagCode = DiagCode("E0201"); // special operator misuse
    pub const E0202: DiagCode = DiagCode("E0202"); // placement rejected by configuration
}
