// id.rs — Stable identifiers for IR nodes, call sites, and domains
//
// Expressions are keyed by identity, never by structure: two textually equal
// subexpressions get distinct ExprIds, and every use of a variable shares the
// ExprId of its binder. ExprIds are arena positions; CallIds come from the
// allocator below. Both are assigned in source order during lowering so that
// plans and renderings are deterministic.

use std::fmt;

/// Stable identifier for an expression node in the IR arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExprId(pub u32);

/// Stable identifier for a call site.
///
/// Callee domains are keyed by call site rather than by operator, since the
/// same primitive may run at different placements at different calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallId(pub u32);

/// Index of a domain node in a `DomainStore` arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DomainId(pub u32);

impl ExprId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl DomainId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ExprId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "d{}", self.0)
    }
}

/// Allocator for stable IDs. Produces monotonically increasing IDs in
/// allocation (source) order, ensuring deterministic assignment.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next_call: u32,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc_call(&mut self) -> CallId {
        let id = CallId(self.next_call);
        self.next_call += 1;
        id
    }

    pub fn call_count(&self) -> u32 {
        self.next_call
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_allocated_in_order() {
        let mut alloc = IdAllocator::new();
        assert_eq!(alloc.alloc_call(), CallId(0));
        assert_eq!(alloc.alloc_call(), CallId(1));
        assert_eq!(alloc.call_count(), 2);
    }

    #[test]
    fn display_prefixes() {
        assert_eq!(ExprId(3).to_string(), "e3");
        assert_eq!(CallId(4).to_string(), "c4");
        assert_eq!(DomainId(5).to_string(), "d5");
    }
}
