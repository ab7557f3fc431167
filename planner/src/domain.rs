// domain.rs — Placement domains and the unification engine
//
// A domain is either first-order (one placement, possibly partial) or
// higher-order (parameter domains followed by a result domain). Nodes live in
// an arena and never change once allocated; merging two domains only ever
// writes the equivalence registry, which maps a node one step closer to its
// class representative.
//
// Preconditions: default placements handed to the defaulting operations are
//   fully constrained.
// Postconditions: fully constrained first-order domains are interned, so two
//   of them are equal iff they are the same node. A failed merge leaves the
//   registry exactly as it was before the call.
// Failure modes: join/unify/collapse signal failure with `None`/`false`.
// Side effects: `tracing` events at debug (merges, defaults) and trace level.

use std::collections::HashMap;
use std::fmt::Write as _;

use tracing::{debug, trace, warn};

use crate::id::DomainId;
use crate::ir::Type;
use crate::placement::Placement;

// ── Domain nodes ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Domain {
    FirstOrder(Placement),
    /// Parameter domains then the result domain; never empty.
    HigherOrder(Vec<DomainId>),
}

impl Domain {
    pub fn is_higher_order(&self) -> bool {
        matches!(self, Domain::HigherOrder(_))
    }

    /// Number of parameters of a higher-order domain, 0 for first-order.
    pub fn arity(&self) -> usize {
        match self {
            Domain::FirstOrder(_) => 0,
            Domain::HigherOrder(children) => children.len().saturating_sub(1),
        }
    }
}

// ── Store ───────────────────────────────────────────────────────────────────

/// Owns every domain of one planning run, the interning table, and the
/// equivalence registry.
#[derive(Debug, Default)]
pub struct DomainStore {
    nodes: Vec<Domain>,
    /// Next step towards the representative; `None` for representatives.
    equiv: Vec<Option<DomainId>>,
    interned: HashMap<Placement, DomainId>,
    /// Previous registry values written inside the open transaction.
    trail: Vec<(DomainId, Option<DomainId>)>,
    txn_depth: u32,
}

impl DomainStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of allocated nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of distinct fully constrained placements seen so far.
    pub fn interned_count(&self) -> usize {
        self.interned.len()
    }

    /// The node itself, without following the registry.
    pub fn domain(&self, id: DomainId) -> &Domain {
        &self.nodes[id.index()]
    }

    fn alloc(&mut self, domain: Domain) -> DomainId {
        let id = DomainId(self.nodes.len() as u32);
        self.nodes.push(domain);
        self.equiv.push(None);
        id
    }

    // ── Construction ────────────────────────────────────────────────────────

    /// Interned when `placement` is fully constrained, fresh otherwise.
    pub fn make_first_order(&mut self, placement: Placement) -> DomainId {
        if placement.is_fully_constrained() {
            if let Some(&id) = self.interned.get(&placement) {
                return id;
            }
            let id = self.alloc(Domain::FirstOrder(placement.clone()));
            self.interned.insert(placement, id);
            return id;
        }
        self.alloc(Domain::FirstOrder(placement))
    }

    /// Always a fresh node.
    pub fn make_higher_order(&mut self, args_and_result: Vec<DomainId>) -> DomainId {
        debug_assert!(!args_and_result.is_empty());
        self.alloc(Domain::HigherOrder(args_and_result))
    }

    /// A domain mirroring the function structure of `ty`. Parameters get free
    /// domains of their own shape; `result` lands on the innermost result.
    pub fn make_domain(&mut self, ty: &Type, result: &Placement) -> DomainId {
        match ty {
            Type::Func(func) => {
                let mut children: Vec<DomainId> =
                    func.params.iter().map(|p| self.free(p)).collect();
                children.push(self.make_domain(&func.ret, result));
                self.make_higher_order(children)
            }
            _ => self.make_first_order(result.clone()),
        }
    }

    pub fn free(&mut self, ty: &Type) -> DomainId {
        self.make_domain(ty, &Placement::unconstrained())
    }

    // ── Equivalence registry ────────────────────────────────────────────────

    fn set_equiv(&mut self, node: DomainId, next: DomainId) {
        let slot = &mut self.equiv[node.index()];
        if *slot == Some(next) {
            return;
        }
        if self.txn_depth > 0 {
            self.trail.push((node, *slot));
        }
        *slot = Some(next);
    }

    /// Current representative, compressing the path behind it.
    pub fn lookup(&mut self, id: DomainId) -> DomainId {
        let root = self.representative(id);
        let mut cur = id;
        while let Some(next) = self.equiv[cur.index()] {
            if next == root {
                break;
            }
            self.set_equiv(cur, root);
            cur = next;
        }
        trace!(%id, %root, "lookup");
        root
    }

    /// Current representative, without compressing.
    pub fn representative(&self, id: DomainId) -> DomainId {
        let mut cur = id;
        while let Some(next) = self.equiv[cur.index()] {
            cur = next;
        }
        cur
    }

    /// Run `f` so that its registry writes are undone when it fails.
    fn transaction<T>(&mut self, f: impl FnOnce(&mut Self) -> Option<T>) -> Option<T> {
        let mark = self.trail.len();
        self.txn_depth += 1;
        let out = f(self);
        self.txn_depth -= 1;
        if out.is_none() {
            let undone = self.trail.len() - mark;
            while self.trail.len() > mark {
                if let Some((node, prev)) = self.trail.pop() {
                    self.equiv[node.index()] = prev;
                }
            }
            debug!(undone, "rolled back failed merge");
        }
        if self.txn_depth == 0 {
            self.trail.clear();
        }
        out
    }

    // ── Join ────────────────────────────────────────────────────────────────

    /// The most specific domain consistent with both sides, without merging
    /// them. Allocates the result when it differs from both inputs.
    pub fn join_or_null(&mut self, lhs: DomainId, rhs: DomainId) -> Option<DomainId> {
        let lhs = self.lookup(lhs);
        let rhs = self.lookup(rhs);
        if lhs == rhs {
            return Some(lhs);
        }
        match (self.domain(lhs).clone(), self.domain(rhs).clone()) {
            (Domain::FirstOrder(l), Domain::FirstOrder(r)) => {
                let joined = l.join(&r);
                trace!(%lhs, %rhs, ok = joined.is_some(), "join");
                let joined = joined?;
                Some(if joined == l {
                    lhs
                } else if joined == r {
                    rhs
                } else {
                    self.make_first_order(joined)
                })
            }
            (Domain::HigherOrder(l), Domain::HigherOrder(r)) if l.len() == r.len() => {
                let children = l
                    .iter()
                    .zip(&r)
                    .map(|(a, b)| self.join_or_null(*a, *b))
                    .collect::<Option<Vec<_>>>()?;
                Some(self.make_higher_order(children))
            }
            _ => None,
        }
    }

    // ── Unify ───────────────────────────────────────────────────────────────

    /// Merge the classes of `lhs` and `rhs`, returning the new
    /// representative, or `None` (with nothing merged) when they conflict.
    ///
    /// There is no occurs check. Merged domains always have identical shape
    /// trees, and a proper sub-domain is strictly shallower than its parent,
    /// so no domain can become equivalent to one of its own sub-domains.
    pub fn unify_or_null(&mut self, lhs: DomainId, rhs: DomainId) -> Option<DomainId> {
        let out = self.transaction(|s| s.unify_inner(lhs, rhs));
        match out {
            Some(rep) => debug!(%lhs, %rhs, %rep, "unified"),
            None => debug!(%lhs, %rhs, "unify failed"),
        }
        out
    }

    fn unify_inner(&mut self, lhs: DomainId, rhs: DomainId) -> Option<DomainId> {
        let lhs = self.lookup(lhs);
        let rhs = self.lookup(rhs);
        if lhs == rhs {
            return Some(lhs);
        }
        match (self.domain(lhs).clone(), self.domain(rhs).clone()) {
            (Domain::FirstOrder(l), Domain::FirstOrder(r)) => {
                let joined = l.join(&r)?;
                let rep = if joined == l {
                    lhs
                } else if joined == r {
                    rhs
                } else {
                    self.make_first_order(joined)
                };
                if rep != lhs {
                    self.set_equiv(lhs, rep);
                }
                if rep != rhs {
                    self.set_equiv(rhs, rep);
                }
                Some(rep)
            }
            (Domain::HigherOrder(l), Domain::HigherOrder(r)) if l.len() == r.len() => {
                for (a, b) in l.iter().zip(&r) {
                    self.unify_inner(*a, *b)?;
                }
                self.set_equiv(rhs, lhs);
                Some(lhs)
            }
            _ => None,
        }
    }

    // ── Collapse ────────────────────────────────────────────────────────────

    /// Force every parameter and result of `higher_order`, recursively, to
    /// share the class of `first_order`. A first-order `higher_order` is
    /// simply unified.
    pub fn collapse_or_false(&mut self, first_order: DomainId, higher_order: DomainId) -> bool {
        let ok = self
            .transaction(|s| s.collapse_inner(first_order, higher_order))
            .is_some();
        debug!(%first_order, %higher_order, ok, "collapse");
        ok
    }

    fn collapse_inner(&mut self, first_order: DomainId, higher_order: DomainId) -> Option<()> {
        let fo = self.lookup(first_order);
        if self.domain(fo).is_higher_order() {
            return None;
        }
        let ho = self.lookup(higher_order);
        match self.domain(ho).clone() {
            Domain::FirstOrder(_) => self.unify_inner(fo, ho).map(|_| ()),
            Domain::HigherOrder(children) => {
                for child in children {
                    self.collapse_inner(fo, child)?;
                }
                Some(())
            }
        }
    }

    /// Collapse when `rhs` is higher-order and `lhs` first-order, plain unify
    /// otherwise.
    pub fn unify_collapsed_or_false(&mut self, lhs: DomainId, rhs: DomainId) -> bool {
        let lhs_rep = self.lookup(lhs);
        let rhs_rep = self.lookup(rhs);
        if !self.domain(lhs_rep).is_higher_order() && self.domain(rhs_rep).is_higher_order() {
            self.collapse_or_false(lhs_rep, rhs_rep)
        } else {
            self.unify_or_null(lhs_rep, rhs_rep).is_some()
        }
    }

    // ── Defaulting ──────────────────────────────────────────────────────────

    /// Fill every unset field of every first-order leaf from `default`.
    pub fn set_default(&mut self, domain: DomainId, default: &Placement) {
        debug_assert!(default.is_fully_constrained());
        let domain = self.lookup(domain);
        match self.domain(domain).clone() {
            Domain::HigherOrder(children) => {
                for child in children {
                    self.set_default(child, default);
                }
            }
            Domain::FirstOrder(placement) => {
                if placement.is_fully_constrained() {
                    return;
                }
                let defaulted = placement.default_from(default);
                let filled = self.make_first_order(defaulted.clone());
                // `filled` refines `placement`, so this cannot conflict.
                match self.unify_or_null(domain, filled) {
                    Some(_) => debug!(%domain, placement = %defaulted, "defaulted"),
                    None => warn!(%domain, placement = %defaulted, "default does not refine domain"),
                }
            }
        }
    }

    /// Default the result to `default`, then default everything else to the
    /// (possibly just defaulted) result placement.
    pub fn set_result_default_then_params(&mut self, domain: DomainId, default: &Placement) {
        let domain = self.lookup(domain);
        if !self.domain(domain).is_higher_order() {
            self.set_default(domain, default);
            return;
        }
        let result = self.result_domain(domain);
        self.set_default(result, default);
        let result_placement = self.result_placement(domain);
        self.set_default(domain, &result_placement);
    }

    // ── Queries ─────────────────────────────────────────────────────────────

    /// Follow results through nested higher-order domains to a first-order one.
    pub fn result_domain(&mut self, domain: DomainId) -> DomainId {
        let mut cur = self.lookup(domain);
        while let Domain::HigherOrder(children) = self.domain(cur) {
            let last = children[children.len() - 1];
            cur = self.lookup(last);
        }
        cur
    }

    /// Placement of `result_domain(domain)`.
    pub fn result_placement(&mut self, domain: DomainId) -> Placement {
        let result = self.result_domain(domain);
        match self.domain(result) {
            Domain::FirstOrder(p) => p.clone(),
            Domain::HigherOrder(_) => Placement::unconstrained(),
        }
    }

    /// Every reachable first-order leaf is fully constrained.
    pub fn is_fully_constrained(&mut self, domain: DomainId) -> bool {
        let domain = self.lookup(domain);
        match self.domain(domain).clone() {
            Domain::FirstOrder(p) => p.is_fully_constrained(),
            Domain::HigherOrder(children) => {
                children.into_iter().all(|c| self.is_fully_constrained(c))
            }
        }
    }

    // ── Rendering ───────────────────────────────────────────────────────────

    /// One-line rendering of the resolved domain: `<target:device:scope>` for
    /// first-order, `fn(<..>, <..>):<..>` for higher-order.
    pub fn render(&self, domain: DomainId) -> String {
        let mut out = String::new();
        self.render_into(domain, &mut out);
        out
    }

    fn render_into(&self, domain: DomainId, out: &mut String) {
        match self.domain(self.representative(domain)) {
            Domain::FirstOrder(p) => {
                let _ = write!(out, "<{}>", p);
            }
            Domain::HigherOrder(children) => {
                let (result, params) = match children.split_last() {
                    Some(split) => split,
                    None => return,
                };
                out.push_str("fn(");
                for (i, param) in params.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    self.render_into(*param, out);
                }
                out.push_str("):");
                self.render_into(*result, out);
            }
        }
    }

    /// Every node with its representative, for debugging.
    pub fn render_all(&self) -> String {
        let mut out = String::new();
        for i in 0..self.nodes.len() {
            let id = DomainId(i as u32);
            let rep = self.representative(id);
            let _ = write!(out, "{} = {}", id, self.render(id));
            if rep != id {
                let _ = write!(out, "  (via {})", rep);
            }
            out.push('\n');
        }
        out
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
