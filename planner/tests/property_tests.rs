// Property-based tests for domain engine invariants.
//
// Three categories:
// 1. Placement algebra: join symmetry, defaulting, textual round-trip
// 2. Domain store: lookup idempotence, interning, unify outcome symmetry
//    (first- and higher-order), collapse totality, rollback of failed merges
// 3. Planner: generated programs plan without conflict and every placement
//    is fully constrained
//
// Uses proptest with explicit configuration to prevent CI flakiness.

use dplan::config::CompilationConfig;
use dplan::domain::{Domain, DomainStore};
use dplan::id::DomainId;
use dplan::intrinsics::IntrinsicTable;
use dplan::ir::Type;
use dplan::placement::Placement;
use proptest::prelude::*;

// ── Generators ──────────────────────────────────────────────────────────────

fn arb_placement() -> impl Strategy<Value = Placement> {
    let target = prop_oneof![Just(None), Just(Some("llvm")), Just(Some("cuda"))];
    let device = prop_oneof![Just(None), Just(Some(0u32)), Just(Some(1u32))];
    let scope = prop_oneof![Just(None), Just(Some("")), Just(Some("global"))];
    (target, device, scope).prop_map(|(t, d, s)| Placement {
        target: t.map(str::to_string),
        device: d,
        memory_scope: s.map(str::to_string),
    })
}

fn arb_full_placement() -> impl Strategy<Value = Placement> {
    (
        prop_oneof![Just("llvm"), Just("cuda")],
        0u32..2,
        prop_oneof![Just(""), Just("global")],
    )
        .prop_map(|(t, d, s)| Placement::new(t, d, s))
}

/// A shape of bounded depth: tensors, tuples and functions.
fn arb_type() -> impl Strategy<Value = Type> {
    let leaf = Just(Type::Tensor);
    leaf.prop_recursive(3, 12, 3, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..3).prop_map(Type::Tuple),
            (prop::collection::vec(inner.clone(), 0..3), inner)
                .prop_map(|(params, ret)| Type::func(params, ret)),
        ]
    })
}

fn placement_of(store: &mut DomainStore, d: DomainId) -> Placement {
    let rep = store.lookup(d);
    match store.domain(rep) {
        Domain::FirstOrder(p) => p.clone(),
        Domain::HigherOrder(_) => panic!("expected first-order domain"),
    }
}

// ── Placement algebra ───────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 100,
        max_shrink_iters: 200,
        .. ProptestConfig::default()
    })]

    #[test]
    fn join_is_symmetric(a in arb_placement(), b in arb_placement()) {
        prop_assert_eq!(a.join(&b), b.join(&a));
    }

    #[test]
    fn join_refines_both_sides(a in arb_placement(), b in arb_placement()) {
        if let Some(j) = a.join(&b) {
            prop_assert!(j.refines(&a));
            prop_assert!(j.refines(&b));
        }
    }

    #[test]
    fn default_from_keeps_set_fields(a in arb_placement(), d in arb_full_placement()) {
        let filled = a.default_from(&d);
        prop_assert!(filled.is_fully_constrained());
        prop_assert!(filled.refines(&a));
    }

    #[test]
    fn placement_text_round_trips(a in arb_placement()) {
        let text = a.to_string();
        let back: Placement = text.parse().expect("rendered placement parses");
        prop_assert_eq!(back, a);
    }
}

// ── Domain store ────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 100,
        max_shrink_iters: 200,
        .. ProptestConfig::default()
    })]

    #[test]
    fn lookup_is_idempotent(a in arb_placement(), b in arb_placement(), c in arb_placement()) {
        let mut store = DomainStore::new();
        let da = store.make_first_order(a);
        let db = store.make_first_order(b);
        let dc = store.make_first_order(c);
        let _ = store.unify_or_null(da, db);
        let _ = store.unify_or_null(db, dc);
        for d in [da, db, dc] {
            let once = store.lookup(d);
            prop_assert_eq!(store.lookup(once), once);
        }
    }

    #[test]
    fn fully_constrained_placements_are_interned(a in arb_full_placement()) {
        let mut store = DomainStore::new();
        let x = store.make_first_order(a.clone());
        let y = store.make_first_order(a);
        prop_assert_eq!(x, y);
    }

    #[test]
    fn join_or_null_is_symmetric(a in arb_placement(), b in arb_placement()) {
        let mut store = DomainStore::new();
        let da = store.make_first_order(a);
        let db = store.make_first_order(b);
        let ab = store.join_or_null(da, db).map(|d| placement_of(&mut store, d));
        let ba = store.join_or_null(db, da).map(|d| placement_of(&mut store, d));
        prop_assert_eq!(ab, ba);
    }

    #[test]
    fn unify_outcome_is_symmetric(a in arb_placement(), b in arb_placement()) {
        let mut left = DomainStore::new();
        let la = left.make_first_order(a.clone());
        let lb = left.make_first_order(b.clone());
        let forward = left.unify_or_null(la, lb).is_some();

        let mut right = DomainStore::new();
        let ra = right.make_first_order(a);
        let rb = right.make_first_order(b);
        let backward = right.unify_or_null(rb, ra).is_some();

        prop_assert_eq!(forward, backward);
        if forward {
            prop_assert_eq!(left.lookup(la), left.lookup(lb));
            prop_assert_eq!(right.lookup(ra), right.lookup(rb));
            prop_assert_eq!(placement_of(&mut left, la), placement_of(&mut right, ra));
        }
    }

    #[test]
    fn unify_outcome_is_symmetric_for_functions(
        pairs in prop::collection::vec((arb_placement(), arb_placement()), 1..4),
    ) {
        let build = |store: &mut DomainStore, pick_left: bool| {
            let children: Vec<DomainId> = pairs
                .iter()
                .map(|(l, r)| store.make_first_order(if pick_left { l.clone() } else { r.clone() }))
                .collect();
            store.make_higher_order(children)
        };

        let mut left = DomainStore::new();
        let la = build(&mut left, true);
        let lb = build(&mut left, false);
        let forward = left.unify_or_null(la, lb).is_some();

        let mut right = DomainStore::new();
        let ra = build(&mut right, true);
        let rb = build(&mut right, false);
        let backward = right.unify_or_null(rb, ra).is_some();

        prop_assert_eq!(forward, backward);
        if forward {
            prop_assert_eq!(left.lookup(la), left.lookup(lb));
            prop_assert_eq!(left.render(la), right.render(ra));
        } else {
            // A failed merge leaves both sides as they were.
            prop_assert_ne!(left.lookup(la), left.lookup(lb));
            prop_assert_ne!(right.lookup(ra), right.lookup(rb));
        }
    }

    #[test]
    fn collapse_is_total_over_sub_domains(
        f in arb_placement(),
        parts in prop::collection::vec(arb_placement(), 1..4),
    ) {
        // Expected outcome: every part joins with f, in sequence.
        let mut expected = Some(f.clone());
        for p in &parts {
            expected = expected.and_then(|acc| acc.join(p));
        }

        let mut store = DomainStore::new();
        let first = store.make_first_order(f);
        let children: Vec<_> = parts.into_iter().map(|p| store.make_first_order(p)).collect();
        let higher = store.make_higher_order(children.clone());
        let ok = store.collapse_or_false(first, higher);

        prop_assert_eq!(ok, expected.is_some());
        if ok {
            let rep = store.lookup(first);
            for c in children {
                prop_assert_eq!(store.lookup(c), rep);
            }
        }
    }

    #[test]
    fn failed_unify_leaves_no_trace(a in arb_full_placement(), b in arb_full_placement()) {
        prop_assume!(a != b);
        let mut store = DomainStore::new();
        // lhs = fn(?):a, rhs = fn(a):b. The parameter merges before the
        // result fails.
        let param = store.free(&Type::Tensor);
        let lhs_result = store.make_first_order(a.clone());
        let lhs = store.make_higher_order(vec![param, lhs_result]);
        let rhs_param = store.make_first_order(a);
        let rhs_result = store.make_first_order(b.clone());
        let rhs = store.make_higher_order(vec![rhs_param, rhs_result]);

        let before = store.render(lhs);
        prop_assert!(store.unify_or_null(lhs, rhs).is_none());
        prop_assert_eq!(store.render(lhs), before);
        let other = store.make_first_order(b);
        prop_assert!(store.unify_or_null(param, other).is_some());
    }

    #[test]
    fn defaulting_closes_all_gaps(ty in arb_type(), d in arb_full_placement()) {
        let mut store = DomainStore::new();
        let domain = store.free(&ty);
        store.set_default(domain, &d);
        prop_assert!(store.is_fully_constrained(domain));
    }

    #[test]
    fn result_default_then_params_follows_result(
        ty_params in prop::collection::vec(Just(Type::Tensor), 0..4),
        pinned in arb_full_placement(),
        fallback in arb_full_placement(),
    ) {
        let ty = Type::func(ty_params.clone(), Type::Tensor);
        let mut store = DomainStore::new();
        let domain = store.free(&ty);
        let result = store.result_domain(domain);
        let fixed = store.make_first_order(pinned.clone());
        prop_assert!(store.unify_or_null(result, fixed).is_some());
        store.set_result_default_then_params(domain, &fallback);
        let Domain::HigherOrder(children) = store.domain(store.representative(domain)).clone() else {
            panic!("function domain must stay higher-order");
        };
        for c in children {
            prop_assert_eq!(placement_of(&mut store, c), pinned.clone());
        }
    }
}

// ── Planner ─────────────────────────────────────────────────────────────────

/// A straight-line program: a chain of binary primitives over parameters,
/// some pinned, with an optional copy to the host in the middle.
fn arb_program() -> impl Strategy<Value = String> {
    let ops = prop::collection::vec(
        (prop_oneof![Just("add"), Just("mul"), Just("sub")], 0usize..3, any::<bool>()),
        1..6,
    );
    (ops, any::<bool>()).prop_map(|(ops, pin_first)| {
        let pin = if pin_first { " @ \"cpu:0:\"" } else { "" };
        let mut src = format!("def @main(%a: Tensor{}, %b: Tensor, %c: Tensor) {{\n", pin);
        let mut prev = "%a".to_string();
        for (i, (op, operand, copy)) in ops.iter().enumerate() {
            let other = ["%a", "%b", "%c"][*operand];
            src.push_str(&format!("  let %t{} = {}({}, {});\n", i, op, prev, other));
            prev = format!("%t{}", i);
            if *copy {
                src.push_str(&format!(
                    "  let %h{i} = device_copy({prev}, src = \"cpu:0:\", dst = \"cpu:0:\");\n"
                ));
                prev = format!("%h{}", i);
            }
        }
        src.push_str(&format!("  {}\n}}\n", prev));
        src
    })
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 50,
        max_shrink_iters: 100,
        .. ProptestConfig::default()
    })]

    #[test]
    fn generated_programs_plan_fully(src in arb_program()) {
        let parsed = dplan::parser::parse(&src);
        prop_assert!(parsed.errors.is_empty(), "parse errors: {:?}\n{}", parsed.errors, src);
        let program = parsed.program.expect("program");
        let lowered = dplan::lower::lower(&program);
        prop_assert!(!lowered.has_errors(), "{:?}\n{}", lowered.diagnostics, src);

        let config = CompilationConfig::default();
        let table = IntrinsicTable::standard();
        let plan = dplan::planner::plan(&lowered.module, &config, &table)
            .unwrap_or_else(|e| panic!("{e}\n{src}"));
        for (id, placement) in &plan.placements {
            prop_assert!(placement.is_fully_constrained(), "{} unplaced in\n{}", id, src);
        }
        prop_assert_eq!(plan.callee_domains.len(), lowered.module.call_count());
    }
}
