use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use dplan::config::{CompilationConfig, TargetConfig};
use dplan::intrinsics::IntrinsicTable;
use dplan::placement::Placement;
use dplan::*;

// Representative planning scenarios.

const COPY_PROGRAM: &str = r#"
def @main(%x: Tensor @ "cuda:1:global") {
  let %y = device_copy(%x, src = "cuda:1:global", dst = "cpu:0:");
  add(%y, %y)
}
"#;

const HIGHER_ORDER_PROGRAM: &str = r#"
def @apply(%f: fn(Tensor) -> Tensor, %x: Tensor) -> Tensor {
  %f(%x)
}

def @main(%a: Tensor @ "gpu:1:global") -> Tensor {
  let %sq = fn(%v: Tensor) { mul(%v, %v) };
  let %t = (%sq, %a);
  @apply(%t.0, %t.1)
}
"#;

const MEMORY_PROGRAM: &str = r#"
def @main(%x: Tensor @ "gpu:0:global") {
  let %s = shape_of(%x);
  let %st = alloc_storage(%s, %s, scope = "gpu:0:global");
  let %out = alloc_tensor(%st, %s, %s);
  let %r = invoke_op(%x, %x, %out);
  reshape_tensor(%r, %s)
}
"#;

fn scenarios() -> [(&'static str, &'static str); 3] {
    [
        ("copy", COPY_PROGRAM),
        ("higher_order", HIGHER_ORDER_PROGRAM),
        ("memory", MEMORY_PROGRAM),
    ]
}

/// A chain of `n_ops` primitives over two parameters, with a device copy
/// every tenth step so that placements actually change along the chain.
fn generate_chain(n_ops: usize) -> String {
    let mut src = String::from("def @main(%a: Tensor @ \"gpu:0:global\", %b: Tensor) {\n");
    let mut prev = "%a".to_string();
    for i in 0..n_ops {
        let op = ["add", "mul", "sub"][i % 3];
        src.push_str(&format!("  let %v{} = {}({}, %b);\n", i, op, prev));
        prev = format!("%v{}", i);
        if i % 10 == 9 {
            src.push_str(&format!(
                "  let %c{} = device_copy({}, src = \"gpu:0:global\", dst = \"gpu:0:global\");\n",
                i, prev
            ));
            prev = format!("%c{}", i);
        }
    }
    src.push_str(&format!("  {}\n}}\n", prev));
    src
}

fn bench_config() -> CompilationConfig {
    CompilationConfig::new(
        vec![
            TargetConfig {
                name: "llvm".into(),
                kind: Some("cpu".into()),
                devices: 1,
            },
            TargetConfig {
                name: "cuda".into(),
                kind: Some("gpu".into()),
                devices: 2,
            },
        ],
        Placement::new("llvm", 0, ""),
        Some(Placement::new("cuda", 0, "global")),
    )
    .expect("benchmark config must be valid")
}

fn lowered(source: &str) -> ir::Module {
    let parse_result = parser::parse(source);
    let ast = parse_result
        .program
        .as_ref()
        .expect("benchmark scenario must parse");
    let result = lower::lower(ast);
    assert!(!result.has_errors());
    result.module
}

// Full latency: parse -> lower -> analyze -> default -> extract.
fn bench_full_plan_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("plan/full_latency");
    let config = bench_config();
    let table = IntrinsicTable::standard();

    for (name, source) in scenarios() {
        group.bench_with_input(BenchmarkId::from_parameter(name), source, |b, source| {
            b.iter(|| {
                let module = lowered(black_box(source));
                let plan = planner::plan(&module, &config, &table).expect("scenario plans");
                black_box(plan.placements.len());
            });
        });
    }

    group.finish();
}

// Planning only (setup: parse + lower), scaling with program size.
fn bench_plan_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("plan/scaling");
    let config = bench_config();
    let table = IntrinsicTable::standard();

    for n_ops in [10_usize, 100, 1000] {
        let source = generate_chain(n_ops);
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}ops", n_ops)),
            &source,
            |b, source| {
                b.iter_batched(
                    || lowered(source),
                    |module| {
                        let plan =
                            planner::plan(black_box(&module), &config, &table).expect("chain plans");
                        black_box(plan.placements.len());
                    },
                    BatchSize::SmallInput,
                );
            },
        );
    }

    group.finish();
}

// Engine only: unify long chains of free domains into one pinned class.
fn bench_unify_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("domain/unify_chain");

    for n in [100_usize, 1000, 10000] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter(|| {
                let mut store = domain::DomainStore::new();
                let ids: Vec<_> = (0..n).map(|_| store.free(&ir::Type::Tensor)).collect();
                for pair in ids.windows(2) {
                    store.unify_or_null(pair[0], pair[1]).expect("free domains unify");
                }
                let pinned = store.make_first_order(Placement::new("cuda", 0, "global"));
                store.unify_or_null(ids[0], pinned).expect("chain accepts a pin");
                black_box(store.lookup(ids[n - 1]));
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_full_plan_latency,
    bench_plan_scaling,
    bench_unify_chain,
);
criterion_main!(benches);
