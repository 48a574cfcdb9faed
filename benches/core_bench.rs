//! Benchmarks for kitsmith core operations.
//!
//! Run with: cargo bench
//!
//! Results include 95% confidence intervals via Criterion.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use kitsmith::core::types::{Step, ToolKind};
use kitsmith::core::{condition, graph, hasher, parser, scheduler, template};
use serde_json::json;
use std::path::Path;

/// `width` independent chains of `depth` steps each.
fn steps(width: usize, depth: usize) -> Vec<Step> {
    let mut out = Vec::with_capacity(width * depth);
    for w in 0..width {
        for d in 0..depth {
            let name = format!("s{}_{}", w, d);
            let mut step = Step::new(&name, ToolKind::Shell);
            if d > 0 {
                step.depends_on = vec![format!("s{}_{}", w, d - 1)];
            }
            step.parallel = w % 2 == 0;
            out.push(step);
        }
    }
    out
}

fn bench_recipe_key(c: &mut Criterion) {
    let mut group = c.benchmark_group("recipe_key");
    for size in [256, 4096, 65536] {
        let source: String = "x".repeat(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &source, |b, source| {
            b.iter(|| black_box(hasher::recipe_key(Path::new("recipes/a.yaml"), black_box(source))));
        });
    }
    group.finish();
}

fn bench_recipe_parse(c: &mut Criterion) {
    let yaml = r#"
name: bench-recipe
variables:
  name: { type: string, required: true }
  port: { type: number, default: 3000 }
steps:
  - {name: dirs, tool: ensure-dirs, paths: ["src/{{ name }}"]}
  - {name: model, tool: template, dependsOn: [dirs], parallel: true, content: "x", to: "a"}
  - {name: routes, tool: template, dependsOn: [dirs], parallel: true, content: "y", to: "b"}
  - {name: deps, tool: install, packages: [zod], retries: 2}
  - {name: fmt, tool: shell, command: "npm run fmt", dependsOn: [model, routes, deps]}
"#;
    c.bench_function("recipe_parse", |b| {
        b.iter(|| parser::parse_recipe(black_box(yaml)).unwrap());
    });
}

fn bench_graph_and_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("graph_plan");
    for (width, depth) in [(4, 4), (16, 16), (64, 8)] {
        let list = steps(width, depth);
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}x{}", width, depth)),
            &list,
            |b, list| {
                b.iter(|| {
                    let g = graph::build(black_box(list)).into_result().unwrap();
                    let plan = scheduler::plan(&g);
                    for batch in &plan.batches {
                        black_box(scheduler::concurrency_groups(batch, |n| {
                            n.starts_with("s0") || n.starts_with("s2")
                        }));
                    }
                    black_box(plan)
                });
            },
        );
    }
    group.finish();
}

fn bench_condition(c: &mut Criterion) {
    let ctx = json!({
        "database": "postgres",
        "features": {"auth": true, "count": 3},
        "steps": {"schema": {"status": "completed"}},
    });
    c.bench_function("condition_evaluate", |b| {
        b.iter(|| {
            condition::evaluate(
                black_box("steps.schema.status == 'completed' && (database == 'postgres' || features.count > 2)"),
                &ctx,
            )
            .unwrap()
        });
    });
}

fn bench_interpolate(c: &mut Criterion) {
    let vars = json!({"name": "user profile", "module": "accounts"});
    let text = "export class {{ name | pascal }} {}\n// {{ module }}/{{ name | kebab }}.ts\n".repeat(20);
    c.bench_function("interpolate", |b| {
        b.iter(|| template::interpolate(black_box(&text), &vars).unwrap());
    });
}

criterion_group!(
    benches,
    bench_recipe_key,
    bench_recipe_parse,
    bench_graph_and_plan,
    bench_condition,
    bench_interpolate,
);
criterion_main!(benches);
