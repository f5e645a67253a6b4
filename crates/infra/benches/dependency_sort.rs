use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;

use fhirmat_infra::resolver::sort_by_dependency;
use fhirmat_infra::resources::{DeclaredResource, Predicate, ResourceDefinition, SqlParams};

/// `n` resources where each references the one before it, catalogued in
/// reverse so every scan can only move one resource.
fn reversed_chain(n: usize) -> Vec<Arc<dyn ResourceDefinition>> {
    (0..n)
        .rev()
        .map(|i| {
            let mut builder = DeclaredResource::builder(format!("R{i}")).upstream(format!("r{i}_rows"));
            if i > 0 {
                builder = builder.reference("parent", "parent_id", format!("R{}", i - 1));
            }
            Arc::new(builder.build()) as Arc<dyn ResourceDefinition>
        })
        .collect()
}

/// `n` resources all referencing one shared root.
fn star(n: usize) -> Vec<Arc<dyn ResourceDefinition>> {
    let mut defs: Vec<Arc<dyn ResourceDefinition>> = (1..n)
        .map(|i| {
            Arc::new(
                DeclaredResource::builder(format!("R{i}"))
                    .upstream(format!("r{i}_rows"))
                    .reference("subject", "root_id", "Root")
                    .build(),
            ) as Arc<dyn ResourceDefinition>
        })
        .collect();
    defs.push(Arc::new(DeclaredResource::builder("Root").upstream("roots").build()));
    defs
}

fn bench_dependency_sort(c: &mut Criterion) {
    let mut group = c.benchmark_group("dependency_sort");

    for size in [10usize, 50, 150] {
        group.throughput(Throughput::Elements(size as u64));

        let chain = reversed_chain(size);
        group.bench_with_input(BenchmarkId::new("reversed_chain", size), &chain, |b, defs| {
            b.iter(|| sort_by_dependency(black_box(defs.clone())))
        });

        let star = star(size);
        group.bench_with_input(BenchmarkId::new("star", size), &star, |b, defs| {
            b.iter(|| sort_by_dependency(black_box(defs.clone())))
        });
    }

    group.finish();
}

fn bench_predicate(c: &mut Criterion) {
    let filter = Predicate::and(vec![
        Predicate::is_null("deleted_at"),
        Predicate::or(vec![
            Predicate::eq("status", "active"),
            Predicate::one_of("kind", vec!["inpatient".into(), "outpatient".into()]),
        ]),
    ]);
    let row = serde_json::json!({"deleted_at": null, "status": "inactive", "kind": "outpatient"});

    let mut group = c.benchmark_group("predicate");
    group.bench_function("matches", |b| b.iter(|| black_box(&filter).matches(black_box(&row))));
    group.bench_function("to_sql", |b| {
        b.iter(|| {
            let mut params = SqlParams::default();
            black_box(&filter).to_sql("upstream", &mut params)
        })
    });
    group.finish();
}

criterion_group!(benches, bench_dependency_sort, bench_predicate);
criterion_main!(benches);
