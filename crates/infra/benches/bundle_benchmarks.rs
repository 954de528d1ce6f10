use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use chrono::Utc;
use lcms_core::EntityId;
use lcms_curriculum::{ArtifactKind, ContentType, ResultRecord, ResultSlot};
use lcms_infra::jobs::dedup::{find_active_request, outstanding_for};
use lcms_infra::jobs::{InMemoryJobQueue, JobKind, JobOptions, JobQueue, RequestId};
use lcms_infra::{InMemoryLocks, InMemoryResultBackend, ResultStore};
use std::sync::Arc;
use std::time::Duration;

/// Queue holding `requests` unit bundles, each with `children` document jobs.
fn populated_queue(requests: usize, children: usize) -> (InMemoryJobQueue, Vec<(EntityId, RequestId)>) {
    let queue = InMemoryJobQueue::new();
    let mut bundles = Vec::with_capacity(requests);
    for _ in 0..requests {
        let unit = EntityId::new();
        let id = queue
            .enqueue(JobKind::UnitBundlePdf, unit, JobOptions::new().with_dependants(true))
            .unwrap();
        let request = RequestId::from(id);
        for _ in 0..children {
            queue
                .enqueue(JobKind::DocumentPdf, EntityId::new(), JobOptions::new().with_request(request))
                .unwrap();
        }
        bundles.push((unit, request));
    }
    (queue, bundles)
}

fn bench_dedup_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("dedup_scan");

    for requests in [10usize, 100, 1000] {
        let (queue, bundles) = populated_queue(requests, 8);
        let (unit, request) = bundles[bundles.len() / 2];
        group.throughput(Throughput::Elements((requests * 9) as u64));

        group.bench_with_input(BenchmarkId::new("find_active_request", requests), &requests, |b, _| {
            b.iter(|| find_active_request(&queue, JobKind::UnitBundlePdf, black_box(unit)).unwrap());
        });

        let kinds = [JobKind::DocumentPdf, JobKind::MaterialPdf, JobKind::UnitBundlePdf];
        group.bench_with_input(BenchmarkId::new("outstanding_for", requests), &requests, |b, _| {
            b.iter(|| {
                outstanding_for(&queue, &kinds, black_box(request), lcms_infra::jobs::JobId::new()).unwrap()
            });
        });
    }

    group.finish();
}

fn bench_result_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("result_merge");
    let store = ResultStore::new(
        Arc::new(InMemoryResultBackend::new()),
        Arc::new(InMemoryLocks::new()),
        Duration::from_secs(1),
    );
    let entity = EntityId::new();
    let content_types = [ContentType::UnitBundle, ContentType::Tm, ContentType::Sm, ContentType::Full];

    group.bench_function("write_record_alternating_kinds", |b| {
        let mut n = 0usize;
        b.iter(|| {
            n += 1;
            let kind = if n % 2 == 0 { ArtifactKind::Pdf } else { ArtifactKind::Gdoc };
            let record = ResultRecord::generated("https://storage.test/x.pdf", 4, Utc::now());
            store
                .write_record(entity, ResultSlot::Links, content_types[n % 4], kind, black_box(&record))
                .unwrap();
        });
    });

    group.finish();
}

criterion_group!(benches, bench_dedup_scan, bench_result_merge);
criterion_main!(benches);
