use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use sandcastle_core::ProjectId;
use sandcastle_infra::jobs::payload::DockerComposeUp;
use sandcastle_infra::jobs::{InMemoryJobStore, JobQueue, JobStore, JobType, NewJob};

const LEASE: Duration = Duration::from_secs(300);

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn compose_up(n: usize) -> DockerComposeUp {
    DockerComposeUp::new(ProjectId::parse(format!("bench-{n}")).unwrap())
}

fn bench_enqueue(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("enqueue");
    group.throughput(Throughput::Elements(1));

    // Typed path: validate + serialize + insert.
    group.bench_function("typed_payload", |b| {
        let queue = JobQueue::new(InMemoryJobStore::arc());
        let payload = compose_up(0);
        b.to_async(&rt).iter(|| async {
            queue.enqueue(black_box(&payload)).await.unwrap();
        });
    });

    group.bench_function("raw_store", |b| {
        let store = InMemoryJobStore::new();
        let payload = serde_json::json!({ "projectId": "bench-0" });
        b.to_async(&rt).iter(|| async {
            store
                .enqueue(NewJob::new(JobType::DockerComposeUp, black_box(payload.clone())))
                .await
                .unwrap();
        });
    });

    group.finish();
}

fn bench_job_lifecycle(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("job_lifecycle");
    group.throughput(Throughput::Elements(1));

    group.bench_function("enqueue_claim_complete", |b| {
        let store = InMemoryJobStore::arc();
        let queue = JobQueue::new(store.clone());
        let payload = compose_up(0);
        b.to_async(&rt).iter(|| async {
            queue.enqueue(&payload).await.unwrap();
            let job = store.claim_next("bench", LEASE).await.unwrap().unwrap();
            assert!(store.complete(job.id, "bench").await.unwrap());
        });
    });

    group.finish();
}

/// Claim latency as the backlog of queued jobs grows.
fn bench_claim_with_backlog(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("claim_with_backlog");

    for backlog in [10usize, 100, 1_000, 10_000] {
        let store: Arc<InMemoryJobStore> = InMemoryJobStore::arc();
        let queue = JobQueue::new(store.clone());
        rt.block_on(async {
            for n in 0..backlog {
                queue.enqueue(&compose_up(n)).await.unwrap();
            }
        });

        group.bench_with_input(BenchmarkId::from_parameter(backlog), &backlog, |b, _| {
            b.to_async(&rt).iter(|| async {
                let job = store.claim_next("bench", LEASE).await.unwrap().unwrap();
                // Back to the queue so the backlog stays the same size.
                assert!(store.release(job.id, "bench").await.unwrap());
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_enqueue,
    bench_job_lifecycle,
    bench_claim_with_backlog
);
criterion_main!(benches);
