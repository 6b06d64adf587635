//! Benchmarks for the provider hot paths.
//!
//! Benchmarks cover:
//! - Durable queue push/reserve/complete and retry handling
//! - Token cache hits and LRU churn
//! - Protocol line encoding and decoding
//! - Update cycles enqueuing capped sub-queues

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use document_provider::core::{
    decode_line, encode_line, run_update_cycle, Delta, DeltaGenerator, DurableQueue, Integration, JobEventKind,
    JobOutcome, QueueJob, RetryPolicy, SubQueues, TaskContext, TaskError, TaskJob, TaskSink, TaskWorker, Token,
    TokenCache, TokenStore, UpdateJob, WorkerMessage,
};
use document_provider::infra::{InMemoryDurableQueue, InMemoryTokenStore};
use serde_json::{json, Value};
use tokio::runtime::Runtime;

// ============================================================================
// Doubles
// ============================================================================

struct Listing(usize);

#[async_trait]
impl DeltaGenerator for Listing {
    async fn retrieve(&self, _data: Value, _cursor: Option<Value>, queues: SubQueues) -> Result<Delta, TaskError> {
        for i in 0..self.0 {
            queues.push("additions", json!({"identifier": i, "title": "bench"}))?;
        }
        Ok(Delta {
            cursor: Some(json!(self.0)),
            service_data: None,
        })
    }
}

struct Noop;

#[async_trait]
impl TaskWorker for Noop {
    async fn process(&self, _ctx: TaskContext) -> Result<(), TaskError> {
        Ok(())
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn policy() -> RetryPolicy {
    RetryPolicy {
        attempts: 3,
        delay_ms: 0,
        exponential: false,
        timeout_ms: 60_000,
    }
}

fn task(i: u64) -> QueueJob {
    QueueJob::Task(TaskJob {
        access_token: "bench-token".into(),
        task_type: "additions".into(),
        payload: json!({"identifier": i, "path": format!("/docs/{i}.txt")}),
    })
}

// ============================================================================
// Queue Benchmarks
// ============================================================================

fn bench_queue_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_push_reserve_complete");

    for size in [100u64, 1_000, 5_000] {
        group.throughput(Throughput::Elements(size));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.to_async(Runtime::new().unwrap()).iter(|| async move {
                let queue = InMemoryDurableQueue::new();
                for i in 0..size {
                    queue.push("bench:alice", task(i), policy()).await.unwrap();
                }
                while let Some(job) = queue.reserve("bench:alice").await.unwrap() {
                    queue.complete("bench:alice", job.id).await.unwrap();
                }
                black_box(queue.depth("bench:alice").await.unwrap());
            });
        });
    }
    group.finish();
}

fn bench_queue_retries(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_fail_and_retry");

    for size in [100u64, 1_000] {
        group.throughput(Throughput::Elements(size));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.to_async(Runtime::new().unwrap()).iter(|| async move {
                let queue = InMemoryDurableQueue::new();
                for i in 0..size {
                    queue.push("bench:bob", task(i), policy()).await.unwrap();
                }
                // Every job fails until its attempts run out.
                while let Some(job) = queue.reserve("bench:bob").await.unwrap() {
                    black_box(queue.fail("bench:bob", job.id, true).await.unwrap());
                }
            });
        });
    }
    group.finish();
}

// ============================================================================
// Cache Benchmarks
// ============================================================================

fn bench_token_cache(c: &mut Criterion) {
    let mut group = c.benchmark_group("token_cache");

    group.bench_function("hit", |b| {
        let cache = TokenCache::new(50, Duration::from_secs(3600));
        for i in 0..50 {
            cache.put_token(&Token::new(format!("tok-{i}"), format!("account-{i}"), json!({})));
        }
        b.iter(|| {
            for i in 0..50 {
                black_box(cache.get(&format!("tok-{i}")));
            }
        });
    });

    group.bench_function("lru_churn", |b| {
        let cache = TokenCache::new(50, Duration::from_secs(3600));
        let tokens: Vec<Token> = (0..200)
            .map(|i| Token::new(format!("tok-{i}"), format!("account-{i}"), json!({})))
            .collect();
        b.iter(|| {
            for token in &tokens {
                cache.put_token(token);
            }
            black_box(cache.len());
        });
    });
    group.finish();
}

// ============================================================================
// Protocol Benchmarks
// ============================================================================

fn bench_protocol_lines(c: &mut Criterion) {
    let mut group = c.benchmark_group("protocol_lines");

    let state = encode_line(&WorkerMessage::State { processing: true }).unwrap();
    group.bench_function("decode_state", |b| {
        b.iter(|| black_box(decode_line::<WorkerMessage>(black_box(&state)).unwrap()));
    });

    let rt = Runtime::new().unwrap();
    let outcome = rt.block_on(async {
        let queue = InMemoryDurableQueue::new();
        queue.push("bench:carol", task(7), policy()).await.unwrap();
        let job = queue.reserve("bench:carol").await.unwrap().unwrap();
        WorkerMessage::Job(JobOutcome {
            event: JobEventKind::Completed,
            job: job.summary(),
            error: None,
            will_retry: false,
        })
    });
    group.bench_function("encode_job_outcome", |b| {
        b.iter(|| black_box(encode_line(black_box(&outcome)).unwrap()));
    });
    group.finish();
}

// ============================================================================
// Update Cycle Benchmarks
// ============================================================================

fn bench_update_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("update_cycle");

    for (listed, cap) in [(100usize, 100usize), (1_000, 100), (1_000, 1_000)] {
        group.throughput(Throughput::Elements(listed as u64));
        group.bench_with_input(
            BenchmarkId::new(format!("cap_{cap}"), listed),
            &(listed, cap),
            |b, &(listed, cap)| {
                b.to_async(Runtime::new().unwrap()).iter(|| async move {
                    let store = InMemoryTokenStore::new();
                    let queue = Arc::new(InMemoryDurableQueue::new());
                    let mut token = Token::new("bench-token", "alice", json!({}));
                    token.begin_update(0);
                    store.save(&token).await.unwrap();
                    let sink = TaskSink {
                        queue: queue.clone(),
                        queue_name: "bench:alice".into(),
                        access_token: "bench-token".into(),
                        policy: policy(),
                    };
                    let integration = Integration::new(Listing(listed)).with_worker("additions", Noop);
                    let job = UpdateJob {
                        access_token: "bench-token".into(),
                        documents_per_update: Some(cap),
                        identifier: None,
                        force: false,
                    };
                    let report = run_update_cycle(&store, &integration, &sink, &token, &job)
                        .await
                        .unwrap();
                    black_box(report);
                });
            },
        );
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_queue_roundtrip,
    bench_queue_retries,
    bench_token_cache,
    bench_protocol_lines,
    bench_update_cycle,
);
criterion_main!(benches);
