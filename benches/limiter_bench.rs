use std::sync::Arc;
use std::time::{Duration, Instant};

use criterion::black_box;
use criterion::criterion_group;
use criterion::criterion_main;
use criterion::BenchmarkId;
use criterion::Criterion;
use futures::future::join_all;
use tokio::runtime::Runtime;

use quota_guard::config::{RateLimitConfig, RedisConfig};
use quota_guard::ratelimit::{
    Algorithm, LeakyBucket, RateLimiter, RateLimiterService, SlidingWindow,
};
use quota_guard::store::{CounterStore, MemoryStore, RedisStore};

const LIMIT: u64 = 1000;
const WINDOW: Duration = Duration::from_secs(1);

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap()
}

fn service_config() -> RateLimitConfig {
    RateLimitConfig {
        default_limit: LIMIT,
        window_size_ms: WINDOW.as_millis() as u64,
        algorithm: Algorithm::SlidingWindow,
        enable_local_cache: true,
        local_cache_ttl_ms: 60_000,
        cache_sweep_interval_ms: 60_000,
    }
}

fn bench_single_limiter(
    group_name: &str,
    c: &mut Criterion,
    rt: &Runtime,
    limiter: Arc<dyn RateLimiter>,
) {
    let mut group = c.benchmark_group(group_name);

    let limiter = &limiter;
    group.bench_function("single-caller", |b| {
        b.to_async(rt).iter(move || async move {
            black_box(limiter.allow("bench_user", LIMIT, WINDOW).await)
        })
    });

    group.finish();
}

fn bench_parallel_limiter(
    group_name: &str,
    c: &mut Criterion,
    rt: &Runtime,
    limiter: Arc<dyn RateLimiter>,
) {
    let mut group = c.benchmark_group(group_name);

    for callers in [2usize, 4, 8] {
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}-callers", callers)),
            &callers,
            |b, &n| {
                b.to_async(rt).iter_custom(|iters| {
                    let limiter = Arc::clone(&limiter);
                    async move {
                        let per_caller = (iters / n as u64).max(1);
                        let start = Instant::now();

                        let tasks = (0..n).map(|_| {
                            let limiter = Arc::clone(&limiter);
                            tokio::spawn(async move {
                                for _ in 0..per_caller {
                                    let _ = black_box(
                                        limiter.allow("bench_user", LIMIT, WINDOW).await,
                                    );
                                }
                            })
                        });
                        join_all(tasks).await;

                        start.elapsed()
                    }
                });
            },
        );
    }

    group.finish();
}

fn bench_service(group_name: &str, c: &mut Criterion, rt: &Runtime, store: Arc<dyn CounterStore>) {
    let service = {
        let _guard = rt.enter();
        Arc::new(RateLimiterService::new(store, &service_config()))
    };

    let mut group = c.benchmark_group(group_name);

    let shared = &service;
    group.bench_function("single-caller", |b| {
        b.to_async(rt).iter(move || async move {
            black_box(shared.rate_limit("bench_user", LIMIT).await)
        })
    });

    for callers in [2usize, 4, 8] {
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}-callers", callers)),
            &callers,
            |b, &n| {
                b.to_async(rt).iter_custom(|iters| {
                    let service = Arc::clone(&service);
                    async move {
                        let per_caller = (iters / n as u64).max(1);
                        let start = Instant::now();

                        let tasks = (0..n).map(|_| {
                            let service = Arc::clone(&service);
                            tokio::spawn(async move {
                                for _ in 0..per_caller {
                                    let _ = black_box(
                                        service.rate_limit("bench_user_concurrent", LIMIT).await,
                                    );
                                }
                            })
                        });
                        join_all(tasks).await;

                        start.elapsed()
                    }
                });
            },
        );
    }

    group.finish();

    rt.block_on(service.shutdown());
}

/// A live Redis store when `REDIS_URL` (or localhost) answers, otherwise `None`.
fn redis_store(rt: &Runtime) -> Option<Arc<dyn CounterStore>> {
    let config = RedisConfig {
        url: std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
        connect_timeout_ms: 500,
        command_timeout_ms: 1000,
    };

    rt.block_on(async {
        let store = RedisStore::connect(&config).await.ok()?;
        store.ping().await.ok()?;
        Some(Arc::new(store) as Arc<dyn CounterStore>)
    })
}

fn run_all_benches(c: &mut Criterion) {
    let rt = runtime();

    // --- In-process store ---

    let memory: Arc<dyn CounterStore> = Arc::new(MemoryStore::new());

    let sw: Arc<dyn RateLimiter> = Arc::new(SlidingWindow::new(memory.clone()));
    bench_single_limiter("SlidingWindow-Memory", c, &rt, sw.clone());
    bench_parallel_limiter("SlidingWindow-Memory", c, &rt, sw);

    let lb: Arc<dyn RateLimiter> = Arc::new(LeakyBucket::new(memory.clone()));
    bench_single_limiter("LeakyBucket-Memory", c, &rt, lb.clone());
    bench_parallel_limiter("LeakyBucket-Memory", c, &rt, lb);

    bench_service("Service-Memory", c, &rt, memory);

    // --- Redis, when one is reachable ---

    if let Some(redis) = redis_store(&rt) {
        let sw: Arc<dyn RateLimiter> = Arc::new(SlidingWindow::new(redis.clone()));
        bench_single_limiter("SlidingWindow-Redis", c, &rt, sw.clone());
        bench_parallel_limiter("SlidingWindow-Redis", c, &rt, sw);

        let lb: Arc<dyn RateLimiter> = Arc::new(LeakyBucket::new(redis.clone()));
        bench_single_limiter("LeakyBucket-Redis", c, &rt, lb.clone());
        bench_parallel_limiter("LeakyBucket-Redis", c, &rt, lb);

        bench_service("Service-Redis", c, &rt, redis);
    }
}

criterion_group!(benches, run_all_benches);
criterion_main!(benches);
