use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use layover_party::cache::{CacheKey, ResponseCache};
use layover_party::config::CacheConfig;
use rand::{seq::SliceRandom, thread_rng, Rng};
use std::sync::Arc;
use std::thread;

fn search_key(origin: &str, dest: &str, date: &str) -> CacheKey {
    CacheKey::from_params([
        ("origin", origin),
        ("dest", dest),
        ("date", date),
        ("return_date", "2025-07-01"),
    ])
}

// Mixed read/write load from several threads against one shared cache
pub fn cache_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("response_cache");

    let airports = ["LAX", "NRT", "HNL", "SFO", "ICN", "JFK", "LHR", "CDG"];
    let dates: Vec<String> = (1..29).map(|d| format!("2025-06-{:02}", d)).collect();

    for payload_kb in [1usize, 16, 64].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(payload_kb),
            payload_kb,
            |b, &payload_kb| {
                let mut rng = thread_rng();
                let payload = Bytes::from(
                    (0..payload_kb * 1024)
                        .map(|_| rng.gen::<u8>())
                        .collect::<Vec<_>>(),
                );

                b.iter(|| {
                    let cache = Arc::new(ResponseCache::new(CacheConfig::default()));

                    let mut handles = vec![];
                    for _ in 0..4 {
                        let cache = Arc::clone(&cache);
                        let dates = dates.clone();
                        let payload = payload.clone();

                        handles.push(thread::spawn(move || {
                            let mut rng = thread_rng();
                            for _ in 0..250 {
                                let origin = airports.choose(&mut rng).unwrap();
                                let dest = airports.choose(&mut rng).unwrap();
                                let date = dates.choose(&mut rng).unwrap();
                                let key = search_key(origin, dest, date);

                                if rng.gen_bool(0.3) {
                                    cache.put(key, payload.clone(), None);
                                } else {
                                    let _ = cache.get(&key);
                                }
                            }
                        }));
                    }

                    for handle in handles {
                        handle.join().unwrap();
                    }

                    black_box(cache.stats())
                });
            },
        );
    }

    group.finish();
}

fn key_benchmark(c: &mut Criterion) {
    c.bench_function("cache_key_from_params", |b| {
        b.iter(|| black_box(search_key("LAX", "NRT", "2025-06-01")))
    });
}

criterion_group!(benches, cache_benchmark, key_benchmark);
criterion_main!(benches);
