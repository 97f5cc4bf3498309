// Copyright 2025 flatkv Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Storage contract tests shared by both cache backends.

use std::{
    collections::HashSet,
    sync::{Arc, Barrier},
};

use flatkv_memory::prelude::*;
use rand::{rngs::SmallRng, Rng, SeedableRng};

fn build(backend: Backend, capacity: usize) -> Cache {
    CacheBuilder::new(capacity).with_backend(backend).build().unwrap()
}

fn for_each_backend(f: impl Fn(Backend)) {
    for backend in [Backend::FlatCombine, Backend::GlobalLock] {
        tracing::info!("run with backend {backend}");
        f(backend);
    }
}

#[test_log::test]
fn test_put_get() {
    for_each_backend(|backend| {
        let cache = build(backend, 1024);
        assert!(cache.put(b"KEY1", b"val1"));
        assert!(cache.put(b"KEY2", b"val2"));
        assert_eq!(cache.get(b"KEY1").unwrap(), b"val1");
        assert_eq!(cache.get(b"KEY2").unwrap(), b"val2");
        cache.check();
    });
}

#[test_log::test]
fn test_put_overwrite() {
    for_each_backend(|backend| {
        let cache = build(backend, 2 * (3 + 1));
        assert!(cache.put(b"KEY1", b"val1"));
        assert!(cache.put(b"KEY1", b"val2"));
        assert_eq!(cache.get(b"KEY1").unwrap(), b"val2");
        assert_eq!(cache.usage(), 8);
        cache.check();
    });
}

#[test_log::test]
fn test_put_if_absent() {
    for_each_backend(|backend| {
        let cache = build(backend, 1024);
        assert!(cache.put(b"KEY1", b"val1"));
        assert!(!cache.put_if_absent(b"KEY1", b"val2"));
        assert!(cache.put_if_absent(b"KEY2", b"val2"));
        assert_eq!(cache.get(b"KEY1").unwrap(), b"val1");
        assert_eq!(cache.get(b"KEY2").unwrap(), b"val2");
    });
}

#[test_log::test]
fn test_set() {
    for_each_backend(|backend| {
        let cache = build(backend, 1024);
        assert!(!cache.set(b"KEY1", b"val1"));
        assert!(cache.get(b"KEY1").is_none());
        assert!(cache.put(b"KEY1", b"val1"));
        assert!(cache.set(b"KEY1", b"val2"));
        assert_eq!(cache.get(b"KEY1").unwrap(), b"val2");
    });
}

#[test_log::test]
fn test_delete() {
    for_each_backend(|backend| {
        let cache = build(backend, 1024);
        assert!(cache.put(b"KEY1", b"val1"));
        assert!(cache.put(b"KEY2", b"val2"));
        assert!(cache.delete(b"KEY1"));
        assert!(cache.get(b"KEY1").is_none());
        assert!(!cache.delete(b"KEY1"));
        assert_eq!(cache.get(b"KEY2").unwrap(), b"val2");
        cache.check();
    });
}

#[test_log::test]
fn test_big() {
    const N: usize = 100_000;

    for_each_backend(|backend| {
        let cache = build(backend, 2 * (3 + 6) * N);
        for i in 0..N {
            let key = format!("Key{i:06}");
            let val = format!("Val{i:06}");
            assert!(cache.put(key.as_bytes(), val.as_bytes()), "put {key}");
        }
        for i in (0..N).rev() {
            let key = format!("Key{i:06}");
            let val = format!("Val{i:06}");
            assert_eq!(cache.get(key.as_bytes()).unwrap(), val.as_bytes());
        }
        assert_eq!(cache.len(), N);
        cache.check();
    });
}

#[test_log::test]
fn test_max() {
    const N: usize = 1000;
    const M: usize = 1100;

    for_each_backend(|backend| {
        // Room for exactly N records of 16 bytes.
        let cache = build(backend, 2 * (3 + 5) * N);
        for i in 0..M {
            let key = format!("Key{i:05}");
            let val = format!("Val{i:05}");
            assert!(cache.put(key.as_bytes(), val.as_bytes()));
        }

        // The oldest M - N keys are gone, the newest N remain.
        for i in 0..(M - N) {
            let key = format!("Key{i:05}");
            assert!(cache.get(key.as_bytes()).is_none(), "{key} should be evicted");
        }
        for i in (M - N)..M {
            let key = format!("Key{i:05}");
            let val = format!("Val{i:05}");
            assert_eq!(cache.get(key.as_bytes()).unwrap(), val.as_bytes());
        }
        assert_eq!(cache.stats().evict, (M - N) as u64);
        cache.check();
    });
}

#[test_log::test]
fn test_get_refreshes_recency() {
    for_each_backend(|backend| {
        let cache = build(backend, 6);
        assert!(cache.put(b"a", b"1"));
        assert!(cache.put(b"b", b"2"));
        assert!(cache.put(b"c", b"3"));
        assert!(cache.get(b"a").is_some());
        assert!(cache.put(b"d", b"4"));
        assert!(cache.get(b"b").is_none());
        assert!(cache.get(b"a").is_some());
        assert!(cache.get(b"c").is_some());
        assert!(cache.get(b"d").is_some());
    });
}

#[test_log::test]
fn test_capacity_rejection() {
    for_each_backend(|backend| {
        let cache = build(backend, 4);
        assert!(!cache.put(b"key", b"vv"));
        assert!(cache.is_empty());

        let cache = build(backend, 0);
        assert!(!cache.put(b"", b"v"));
        assert!(!cache.put_if_absent(b"k", b""));
        assert!(cache.is_empty());
    });
}

#[test_log::test]
fn test_multithreaded_put_get() {
    const THREADS: usize = 100;
    const OPS: usize = 1000;

    for_each_backend(|backend| {
        let cache = build(backend, 100_000_000);
        let barrier = Arc::new(Barrier::new(THREADS));
        let handles = (0..THREADS)
            .map(|t| {
                let cache = cache.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    for i in 0..OPS {
                        let key = format!("Key_{t}_{i}");
                        let val = format!("Val_{t}_{i}");
                        assert!(cache.put(key.as_bytes(), val.as_bytes()));
                        assert_eq!(cache.get(key.as_bytes()).unwrap(), val.as_bytes());
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cache.len(), THREADS * OPS);
        for t in (0..THREADS).step_by(7) {
            for i in (0..OPS).step_by(13) {
                let key = format!("Key_{t}_{i}");
                let val = format!("Val_{t}_{i}");
                assert_eq!(cache.get(key.as_bytes()).unwrap(), val.as_bytes());
            }
        }
        cache.check();
    });
}

#[test_log::test]
fn test_flood() {
    const THREADS: usize = 16;
    const OPS: usize = 10_000;
    const KEYS: usize = 10;

    for_each_backend(|backend| {
        let cache = build(backend, 1024);
        let values = (0..KEYS)
            .flat_map(|k| (0..4).map(move |v| format!("val_{k}_{v}")))
            .collect::<HashSet<_>>();
        let values = Arc::new(values);

        let barrier = Arc::new(Barrier::new(THREADS));
        let handles = (0..THREADS)
            .map(|t| {
                let cache = cache.clone();
                let barrier = barrier.clone();
                let values = values.clone();
                std::thread::spawn(move || {
                    let mut rng = SmallRng::seed_from_u64(t as u64);
                    barrier.wait();
                    for _ in 0..OPS {
                        let k = rng.random_range(0..KEYS);
                        let key = format!("key_{k}");
                        let val = format!("val_{k}_{}", rng.random_range(0..4));
                        match rng.random_range(0..5) {
                            0 => {
                                cache.put(key.as_bytes(), val.as_bytes());
                            }
                            1 => {
                                cache.put_if_absent(key.as_bytes(), val.as_bytes());
                            }
                            2 => {
                                cache.set(key.as_bytes(), val.as_bytes());
                            }
                            3 => {
                                cache.delete(key.as_bytes());
                            }
                            _ => {
                                // Values are never torn or mixed up between keys.
                                if let Some(v) = cache.get(key.as_bytes()) {
                                    let v = String::from_utf8(v).unwrap();
                                    assert!(values.contains(&v), "unexpected value {v}");
                                    assert!(v.starts_with(&format!("val_{k}_")));
                                }
                            }
                        }
                    }
                    cache.detach();
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }

        cache.check();
        assert!(cache.len() <= KEYS);
    });
}

#[test_log::test]
fn test_own_writes_visible() {
    const THREADS: usize = 8;
    const OPS: usize = 2000;

    let cache = build(Backend::FlatCombine, 1 << 20);
    let barrier = Arc::new(Barrier::new(THREADS));
    let handles = (0..THREADS)
        .map(|t| {
            let cache = cache.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                let key = format!("own_{t}");
                barrier.wait();
                assert!(cache.put_if_absent(key.as_bytes(), b"0"));
                for i in 1..OPS {
                    let val = i.to_string();
                    assert!(cache.set(key.as_bytes(), val.as_bytes()));
                    assert_eq!(cache.get(key.as_bytes()).unwrap(), val.as_bytes());
                }
                assert!(cache.delete(key.as_bytes()));
                assert!(!cache.delete(key.as_bytes()));
            })
        })
        .collect::<Vec<_>>();
    for handle in handles {
        handle.join().unwrap();
    }
    assert!(cache.is_empty());

    let stats = cache.stats();
    assert!(stats.combine_pass > 0);
    assert!(stats.avg_batch() >= 1.0);
}
