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


//! Multi-threaded load generator comparing the cache backends.

mod analyze;

use std::{
    sync::{Arc, Barrier},
    time::Instant,
};

use analyze::{Comparison, Report};
use anyhow::{ensure, Context};
use bytesize::ByteSize;
use clap::Parser;
use flatkv_memory::{prelude::*, DEFAULT_MAX_BATCH};
use hdrhistogram::Histogram;
use itertools::Itertools;
use rand::{rngs::SmallRng, Rng, SeedableRng};

#[cfg(all(feature = "jemalloc", not(target_env = "msvc")))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
pub struct Args {
    /// Benchmark threads.
    #[arg(short, long, default_value_t = 8)]
    threads: usize,

    /// Operations issued by each thread.
    #[arg(long, default_value_t = 100_000)]
    ops: usize,

    /// Keys are drawn uniformly from `[0, key_range)`.
    #[arg(long, default_value_t = 10_000)]
    key_range: u64,

    /// Value size of every write.
    #[arg(long, default_value = "64B")]
    value_size: ByteSize,

    /// Cache capacity in bytes of keys and values.
    #[arg(short, long, default_value = "64MiB")]
    capacity: ByteSize,

    /// Maximum operations applied per combining pass of the flat combining backend.
    #[arg(long, default_value_t = DEFAULT_MAX_BATCH)]
    max_batch: usize,

    /// Backends to compare.
    #[arg(long, value_enum, value_delimiter = ',', default_values_t = [Backend::FlatCombine, Backend::GlobalLock])]
    backends: Vec<Backend>,

    /// Percentage of gets.
    #[arg(long, default_value_t = 70)]
    get: u32,

    /// Percentage of puts.
    #[arg(long, default_value_t = 20)]
    put: u32,

    /// Percentage of puts of absent keys.
    #[arg(long, default_value_t = 5)]
    put_if_absent: u32,

    /// Percentage of sets of present keys.
    #[arg(long, default_value_t = 3)]
    set: u32,

    /// Percentage of deletes.
    #[arg(long, default_value_t = 2)]
    delete: u32,

    /// Skip loading every key before the measurement.
    #[arg(long, default_value_t = false)]
    no_prefill: bool,

    /// Seed of the per-thread random generators.
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpKind {
    Get,
    Put,
    PutIfAbsent,
    Set,
    Delete,
}

/// Maps a roll in `[0, 100)` to an operation.
#[derive(Debug, Clone)]
struct OpMix {
    thresholds: Vec<(u32, OpKind)>,
}

impl OpMix {
    fn new(args: &Args) -> anyhow::Result<Self> {
        let weights = [
            (args.get, OpKind::Get),
            (args.put, OpKind::Put),
            (args.put_if_absent, OpKind::PutIfAbsent),
            (args.set, OpKind::Set),
            (args.delete, OpKind::Delete),
        ];
        let total: u32 = weights.iter().map(|(w, _)| w).sum();
        ensure!(total == 100, "operation percentages must sum up to 100, got {total}");

        let thresholds = weights
            .into_iter()
            .filter(|(w, _)| *w > 0)
            .scan(0, |acc, (w, kind)| {
                *acc += w;
                Some((*acc, kind))
            })
            .collect_vec();
        Ok(Self { thresholds })
    }

    fn pick(&self, roll: u32) -> OpKind {
        self.thresholds
            .iter()
            .find(|(threshold, _)| roll < *threshold)
            .map(|(_, kind)| *kind)
            .unwrap_or(OpKind::Get)
    }
}

fn key(i: u64) -> Vec<u8> {
    format!("key-{i:010}").into_bytes()
}

fn apply(cache: &Cache, kind: OpKind, key: &[u8], value: &[u8]) -> bool {
    match kind {
        OpKind::Get => cache.get(key).is_some(),
        OpKind::Put => cache.put(key, value),
        OpKind::PutIfAbsent => cache.put_if_absent(key, value),
        OpKind::Set => cache.set(key, value),
        OpKind::Delete => cache.delete(key),
    }
}

fn run(args: &Args, mix: &OpMix, backend: Backend) -> anyhow::Result<Report> {
    let capacity = usize::try_from(args.capacity.as_u64()).context("capacity overflows usize")?;
    let value_size = usize::try_from(args.value_size.as_u64()).context("value size overflows usize")?;
    let cache = CacheBuilder::new(capacity)
        .with_backend(backend)
        .with_max_batch(args.max_batch)
        .build()?;

    let value = vec![b'x'; value_size];
    if !args.no_prefill {
        for i in 0..args.key_range {
            cache.put(&key(i), &value);
        }
        tracing::info!("[bench]: {backend} prefilled, {} records", cache.len());
    }

    let barrier = Arc::new(Barrier::new(args.threads + 1));
    let (elapsed, results) = std::thread::scope(|scope| {
        let handles = (0..args.threads)
            .map(|id| {
                let cache = cache.clone();
                let barrier = barrier.clone();
                let value = &value;
                scope.spawn(move || worker(args, mix, id as u64, cache, barrier, value))
            })
            .collect_vec();

        barrier.wait();
        let start = Instant::now();
        let results = handles.into_iter().map(|handle| handle.join()).collect_vec();
        (start.elapsed(), results)
    });

    let mut latency = Histogram::<u64>::new(3)?;
    let mut hits = 0;
    for result in results {
        let (histogram, h) = match result {
            Ok(result) => result?,
            Err(_) => anyhow::bail!("benchmark thread panicked"),
        };
        latency.add(&histogram)?;
        hits += h;
    }

    cache.check();
    Ok(Report {
        backend,
        ops: latency.len(),
        elapsed,
        latency,
        hits,
        stats: cache.stats(),
    })
}

fn worker(
    args: &Args,
    mix: &OpMix,
    id: u64,
    cache: Cache,
    barrier: Arc<Barrier>,
    value: &[u8],
) -> anyhow::Result<(Histogram<u64>, u64)> {
    let mut rng = SmallRng::seed_from_u64(args.seed.wrapping_add(id));
    let mut histogram = Histogram::<u64>::new(3)?;
    let mut hits = 0;

    barrier.wait();
    for _ in 0..args.ops {
        let kind = mix.pick(rng.random_range(0..100));
        let key = key(rng.random_range(0..args.key_range));

        let start = Instant::now();
        let ok = apply(&cache, kind, &key, value);
        histogram.saturating_record(start.elapsed().as_nanos() as u64);

        if kind == OpKind::Get && ok {
            hits += 1;
        }
    }

    cache.detach();
    Ok((histogram, hits))
}

fn init_logger() {
    use tracing_subscriber::{prelude::*, EnvFilter};

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_line_number(true))
        .with(EnvFilter::from_default_env())
        .init();
}

fn main() -> anyhow::Result<()> {
    init_logger();

    #[cfg(feature = "deadlock")]
    {
        std::thread::spawn(move || loop {
            std::thread::sleep(std::time::Duration::from_secs(1));
            let deadlocks = parking_lot::deadlock::check_deadlock();
            if deadlocks.is_empty() {
                continue;
            }

            println!("{} deadlocks detected", deadlocks.len());
            for (i, threads) in deadlocks.iter().enumerate() {
                println!("Deadlock #{}", i);
                for t in threads {
                    println!("Thread Id {:#?}", t.thread_id());
                    println!("{:#?}", t.backtrace());
                }
            }
            panic!()
        });
    }

    let args = Args::parse();
    println!("{:#?}", args);
    ensure!(args.threads > 0, "\"--threads\" value must be greater than 0");
    ensure!(args.key_range > 0, "\"--key-range\" value must be greater than 0");
    ensure!(!args.backends.is_empty(), "\"--backends\" must name at least one backend");
    let mix = OpMix::new(&args)?;

    let reports = args
        .backends
        .iter()
        .unique()
        .map(|backend| {
            tracing::info!("[bench]: running {backend}");
            run(&args, &mix, *backend)
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    for report in &reports {
        println!("\n{}:\n{}", report.backend, report);
    }
    if reports.len() > 1 {
        println!("\nComparison:\n{}", Comparison(&reports));
    }
    Ok(())
}
