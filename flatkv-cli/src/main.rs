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


//! `flatkv` serves a flat-combining in-memory LRU cache over the memcached text protocol.

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use bytesize::ByteSize;
use clap::Parser;
use flatkv_memory::{Backend, CacheBuilder, DEFAULT_MAX_BATCH};
use flatkv_server::{ExecutorConfig, NetworkMode, Server, ServerConfig};

#[cfg(all(feature = "jemalloc", not(target_env = "msvc")))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Address to listen on.
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Transport used to serve clients.
    #[arg(long, value_enum, default_value_t = NetworkMode::NonBlocking)]
    network: NetworkMode,

    /// Epoll workers of the non-blocking transport.
    #[arg(short, long, default_value_t = 4)]
    workers: usize,

    /// Synchronization backend of the cache.
    #[arg(long, value_enum, default_value_t = Backend::FlatCombine)]
    backend: Backend,

    /// Cache capacity in bytes of keys and values, e.g. "64MiB".
    #[arg(short, long, default_value = "1MiB")]
    capacity: ByteSize,

    /// Maximum operations applied per combining pass.
    #[arg(long, default_value_t = DEFAULT_MAX_BATCH)]
    max_batch: usize,

    /// Maximum size of a single data block.
    #[arg(long, default_value = "1MiB")]
    max_body_size: ByteSize,

    /// Named pipe to read commands from. Created if missing, removed on exit.
    #[arg(long)]
    read_fifo: Option<PathBuf>,

    /// Named pipe to write responses of fifo commands to.
    #[arg(long, requires = "read_fifo")]
    write_fifo: Option<PathBuf>,

    /// Threads the blocking transport keeps alive when idle.
    #[arg(long, default_value_t = 2)]
    executor_low_watermark: usize,

    /// Maximum threads of the blocking transport.
    #[arg(long, default_value_t = 5)]
    executor_high_watermark: usize,

    /// Maximum connections waiting for a thread of the blocking transport.
    #[arg(long, default_value_t = 10)]
    executor_queue_size: usize,

    /// Idle time after which a blocking transport thread above the low watermark exits, e.g. "500ms".
    #[arg(long, default_value = "500ms")]
    executor_idle_timeout: humantime::Duration,
}

impl Args {
    fn server_config(&self) -> anyhow::Result<ServerConfig> {
        let max_body_size = usize::try_from(self.max_body_size.as_u64()).context("max body size overflows usize")?;
        Ok(ServerConfig {
            listen: self.listen,
            network: self.network,
            workers: self.workers,
            executor: ExecutorConfig {
                low_watermark: self.executor_low_watermark,
                high_watermark: self.executor_high_watermark,
                max_queue_size: self.executor_queue_size,
                idle_timeout: self.executor_idle_timeout.into(),
                ..Default::default()
            },
            max_body_size,
            read_fifo: self.read_fifo.clone(),
            write_fifo: self.write_fifo.clone(),
        })
    }
}

fn init_logger() {
    use tracing_subscriber::{prelude::*, EnvFilter};

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_line_number(true))
        .with(EnvFilter::from_default_env())
        .init();
}

#[cfg(feature = "deadlock")]
fn spawn_deadlock_detector() {
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

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logger();

    #[cfg(feature = "deadlock")]
    spawn_deadlock_detector();

    let args = Args::parse();
    tracing::debug!("{args:?}");

    let capacity = usize::try_from(args.capacity.as_u64()).context("capacity overflows usize")?;
    let cache = CacheBuilder::new(capacity)
        .with_backend(args.backend)
        .with_max_batch(args.max_batch)
        .build()?;
    let config = args.server_config()?;

    let server = Server::start(&config, Arc::new(cache.clone()))?;
    tracing::info!(
        "[flatkv]: serving {} cache ({}) on {} with the {} transport",
        cache.backend(),
        args.capacity,
        server.local_addr(),
        config.network
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("[flatkv]: interrupted, shutting down");

    server.stop();
    // The listener and the workers block in syscalls, keep them off the runtime threads.
    tokio::task::spawn_blocking(move || server.join()).await??;

    let stats = cache.stats();
    tracing::info!("[flatkv]: stopped, {stats:?}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_args() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_args() {
        let args = Args::parse_from([
            "flatkv",
            "--network",
            "blocking",
            "--backend",
            "global-lock",
            "--capacity",
            "64MiB",
            "--executor-idle-timeout",
            "2s",
        ]);
        assert_eq!(args.backend, Backend::GlobalLock);
        assert_eq!(args.capacity.as_u64(), 64 * 1024 * 1024);

        let config = args.server_config().unwrap();
        assert_eq!(config.network, NetworkMode::Blocking);
        assert_eq!(config.executor.idle_timeout, std::time::Duration::from_secs(2));
        assert_eq!(config.max_body_size, 1024 * 1024);
        config.validate().unwrap();
    }

    #[test]
    fn test_write_fifo_requires_read_fifo() {
        assert!(Args::try_parse_from(["flatkv", "--write-fifo", "/tmp/out"]).is_err());
    }
}
