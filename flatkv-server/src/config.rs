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

use std::{
    fmt::Display,
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use crate::error::{Error, Result};

/// Default maximum size of a single data block.
pub const DEFAULT_MAX_BODY_SIZE: usize = 1024 * 1024;

/// Transport used to serve clients.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum NetworkMode {
    /// One pooled thread per connection.
    Blocking,
    /// A fixed set of epoll workers multiplexing all connections.
    #[default]
    NonBlocking,
}

impl Display for NetworkMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkMode::Blocking => write!(f, "blocking"),
            NetworkMode::NonBlocking => write!(f, "nonblocking"),
        }
    }
}

/// Thread pool limits of the blocking transport.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ExecutorConfig {
    /// Thread name prefix.
    pub name: String,
    /// Threads kept alive even when idle.
    pub low_watermark: usize,
    /// Maximum number of threads.
    pub high_watermark: usize,
    /// Maximum number of tasks waiting for a thread.
    pub max_queue_size: usize,
    /// Idle time after which a thread above the low watermark exits.
    pub idle_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            name: "flatkv-exec".to_string(),
            low_watermark: 2,
            high_watermark: 5,
            max_queue_size: 10,
            idle_timeout: Duration::from_millis(500),
        }
    }
}

impl ExecutorConfig {
    /// Check the limits are consistent.
    pub fn validate(&self) -> Result<()> {
        if self.high_watermark == 0 {
            return Err(Error::Config("executor high watermark must be positive".to_string()));
        }
        if self.low_watermark > self.high_watermark {
            return Err(Error::Config(format!(
                "executor low watermark {} exceeds high watermark {}",
                self.low_watermark, self.high_watermark
            )));
        }
        Ok(())
    }
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ServerConfig {
    /// Address to listen on.
    pub listen: SocketAddr,
    /// Transport.
    pub network: NetworkMode,
    /// Number of epoll workers of the non-blocking transport.
    pub workers: usize,
    /// Thread pool limits of the blocking transport.
    pub executor: ExecutorConfig,
    /// Maximum size of a single data block.
    pub max_body_size: usize,
    /// Named pipe to read commands from. Non-blocking transport only.
    pub read_fifo: Option<PathBuf>,
    /// Named pipe to write responses of [`ServerConfig::read_fifo`] commands to.
    pub write_fifo: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::LOCALHOST, 8080)),
            network: NetworkMode::default(),
            workers: 4,
            executor: ExecutorConfig::default(),
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            read_fifo: None,
            write_fifo: None,
        }
    }
}

impl ServerConfig {
    /// Check the configuration is consistent.
    pub fn validate(&self) -> Result<()> {
        match self.network {
            NetworkMode::Blocking => {
                self.executor.validate()?;
                if self.read_fifo.is_some() {
                    return Err(Error::Config(
                        "fifo transport requires the non-blocking network mode".to_string(),
                    ));
                }
            }
            NetworkMode::NonBlocking => {
                if self.workers == 0 {
                    return Err(Error::Config("worker count must be positive".to_string()));
                }
            }
        }
        if self.write_fifo.is_some() && self.read_fifo.is_none() {
            return Err(Error::Config("write fifo requires a read fifo".to_string()));
        }
        if self.max_body_size == 0 {
            return Err(Error::Config("max body size must be positive".to_string()));
        }
        Ok(())
    }
}
