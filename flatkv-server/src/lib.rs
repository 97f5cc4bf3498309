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

//! memcached text protocol server over a [`Storage`].
//!
//! Two transports are available, selected by [`NetworkMode`]: a blocking one serving each connection on a pooled
//! thread, and a non-blocking one multiplexing connections over a few epoll workers. The non-blocking transport can
//! also serve commands from a named pipe.

mod config;
mod error;
mod executor;
mod network;
mod protocol;

use std::{net::SocketAddr, sync::Arc};

use flatkv_common::storage::Storage;

pub use crate::{
    config::{ExecutorConfig, NetworkMode, ServerConfig, DEFAULT_MAX_BODY_SIZE},
    error::{Error, ProtocolError, Result},
    executor::Executor,
    network::{BlockingServer, NonBlockingServer},
    protocol::{Command, Decoder, Session, MAX_KEY_LEN, MAX_LINE_LEN},
};

/// A running server.
#[derive(Debug)]
pub enum Server {
    /// Blocking transport.
    Blocking(BlockingServer),
    /// Non-blocking transport.
    NonBlocking(NonBlockingServer),
}

impl Server {
    /// Validate `config` and start serving `storage`.
    pub fn start(config: &ServerConfig, storage: Arc<dyn Storage>) -> Result<Self> {
        config.validate()?;
        let server = match config.network {
            NetworkMode::Blocking => Server::Blocking(BlockingServer::start(config, storage)?),
            NetworkMode::NonBlocking => Server::NonBlocking(NonBlockingServer::start(config, storage)?),
        };
        Ok(server)
    }

    /// Address the server listens on.
    pub fn local_addr(&self) -> SocketAddr {
        match self {
            Server::Blocking(server) => server.local_addr(),
            Server::NonBlocking(server) => server.local_addr(),
        }
    }

    /// Request the server to stop. Returns immediately, use [`Server::join`] to wait.
    pub fn stop(&self) {
        match self {
            Server::Blocking(server) => server.stop(),
            Server::NonBlocking(server) => server.stop(),
        }
    }

    /// Wait until every server thread has exited.
    pub fn join(&self) -> Result<()> {
        match self {
            Server::Blocking(server) => server.join(),
            Server::NonBlocking(server) => server.join(),
        }
    }
}
