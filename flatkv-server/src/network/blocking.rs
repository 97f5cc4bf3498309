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

//! Blocking transport.
//!
//! An acceptor thread hands every accepted connection to an elastic [`Executor`]. Each connection is then served by
//! one pooled thread with blocking reads. Reads time out periodically so connection threads notice a stop request.

use std::{
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr, TcpListener, TcpStream},
    os::fd::AsRawFd,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use bytes::BytesMut;
use flatkv_common::storage::Storage;
use parking_lot::Mutex;

use crate::{
    config::ServerConfig,
    error::{Error, Result},
    executor::Executor,
    network::sys,
    protocol::Session,
};

/// How often a connection thread blocked in a read checks for a stop request.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

const READ_CHUNK: usize = 16 * 1024;

/// Server serving each connection on a pooled thread.
pub struct BlockingServer {
    local_addr: SocketAddr,
    listener: Arc<TcpListener>,
    running: Arc<AtomicBool>,
    executor: Executor,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for BlockingServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingServer")
            .field("local_addr", &self.local_addr)
            .field("running", &self.running.load(Ordering::Relaxed))
            .field("executor", &self.executor)
            .finish()
    }
}

impl BlockingServer {
    /// Bind the listener and start the acceptor thread.
    pub fn start(config: &ServerConfig, storage: Arc<dyn Storage>) -> Result<Self> {
        let listener = Arc::new(TcpListener::bind(config.listen)?);
        let local_addr = listener.local_addr()?;
        let running = Arc::new(AtomicBool::new(true));
        let executor = Executor::new(config.executor.clone())?;

        let acceptor = Acceptor {
            listener: listener.clone(),
            running: running.clone(),
            executor: executor.clone(),
            storage,
            max_body_size: config.max_body_size,
        };
        let handle = std::thread::Builder::new()
            .name("flatkv-acceptor".to_string())
            .spawn(move || acceptor.run())
            .map_err(|e| {
                executor.stop();
                Error::Io(e)
            })?;

        tracing::info!("[server]: blocking server listening on {local_addr}");
        Ok(Self {
            local_addr,
            listener,
            running,
            executor,
            acceptor: Mutex::new(Some(handle)),
        })
    }

    /// Address the server listens on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections and ask connection threads to finish.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        // Wakes the acceptor blocked in `accept`.
        if let Err(e) = sys::shutdown(self.listener.as_raw_fd()) {
            tracing::debug!("[server]: shutdown listener error: {e}");
        }
        self.executor.stop();
    }

    /// Wait for the acceptor and every connection thread to exit.
    pub fn join(&self) -> Result<()> {
        if let Some(handle) = self.acceptor.lock().take() {
            if handle.join().is_err() {
                tracing::error!("[server]: acceptor panicked");
            }
        }
        self.executor.join();
        tracing::info!("[server]: blocking server on {} stopped", self.local_addr);
        Ok(())
    }
}

struct Acceptor {
    listener: Arc<TcpListener>,
    running: Arc<AtomicBool>,
    executor: Executor,
    storage: Arc<dyn Storage>,
    max_body_size: usize,
}

impl Acceptor {
    fn run(self) {
        while self.running.load(Ordering::Acquire) {
            let (stream, peer) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(_) if !self.running.load(Ordering::Acquire) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!("[acceptor]: accept error: {e}");
                    // Back off on descriptor exhaustion and similar persistent faults.
                    std::thread::sleep(POLL_INTERVAL);
                    continue;
                }
            };
            tracing::debug!("[acceptor]: accepted connection from {peer}");

            let busy = stream.try_clone();
            let storage = self.storage.clone();
            let running = self.running.clone();
            let max_body_size = self.max_body_size;
            let accepted = self.executor.execute(move || {
                if let Err(e) = serve(stream, &*storage, &running, max_body_size) {
                    tracing::debug!("[connection]: {peer} error: {e}");
                }
                tracing::debug!("[connection]: {peer} closed");
            });

            if !accepted {
                tracing::warn!("[acceptor]: executor saturated, refuse connection from {peer}");
                if let Ok(mut stream) = busy {
                    let _ = stream.write_all(b"SERVER_ERROR busy\r\n");
                    let _ = stream.shutdown(Shutdown::Both);
                }
            }
        }
        tracing::debug!("[acceptor]: stopped");
    }
}

/// Serve one connection until the peer closes it, a protocol error occurs or the server stops.
fn serve(mut stream: TcpStream, storage: &dyn Storage, running: &AtomicBool, max_body_size: usize) -> io::Result<()> {
    stream.set_read_timeout(Some(POLL_INTERVAL))?;
    stream.set_nodelay(true)?;

    let mut session = Session::new(max_body_size);
    let mut input = BytesMut::new();
    let mut output = BytesMut::new();
    let mut chunk = vec![0u8; READ_CHUNK];

    while running.load(Ordering::Acquire) {
        let n = match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                continue
            }
            Err(e) => return Err(e),
        };
        input.extend_from_slice(&chunk[..n]);

        let open = session.process(storage, &mut input, &mut output);
        if !output.is_empty() {
            stream.write_all(&output)?;
            output.clear();
        }
        if !open {
            break;
        }
    }
    Ok(())
}
