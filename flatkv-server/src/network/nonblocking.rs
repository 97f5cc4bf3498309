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

//! Non-blocking transport.
//!
//! A fixed set of workers, each running its own epoll loop over a private set of connections. All workers share the
//! listening socket, registered with `EPOLLEXCLUSIVE` so one accept readiness wakes one worker. Worker 0 also serves
//! the fifo transport when configured.

use std::{
    io,
    net::{SocketAddr, TcpListener, TcpStream},
    os::fd::AsRawFd,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

use flatkv_common::storage::Storage;
use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::{
    config::ServerConfig,
    error::{Error, Result},
    network::{
        connection::Connection,
        fifo::FifoConnection,
        sys::{Epoll, EventFd},
    },
};

const MAX_EVENTS: usize = 64;

const LISTENER: u64 = u64::MAX;
const WAKER: u64 = u64::MAX - 1;
const FIFO: u64 = u64::MAX - 2;

struct Worker {
    id: usize,
    epoll: Epoll,
    listener: Arc<TcpListener>,
    waker: Arc<EventFd>,
    fifo: Option<FifoConnection>,
    storage: Arc<dyn Storage>,
    running: Arc<AtomicBool>,
    max_body_size: usize,

    connections: HashMap<u64, Connection>,
    next_token: u64,
}

impl Worker {
    fn run(mut self) -> Result<()> {
        self.epoll.add(
            self.listener.as_raw_fd(),
            (libc::EPOLLIN | libc::EPOLLEXCLUSIVE) as u32,
            LISTENER,
        )?;
        self.epoll
            .add(self.waker.as_raw_fd(), libc::EPOLLIN as u32, WAKER)?;
        if let Some(fifo) = self.fifo.as_ref() {
            self.epoll.add(fifo.as_raw_fd(), libc::EPOLLIN as u32, FIFO)?;
        }
        tracing::debug!("[worker {}]: started", self.id);

        let mut events = Vec::with_capacity(MAX_EVENTS);
        while self.running.load(Ordering::Acquire) {
            match self.epoll.wait(&mut events, -1) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            for event in events.iter() {
                let (token, flags) = (event.u64, event.events);
                match token {
                    LISTENER => self.accept(),
                    WAKER => self.waker.reset(),
                    FIFO => self.on_fifo(),
                    token => self.on_connection(token, flags),
                }
            }
        }

        for (_, connection) in self.connections.drain() {
            let _ = self.epoll.delete(connection.as_raw_fd());
        }
        tracing::debug!("[worker {}]: stopped", self.id);
        Ok(())
    }

    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = self.register(stream, peer) {
                        tracing::warn!("[worker {}]: register connection {peer} error: {e}", self.id);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // Out of descriptors or an aborted handshake. Retry on the next readiness.
                    if self.running.load(Ordering::Acquire) {
                        tracing::warn!("[worker {}]: accept error: {e}", self.id);
                    }
                    return;
                }
            }
        }
    }

    fn register(&mut self, stream: TcpStream, peer: SocketAddr) -> io::Result<()> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;

        let token = self.next_token;
        self.next_token += 1;

        let interest = (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
        self.epoll.add(stream.as_raw_fd(), interest, token)?;
        self.connections
            .insert(token, Connection::new(stream, peer, self.max_body_size, interest));
        tracing::debug!("[worker {}]: accepted connection from {peer}", self.id);
        Ok(())
    }

    fn on_connection(&mut self, token: u64, events: u32) {
        let Some(connection) = self.connections.get_mut(&token) else {
            return;
        };

        let keep = match connection.on_events(&*self.storage, events) {
            Ok(keep) => keep,
            Err(e) => {
                tracing::debug!("[worker {}]: connection {} error: {e}", self.id, connection.peer());
                false
            }
        };

        if keep {
            let interest = connection.desired_interest();
            if interest == connection.interest() {
                return;
            }
            match self.epoll.modify(connection.as_raw_fd(), interest, token) {
                Ok(()) => {
                    connection.set_interest(interest);
                    return;
                }
                Err(e) => tracing::warn!("[worker {}]: epoll modify error: {e}", self.id),
            }
        }

        if let Some(connection) = self.connections.remove(&token) {
            let _ = self.epoll.delete(connection.as_raw_fd());
            tracing::debug!("[worker {}]: closed connection from {}", self.id, connection.peer());
        }
    }

    fn on_fifo(&mut self) {
        if let Some(fifo) = self.fifo.as_mut() {
            if let Err(e) = fifo.on_readable(&*self.storage) {
                tracing::warn!("[worker {}]: fifo read error: {e}", self.id);
            }
        }
    }
}

struct WorkerHandle {
    waker: Arc<EventFd>,
    handle: JoinHandle<Result<()>>,
}

/// Server multiplexing connections over a fixed set of epoll workers.
pub struct NonBlockingServer {
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    workers: Mutex<Vec<WorkerHandle>>,
}

impl std::fmt::Debug for NonBlockingServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonBlockingServer")
            .field("local_addr", &self.local_addr)
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}

impl NonBlockingServer {
    /// Bind the listener and start the workers.
    pub fn start(config: &ServerConfig, storage: Arc<dyn Storage>) -> Result<Self> {
        let listener = TcpListener::bind(config.listen)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let listener = Arc::new(listener);
        let running = Arc::new(AtomicBool::new(true));

        let mut fifo = match config.read_fifo.as_deref() {
            Some(path) => Some(FifoConnection::open(
                path,
                config.write_fifo.as_deref(),
                config.max_body_size,
            )?),
            None => None,
        };

        let mut workers = Vec::with_capacity(config.workers);
        for id in 0..config.workers {
            let waker = Arc::new(EventFd::new()?);
            let worker = Worker {
                id,
                epoll: Epoll::new()?,
                listener: listener.clone(),
                waker: waker.clone(),
                fifo: fifo.take(),
                storage: storage.clone(),
                running: running.clone(),
                max_body_size: config.max_body_size,
                connections: HashMap::new(),
                next_token: 0,
            };
            let spawned = std::thread::Builder::new()
                .name(format!("flatkv-worker-{id}"))
                .spawn(move || worker.run());
            match spawned {
                Ok(handle) => workers.push(WorkerHandle { waker, handle }),
                Err(e) => {
                    let server = Self {
                        local_addr,
                        running,
                        workers: Mutex::new(workers),
                    };
                    server.stop();
                    let _ = server.join();
                    return Err(Error::Io(e));
                }
            }
        }

        tracing::info!(
            "[server]: non-blocking server listening on {local_addr} with {} workers",
            config.workers
        );
        Ok(Self {
            local_addr,
            running,
            workers: Mutex::new(workers),
        })
    }

    /// Address the server listens on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Ask every worker to stop. Connections are closed when the workers exit.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        for worker in self.workers.lock().iter() {
            if let Err(e) = worker.waker.wake() {
                tracing::warn!("[server]: wake worker error: {e}");
            }
        }
    }

    /// Wait for every worker to exit. Returns the first worker error.
    pub fn join(&self) -> Result<()> {
        let workers = std::mem::take(&mut *self.workers.lock());
        let mut res = Ok(());
        for worker in workers {
            match worker.handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!("[server]: worker error: {e}");
                    if res.is_ok() {
                        res = Err(e);
                    }
                }
                Err(_) => {
                    tracing::error!("[server]: worker panicked");
                }
            }
        }
        tracing::info!("[server]: non-blocking server on {} stopped", self.local_addr);
        res
    }
}
