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
    io::{self, Read, Write},
    net::{SocketAddr, TcpStream},
    os::fd::{AsRawFd, RawFd},
};

use bytes::{Buf, BytesMut};
use flatkv_common::storage::Storage;

use crate::protocol::Session;

const READ_CHUNK: usize = 16 * 1024;

/// Outcome of draining a non-blocking reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    /// The reader would block.
    Open,
    /// The peer closed its end.
    Closed,
}

/// Read everything currently available from `reader` into `buf`.
pub fn fill<R: Read>(reader: &mut R, buf: &mut BytesMut) -> io::Result<Fill> {
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        match reader.read(&mut chunk) {
            Ok(0) => return Ok(Fill::Closed),
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Fill::Open),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Write as much of `buf` to `writer` as it accepts without blocking.
pub fn drain<W: Write>(writer: &mut W, buf: &mut BytesMut) -> io::Result<()> {
    while !buf.is_empty() {
        match writer.write(&buf[..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => buf.advance(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Client connection served by a non-blocking worker.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    session: Session,
    input: BytesMut,
    output: BytesMut,
    /// Stop reading, close once the output is flushed.
    closing: bool,
    /// Epoll events currently registered.
    interest: u32,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr, max_body_size: usize, interest: u32) -> Self {
        Self {
            stream,
            peer,
            session: Session::new(max_body_size),
            input: BytesMut::new(),
            output: BytesMut::new(),
            closing: false,
            interest,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Epoll events currently registered.
    pub fn interest(&self) -> u32 {
        self.interest
    }

    pub fn set_interest(&mut self, interest: u32) {
        self.interest = interest;
    }

    pub fn wants_write(&self) -> bool {
        !self.output.is_empty()
    }

    /// Handle readiness `events`. Returns `false` once the connection should be dropped.
    pub fn on_events<S>(&mut self, storage: &S, events: u32) -> io::Result<bool>
    where
        S: Storage + ?Sized,
    {
        if events & libc::EPOLLERR as u32 != 0 {
            return Ok(false);
        }

        let mut peer_closed = false;
        if !self.closing && events & (libc::EPOLLIN | libc::EPOLLRDHUP | libc::EPOLLHUP) as u32 != 0 {
            peer_closed = fill(&mut self.stream, &mut self.input)? == Fill::Closed;
            if !self.session.process(storage, &mut self.input, &mut self.output) {
                self.closing = true;
            }
        }

        if peer_closed {
            self.closing = true;
        }

        drain(&mut self.stream, &mut self.output)?;

        // A closing connection is kept only while its last responses are being flushed.
        Ok(!self.closing || self.wants_write())
    }

    /// Epoll events the connection needs next.
    pub fn desired_interest(&self) -> u32 {
        if self.closing {
            return libc::EPOLLOUT as u32;
        }
        let mut interest = (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
        if self.wants_write() {
            interest |= libc::EPOLLOUT as u32;
        }
        interest
    }
}

impl AsRawFd for Connection {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}
