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

//! Named pipe transport.
//!
//! Commands are read from a fifo that the server creates if missing and opens read-write, so it never observes
//! end-of-file when writers come and go. Responses go to an optional second fifo. While no process reads that fifo
//! the responses are discarded.

use std::{
    fs::{File, OpenOptions},
    io,
    os::{
        fd::{AsRawFd, RawFd},
        unix::fs::OpenOptionsExt,
    },
    path::{Path, PathBuf},
};

use bytes::BytesMut;
use flatkv_common::storage::Storage;

use crate::{
    network::{
        connection::{drain, fill},
        sys,
    },
    protocol::Session,
};

/// Pending responses beyond this size are dropped.
const MAX_PENDING_OUTPUT: usize = 4 * 1024 * 1024;

#[derive(Debug)]
pub struct FifoConnection {
    read_path: PathBuf,
    write_path: Option<PathBuf>,
    reader: File,
    writer: Option<File>,
    session: Session,
    max_body_size: usize,
    input: BytesMut,
    output: BytesMut,
}

impl FifoConnection {
    pub fn open(read_path: &Path, write_path: Option<&Path>, max_body_size: usize) -> io::Result<Self> {
        sys::mkfifo(read_path)?;
        let reader = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(read_path)?;
        if let Some(path) = write_path {
            sys::mkfifo(path)?;
        }
        tracing::info!("[fifo]: reading commands from {}", read_path.display());

        Ok(Self {
            read_path: read_path.to_path_buf(),
            write_path: write_path.map(Path::to_path_buf),
            reader,
            writer: None,
            session: Session::new(max_body_size),
            max_body_size,
            input: BytesMut::new(),
            output: BytesMut::new(),
        })
    }

    /// Execute every complete command available on the read fifo.
    pub fn on_readable<S>(&mut self, storage: &S) -> io::Result<()>
    where
        S: Storage + ?Sized,
    {
        fill(&mut self.reader, &mut self.input)?;
        if !self.session.process(storage, &mut self.input, &mut self.output) {
            // A fifo has no connection to close, start over with a clean session.
            tracing::warn!("[fifo]: protocol error, session reset");
            self.session = Session::new(self.max_body_size);
        }
        self.flush();
        Ok(())
    }

    fn flush(&mut self) {
        let Some(path) = self.write_path.as_ref() else {
            self.output.clear();
            return;
        };

        if self.writer.is_none() {
            match OpenOptions::new()
                .write(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(path)
            {
                Ok(file) => self.writer = Some(file),
                // No reader on the other end.
                Err(e) if e.raw_os_error() == Some(libc::ENXIO) => {
                    self.output.clear();
                    return;
                }
                Err(e) => {
                    tracing::warn!("[fifo]: open {} error: {e}", path.display());
                    self.output.clear();
                    return;
                }
            }
        }

        if let Some(writer) = self.writer.as_mut() {
            if let Err(e) = drain(writer, &mut self.output) {
                tracing::debug!("[fifo]: write error: {e}, reopen on next response");
                self.writer = None;
                self.output.clear();
            }
        }

        if self.output.len() > MAX_PENDING_OUTPUT {
            tracing::warn!("[fifo]: drop {} bytes of pending responses", self.output.len());
            self.output.clear();
        }
    }
}

impl AsRawFd for FifoConnection {
    fn as_raw_fd(&self) -> RawFd {
        self.reader.as_raw_fd()
    }
}

impl Drop for FifoConnection {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.read_path) {
            tracing::warn!("[fifo]: unlink {} error: {e}", self.read_path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use flatkv_memory::CacheBuilder;

    use super::*;

    #[test_log::test]
    fn test_fifo_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let read_path = dir.path().join("in");
        let write_path = dir.path().join("out");
        let cache = CacheBuilder::new(1024).build().unwrap();

        let mut fifo = FifoConnection::open(&read_path, Some(&write_path), 1024).unwrap();

        // Open the response fifo for reading first so responses are not discarded.
        let mut responses = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&write_path)
            .unwrap();
        let mut commands = OpenOptions::new().write(true).open(&read_path).unwrap();

        commands.write_all(b"set k 0 0 2\r\nab\r\nget k\r\n").unwrap();
        fifo.on_readable(&cache).unwrap();

        let mut out = vec![0u8; 256];
        let n = responses.read(&mut out).unwrap();
        assert_eq!(&out[..n], b"STORED\r\nVALUE k 0 2\r\nab\r\nEND\r\n");

        drop(fifo);
        assert!(!read_path.exists());
    }

    #[test]
    fn test_fifo_without_reader_discards() {
        let dir = tempfile::tempdir().unwrap();
        let read_path = dir.path().join("in");
        let cache = CacheBuilder::new(1024).build().unwrap();

        let mut fifo = FifoConnection::open(&read_path, None, 1024).unwrap();
        let mut commands = OpenOptions::new().write(true).open(&read_path).unwrap();
        commands.write_all(b"set k 0 0 1\r\nx\r\nbogus\r\nset j 0 0 1\r\ny\r\n").unwrap();
        fifo.on_readable(&cache).unwrap();

        assert_eq!(cache.get(b"k").unwrap(), b"x");
        // The rest of the input after a protocol error is discarded.
        assert!(cache.get(b"j").is_none());
        assert!(fifo.output.is_empty());
    }
}
