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

//! memcached text protocol subset.
//!
//! Supported commands:
//!
//! ```text
//! get <key>+
//! set <key> <flags> <exptime> <bytes> [noreply]\r\n<data>\r\n
//! add <key> <flags> <exptime> <bytes> [noreply]\r\n<data>\r\n
//! append <key> <flags> <exptime> <bytes> [noreply]\r\n<data>\r\n
//! delete <key> [noreply]
//! ```
//!
//! Flags and expiration times are parsed and ignored. Values are always returned with zero flags.

use bytes::{BufMut, Bytes, BytesMut};
use flatkv_common::storage::Storage;
use itertools::Itertools;

use crate::error::ProtocolError;

/// Maximum key length in bytes.
pub const MAX_KEY_LEN: usize = 250;

/// Maximum command line length in bytes, terminator excluded.
pub const MAX_LINE_LEN: usize = 8 * 1024;

/// A decoded client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Read one or more keys.
    Get {
        /// Keys to read.
        keys: Vec<Bytes>,
    },
    /// Store unconditionally.
    Set {
        /// Key.
        key: Bytes,
        /// Data block.
        data: Bytes,
        /// Suppress the response.
        noreply: bool,
    },
    /// Store only if the key is absent.
    Add {
        /// Key.
        key: Bytes,
        /// Data block.
        data: Bytes,
        /// Suppress the response.
        noreply: bool,
    },
    /// Append to the value of a present key.
    Append {
        /// Key.
        key: Bytes,
        /// Data block.
        data: Bytes,
        /// Suppress the response.
        noreply: bool,
    },
    /// Remove a key.
    Delete {
        /// Key.
        key: Bytes,
        /// Suppress the response.
        noreply: bool,
    },
}

impl Command {
    /// Apply the command to `storage` and append its response to `out`.
    pub fn execute<S>(self, storage: &S, out: &mut BytesMut)
    where
        S: Storage + ?Sized,
    {
        match self {
            Command::Get { keys } => {
                for key in keys {
                    if let Some(value) = storage.get(&key) {
                        out.put_slice(b"VALUE ");
                        out.put_slice(&key);
                        out.put_slice(b" 0 ");
                        out.put_slice(value.len().to_string().as_bytes());
                        out.put_slice(b"\r\n");
                        out.put_slice(&value);
                        out.put_slice(b"\r\n");
                    }
                }
                out.put_slice(b"END\r\n");
            }
            Command::Set { key, data, noreply } => {
                let stored = storage.put(&key, &data);
                reply(out, noreply, if stored { b"STORED\r\n" } else { b"NOT_STORED\r\n" });
            }
            Command::Add { key, data, noreply } => {
                let stored = storage.put_if_absent(&key, &data);
                reply(out, noreply, if stored { b"STORED\r\n" } else { b"NOT_STORED\r\n" });
            }
            Command::Append { key, data, noreply } => {
                // Read and write are two storage operations, a concurrent writer may interleave.
                let stored = match storage.get(&key) {
                    Some(mut value) => {
                        value.extend_from_slice(&data);
                        storage.set(&key, &value)
                    }
                    None => false,
                };
                reply(out, noreply, if stored { b"STORED\r\n" } else { b"NOT_STORED\r\n" });
            }
            Command::Delete { key, noreply } => {
                let deleted = storage.delete(&key);
                reply(out, noreply, if deleted { b"DELETED\r\n" } else { b"NOT_FOUND\r\n" });
            }
        }
    }
}

fn reply(out: &mut BytesMut, noreply: bool, msg: &[u8]) {
    if !noreply {
        out.put_slice(msg);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StoreKind {
    Set,
    Add,
    Append,
}

/// A storage command line waiting for its data block.
#[derive(Debug)]
struct PendingStore {
    kind: StoreKind,
    key: Bytes,
    len: usize,
    noreply: bool,
}

impl PendingStore {
    fn complete(self, data: Bytes) -> Command {
        let Self { kind, key, noreply, .. } = self;
        match kind {
            StoreKind::Set => Command::Set { key, data, noreply },
            StoreKind::Add => Command::Add { key, data, noreply },
            StoreKind::Append => Command::Append { key, data, noreply },
        }
    }
}

/// Incremental command decoder.
///
/// Input may arrive split at any byte. A partially received command line or data block stays in the buffer, or in
/// the decoder for a parsed line, until the rest arrives.
#[derive(Debug)]
pub struct Decoder {
    max_body_size: usize,
    pending: Option<PendingStore>,
}

impl Decoder {
    /// Create a decoder that refuses data blocks larger than `max_body_size`.
    pub fn new(max_body_size: usize) -> Self {
        Self {
            max_body_size,
            pending: None,
        }
    }

    /// Decode the next complete command from `buf`, consuming its bytes.
    ///
    /// Returns `Ok(None)` if `buf` does not hold a complete command yet.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Command>, ProtocolError> {
        loop {
            if let Some(pending) = self.pending.as_ref() {
                let len = pending.len;
                if buf.len() < len + 2 {
                    return Ok(None);
                }
                let mut data = buf.split_to(len + 2);
                if &data[len..] != b"\r\n" {
                    return Err(ProtocolError::BadDataChunk);
                }
                data.truncate(len);
                let Some(pending) = self.pending.take() else {
                    unreachable!()
                };
                return Ok(Some(pending.complete(data.freeze())));
            }

            let Some(pos) = buf.iter().position(|b| *b == b'\n') else {
                if buf.len() > MAX_LINE_LEN {
                    return Err(ProtocolError::LineTooLong);
                }
                return Ok(None);
            };
            if pos > MAX_LINE_LEN {
                return Err(ProtocolError::LineTooLong);
            }

            let line = buf.split_to(pos + 1).freeze();
            let end = if pos > 0 && line[pos - 1] == b'\r' { pos - 1 } else { pos };
            let line = line.slice(..end);
            if line.iter().all(|b| *b == b' ') {
                continue;
            }

            if let Some(command) = self.parse_line(line)? {
                return Ok(Some(command));
            }
        }
    }

    /// Parse a command line. Storage commands are parked in `pending` and yield `None`.
    fn parse_line(&mut self, line: Bytes) -> Result<Option<Command>, ProtocolError> {
        let tokens = line
            .split(|b| *b == b' ')
            .filter(|token| !token.is_empty())
            .map(|token| line.slice_ref(token))
            .collect_vec();
        let (name, args) = match tokens.split_first() {
            Some((name, args)) => (name, args),
            None => return Err(ProtocolError::BadArguments("empty command".to_string())),
        };

        match name.as_ref() {
            b"get" | b"gets" => {
                if args.is_empty() {
                    return Err(ProtocolError::BadArguments("get requires a key".to_string()));
                }
                for key in args {
                    check_key(key)?;
                }
                Ok(Some(Command::Get { keys: args.to_vec() }))
            }
            b"set" => self.parse_store(StoreKind::Set, args),
            b"add" => self.parse_store(StoreKind::Add, args),
            b"append" => self.parse_store(StoreKind::Append, args),
            b"delete" => {
                let (key, noreply) = match args {
                    [key] => (key, false),
                    [key, flag] => (key, parse_noreply(flag)?),
                    _ => return Err(ProtocolError::BadArguments("delete <key> [noreply]".to_string())),
                };
                check_key(key)?;
                Ok(Some(Command::Delete {
                    key: key.clone(),
                    noreply,
                }))
            }
            _ => Err(ProtocolError::UnknownCommand(
                String::from_utf8_lossy(name).into_owned(),
            )),
        }
    }

    fn parse_store(&mut self, kind: StoreKind, args: &[Bytes]) -> Result<Option<Command>, ProtocolError> {
        let (key, flags, exptime, len, noreply) = match args {
            [key, flags, exptime, len] => (key, flags, exptime, len, false),
            [key, flags, exptime, len, flag] => (key, flags, exptime, len, parse_noreply(flag)?),
            _ => {
                return Err(ProtocolError::BadArguments(
                    "<command> <key> <flags> <exptime> <bytes> [noreply]".to_string(),
                ))
            }
        };
        check_key(key)?;
        parse_number::<u32>(flags, "flags")?;
        parse_number::<i64>(exptime, "exptime")?;
        let len = parse_number::<usize>(len, "bytes")?;
        if len > self.max_body_size {
            return Err(ProtocolError::BodyTooLarge {
                size: len,
                max: self.max_body_size,
            });
        }

        self.pending = Some(PendingStore {
            kind,
            key: key.clone(),
            len,
            noreply,
        });
        Ok(None)
    }
}

fn check_key(key: &[u8]) -> Result<(), ProtocolError> {
    if key.len() > MAX_KEY_LEN {
        return Err(ProtocolError::KeyTooLong {
            len: key.len(),
            max: MAX_KEY_LEN,
        });
    }
    if key.iter().any(|b| b.is_ascii_control()) {
        return Err(ProtocolError::InvalidKey);
    }
    Ok(())
}

fn parse_noreply(token: &[u8]) -> Result<bool, ProtocolError> {
    match token {
        b"noreply" => Ok(true),
        _ => Err(ProtocolError::BadArguments(format!(
            "unexpected argument: {}",
            String::from_utf8_lossy(token)
        ))),
    }
}

fn parse_number<T: std::str::FromStr>(token: &[u8], name: &str) -> Result<T, ProtocolError> {
    std::str::from_utf8(token)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ProtocolError::BadArguments(format!("invalid {name}: {}", String::from_utf8_lossy(token))))
}

/// Per-connection protocol state.
#[derive(Debug)]
pub struct Session {
    decoder: Decoder,
}

impl Session {
    /// Create a session that refuses data blocks larger than `max_body_size`.
    pub fn new(max_body_size: usize) -> Self {
        Self {
            decoder: Decoder::new(max_body_size),
        }
    }

    /// Execute every complete command in `input` and append the responses to `output`.
    ///
    /// Returns `false` if the connection must be closed. In that case `output` ends with a `SERVER_ERROR` line and
    /// the remaining input has been discarded.
    pub fn process<S>(&mut self, storage: &S, input: &mut BytesMut, output: &mut BytesMut) -> bool
    where
        S: Storage + ?Sized,
    {
        loop {
            match self.decoder.decode(input) {
                Ok(Some(command)) => {
                    tracing::trace!("[session]: execute {command:?}");
                    command.execute(storage, output);
                }
                Ok(None) => return true,
                Err(e) => {
                    tracing::debug!("[session]: protocol error: {e}");
                    output.put_slice(b"SERVER_ERROR ");
                    output.put_slice(e.to_string().as_bytes());
                    output.put_slice(b"\r\n");
                    input.clear();
                    return false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use flatkv_memory::CacheBuilder;
    use rand::{rngs::SmallRng, Rng, SeedableRng};

    use super::*;

    fn decode_all(input: &[u8]) -> Result<Vec<Command>, ProtocolError> {
        let mut decoder = Decoder::new(1024);
        let mut buf = BytesMut::from(input);
        let mut commands = vec![];
        while let Some(command) = decoder.decode(&mut buf)? {
            commands.push(command);
        }
        assert!(buf.is_empty(), "undecoded input: {buf:?}");
        Ok(commands)
    }

    fn run(session: &mut Session, storage: &impl Storage, input: &[u8]) -> (bool, String) {
        let mut input = BytesMut::from(input);
        let mut output = BytesMut::new();
        let open = session.process(storage, &mut input, &mut output);
        (open, String::from_utf8(output.to_vec()).unwrap())
    }

    #[test]
    fn test_decode_commands() {
        let commands = decode_all(
            b"get a bb\r\nset k 5 0 3\r\nabc\r\nadd k 0 0 0 noreply\r\n\r\nappend k 0 0 1\r\nz\r\ndelete k\r\n",
        )
        .unwrap();
        assert_eq!(
            commands,
            vec![
                Command::Get {
                    keys: vec![Bytes::from_static(b"a"), Bytes::from_static(b"bb")]
                },
                Command::Set {
                    key: Bytes::from_static(b"k"),
                    data: Bytes::from_static(b"abc"),
                    noreply: false
                },
                Command::Add {
                    key: Bytes::from_static(b"k"),
                    data: Bytes::new(),
                    noreply: true
                },
                Command::Append {
                    key: Bytes::from_static(b"k"),
                    data: Bytes::from_static(b"z"),
                    noreply: false
                },
                Command::Delete {
                    key: Bytes::from_static(b"k"),
                    noreply: false
                },
            ]
        );
    }

    #[test]
    fn test_decode_byte_by_byte() {
        let input = b"set key 0 0 10\r\n0123\r\n6789\r\nget key\n";
        let mut decoder = Decoder::new(1024);
        let mut buf = BytesMut::new();
        let mut commands = vec![];
        for b in input {
            buf.put_u8(*b);
            if let Some(command) = decoder.decode(&mut buf).unwrap() {
                commands.push(command);
            }
        }
        assert_eq!(commands.len(), 2);
        assert_eq!(
            commands[0],
            Command::Set {
                key: Bytes::from_static(b"key"),
                data: Bytes::from_static(b"0123\r\n6789"),
                noreply: false
            }
        );
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(
            decode_all(b"incr k 1\r\n"),
            Err(ProtocolError::UnknownCommand("incr".to_string()))
        );
        assert!(matches!(decode_all(b"get\r\n"), Err(ProtocolError::BadArguments(_))));
        assert!(matches!(decode_all(b"set k 0 0\r\n"), Err(ProtocolError::BadArguments(_))));
        assert!(matches!(decode_all(b"set k x 0 1\r\n"), Err(ProtocolError::BadArguments(_))));
        assert!(matches!(decode_all(b"set k 0 0 1 please\r\n"), Err(ProtocolError::BadArguments(_))));
        assert_eq!(
            decode_all(b"set k 0 0 4096\r\n"),
            Err(ProtocolError::BodyTooLarge { size: 4096, max: 1024 })
        );
        assert_eq!(decode_all(b"set k 0 0 1\r\nab\r\n"), Err(ProtocolError::BadDataChunk));

        let key = "k".repeat(MAX_KEY_LEN + 1);
        assert!(matches!(
            decode_all(format!("get {key}\r\n").as_bytes()),
            Err(ProtocolError::KeyTooLong { .. })
        ));
        assert_eq!(decode_all(b"get a\x07b\r\n"), Err(ProtocolError::InvalidKey));
        assert_eq!(
            decode_all(&vec![b'x'; MAX_LINE_LEN + 1]),
            Err(ProtocolError::LineTooLong)
        );
    }

    #[test]
    fn test_session() {
        let cache = CacheBuilder::new(1024).build().unwrap();
        let mut session = Session::new(1024);

        let (open, out) = run(&mut session, &cache, b"get k\r\n");
        assert!(open);
        assert_eq!(out, "END\r\n");

        let (_, out) = run(&mut session, &cache, b"append k 0 0 1\r\nx\r\nset k 0 0 2\r\nab\r\nadd k 0 0 1\r\nc\r\n");
        assert_eq!(out, "NOT_STORED\r\nSTORED\r\nNOT_STORED\r\n");

        let (_, out) = run(&mut session, &cache, b"append k 0 0 2 noreply\r\ncd\r\nget k missing k\r\n");
        assert_eq!(out, "VALUE k 0 4\r\nabcd\r\nVALUE k 0 4\r\nabcd\r\nEND\r\n");

        let (_, out) = run(&mut session, &cache, b"delete k\r\ndelete k\r\n");
        assert_eq!(out, "DELETED\r\nNOT_FOUND\r\n");
    }

    #[test]
    fn test_session_stored_on_capacity_rejection() {
        let cache = CacheBuilder::new(4).build().unwrap();
        let mut session = Session::new(1024);
        let (_, out) = run(&mut session, &cache, b"set key 0 0 2\r\nvv\r\nset k 0 0 2\r\nvv\r\n");
        assert_eq!(out, "NOT_STORED\r\nSTORED\r\n");
    }

    #[test]
    fn test_session_error_closes() {
        let cache = CacheBuilder::new(1024).build().unwrap();
        let mut session = Session::new(1024);
        let (open, out) = run(&mut session, &cache, b"set k 0 0 1\r\na\r\nbogus\r\nget k\r\n");
        assert!(!open);
        assert_eq!(out, "STORED\r\nSERVER_ERROR unknown command: bogus\r\n");
    }

    #[test]
    fn test_session_random_chunks() {
        let mut request = vec![];
        let mut expected = String::new();
        for i in 0..100 {
            let value = "v".repeat(i % 7);
            request.extend(format!("set key{i} 0 0 {}\r\n{value}\r\nget key{i}\r\n", value.len()).into_bytes());
            expected.push_str(&format!("STORED\r\nVALUE key{i} 0 {}\r\n{value}\r\nEND\r\n", value.len()));
        }

        let cache = CacheBuilder::new(1024 * 1024).build().unwrap();
        let mut rng = SmallRng::seed_from_u64(7);
        let mut session = Session::new(1024);
        let mut input = BytesMut::new();
        let mut output = BytesMut::new();
        let mut rest = &request[..];
        while !rest.is_empty() {
            let n = rng.random_range(1..=rest.len().min(32));
            input.extend_from_slice(&rest[..n]);
            rest = &rest[n..];
            assert!(session.process(&cache, &mut input, &mut output));
        }
        assert!(input.is_empty());
        assert_eq!(String::from_utf8(output.to_vec()).unwrap(), expected);
    }
}
