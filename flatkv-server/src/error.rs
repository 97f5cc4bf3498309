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

/// Fault in a client request.
///
/// Every protocol error is reported to the client as `SERVER_ERROR <message>` and ends the connection.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The command name is not supported.
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    /// The command line has the wrong number or shape of arguments.
    #[error("bad command line format: {0}")]
    BadArguments(String),
    /// The key exceeds the maximum key length.
    #[error("key too long: {len} > {max}")]
    KeyTooLong {
        /// Length of the key.
        len: usize,
        /// Maximum key length.
        max: usize,
    },
    /// The key contains control characters.
    #[error("invalid key")]
    InvalidKey,
    /// The announced data block exceeds the configured maximum.
    #[error("object too large for cache: {size} > {max}")]
    BodyTooLarge {
        /// Announced size.
        size: usize,
        /// Maximum body size.
        max: usize,
    },
    /// The data block is not followed by `\r\n`.
    #[error("bad data chunk")]
    BadDataChunk,
    /// A command line exceeds the maximum line length.
    #[error("line too long")]
    LineTooLong,
}

/// Server error.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// Config error.
    #[error("config error: {0}")]
    Config(String),
}

/// Server result.
pub type Result<T> = std::result::Result<T, Error>;
