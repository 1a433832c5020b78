// Copyright 2024 The caphost Authors.
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

//! Host-level failures: handshake and spawn errors that never reach the
//! wire as a plain [`caphost_protocol::Error`] because they happen
//! before a plugin has a peer to report them to.

use std::fmt;
use std::io;

use caphost_protocol::{ErrCode, ReadError};

/// Why a spawn-and-handshake attempt failed.
#[derive(Debug)]
pub enum HandshakeError {
    Spawn(io::Error),
    Io(io::Error),
    Read(ReadError),
    /// The plugin's `HELLO` carried no manifest, or the manifest had no
    /// `cap:` (identity) entry.
    MissingManifest,
    /// The first frame after our `HELLO` was not itself a `HELLO`.
    UnexpectedFrame(&'static str),
    /// The identity probe's echoed bytes did not match the nonce we sent.
    IdentityMismatch,
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeError::Spawn(e) => write!(f, "failed to spawn plugin process: {}", e),
            HandshakeError::Io(e) => write!(f, "i/o error during handshake: {}", e),
            HandshakeError::Read(e) => write!(f, "error reading during handshake: {}", e),
            HandshakeError::MissingManifest => write!(f, "plugin HELLO missing manifest or identity cap"),
            HandshakeError::UnexpectedFrame(kind) => write!(f, "expected HELLO during handshake, got {}", kind),
            HandshakeError::IdentityMismatch => write!(f, "identity probe response did not match nonce"),
        }
    }
}

impl std::error::Error for HandshakeError {}

impl From<ReadError> for HandshakeError {
    fn from(e: ReadError) -> Self {
        HandshakeError::Read(e)
    }
}

impl HandshakeError {
    pub fn code(&self) -> ErrCode {
        ErrCode::SpawnFailed
    }
}
