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

//! Error types: transport-level read failures, general peer errors, and
//! the `ERR` frame's own code/message shape.

use std::error::Error as StdError;
use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};

/// A failure while decoding a frame off the wire.
#[derive(Debug)]
pub enum ReadError {
    Io(io::Error),
    /// The frame's length prefix exceeded the negotiated or default
    /// `max_frame` limit.
    FrameTooLarge { len: u32, max: u32 },
    /// The frame bytes did not parse as a `Frame`.
    Malformed(serde_json::Error),
    /// A `CHUNK`'s declared checksum did not match its payload.
    ChecksumMismatch { stream_id: String, claimed: u32, actual: u32 },
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadError::Io(e) => write!(f, "i/o error reading frame: {}", e),
            ReadError::FrameTooLarge { len, max } => {
                write!(f, "frame of {} bytes exceeds max_frame {}", len, max)
            }
            ReadError::Malformed(e) => write!(f, "malformed frame: {}", e),
            ReadError::ChecksumMismatch { stream_id, claimed, actual } => write!(
                f,
                "checksum mismatch on stream {}: claimed {:#010x}, actual {:#010x}",
                stream_id, claimed, actual
            ),
        }
    }
}

impl StdError for ReadError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            ReadError::Io(e) => Some(e),
            ReadError::Malformed(e) => Some(e),
            ReadError::FrameTooLarge { .. } | ReadError::ChecksumMismatch { .. } => None,
        }
    }
}

impl From<io::Error> for ReadError {
    fn from(e: io::Error) -> Self {
        ReadError::Io(e)
    }
}

/// Stable machine-readable codes an `ERR` frame can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrCode {
    ProtocolError,
    InvalidRequest,
    NoHandler,
    SpawnFailed,
    PluginDied,
    HandlerError,
    InvalidCapUrn,
    PeerInvokeNotSupported,
}

impl ErrCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrCode::ProtocolError => "PROTOCOL_ERROR",
            ErrCode::InvalidRequest => "INVALID_REQUEST",
            ErrCode::NoHandler => "NO_HANDLER",
            ErrCode::SpawnFailed => "SPAWN_FAILED",
            ErrCode::PluginDied => "PLUGIN_DIED",
            ErrCode::HandlerError => "HANDLER_ERROR",
            ErrCode::InvalidCapUrn => "INVALID_CAP_URN",
            // The one wire code that isn't SCREAMING_SNAKE_CASE.
            ErrCode::PeerInvokeNotSupported => "peer-invoke-not-supported",
        }
    }
}

impl fmt::Display for ErrCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `REQ` answered with `ERR`, surfaced to the caller of a blocking
/// peer-invoke the way the host or a plugin peer would report it
/// locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    pub code: String,
    pub message: String,
}

impl RemoteError {
    pub fn new(code: ErrCode, message: impl Into<String>) -> Self {
        RemoteError { code: code.as_str().to_string(), message: message.into() }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl StdError for RemoteError {}

/// Errors a peer or host can encounter that are not themselves wire
/// frames: transport failure, a flow that vanished, or a local I/O
/// failure spawning/writing to a plugin.
#[derive(Debug)]
pub enum Error {
    Read(ReadError),
    Io(io::Error),
    Remote(RemoteError),
    /// The peer on the other end of this flow is gone; no response will
    /// ever arrive.
    PeerGone,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Read(e) => write!(f, "{}", e),
            Error::Io(e) => write!(f, "{}", e),
            Error::Remote(e) => write!(f, "{}", e),
            Error::PeerGone => write!(f, "peer disconnected before responding"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Read(e) => Some(e),
            Error::Io(e) => Some(e),
            Error::Remote(e) => Some(e),
            Error::PeerGone => None,
        }
    }
}

impl From<ReadError> for Error {
    fn from(e: ReadError) -> Self {
        Error::Read(e)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<RemoteError> for Error {
    fn from(e: RemoteError) -> Self {
        Error::Remote(e)
    }
}
