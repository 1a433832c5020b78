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

//! The frame model: a discriminated union over the protocol's frame kinds,
//! plus the negotiated-limits and flow-key types that the codec and
//! sequencer build on.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{FlowKey, Rid, Xid};

/// Limits negotiated at handshake and enforced thereafter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    /// Largest encoded frame (length-prefix value) a peer will accept.
    pub max_frame: u32,
    /// Largest payload a single `CHUNK` may carry.
    pub max_chunk: u32,
    /// Bound on per-request reassembly buffering.
    pub max_reorder_buffer: u32,
}

impl Limits {
    /// A conservative default offer, generous enough for most plugins.
    pub fn default_offer() -> Self {
        Limits { max_frame: 16 * 1024 * 1024, max_chunk: 1024 * 1024, max_reorder_buffer: 64 }
    }

    /// Component-wise minimum of two limit offers: what both sides can
    /// live with.
    pub fn negotiate(a: Limits, b: Limits) -> Limits {
        Limits {
            max_frame: a.max_frame.min(b.max_frame),
            max_chunk: a.max_chunk.min(b.max_chunk),
            max_reorder_buffer: a.max_reorder_buffer.min(b.max_reorder_buffer),
        }
    }
}

/// Severity of a `LOG` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// The kind-specific payload of a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FrameBody {
    Hello { limits: Limits, #[serde(skip_serializing_if = "Option::is_none")] manifest: Option<Value> },
    Heartbeat,
    Req {
        cap: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        content_type: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty", with = "payload_b64")]
        payload: Vec<u8>,
    },
    StreamStart { stream_id: String, media: String },
    Chunk {
        stream_id: String,
        index: u64,
        checksum: u32,
        #[serde(with = "payload_b64")]
        payload: Vec<u8>,
    },
    StreamEnd { stream_id: String, chunk_count: u64 },
    End {
        #[serde(default, skip_serializing_if = "Option::is_none", with = "opt_payload_b64")]
        payload: Option<Vec<u8>>,
    },
    Err { code: String, message: String },
    Log { level: LogLevel, message: String },
    RelayNotify { manifest: Value },
    RelayState { resource: Value },
}

/// Raw binary payloads travel over the (JSON-ish) wire as base64, the way
/// a length-delimited binary envelope wrapping a textual payload
/// convention typically does; the envelope framing itself (§4.B/C) is what
/// this crate actually owns.
mod payload_b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(bytes).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

mod opt_payload_b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => STANDARD.encode(b).serialize(s),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let s: Option<String> = Option::deserialize(d)?;
        match s {
            Some(s) => STANDARD.decode(s.as_bytes()).map(Some).map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

/// Fields common to every frame kind.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameHeader {
    pub rid: Rid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xid: Option<Xid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

/// A complete protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(flatten)]
    pub header: FrameHeader,
    #[serde(flatten)]
    pub body: FrameBody,
}

impl Frame {
    pub fn new(rid: Rid, xid: Option<Xid>, body: FrameBody) -> Self {
        Frame { header: FrameHeader { rid, xid, seq: None }, body }
    }

    /// The flow this frame belongs to, for sequence assignment and
    /// routing-table lookups. `None` for frame kinds that never carry a
    /// flow seq (HELLO, HEARTBEAT, LOG, RELAY_*).
    pub fn flow_key(&self) -> Option<FlowKey> {
        match &self.body {
            FrameBody::Req { .. }
            | FrameBody::StreamStart { .. }
            | FrameBody::Chunk { .. }
            | FrameBody::StreamEnd { .. }
            | FrameBody::End { .. }
            | FrameBody::Err { .. } => Some(FlowKey::new(self.header.rid, self.header.xid)),
            FrameBody::Hello { .. }
            | FrameBody::Heartbeat
            | FrameBody::Log { .. }
            | FrameBody::RelayNotify { .. }
            | FrameBody::RelayState { .. } => None,
        }
    }

    /// True for the two frame kinds that end a flow and release its
    /// sequencer and routing-table entries.
    pub fn is_terminal(&self) -> bool {
        matches!(self.body, FrameBody::End { .. } | FrameBody::Err { .. })
    }

    pub fn kind_name(&self) -> &'static str {
        match &self.body {
            FrameBody::Hello { .. } => "HELLO",
            FrameBody::Heartbeat => "HEARTBEAT",
            FrameBody::Req { .. } => "REQ",
            FrameBody::StreamStart { .. } => "STREAM_START",
            FrameBody::Chunk { .. } => "CHUNK",
            FrameBody::StreamEnd { .. } => "STREAM_END",
            FrameBody::End { .. } => "END",
            FrameBody::Err { .. } => "ERR",
            FrameBody::Log { .. } => "LOG",
            FrameBody::RelayNotify { .. } => "RELAY_NOTIFY",
            FrameBody::RelayState { .. } => "RELAY_STATE",
        }
    }
}

/// Computes the checksum a `CHUNK` frame must carry for its payload.
pub fn checksum(payload: &[u8]) -> u32 {
    crc32fast::hash(payload)
}

/// Builds a `CHUNK` body with its checksum already filled in.
pub fn chunk_body(stream_id: impl Into<String>, index: u64, payload: Vec<u8>) -> FrameBody {
    let checksum = checksum(&payload);
    FrameBody::Chunk { stream_id: stream_id.into(), index, checksum, payload }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_key_present_only_for_flow_frames() {
        let rid = Rid::new();
        let req = Frame::new(
            rid,
            None,
            FrameBody::Req { cap: "cap:".into(), content_type: None, payload: vec![] },
        );
        assert!(req.flow_key().is_some());

        let hello = Frame::new(rid, None, FrameBody::Hello { limits: Limits::default_offer(), manifest: None });
        assert!(hello.flow_key().is_none());
    }

    #[test]
    fn chunk_checksum_round_trips_through_json() {
        let body = chunk_body("s0", 0, b"hello".to_vec());
        let frame = Frame::new(Rid::new(), None, body);
        let json = serde_json::to_string(&frame).unwrap();
        let back: Frame = serde_json::from_str(&json).unwrap();
        assert_eq!(frame, back);
        if let FrameBody::Chunk { checksum: c, payload, .. } = &back.body {
            assert_eq!(*c, checksum(payload));
        } else {
            panic!("expected chunk");
        }
    }

    #[test]
    fn terminal_frames() {
        let rid = Rid::new();
        let end = Frame::new(rid, None, FrameBody::End { payload: None });
        let err = Frame::new(rid, None, FrameBody::Err { code: "X".into(), message: "m".into() });
        let chunk = Frame::new(rid, None, chunk_body("s", 0, vec![]));
        assert!(end.is_terminal());
        assert!(err.is_terminal());
        assert!(!chunk.is_terminal());
    }
}
