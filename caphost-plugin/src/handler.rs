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

//! What a plugin author implements, and what the runtime hands them:
//! [`Handler`], the argument/response stream types it sees, and
//! [`PluginCtx`] for making its own requests back to the host.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use caphost_protocol::{chunk_body, Frame, FrameBody, RemoteError, Rid, WriterHandle, Xid};
use caphost_urn::CapUrn;

use crate::dispatch::PeerCallTable;

/// One argument stream delivered with a request. Fully reassembled
/// before the handler runs; a handler that wants to stream its own
/// input incrementally is not what this variant is for.
pub struct InputStream {
    pub stream_id: String,
    pub media: String,
    pub data: Vec<u8>,
}

/// The argument streams of one incoming request, in `STREAM_START`
/// arrival order, plus whatever the `REQ` and `END` frames carried
/// inline.
pub struct InputPackage {
    pub cap: CapUrn,
    pub content_type: Option<String>,
    pub inline: Vec<u8>,
    pub streams: Vec<InputStream>,
}

impl InputPackage {
    pub fn stream(&self, id: &str) -> Option<&InputStream> {
        self.streams.iter().find(|s| s.stream_id == id)
    }

    /// The inline payload followed by every argument stream's data, in
    /// arrival order. Handlers that don't care about stream boundaries
    /// (identity, discard) use this directly.
    pub fn flatten(&self) -> Vec<u8> {
        let mut out = self.inline.clone();
        for s in &self.streams {
            out.extend_from_slice(&s.data);
        }
        out
    }
}

/// A response stream a handler writes to. Sends `STREAM_START` lazily on
/// the first write; `STREAM_END` is sent when the stream is dropped, so
/// a handler that never writes to it never opens a stream at all.
pub struct OutputStream {
    rid: Rid,
    xid: Option<Xid>,
    stream_id: String,
    media: String,
    max_chunk: u32,
    next_index: u64,
    started: bool,
    writer: Arc<WriterHandle<io::Stdout>>,
}

impl OutputStream {
    fn new(
        rid: Rid,
        xid: Option<Xid>,
        stream_id: impl Into<String>,
        media: impl Into<String>,
        max_chunk: u32,
        writer: Arc<WriterHandle<io::Stdout>>,
    ) -> Self {
        OutputStream { rid, xid, stream_id: stream_id.into(), media: media.into(), max_chunk, next_index: 0, started: false, writer }
    }

    fn ensure_started(&mut self) {
        if !self.started {
            let _ = self.writer.send(Frame::new(
                self.rid,
                self.xid,
                FrameBody::StreamStart { stream_id: self.stream_id.clone(), media: self.media.clone() },
            ));
            self.started = true;
        }
    }

    /// Writes `bytes`, splitting into `max_chunk`-sized `CHUNK` frames.
    pub fn write(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.ensure_started();
        let max = self.max_chunk.max(1) as usize;
        for piece in bytes.chunks(max) {
            let _ =
                self.writer.send(Frame::new(self.rid, self.xid, chunk_body(self.stream_id.clone(), self.next_index, piece.to_vec())));
            self.next_index += 1;
        }
    }

    /// Serializes `value` as CBOR and writes it as one chunk.
    pub fn emit_cbor<T: serde::Serialize>(&mut self, value: &T) -> Result<(), serde_cbor::Error> {
        let bytes = serde_cbor::to_vec(value)?;
        self.write(&bytes);
        Ok(())
    }

    fn close(&mut self) {
        if self.started {
            let _ = self
                .writer
                .send(Frame::new(self.rid, self.xid, FrameBody::StreamEnd { stream_id: self.stream_id.clone(), chunk_count: self.next_index }));
            self.started = false;
        }
    }
}

impl Drop for OutputStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// A peer invoke this plugin is building up: a target cap plus its
/// argument streams.
pub struct PeerCall {
    cap: CapUrn,
    args: Vec<(String, String, Vec<u8>)>,
    writer: Arc<WriterHandle<io::Stdout>>,
    peer_calls: Arc<PeerCallTable>,
}

impl PeerCall {
    /// Adds one argument stream.
    pub fn arg(mut self, media: impl Into<String>, bytes: Vec<u8>) -> Self {
        let stream_id = self.args.len().to_string();
        self.args.push((stream_id, media.into(), bytes));
        self
    }

    /// Sends the request and blocks for its single response stream.
    pub fn finish(self, timeout: Option<Duration>) -> Result<InputStream, RemoteError> {
        crate::dispatch::call_peer(&self.writer, &self.peer_calls, self.cap, self.args, timeout)
    }
}

/// Handed to a [`Handler`] for the lifetime of one request: where to
/// write responses, and how to invoke another capability itself.
///
/// Owns an `Arc` to the writer and peer-call table rather than borrowing
/// them, since each request's handler runs on its own worker thread (see
/// `PluginRuntime::dispatch`) and a handler blocked in `call` must not
/// starve the reader thread that completes it.
pub struct PluginCtx {
    pub rid: Rid,
    pub xid: Option<Xid>,
    writer: Arc<WriterHandle<io::Stdout>>,
    peer_calls: Arc<PeerCallTable>,
    max_chunk: u32,
}

impl PluginCtx {
    pub(crate) fn new(rid: Rid, xid: Option<Xid>, writer: Arc<WriterHandle<io::Stdout>>, peer_calls: Arc<PeerCallTable>, max_chunk: u32) -> Self {
        PluginCtx { rid, xid, writer, peer_calls, max_chunk }
    }

    /// Opens a new response stream under this request's `rid`/`xid`.
    pub fn output(&self, stream_id: impl Into<String>, media: impl Into<String>) -> OutputStream {
        OutputStream::new(self.rid, self.xid, stream_id, media, self.max_chunk, Arc::clone(&self.writer))
    }

    /// Starts a peer invoke to another capability, routed the way the
    /// host's peer-invoke strategy decides.
    pub fn call(&self, cap: CapUrn) -> PeerCall {
        PeerCall { cap, args: Vec::new(), writer: Arc::clone(&self.writer), peer_calls: Arc::clone(&self.peer_calls) }
    }
}

/// Implemented once per capability a plugin serves. `cap:` (identity)
/// and the discard capability are always registered without this.
pub trait Handler: Send {
    fn handle_request(&mut self, ctx: &PluginCtx, pkg: InputPackage) -> Result<(), RemoteError>;
}

pub(crate) struct IdentityHandler;

impl Handler for IdentityHandler {
    fn handle_request(&mut self, ctx: &PluginCtx, pkg: InputPackage) -> Result<(), RemoteError> {
        let mut out = ctx.output("0", "media:");
        out.write(&pkg.flatten());
        Ok(())
    }
}

pub(crate) struct DiscardHandler;

impl Handler for DiscardHandler {
    fn handle_request(&mut self, _ctx: &PluginCtx, _pkg: InputPackage) -> Result<(), RemoteError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkg(inline: &[u8], streams: Vec<(&str, &str, &[u8])>) -> InputPackage {
        InputPackage {
            cap: CapUrn::identity(),
            content_type: None,
            inline: inline.to_vec(),
            streams: streams
                .into_iter()
                .map(|(id, media, data)| InputStream { stream_id: id.into(), media: media.into(), data: data.to_vec() })
                .collect(),
        }
    }

    #[test]
    fn flatten_concatenates_inline_then_streams_in_order() {
        let p = pkg(b"a", vec![("0", "media:", b"b"), ("1", "media:", b"c")]);
        assert_eq!(p.flatten(), b"abc");
    }

    #[test]
    fn stream_looks_up_by_id() {
        let p = pkg(b"", vec![("0", "media:text/plain", b"hi")]);
        assert_eq!(p.stream("0").unwrap().media, "media:text/plain");
        assert!(p.stream("missing").is_none());
    }
}
