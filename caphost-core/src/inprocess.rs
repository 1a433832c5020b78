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

//! In-process capability providers: handlers that live in the host's own
//! address space and answer requests without a child process or a pipe.
//! Externally this speaks the same frame protocol a plugin does, so a
//! relay cannot tell the difference; internally there is no handshake, no
//! stdin/stdout, and `cap:` (identity) is served by a built-in
//! passthrough rather than negotiated.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;

use caphost_protocol::{chunk_body, ErrCode, Frame, FrameBody, RemoteError, Rid, WriterHandle, Xid};
use caphost_urn::{best_match, CapUrn};

/// A capability implemented in-process. `invoke` is synchronous and
/// receives the fully reassembled request body (the concatenation of
/// every `CHUNK` plus any trailing `END` payload); it is not a fit for a
/// handler that needs to stream its own output incrementally, which is
/// the tradeoff for this variant's simplicity.
pub trait InProcessHandler: Send + Sync {
    fn invoke(&self, input: &[u8]) -> Result<Vec<u8>, RemoteError>;
}

struct IdentityHandler;

impl InProcessHandler for IdentityHandler {
    fn invoke(&self, input: &[u8]) -> Result<Vec<u8>, RemoteError> {
        Ok(input.to_vec())
    }
}

#[derive(Default)]
struct Registry {
    entries: Vec<(CapUrn, Arc<dyn InProcessHandler>)>,
}

impl Registry {
    fn insert(&mut self, cap: CapUrn, handler: Arc<dyn InProcessHandler>) {
        self.entries.push((cap, handler));
    }

    fn route(&self, requested: &CapUrn) -> Option<Arc<dyn InProcessHandler>> {
        best_match(requested, self.entries.iter().map(|(cap, h)| (cap, Arc::clone(h))))
    }
}

struct Assembly {
    cap: CapUrn,
    xid: Option<Xid>,
    chunks: BTreeMap<u64, Vec<u8>>,
}

/// Drives the in-process capability set against the same frame sequence
/// a plugin's stdin/stdout would see. One `InProcessHost` is meant to be
/// driven by a single thread, same as [`crate::router::Host`].
pub struct InProcessHost<W> {
    registry: Registry,
    pending: std::collections::HashMap<Rid, Assembly>,
    writer: WriterHandle<W>,
}

impl<W: Write> InProcessHost<W> {
    pub fn new(writer: WriterHandle<W>) -> Self {
        let mut registry = Registry::default();
        registry.insert(CapUrn::identity(), Arc::new(IdentityHandler));
        InProcessHost { registry, pending: std::collections::HashMap::new(), writer }
    }

    pub fn register(&mut self, cap: CapUrn, handler: Arc<dyn InProcessHandler>) {
        self.registry.insert(cap, handler);
    }

    /// True if some registered cap (including the built-in identity) can
    /// answer `cap`, without actually invoking anything.
    pub fn can_handle(&self, cap: &CapUrn) -> bool {
        self.registry.route(cap).is_some()
    }

    /// Feeds one frame of an in-flight request cycle. Call for every
    /// frame addressed to this host, in arrival order.
    pub fn handle_frame(&mut self, frame: Frame) {
        let rid = frame.header.rid;
        match frame.body {
            FrameBody::Req { cap, .. } => match CapUrn::parse(&cap) {
                Ok(cap) => {
                    self.pending.insert(rid, Assembly { cap, xid: frame.header.xid, chunks: BTreeMap::new() });
                }
                Err(_) => {
                    self.send_err(rid, frame.header.xid, ErrCode::InvalidCapUrn, format!("invalid cap urn {:?}", cap));
                }
            },
            FrameBody::Chunk { index, payload, .. } => {
                if let Some(assembly) = self.pending.get_mut(&rid) {
                    assembly.chunks.insert(index, payload);
                }
            }
            FrameBody::StreamStart { .. } | FrameBody::StreamEnd { .. } => {}
            FrameBody::End { payload } => {
                if let Some(assembly) = self.pending.remove(&rid) {
                    self.finish_request(rid, assembly, payload);
                }
            }
            FrameBody::Err { .. } => {
                self.pending.remove(&rid);
            }
            FrameBody::Heartbeat => {
                let _ = self.writer.send(Frame::new(rid, None, FrameBody::Heartbeat));
            }
            FrameBody::Hello { .. } | FrameBody::Log { .. } | FrameBody::RelayNotify { .. } | FrameBody::RelayState { .. } => {
                // Not meaningful on this seam; the host never negotiates
                // limits or publishes capability lists for in-process
                // handlers, so these are silently ignored.
            }
        }
    }

    fn finish_request(&mut self, rid: Rid, assembly: Assembly, trailing: Option<Vec<u8>>) {
        let mut input = Vec::new();
        for (_, chunk) in assembly.chunks {
            input.extend_from_slice(&chunk);
        }
        if let Some(extra) = trailing {
            input.extend_from_slice(&extra);
        }

        let handler = match self.registry.route(&assembly.cap) {
            Some(h) => h,
            None => {
                self.send_err(rid, assembly.xid, ErrCode::NoHandler, format!("no in-process handler for {}", assembly.cap));
                return;
            }
        };

        match handler.invoke(&input) {
            Ok(output) => {
                let xid = assembly.xid;
                let _ = self.writer.send(Frame::new(rid, xid, FrameBody::StreamStart { stream_id: "0".into(), media: "media:".into() }));
                let _ = self.writer.send(Frame::new(rid, xid, chunk_body("0", 0, output)));
                let _ = self.writer.send(Frame::new(rid, xid, FrameBody::StreamEnd { stream_id: "0".into(), chunk_count: 1 }));
                let _ = self.writer.send(Frame::new(rid, xid, FrameBody::End { payload: None }));
            }
            Err(remote) => {
                let _ = self.writer.send(Frame::new(
                    rid,
                    assembly.xid,
                    FrameBody::Err { code: remote.code, message: remote.message },
                ));
            }
        }
    }

    fn send_err(&self, rid: Rid, xid: Option<Xid>, code: ErrCode, message: impl Into<String>) {
        let _ = self.writer.send(Frame::new(rid, xid, FrameBody::Err { code: code.as_str().into(), message: message.into() }));
    }
}
