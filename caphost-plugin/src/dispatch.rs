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

//! The plugin-side mainloop: one reader thread feeding one dispatch
//! thread, mirroring the host's own single-dispatcher-thread design but
//! for a single peer instead of a fan-in of many. The reader thread also
//! services this plugin's own outgoing peer-invoke calls directly, so a
//! handler that blocks mid-request on `ctx.call(..)` never deadlocks
//! against its own reader.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use caphost_protocol::{
    chunk_body, spawn_reader_thread, ErrCode, Error as WireError, Frame, FrameBody, FramedReader, FramedWriter, Limits, RemoteError, Rid,
    WriterHandle, Xid,
};
use caphost_urn::{best_match, CapUrn};

use crate::handler::{DiscardHandler, Handler, IdentityHandler, InputPackage, InputStream, PluginCtx};

struct PeerCallSlot {
    stream_id: String,
    media: String,
    chunks: BTreeMap<u64, Vec<u8>>,
    done: Option<Sender<Result<InputStream, RemoteError>>>,
}

/// Tracks this plugin's own outgoing peer-invoke calls, keyed by the
/// `rid` the call was sent under. Shared between the reader thread
/// (which feeds it directly) and whichever thread is blocked in
/// [`call_peer`].
pub(crate) struct PeerCallTable {
    slots: Mutex<HashMap<Rid, PeerCallSlot>>,
}

impl PeerCallTable {
    fn new() -> Self {
        PeerCallTable { slots: Mutex::new(HashMap::new()) }
    }

    fn begin(&self, rid: Rid) -> Receiver<Result<InputStream, RemoteError>> {
        let (tx, rx) = mpsc::channel();
        self.slots.lock().unwrap().insert(
            rid,
            PeerCallSlot { stream_id: String::new(), media: String::new(), chunks: BTreeMap::new(), done: Some(tx) },
        );
        rx
    }

    fn abort(&self, rid: Rid) {
        self.slots.lock().unwrap().remove(&rid);
    }

    /// Feeds one frame to this table. Returns `true` if `frame`'s `rid`
    /// belonged to a pending call (it was consumed here), `false` if the
    /// caller should treat it as an ordinary incoming frame.
    fn handle(&self, frame: &Frame) -> bool {
        let rid = frame.header.rid;
        let mut slots = self.slots.lock().unwrap();
        if !slots.contains_key(&rid) {
            return false;
        }
        let mut finished = None;
        if let Some(slot) = slots.get_mut(&rid) {
            match &frame.body {
                FrameBody::StreamStart { stream_id, media } => {
                    slot.stream_id = stream_id.clone();
                    slot.media = media.clone();
                }
                FrameBody::Chunk { index, payload, .. } => {
                    slot.chunks.insert(*index, payload.clone());
                }
                FrameBody::StreamEnd { .. } => {}
                FrameBody::End { payload } => {
                    let mut data = Vec::new();
                    for (_, chunk) in std::mem::take(&mut slot.chunks) {
                        data.extend_from_slice(&chunk);
                    }
                    if let Some(extra) = payload {
                        data.extend_from_slice(extra);
                    }
                    let result = Ok(InputStream { stream_id: slot.stream_id.clone(), media: slot.media.clone(), data });
                    finished = slot.done.take().map(|tx| (tx, result));
                }
                FrameBody::Err { code, message } => {
                    let err = RemoteError { code: code.clone(), message: message.clone() };
                    finished = slot.done.take().map(|tx| (tx, Err(err)));
                }
                _ => {}
            }
        }
        if finished.is_some() {
            slots.remove(&rid);
        }
        drop(slots);
        if let Some((tx, result)) = finished {
            let _ = tx.send(result);
        }
        true
    }
}

/// Sends a peer-invoke request and blocks for its single response
/// stream. Each argument is sent as its own one-chunk stream.
pub(crate) fn call_peer(
    writer: &WriterHandle<io::Stdout>,
    table: &PeerCallTable,
    cap: CapUrn,
    args: Vec<(String, String, Vec<u8>)>,
    timeout: Option<Duration>,
) -> Result<InputStream, RemoteError> {
    let rid = Rid::new();
    let rx = table.begin(rid);

    let sent: Result<(), WireError> = (|| {
        writer.send(Frame::new(rid, None, FrameBody::Req { cap: cap.to_string(), content_type: None, payload: Vec::new() }))?;
        for (stream_id, media, data) in &args {
            writer.send(Frame::new(rid, None, FrameBody::StreamStart { stream_id: stream_id.clone(), media: media.clone() }))?;
            writer.send(Frame::new(rid, None, chunk_body(stream_id.clone(), 0, data.clone())))?;
            writer.send(Frame::new(rid, None, FrameBody::StreamEnd { stream_id: stream_id.clone(), chunk_count: 1 }))?;
        }
        writer.send(Frame::new(rid, None, FrameBody::End { payload: None }))
    })();

    if sent.is_err() {
        table.abort(rid);
        return Err(RemoteError::new(ErrCode::ProtocolError, "failed writing peer invoke request"));
    }

    let result = match timeout {
        Some(d) => rx.recv_timeout(d).map_err(|_| RemoteError::new(ErrCode::ProtocolError, "peer invoke timed out")),
        None => rx.recv().map_err(|_| RemoteError::new(ErrCode::ProtocolError, "host closed before responding")),
    };
    result.and_then(|r| r)
}

struct IncomingAssembly {
    cap: CapUrn,
    xid: Option<Xid>,
    content_type: Option<String>,
    inline: Vec<u8>,
    stream_order: Vec<String>,
    stream_media: HashMap<String, String>,
    stream_chunks: HashMap<String, BTreeMap<u64, Vec<u8>>>,
}

/// Each registered handler is behind its own mutex rather than the whole
/// registry behind one, so two different caps dispatch concurrently; two
/// in-flight requests for the *same* cap still serialize on that cap's
/// handler instance.
struct Registry {
    entries: Vec<(CapUrn, Arc<Mutex<Box<dyn Handler>>>)>,
}

impl Registry {
    fn route_index(&self, requested: &CapUrn) -> Option<usize> {
        best_match(requested, self.entries.iter().enumerate().map(|(i, (cap, _))| (cap, i)))
    }

    fn caps(&self) -> Vec<CapUrn> {
        self.entries.iter().map(|(c, _)| c.clone()).collect()
    }
}

enum PluginEvent {
    Frame(Frame),
    Closed,
}

/// Drives a plugin process: handshake, identity probe response, and the
/// request dispatch loop, until the host closes its end of the pipe.
pub struct PluginRuntime {
    registry: Registry,
}

impl Default for PluginRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginRuntime {
    /// A runtime with only the two standard handlers registered.
    pub fn new() -> Self {
        let entries: Vec<(CapUrn, Arc<Mutex<Box<dyn Handler>>>)> = vec![
            (CapUrn::identity(), Arc::new(Mutex::new(Box::new(IdentityHandler) as Box<dyn Handler>))),
            (
                "cap:in=media:;out=media:void".parse().expect("valid literal cap urn"),
                Arc::new(Mutex::new(Box::new(DiscardHandler) as Box<dyn Handler>)),
            ),
        ];
        PluginRuntime { registry: Registry { entries } }
    }

    /// Registers a handler for `cap`. Later registrations for an
    /// equally-specific overlapping cap are not an error; `best_match`'s
    /// first-registered-wins tie-break applies, same as the host's
    /// `CapTable`.
    pub fn register(&mut self, cap: CapUrn, handler: Box<dyn Handler>) {
        self.registry.entries.push((cap, Arc::new(Mutex::new(handler))));
    }

    fn manifest(&self) -> serde_json::Value {
        let caps: Vec<serde_json::Value> = self.registry.caps().iter().map(|c| serde_json::json!({ "urn": c.to_string() })).collect();
        serde_json::json!({ "caps": caps })
    }

    /// Runs the handshake then the dispatch loop on the calling thread.
    /// Returns once the host closes stdin or a transport error occurs.
    pub fn run(mut self) -> Result<(), WireError> {
        let offer = Limits::default_offer();
        let mut reader = FramedReader::new(io::stdin(), offer.max_frame);

        let hello = reader.read_frame()?.ok_or(WireError::PeerGone)?;
        let their_limits = match hello.body {
            FrameBody::Hello { limits, .. } => limits,
            other => {
                return Err(WireError::Remote(RemoteError::new(
                    ErrCode::ProtocolError,
                    format!("expected HELLO, got {}", other_kind_name(&other)),
                )))
            }
        };
        let negotiated = Limits::negotiate(offer, their_limits);

        let writer = Arc::new(WriterHandle::new(FramedWriter::new(io::stdout(), negotiated.max_chunk)));
        writer.send(Frame::new(Rid::new(), None, FrameBody::Hello { limits: negotiated, manifest: Some(self.manifest()) }))?;

        let peer_calls = Arc::new(PeerCallTable::new());
        let (tx, rx) = mpsc::channel();
        let tx_frames = tx.clone();
        let pc_for_reader = Arc::clone(&peer_calls);
        spawn_reader_thread(
            reader,
            move |frame| {
                if !pc_for_reader.handle(&frame) {
                    let _ = tx_frames.send(PluginEvent::Frame(frame));
                }
            },
            move |_| {
                let _ = tx.send(PluginEvent::Closed);
            },
        );

        let mut pending: HashMap<Rid, IncomingAssembly> = HashMap::new();
        for event in rx {
            match event {
                PluginEvent::Frame(frame) => self.handle_frame(frame, &mut pending, &writer, &peer_calls, negotiated.max_chunk),
                PluginEvent::Closed => break,
            }
        }
        Ok(())
    }

    fn handle_frame(
        &mut self,
        frame: Frame,
        pending: &mut HashMap<Rid, IncomingAssembly>,
        writer: &Arc<WriterHandle<io::Stdout>>,
        peer_calls: &Arc<PeerCallTable>,
        max_chunk: u32,
    ) {
        let rid = frame.header.rid;
        match frame.body {
            FrameBody::Req { cap, content_type, payload } => {
                if !payload.is_empty() {
                    send_err(writer, rid, frame.header.xid, ErrCode::ProtocolError, "REQ payload must be empty");
                    return;
                }
                match CapUrn::parse(&cap) {
                    Ok(cap) => {
                        pending.insert(
                            rid,
                            IncomingAssembly {
                                cap,
                                xid: frame.header.xid,
                                content_type,
                                inline: payload,
                                stream_order: Vec::new(),
                                stream_media: HashMap::new(),
                                stream_chunks: HashMap::new(),
                            },
                        );
                    }
                    Err(_) => send_err(writer, rid, frame.header.xid, ErrCode::InvalidCapUrn, format!("invalid cap urn {:?}", cap)),
                }
            }
            FrameBody::StreamStart { stream_id, media } => {
                if let Some(a) = pending.get_mut(&rid) {
                    a.stream_order.push(stream_id.clone());
                    a.stream_media.insert(stream_id.clone(), media);
                    a.stream_chunks.entry(stream_id).or_default();
                }
            }
            FrameBody::Chunk { stream_id, index, payload, .. } => {
                if let Some(a) = pending.get_mut(&rid) {
                    a.stream_chunks.entry(stream_id).or_default().insert(index, payload);
                }
            }
            FrameBody::StreamEnd { .. } => {}
            FrameBody::End { payload } => {
                if let Some(assembly) = pending.remove(&rid) {
                    self.dispatch(rid, assembly, payload, Arc::clone(writer), Arc::clone(peer_calls), max_chunk);
                }
            }
            FrameBody::Err { .. } => {
                pending.remove(&rid);
            }
            FrameBody::Heartbeat => {
                let _ = writer.send(Frame::new(rid, None, FrameBody::Heartbeat));
            }
            FrameBody::Hello { .. } | FrameBody::Log { .. } | FrameBody::RelayNotify { .. } | FrameBody::RelayState { .. } => {
                log::debug!("ignoring unexpected frame from host on rid {}", rid);
            }
        }
    }

    /// Routes `assembly` to its handler and runs it on its own thread. A
    /// handler that peer-invokes a cap served by this same plugin blocks
    /// that thread on the response, not the reader thread that has to
    /// deliver it — see `PluginCtx`.
    fn dispatch(
        &mut self,
        rid: Rid,
        assembly: IncomingAssembly,
        trailing: Option<Vec<u8>>,
        writer: Arc<WriterHandle<io::Stdout>>,
        peer_calls: Arc<PeerCallTable>,
        max_chunk: u32,
    ) {
        let xid = assembly.xid;
        let idx = match self.registry.route_index(&assembly.cap) {
            Some(idx) => idx,
            None => {
                send_err(&writer, rid, xid, ErrCode::NoHandler, format!("no handler registered for {}", assembly.cap));
                return;
            }
        };

        let streams = assembly
            .stream_order
            .iter()
            .map(|id| InputStream {
                stream_id: id.clone(),
                media: assembly.stream_media.get(id).cloned().unwrap_or_default(),
                data: assembly.stream_chunks.get(id).map(|chunks| chunks.values().flat_map(|c| c.iter().copied()).collect()).unwrap_or_default(),
            })
            .collect();

        let mut inline = assembly.inline;
        if let Some(extra) = trailing {
            inline.extend_from_slice(&extra);
        }
        let pkg = InputPackage { cap: assembly.cap, content_type: assembly.content_type, inline, streams };
        let handler = Arc::clone(&self.registry.entries[idx].1);

        thread::spawn(move || {
            let ctx = PluginCtx::new(rid, xid, Arc::clone(&writer), peer_calls, max_chunk);
            let _trace = caphost_trace::trace_block("PluginRuntime::dispatch", &["plugin"]);
            let result = handler.lock().unwrap().handle_request(&ctx, pkg);
            match result {
                Ok(()) => {
                    let _ = writer.send(Frame::new(rid, xid, FrameBody::End { payload: None }));
                }
                Err(e) => {
                    let _ = writer.send(Frame::new(rid, xid, FrameBody::Err { code: e.code, message: e.message }));
                }
            }
        });
    }
}

fn send_err(writer: &WriterHandle<io::Stdout>, rid: Rid, xid: Option<Xid>, code: ErrCode, message: impl Into<String>) {
    let _ = writer.send(Frame::new(rid, xid, FrameBody::Err { code: code.as_str().into(), message: message.into() }));
}

fn other_kind_name(body: &FrameBody) -> &'static str {
    match body {
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
