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

//! A writer-side handle shared between threads: one mutex-guarded
//! [`FramedWriter`] plus the [`Sequencer`] bound to it, and a table of
//! in-flight requests for callers that want to block on a response.

use std::collections::HashMap;
use std::io::Write;
use std::sync::mpsc;
use std::sync::Mutex;
use std::time::Duration;

use crate::codec::FramedWriter;
use crate::error::Error;
use crate::frame::Frame;
use crate::ids::FlowKey;
use crate::sequencer::Sequencer;

struct WriterState<W> {
    writer: FramedWriter<W>,
    sequencer: Sequencer,
}

/// One outbound wire. Every frame sent through a given `WriterHandle`
/// gets its `seq` assigned by that handle's sequencer, under the same
/// lock that performs the write, so the two never drift apart.
pub struct WriterHandle<W> {
    state: Mutex<WriterState<W>>,
}

impl<W: Write> WriterHandle<W> {
    pub fn new(writer: FramedWriter<W>) -> Self {
        WriterHandle { state: Mutex::new(WriterState { writer, sequencer: Sequencer::new() }) }
    }

    /// Assigns `seq` (for flow-bearing frames) and writes the frame.
    /// Releases the flow's sequence counter if this is a terminal frame.
    pub fn send(&self, mut frame: Frame) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if let Some(key) = frame.flow_key() {
            frame.header.seq = Some(state.sequencer.assign(key));
        }
        let terminal = frame.is_terminal();
        let key = frame.flow_key();
        state.writer.write_frame(&frame)?;
        if terminal {
            if let Some(key) = key {
                state.sequencer.remove(key);
            }
        }
        Ok(())
    }
}

type PendingTable = Mutex<HashMap<FlowKey, mpsc::Sender<Frame>>>;

/// A peer able to both fire-and-forget frames and issue blocking
/// requests that wait for their matching response frame.
pub struct FramePeer<W> {
    writer: WriterHandle<W>,
    pending: PendingTable,
}

impl<W: Write> FramePeer<W> {
    pub fn new(writer: WriterHandle<W>) -> Self {
        FramePeer { writer, pending: Mutex::new(HashMap::new()) }
    }

    pub fn send(&self, frame: Frame) -> Result<(), Error> {
        self.writer.send(frame)
    }

    /// Sends `frame` and blocks for its response, which the reader side
    /// must hand back via [`FramePeer::complete`] keyed on `flow`.
    pub fn request(&self, flow: FlowKey, frame: Frame, timeout: Option<Duration>) -> Result<Frame, Error> {
        let (tx, rx) = mpsc::channel();
        self.pending.lock().unwrap().insert(flow, tx);
        if let Err(e) = self.writer.send(frame) {
            self.pending.lock().unwrap().remove(&flow);
            return Err(e);
        }
        let result = match timeout {
            Some(d) => rx.recv_timeout(d).map_err(|_| Error::PeerGone),
            None => rx.recv().map_err(|_| Error::PeerGone),
        };
        self.pending.lock().unwrap().remove(&flow);
        result
    }

    /// Routes a response frame to a waiting `request` caller. Returns
    /// `false` (the frame is handed back to the caller) if nothing is
    /// waiting on that flow, so the reader loop can treat it as an
    /// unsolicited frame instead.
    pub fn complete(&self, flow: FlowKey, frame: Frame) -> bool {
        let sender = self.pending.lock().unwrap().remove(&flow);
        match sender {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    /// True if some `request` call is still waiting on `flow`.
    pub fn is_pending(&self, flow: FlowKey) -> bool {
        self.pending.lock().unwrap().contains_key(&flow)
    }

    /// Fails every outstanding request with [`Error::PeerGone`]. Call
    /// once the underlying connection is known to be dead.
    pub fn fail_all_pending(&self) {
        self.pending.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FramedWriter;
    use crate::frame::FrameBody;
    use crate::ids::Rid;

    #[test]
    fn send_assigns_increasing_sequence() {
        let handle = WriterHandle::new(FramedWriter::new(Vec::new(), u32::MAX));
        let rid = Rid::new();
        handle
            .send(Frame::new(
                rid,
                None,
                FrameBody::Req { cap: "cap:".into(), content_type: None, payload: vec![] },
            ))
            .unwrap();
        handle.send(Frame::new(rid, None, FrameBody::End { payload: None })).unwrap();
    }

    #[test]
    fn request_blocks_until_complete_is_called() {
        use std::sync::Arc;

        let peer = Arc::new(FramePeer::new(WriterHandle::new(FramedWriter::new(Vec::new(), u32::MAX))));
        let rid = Rid::new();
        let flow = FlowKey::new(rid, None);
        let req = Frame::new(rid, None, FrameBody::Req { cap: "cap:".into(), content_type: None, payload: vec![] });
        let response = Frame::new(rid, None, FrameBody::End { payload: None });

        let responder = Arc::clone(&peer);
        let resp_clone = response.clone();
        let handle = std::thread::spawn(move || {
            while !responder.is_pending(flow) {
                std::thread::yield_now();
            }
            assert!(responder.complete(flow, resp_clone));
        });
        let got = peer.request(flow, req, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(got, response);
        handle.join().unwrap();
    }

    #[test]
    fn complete_on_unknown_flow_returns_false() {
        let peer = FramePeer::new(WriterHandle::new(FramedWriter::new(Vec::new(), u32::MAX)));
        let rid = Rid::new();
        let flow = FlowKey::new(rid, None);
        let frame = Frame::new(rid, None, FrameBody::End { payload: None });
        assert!(!peer.complete(flow, frame));
    }
}
