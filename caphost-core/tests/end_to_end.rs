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

//! Drives a real `Host` against a real demo-plugin child process, with a
//! simulated relay standing in for the engine on the other side of the
//! host's relay pipe.
//!
//! The simulated relay does one more thing than a dumb echo: a plugin's
//! own peer invoke arrives here with no `xid`, same as any other
//! relay-bound frame, and this harness redirects it back down to the
//! host as an ordinary engine-initiated request (a fresh rid/xid of its
//! own), then translates the eventual response back onto the original
//! rid. That is what exercises `outgoingRids` instead of `incomingRxids`
//! on the way back, including when the redirected request lands on the
//! very plugin that issued it.

use std::collections::HashMap;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use caphost_core::{Host, PeerInvokeStrategy, PluginCatalog, PluginDescription, RefusingStrategy, RelayForwardingStrategy, RoutingEvent};
use caphost_protocol::test_utils::{DummyReader, DummyWriter};
use caphost_protocol::{chunk_body, Frame, FrameBody, FramedReader, FramedWriter, Limits, Rid, WriterHandle, Xid};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Stands in for the relay/engine on the other end of the host's relay
/// pipe. Holds the three maps a real relay-side peer-invoke redirect
/// needs: which rid belongs to a request the test issued directly, and
/// the two-way mapping between a plugin's outgoing rid and the fresh
/// rid/xid minted to re-dispatch it.
struct FakeRelay {
    events_tx: Sender<RoutingEvent>,
    top_level: Arc<Mutex<HashMap<Rid, Sender<Frame>>>>,
}

impl FakeRelay {
    /// Spawns the thread that reads everything the host writes to its
    /// relay pipe and either delivers it to a waiting top-level request
    /// or redirects it as described above.
    fn spawn(mut reader: FramedReader<DummyReader>, events_tx: Sender<RoutingEvent>) -> Self {
        let top_level: Arc<Mutex<HashMap<Rid, Sender<Frame>>>> = Arc::new(Mutex::new(HashMap::new()));
        let redirect_down: Arc<Mutex<HashMap<Rid, (Rid, Xid)>>> = Arc::new(Mutex::new(HashMap::new()));
        let redirect_up: Arc<Mutex<HashMap<Rid, Rid>>> = Arc::new(Mutex::new(HashMap::new()));

        let top_level_reader = Arc::clone(&top_level);
        let events_tx_reader = events_tx.clone();
        thread::spawn(move || {
            while let Ok(Some(frame)) = reader.read_frame() {
                let rid = frame.header.rid;

                if let Some(tx) = top_level_reader.lock().unwrap().get(&rid).cloned() {
                    let _ = tx.send(frame);
                    continue;
                }

                if frame.header.xid.is_none() {
                    // The start, or a continuation, of a plugin-initiated
                    // peer invoke. Mint a down-leg rid/xid the first time
                    // this rid is seen (always the REQ frame).
                    let mut down = redirect_down.lock().unwrap();
                    let (down_rid, down_xid) = *down.entry(rid).or_insert_with(|| {
                        let target = (Rid::new(), Xid::new());
                        redirect_up.lock().unwrap().insert(target.0, rid);
                        target
                    });
                    let terminal = frame.is_terminal();
                    drop(down);
                    let _ = events_tx_reader.send(RoutingEvent::Relay(Frame::new(down_rid, Some(down_xid), frame.body)));
                    if terminal {
                        redirect_down.lock().unwrap().remove(&rid);
                    }
                    continue;
                }

                // A response on the down leg of a redirected request:
                // translate back onto the up leg's rid, with no xid, the
                // way a plugin's own peer-invoke responses always travel.
                let up_rid = redirect_up.lock().unwrap().get(&rid).copied();
                if let Some(up_rid) = up_rid {
                    let terminal = frame.is_terminal();
                    let _ = events_tx_reader.send(RoutingEvent::Relay(Frame::new(up_rid, None, frame.body)));
                    if terminal {
                        redirect_up.lock().unwrap().remove(&rid);
                    }
                } else {
                    panic!("relay continuation for unknown flow rid={}", rid);
                }
            }
        });

        FakeRelay { events_tx, top_level }
    }

    /// Issues a one-shot request for `cap` with a single inline argument
    /// stream, and blocks until the response stream completes.
    fn request(&self, cap: &str, media: &str, bytes: Vec<u8>) -> Result<Vec<u8>, String> {
        let rid = Rid::new();
        let xid = Xid::new();
        let (tx, rx) = mpsc::channel();
        self.top_level.lock().unwrap().insert(rid, tx);

        let send = |body: FrameBody| {
            let _ = self.events_tx.send(RoutingEvent::Relay(Frame::new(rid, Some(xid), body)));
        };
        send(FrameBody::Req { cap: cap.to_string(), content_type: None, payload: Vec::new() });
        send(FrameBody::StreamStart { stream_id: "0".into(), media: media.to_string() });
        send(chunk_body("0", 0, bytes));
        send(FrameBody::StreamEnd { stream_id: "0".into(), chunk_count: 1 });
        send(FrameBody::End { payload: None });

        let mut data = Vec::new();
        loop {
            let frame = rx.recv_timeout(RECV_TIMEOUT).map_err(|_| "timed out waiting for response".to_string())?;
            match frame.body {
                FrameBody::Chunk { payload, .. } => data.extend_from_slice(&payload),
                FrameBody::StreamStart { .. } | FrameBody::StreamEnd { .. } => {}
                FrameBody::End { payload } => {
                    if let Some(extra) = payload {
                        data.extend_from_slice(&extra);
                    }
                    self.top_level.lock().unwrap().remove(&rid);
                    return Ok(data);
                }
                FrameBody::Err { code, message } => {
                    self.top_level.lock().unwrap().remove(&rid);
                    return Err(format!("{}: {}", code, message));
                }
                other => return Err(format!("unexpected frame on response: {:?}", other)),
            }
        }
    }
}

/// Wires up a `Host` with a real demo-plugin child process registered
/// on demand (no autorun), a simulated relay on the other pipe, and the
/// dispatcher running on its own thread.
fn start_host(strategy: Box<dyn PeerInvokeStrategy>) -> (FakeRelay, Sender<RoutingEvent>, thread::JoinHandle<()>) {
    let exec_path = env!("CARGO_BIN_EXE_demo-plugin");
    let desc = PluginDescription::new("demo", exec_path, Vec::new());
    let catalog = PluginCatalog::new(vec![desc]);

    let (relay_writer_io, relay_rx) = DummyWriter::new();
    let relay_writer = WriterHandle::new(FramedWriter::new(relay_writer_io, u32::MAX));
    let relay_reader = FramedReader::new(DummyReader::new(relay_rx), u32::MAX);

    let (mut host, events_rx, events_tx) = Host::new(relay_writer, Limits::default_offer());
    host = host.with_peer_invoke_strategy(strategy);
    host.register_catalog(&catalog);

    let relay = FakeRelay::spawn(relay_reader, events_tx.clone());
    let run_handle = thread::spawn(move || host.run(events_rx));

    (relay, events_tx, run_handle)
}

/// Scenarios 1 and 3: an on-demand plugin is spawned on its first
/// request, and a second request for the same cap reuses it rather than
/// spawning again (the request simply would not complete within the
/// timeout if the host tried to hand it to a second, never-handshaked
/// instance).
#[test]
fn repeated_requests_reuse_the_spawned_plugin() {
    let (relay, events_tx, run_handle) = start_host(Box::new(RefusingStrategy));

    let first = relay.request("cap:in=media:text/plain;out=media:text/plain", "media:text/plain", b"hello".to_vec()).unwrap();
    assert_eq!(first, b"HELLO");

    let second = relay.request("cap:in=media:text/plain;out=media:text/plain", "media:text/plain", b"world".to_vec()).unwrap();
    assert_eq!(second, b"WORLD");

    let _ = events_tx.send(RoutingEvent::RelayClosed);
    run_handle.join().unwrap();
}

/// Scenario 6: the plugin serving `uppercase-via-peer` peer-invokes the
/// plain uppercase cap, which this same plugin process also serves. The
/// router records `outgoingRids[R2]` for the peer request, and the
/// relay's response for it comes back with no xid, so `handleRelayContinuation`
/// must fall through to `outgoingRids` rather than `incomingRxids` to find
/// its way back to the plugin.
#[test]
fn self_loop_peer_invoke_completes_through_outgoing_rids_fallback() {
    let (relay, events_tx, run_handle) = start_host(Box::new(RelayForwardingStrategy));

    let response = relay
        .request("cap:in=media:text/plain;op=uppercase-via-peer;out=media:text/plain", "media:text/plain", b"round trip".to_vec())
        .unwrap();
    assert_eq!(response, b"ROUND TRIP");

    let _ = events_tx.send(RoutingEvent::RelayClosed);
    run_handle.join().unwrap();
}

/// A peer invoke refused by the default strategy never reaches the
/// relay at all; the plugin sees `PEER_INVOKE_NOT_SUPPORTED` directly.
#[test]
fn peer_invoke_refused_by_default_strategy_surfaces_to_the_caller() {
    let (relay, events_tx, run_handle) = start_host(Box::new(RefusingStrategy));

    let err = relay
        .request("cap:in=media:text/plain;op=uppercase-via-peer;out=media:text/plain", "media:text/plain", b"nope".to_vec())
        .unwrap_err();
    assert!(err.contains("peer-invoke-not-supported"), "unexpected error: {}", err);

    let _ = events_tx.send(RoutingEvent::RelayClosed);
    run_handle.join().unwrap();
}
