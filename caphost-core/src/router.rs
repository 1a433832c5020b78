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

//! The host's router: the managed plugin table, the capability table, the
//! two routing tables that bridge relay and plugin frame addressing, and
//! the single dispatcher loop that drains a shared event queue.
//!
//! One reader thread per plugin's stdout plus one for the relay push
//! tagged [`RoutingEvent`]s onto a channel; [`Host::run`] is the single
//! consumer, and the only code that ever mutates the routing tables. Both
//! spawning a plugin and running its handshake happen on the dispatcher
//! thread directly, outside of any lock, since there is nothing else that
//! could race with it.

use std::collections::HashMap;
use std::io::Write;
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::{Duration, Instant};

use caphost_protocol::{
    spawn_reader_thread, ErrCode, Frame, FrameBody, FramedReader, Limits, Rid, RxidKey, WriterHandle,
};
use caphost_urn::{CapUrn, CAP_IDENTITY};

use crate::cap_table::CapTable;
use crate::catalog::PluginCatalog;
use crate::managed_plugin::ManagedPlugin;
use crate::peer_invoke::{PeerInvokeStrategy, PeerInvokeTarget, RefusingStrategy};

/// How often the dispatcher sends an unsolicited `HEARTBEAT` to an idle
/// plugin, and how long it waits for the echo before treating the
/// plugin as dead.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);

/// One item off the shared fan-in queue.
pub enum RoutingEvent {
    Relay(Frame),
    RelayClosed,
    Plugin { idx: usize, frame: Frame },
    PluginClosed { idx: usize },
    /// Periodic wake-up for heartbeat bookkeeping; the caller is
    /// responsible for scheduling these (a timer thread, typically).
    Tick,
}

/// The host's routing state. Not `Sync`: every field is touched only by
/// whichever thread calls [`Host::run`].
pub struct Host<W> {
    plugins: Vec<ManagedPlugin>,
    cap_table: CapTable,
    /// rid -> plugin index, for a plugin-initiated peer invoke forwarded
    /// to the relay. Removed only on the relay's terminal response frame
    /// or on plugin death.
    outgoing_rids: HashMap<Rid, usize>,
    /// (xid, rid) -> plugin index, for a relay-initiated request. Left in
    /// place across the request's own terminal frame (the relay may still
    /// reference it, e.g. in a `LOG`); removed only on plugin death.
    incoming_rxids: HashMap<RxidKey, usize>,
    capabilities: Vec<String>,
    relay_writer: WriterHandle<W>,
    offer: Limits,
    peer_invoke: Box<dyn PeerInvokeStrategy>,
    events_tx: Sender<RoutingEvent>,
}

impl<W: Write> Host<W> {
    pub fn new(relay_writer: WriterHandle<W>, offer: Limits) -> (Self, Receiver<RoutingEvent>, Sender<RoutingEvent>) {
        let (tx, rx) = mpsc::channel();
        let host = Host {
            plugins: Vec::new(),
            cap_table: CapTable::new(),
            outgoing_rids: HashMap::new(),
            incoming_rxids: HashMap::new(),
            capabilities: vec![CAP_IDENTITY.to_string()],
            relay_writer,
            offer,
            peer_invoke: Box::new(RefusingStrategy),
            events_tx: tx.clone(),
        };
        (host, rx, tx)
    }

    pub fn with_peer_invoke_strategy(mut self, strategy: Box<dyn PeerInvokeStrategy>) -> Self {
        self.peer_invoke = strategy;
        self
    }

    /// A `Sender` reader threads (and a timer, for `Tick`) push events
    /// onto. Clone freely; the channel outlives any one clone.
    pub fn event_sender(&self) -> Sender<RoutingEvent> {
        self.events_tx.clone()
    }

    /// Registers every plugin in `catalog`, spawning the autorun ones
    /// immediately. Spawn failures are logged and leave the plugin
    /// `hello_failed`, per the "declared caps persist as knownCaps"
    /// fallback.
    pub fn register_catalog(&mut self, catalog: &PluginCatalog)
    where
        W: Send + 'static,
    {
        for desc in catalog.iter() {
            let idx = self.register_plugin(desc);
            if desc.activation == crate::catalog::Activation::Autorun {
                if let Err(e) = self.spawn_plugin(idx) {
                    log::warn!("autorun plugin {} failed to start: {}", self.plugins[idx].name, e);
                }
            }
        }
    }

    fn register_plugin(&mut self, desc: &crate::catalog::PluginDescription) -> usize {
        let idx = self.plugins.len();
        let plugin = ManagedPlugin::registered(desc);
        for cap in &plugin.known_caps {
            self.cap_table.insert(cap.clone(), idx);
        }
        self.plugins.push(plugin);
        self.rebuild_capabilities();
        idx
    }

    /// Spawns and hands the plugin's reader off to its own thread feeding
    /// the shared queue. Must run on the dispatcher thread (it performs
    /// blocking I/O), but does not hold any lock while doing so.
    fn spawn_plugin(&mut self, idx: usize) -> Result<(), crate::error::HandshakeError>
    where
        W: Send + 'static,
    {
        let reader = match self.plugins[idx].spawn_and_handshake(self.offer) {
            Ok(reader) => reader,
            Err(e) => {
                // Handshake failures are permanent: the plugin is never
                // spawned again, and its caps stop routing to it immediately.
                self.plugins[idx].hello_failed = true;
                self.cap_table.remove_plugin(idx);
                self.rebuild_and_notify_capabilities();
                return Err(e);
            }
        };
        self.cap_table.remove_plugin(idx);
        for cap in self.plugins[idx].known_caps.clone() {
            self.cap_table.insert(cap, idx);
        }
        self.rebuild_and_notify_capabilities();

        let tx = self.events_tx.clone();
        let tx_close = self.events_tx.clone();
        self.spawn_reader(idx, reader, tx, tx_close);
        Ok(())
    }

    fn spawn_reader<R>(&self, idx: usize, reader: FramedReader<R>, tx: Sender<RoutingEvent>, tx_close: Sender<RoutingEvent>)
    where
        R: std::io::Read + Send + 'static,
    {
        spawn_reader_thread(
            reader,
            move |frame| {
                let _ = tx.send(RoutingEvent::Plugin { idx, frame });
            },
            move |_err| {
                let _ = tx_close.send(RoutingEvent::PluginClosed { idx });
            },
        );
    }

    fn find_or_spawn_for_cap(&mut self, cap: &CapUrn) -> Result<usize, ErrCode>
    where
        W: Send + 'static,
    {
        let idx = self.cap_table.route(cap).ok_or(ErrCode::NoHandler)?;
        if self.plugins[idx].hello_failed {
            return Err(ErrCode::NoHandler);
        }
        if !self.plugins[idx].running {
            self.spawn_plugin(idx).map_err(|e| {
                log::warn!("on-demand spawn of {} failed: {}", self.plugins[idx].name, e);
                ErrCode::SpawnFailed
            })?;
        }
        Ok(idx)
    }

    fn rebuild_capabilities(&mut self) {
        let mut caps = vec![CAP_IDENTITY.to_string()];
        let mut seen = std::collections::HashSet::new();
        seen.insert(CAP_IDENTITY.to_string());
        for (cap, _) in self.cap_table.iter() {
            if cap.is_identity() {
                continue;
            }
            let text = cap.to_string();
            if seen.insert(text.clone()) {
                caps.push(text);
            }
        }
        self.capabilities = caps;
    }

    fn rebuild_and_notify_capabilities(&mut self) {
        self.rebuild_capabilities();
        let manifest = serde_json::json!({ "caps": self.capabilities });
        let _ = self.relay_writer.send(Frame::new(Rid::new(), None, FrameBody::RelayNotify { manifest }));
    }

    /// Runs the dispatcher until the relay closes or the channel is
    /// drained of senders, then kills every running plugin.
    pub fn run(&mut self, events: Receiver<RoutingEvent>)
    where
        W: Send + 'static,
    {
        loop {
            match events.recv() {
                Ok(RoutingEvent::Relay(frame)) => self.handle_relay_frame(frame),
                Ok(RoutingEvent::RelayClosed) | Err(_) => break,
                Ok(RoutingEvent::Plugin { idx, frame }) => self.handle_plugin_frame(idx, frame),
                Ok(RoutingEvent::PluginClosed { idx }) => self.handle_plugin_death(idx),
                Ok(RoutingEvent::Tick) => self.tick_heartbeats(),
            }
        }
        self.close();
    }

    fn close(&mut self) {
        for plugin in &mut self.plugins {
            if plugin.running {
                plugin.kill();
            }
        }
    }

    fn handle_relay_frame(&mut self, frame: Frame)
    where
        W: Send + 'static,
    {
        match &frame.body {
            FrameBody::Req { .. } => self.handle_relay_req(frame),
            FrameBody::StreamStart { .. }
            | FrameBody::Chunk { .. }
            | FrameBody::StreamEnd { .. }
            | FrameBody::End { .. }
            | FrameBody::Err { .. } => self.handle_relay_continuation(frame),
            FrameBody::Heartbeat => {
                let _ = self.relay_writer.send(frame);
            }
            FrameBody::Log { .. } => log::debug!("relay log frame ignored: {:?}", frame.body),
            FrameBody::RelayState { .. } => log::debug!("relay pushed state: {:?}", frame.body),
            FrameBody::Hello { .. } | FrameBody::RelayNotify { .. } => {
                log::warn!("protocol error: unexpected {} from relay", frame.kind_name());
            }
        }
    }

    fn handle_relay_req(&mut self, frame: Frame)
    where
        W: Send + 'static,
    {
        let rid = frame.header.rid;
        let xid = match frame.header.xid {
            Some(xid) => xid,
            None => {
                // No xid to echo; the relay still gets told, just without one.
                let _ = self.relay_writer.send(Frame::new(
                    rid,
                    None,
                    FrameBody::Err { code: ErrCode::ProtocolError.as_str().into(), message: "REQ missing xid".into() },
                ));
                return;
            }
        };
        let (cap_str, payload_empty) = match &frame.body {
            FrameBody::Req { cap, payload, .. } => (cap.clone(), payload.is_empty()),
            _ => unreachable!("handle_relay_req only called for REQ"),
        };
        if !payload_empty {
            self.reply_err(rid, xid, ErrCode::ProtocolError, "REQ payload must be empty");
            return;
        }
        let cap = match CapUrn::parse(&cap_str) {
            Ok(cap) => cap,
            Err(_) => {
                self.reply_err(rid, xid, ErrCode::InvalidCapUrn, format!("invalid cap urn {:?}", cap_str));
                return;
            }
        };
        let idx = match self.find_or_spawn_for_cap(&cap) {
            Ok(idx) => idx,
            Err(code) => {
                self.reply_err(rid, xid, code, format!("no route for {}", cap));
                return;
            }
        };
        self.incoming_rxids.insert(RxidKey::new(xid, rid), idx);
        if self.plugins[idx].send(frame).is_err() {
            self.handle_plugin_death(idx);
        }
    }

    fn handle_relay_continuation(&mut self, frame: Frame) {
        let rid = frame.header.rid;
        let idx = match frame.header.xid {
            Some(xid) => self.incoming_rxids.get(&RxidKey::new(xid, rid)).copied(),
            None => None,
        }
        .or_else(|| self.outgoing_rids.get(&rid).copied());

        let idx = match idx {
            Some(idx) => idx,
            None => {
                log::warn!("protocol error: relay continuation for unknown flow rid={}", rid);
                return;
            }
        };
        if frame.is_terminal() && frame.header.xid.is_none() {
            self.outgoing_rids.remove(&rid);
        }
        if self.plugins[idx].send(frame).is_err() {
            self.handle_plugin_death(idx);
        }
    }

    fn reply_err(&self, rid: Rid, xid: caphost_protocol::Xid, code: ErrCode, message: impl Into<String>) {
        let _ = self.relay_writer.send(Frame::new(
            rid,
            Some(xid),
            FrameBody::Err { code: code.as_str().into(), message: message.into() },
        ));
    }

    fn handle_plugin_frame(&mut self, idx: usize, frame: Frame) {
        if !self.plugins[idx].running {
            return;
        }
        match &frame.body {
            FrameBody::Heartbeat => self.handle_plugin_heartbeat(idx, frame),
            FrameBody::Log { .. } => self.handle_plugin_log(idx, frame),
            FrameBody::Req { .. } => self.handle_peer_invoke(idx, frame),
            FrameBody::StreamStart { .. }
            | FrameBody::Chunk { .. }
            | FrameBody::StreamEnd { .. }
            | FrameBody::End { .. }
            | FrameBody::Err { .. } => {
                if let Err(e) = self.relay_writer.send(frame) {
                    // A broken relay write is fatal to the whole session;
                    // the caller's RelayClosed event will unwind us.
                    log::error!("relay write failed, session ending: {}", e);
                }
            }
            FrameBody::Hello { .. } | FrameBody::RelayNotify { .. } | FrameBody::RelayState { .. } => {
                log::warn!("protocol error: unexpected {} from plugin {}", frame.kind_name(), self.plugins[idx].name);
            }
        }
    }

    fn handle_plugin_heartbeat(&mut self, idx: usize, frame: Frame) {
        let rid = frame.header.rid;
        if self.plugins[idx].pending_heartbeat_rid == Some(rid) {
            self.plugins[idx].pending_heartbeat_rid = None;
            self.plugins[idx].last_heartbeat_seen = Some(Instant::now());
        } else {
            let _ = self.plugins[idx].send(frame);
        }
    }

    fn handle_plugin_log(&mut self, idx: usize, frame: Frame) {
        let rid = frame.header.rid;
        if self.outgoing_rids.contains_key(&rid) {
            let _ = self.relay_writer.send(frame);
        } else if let FrameBody::Log { level, message } = &frame.body {
            log::debug!("plugin {} log ({:?}): {}", self.plugins[idx].name, level, message);
        }
    }

    fn handle_peer_invoke(&mut self, idx: usize, frame: Frame) {
        if frame.header.xid.is_some() {
            log::warn!("protocol error: plugin {} sent xid on a peer invoke", self.plugins[idx].name);
            return;
        }
        let rid = frame.header.rid;
        let (cap_str, payload_empty) = match &frame.body {
            FrameBody::Req { cap, payload, .. } => (cap.clone(), payload.is_empty()),
            _ => unreachable!(),
        };
        if !payload_empty {
            let _ = self.plugins[idx].send(Frame::new(
                rid,
                None,
                FrameBody::Err { code: ErrCode::ProtocolError.as_str().into(), message: "REQ payload must be empty".into() },
            ));
            return;
        }
        let cap = match CapUrn::parse(&cap_str) {
            Ok(cap) => cap,
            Err(_) => {
                let _ = self.plugins[idx].send(Frame::new(
                    rid,
                    None,
                    FrameBody::Err { code: ErrCode::InvalidCapUrn.as_str().into(), message: format!("invalid cap urn {:?}", cap_str) },
                ));
                return;
            }
        };
        match self.peer_invoke.begin_request(&cap) {
            PeerInvokeTarget::Refuse => {
                let _ = self.plugins[idx].send(Frame::new(
                    rid,
                    None,
                    FrameBody::Err {
                        code: ErrCode::PeerInvokeNotSupported.as_str().into(),
                        message: "peer invokes are not supported".into(),
                    },
                ));
            }
            PeerInvokeTarget::Relay => {
                self.outgoing_rids.insert(rid, idx);
                let _ = self.relay_writer.send(frame);
            }
        }
    }

    /// Marks `idx` dead, synthesizes `ERR(PLUGIN_DIED)` for every flow it
    /// still owned in either routing table, and republishes capabilities.
    fn handle_plugin_death(&mut self, idx: usize) {
        if self.plugins[idx].running {
            self.plugins[idx].kill();
        }

        let dead_outgoing: Vec<Rid> =
            self.outgoing_rids.iter().filter(|(_, &v)| v == idx).map(|(&rid, _)| rid).collect();
        for rid in dead_outgoing {
            self.outgoing_rids.remove(&rid);
            let _ = self.relay_writer.send(Frame::new(
                rid,
                None,
                FrameBody::Err { code: ErrCode::PluginDied.as_str().into(), message: "plugin process exited".into() },
            ));
        }

        let dead_incoming: Vec<RxidKey> =
            self.incoming_rxids.iter().filter(|(_, &v)| v == idx).map(|(&key, _)| key).collect();
        for key in dead_incoming {
            self.incoming_rxids.remove(&key);
            let _ = self.relay_writer.send(Frame::new(
                key.rid,
                Some(key.xid),
                FrameBody::Err { code: ErrCode::PluginDied.as_str().into(), message: "plugin process exited".into() },
            ));
        }

        self.rebuild_and_notify_capabilities();
    }

    fn tick_heartbeats(&mut self) {
        let now = Instant::now();
        let idxs: Vec<usize> = (0..self.plugins.len()).collect();
        for idx in idxs {
            if !self.plugins[idx].running {
                continue;
            }
            if let Some(pending) = self.plugins[idx].pending_heartbeat_rid {
                let sent_at = self.plugins[idx].last_heartbeat_sent.unwrap_or(now);
                if now.duration_since(sent_at) > HEARTBEAT_TIMEOUT {
                    log::warn!("plugin {} missed heartbeat {}, treating as dead", self.plugins[idx].name, pending);
                    self.handle_plugin_death(idx);
                    continue;
                }
            } else {
                let due = self.plugins[idx].last_heartbeat_sent.map(|t| now.duration_since(t) > HEARTBEAT_INTERVAL).unwrap_or(true);
                if due {
                    let rid = Rid::new();
                    self.plugins[idx].pending_heartbeat_rid = Some(rid);
                    self.plugins[idx].last_heartbeat_sent = Some(now);
                    let _ = self.plugins[idx].send(Frame::new(rid, None, FrameBody::Heartbeat));
                }
            }
        }
    }
}

/// Identifier for the capability broadcast via `RELAY_NOTIFY`, kept here
/// so callers of [`Host`] don't need to reach into `caphost_urn` directly
/// just to recognize the identity entry in `capabilities`.
pub fn is_identity_cap(s: &str) -> bool {
    s == CAP_IDENTITY
}

#[cfg(test)]
mod tests {
    use super::*;
    use caphost_protocol::test_utils::{DummyReader, DummyWriter};
    use caphost_protocol::{FramedReader, FramedWriter};

    fn host_with_dummy_relay() -> (Host<DummyWriter>, Receiver<RoutingEvent>, FramedReader<DummyReader>) {
        let (writer, rx) = DummyWriter::new();
        let relay_writer = WriterHandle::new(FramedWriter::new(writer, u32::MAX));
        let (host, events_rx, _tx) = Host::new(relay_writer, Limits::default_offer());
        (host, events_rx, FramedReader::new(DummyReader::new(rx), u32::MAX))
    }

    #[test]
    fn relay_req_with_no_known_cap_gets_no_handler() {
        let (mut host, _events_rx, mut relay_reader) = host_with_dummy_relay();
        let rid = Rid::new();
        let xid = caphost_protocol::Xid::new();
        let frame = Frame::new(rid, Some(xid), FrameBody::Req { cap: "cap:in=media:void;out=media:nope".into(), content_type: None, payload: vec![] });
        host.handle_relay_frame(frame);

        let sent = relay_reader.read_frame().unwrap().unwrap();
        match sent.body {
            FrameBody::Err { code, .. } => assert_eq!(code, "NO_HANDLER"),
            other => panic!("expected ERR, got {:?}", other),
        }
    }

    #[test]
    fn relay_req_missing_xid_is_a_protocol_error() {
        let (mut host, _events_rx, mut relay_reader) = host_with_dummy_relay();
        let rid = Rid::new();
        let frame = Frame::new(rid, None, FrameBody::Req { cap: "cap:".into(), content_type: None, payload: vec![] });
        host.handle_relay_frame(frame);

        let sent = relay_reader.read_frame().unwrap().unwrap();
        assert!(sent.header.xid.is_none());
        assert!(matches!(sent.body, FrameBody::Err { .. }));
    }

    #[test]
    fn plugin_death_synthesizes_err_for_every_owned_flow() {
        let (mut host, _events_rx, mut relay_reader) = host_with_dummy_relay();
        // Fake a running plugin with no real child process so death cleanup
        // can be exercised without spawning anything.
        let desc = crate::catalog::PluginDescription::new("p", "/bin/true", Vec::new());
        let idx = host.register_plugin(&desc);
        host.plugins[idx].running = true;

        let xid = caphost_protocol::Xid::new();
        let rid_in = Rid::new();
        let rid_out = Rid::new();
        host.incoming_rxids.insert(RxidKey::new(xid, rid_in), idx);
        host.outgoing_rids.insert(rid_out, idx);

        host.handle_plugin_death(idx);

        assert!(!host.plugins[idx].running);
        assert!(host.incoming_rxids.is_empty());
        assert!(host.outgoing_rids.is_empty());

        let mut saw_incoming = false;
        let mut saw_outgoing = false;
        let mut saw_notify = false;
        // Three frames were sent: the two synthesized ERRs and the
        // capability re-advertisement.
        for _ in 0..3 {
            let frame = relay_reader.read_frame().unwrap().unwrap();
            match &frame.body {
                FrameBody::Err { .. } if frame.header.rid == rid_in => saw_incoming = true,
                FrameBody::Err { .. } if frame.header.rid == rid_out => saw_outgoing = true,
                FrameBody::RelayNotify { .. } => saw_notify = true,
                _ => {}
            }
        }
        assert!(saw_incoming && saw_outgoing && saw_notify);
    }

    #[test]
    fn handshake_failure_permanently_disables_the_plugin() {
        let (mut host, _events_rx, _relay_rx) = host_with_dummy_relay();
        let cap: CapUrn = "cap:in=media:void;out=media:x".parse().unwrap();
        let desc = crate::catalog::PluginDescription::new("p", "/nonexistent/definitely-not-a-binary", vec![cap.clone()]);
        host.register_plugin(&desc);

        let first = host.find_or_spawn_for_cap(&cap);
        assert_eq!(first, Err(ErrCode::SpawnFailed));
        assert!(host.plugins[0].hello_failed);
        assert!(!host.plugins[0].is_spawnable());

        // The cap was dropped from the table rather than left to retry, so
        // a second request fails fast without attempting another spawn.
        let second = host.find_or_spawn_for_cap(&cap);
        assert_eq!(second, Err(ErrCode::NoHandler));
    }

    #[test]
    fn peer_invoke_refused_by_default() {
        let (mut host, _events_rx, _relay_rx) = host_with_dummy_relay();
        let desc = crate::catalog::PluginDescription::new("p", "/bin/true", Vec::new());
        let idx = host.register_plugin(&desc);
        host.plugins[idx].running = true;

        let rid = Rid::new();
        let req = Frame::new(
            rid,
            None,
            FrameBody::Req { cap: "cap:in=media:void;out=media:x".into(), content_type: None, payload: vec![] },
        );
        // The default strategy refuses, so this never touches outgoingRids
        // (a relay-forwarding strategy would insert an entry there).
        host.handle_peer_invoke(idx, req);
        assert!(host.outgoing_rids.is_empty());
    }
}
