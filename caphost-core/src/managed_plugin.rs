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

//! A single child plugin process: spawn, handshake, identity probe,
//! writes, and teardown.

use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;

use caphost_protocol::{chunk_body, Frame, FrameBody, FramedReader, FramedWriter, Limits, Rid, WriterHandle};
use caphost_urn::CapUrn;

use crate::catalog::PluginDescription;
use crate::error::HandshakeError;

/// Fixed 6-byte token echoed back during the identity probe.
const IDENTITY_NONCE: &[u8] = b"CAPHST";

/// How long the host waits for a child to exit after a polite kill
/// before reaping unconditionally.
const KILL_GRACE: Duration = Duration::from_millis(500);

/// One managed plugin: its static description plus whatever live state
/// exists while it is running.
pub struct ManagedPlugin {
    pub name: String,
    pub exec_path: PathBuf,
    pub known_caps: Vec<CapUrn>,
    pub running: bool,
    /// Terminal: once true, this plugin is never spawned again.
    pub hello_failed: bool,
    pub limits: Limits,
    pub manifest: Option<Value>,
    pub last_heartbeat_sent: Option<Instant>,
    pub last_heartbeat_seen: Option<Instant>,
    /// `rid` of a host-initiated `HEARTBEAT` still awaiting its echo.
    pub pending_heartbeat_rid: Option<Rid>,
    child: Option<Child>,
    writer: Option<Arc<WriterHandle<ChildStdin>>>,
}

impl ManagedPlugin {
    /// A plugin entry that has never been spawned.
    pub fn registered(desc: &PluginDescription) -> Self {
        ManagedPlugin {
            name: desc.name.clone(),
            exec_path: desc.exec_path.clone(),
            known_caps: desc.known_caps.clone(),
            running: false,
            hello_failed: false,
            limits: Limits::default_offer(),
            manifest: None,
            last_heartbeat_sent: None,
            last_heartbeat_seen: None,
            pending_heartbeat_rid: None,
            child: None,
            writer: None,
        }
    }

    pub fn is_spawnable(&self) -> bool {
        !self.running && !self.hello_failed
    }

    /// Spawns the child, exchanges `HELLO`, and runs the identity probe.
    /// On success this plugin is `running` and the caller owns the
    /// returned reader, which it must hand to a reader thread feeding
    /// the host's event queue. On failure the child is already killed
    /// and reaped.
    pub fn spawn_and_handshake(&mut self, offer: Limits) -> Result<FramedReader<ChildStdout>, HandshakeError> {
        let mut child = Command::new(&self.exec_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(HandshakeError::Spawn)?;
        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");

        let writer = WriterHandle::new(FramedWriter::new(stdin, offer.max_chunk));
        let mut reader = FramedReader::new(stdout, offer.max_frame);

        match self.do_handshake(&writer, &mut reader, offer) {
            Ok(()) => {
                self.child = Some(child);
                self.writer = Some(Arc::new(writer));
                self.running = true;
                Ok(reader)
            }
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                Err(e)
            }
        }
    }

    fn do_handshake(
        &mut self,
        writer: &WriterHandle<ChildStdin>,
        reader: &mut FramedReader<ChildStdout>,
        offer: Limits,
    ) -> Result<(), HandshakeError> {
        let hello_rid = Rid::new();
        writer
            .send(Frame::new(hello_rid, None, FrameBody::Hello { limits: offer, manifest: None }))
            .map_err(|_| HandshakeError::Io(broken_pipe()))?;

        let frame = reader.read_frame()?.ok_or(HandshakeError::UnexpectedFrame("eof"))?;

        let (their_limits, manifest) = match frame.body {
            FrameBody::Hello { limits, manifest } => (limits, manifest),
            other => return Err(HandshakeError::UnexpectedFrame(frame_kind_name(&other))),
        };
        let manifest = manifest.ok_or(HandshakeError::MissingManifest)?;
        let caps = manifest_caps(&manifest);
        if !caps.iter().any(CapUrn::is_identity) {
            return Err(HandshakeError::MissingManifest);
        }

        let negotiated = Limits::negotiate(offer, their_limits);
        self.run_identity_probe(writer, reader, negotiated)?;

        self.manifest = Some(manifest);
        self.known_caps = caps;
        self.limits = negotiated;
        Ok(())
    }

    fn run_identity_probe(
        &self,
        writer: &WriterHandle<ChildStdin>,
        reader: &mut FramedReader<ChildStdout>,
        negotiated: Limits,
    ) -> Result<(), HandshakeError> {
        let rid = Rid::new();
        let send = |body: FrameBody| {
            writer.send(Frame::new(rid, None, body)).map_err(|_| HandshakeError::Io(broken_pipe()))
        };

        send(FrameBody::Req { cap: CapUrn::identity().to_string(), content_type: None, payload: Vec::new() })?;
        send(FrameBody::StreamStart { stream_id: "probe".into(), media: "media:".into() })?;
        send(chunk_body("probe", 0, IDENTITY_NONCE.to_vec()))?;
        send(FrameBody::StreamEnd { stream_id: "probe".into(), chunk_count: 1 })?;
        send(FrameBody::End { payload: None })?;

        let mut echoed = Vec::new();
        loop {
            let frame = reader.read_frame()?.ok_or(HandshakeError::UnexpectedFrame("eof"))?;
            if frame.header.rid != rid {
                // A stray frame on another flow mid-handshake is ignored;
                // the plugin has no other flows yet in practice.
                continue;
            }
            match frame.body {
                FrameBody::Chunk { payload, .. } => echoed.extend_from_slice(&payload),
                FrameBody::StreamStart { .. } | FrameBody::StreamEnd { .. } => {}
                FrameBody::End { .. } => break,
                FrameBody::Err { .. } => return Err(HandshakeError::IdentityMismatch),
                other => return Err(HandshakeError::UnexpectedFrame(frame_kind_name(&other))),
            }
        }
        if echoed != IDENTITY_NONCE {
            return Err(HandshakeError::IdentityMismatch);
        }
        let _ = negotiated;
        Ok(())
    }

    /// Thread-safe write. A failed write means the plugin is dead; the
    /// caller treats this identically to reader EOF rather than
    /// propagating the I/O error further.
    pub fn send(&self, frame: Frame) -> Result<(), ()> {
        match &self.writer {
            Some(w) => w.send(frame).map_err(|_| ()),
            None => Err(()),
        }
    }

    /// SIGTERM-equivalent kill, brief grace period, then unconditional
    /// reap. `std::process::Child::kill` is SIGKILL on unix, which is
    /// the only portable option in std; a real SIGTERM would need a
    /// platform-specific dependency this host does not carry.
    pub fn kill(&mut self) {
        self.running = false;
        self.writer = None;
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            std::thread::sleep(KILL_GRACE);
            let _ = child.wait();
        }
    }
}

fn broken_pipe() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::BrokenPipe, "write failed")
}

fn frame_kind_name(body: &FrameBody) -> &'static str {
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

/// Extracts declared cap URNs from a plugin manifest's `caps` array,
/// skipping entries that fail to parse rather than failing the whole
/// handshake over one bad entry.
fn manifest_caps(manifest: &Value) -> Vec<CapUrn> {
    manifest
        .get("caps")
        .and_then(Value::as_array)
        .map(|caps| {
            caps.iter()
                .filter_map(|c| c.get("urn").and_then(Value::as_str))
                .filter_map(|s| s.parse().ok())
                .collect()
        })
        .unwrap_or_default()
}
