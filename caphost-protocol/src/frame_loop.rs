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

//! Single-peer mainloop plumbing.
//!
//! [`FrameLoop`] owns one reader and hands every frame that is not the
//! completion of an outstanding [`FramePeer::request`] to a [`Handler`].
//! This is the right shape for a plugin process, which only ever talks
//! to one peer (the host). A host process talking to many plugins and a
//! relay at once does not use this type; it uses [`spawn_reader_thread`]
//! directly to feed all of its readers into one shared queue.

use std::io::{Read, Write};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::warn;

use crate::codec::{FramedReader, FramedWriter};
use crate::error::Error;
use crate::frame::Frame;
use crate::peer::{FramePeer, WriterHandle};

/// Handed to a [`Handler`] so it can send frames back without owning the
/// writer directly.
pub struct FrameCtx<W> {
    peer: Arc<FramePeer<W>>,
}

impl<W: Write> FrameCtx<W> {
    pub fn peer(&self) -> &Arc<FramePeer<W>> {
        &self.peer
    }
}

/// Callbacks invoked by [`FrameLoop::run`] for every frame not consumed
/// as a pending request's response.
pub trait Handler<W: Write> {
    /// An unsolicited frame arrived: a `REQ`/`STREAM_*`/`HEARTBEAT`/`LOG`
    /// the peer initiated, or a response to a request this side never
    /// registered as pending (treated as unsolicited rather than
    /// dropped).
    fn handle_frame(&mut self, ctx: &FrameCtx<W>, frame: Frame);

    /// Called whenever the reader has no frame ready; implementations
    /// that need periodic work (heartbeat emission) can do it here.
    /// Default is a no-op.
    fn idle(&mut self, _ctx: &FrameCtx<W>) {}
}

/// Drives one reader against one [`Handler`] until the peer closes its
/// end of the pipe or a transport error occurs.
pub struct FrameLoop;

impl FrameLoop {
    /// Runs the loop on the calling thread. Returns once the peer closes
    /// the connection (`Ok`) or a read fails (`Err`).
    pub fn run<R, W, H>(reader: R, writer: WriterHandle<W>, max_frame: u32, handler: &mut H) -> Result<(), Error>
    where
        R: Read,
        W: Write,
        H: Handler<W>,
    {
        let peer = Arc::new(FramePeer::new(writer));
        let ctx = FrameCtx { peer: Arc::clone(&peer) };
        let mut reader = FramedReader::new(reader, max_frame);
        loop {
            let frame = match reader.read_frame()? {
                Some(frame) => frame,
                None => {
                    peer.fail_all_pending();
                    return Ok(());
                }
            };
            if let Some(flow) = frame.flow_key() {
                if peer.is_pending(flow) && peer.complete(flow, frame.clone()) {
                    continue;
                }
            }
            handler.handle_frame(&ctx, frame);
        }
    }

    /// Convenience: builds the [`WriterHandle`] from a raw writer and
    /// negotiated `max_chunk`, then runs the loop.
    pub fn run_with_writer<R, W, H>(
        reader: R,
        writer: W,
        max_frame: u32,
        max_chunk: u32,
        handler: &mut H,
    ) -> Result<(), Error>
    where
        R: Read,
        W: Write,
        H: Handler<W>,
    {
        let writer = WriterHandle::new(FramedWriter::new(writer, max_chunk));
        Self::run(reader, writer, max_frame, handler)
    }
}

/// Spawns a thread that reads frames off `reader` and invokes `on_frame`
/// for each one, until EOF or a read error, then invokes `on_close`
/// exactly once. This is the primitive the host router builds its
/// multi-reader fan-in loop on: one such thread per plugin's stdout plus
/// one for the relay, all pushing onto the same shared queue.
pub fn spawn_reader_thread<R, F, C>(mut reader: FramedReader<R>, mut on_frame: F, mut on_close: C) -> JoinHandle<()>
where
    R: Read + Send + 'static,
    F: FnMut(Frame) + Send + 'static,
    C: FnMut(Option<Error>) + Send + 'static,
{
    thread::spawn(move || loop {
        match reader.read_frame() {
            Ok(Some(frame)) => on_frame(frame),
            Ok(None) => {
                on_close(None);
                return;
            }
            Err(e) => {
                warn!("reader thread exiting on error: {}", e);
                on_close(Some(Error::from(e)));
                return;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameBody;
    use crate::ids::Rid;
    use std::io::Cursor;
    use std::sync::Mutex;

    struct Recorder {
        seen: Vec<Frame>,
    }

    impl<W: Write> Handler<W> for Recorder {
        fn handle_frame(&mut self, _ctx: &FrameCtx<W>, frame: Frame) {
            self.seen.push(frame);
        }
    }

    #[test]
    fn unsolicited_frames_reach_the_handler() {
        let frame = Frame::new(Rid::new(), None, FrameBody::Heartbeat);
        let mut buf = Vec::new();
        FramedWriter::new(&mut buf, u32::MAX).write_frame(&frame).unwrap();

        let mut handler = Recorder { seen: Vec::new() };
        FrameLoop::run_with_writer(Cursor::new(buf), Vec::new(), u32::MAX, u32::MAX, &mut handler).unwrap();
        assert_eq!(handler.seen, vec![frame]);
    }

    #[test]
    fn spawn_reader_thread_reports_frames_and_close() {
        let frame = Frame::new(Rid::new(), None, FrameBody::Heartbeat);
        let mut buf = Vec::new();
        FramedWriter::new(&mut buf, u32::MAX).write_frame(&frame).unwrap();
        let reader = FramedReader::new(Cursor::new(buf), u32::MAX);

        let seen: Arc<Mutex<Vec<Frame>>> = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(Mutex::new(false));
        let seen2 = Arc::clone(&seen);
        let closed2 = Arc::clone(&closed);
        let handle = spawn_reader_thread(
            reader,
            move |f| seen2.lock().unwrap().push(f),
            move |_| *closed2.lock().unwrap() = true,
        );
        handle.join().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![frame]);
        assert!(*closed.lock().unwrap());
    }
}
