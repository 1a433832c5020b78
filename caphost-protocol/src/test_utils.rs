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

//! In-process stand-ins for a pipe, so host/plugin plumbing can be
//! exercised without spawning a real child process.

use std::io::{self, Read, Write};
use std::sync::mpsc::{channel, Receiver, Sender};

/// A writer that pushes each write onto a channel instead of a real
/// file descriptor, so a test can inspect what was sent.
pub struct DummyWriter(Sender<Vec<u8>>);

impl DummyWriter {
    pub fn new() -> (Self, Receiver<Vec<u8>>) {
        let (tx, rx) = channel();
        (DummyWriter(tx), rx)
    }
}

impl Write for DummyWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "reader end dropped"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A reader that pulls bytes off a channel, blocking until the writer
/// side provides more or closes (at which point it reports EOF).
pub struct DummyReader {
    rx: Receiver<Vec<u8>>,
    buf: Vec<u8>,
    pos: usize,
}

impl DummyReader {
    pub fn new(rx: Receiver<Vec<u8>>) -> Self {
        DummyReader { rx, buf: Vec::new(), pos: 0 }
    }
}

impl Read for DummyReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.buf.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.buf = chunk;
                    self.pos = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let n = (self.buf.len() - self.pos).min(out.len());
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Builds a connected pair of (writer, reader) for wiring two in-process
/// peers together without an intervening process.
pub fn duplex() -> ((DummyWriter, DummyReader), (DummyWriter, DummyReader)) {
    let (a_writer, a_rx) = DummyWriter::new();
    let (b_writer, b_rx) = DummyWriter::new();
    ((a_writer, DummyReader::new(b_rx)), (b_writer, DummyReader::new(a_rx)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_feeds_reader() {
        let (writer, rx) = DummyWriter::new();
        let mut reader = DummyReader::new(rx);
        let mut w = writer;
        w.write_all(b"hello").unwrap();
        drop(w);
        let mut got = [0u8; 5];
        reader.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"hello");
    }

    #[test]
    fn duplex_connects_both_directions() {
        let ((mut aw, mut ar), (mut bw, mut br)) = duplex();
        aw.write_all(b"ping").unwrap();
        let mut got = [0u8; 4];
        br.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"ping");

        bw.write_all(b"pong").unwrap();
        let mut got = [0u8; 4];
        ar.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"pong");
    }
}
