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

//! Length-delimited framing over a byte pipe: a 4-byte big-endian length
//! prefix followed by a JSON-encoded [`Frame`](crate::frame::Frame).

use std::io::{self, Read, Write};

use crate::error::ReadError;
use crate::frame::{checksum, Frame, FrameBody};

const LENGTH_PREFIX_BYTES: usize = 4;

/// Reads frames off a byte stream, enforcing a maximum encoded size and
/// verifying `CHUNK` checksums.
pub struct FramedReader<R> {
    inner: R,
    max_frame: u32,
}

impl<R: Read> FramedReader<R> {
    pub fn new(inner: R, max_frame: u32) -> Self {
        FramedReader { inner, max_frame }
    }

    /// Reads one frame, or `Ok(None)` on clean EOF between frames (the
    /// peer closed its end of the pipe).
    pub fn read_frame(&mut self) -> Result<Option<Frame>, ReadError> {
        let mut len_buf = [0u8; LENGTH_PREFIX_BYTES];
        match read_exact_or_eof(&mut self.inner, &mut len_buf)? {
            false => return Ok(None),
            true => {}
        }
        let _guard = caphost_trace::trace_block("read_frame", &["protocol"]);
        let len = u32::from_be_bytes(len_buf);
        if len > self.max_frame {
            return Err(ReadError::FrameTooLarge { len, max: self.max_frame });
        }
        let mut body = vec![0u8; len as usize];
        self.inner.read_exact(&mut body).map_err(ReadError::Io)?;
        let frame: Frame = serde_json::from_slice(&body).map_err(ReadError::Malformed)?;
        verify_chunk_checksum(&frame)?;
        Ok(Some(frame))
    }
}

/// Writes frames to a byte stream, rejecting `CHUNK` payloads over the
/// negotiated `max_chunk`.
pub struct FramedWriter<W> {
    inner: W,
    max_chunk: u32,
}

impl<W: Write> FramedWriter<W> {
    pub fn new(inner: W, max_chunk: u32) -> Self {
        FramedWriter { inner, max_chunk }
    }

    pub fn write_frame(&mut self, frame: &Frame) -> io::Result<()> {
        let _guard = caphost_trace::trace_block("write_frame", &["protocol"]);
        if let FrameBody::Chunk { payload, .. } = &frame.body {
            if payload.len() as u32 > self.max_chunk {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("chunk payload {} exceeds negotiated max_chunk {}", payload.len(), self.max_chunk),
                ));
            }
        }
        let body = serde_json::to_vec(frame)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let len = u32::try_from(body.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "frame too large to encode"))?;
        self.inner.write_all(&len.to_be_bytes())?;
        self.inner.write_all(&body)?;
        self.inner.flush()
    }
}

fn verify_chunk_checksum(frame: &Frame) -> Result<(), ReadError> {
    if let FrameBody::Chunk { stream_id, checksum: claimed, payload, .. } = &frame.body {
        let actual = checksum(payload);
        if actual != *claimed {
            return Err(ReadError::ChecksumMismatch {
                stream_id: stream_id.clone(),
                claimed: *claimed,
                actual,
            });
        }
    }
    Ok(())
}

/// Like `Read::read_exact`, but returns `Ok(false)` instead of erroring
/// when EOF arrives before any byte of `buf` has been read.
fn read_exact_or_eof<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<bool, ReadError> {
    let mut read = 0;
    while read < buf.len() {
        match r.read(&mut buf[read..]) {
            Ok(0) => {
                return if read == 0 {
                    Ok(false)
                } else {
                    Err(ReadError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed mid-frame",
                    )))
                }
            }
            Ok(n) => read += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ReadError::Io(e)),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::chunk_body;
    use crate::ids::Rid;
    use std::io::Cursor;

    fn round_trip(frame: &Frame) -> Frame {
        let mut buf = Vec::new();
        FramedWriter::new(&mut buf, u32::MAX).write_frame(frame).unwrap();
        let mut reader = FramedReader::new(Cursor::new(buf), u32::MAX);
        reader.read_frame().unwrap().unwrap()
    }

    #[test]
    fn writes_and_reads_back_a_frame() {
        let frame = Frame::new(Rid::new(), None, FrameBody::Heartbeat);
        assert_eq!(round_trip(&frame), frame);
    }

    #[test]
    fn empty_stream_reads_as_eof() {
        let mut reader = FramedReader::new(Cursor::new(Vec::new()), u32::MAX);
        assert!(reader.read_frame().unwrap().is_none());
    }

    #[test]
    fn oversized_frame_is_rejected_on_read() {
        let frame = Frame::new(Rid::new(), None, chunk_body("s", 0, vec![0u8; 100]));
        let mut buf = Vec::new();
        FramedWriter::new(&mut buf, u32::MAX).write_frame(&frame).unwrap();
        let mut reader = FramedReader::new(Cursor::new(buf), 4);
        assert!(matches!(reader.read_frame(), Err(ReadError::FrameTooLarge { .. })));
    }

    #[test]
    fn oversized_chunk_is_rejected_on_write() {
        let frame = Frame::new(Rid::new(), None, chunk_body("s", 0, vec![0u8; 100]));
        let mut buf = Vec::new();
        let err = FramedWriter::new(&mut buf, 10).write_frame(&frame).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn tampered_chunk_checksum_is_rejected_on_read() {
        let frame = Frame::new(Rid::new(), None, chunk_body("s", 0, b"hello".to_vec()));
        let mut buf = Vec::new();
        FramedWriter::new(&mut buf, u32::MAX).write_frame(&frame).unwrap();
        // Flip a byte inside the base64-encoded payload to corrupt the checksum match.
        let pos = buf.windows(8).position(|w| w == b"aGVsbG8=").unwrap();
        buf[pos] = b'b';
        let mut reader = FramedReader::new(Cursor::new(buf), u32::MAX);
        assert!(matches!(reader.read_frame(), Err(ReadError::ChecksumMismatch { .. })));
    }
}
