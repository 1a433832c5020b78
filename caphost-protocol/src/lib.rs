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

//! Length-delimited frame protocol shared by the host and its plugins:
//! the frame model, its wire codec, sequence assignment and the
//! writer/peer/mainloop plumbing built on top of them.

pub mod codec;
pub mod error;
pub mod frame;
pub mod frame_loop;
pub mod ids;
pub mod peer;
pub mod sequencer;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use codec::{FramedReader, FramedWriter};
pub use error::{ErrCode, Error, ReadError, RemoteError};
pub use frame::{checksum, chunk_body, Frame, FrameBody, FrameHeader, Limits, LogLevel};
pub use frame_loop::{spawn_reader_thread, FrameCtx, FrameLoop, Handler};
pub use ids::{FlowKey, Rid, RxidKey, Xid};
pub use peer::{FramePeer, WriterHandle};
pub use sequencer::Sequencer;
