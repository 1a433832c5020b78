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

//! Per-writer sequence assignment.
//!
//! Every physical outbound wire (one writer, guarded by one mutex) owns a
//! single `Sequencer`. Assigning a frame's `seq` and writing the frame
//! happen under the same lock, so the sequence on a wire is exactly its
//! write order. A host that synthesizes an `ERR` for a flow and sends it
//! out the same writer that carried the flow's earlier frames gets the
//! next number in line for free; there is no separate high-water-mark
//! table to keep in sync with the write path.

use std::collections::HashMap;

use crate::ids::FlowKey;

#[derive(Debug, Default)]
pub struct Sequencer {
    next: HashMap<FlowKey, u64>,
}

impl Sequencer {
    pub fn new() -> Self {
        Sequencer { next: HashMap::new() }
    }

    /// Assigns the next sequence number for `key` on this wire, starting
    /// at 0. Call exactly once per outbound frame on that flow.
    pub fn assign(&mut self, key: FlowKey) -> u64 {
        let slot = self.next.entry(key).or_insert(0);
        let seq = *slot;
        *slot += 1;
        seq
    }

    /// The sequence number that would be assigned next, without
    /// consuming it. Zero for a flow never seen on this wire.
    pub fn peek(&self, key: FlowKey) -> u64 {
        self.next.get(&key).copied().unwrap_or(0)
    }

    /// Releases a flow's counter. Call after writing that flow's terminal
    /// frame (`END` or `ERR`); the flow will not be written to again.
    pub fn remove(&mut self, key: FlowKey) {
        self.next.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::Rid;

    #[test]
    fn assigns_increasing_sequence_per_flow() {
        let mut seq = Sequencer::new();
        let key = FlowKey::new(Rid::new(), None);
        assert_eq!(seq.assign(key), 0);
        assert_eq!(seq.assign(key), 1);
        assert_eq!(seq.assign(key), 2);
    }

    #[test]
    fn flows_are_independent() {
        let mut seq = Sequencer::new();
        let a = FlowKey::new(Rid::new(), None);
        let b = FlowKey::new(Rid::new(), None);
        assert_eq!(seq.assign(a), 0);
        assert_eq!(seq.assign(b), 0);
        assert_eq!(seq.assign(a), 1);
    }

    #[test]
    fn synthesized_frame_continues_the_same_counter() {
        // Simulates forwarding two plugin frames then a host-synthesized
        // ERR on the same flow and writer: the ERR lands at seq 2, not 0.
        let mut seq = Sequencer::new();
        let key = FlowKey::new(Rid::new(), None);
        assert_eq!(seq.assign(key), 0);
        assert_eq!(seq.assign(key), 1);
        let err_seq = seq.assign(key);
        assert_eq!(err_seq, 2);
        seq.remove(key);
        assert_eq!(seq.peek(key), 0);
    }
}
