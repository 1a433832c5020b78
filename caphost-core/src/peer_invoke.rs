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

//! Pluggable resolution for a plugin-initiated `REQ` (a peer invoke):
//! where should it go?

use caphost_urn::CapUrn;

/// What the router should do with a plugin's peer-invoke request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerInvokeTarget {
    /// Refuse with `peer-invoke-not-supported`.
    Refuse,
    /// Forward the request upstream to the relay, as if it were a
    /// plugin response the relay itself is expected to answer. This is
    /// what makes the self-loop scenario work: the relay can route the
    /// request back down to any plugin's cap, including the requester's
    /// own, via the ordinary engine-initiated request path.
    Relay,
}

/// Strategy for resolving plugin peer invokes. Production strategies
/// compose capability registries and select targets by the same
/// matching rule as the cap URN algebra; the default refuses everything.
pub trait PeerInvokeStrategy: Send {
    fn begin_request(&self, cap: &CapUrn) -> PeerInvokeTarget;
}

/// The default strategy: no peer invoke is ever accepted.
pub struct RefusingStrategy;

impl PeerInvokeStrategy for RefusingStrategy {
    fn begin_request(&self, _cap: &CapUrn) -> PeerInvokeTarget {
        PeerInvokeTarget::Refuse
    }
}

/// Forwards every peer invoke to the relay, letting the upstream engine
/// decide how (or whether) to answer it.
pub struct RelayForwardingStrategy;

impl PeerInvokeStrategy for RelayForwardingStrategy {
    fn begin_request(&self, _cap: &CapUrn) -> PeerInvokeTarget {
        PeerInvokeTarget::Relay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refusing_strategy_always_refuses() {
        let cap: CapUrn = "cap:in=media:void;out=media:void".parse().unwrap();
        assert_eq!(RefusingStrategy.begin_request(&cap), PeerInvokeTarget::Refuse);
    }
}
