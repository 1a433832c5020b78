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

//! Host-side plugin supervisor and router.
//!
//! A [`router::Host`] owns the managed plugin table, the capability
//! table, and the two routing tables that bridge the relay's
//! engine-initiated addressing onto per-plugin stdin/stdout pipes. The
//! single dispatcher thread is the only mutator of that state; reader
//! threads for the relay and for every plugin push frames onto one
//! shared queue instead of calling back into the router directly.

pub mod cap_table;
pub mod catalog;
pub mod error;
pub mod inprocess;
pub mod managed_plugin;
pub mod peer_invoke;
pub mod router;

pub use cap_table::CapTable;
pub use catalog::{Activation, PluginCatalog, PluginDescription};
pub use error::HandshakeError;
pub use inprocess::{InProcessHandler, InProcessHost};
pub use managed_plugin::ManagedPlugin;
pub use peer_invoke::{PeerInvokeStrategy, PeerInvokeTarget, RefusingStrategy, RelayForwardingStrategy};
pub use router::{Host, RoutingEvent};
