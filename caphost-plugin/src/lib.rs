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

//! Runtime library for implementing a caphost capability plugin.
//!
//! A binary using this crate implements [`Handler`] for each capability
//! it serves, registers it on a [`PluginRuntime`], and calls
//! [`PluginRuntime::run`]. The runtime handles the `HELLO` handshake
//! (including the identity probe, which is just an ordinary request
//! against the built-in `cap:` handler), multiplexing many in-flight
//! requests, and this plugin's own peer-invoke calls back to the host.

mod dispatch;
mod handler;

pub use caphost_urn::CapUrn;
pub use dispatch::PluginRuntime;
pub use handler::{Handler, InputPackage, InputStream, OutputStream, PeerCall, PluginCtx};
