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

//! A sample plugin, intended as an illustration and a template for plugin
//! developers. Registers two capabilities beyond the runtime's built-in
//! `cap:` identity handler: an uppercasing text transform, and a second
//! capability that calls the first one as a peer invoke rather than doing
//! the transform itself, to illustrate `PluginCtx::call`.

use std::time::Duration;

use caphost_plugin::{Handler, InputPackage, PluginCtx, PluginRuntime};
use caphost_protocol::RemoteError;
use caphost_urn::CapUrn;

struct UppercasePlugin;

impl Handler for UppercasePlugin {
    fn handle_request(&mut self, ctx: &PluginCtx, pkg: InputPackage) -> Result<(), RemoteError> {
        let text = String::from_utf8_lossy(&pkg.flatten()).to_uppercase();
        let mut out = ctx.output("0", "media:text/plain");
        out.write(text.as_bytes());
        Ok(())
    }
}

struct UppercaseViaPeerPlugin;

impl Handler for UppercaseViaPeerPlugin {
    fn handle_request(&mut self, ctx: &PluginCtx, pkg: InputPackage) -> Result<(), RemoteError> {
        let uppercase_cap: CapUrn = "cap:in=media:text/plain;out=media:text/plain".parse().expect("valid literal cap urn");
        let response = ctx.call(uppercase_cap).arg("media:text/plain", pkg.flatten()).finish(Some(Duration::from_secs(10)))?;
        let mut out = ctx.output("0", "media:text/plain");
        out.write(&response.data);
        Ok(())
    }
}

fn main() {
    let uppercase_cap: CapUrn = "cap:in=media:text/plain;out=media:text/plain".parse().expect("valid literal cap urn");
    let via_peer_cap: CapUrn =
        "cap:in=media:text/plain;op=uppercase-via-peer;out=media:text/plain".parse().expect("valid literal cap urn");

    let mut runtime = PluginRuntime::new();
    runtime.register(uppercase_cap, Box::new(UppercasePlugin));
    runtime.register(via_peer_cap, Box::new(UppercaseViaPeerPlugin));

    if let Err(e) = runtime.run() {
        log::error!("demo-plugin exiting: {}", e);
        std::process::exit(1);
    }
}
