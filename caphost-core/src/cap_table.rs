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

//! `capTable`: the unordered collection of `(cap urn, plugin index)`
//! entries the router consults on every relay `REQ`.

use caphost_urn::{best_match, CapUrn};

#[derive(Default)]
pub struct CapTable {
    entries: Vec<(CapUrn, usize)>,
}

impl CapTable {
    pub fn new() -> Self {
        CapTable { entries: Vec::new() }
    }

    pub fn insert(&mut self, cap: CapUrn, plugin_idx: usize) {
        self.entries.push((cap, plugin_idx));
    }

    /// Removes every entry belonging to `plugin_idx`.
    pub fn remove_plugin(&mut self, plugin_idx: usize) {
        self.entries.retain(|(_, idx)| *idx != plugin_idx);
    }

    /// Finds the plugin whose registered cap is the closest-specificity
    /// match for `requested`, per the same matching rule §4.A defines
    /// for cap URNs in general.
    pub fn route(&self, requested: &CapUrn) -> Option<usize> {
        best_match(requested, self.entries.iter().map(|(cap, idx)| (cap, *idx)))
    }

    pub fn iter(&self) -> impl Iterator<Item = &(CapUrn, usize)> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cap(s: &str) -> CapUrn {
        s.parse().unwrap()
    }

    #[test]
    fn routes_to_closest_specificity() {
        let mut table = CapTable::new();
        table.insert(cap("cap:in=media:void;op=x;out=media:y"), 0);
        table.insert(cap("cap:in=media:void;op=x;out=*"), 1);
        let got = table.route(&cap("cap:in=media:void;op=x;out=media:y"));
        assert_eq!(got, Some(0));
    }

    #[test]
    fn no_match_returns_none() {
        let mut table = CapTable::new();
        table.insert(cap("cap:in=media:void;op=x;out=media:y"), 0);
        assert_eq!(table.route(&cap("cap:in=media:void;op=zzz;out=*")), None);
    }

    #[test]
    fn remove_plugin_drops_all_its_entries() {
        let mut table = CapTable::new();
        table.insert(cap("cap:in=media:void;op=x;out=media:y"), 0);
        table.insert(cap("cap:in=media:void;op=z;out=media:y"), 0);
        table.insert(cap("cap:in=media:void;op=x;out=media:y"), 1);
        table.remove_plugin(0);
        assert_eq!(table.iter().count(), 1);
    }
}
