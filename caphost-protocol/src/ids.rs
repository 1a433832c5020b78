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

//! Opaque request and routing identifiers.

use std::fmt;

use serde::de::{self, Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};
use uuid::Uuid;

/// A 16-byte opaque request identifier, stable for the lifetime of one
/// request+response flow. Has a canonical textual form (lower-case
/// hyphenated hex, as produced by [`Uuid`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Rid(Uuid);

/// A routing identifier, assigned by the relay on every request leaving
/// the engine and carried back on all of that request's responses.
/// Plugins never send an `xid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Xid(Uuid);

macro_rules! opaque_id {
    ($ty:ident) => {
        impl $ty {
            /// Generates a new random identifier.
            pub fn new() -> Self {
                $ty(Uuid::new_v4())
            }
        }

        impl Default for $ty {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl std::str::FromStr for $ty {
            type Err = uuid::Error;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map($ty)
            }
        }

        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Uuid::parse_str(&s).map($ty).map_err(de::Error::custom)
            }
        }
    };
}

opaque_id!(Rid);
opaque_id!(Xid);

/// Identifies one logical request+response flow, for sequence assignment
/// and for the host's routing tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub rid: Rid,
    pub xid: Option<Xid>,
}

impl FlowKey {
    pub fn new(rid: Rid, xid: Option<Xid>) -> Self {
        FlowKey { rid, xid }
    }
}

/// `RxidKey = (xid, rid)`: identifies one engine-initiated request across
/// its entire lifetime, including the response direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RxidKey {
    pub xid: Xid,
    pub rid: Rid,
}

impl RxidKey {
    pub fn new(xid: Xid, rid: Rid) -> Self {
        RxidKey { xid, rid }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rid_round_trips_through_text() {
        let rid = Rid::new();
        let text = rid.to_string();
        assert_eq!(rid, text.parse().unwrap());
    }

    #[test]
    fn rid_and_xid_are_distinct_types() {
        // This is a compile-time property: FlowKey and RxidKey would not
        // type-check if Rid and Xid were interchangeable.
        let rid = Rid::new();
        let xid = Xid::new();
        let flow = FlowKey::new(rid, Some(xid));
        assert_eq!(flow.rid, rid);
        assert_eq!(flow.xid, Some(xid));
    }
}
