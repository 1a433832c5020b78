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

//! Capability URNs: `cap:key=value;key2=value2;...`.
//!
//! A [`CapUrn`] is an immutable, canonicalized value: tags are stored
//! sorted by key, and two URNs that differ only in source tag order,
//! incidental whitespace, or redundant trailing semicolons parse to the
//! same value.

use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;
use std::str::FromStr;

use serde::de::{self, Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};

/// The literal capability string every plugin manifest must declare.
///
/// Semantically `in=media:;out=media:`: an empty-tag URN accepts (and is
/// accepted by) anything, since a missing tag on either side of a match is
/// an implicit wildcard.
pub const CAP_IDENTITY: &str = "cap:";

/// The wildcard tag value.
pub const WILDCARD: &str = "*";

const PREFIX: &str = "cap:";

/// A parsed, canonical capability URN.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CapUrn {
    tags: BTreeMap<String, String>,
}

/// Errors produced while parsing a capability URN string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The string did not start with `cap:`.
    MissingPrefix,
    /// A tag was empty (e.g. `a=1;;b=2`).
    EmptyTag,
    /// A tag key was not a valid lower-case identifier.
    InvalidKey(String),
    /// The same key appeared more than once.
    DuplicateKey(String),
    /// An unquoted value contained a character that requires quoting.
    InvalidUnquotedValue(String),
    /// A quoted value was missing its closing `"`.
    UnterminatedQuote,
    /// A quoted value contained a `\` not followed by `"` or `\`.
    InvalidEscape,
    /// A non-wildcard URN omitted `in` or `out`.
    MissingRequiredTag(&'static str),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::MissingPrefix => write!(f, "capability URN must start with \"cap:\""),
            ParseError::EmptyTag => write!(f, "empty tag in capability URN"),
            ParseError::InvalidKey(k) => write!(f, "invalid tag key {:?}", k),
            ParseError::DuplicateKey(k) => write!(f, "duplicate tag key {:?}", k),
            ParseError::InvalidUnquotedValue(v) => {
                write!(f, "value {:?} contains a character that must be quoted", v)
            }
            ParseError::UnterminatedQuote => write!(f, "unterminated quoted value"),
            ParseError::InvalidEscape => write!(f, "invalid escape sequence in quoted value"),
            ParseError::MissingRequiredTag(name) => {
                write!(f, "non-wildcard capability URN is missing required tag {:?}", name)
            }
        }
    }
}

impl StdError for ParseError {}

fn is_key_char_first(c: char) -> bool {
    c.is_ascii_lowercase()
}

fn is_key_char_rest(c: char) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit()
}

fn is_unquoted_value_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, ':' | '/' | '-' | '*')
}

/// Splits `s` on top-level `;` (semicolons that are not inside a quoted
/// value), dropping any number of trailing empty tags.
fn split_tags(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut escape = false;
    let mut start = 0;
    let bytes = s.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        let c = b as char;
        if escape {
            escape = false;
            continue;
        }
        match c {
            '\\' if in_quotes => escape = true,
            '"' => in_quotes = !in_quotes,
            ';' if !in_quotes => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    while parts.last().map(|p| p.trim().is_empty()).unwrap_or(false) {
        parts.pop();
    }
    parts
}

fn parse_value(raw: &str) -> Result<String, ParseError> {
    let raw = raw.trim();
    if let Some(inner) = raw.strip_prefix('"') {
        let inner = inner.strip_suffix('"').ok_or(ParseError::UnterminatedQuote)?;
        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                match chars.next() {
                    Some(next @ ('"' | '\\')) => out.push(next),
                    _ => return Err(ParseError::InvalidEscape),
                }
            } else if c == '"' {
                // An unescaped quote inside the body means the original
                // string had content after the real closing quote, or an
                // embedded literal quote: both are malformed.
                return Err(ParseError::UnterminatedQuote);
            } else {
                out.push(c);
            }
        }
        Ok(out)
    } else {
        if raw.is_empty() || !raw.chars().all(is_unquoted_value_char) {
            return Err(ParseError::InvalidUnquotedValue(raw.to_owned()));
        }
        Ok(raw.to_ascii_lowercase())
    }
}

fn needs_quoting(value: &str) -> bool {
    value.is_empty() || value.chars().any(|c| !is_unquoted_value_char(c) || c.is_ascii_uppercase())
}

fn quote_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

impl CapUrn {
    /// Parses a capability URN string into its canonical form.
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let rest = s.strip_prefix(PREFIX).ok_or(ParseError::MissingPrefix)?;
        let mut tags = BTreeMap::new();
        if !rest.trim().is_empty() {
            for raw_tag in split_tags(rest) {
                let raw_tag = raw_tag.trim();
                if raw_tag.is_empty() {
                    return Err(ParseError::EmptyTag);
                }
                let (key, value) = match raw_tag.find('=') {
                    Some(idx) => {
                        let key = raw_tag[..idx].trim();
                        let value = parse_value(&raw_tag[idx + 1..])?;
                        (key, value)
                    }
                    None => (raw_tag, WILDCARD.to_owned()),
                };
                if key.is_empty()
                    || !key.starts_with(is_key_char_first)
                    || !key.chars().all(is_key_char_rest)
                {
                    return Err(ParseError::InvalidKey(key.to_owned()));
                }
                if tags.insert(key.to_owned(), value).is_some() {
                    return Err(ParseError::DuplicateKey(key.to_owned()));
                }
            }
        }
        if !tags.is_empty() {
            for required in ["in", "out"] {
                if !tags.contains_key(required) {
                    return Err(ParseError::MissingRequiredTag(required));
                }
            }
        }
        Ok(CapUrn { tags })
    }

    /// The `cap:` identity URN: zero tags, matches (and is matched by)
    /// anything.
    pub fn identity() -> Self {
        CapUrn { tags: BTreeMap::new() }
    }

    /// True if this is the bare `cap:` identity URN.
    pub fn is_identity(&self) -> bool {
        self.tags.is_empty()
    }

    /// The value of a tag, or `None` if the tag is absent (an implicit
    /// wildcard).
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(|s| s.as_str())
    }

    /// The declared input media URN, if any.
    pub fn in_media(&self) -> Option<&str> {
        self.tag("in")
    }

    /// The declared output media URN, if any.
    pub fn out_media(&self) -> Option<&str> {
        self.tag("out")
    }

    /// Number of tags whose value is not the wildcard `*`.
    pub fn specificity(&self) -> usize {
        self.tags.values().filter(|v| v.as_str() != WILDCARD).count()
    }

    /// Does `self` (a registered capability) accept `req` (a request)?
    ///
    /// A tag missing on either side is an implicit wildcard; present tags
    /// must be equal or one side must be `*`.
    pub fn accepts(&self, req: &CapUrn) -> bool {
        let mut keys: std::collections::BTreeSet<&str> =
            self.tags.keys().map(|s| s.as_str()).collect();
        keys.extend(req.tags.keys().map(|s| s.as_str()));
        keys.iter().all(|key| {
            let cap_val = self.tags.get(*key).map(|s| s.as_str()).unwrap_or(WILDCARD);
            let req_val = req.tags.get(*key).map(|s| s.as_str()).unwrap_or(WILDCARD);
            cap_val == WILDCARD || req_val == WILDCARD || cap_val == req_val
        })
    }
}

impl fmt::Display for CapUrn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cap:")?;
        for (i, (key, value)) in self.tags.iter().enumerate() {
            if i > 0 {
                write!(f, ";")?;
            }
            write!(f, "{}=", key)?;
            if needs_quoting(value) {
                write!(f, "{}", quote_value(value))?;
            } else {
                write!(f, "{}", value)?;
            }
        }
        Ok(())
    }
}

impl FromStr for CapUrn {
    type Err = ParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CapUrn::parse(s)
    }
}

impl Serialize for CapUrn {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CapUrn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        CapUrn::parse(&s).map_err(de::Error::custom)
    }
}

/// Picks the best-matching candidate for `req` out of `candidates`.
///
/// `candidates` yields `(registered_cap, payload)` pairs in the order they
/// should be treated as tied (earliest wins ties). The request is the
/// pattern; each registered cap's specificity is compared against the
/// request's, and the candidate whose specificity is closest wins.
pub fn best_match<'a, T>(
    req: &CapUrn,
    candidates: impl Iterator<Item = (&'a CapUrn, T)>,
) -> Option<T> {
    let req_spec = req.specificity() as i64;
    let mut best: Option<(i64, T)> = None;
    for (cap, payload) in candidates {
        if !cap.accepts(req) {
            continue;
        }
        let distance = (cap.specificity() as i64 - req_spec).abs();
        match &best {
            Some((best_distance, _)) if *best_distance <= distance => {}
            _ => best = Some((distance, payload)),
        }
    }
    best.map(|(_, payload)| payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_identity() {
        let cap = CapUrn::parse("cap:").unwrap();
        assert!(cap.is_identity());
        assert_eq!(cap.to_string(), "cap:");
    }

    #[test]
    fn requires_in_and_out_when_non_wildcard() {
        assert_eq!(
            CapUrn::parse("cap:op=x"),
            Err(ParseError::MissingRequiredTag("in"))
        );
        assert!(CapUrn::parse("cap:in=media:void;out=media:text").is_ok());
    }

    #[test]
    fn bare_key_is_wildcard() {
        let cap = CapUrn::parse("cap:in=media:void;out=media:text;op").unwrap();
        assert_eq!(cap.tag("op"), Some("*"));
    }

    #[test]
    fn rejects_duplicate_keys() {
        assert_eq!(
            CapUrn::parse("cap:in=media:x;out=media:y;in=media:z"),
            Err(ParseError::DuplicateKey("in".into()))
        );
    }

    #[test]
    fn tag_order_and_trailing_semicolons_are_insignificant() {
        let a = CapUrn::parse("cap:out=media:y;in=media:x;op=render;;").unwrap();
        let b = CapUrn::parse("cap:in=media:x; op=render ;out=media:y").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), b.to_string());
    }

    #[test]
    fn round_trips() {
        for s in [
            "cap:",
            "cap:in=media:void;out=media:text",
            r#"cap:in=media:void;out=media:text;title="Has Spaces""#,
        ] {
            let parsed = CapUrn::parse(s).unwrap();
            let reparsed = CapUrn::parse(&parsed.to_string()).unwrap();
            assert_eq!(parsed, reparsed);
        }
    }

    #[test]
    fn quotes_values_that_require_it() {
        let cap =
            CapUrn::parse(r#"cap:in=media:void;out=media:text;title="Release Notes""#).unwrap();
        assert_eq!(cap.tag("title"), Some("Release Notes"));
        assert!(cap.to_string().contains(r#"title="Release Notes""#));
    }

    #[test]
    fn quoted_value_escapes() {
        let cap = CapUrn::parse(r#"cap:in=media:void;out=media:text;n="a\"b\\c""#).unwrap();
        assert_eq!(cap.tag("n"), Some("a\"b\\c"));
        let back = cap.to_string();
        assert_eq!(CapUrn::parse(&back).unwrap(), cap);
    }

    #[test]
    fn accepts_is_wildcard_symmetric() {
        let broad = CapUrn::parse("cap:in=media:void;out=*").unwrap();
        let narrow = CapUrn::parse("cap:in=media:void;out=media:text;extra=1").unwrap();
        assert!(broad.accepts(&narrow));
    }

    #[test]
    fn accepts_mutual_implies_equal_at_same_specificity() {
        let a = CapUrn::parse("cap:in=media:void;out=media:text").unwrap();
        let b = CapUrn::parse("cap:in=media:void;out=media:text").unwrap();
        assert!(a.accepts(&b) && b.accepts(&a));
        assert_eq!(a.specificity(), b.specificity());
        assert_eq!(a, b);
    }

    #[test]
    fn identity_accepts_everything() {
        let identity = CapUrn::identity();
        let specific = CapUrn::parse("cap:in=media:void;out=media:text;op=x").unwrap();
        assert!(identity.accepts(&specific));
    }

    #[test]
    fn best_match_prefers_closest_specificity_then_first() {
        let req = CapUrn::parse("cap:in=media:void;out=media:text;op=x").unwrap();
        let exact = CapUrn::parse("cap:in=media:void;out=media:text;op=x").unwrap();
        let broad = CapUrn::parse("cap:in=media:void;out=*;op=*").unwrap();
        let candidates = vec![(&broad, "broad"), (&exact, "exact")];
        assert_eq!(best_match(&req, candidates.into_iter()), Some("exact"));

        let t1 = CapUrn::parse("cap:in=media:void;out=media:text").unwrap();
        let t2 = CapUrn::parse("cap:in=media:void;out=media:text;op=*").unwrap();
        let candidates = vec![(&t1, "first"), (&t2, "second")];
        assert_eq!(best_match(&req, candidates.into_iter()), Some("first"));
    }

    #[test]
    fn invalid_prefix_and_key_rules() {
        assert_eq!(CapUrn::parse("foo:bar"), Err(ParseError::MissingPrefix));
        assert_eq!(
            CapUrn::parse("cap:In=media:void;out=media:text"),
            Err(ParseError::InvalidKey("In".into()))
        );
    }

    #[test]
    fn serde_round_trip() {
        let cap = CapUrn::parse("cap:in=media:void;out=media:text").unwrap();
        let json = serde_json::to_string(&cap).unwrap();
        let back: CapUrn = serde_json::from_str(&json).unwrap();
        assert_eq!(cap, back);
    }
}
