//! Causal tag algebra.
//!
//! Every write is identified by a tag `origin@timestamp` where `origin` is
//! the stable client id of the writer and `timestamp` is the write's
//! wall-clock milliseconds. Tag sets record the causal history a row has
//! observed; the merge engine unions and subtracts them to decide which
//! writes survive.
//!
//! Tags compare by equality only (origin + exact millisecond). Ordering
//! across origins uses the embedded timestamp with a stable origin-string
//! tiebreak so merges are deterministic. Timestamps from the same origin are
//! monotone within a session; no other clock assumption is made.

use crate::error::{SatelliteError, SatelliteResult};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

/// The reserved origin string identifying writes made by the server itself
/// (initial shape data, server-side migrations).
pub const SERVER_ORIGIN: &str = "server";

/// A causal tag identifying a single write: `origin@timestamp`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tag {
    /// Client id of the writer.
    pub origin: String,
    /// Wall-clock milliseconds of the write.
    pub timestamp: i64,
}

impl Tag {
    /// Generates a tag for a write by `origin` at `timestamp`.
    pub fn generate(origin: impl Into<String>, timestamp: i64) -> Self {
        Self {
            origin: origin.into(),
            timestamp,
        }
    }

    /// Parses a tag from its `origin@timestamp` wire form.
    ///
    /// The origin itself may contain `@`; the timestamp is everything after
    /// the last one.
    pub fn parse(s: &str) -> SatelliteResult<Self> {
        let (origin, ts) = s
            .rsplit_once('@')
            .ok_or_else(|| SatelliteError::internal(format!("malformed tag: {s:?}")))?;
        let timestamp = ts
            .parse::<i64>()
            .map_err(|_| SatelliteError::internal(format!("malformed tag timestamp: {s:?}")))?;
        Ok(Self {
            origin: origin.to_string(),
            timestamp,
        })
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.origin, self.timestamp)
    }
}

impl PartialOrd for Tag {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Tag {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.origin.cmp(&other.origin))
    }
}

/// An unordered set of causal tags.
///
/// Backed by an ordered set so the wire encoding is canonical: equal sets
/// always encode to identical bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagSet {
    tags: BTreeSet<Tag>,
}

impl TagSet {
    /// Creates an empty tag set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a set containing a single tag.
    pub fn singleton(tag: Tag) -> Self {
        let mut tags = BTreeSet::new();
        tags.insert(tag);
        Self { tags }
    }

    /// Inserts a tag. Returns true if it was not already present.
    pub fn insert(&mut self, tag: Tag) -> bool {
        self.tags.insert(tag)
    }

    /// Returns true if the set contains `tag`.
    pub fn contains(&self, tag: &Tag) -> bool {
        self.tags.contains(tag)
    }

    /// Returns the union of this set and `other`.
    pub fn union(&self, other: &TagSet) -> TagSet {
        TagSet {
            tags: self.tags.union(&other.tags).cloned().collect(),
        }
    }

    /// Returns the tags in this set that are not in `other`.
    pub fn difference(&self, other: &TagSet) -> TagSet {
        TagSet {
            tags: self.tags.difference(&other.tags).cloned().collect(),
        }
    }

    /// Extends this set with all tags of `other`.
    pub fn extend(&mut self, other: &TagSet) {
        self.tags.extend(other.tags.iter().cloned());
    }

    /// Returns true if the set is empty.
    ///
    /// An empty shadow tag set means the row is deleted.
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Returns the number of tags.
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    /// Iterates the tags in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = &Tag> {
        self.tags.iter()
    }

    /// Encodes the set as a canonical JSON array of `origin@timestamp`
    /// strings for wire and storage.
    pub fn encode(&self) -> String {
        let strings: Vec<String> = self.tags.iter().map(Tag::to_string).collect();
        serde_json::to_string(&strings).expect("string array serialization cannot fail")
    }

    /// Decodes a set from its JSON-array form.
    pub fn decode(encoded: &str) -> SatelliteResult<Self> {
        if encoded.is_empty() {
            return Ok(Self::new());
        }
        let strings: Vec<String> = serde_json::from_str(encoded)
            .map_err(|e| SatelliteError::internal(format!("malformed tag set: {e}")))?;
        let mut tags = BTreeSet::new();
        for s in &strings {
            tags.insert(Tag::parse(s)?);
        }
        Ok(Self { tags })
    }

    /// Builds a set from wire tag strings.
    pub fn from_wire(strings: &[String]) -> SatelliteResult<Self> {
        let mut tags = BTreeSet::new();
        for s in strings {
            tags.insert(Tag::parse(s)?);
        }
        Ok(Self { tags })
    }

    /// Converts the set into wire tag strings in canonical order.
    pub fn to_wire(&self) -> Vec<String> {
        self.tags.iter().map(Tag::to_string).collect()
    }
}

impl FromIterator<Tag> for TagSet {
    fn from_iter<I: IntoIterator<Item = Tag>>(iter: I) -> Self {
        Self {
            tags: iter.into_iter().collect(),
        }
    }
}
