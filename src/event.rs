//! Event Model
//!
//! Vector times, durable events and snapshot metadata shared by the
//! replication machinery. Vector times are keyed by endpoint id and give the
//! partial order used for causal deduplication.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error;

/// Per-endpoint logical clock vector used to track causal relationships
/// between events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorTime {
    entries: HashMap<String, u64>,
}

impl VectorTime {
    /// Create an empty vector time
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style entry setter
    pub fn entry(mut self, endpoint_id: &str, value: u64) -> Self {
        self.set(endpoint_id, value);
        self
    }

    /// Get the clock value for an endpoint (0 if absent)
    pub fn value_of(&self, endpoint_id: &str) -> u64 {
        self.entries.get(endpoint_id).copied().unwrap_or(0)
    }

    /// Set the clock value for an endpoint
    pub fn set(&mut self, endpoint_id: &str, value: u64) {
        self.entries.insert(endpoint_id.to_string(), value);
    }

    /// Merge another vector time into this one, keeping the componentwise
    /// maximum.
    pub fn merge(&mut self, other: &Self) {
        for (endpoint_id, &value) in &other.entries {
            let entry = self.entries.entry(endpoint_id.clone()).or_insert(0);
            *entry = (*entry).max(value);
        }
    }

    /// Pointwise less-or-equal: every component of `self` is covered by
    /// `other`.
    pub fn leq(&self, other: &Self) -> bool {
        self.entries
            .iter()
            .all(|(endpoint_id, &value)| value <= other.value_of(endpoint_id))
    }

    /// Strict dominance: `self ≤ other` and at least one component is
    /// strictly smaller.
    pub fn lt(&self, other: &Self) -> bool {
        self.leq(other) && !other.leq(self)
    }

    /// Neither vector time dominates the other
    pub fn concurrent(&self, other: &Self) -> bool {
        !self.leq(other) && !other.leq(self)
    }
}

impl PartialOrd for VectorTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self.leq(other), other.leq(self)) {
            (true, true) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Less),
            (false, true) => Some(Ordering::Greater),
            (false, false) => None,
        }
    }
}

/// A single event as stored in and replicated between event logs. The
/// payload is opaque to the replication core; ordering is by the sequence
/// number the owning log assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurableEvent {
    /// Application-defined payload
    pub payload: Vec<u8>,
    /// Identity of the emitter that produced the event
    pub emitter_id: String,
    /// Causal timestamp assigned at emission
    pub vector_timestamp: VectorTime,
    /// Id of the log the event is currently stored in
    pub local_log_id: String,
    /// Sequence number in that log
    pub local_sequence_nr: u64,
}

impl DurableEvent {
    /// Create an event that has not yet been written to any log
    pub fn new(payload: Vec<u8>, emitter_id: &str) -> Self {
        Self {
            payload,
            emitter_id: emitter_id.to_string(),
            vector_timestamp: VectorTime::new(),
            local_log_id: String::new(),
            local_sequence_nr: 0,
        }
    }

    /// Whether this event carries information not yet covered by `version`
    pub fn is_new_at(&self, version: &VectorTime) -> bool {
        !self.vector_timestamp.leq(version)
    }
}

/// Snapshot metadata kept by an event log. Recovery invalidates snapshots
/// whose covered vector time references events the log no longer contains.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Emitter the snapshot belongs to
    pub emitter_id: String,
    /// Highest local sequence number covered by the snapshot
    pub sequence_nr: u64,
    /// Vector time covered by the snapshot
    pub vector_timestamp: VectorTime,
    /// Application-defined snapshot state
    pub payload: Vec<u8>,
}

/// Ordered, monotone application version. Endpoints reject replication reads
/// from endpoints running an older version of the same application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ApplicationVersion {
    pub major: u32,
    pub minor: u32,
}

impl ApplicationVersion {
    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl Default for ApplicationVersion {
    fn default() -> Self {
        Self { major: 1, minor: 0 }
    }
}

impl fmt::Display for ApplicationVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for ApplicationVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |part: &str| {
            part.parse::<u32>()
                .map_err(|_| Error::Config(format!("invalid application version: {s}")))
        };
        match s.split_once('.') {
            Some((major, minor)) => Ok(Self {
                major: parse(major)?,
                minor: parse(minor)?,
            }),
            None => Ok(Self {
                major: parse(s)?,
                minor: 0,
            }),
        }
    }
}

impl Serialize for ApplicationVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ApplicationVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_time_ordering() {
        let a = VectorTime::new().entry("a", 1).entry("b", 2);
        let b = VectorTime::new().entry("a", 1).entry("b", 3);

        assert!(a.leq(&b));
        assert!(a.lt(&b));
        assert!(!b.leq(&a));
        assert_eq!(a.partial_cmp(&b), Some(Ordering::Less));
        assert_eq!(b.partial_cmp(&a), Some(Ordering::Greater));
        assert_eq!(a.partial_cmp(&a.clone()), Some(Ordering::Equal));
    }

    #[test]
    fn test_vector_time_concurrent() {
        let a = VectorTime::new().entry("a", 2).entry("b", 1);
        let b = VectorTime::new().entry("a", 1).entry("b", 2);

        assert!(a.concurrent(&b));
        assert_eq!(a.partial_cmp(&b), None);
    }

    #[test]
    fn test_vector_time_missing_entries_are_zero() {
        let a = VectorTime::new().entry("a", 1);
        let b = VectorTime::new().entry("a", 1).entry("b", 5);

        assert!(a.leq(&b));
        assert!(!b.leq(&a));
    }

    #[test]
    fn test_vector_time_merge() {
        let mut a = VectorTime::new().entry("a", 3).entry("b", 1);
        let b = VectorTime::new().entry("b", 4).entry("c", 2);

        a.merge(&b);
        assert_eq!(a.value_of("a"), 3);
        assert_eq!(a.value_of("b"), 4);
        assert_eq!(a.value_of("c"), 2);
    }

    #[test]
    fn test_application_version_ordering() {
        let v1: ApplicationVersion = "1.0".parse().unwrap();
        let v2: ApplicationVersion = "2.0".parse().unwrap();
        let v21: ApplicationVersion = "2.1".parse().unwrap();

        assert!(v1 < v2);
        assert!(v2 < v21);
        assert_eq!(v2, ApplicationVersion::new(2, 0));
        assert_eq!(v21.to_string(), "2.1");
    }

    #[test]
    fn test_application_version_parse_errors() {
        assert!("".parse::<ApplicationVersion>().is_err());
        assert!("a.b".parse::<ApplicationVersion>().is_err());
        assert_eq!(
            "3".parse::<ApplicationVersion>().unwrap(),
            ApplicationVersion::new(3, 0)
        );
    }
}
