//! Replication Filters
//!
//! Filter predicates applied to events before they cross a replication link,
//! and the endpoint-level algebra that combines target-side and source-side
//! filters. Filters travel inside read requests, so they are a serializable
//! composition tree rather than arbitrary closures.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::event::DurableEvent;

/// A serializable event filter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReplicationFilter {
    /// Accepts every event
    NoFilter,
    /// Accepts events accepted by all inner filters
    And(Vec<ReplicationFilter>),
    /// Accepts events accepted by at least one inner filter
    Or(Vec<ReplicationFilter>),
    /// Inverts the inner filter
    Not(Box<ReplicationFilter>),
    /// Accepts events produced by the given emitter
    Emitter(String),
    /// Accepts events whose payload starts with the given prefix
    PayloadPrefix(Vec<u8>),
}

impl ReplicationFilter {
    /// Apply the filter to an event
    pub fn apply(&self, event: &DurableEvent) -> bool {
        match self {
            ReplicationFilter::NoFilter => true,
            ReplicationFilter::And(filters) => filters.iter().all(|f| f.apply(event)),
            ReplicationFilter::Or(filters) => filters.iter().any(|f| f.apply(event)),
            ReplicationFilter::Not(filter) => !filter.apply(event),
            ReplicationFilter::Emitter(emitter_id) => event.emitter_id == *emitter_id,
            ReplicationFilter::PayloadPrefix(prefix) => event.payload.starts_with(prefix),
        }
    }

    /// Conjunction of two filters. `NoFilter` is the identity.
    pub fn and(self, other: ReplicationFilter) -> ReplicationFilter {
        match (self, other) {
            (ReplicationFilter::NoFilter, f) | (f, ReplicationFilter::NoFilter) => f,
            (ReplicationFilter::And(mut a), ReplicationFilter::And(b)) => {
                a.extend(b);
                ReplicationFilter::And(a)
            }
            (ReplicationFilter::And(mut a), f) => {
                a.push(f);
                ReplicationFilter::And(a)
            }
            (f, ReplicationFilter::And(b)) => {
                let mut filters = vec![f];
                filters.extend(b);
                ReplicationFilter::And(filters)
            }
            (a, b) => ReplicationFilter::And(vec![a, b]),
        }
    }

    /// Combinator selecting the left filter, used where a target-side filter
    /// overrides a source-side one.
    pub fn left_identity(a: ReplicationFilter, _b: ReplicationFilter) -> ReplicationFilter {
        a
    }

    /// Whether the filter lets every event pass
    pub fn is_trivial(&self) -> bool {
        matches!(self, ReplicationFilter::NoFilter)
    }
}

/// How `EndpointFilters` combines a target-side and a source-side filter
/// when both are present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Combine {
    #[default]
    And,
    LeftIdentity,
}

/// Endpoint-level filter configuration: target filters keyed by target log
/// id, source filters keyed by source log name, and a combination strategy.
#[derive(Debug, Clone, Default)]
pub struct EndpointFilters {
    target_filters: HashMap<String, ReplicationFilter>,
    source_filters: HashMap<String, ReplicationFilter>,
    combine: Combine,
}

impl EndpointFilters {
    /// No filtering at all; every lookup yields `NoFilter`
    pub fn no_filters() -> Self {
        Self::default()
    }

    /// Combine target and source filters with `and` when both are present,
    /// otherwise use the present one.
    pub fn target_and_source(
        target_filters: HashMap<String, ReplicationFilter>,
        source_filters: HashMap<String, ReplicationFilter>,
    ) -> Self {
        Self {
            target_filters,
            source_filters,
            combine: Combine::And,
        }
    }

    /// Use the target filter when present, otherwise the source filter
    pub fn target_overwrites_source(
        target_filters: HashMap<String, ReplicationFilter>,
        source_filters: HashMap<String, ReplicationFilter>,
    ) -> Self {
        Self {
            target_filters,
            source_filters,
            combine: Combine::LeftIdentity,
        }
    }

    /// Source-side filters only
    pub fn source_filters(source_filters: HashMap<String, ReplicationFilter>) -> Self {
        Self {
            target_filters: HashMap::new(),
            source_filters,
            combine: Combine::And,
        }
    }

    /// Target-side filters only
    pub fn target_filters(target_filters: HashMap<String, ReplicationFilter>) -> Self {
        Self {
            target_filters,
            source_filters: HashMap::new(),
            combine: Combine::And,
        }
    }

    /// Resolve the filter for a replication read from the named source log
    /// into the given target log. Missing entries yield `NoFilter`.
    pub fn filter_for(&self, target_log_id: &str, source_log_name: &str) -> ReplicationFilter {
        let target = self.target_filters.get(target_log_id).cloned();
        let source = self.source_filters.get(source_log_name).cloned();

        match (self.combine, target, source) {
            (Combine::And, Some(t), Some(s)) => t.and(s),
            (Combine::LeftIdentity, Some(t), Some(s)) => ReplicationFilter::left_identity(t, s),
            (_, Some(f), None) | (_, None, Some(f)) => f,
            (_, None, None) => ReplicationFilter::NoFilter,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(emitter_id: &str, payload: &[u8]) -> DurableEvent {
        DurableEvent::new(payload.to_vec(), emitter_id)
    }

    fn filter_map(key: &str, filter: ReplicationFilter) -> HashMap<String, ReplicationFilter> {
        HashMap::from([(key.to_string(), filter)])
    }

    #[test]
    fn test_filter_application() {
        let f = ReplicationFilter::Emitter("a".into());
        assert!(f.apply(&event("a", b"x")));
        assert!(!f.apply(&event("b", b"x")));

        let f = ReplicationFilter::PayloadPrefix(b"ord".to_vec());
        assert!(f.apply(&event("a", b"order-1")));
        assert!(!f.apply(&event("a", b"invoice-1")));

        let f = ReplicationFilter::Not(Box::new(ReplicationFilter::Emitter("a".into())));
        assert!(!f.apply(&event("a", b"x")));
        assert!(f.apply(&event("b", b"x")));
    }

    #[test]
    fn test_and_identity() {
        let f = ReplicationFilter::Emitter("a".into());
        assert_eq!(f.clone().and(ReplicationFilter::NoFilter), f);
        assert_eq!(ReplicationFilter::NoFilter.and(f.clone()), f);
    }

    #[test]
    fn test_and_flattens() {
        let a = ReplicationFilter::Emitter("a".into());
        let b = ReplicationFilter::Emitter("b".into());
        let c = ReplicationFilter::Emitter("c".into());

        let combined = a.clone().and(b.clone()).and(c.clone());
        assert_eq!(combined, ReplicationFilter::And(vec![a, b, c]));
    }

    #[test]
    fn test_target_and_source_combines() {
        let a = ReplicationFilter::Emitter("a".into());
        let b = ReplicationFilter::Emitter("b".into());

        let filters =
            EndpointFilters::target_and_source(filter_map("L", a.clone()), filter_map("L", b.clone()));
        assert_eq!(filters.filter_for("L", "L"), a.clone().and(b));
        assert_eq!(filters.filter_for("M", "L"), ReplicationFilter::Emitter("b".into()));
        assert_eq!(filters.filter_for("M", "N"), ReplicationFilter::NoFilter);
    }

    #[test]
    fn test_target_overwrites_source() {
        let a = ReplicationFilter::Emitter("a".into());
        let b = ReplicationFilter::Emitter("b".into());

        let filters = EndpointFilters::target_overwrites_source(
            filter_map("L", a.clone()),
            filter_map("L", b.clone()),
        );
        assert_eq!(filters.filter_for("L", "L"), a);
        assert_eq!(filters.filter_for("M", "L"), b);
    }

    #[test]
    fn test_single_sided_lookups() {
        let a = ReplicationFilter::Emitter("a".into());

        let filters = EndpointFilters::source_filters(filter_map("L", a.clone()));
        assert_eq!(filters.filter_for("anything", "L"), a.clone());
        assert_eq!(filters.filter_for("anything", "M"), ReplicationFilter::NoFilter);

        let filters = EndpointFilters::target_filters(filter_map("L", a.clone()));
        assert_eq!(filters.filter_for("L", "anything"), a);
        assert_eq!(filters.filter_for("M", "anything"), ReplicationFilter::NoFilter);

        assert_eq!(
            EndpointFilters::no_filters().filter_for("L", "L"),
            ReplicationFilter::NoFilter
        );
    }
}
