//! Time-ordered store of recently seen requests.

use chrono::{DateTime, TimeDelta, Utc};
use std::collections::VecDeque;

use super::fields::FieldSnapshot;
use super::matcher::MatchMethod;

/// A request as remembered by the window. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRecord {
    fields: FieldSnapshot,
    timestamp: DateTime<Utc>,
}

impl RequestRecord {
    pub fn new(fields: FieldSnapshot, timestamp: DateTime<Utc>) -> Self {
        Self { fields, timestamp }
    }

    /// Attributes extracted from the request.
    pub fn fields(&self) -> &FieldSnapshot {
        &self.fields
    }

    /// When the request was recorded.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Append-only sequence of request records in non-decreasing timestamp order.
///
/// The store itself is not synchronized; the owner must serialize every
/// `record`/`evict` call for the ordering to hold.
#[derive(Debug, Default)]
pub struct SlidingWindow {
    records: VecDeque<RequestRecord>,
}

impl SlidingWindow {
    /// Create an empty window.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record for `fields` at `now`.
    ///
    /// A `now` older than the newest record is raised to that record's
    /// timestamp so the store stays sorted. Returns the stored timestamp.
    pub fn record(&mut self, fields: FieldSnapshot, now: DateTime<Utc>) -> DateTime<Utc> {
        let timestamp = match self.records.back() {
            Some(newest) if newest.timestamp > now => newest.timestamp,
            _ => now,
        };
        self.records.push_back(RequestRecord::new(fields, timestamp));
        timestamp
    }

    /// Drop every record strictly older than `now - window`.
    ///
    /// Records are sorted, so expired ones always form a prefix and eviction
    /// stops at the first record still in range. Returns the number removed.
    pub fn evict(&mut self, now: DateTime<Utc>, window: TimeDelta) -> usize {
        let Some(cutoff) = now.checked_sub_signed(window) else {
            return 0;
        };

        let mut removed = 0;
        while let Some(front) = self.records.front() {
            if front.timestamp < cutoff {
                self.records.pop_front();
                removed += 1;
            } else {
                break;
            }
        }
        removed
    }

    /// Count the stored records correlated with `incoming`.
    pub fn count_matching(&self, incoming: &FieldSnapshot, method: MatchMethod) -> usize {
        self.records
            .iter()
            .filter(|record| method.matches(&record.fields, incoming))
            .count()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Iterate from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &RequestRecord> {
        self.records.iter()
    }
}
