// ── Historical query model ──
//
// A query covers `[start, end)` with N equal-width buckets. Bucket bounds
// are computed from the whole range each time so rounding never
// accumulates: bucket `i` starts at `start + span * i / N`.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Time range and resolution of a historical query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryParameters {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Number of buckets, always > 0.
    pub entries: usize,
}

impl QueryParameters {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>, entries: usize) -> Result<Self, CoreError> {
        let params = Self {
            start,
            end,
            entries,
        };
        params.validate()?;
        Ok(params)
    }

    /// Every bucket must be at least one millisecond wide.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.entries == 0 {
            return Err(CoreError::validation("query needs at least one entry"));
        }
        let span = self.span_ms();
        if span <= 0 {
            return Err(CoreError::validation("query start must be before its end"));
        }
        let entries = i64::try_from(self.entries)
            .map_err(|_| CoreError::validation("too many query entries"))?;
        if span < entries {
            return Err(CoreError::validation(format!(
                "range of {span}ms cannot hold {entries} buckets"
            )));
        }
        Ok(())
    }

    pub fn span_ms(&self) -> i64 {
        (self.end - self.start).num_milliseconds()
    }

    /// Start of bucket `index`; `index == entries` yields `end`.
    pub fn boundary(&self, index: usize) -> DateTime<Utc> {
        if index >= self.entries {
            return self.end;
        }
        let span = i128::from(self.span_ms());
        let offset = span * index_i128(index) / index_i128(self.entries);
        // offset < span, which already fits an i64.
        let offset = i64::try_from(offset).unwrap_or(i64::MAX);
        self.start + Duration::milliseconds(offset)
    }

    /// `[start, end)` of bucket `index`.
    pub fn bucket_bounds(&self, index: usize) -> (DateTime<Utc>, DateTime<Utc>) {
        (self.boundary(index), self.boundary(index + 1))
    }

    /// Index of the bucket containing `ts`, if inside the range.
    pub fn bucket_of(&self, ts: DateTime<Utc>) -> Option<usize> {
        if ts < self.start || ts >= self.end {
            return None;
        }
        let offset = i128::from((ts - self.start).num_milliseconds());
        let span = i128::from(self.span_ms());
        let index = offset * index_i128(self.entries) / span;
        let mut index = usize::try_from(index).ok()?;
        // Integer division can land one bucket off near a boundary.
        while index > 0 && ts < self.boundary(index) {
            index -= 1;
        }
        while index + 1 < self.entries && ts >= self.boundary(index + 1) {
            index += 1;
        }
        Some(index)
    }

    /// Empty bucket grid for these parameters.
    pub fn empty_buckets(&self) -> Vec<QueryBucket> {
        (0..self.entries)
            .map(|i| {
                let (start, end) = self.bucket_bounds(i);
                QueryBucket::empty(start, end)
            })
            .collect()
    }
}

fn index_i128(value: usize) -> i128 {
    i128::try_from(value).unwrap_or(i128::MAX)
}

/// One rendered bucket of a historical query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryBucket {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub entry_count: u64,
    /// Data reliability in `[0, 1]`.
    pub quality: f64,
    /// Share of manually entered samples in `[0, 1]`.
    pub manual: f64,
    pub avg: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl QueryBucket {
    pub fn empty(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start,
            end,
            entry_count: 0,
            quality: 0.0,
            manual: 0.0,
            avg: None,
            min: None,
            max: None,
        }
    }

    /// Returns `true` if nothing has been written to this bucket yet.
    pub fn is_empty(&self) -> bool {
        self.avg.is_none() && self.min.is_none() && self.max.is_none()
    }
}

/// Per-bucket metadata reported by a data holder alongside its aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueInformation {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub quality: f64,
    pub manual: f64,
    pub entry_count: u64,
}

// ── Query state ──────────────────────────────────────────────────────

/// Lifecycle of a query.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryState {
    #[default]
    Requested,
    Loading,
    Complete,
    /// Terminal: cancelled, closed or timed out.
    Disconnected,
}

impl QueryState {
    /// Forward-only transitions. Loading may repeat to report progress and
    /// anything may drop to Disconnected.
    pub fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Disconnected, _) => false,
            (_, Self::Disconnected)
            | (Self::Requested | Self::Loading, Self::Loading | Self::Complete) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Disconnected
    }
}
