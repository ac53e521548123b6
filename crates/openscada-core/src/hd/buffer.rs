// ── Query buffer ──
//
// Owns the bucket grid of one query and merges data holders into it by
// quality. Every render rebuilds the grid from the holders it is given,
// so a holder that disappears stops contributing.

use std::sync::Arc;

use tracing::trace;

use super::{AVG, HolderData, MAX, MIN, QueryListener, QueryUpdate, value_types};
use crate::model::{QueryBucket, QueryParameters, QueryState};

pub struct QueryBuffer {
    listener: Arc<dyn QueryListener>,
    parameters: QueryParameters,
    buckets: Vec<QueryBucket>,
    state: QueryState,
}

impl QueryBuffer {
    /// Start a query; the listener sees the parameters first.
    pub fn new(listener: Arc<dyn QueryListener>, parameters: QueryParameters) -> Self {
        let buffer = Self {
            listener,
            buckets: parameters.empty_buckets(),
            parameters,
            state: QueryState::Requested,
        };
        buffer.listener.update(QueryUpdate::Parameters {
            parameters,
            value_types: value_types(),
        });
        buffer
    }

    pub fn parameters(&self) -> QueryParameters {
        self.parameters
    }

    pub fn buckets(&self) -> &[QueryBucket] {
        &self.buckets
    }

    pub fn state(&self) -> QueryState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_terminal()
    }

    /// Merge `holders` into a fresh grid and report it as a whole.
    ///
    /// Holders whose grid size differs are skipped, as are buckets missing
    /// any aggregate. A bucket takes the first holder's data and is only
    /// replaced by strictly higher quality.
    pub fn render(&mut self, holders: &[&HolderData]) {
        if self.is_closed() {
            return;
        }

        let entries = self.parameters.entries;
        let mut grid = self.parameters.empty_buckets();
        let mut written = vec![false; entries];

        for holder in holders {
            if holder.info.len() != entries {
                trace!(expected = entries, got = holder.info.len(), "holder skipped");
                continue;
            }
            let (Some(avg), Some(min), Some(max)) = (
                holder.values.get(AVG),
                holder.values.get(MIN),
                holder.values.get(MAX),
            ) else {
                continue;
            };

            for (i, info) in holder.info.iter().enumerate() {
                let (Some(Some(avg)), Some(Some(min)), Some(Some(max))) =
                    (avg.get(i), min.get(i), max.get(i))
                else {
                    continue;
                };
                if written[i] && grid[i].quality >= info.quality {
                    continue;
                }
                let bucket = &mut grid[i];
                bucket.entry_count = info.entry_count;
                bucket.quality = info.quality;
                bucket.manual = info.manual;
                bucket.avg = Some(*avg);
                bucket.min = Some(*min);
                bucket.max = Some(*max);
                written[i] = true;
            }
        }

        self.buckets = grid;
        self.listener.update(QueryUpdate::Data {
            index: 0,
            buckets: self.buckets.clone(),
        });

        let next = if holders.iter().any(|h| h.state == QueryState::Loading) {
            QueryState::Loading
        } else {
            QueryState::Complete
        };
        self.set_state(next);
    }

    /// Rebuild the grid for new parameters. The listener sees the new
    /// parameters, then the empty grid, then the state back at Requested.
    pub fn change_parameters(&mut self, parameters: QueryParameters) {
        if self.is_closed() {
            return;
        }
        self.parameters = parameters;
        self.buckets = parameters.empty_buckets();
        self.listener.update(QueryUpdate::Parameters {
            parameters,
            value_types: value_types(),
        });
        self.listener.update(QueryUpdate::Data {
            index: 0,
            buckets: self.buckets.clone(),
        });
        self.state = QueryState::Requested;
        self.listener.update(QueryUpdate::State(QueryState::Requested));
    }

    /// Close the query. Idempotent.
    pub fn close(&mut self) {
        self.set_state(QueryState::Disconnected);
    }

    fn set_state(&mut self, next: QueryState) {
        if next == self.state && next != QueryState::Loading {
            return;
        }
        if !self.state.can_transition_to(next) {
            return;
        }
        self.state = next;
        self.listener.update(QueryUpdate::State(next));
    }
}
