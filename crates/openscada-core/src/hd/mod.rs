// ── Historical data ──
//
// Bucketed time-range queries over archived values. An item renders a
// query through a `QueryBuffer`, which owns the bucket grid and the
// query state and reports every change to the query's listener.

mod archive;
mod buffer;
mod service;

use std::collections::BTreeMap;
use std::sync::Arc;

pub use archive::{ArchiveItem, Sample};
pub use buffer::QueryBuffer;
pub use service::HdService;

use crate::browser::BrowserEntry;
use crate::error::CoreError;
use crate::model::{QueryBucket, QueryParameters, QueryState, ValueInformation};

/// Average series name.
pub const AVG: &str = "AVG";
/// Minimum series name.
pub const MIN: &str = "MIN";
/// Maximum series name.
pub const MAX: &str = "MAX";

/// Series every query reports.
pub fn value_types() -> Vec<String> {
    vec![AVG.to_owned(), MIN.to_owned(), MAX.to_owned()]
}

/// One change reported by a query.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryUpdate {
    /// New parameters. Always precedes the data rendered for them.
    Parameters {
        parameters: QueryParameters,
        value_types: Vec<String>,
    },
    /// Buckets starting at `index`.
    Data {
        index: usize,
        buckets: Vec<QueryBucket>,
    },
    State(QueryState),
}

/// Receiver of query updates. Called with the query's lock held.
pub trait QueryListener: Send + Sync {
    fn update(&self, update: QueryUpdate);
}

/// Rendered output of one data holder: per-bucket metadata and the
/// aggregate series, all of the same length.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HolderData {
    pub info: Vec<ValueInformation>,
    pub values: BTreeMap<String, Vec<Option<f64>>>,
    pub state: QueryState,
}

impl HolderData {
    /// Reset to the empty grid of `parameters`.
    pub fn reset(&mut self, parameters: &QueryParameters) {
        self.info = (0..parameters.entries)
            .map(|i| {
                let (start, end) = parameters.bucket_bounds(i);
                ValueInformation {
                    start,
                    end,
                    quality: 0.0,
                    manual: 0.0,
                    entry_count: 0,
                }
            })
            .collect();
        self.values = [AVG, MIN, MAX]
            .into_iter()
            .map(|name| (name.to_owned(), vec![None; parameters.entries]))
            .collect();
        self.state = QueryState::Requested;
    }

    /// Fold an update of an upstream query into this holder.
    pub fn apply(&mut self, update: &QueryUpdate) {
        match update {
            QueryUpdate::Parameters { parameters, .. } => self.reset(parameters),
            QueryUpdate::Data { index, buckets } => {
                for (offset, bucket) in buckets.iter().enumerate() {
                    let i = index + offset;
                    let Some(info) = self.info.get_mut(i) else {
                        break;
                    };
                    *info = ValueInformation {
                        start: bucket.start,
                        end: bucket.end,
                        quality: bucket.quality,
                        manual: bucket.manual,
                        entry_count: bucket.entry_count,
                    };
                    for (name, value) in [(AVG, bucket.avg), (MIN, bucket.min), (MAX, bucket.max)] {
                        if let Some(slot) = self.values.get_mut(name).and_then(|v| v.get_mut(i)) {
                            *slot = value;
                        }
                    }
                }
            }
            QueryUpdate::State(state) => self.state = *state,
        }
    }
}

/// An open historical query.
pub trait HistoricalQuery: Send + Sync {
    /// Re-render over new parameters. No-op once closed.
    fn change_parameters(&self, parameters: QueryParameters) -> Result<(), CoreError>;

    /// Close the query; its listener sees Disconnected. Idempotent.
    fn close(&self);

    fn state(&self) -> QueryState;
}

/// An item served by the HD service.
pub trait HistoricalItem: Send + Sync {
    fn id(&self) -> &str;

    fn information(&self) -> BrowserEntry;

    /// Open a query. With `update_data` the query keeps rendering as new
    /// data arrives.
    fn create_query(
        &self,
        parameters: QueryParameters,
        listener: Arc<dyn QueryListener>,
        update_data: bool,
    ) -> Result<Arc<dyn HistoricalQuery>, CoreError>;
}

#[cfg(test)]
pub(crate) mod testing {
    use parking_lot::Mutex;

    use super::{QueryListener, QueryUpdate};

    /// Records every query update in order.
    #[derive(Default)]
    pub(crate) struct QueryRecorder {
        seen: Mutex<Vec<QueryUpdate>>,
    }

    impl QueryRecorder {
        pub(crate) fn take(&self) -> Vec<QueryUpdate> {
            std::mem::take(&mut *self.seen.lock())
        }
    }

    impl QueryListener for QueryRecorder {
        fn update(&self, update: QueryUpdate) {
            self.seen.lock().push(update);
        }
    }
}
