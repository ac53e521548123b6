// ── Archive item ──
//
// An in-memory historical item. Samples are kept sorted by timestamp and
// aggregated per bucket on every render.

use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

use super::{AVG, HistoricalItem, HistoricalQuery, HolderData, MAX, MIN, QueryBuffer, QueryListener};
use crate::browser::BrowserEntry;
use crate::error::CoreError;
use crate::model::{QueryParameters, QueryState};

/// One archived value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    /// Reliability in `[0, 1]`.
    pub quality: f64,
    /// Entered by an operator rather than recorded.
    pub manual: bool,
}

impl Sample {
    pub fn new(timestamp: DateTime<Utc>, value: f64) -> Self {
        Self {
            timestamp,
            value,
            quality: 1.0,
            manual: false,
        }
    }

    pub fn with_quality(mut self, quality: f64) -> Self {
        self.quality = quality;
        self
    }

    pub fn manual(mut self) -> Self {
        self.manual = true;
        self
    }
}

pub struct ArchiveItem {
    id: String,
    me: Weak<ArchiveItem>,
    samples: Mutex<Vec<Sample>>,
    live: Mutex<Vec<Weak<ArchiveQuery>>>,
}

impl ArchiveItem {
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id: id.into(),
            me: me.clone(),
            samples: Mutex::new(Vec::new()),
            live: Mutex::new(Vec::new()),
        })
    }

    /// Store a sample and re-render the live queries.
    pub fn record(&self, sample: Sample) {
        {
            let mut samples = self.samples.lock();
            let pos = samples.partition_point(|s| s.timestamp <= sample.timestamp);
            samples.insert(pos, sample);
        }

        let live: Vec<Arc<ArchiveQuery>> = {
            let mut live = self.live.lock();
            live.retain(|q| q.upgrade().is_some_and(|q| !q.buffer.lock().is_closed()));
            live.iter().filter_map(Weak::upgrade).collect()
        };
        for query in live {
            query.render(self);
        }
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.lock().is_empty()
    }

    /// Aggregate the samples over the grid of `parameters`.
    pub fn holder(&self, parameters: &QueryParameters) -> HolderData {
        let mut holder = HolderData::default();
        holder.reset(parameters);
        holder.state = QueryState::Complete;

        let samples = self.samples.lock();
        for (i, info) in holder.info.iter_mut().enumerate() {
            let from = samples.partition_point(|s| s.timestamp < info.start);
            let to = samples.partition_point(|s| s.timestamp < info.end);
            let Some(bucket) = samples.get(from..to).filter(|b| !b.is_empty()) else {
                continue;
            };

            #[allow(clippy::cast_precision_loss)]
            let (count, manual) = (
                bucket.len() as f64,
                bucket.iter().filter(|s| s.manual).count() as f64,
            );
            let sum: f64 = bucket.iter().map(|s| s.value).sum();
            let min = bucket.iter().map(|s| s.value).fold(f64::INFINITY, f64::min);
            let max = bucket.iter().map(|s| s.value).fold(f64::NEG_INFINITY, f64::max);

            info.entry_count = u64::try_from(bucket.len()).unwrap_or(u64::MAX);
            info.quality = bucket.iter().map(|s| s.quality).sum::<f64>() / count;
            info.manual = manual / count;
            for (name, value) in [(AVG, sum / count), (MIN, min), (MAX, max)] {
                if let Some(slot) = holder.values.get_mut(name).and_then(|v| v.get_mut(i)) {
                    *slot = Some(value);
                }
            }
        }
        holder
    }
}

impl HistoricalItem for ArchiveItem {
    fn id(&self) -> &str {
        &self.id
    }

    fn information(&self) -> BrowserEntry {
        BrowserEntry::new(&self.id).with_description("Archived values")
    }

    fn create_query(
        &self,
        parameters: QueryParameters,
        listener: Arc<dyn QueryListener>,
        update_data: bool,
    ) -> Result<Arc<dyn HistoricalQuery>, CoreError> {
        parameters.validate()?;
        let holder = self.holder(&parameters);
        let mut buffer = QueryBuffer::new(listener, parameters);
        buffer.render(&[&holder]);

        let query = Arc::new(ArchiveQuery {
            id: self.id.clone(),
            item: self.me.clone(),
            buffer: Mutex::new(buffer),
        });
        if update_data {
            self.live.lock().push(Arc::downgrade(&query));
        }
        debug!(item = %self.id, entries = parameters.entries, update_data, "archive query opened");
        Ok(query)
    }
}

pub(crate) struct ArchiveQuery {
    id: String,
    item: Weak<ArchiveItem>,
    buffer: Mutex<QueryBuffer>,
}

impl ArchiveQuery {
    // Aggregates under the buffer lock so a render never publishes a grid
    // for parameters that were replaced meanwhile.
    fn render(&self, item: &ArchiveItem) {
        let mut buffer = self.buffer.lock();
        let holder = item.holder(&buffer.parameters());
        buffer.render(&[&holder]);
    }
}

impl HistoricalQuery for ArchiveQuery {
    fn change_parameters(&self, parameters: QueryParameters) -> Result<(), CoreError> {
        parameters.validate()?;
        self.buffer.lock().change_parameters(parameters);
        if let Some(item) = self.item.upgrade() {
            self.render(&item);
        }
        Ok(())
    }

    fn close(&self) {
        self.buffer.lock().close();
        debug!(item = %self.id, "archive query closed");
    }

    fn state(&self) -> QueryState {
        self.buffer.lock().state()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::hd::QueryUpdate;
    use crate::hd::testing::QueryRecorder;
    use crate::model::QueryBucket;

    fn ts(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    fn last_data(updates: &[QueryUpdate]) -> Vec<QueryBucket> {
        updates
            .iter()
            .rev()
            .find_map(|u| match u {
                QueryUpdate::Data { buckets, .. } => Some(buckets.clone()),
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn buckets_aggregate_their_samples() {
        let item = ArchiveItem::new("flow");
        item.record(Sample::new(ts(100), 1.0));
        item.record(Sample::new(ts(600), 3.0).with_quality(0.5).manual());
        item.record(Sample::new(ts(1500), 7.0));
        assert_eq!(item.len(), 3);

        let recorder = Arc::new(QueryRecorder::default());
        let params = QueryParameters::new(ts(0), ts(3000), 3).unwrap();
        let query = item
            .create_query(params, Arc::clone(&recorder) as Arc<dyn QueryListener>, false)
            .unwrap();
        assert_eq!(query.state(), QueryState::Complete);

        let buckets = last_data(&recorder.take());
        assert_eq!(buckets.len(), 3);
        assert_eq!(buckets[0].entry_count, 2);
        assert_eq!(buckets[0].avg, Some(2.0));
        assert_eq!(buckets[0].min, Some(1.0));
        assert_eq!(buckets[0].max, Some(3.0));
        assert!((buckets[0].quality - 0.75).abs() < 1e-9);
        assert!((buckets[0].manual - 0.5).abs() < 1e-9);
        assert_eq!(buckets[1].avg, Some(7.0));
        assert!(buckets[2].is_empty());
    }

    #[test]
    fn live_queries_follow_new_samples() {
        let item = ArchiveItem::new("flow");
        let live = Arc::new(QueryRecorder::default());
        let fixed = Arc::new(QueryRecorder::default());
        let params = QueryParameters::new(ts(0), ts(2000), 2).unwrap();
        let _live = item
            .create_query(params, Arc::clone(&live) as Arc<dyn QueryListener>, true)
            .unwrap();
        let _fixed = item
            .create_query(params, Arc::clone(&fixed) as Arc<dyn QueryListener>, false)
            .unwrap();
        live.take();
        fixed.take();

        item.record(Sample::new(ts(1200), 4.0));
        assert_eq!(last_data(&live.take())[1].avg, Some(4.0));
        assert!(fixed.take().is_empty());
    }

    #[test]
    fn changed_parameters_render_again() {
        let item = ArchiveItem::new("flow");
        item.record(Sample::new(ts(2500), 4.0));
        let recorder = Arc::new(QueryRecorder::default());
        let query = item
            .create_query(
                QueryParameters::new(ts(0), ts(2000), 2).unwrap(),
                Arc::clone(&recorder) as Arc<dyn QueryListener>,
                false,
            )
            .unwrap();
        recorder.take();

        query
            .change_parameters(QueryParameters::new(ts(2000), ts(3000), 1).unwrap())
            .unwrap();
        let updates = recorder.take();
        assert!(matches!(updates[0], QueryUpdate::Parameters { .. }));
        assert_eq!(last_data(&updates)[0].avg, Some(4.0));
        assert_eq!(updates.last(), Some(&QueryUpdate::State(QueryState::Complete)));

        query.close();
        assert_eq!(query.state(), QueryState::Disconnected);
    }

    #[test]
    fn renders_racing_parameter_changes_keep_every_sample() {
        let item = ArchiveItem::new("flow");
        let recorder = Arc::new(QueryRecorder::default());
        let query = item
            .create_query(
                QueryParameters::new(ts(0), ts(4000), 4).unwrap(),
                Arc::clone(&recorder) as Arc<dyn QueryListener>,
                true,
            )
            .unwrap();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for i in 0..400 {
                    item.record(Sample::new(ts(i * 10), 1.0));
                }
            });
            for round in 0..50 {
                let entries = if round % 2 == 0 { 8 } else { 4 };
                query
                    .change_parameters(QueryParameters::new(ts(0), ts(4000), entries).unwrap())
                    .unwrap();
            }
        });
        query
            .change_parameters(QueryParameters::new(ts(0), ts(4000), 8).unwrap())
            .unwrap();

        let buckets = last_data(&recorder.take());
        assert_eq!(buckets.len(), 8);
        let total: u64 = buckets.iter().map(|bucket| bucket.entry_count).sum();
        assert_eq!(total, 400);
    }
}
