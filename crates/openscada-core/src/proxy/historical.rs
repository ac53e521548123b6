// ── Proxy historical item ──
//
// Opens one query per upstream item and merges their rendered grids
// through a `QueryBuffer`. Upstreams are resolved from the catalogue when
// a query is opened.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::browser::BrowserEntry;
use crate::catalogue::ServiceCatalogue;
use crate::error::CoreError;
use crate::hd::{HistoricalItem, HistoricalQuery, HolderData, QueryBuffer, QueryListener, QueryUpdate};
use crate::model::{QueryParameters, QueryState};

pub struct ProxyHistoricalItem {
    id: String,
    upstreams: Vec<String>,
    catalogue: Arc<ServiceCatalogue<dyn HistoricalItem>>,
}

impl ProxyHistoricalItem {
    pub fn new(
        id: impl Into<String>,
        upstreams: Vec<String>,
        catalogue: &Arc<ServiceCatalogue<dyn HistoricalItem>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            upstreams,
            catalogue: Arc::clone(catalogue),
        })
    }
}

impl HistoricalItem for ProxyHistoricalItem {
    fn id(&self) -> &str {
        &self.id
    }

    fn information(&self) -> BrowserEntry {
        BrowserEntry::new(&self.id)
            .with_description(format!("Proxy over {} upstreams", self.upstreams.len()))
    }

    fn create_query(
        &self,
        parameters: QueryParameters,
        listener: Arc<dyn QueryListener>,
        update_data: bool,
    ) -> Result<Arc<dyn HistoricalQuery>, CoreError> {
        parameters.validate()?;
        let items: Vec<Arc<dyn HistoricalItem>> = self
            .upstreams
            .iter()
            .filter_map(|id| self.catalogue.get(id).map(|e| e.service))
            .collect();

        let mut holders = vec![HolderData::default(); items.len()];
        for holder in &mut holders {
            holder.reset(&parameters);
        }
        let query = Arc::new(ProxyQuery {
            item: self.id.clone(),
            state: Mutex::new(Merge {
                buffer: QueryBuffer::new(listener, parameters),
                holders,
            }),
            upstreams: Mutex::new(Vec::new()),
        });

        let mut upstreams = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            let holder = Arc::new(HolderListener {
                query: Arc::downgrade(&query),
                index,
            });
            match item.create_query(parameters, holder, update_data) {
                Ok(upstream) => upstreams.push(upstream),
                Err(e) => warn!(item = %self.id, upstream = %item.id(), error = %e, "upstream query failed"),
            }
        }
        *query.upstreams.lock() = upstreams;
        query.render();

        debug!(item = %self.id, upstreams = items.len(), "proxy query opened");
        Ok(query)
    }
}

struct Merge {
    buffer: QueryBuffer,
    holders: Vec<HolderData>,
}

struct ProxyQuery {
    item: String,
    state: Mutex<Merge>,
    upstreams: Mutex<Vec<Arc<dyn HistoricalQuery>>>,
}

impl ProxyQuery {
    fn on_holder(&self, index: usize, update: &QueryUpdate) {
        let mut merge = self.state.lock();
        if let Some(holder) = merge.holders.get_mut(index) {
            holder.apply(update);
        }
        // The upstream's data for new parameters follows.
        if matches!(update, QueryUpdate::Parameters { .. }) {
            return;
        }
        let Merge { buffer, holders } = &mut *merge;
        buffer.render(&holders.iter().collect::<Vec<_>>());
    }

    fn render(&self) {
        let mut merge = self.state.lock();
        let Merge { buffer, holders } = &mut *merge;
        buffer.render(&holders.iter().collect::<Vec<_>>());
    }
}

impl HistoricalQuery for ProxyQuery {
    fn change_parameters(&self, parameters: QueryParameters) -> Result<(), CoreError> {
        parameters.validate()?;
        {
            let mut merge = self.state.lock();
            if merge.buffer.is_closed() {
                return Ok(());
            }
            merge.buffer.change_parameters(parameters);
            for holder in &mut merge.holders {
                holder.reset(&parameters);
            }
        }
        let upstreams = self.upstreams.lock().clone();
        for upstream in upstreams {
            upstream.change_parameters(parameters)?;
        }
        Ok(())
    }

    fn close(&self) {
        let upstreams = std::mem::take(&mut *self.upstreams.lock());
        for upstream in upstreams {
            upstream.close();
        }
        self.state.lock().buffer.close();
        debug!(item = %self.item, "proxy query closed");
    }

    fn state(&self) -> QueryState {
        self.state.lock().buffer.state()
    }
}

struct HolderListener {
    query: Weak<ProxyQuery>,
    index: usize,
}

impl QueryListener for HolderListener {
    fn update(&self, update: QueryUpdate) {
        if let Some(query) = self.query.upgrade() {
            query.on_holder(self.index, &update);
        }
    }
}
