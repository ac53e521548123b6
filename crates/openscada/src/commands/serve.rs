//! `openscada serve`: wire hive, connections, AE/HD services and the
//! GMPP server from configuration, then run until Ctrl-C.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use openscada_config::Config;
use openscada_core::ae::{
    AeService, AknHandler, EventInjector, EventPool, EventStorage, MemoryEventStorage,
    MemoryReplicationStore, MonitorRegistry, ReplicationStore,
};
use openscada_core::catalogue::{Registration, ServiceCatalogue};
use openscada_core::da::{ConnectionAnalyzer, DaHive, DaServer, FactoryContext, ItemFactoryRegistry};
use openscada_core::hd::{ArchiveItem, HdService, HistoricalItem, Sample};
use openscada_core::proxy::{GmppConnection, RemoteConnection};
use openscada_core::{Listener, ListenerHandle, ServiceSettings, Source, Update, Variant};
use openscada_net::ConnectionState;

use crate::cli::{GlobalOpts, ServeArgs};
use crate::error::CliError;

/// Catalogue id of the event pool every service event lands in.
const EVENT_POOL: &str = "events";
/// Catalogue id of the connection monitors.
const CONNECTION_MONITORS: &str = "connections";

pub async fn handle(args: ServeArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let config = openscada_config::load_config(global.config.as_deref())?;
    let settings = config.service_settings()?;
    let listen = args.listen.unwrap_or_else(|| config.server.listen.clone());

    let cancel = CancellationToken::new();
    let service = Service::build(&config, &settings, &cancel)?;

    let listener = DaServer::bind(&listen).await.map_err(|e| CliError::Bind {
        listen: listen.clone(),
        reason: e.to_string(),
    })?;
    let server = DaServer::new(Arc::clone(&service.hive), settings.transport());
    service.start();

    tokio::select! {
        result = server.serve(listener, cancel.clone()) => result?,
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "cannot listen for Ctrl-C");
            }
            info!("shutting down");
        }
    }

    cancel.cancel();
    service.stop();
    Ok(())
}

// ── Service assembly ─────────────────────────────────────────────────

struct Service {
    hive: Arc<DaHive>,
    ae: Arc<AeService>,
    hd: Arc<HdService>,
    _analyzer: ConnectionAnalyzer,
    connections: Vec<Registration<dyn RemoteConnection>>,
    historical: Vec<Registration<dyn HistoricalItem>>,
}

impl Service {
    fn build(config: &Config, settings: &ServiceSettings, cancel: &CancellationToken) -> Result<Self, CliError> {
        let hive = DaHive::new(settings);

        // Upstream connections, each with a state item and a monitor.
        let connection_catalogue = ServiceCatalogue::<dyn RemoteConnection>::new();
        let analyzer = ConnectionAnalyzer::start(Arc::clone(&hive), &connection_catalogue)?;

        let storage = Arc::new(MemoryEventStorage::new());
        let pool = EventPool::with_storage(
            EVENT_POOL,
            settings.event_pool_size,
            None,
            Arc::clone(&storage) as Arc<dyn EventStorage>,
        );
        let monitors = MonitorRegistry::with_events(CONNECTION_MONITORS, Arc::clone(&pool));

        let mut connections = Vec::new();
        for (id, section) in &config.connections {
            let connection = GmppConnection::spawn(
                id.as_str(),
                section.uri.as_str(),
                settings,
                section.user.clone(),
                cancel.child_token(),
            );
            watch_connection(id, &connection, &monitors, cancel);
            connections.push(connection_catalogue.register(
                id.as_str(),
                BTreeMap::new(),
                connection as Arc<dyn RemoteConnection>,
            ));
        }

        // Items, each archived for historical queries.
        let factory = ItemFactoryRegistry::with_defaults();
        let ctx = FactoryContext {
            connections: Arc::clone(&connection_catalogue),
        };
        let historical_catalogue = ServiceCatalogue::<dyn HistoricalItem>::new();
        let mut historical = Vec::new();
        for spec in config.item_specs()? {
            hive.register_item(factory.create(&spec, &ctx)?);
            let archive = ArchiveItem::new(spec.name.as_str());
            hive.manager().subscribe(
                &spec.name,
                &ListenerHandle::new(Arc::new(Archiver(Arc::clone(&archive)))),
            )?;
            historical.push(historical_catalogue.register(
                spec.name.as_str(),
                BTreeMap::new(),
                archive as Arc<dyn HistoricalItem>,
            ));
        }
        info!(items = hive.item_ids().len(), connections = connections.len(), "items registered");

        let hd = HdService::new(settings);
        hd.track(&historical_catalogue);

        // Alarms & events.
        let akn_handlers = ServiceCatalogue::<dyn AknHandler>::new();
        akn_handlers.register(
            CONNECTION_MONITORS,
            BTreeMap::new(),
            Arc::clone(&monitors) as Arc<dyn AknHandler>,
        );
        let conditions = ServiceCatalogue::<dyn Source>::new();
        conditions.register(CONNECTION_MONITORS, BTreeMap::new(), monitors as Arc<dyn Source>);
        let events = ServiceCatalogue::<dyn Source>::new();
        events.register(EVENT_POOL, BTreeMap::new(), pool as Arc<dyn Source>);

        let ae = AeService::new(settings, Arc::clone(&storage) as Arc<dyn EventStorage>, akn_handlers);
        ae.track_conditions(&conditions);
        ae.track_events(&events);

        if config.replication.enabled {
            let store = Arc::new(MemoryReplicationStore::new(&settings.schema, storage));
            info!(table = %store.tables().replication, "event replication enabled");
            Arc::new(EventInjector::new(store as Arc<dyn ReplicationStore>, settings))
                .spawn(cancel.child_token());
        }

        Ok(Self {
            hive,
            ae,
            hd,
            _analyzer: analyzer,
            connections,
            historical,
        })
    }

    fn start(&self) {
        self.hive.start();
        self.ae.start();
        self.hd.start();
    }

    fn stop(self) {
        self.hive.stop();
        self.ae.stop();
        self.hd.stop();
        for registration in self.historical {
            registration.unregister();
        }
        for registration in self.connections {
            registration.unregister();
        }
    }
}

/// Report the state of `connection` through a condition monitor: a
/// closed connection is a failure that needs acknowledging.
fn watch_connection(
    id: &str,
    connection: &GmppConnection,
    monitors: &Arc<MonitorRegistry>,
    cancel: &CancellationToken,
) {
    let monitor = format!("connection.{id}");
    let monitors = Arc::clone(monitors);
    let mut state = connection.state();
    let cancel = cancel.child_token();
    tokio::spawn(async move {
        loop {
            let current = *state.borrow_and_update();
            let value = Variant::from(current.to_string());
            match current {
                ConnectionState::Connected => monitors.set_ok(&monitor, value, Utc::now()),
                ConnectionState::Closed => monitors.set_failure(&monitor, value, Utc::now(), true),
                ConnectionState::Connecting => {}
            }
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!(monitor, "connection monitor stopped");
    });
}

/// Feeds numeric item values into an archive.
struct Archiver(Arc<ArchiveItem>);

impl Listener for Archiver {
    fn deliver(&self, _key: &str, update: Update) {
        if let Update::Value(value) = update {
            if let Ok(v) = value.as_f64() {
                self.0.record(Sample::new(Utc::now(), v));
            }
        }
    }
}
