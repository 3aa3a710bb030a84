//! Application bootstrap.
//!
//! Wires the leaf subsystems (store, bus, breakers, ground stations) into
//! the components that depend on them (registry, queue, executor, ingester,
//! aggregator, health monitor) and owns the handful of periodic background
//! tasks a running process needs. A binary calls [`App::bootstrap`] once,
//! then [`App::spawn_background_tasks`], then builds its router/WS state
//! from the returned handle.

use crate::alarms::{AlarmManager, AlarmRaiser};
use crate::aggregator::TelemetryAggregator;
use crate::breaker::CircuitBreakerRegistry;
use crate::bus::PubSubBus;
use crate::config::StellarConfig;
use crate::executor::CommandExecutor;
use crate::ground_station::GroundStationRegistry;
use crate::health::HealthMonitor;
use crate::ingest::TelemetryIngester;
use crate::queue::CommandQueue;
use crate::registry::SatelliteRegistry;
use crate::store::{InMemoryStore, SharedStore};
use crate::tle::{StaticTleSource, TleRefreshService, TleSource};
use crate::ws::ChannelState;
use std::sync::Arc;

/// Every live subsystem, already wired to each other. Cloning is cheap:
/// every field is an `Arc` or an internally-`Arc`'d handle.
#[derive(Clone)]
pub struct App {
    pub config: Arc<StellarConfig>,
    pub store: SharedStore,
    pub bus: PubSubBus,
    pub alarms: Arc<AlarmManager>,
    pub breakers: CircuitBreakerRegistry,
    pub ground_stations: GroundStationRegistry,
    pub registry: Arc<SatelliteRegistry>,
    pub queue: Arc<CommandQueue>,
    pub executor: Arc<CommandExecutor>,
    pub aggregator: Arc<TelemetryAggregator>,
    pub ingester: Arc<TelemetryIngester>,
    pub health: Arc<HealthMonitor>,
    pub tle_refresh: Arc<TleRefreshService>,
}

impl App {
    /// Assembles every subsystem from a config, using the in-process
    /// `InMemoryStore` standing in for the relational store this
    /// repository treats as an external collaborator. Does not start any
    /// background task and does not reconcile queue state yet — callers
    /// decide when to do that via [`App::spawn_background_tasks`].
    pub fn bootstrap(config: StellarConfig) -> Self {
        let config = Arc::new(config);
        let store: SharedStore = Arc::new(InMemoryStore::new());
        let bus = PubSubBus::new();
        let breakers = CircuitBreakerRegistry::new(config.breakers.clone());
        let ground_stations = GroundStationRegistry::from_config(&config.ground_stations);

        let alarm_raiser = AlarmRaiser::new(store.clone(), bus.clone());
        let alarms = Arc::new(AlarmManager::new(store.clone(), bus.clone()));
        let registry = Arc::new(SatelliteRegistry::new(alarm_raiser.clone()));
        let queue = Arc::new(CommandQueue::new(store.clone(), bus.clone(), config.clone()));
        let executor = Arc::new(CommandExecutor::new(
            queue.clone(),
            registry.clone(),
            ground_stations.clone(),
            bus.clone(),
            config.base_transmission_delay_ms,
            config.transmission_jitter_ms,
        ));
        let aggregator = Arc::new(TelemetryAggregator::new(bus.clone()));
        let ingester = Arc::new(TelemetryIngester::new(
            store.clone(),
            registry.clone(),
            alarm_raiser.clone(),
            bus.clone(),
            aggregator.clone(),
            config.telemetry_thresholds.clone(),
            config.retention_days,
        ));
        let health = Arc::new(HealthMonitor::new(
            registry.clone(),
            aggregator.clone(),
            alarm_raiser,
            bus.clone(),
            config.heartbeat_timeout_ms as i64,
        ));

        let tle_source: Arc<dyn TleSource> = Arc::new(StaticTleSource { text: String::new() });
        let tle_refresh = Arc::new(TleRefreshService::new(
            tle_source,
            store.clone(),
            bus.clone(),
            breakers.clone(),
        ));

        Self {
            config,
            store,
            bus,
            alarms,
            breakers,
            ground_stations,
            registry,
            queue,
            executor,
            aggregator,
            ingester,
            health,
            tle_refresh,
        }
    }

    /// Loads every satellite record from the store and starts its actor.
    /// Mirrors the registry's "start at boot" lifecycle note in the actor
    /// contract — an actor exists only once something (here, boot) starts
    /// it.
    pub async fn start_known_satellites(&self) {
        match self.store.list_satellites().await {
            Ok(records) => {
                for record in records {
                    self.registry.start(record);
                }
            }
            Err(e) => tracing::error!(error = %e, "failed to load satellites at boot"),
        }
    }

    /// Replays non-terminal commands from the store into the in-memory
    /// queue, then spawns the tick-driven dispatcher, the executor's bus
    /// listener, the aggregator's persistence tick and stale-buffer sweep,
    /// the telemetry retention sweep, the health monitor's heartbeat
    /// listener and recheck tick, and the TLE refresh loop. Returns the
    /// handles so a binary can hold or ignore them.
    pub async fn spawn_background_tasks(&self) -> Vec<tokio::task::JoinHandle<()>> {
        if let Err(e) = self.queue.reconcile_on_startup().await {
            tracing::error!(error = %e, "failed to reconcile command queue at boot");
        }

        let mut handles = Vec::new();

        handles.push(crate::queue::spawn_dispatcher(
            self.queue.clone(),
            self.config.tick_interval_ms,
        ));

        {
            let executor = self.executor.clone();
            handles.push(tokio::spawn(async move { executor.run().await }));
        }

        {
            let health = self.health.clone();
            handles.push(tokio::spawn(async move { health.clone().run_heartbeat_listener().await }));
        }
        {
            let health = self.health.clone();
            let interval_ms = self.config.health_check_interval_ms;
            handles.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(std::time::Duration::from_millis(interval_ms));
                loop {
                    interval.tick().await;
                    health.recheck_all().await;
                }
            }));
        }

        {
            let aggregator = self.aggregator.clone();
            let store = self.store.clone();
            let interval_ms = self.config.aggregator_persist_interval_ms;
            handles.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(std::time::Duration::from_millis(interval_ms));
                loop {
                    interval.tick().await;
                    aggregator.persist_hourly(&store).await;
                }
            }));
        }

        {
            let aggregator = self.aggregator.clone();
            let interval_ms = self.config.aggregator_cleanup_interval_ms;
            handles.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(std::time::Duration::from_millis(interval_ms));
                loop {
                    interval.tick().await;
                    aggregator.cleanup_stale();
                }
            }));
        }

        {
            let ingester = self.ingester.clone();
            let interval_ms = self.config.telemetry_retention_interval_ms;
            handles.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(std::time::Duration::from_millis(interval_ms));
                loop {
                    interval.tick().await;
                    if let Err(e) = ingester.cleanup_old_telemetry().await {
                        tracing::warn!(error = %e, "telemetry retention sweep failed");
                    }
                }
            }));
        }

        if let Some(url) = self.config.orbital_service_url.clone() {
            tracing::info!(url, "TLE refresh service configured, periodic refresh started");
            handles.push(self.tle_refresh.clone().spawn(3_600_000));
        }

        handles
    }

    pub fn channel_state(&self) -> ChannelState {
        ChannelState {
            bus: self.bus.clone(),
            queue: self.queue.clone(),
            registry: self.registry.clone(),
            alarms: self.alarms.clone(),
            health: self.health.clone(),
            config: self.config.clone(),
        }
    }
}
