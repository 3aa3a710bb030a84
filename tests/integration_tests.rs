//! End-to-end scenarios spanning the queue, executor, actor registry,
//! ingester, health monitor, and circuit breaker together, the way the
//! donor's `tests/integration_tests.rs` exercised the whole agent instead
//! of one subsystem at a time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use stellarops::alarms::{AlarmManager, AlarmRaiser};
use stellarops::breaker::CircuitBreakerRegistry;
use stellarops::bus::PubSubBus;
use stellarops::config::{BreakerConfig, StellarConfig};
use stellarops::error::ErrorKind;
use stellarops::executor::CommandExecutor;
use stellarops::ground_station::GroundStationRegistry;
use stellarops::health::HealthMonitor;
use stellarops::ingest::{IngestOptions, TelemetryIngester};
use stellarops::aggregator::TelemetryAggregator;
use stellarops::models::command::{EnqueueOptions, Priority};
use stellarops::models::satellite::SatelliteRecord;
use stellarops::models::CommandStatus;
use stellarops::queue::CommandQueue;
use stellarops::registry::SatelliteRegistry;
use stellarops::store::{InMemoryStore, SharedStore};

fn test_store() -> SharedStore {
    Arc::new(InMemoryStore::new())
}

/// One happy-path command: enqueued, dispatched, acknowledged, executed,
/// completed, and the satellite's mode actually changes (scenario 1 in
/// spec.md §8, without asserting exact message counts since the bus has no
/// replay buffer to inspect after the fact).
#[tokio::test]
async fn happy_command_moves_satellite_to_safe_mode() {
    let store = test_store();
    let bus = PubSubBus::new();
    let config = Arc::new(StellarConfig::default());
    let alarms = AlarmRaiser::new(store.clone(), bus.clone());
    let registry = Arc::new(SatelliteRegistry::new(alarms));
    let ground_stations = GroundStationRegistry::from_config(&config.ground_stations);
    let queue = Arc::new(CommandQueue::new(store.clone(), bus.clone(), config.clone()));
    let executor = Arc::new(CommandExecutor::new(
        queue.clone(),
        registry.clone(),
        ground_stations,
        bus.clone(),
        5,
        5,
    ));

    registry.start(SatelliteRecord::new("SAT-A", "Alpha"));

    let mut payload = HashMap::new();
    payload.insert("mode".to_string(), serde_json::json!("safe"));
    let command = queue
        .enqueue("SAT-A", "set_mode", payload, EnqueueOptions::default())
        .await
        .unwrap();

    let executor_task = tokio::spawn(executor.clone().run());

    queue.dispatch_tick().await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let current = queue.get(&command.id).await.unwrap();
        if current.status.is_terminal() {
            assert_eq!(current.status, CommandStatus::Completed);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "command never completed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let handle = registry.lookup("SAT-A").unwrap();
    let state = handle.get_state().await.unwrap();
    assert_eq!(state.mode, stellarops::models::Mode::Safe);

    executor_task.abort();
}

/// Priority + schedule ordering (scenario 3): a low-priority command sits
/// behind a critical one; a future-scheduled critical command is skipped by
/// the dispatcher without being promoted ahead of the not-yet-due rule. The
/// dispatcher's conservative per-satellite head check means that once the
/// critical command clears, the future-scheduled command at the new head
/// still blocks the satellite, so the low-priority command behind it stays
/// queued rather than being promoted out of order.
#[tokio::test]
async fn priority_and_schedule_ordering() {
    let store = test_store();
    let bus = PubSubBus::new();
    let config = Arc::new(StellarConfig::default());
    let queue = CommandQueue::new(store, bus, config);

    let low = queue
        .enqueue(
            "SAT-B",
            "noop",
            HashMap::new(),
            EnqueueOptions { priority: Priority::LOW, ..Default::default() },
        )
        .await
        .unwrap();
    let critical = queue
        .enqueue(
            "SAT-B",
            "noop",
            HashMap::new(),
            EnqueueOptions { priority: Priority::CRITICAL, ..Default::default() },
        )
        .await
        .unwrap();
    let future_critical = queue
        .enqueue(
            "SAT-B",
            "noop",
            HashMap::new(),
            EnqueueOptions {
                priority: Priority::CRITICAL,
                scheduled_at: Some(chrono::Utc::now() + chrono::Duration::minutes(10)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    queue.dispatch_tick().await;
    let dispatched = queue.get(&critical.id).await.unwrap();
    assert_eq!(dispatched.status, CommandStatus::Pending, "critical dispatched first");
    assert_eq!(queue.get(&low.id).await.unwrap().status, CommandStatus::Queued);
    assert_eq!(
        queue.get(&future_critical.id).await.unwrap().status,
        CommandStatus::Queued,
        "scheduled-in-the-future command is not promoted"
    );

    queue.complete(&critical.id, HashMap::new()).await.unwrap();
    queue.dispatch_tick().await;
    assert_eq!(
        queue.get(&future_critical.id).await.unwrap().status,
        CommandStatus::Queued,
        "future command still blocked after the head clears"
    );
    assert_eq!(
        queue.get(&low.id).await.unwrap().status,
        CommandStatus::Queued,
        "low stays queued behind the not-yet-due head rather than being promoted past it"
    );
}

/// At-most-one-in-flight (scenario 4): ten commands enqueued for the same
/// satellite never have more than one in `{pending, acknowledged,
/// executing}` at once.
#[tokio::test]
async fn at_most_one_in_flight_per_satellite() {
    let store = test_store();
    let bus = PubSubBus::new();
    let config = Arc::new(StellarConfig::default());
    let queue = CommandQueue::new(store, bus, config);

    let mut ids = Vec::new();
    for i in 0..10 {
        let cmd = queue
            .enqueue(
                "SAT-BUSY",
                "noop",
                HashMap::new(),
                EnqueueOptions { priority: Priority(i), ..Default::default() },
            )
            .await
            .unwrap();
        ids.push(cmd.id);
    }

    for _ in 0..10 {
        queue.dispatch_tick().await;
        assert!(queue.in_flight_count("SAT-BUSY").await <= 1);
        // complete whichever one is in flight so the next tick can pick up another
        for id in &ids {
            let cmd = queue.get(id).await.unwrap();
            if cmd.status == CommandStatus::Pending {
                queue.complete(id, HashMap::new()).await.unwrap();
                break;
            }
        }
    }

    for id in &ids {
        assert_eq!(queue.get(id).await.unwrap().status, CommandStatus::Completed);
    }
}

/// Anomaly -> alarm -> health status (scenario 6): a critically low energy
/// telemetry event raises a critical alarm and the satellite's recomputed
/// health goes to `critical`.
#[tokio::test]
async fn critical_energy_telemetry_raises_alarm_and_degrades_health() {
    let store = test_store();
    let bus = PubSubBus::new();
    let alarms_raiser = AlarmRaiser::new(store.clone(), bus.clone());
    let alarms = AlarmManager::new(store.clone(), bus.clone());
    let registry = Arc::new(SatelliteRegistry::new(alarms_raiser.clone()));
    let aggregator = Arc::new(TelemetryAggregator::new(bus.clone()));
    let ingester = TelemetryIngester::new(
        store.clone(),
        registry.clone(),
        alarms_raiser.clone(),
        bus.clone(),
        aggregator.clone(),
        stellarops::config::TelemetryThresholds::default(),
        90,
    );
    let health = Arc::new(HealthMonitor::new(
        registry.clone(),
        aggregator.clone(),
        alarms_raiser,
        bus.clone(),
        120_000,
    ));

    registry.start(SatelliteRecord::new("SAT-D", "Delta"));

    let mut payload = HashMap::new();
    payload.insert("energy".to_string(), serde_json::json!(4.0));
    ingester
        .ingest("SAT-D", "status", payload, IngestOptions::default())
        .await
        .unwrap();

    let alarm_list = alarms.list().await.unwrap();
    assert!(
        alarm_list.iter().any(|a| a.alarm_type == "critical_energy"
            && a.severity == stellarops::models::AlarmSeverity::Critical),
        "expected a critical_energy alarm, got {alarm_list:?}"
    );

    health.recheck_all().await;
    let record = health.status_of("SAT-D").expect("health record exists after recheck");
    assert_eq!(record.overall_status, stellarops::health::Status::Critical);
}

/// Circuit breaker (scenario 8): 5 timeouts within the window trip the
/// breaker; the 6th call is short-circuited without running the closure;
/// after the refresh window the breaker runs calls again.
#[tokio::test(start_paused = true)]
async fn circuit_breaker_trips_and_recovers() {
    let mut configs = HashMap::new();
    configs.insert(
        "orbital_service".to_string(),
        BreakerConfig { window_failures: 5, window_ms: 10_000, refresh_ms: 30_000, fallback: Default::default() },
    );
    let breakers = CircuitBreakerRegistry::new(configs);

    for _ in 0..5 {
        let result: Result<(), stellarops::error::StellarError> = breakers
            .call("orbital_service", || async { Err(stellarops::error::StellarError::timeout("slow")) })
            .await;
        assert!(result.is_err());
    }

    let mut ran = false;
    let result: Result<(), stellarops::error::StellarError> = breakers
        .call("orbital_service", || {
            ran = true;
            async { Ok(()) }
        })
        .await;
    assert!(result.is_err());
    assert_eq!(result.unwrap_err().kind, ErrorKind::CircuitOpen);
    assert!(!ran, "closure must not run while the breaker is open");

    tokio::time::advance(Duration::from_secs(31)).await;

    let result: Result<(), stellarops::error::StellarError> =
        breakers.call("orbital_service", || async { Ok(()) }).await;
    assert!(result.is_ok(), "breaker should admit calls again after refresh_ms");
}
