//! Satellite registry & supervisor.
//!
//! Named lookup `id -> actor handle`, start/stop, and a per-id restart
//! limiter. Mirrors the "one crashed actor does not affect others" and
//! "bounded restart rate" requirements: more than `max_restarts` crashes
//! within `restart_window` leaves the id down and raises an alarm instead
//! of respawning forever.

use crate::actor::ActorHandle;
use crate::alarms::AlarmRaiser;
use crate::error::{ErrorKind, StellarError};
use crate::models::{AlarmSeverity, SatelliteRecord};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::time::Instant;

struct RestartLimiter {
    window: std::time::Duration,
    max_restarts: usize,
    crashes: parking_lot::Mutex<VecDeque<Instant>>,
}

impl RestartLimiter {
    fn new(max_restarts: usize, window: std::time::Duration) -> Self {
        Self {
            window,
            max_restarts,
            crashes: parking_lot::Mutex::new(VecDeque::new()),
        }
    }

    /// Record a crash and report whether a restart is still permitted.
    fn record_and_check(&self) -> bool {
        let now = Instant::now();
        let mut crashes = self.crashes.lock();
        while let Some(front) = crashes.front() {
            if now.duration_since(*front) > self.window {
                crashes.pop_front();
            } else {
                break;
            }
        }
        crashes.push_back(now);
        crashes.len() <= self.max_restarts
    }
}

enum Entry {
    Up(ActorHandle),
    Down,
}

/// `id -> actor handle` table plus the restart-rate bookkeeping per id.
/// Readers (lookup/list/count) take lock-free `DashMap` reads; writers
/// (start/stop/restart) are the only ones that mutate an entry.
pub struct SatelliteRegistry {
    entries: DashMap<String, Entry>,
    limiters: DashMap<String, Arc<RestartLimiter>>,
    alarms: AlarmRaiser,
    max_restarts: usize,
    restart_window: std::time::Duration,
}

impl SatelliteRegistry {
    pub fn new(alarms: AlarmRaiser) -> Self {
        Self {
            entries: DashMap::new(),
            limiters: DashMap::new(),
            alarms,
            max_restarts: 3,
            restart_window: std::time::Duration::from_secs(10),
        }
    }

    fn limiter_for(&self, id: &str) -> Arc<RestartLimiter> {
        self.limiters
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(RestartLimiter::new(self.max_restarts, self.restart_window)))
            .clone()
    }

    /// Start an actor for `id`, seeded from `initial`. Returns the existing
    /// handle if one is already running (idempotent start).
    pub fn start(&self, initial: SatelliteRecord) -> ActorHandle {
        let id = initial.id.clone();
        if let Some(entry) = self.entries.get(&id) {
            if let Entry::Up(handle) = entry.value() {
                if handle.is_alive() {
                    return handle.clone();
                }
            }
        }
        let handle = ActorHandle::spawn(initial);
        self.entries.insert(id, Entry::Up(handle.clone()));
        handle
    }

    pub fn stop(&self, id: &str) {
        self.entries.remove(id);
    }

    pub fn lookup(&self, id: &str) -> Result<ActorHandle, StellarError> {
        match self.entries.get(id).map(|e| match e.value() {
            Entry::Up(handle) => Some(handle.clone()),
            Entry::Down => None,
        }) {
            Some(Some(handle)) if handle.is_alive() => Ok(handle),
            _ => Err(StellarError::new(
                ErrorKind::NotFound,
                format!("satellite {id} is not running"),
            )),
        }
    }

    pub fn list_ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn alive(&self, id: &str) -> bool {
        self.entries
            .get(id)
            .map(|e| matches!(e.value(), Entry::Up(h) if h.is_alive()))
            .unwrap_or(false)
    }

    /// Called by the supervising loop when a crash is detected for `id`.
    /// Respawns with default state (restart resets rather than reloads, an
    /// open question this repository resolves the simpler way) unless the
    /// restart-rate limiter says the id has crashed too often recently, in
    /// which case the id is left down and an alarm is raised.
    pub async fn restart(&self, id: &str, name: &str) {
        let limiter = self.limiter_for(id);
        if !limiter.record_and_check() {
            self.entries.insert(id.to_string(), Entry::Down);
            tracing::error!(satellite_id = %id, "restart rate exceeded, leaving actor down");
            self.alarms
                .raise(
                    "actor_down",
                    AlarmSeverity::Critical,
                    format!("satellite {id} actor exceeded restart rate and was left down"),
                    "registry",
                    Default::default(),
                )
                .await;
            return;
        }
        let handle = ActorHandle::spawn(SatelliteRecord::new(id, name));
        self.entries.insert(id.to_string(), Entry::Up(handle));
        tracing::info!(satellite_id = %id, "satellite actor restarted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::PubSubBus;

    fn test_alarms() -> AlarmRaiser {
        AlarmRaiser::new(
            Arc::new(crate::store::InMemoryStore::new()),
            PubSubBus::new(),
        )
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let registry = SatelliteRegistry::new(test_alarms());
        let h1 = registry.start(SatelliteRecord::new("SAT-A", "A"));
        let h2 = registry.start(SatelliteRecord::new("SAT-A", "A"));
        h1.update_energy(-10.0).await.unwrap();
        assert_eq!(h2.get_state().await.unwrap().energy, 90.0);
    }

    #[tokio::test]
    async fn restart_resets_state() {
        let registry = SatelliteRegistry::new(test_alarms());
        let handle = registry.start(SatelliteRecord::new("SAT-B", "B"));
        handle.update_energy(-70.0).await.unwrap();
        assert_eq!(handle.get_state().await.unwrap().energy, 30.0);

        registry.restart("SAT-B", "B").await;
        let restarted = registry.lookup("SAT-B").unwrap();
        assert_eq!(restarted.get_state().await.unwrap().energy, 100.0);
    }

    #[tokio::test]
    async fn restart_rate_limit_leaves_actor_down() {
        let registry = SatelliteRegistry::new(test_alarms());
        registry.start(SatelliteRecord::new("SAT-C", "C"));
        for _ in 0..3 {
            registry.restart("SAT-C", "C").await;
        }
        registry.restart("SAT-C", "C").await;
        assert!(!registry.alive("SAT-C"));
    }
}
