//! Ground station model.
//!
//! The executor routes commands to "a ground station that is online;
//! prefer lower load" — this is the entity that makes that concrete,
//! seeded from config and read by the executor through
//! [`GroundStationRegistry::select`].

use crate::config::GroundStationSeed;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
pub struct GroundStation {
    pub id: String,
    pub name: String,
    pub online: bool,
    pub load: u32,
}

#[derive(Clone)]
pub struct GroundStationRegistry {
    stations: Arc<DashMap<String, GroundStation>>,
}

impl GroundStationRegistry {
    pub fn from_config(seeds: &[GroundStationSeed]) -> Self {
        let stations = Arc::new(DashMap::new());
        for seed in seeds {
            stations.insert(
                seed.id.clone(),
                GroundStation {
                    id: seed.id.clone(),
                    name: seed.name.clone(),
                    online: true,
                    load: 0,
                },
            );
        }
        Self { stations }
    }

    /// Pick the lowest-load online station, incrementing its load so a
    /// burst of concurrent selections fans out rather than piling onto one
    /// station. Returns `None` if every station is offline.
    pub fn select(&self) -> Option<GroundStation> {
        let best_id = self
            .stations
            .iter()
            .filter(|e| e.value().online)
            .min_by_key(|e| e.value().load)
            .map(|e| e.key().clone())?;
        let mut entry = self.stations.get_mut(&best_id)?;
        entry.load += 1;
        Some(entry.clone())
    }

    pub fn release(&self, id: &str) {
        if let Some(mut station) = self.stations.get_mut(id) {
            station.load = station.load.saturating_sub(1);
        }
    }

    pub fn set_online(&self, id: &str, online: bool) {
        if let Some(mut station) = self.stations.get_mut(id) {
            station.online = online;
        }
    }

    pub fn list(&self) -> Vec<GroundStation> {
        self.stations.iter().map(|e| e.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_prefers_lowest_load() {
        let registry = GroundStationRegistry::from_config(&[
            GroundStationSeed { id: "a".into(), name: "A".into() },
            GroundStationSeed { id: "b".into(), name: "B".into() },
        ]);
        let first = registry.select().unwrap();
        let second = registry.select().unwrap();
        assert_ne!(first.id, second.id, "load-balances across stations");
    }

    #[test]
    fn select_returns_none_when_all_offline() {
        let registry = GroundStationRegistry::from_config(&[
            GroundStationSeed { id: "a".into(), name: "A".into() },
        ]);
        registry.set_online("a", false);
        assert!(registry.select().is_none());
    }
}
