//! Durable store adapter.
//!
//! The SQL dialect, schema, and transaction manager live on the other side
//! of the line this repository draws as "the relational store, out of scope".
//! What stays in scope is the *contract*: typed, transactional operations
//! that never leak a raw query to a caller. `DurableStore` is the trait
//! every subsystem codes against; `InMemoryStore` is the in-process stand-in
//! used by the binaries and tests in this repository, guarded by a
//! `parking_lot::RwLock` rather than an async mutex since every critical
//! section here is pure in-memory bookkeeping with no `.await` inside it.

use crate::error::{ErrorKind, StellarError};
use crate::models::{Alarm, Command, CommandStatus, SatelliteRecord, TelemetryEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct HourlyAggregate {
    pub satellite_id: String,
    pub metric: String,
    pub window: String,
    pub recorded_at: DateTime<Utc>,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub count: u64,
    pub stddev: f64,
}

#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn create_satellite(&self, record: SatelliteRecord) -> Result<SatelliteRecord, StellarError>;
    async fn get_satellite(&self, id: &str) -> Result<SatelliteRecord, StellarError>;
    async fn update_satellite(&self, record: SatelliteRecord) -> Result<SatelliteRecord, StellarError>;
    async fn list_satellites(&self) -> Result<Vec<SatelliteRecord>, StellarError>;

    async fn insert_command(&self, command: Command) -> Result<Command, StellarError>;
    async fn update_command_status(
        &self,
        id: &str,
        status: CommandStatus,
        result: Option<HashMap<String, serde_json::Value>>,
        error: Option<String>,
    ) -> Result<Command, StellarError>;
    async fn get_command(&self, id: &str) -> Result<Command, StellarError>;
    async fn replace_command(&self, command: Command) -> Result<Command, StellarError>;
    async fn list_non_terminal_commands(&self) -> Result<Vec<Command>, StellarError>;
    async fn command_history(
        &self,
        satellite_id: &str,
        limit: usize,
    ) -> Result<Vec<Command>, StellarError>;

    async fn insert_telemetry_event(&self, event: TelemetryEvent) -> Result<TelemetryEvent, StellarError>;
    async fn delete_telemetry_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StellarError>;
    async fn upsert_hourly_aggregate(&self, aggregate: HourlyAggregate) -> Result<(), StellarError>;

    async fn create_alarm(&self, alarm: Alarm) -> Result<Alarm, StellarError>;
    async fn update_alarm(&self, alarm: Alarm) -> Result<Alarm, StellarError>;
    async fn get_alarm(&self, id: &str) -> Result<Alarm, StellarError>;
    async fn list_alarms(&self) -> Result<Vec<Alarm>, StellarError>;

    async fn upsert_tle(&self, satellite_id: &str, line1: String, line2: String, epoch: DateTime<Utc>) -> Result<(), StellarError>;
}

#[derive(Default)]
struct Tables {
    satellites: HashMap<String, SatelliteRecord>,
    commands: HashMap<String, Command>,
    telemetry: Vec<TelemetryEvent>,
    aggregates: HashMap<(String, String, String), HourlyAggregate>,
    alarms: HashMap<String, Alarm>,
}

/// In-memory stand-in for the relational store. Every public method takes
/// the single write lock for the duration of its critical section, which
/// is the "each operation is transactional" guarantee this contract
/// for — read-your-writes falls out for free since there is one table set.
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
        }
    }
}

#[async_trait]
impl DurableStore for InMemoryStore {
    async fn create_satellite(&self, record: SatelliteRecord) -> Result<SatelliteRecord, StellarError> {
        let mut tables = self.tables.write();
        if tables.satellites.contains_key(&record.id) {
            return Err(StellarError::new(
                ErrorKind::AlreadyExists,
                format!("satellite {} already exists", record.id),
            ));
        }
        tables.satellites.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn get_satellite(&self, id: &str) -> Result<SatelliteRecord, StellarError> {
        self.tables
            .read()
            .satellites
            .get(id)
            .cloned()
            .ok_or_else(|| StellarError::not_found(format!("satellite {id}")))
    }

    async fn update_satellite(&self, record: SatelliteRecord) -> Result<SatelliteRecord, StellarError> {
        let mut tables = self.tables.write();
        if !tables.satellites.contains_key(&record.id) {
            return Err(StellarError::not_found(format!("satellite {}", record.id)));
        }
        tables.satellites.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn list_satellites(&self) -> Result<Vec<SatelliteRecord>, StellarError> {
        Ok(self.tables.read().satellites.values().cloned().collect())
    }

    async fn insert_command(&self, command: Command) -> Result<Command, StellarError> {
        let mut tables = self.tables.write();
        tables.commands.insert(command.id.clone(), command.clone());
        Ok(command)
    }

    async fn update_command_status(
        &self,
        id: &str,
        status: CommandStatus,
        result: Option<HashMap<String, serde_json::Value>>,
        error: Option<String>,
    ) -> Result<Command, StellarError> {
        let mut tables = self.tables.write();
        let command = tables
            .commands
            .get_mut(id)
            .ok_or_else(|| StellarError::not_found(format!("command {id}")))?;
        command.transition(status)?;
        let now = Utc::now();
        match status {
            CommandStatus::Pending => command.sent_at = Some(now),
            CommandStatus::Executing => command.started_at = Some(now),
            CommandStatus::Completed | CommandStatus::Failed | CommandStatus::Cancelled => {
                command.completed_at = Some(now);
            }
            _ => {}
        }
        if result.is_some() {
            command.result = result;
        }
        if error.is_some() {
            command.error = error;
        }
        Ok(command.clone())
    }

    async fn get_command(&self, id: &str) -> Result<Command, StellarError> {
        self.tables
            .read()
            .commands
            .get(id)
            .cloned()
            .ok_or_else(|| StellarError::not_found(format!("command {id}")))
    }

    async fn replace_command(&self, command: Command) -> Result<Command, StellarError> {
        let mut tables = self.tables.write();
        tables.commands.insert(command.id.clone(), command.clone());
        Ok(command)
    }

    async fn list_non_terminal_commands(&self) -> Result<Vec<Command>, StellarError> {
        Ok(self
            .tables
            .read()
            .commands
            .values()
            .filter(|c| !c.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn command_history(
        &self,
        satellite_id: &str,
        limit: usize,
    ) -> Result<Vec<Command>, StellarError> {
        let mut history: Vec<Command> = self
            .tables
            .read()
            .commands
            .values()
            .filter(|c| c.satellite_id == satellite_id)
            .cloned()
            .collect();
        history.sort_by(|a, b| b.inserted_at.cmp(&a.inserted_at));
        history.truncate(limit);
        Ok(history)
    }

    async fn insert_telemetry_event(&self, event: TelemetryEvent) -> Result<TelemetryEvent, StellarError> {
        let mut tables = self.tables.write();
        tables.telemetry.push(event.clone());
        Ok(event)
    }

    async fn delete_telemetry_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StellarError> {
        let mut tables = self.tables.write();
        let before = tables.telemetry.len();
        tables.telemetry.retain(|e| e.recorded_at >= cutoff);
        Ok((before - tables.telemetry.len()) as u64)
    }

    async fn upsert_hourly_aggregate(&self, aggregate: HourlyAggregate) -> Result<(), StellarError> {
        let mut tables = self.tables.write();
        let key = (
            aggregate.satellite_id.clone(),
            aggregate.metric.clone(),
            aggregate.window.clone(),
        );
        tables.aggregates.insert(key, aggregate);
        Ok(())
    }

    async fn create_alarm(&self, alarm: Alarm) -> Result<Alarm, StellarError> {
        let mut tables = self.tables.write();
        tables.alarms.insert(alarm.id.clone(), alarm.clone());
        Ok(alarm)
    }

    async fn update_alarm(&self, alarm: Alarm) -> Result<Alarm, StellarError> {
        let mut tables = self.tables.write();
        if !tables.alarms.contains_key(&alarm.id) {
            return Err(StellarError::not_found(format!("alarm {}", alarm.id)));
        }
        tables.alarms.insert(alarm.id.clone(), alarm.clone());
        Ok(alarm)
    }

    async fn get_alarm(&self, id: &str) -> Result<Alarm, StellarError> {
        self.tables
            .read()
            .alarms
            .get(id)
            .cloned()
            .ok_or_else(|| StellarError::not_found(format!("alarm {id}")))
    }

    async fn list_alarms(&self) -> Result<Vec<Alarm>, StellarError> {
        Ok(self.tables.read().alarms.values().cloned().collect())
    }

    async fn upsert_tle(
        &self,
        satellite_id: &str,
        line1: String,
        line2: String,
        epoch: DateTime<Utc>,
    ) -> Result<(), StellarError> {
        let mut tables = self.tables.write();
        let sat = tables
            .satellites
            .get_mut(satellite_id)
            .ok_or_else(|| StellarError::not_found(format!("satellite {satellite_id}")))?;
        sat.tle_line1 = Some(line1);
        sat.tle_line2 = Some(line2);
        sat.tle_epoch = Some(epoch);
        Ok(())
    }
}

pub type SharedStore = Arc<dyn DurableStore>;
