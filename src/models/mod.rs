//! Plain data shapes shared across subsystems.
//!
//! These are intentionally storage-agnostic: the durable store adapter
//! ([`crate::store`]) persists them, but nothing here knows about SQL.

pub mod alarm;
pub mod command;
pub mod satellite;
pub mod telemetry;

pub use alarm::{Alarm, AlarmSeverity, AlarmStatus, AlarmSummary};
pub use command::{Command, CommandStatus, Priority};
pub use satellite::{Mode, Position, SatelliteRecord};
pub use telemetry::TelemetryEvent;
