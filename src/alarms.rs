//! Alarm lifecycle plus the small `AlarmRaiser` interface subsystems depend
//! on to avoid a circular-reference trap: health monitor, telemetry
//! ingester, and registry all need to raise alarms, but none of them
//! should need a full `AlarmManager` to do it.

use crate::bus::PubSubBus;
use crate::error::StellarError;
use crate::models::{Alarm, AlarmSeverity, AlarmStatus, AlarmSummary};
use crate::store::SharedStore;
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Narrow capability handed to subsystems that only need to raise alarms,
/// not manage their full lifecycle (ack/resolve/list). Cloning is cheap.
#[derive(Clone)]
pub struct AlarmRaiser {
    store: SharedStore,
    bus: PubSubBus,
}

impl AlarmRaiser {
    pub fn new(store: SharedStore, bus: PubSubBus) -> Self {
        Self { store, bus }
    }

    pub async fn raise(
        &self,
        alarm_type: &str,
        severity: AlarmSeverity,
        message: impl Into<String>,
        source: &str,
        details: HashMap<String, Value>,
    ) -> Alarm {
        let alarm = Alarm::new(
            Uuid::new_v4().to_string(),
            alarm_type,
            severity,
            message,
            source,
            details,
            chrono::Utc::now(),
        );
        let persisted = match self.store.create_alarm(alarm.clone()).await {
            Ok(a) => a,
            Err(e) => {
                tracing::error!(error = %e, "failed to persist alarm");
                alarm
            }
        };
        tracing::warn!(alarm_type, %severity, source, "alarm raised");
        self.bus.publish(
            "alarms:all",
            serde_json::json!({"event": "alarm_raised", "alarm": persisted}),
        );
        self.bus.publish(
            &format!("alarms:{source}"),
            serde_json::json!({"event": "alarm_raised", "alarm": persisted}),
        );
        persisted
    }
}

/// Full lifecycle manager: raise (via [`AlarmRaiser`]), acknowledge,
/// resolve, list, and the `{summary, active_alarms}` WebSocket snapshot.
#[derive(Clone)]
pub struct AlarmManager {
    store: SharedStore,
    bus: PubSubBus,
    pub raiser: AlarmRaiser,
}

impl AlarmManager {
    pub fn new(store: SharedStore, bus: PubSubBus) -> Self {
        Self {
            raiser: AlarmRaiser::new(store.clone(), bus.clone()),
            store,
            bus,
        }
    }

    pub async fn raise(
        &self,
        alarm_type: &str,
        severity: AlarmSeverity,
        message: impl Into<String>,
        source: &str,
        details: HashMap<String, Value>,
    ) -> Alarm {
        self.raiser.raise(alarm_type, severity, message, source, details).await
    }

    /// Acknowledging requires a non-empty actor id.
    pub async fn acknowledge(&self, id: &str, actor_id: &str) -> Result<Alarm, StellarError> {
        if actor_id.trim().is_empty() {
            return Err(StellarError::validation("acknowledging an alarm requires an actor id"));
        }
        let mut alarm = self.store.get_alarm(id).await?;
        if alarm.status == AlarmStatus::Resolved {
            return Err(StellarError::invalid_status(format!("alarm {id} is already resolved")));
        }
        alarm.status = AlarmStatus::Acknowledged;
        alarm.acknowledged_at = Some(chrono::Utc::now());
        alarm.acknowledged_by = Some(actor_id.to_string());
        let saved = self.store.update_alarm(alarm).await?;
        self.bus.publish(
            "alarms:all",
            serde_json::json!({"event": "alarm_acknowledged", "alarm": saved}),
        );
        Ok(saved)
    }

    /// Resolving is terminal: no further updates land on this alarm id.
    pub async fn resolve(&self, id: &str, actor_id: &str) -> Result<Alarm, StellarError> {
        let mut alarm = self.store.get_alarm(id).await?;
        if alarm.status == AlarmStatus::Resolved {
            return Err(StellarError::invalid_status(format!("alarm {id} is already resolved")));
        }
        alarm.status = AlarmStatus::Resolved;
        alarm.resolved_at = Some(chrono::Utc::now());
        alarm.resolved_by = Some(actor_id.to_string());
        let saved = self.store.update_alarm(alarm).await?;
        self.bus.publish(
            "alarms:all",
            serde_json::json!({"event": "alarm_resolved", "alarm": saved}),
        );
        Ok(saved)
    }

    pub async fn list(&self) -> Result<Vec<Alarm>, StellarError> {
        self.store.list_alarms().await
    }

    pub async fn snapshot(&self) -> Result<(AlarmSummary, Vec<Alarm>), StellarError> {
        let alarms = self.store.list_alarms().await?;
        let summary = AlarmSummary::compute(alarms.iter());
        let active: Vec<Alarm> = alarms
            .into_iter()
            .filter(|a| a.status == AlarmStatus::Active)
            .collect();
        Ok((summary, active))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::store::InMemoryStore;
    use std::sync::Arc;

    fn manager() -> AlarmManager {
        let store: SharedStore = Arc::new(InMemoryStore::new());
        AlarmManager::new(store, PubSubBus::new())
    }

    #[tokio::test]
    async fn acknowledge_requires_non_empty_actor_id() {
        let manager = manager();
        let alarm = manager
            .raise("test_alarm", AlarmSeverity::Warning, "x", "SAT-A", HashMap::new())
            .await;
        let err = manager.acknowledge(&alarm.id, "").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[tokio::test]
    async fn resolved_alarm_rejects_further_updates() {
        let manager = manager();
        let alarm = manager
            .raise("test_alarm", AlarmSeverity::Critical, "x", "SAT-A", HashMap::new())
            .await;
        manager.resolve(&alarm.id, "op-1").await.unwrap();

        let resolve_again = manager.resolve(&alarm.id, "op-1").await.unwrap_err();
        assert_eq!(resolve_again.kind, ErrorKind::InvalidStatus);

        let ack_after_resolve = manager.acknowledge(&alarm.id, "op-1").await.unwrap_err();
        assert_eq!(ack_after_resolve.kind, ErrorKind::InvalidStatus);
    }
}
