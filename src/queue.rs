//! Command queue — the hard part.
//!
//! Holds the in-memory `satellite_id -> queue` lists and the in-flight
//! map behind a single `tokio::sync::Mutex`: the queue exclusively owns
//! both, so every mutation (user call or dispatcher tick) takes the same
//! lock, and there is one writer at a time with no separate synchronization
//! story to get wrong. Every mutation is followed by a durable-store write
//! before the lock is released, so what's observable in memory and what's
//! in the store never diverge for longer than one critical section.

use crate::bus::PubSubBus;
use crate::config::StellarConfig;
use crate::error::{ErrorKind, StellarError};
use crate::models::command::{queue_sort_key, EnqueueOptions};
use crate::models::{Command, CommandStatus};
use crate::store::SharedStore;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// `backoff(n) = min(2^n * 30s, 3600s)`.
pub fn backoff(attempt: u32) -> chrono::Duration {
    let seconds = (2u64.saturating_pow(attempt)).saturating_mul(30).min(3600);
    chrono::Duration::seconds(seconds as i64)
}

struct QueueState {
    queues: HashMap<String, Vec<Command>>,
    in_flight: HashMap<String, Command>,
    busy: HashMap<String, String>,
}

impl QueueState {
    fn queue_for(&mut self, satellite_id: &str) -> &mut Vec<Command> {
        self.queues.entry(satellite_id.to_string()).or_default()
    }

    fn sort_queue(&mut self, satellite_id: &str) {
        if let Some(q) = self.queues.get_mut(satellite_id) {
            q.sort_by_key(queue_sort_key);
        }
    }

    /// Find a command wherever it currently lives in memory.
    fn find(&self, id: &str) -> Option<Command> {
        if let Some(c) = self.in_flight.get(id) {
            return Some(c.clone());
        }
        self.queues
            .values()
            .flat_map(|q| q.iter())
            .find(|c| c.id == id)
            .cloned()
    }

    fn remove_from_queue(&mut self, satellite_id: &str, id: &str) -> Option<Command> {
        let q = self.queues.get_mut(satellite_id)?;
        let idx = q.iter().position(|c| c.id == id)?;
        Some(q.remove(idx))
    }
}

pub struct CommandQueue {
    store: SharedStore,
    bus: PubSubBus,
    config: Arc<StellarConfig>,
    state: Mutex<QueueState>,
}

impl CommandQueue {
    pub fn new(store: SharedStore, bus: PubSubBus, config: Arc<StellarConfig>) -> Self {
        Self {
            store,
            bus,
            config,
            state: Mutex::new(QueueState {
                queues: HashMap::new(),
                in_flight: HashMap::new(),
                busy: HashMap::new(),
            }),
        }
    }

    fn publish_update(&self, command: &Command) {
        let payload = serde_json::to_value(command).unwrap_or(Value::Null);
        self.bus.publish(
            "commands:updates",
            serde_json::json!({"event": "command_update", "command": payload}),
        );
        self.bus.publish(
            &format!("satellite:{}", command.satellite_id),
            serde_json::json!({"event": "command_update", "command": payload}),
        );
    }

    /// Load non-terminal commands from the durable store at boot: `queued`
    /// goes back into the in-memory queue, `{pending, acknowledged,
    /// executing}` resume as in-flight with their original `sent_at`, so
    /// they time out naturally if nothing ever reports completion.
    pub async fn reconcile_on_startup(&self) -> Result<(), StellarError> {
        let commands = self.store.list_non_terminal_commands().await?;
        let mut state = self.state.lock().await;
        for command in commands {
            match command.status {
                CommandStatus::Queued => {
                    state.queue_for(&command.satellite_id).push(command);
                }
                CommandStatus::Pending | CommandStatus::Acknowledged | CommandStatus::Executing => {
                    state.busy.insert(command.satellite_id.clone(), command.id.clone());
                    state.in_flight.insert(command.id.clone(), command);
                }
                CommandStatus::Completed | CommandStatus::Failed | CommandStatus::Cancelled => {}
            }
        }
        for sat_id in state.queues.keys().cloned().collect::<Vec<_>>() {
            state.sort_queue(&sat_id);
        }
        Ok(())
    }

    pub async fn enqueue(
        &self,
        satellite_id: &str,
        command_type: &str,
        payload: HashMap<String, Value>,
        opts: EnqueueOptions,
    ) -> Result<Command, StellarError> {
        let now = Utc::now();
        let command = Command::new(
            Uuid::new_v4().to_string(),
            satellite_id.to_string(),
            command_type.to_string(),
            payload,
            opts,
            self.config.default_timeout_ms,
            now,
        );
        let command = self.store.insert_command(command).await?;

        let mut state = self.state.lock().await;
        state.queue_for(satellite_id).push(command.clone());
        state.sort_queue(satellite_id);
        drop(state);

        self.publish_update(&command);
        Ok(command)
    }

    /// Cancels a queued or pending command; in-flight commands already
    /// acknowledged or executing reject with `invalid_status`.
    pub async fn cancel(&self, command_id: &str) -> Result<Command, StellarError> {
        let mut state = self.state.lock().await;
        let current = state
            .find(command_id)
            .ok_or_else(|| StellarError::not_found(format!("command {command_id}")))?;

        match current.status {
            CommandStatus::Queued => {
                let mut command = state
                    .remove_from_queue(&current.satellite_id, command_id)
                    .ok_or_else(|| StellarError::not_found(format!("command {command_id}")))?;
                command.transition(CommandStatus::Cancelled)?;
                drop(state);
                let saved = self.store.replace_command(command).await?;
                self.publish_update(&saved);
                Ok(saved)
            }
            CommandStatus::Pending => {
                let mut command = state
                    .in_flight
                    .remove(command_id)
                    .ok_or_else(|| StellarError::not_found(format!("command {command_id}")))?;
                state.busy.remove(&command.satellite_id);
                command.transition(CommandStatus::Cancelled)?;
                drop(state);
                let saved = self.store.replace_command(command).await?;
                self.publish_update(&saved);
                Ok(saved)
            }
            CommandStatus::Acknowledged | CommandStatus::Executing => Err(StellarError::new(
                ErrorKind::InvalidStatus,
                format!("command {command_id} is {}", current.status),
            )),
            CommandStatus::Completed | CommandStatus::Failed | CommandStatus::Cancelled => {
                Err(StellarError::not_found(format!("command {command_id}")))
            }
        }
    }

    /// Missing id is a silent no-op — the command may already have timed
    /// out and been reassigned.
    pub async fn acknowledge(&self, command_id: &str) -> Result<(), StellarError> {
        self.apply_in_flight_transition(command_id, CommandStatus::Acknowledged).await
    }

    pub async fn start_execution(&self, command_id: &str) -> Result<(), StellarError> {
        self.apply_in_flight_transition(command_id, CommandStatus::Executing).await
    }

    async fn apply_in_flight_transition(
        &self,
        command_id: &str,
        next: CommandStatus,
    ) -> Result<(), StellarError> {
        let mut state = self.state.lock().await;
        let Some(command) = state.in_flight.get_mut(command_id) else {
            return Ok(());
        };
        if command.transition(next).is_err() {
            return Ok(());
        }
        let snapshot = command.clone();
        drop(state);
        let saved = self
            .store
            .update_command_status(&snapshot.id, next, None, None)
            .await?;
        self.publish_update(&saved);

        let mut state = self.state.lock().await;
        if let Some(command) = state.in_flight.get_mut(command_id) {
            *command = saved;
        }
        Ok(())
    }

    pub async fn complete(
        &self,
        command_id: &str,
        result: HashMap<String, Value>,
    ) -> Result<(), StellarError> {
        let mut state = self.state.lock().await;
        let Some(command) = state.in_flight.remove(command_id) else {
            return Ok(());
        };
        state.busy.remove(&command.satellite_id);
        drop(state);

        let saved = self
            .store
            .update_command_status(command_id, CommandStatus::Completed, Some(result), None)
            .await?;
        self.publish_update(&saved);
        Ok(())
    }

    /// Requeue-with-backoff up to `max_retries`, then permanent `failed`.
    pub async fn fail(&self, command_id: &str, error: impl Into<String>) -> Result<(), StellarError> {
        let error = error.into();
        let mut state = self.state.lock().await;
        let Some(mut command) = state.in_flight.remove(command_id) else {
            return Ok(());
        };
        state.busy.remove(&command.satellite_id);

        if command.retry_count < self.config.max_retries {
            command.retry_count += 1;
            // Requeue bypasses `transition`/`validate_transition`: the FSM
            // draws no arrow from {pending, acknowledged, executing} back to
            // `queued` (that arrow only exists for a fresh command), so this
            // sets the field directly, the same way `dispatch_ready_commands`
            // sets `status = Pending` directly rather than through `transition`.
            command.status = CommandStatus::Queued;
            command.sent_at = None;
            command.started_at = None;
            command.scheduled_at = Some(Utc::now() + backoff(command.retry_count));
            command.error = Some(error);
            let satellite_id = command.satellite_id.clone();
            state.queue_for(&satellite_id).push(command.clone());
            state.sort_queue(&satellite_id);
            drop(state);

            let saved = self.store.replace_command(command).await?;
            self.publish_update(&saved);
        } else {
            command.transition(CommandStatus::Failed)?;
            command.error = Some(error.clone());
            drop(state);
            let saved = self
                .store
                .update_command_status(command_id, CommandStatus::Failed, None, Some(error))
                .await?;
            self.publish_update(&saved);
        }
        Ok(())
    }

    /// One dispatch step: promote a ready head-of-queue command per
    /// satellite that isn't already busy, then sweep in-flight commands
    /// for expired timeouts. Called on the periodic tick and by any manual
    /// kick.
    pub async fn dispatch_tick(&self) {
        self.dispatch_ready_commands().await;
        self.sweep_timeouts().await;
    }

    async fn dispatch_ready_commands(&self) {
        let now = Utc::now();
        let mut to_dispatch = Vec::new();
        {
            let mut state = self.state.lock().await;
            let satellite_ids: Vec<String> = state.queues.keys().cloned().collect();
            for satellite_id in satellite_ids {
                if state.busy.contains_key(&satellite_id) {
                    continue;
                }
                let ready = state
                    .queues
                    .get(&satellite_id)
                    .and_then(|q| q.first())
                    .map(|c| c.is_ready(now))
                    .unwrap_or(false);
                if !ready {
                    continue;
                }
                let Some(mut command) = state
                    .queues
                    .get_mut(&satellite_id)
                    .filter(|q| !q.is_empty())
                    .map(|q| q.remove(0))
                else {
                    continue;
                };
                command.status = CommandStatus::Pending;
                command.sent_at = Some(now);
                state.busy.insert(satellite_id.clone(), command.id.clone());
                state.in_flight.insert(command.id.clone(), command.clone());
                to_dispatch.push(command);
            }
        }

        for command in to_dispatch {
            let saved = match self
                .store
                .update_command_status(&command.id, CommandStatus::Pending, None, None)
                .await
            {
                Ok(c) => c,
                Err(e) => {
                    tracing::error!(command_id = %command.id, error = %e, "failed to persist dispatch");
                    command
                }
            };
            let payload = serde_json::to_value(&saved).unwrap_or(Value::Null);
            self.bus
                .publish(&format!("satellite:{}:commands", saved.satellite_id), payload.clone());
            // Internal fan-in topic the executor consumes regardless of which
            // satellite a dispatch belongs to (no wildcard subscriptions on
            // the bus, so dispatch needs its own dedicated topic).
            self.bus.publish("dispatcher:events", payload);
            self.publish_update(&saved);
        }
    }

    async fn sweep_timeouts(&self) {
        let now = Utc::now();
        let expired: Vec<String> = {
            let state = self.state.lock().await;
            state
                .in_flight
                .values()
                .filter(|c| {
                    c.sent_at
                        .map(|sent| (now - sent).num_milliseconds() as u64 > c.timeout_ms)
                        .unwrap_or(false)
                })
                .map(|c| c.id.clone())
                .collect()
        };
        for id in expired {
            if let Err(e) = self.fail(&id, "timeout").await {
                tracing::error!(command_id = %id, error = %e, "failed to record command timeout");
            }
        }
    }

    pub async fn history(&self, satellite_id: &str, limit: usize) -> Result<Vec<Command>, StellarError> {
        self.store.command_history(satellite_id, limit).await
    }

    pub async fn get(&self, command_id: &str) -> Result<Command, StellarError> {
        let state = self.state.lock().await;
        if let Some(cmd) = state.find(command_id) {
            return Ok(cmd);
        }
        drop(state);
        self.store.get_command(command_id).await
    }

    /// Count of non-terminal in-flight commands for a satellite — used by
    /// tests asserting the at-most-one invariant.
    pub async fn in_flight_count(&self, satellite_id: &str) -> usize {
        let state = self.state.lock().await;
        if state.busy.contains_key(satellite_id) {
            1
        } else {
            0
        }
    }
}

/// Spawns the periodic dispatcher tick loop.
pub fn spawn_dispatcher(queue: Arc<CommandQueue>, tick_interval_ms: u64) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_millis(tick_interval_ms));
        loop {
            interval.tick().await;
            queue.dispatch_tick().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn queue() -> Arc<CommandQueue> {
        Arc::new(CommandQueue::new(
            Arc::new(InMemoryStore::new()),
            PubSubBus::new(),
            Arc::new(StellarConfig::default()),
        ))
    }

    #[test]
    fn backoff_matches_spec_table() {
        assert_eq!(backoff(1).num_seconds(), 60);
        assert_eq!(backoff(2).num_seconds(), 120);
        assert_eq!(backoff(10).num_seconds(), 3600);
    }

    #[tokio::test]
    async fn one_at_a_time_per_satellite() {
        let q = queue();
        for i in 0..5 {
            q.enqueue(
                "SAT-B",
                "noop",
                HashMap::new(),
                EnqueueOptions {
                    priority: crate::models::command::Priority(i),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        }
        q.dispatch_tick().await;
        assert_eq!(q.in_flight_count("SAT-B").await, 1);
        q.dispatch_tick().await;
        assert_eq!(q.in_flight_count("SAT-B").await, 1, "busy satellite stays at one in-flight");
    }

    #[tokio::test]
    async fn priority_then_insertion_order() {
        let q = queue();
        let low = q
            .enqueue(
                "SAT-A",
                "noop",
                HashMap::new(),
                EnqueueOptions { priority: crate::models::command::Priority::LOW, ..Default::default() },
            )
            .await
            .unwrap();
        let critical = q
            .enqueue(
                "SAT-A",
                "noop",
                HashMap::new(),
                EnqueueOptions { priority: crate::models::command::Priority::CRITICAL, ..Default::default() },
            )
            .await
            .unwrap();

        q.dispatch_tick().await;
        let in_flight_id = {
            let state = q.state.lock().await;
            state.busy.get("SAT-A").cloned().unwrap()
        };
        assert_eq!(in_flight_id, critical.id);
        assert_ne!(in_flight_id, low.id);
    }

    #[tokio::test]
    async fn cancel_queued_command() {
        let q = queue();
        let cmd = q
            .enqueue("SAT-A", "noop", HashMap::new(), EnqueueOptions::default())
            .await
            .unwrap();
        let cancelled = q.cancel(&cmd.id).await.unwrap();
        assert_eq!(cancelled.status, CommandStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_executing_is_invalid_status() {
        let q = queue();
        let cmd = q
            .enqueue("SAT-A", "noop", HashMap::new(), EnqueueOptions::default())
            .await
            .unwrap();
        q.dispatch_tick().await;
        q.acknowledge(&cmd.id).await.unwrap();
        q.start_execution(&cmd.id).await.unwrap();
        let err = q.cancel(&cmd.id).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidStatus);
    }

    #[tokio::test]
    async fn fail_retries_then_terminally_fails() {
        let q = queue();
        let cmd = q
            .enqueue("SAT-A", "noop", HashMap::new(), EnqueueOptions::default())
            .await
            .unwrap();
        for _ in 0..3 {
            q.dispatch_tick().await;
            // Force scheduled_at into the past so the retry is immediately ready.
            {
                let mut state = q.state.lock().await;
                if let Some(queued) = state.queues.get_mut("SAT-A").and_then(|v| v.first_mut()) {
                    queued.scheduled_at = None;
                }
            }
            q.fail(&cmd.id, "boom").await.unwrap();
        }
        q.dispatch_tick().await;
        q.fail(&cmd.id, "boom").await.unwrap();

        let final_state = q.get(&cmd.id).await.unwrap();
        assert_eq!(final_state.status, CommandStatus::Failed);
        assert_eq!(final_state.retry_count, 3);
    }
}
