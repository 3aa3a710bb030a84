//! Command executor.
//!
//! Consumes dispatch events off the bus and spawns one detached worker per
//! event — workers run in parallel across satellites, the same
//! fire-and-forget `tokio::spawn` shape used elsewhere in this codebase for
//! background jobs. Per-satellite serialization is not the executor's job;
//! it falls out of the command queue's at-most-one-in-flight invariant.

use crate::actor::next_mode;
use crate::bus::PubSubBus;
use crate::ground_station::GroundStationRegistry;
use crate::models::{Command, Mode};
use crate::queue::CommandQueue;
use crate::registry::SatelliteRegistry;
use rand::Rng;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
struct DelayProfile {
    base_ms: u64,
    jitter_ms: u64,
}

fn processing_delay(command_type: &str) -> DelayProfile {
    match command_type {
        "collect_telemetry" => DelayProfile { base_ms: 60_000, jitter_ms: 5_000 },
        "set_mode" => DelayProfile { base_ms: 1_000, jitter_ms: 2_000 },
        "system_diagnostic" => DelayProfile { base_ms: 30_000, jitter_ms: 5_000 },
        "update_energy" => DelayProfile { base_ms: 500, jitter_ms: 1_000 },
        "download_data" => DelayProfile { base_ms: 2_000, jitter_ms: 4_000 },
        "reboot" => DelayProfile { base_ms: 60_000, jitter_ms: 5_000 },
        _ => DelayProfile { base_ms: 1_000, jitter_ms: 2_000 },
    }
}

fn jittered_delay(profile: DelayProfile) -> Duration {
    let jitter = if profile.jitter_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=profile.jitter_ms)
    };
    Duration::from_millis(profile.base_ms + jitter)
}

pub struct CommandExecutor {
    queue: Arc<CommandQueue>,
    registry: Arc<SatelliteRegistry>,
    ground_stations: GroundStationRegistry,
    bus: PubSubBus,
    base_transmission_delay_ms: u64,
    transmission_jitter_ms: u64,
}

impl CommandExecutor {
    pub fn new(
        queue: Arc<CommandQueue>,
        registry: Arc<SatelliteRegistry>,
        ground_stations: GroundStationRegistry,
        bus: PubSubBus,
        base_transmission_delay_ms: u64,
        transmission_jitter_ms: u64,
    ) -> Self {
        Self {
            queue,
            registry,
            ground_stations,
            bus,
            base_transmission_delay_ms,
            transmission_jitter_ms,
        }
    }

    /// Subscribes to `dispatcher:events` and spawns a worker per dispatch.
    /// Runs until the bus topic closes (never, in practice), so this is
    /// meant to be `tokio::spawn`ed once at startup.
    pub async fn run(self: Arc<Self>) {
        let mut sub = self.bus.subscribe("dispatcher:events");
        while let Some(msg) = sub.recv().await {
            let Ok(command) = serde_json::from_value::<Command>(msg.payload) else {
                tracing::warn!("executor received an unparseable dispatch event");
                continue;
            };
            let this = self.clone();
            tokio::spawn(async move {
                this.execute(command).await;
            });
        }
    }

    async fn execute(&self, command: Command) {
        let station = match self.ground_stations.select() {
            Some(s) => s,
            None => {
                tracing::warn!(command_id = %command.id, "no ground station available");
                let _ = self.queue.fail(&command.id, "no_ground_station").await;
                return;
            }
        };

        if self.queue.acknowledge(&command.id).await.is_err() {
            self.ground_stations.release(&station.id);
            return;
        }

        tokio::time::sleep(jittered_delay(DelayProfile {
            base_ms: self.base_transmission_delay_ms,
            jitter_ms: self.transmission_jitter_ms,
        }))
        .await;

        if self.queue.start_execution(&command.id).await.is_err() {
            self.ground_stations.release(&station.id);
            return;
        }

        tokio::time::sleep(jittered_delay(processing_delay(&command.command_type))).await;

        let satellite_alive = self.registry.alive(&command.satellite_id);
        if !satellite_alive {
            self.ground_stations.release(&station.id);
            let _ = self.queue.fail(&command.id, "satellite_not_running").await;
            return;
        }

        let outcome = self.run_handler(&command).await;
        self.ground_stations.release(&station.id);

        match outcome {
            Ok(result) => {
                let _ = self.queue.complete(&command.id, result).await;
            }
            Err(reason) => {
                let _ = self.queue.fail(&command.id, reason).await;
            }
        }
    }

    async fn run_handler(&self, command: &Command) -> Result<HashMap<String, Value>, String> {
        let Ok(handle) = self.registry.lookup(&command.satellite_id) else {
            return Err("satellite_not_running".to_string());
        };

        match command.command_type.as_str() {
            "set_mode" => {
                let mode_str = command
                    .payload
                    .get("mode")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| "validation: missing mode".to_string())?;
                let mode = match mode_str {
                    "nominal" => Mode::Nominal,
                    "safe" => Mode::Safe,
                    "survival" => Mode::Survival,
                    other => return Err(format!("validation: unknown mode {other}")),
                };
                let state = handle.set_mode(mode).await.map_err(|e| e.message)?;
                Ok(to_result(json!({"mode": state.mode.to_string()})))
            }
            "collect_telemetry" => {
                let state = handle.get_state().await.map_err(|e| e.message)?;
                Ok(to_result(serde_json::to_value(&state).unwrap_or(Value::Null)))
            }
            "update_energy" => {
                let delta = command
                    .payload
                    .get("delta")
                    .and_then(|v| v.as_f64())
                    .ok_or_else(|| "validation: missing delta".to_string())?;
                let state = handle.update_energy(delta).await.map_err(|e| e.message)?;
                Ok(to_result(json!({"energy": state.energy, "mode": state.mode.to_string()})))
            }
            "system_diagnostic" => {
                let state = handle.get_state().await.map_err(|e| e.message)?;
                let predicted_mode = next_mode(state.energy, state.mode);
                Ok(to_result(json!({
                    "energy": state.energy,
                    "memory_used": state.memory_used,
                    "mode": state.mode.to_string(),
                    "mode_consistent": predicted_mode == state.mode,
                })))
            }
            "download_data" => {
                let size_bytes = command
                    .payload
                    .get("size_bytes")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                let simulated_ms = (size_bytes / 1_000_000).min(1_000);
                tokio::time::sleep(Duration::from_millis(simulated_ms)).await;
                Ok(to_result(json!({"bytes_downloaded": size_bytes})))
            }
            "reboot" => {
                self.registry.stop(&command.satellite_id);
                let name = handle.satellite_id().to_string();
                self.registry.start(crate::models::SatelliteRecord::new(&command.satellite_id, &name));
                Ok(to_result(json!({"rebooted": true})))
            }
            other => {
                tracing::debug!(command_type = other, "unknown command type, synthesizing success");
                Ok(to_result(json!({"note": "unknown command type handled generically"})))
            }
        }
    }
}

fn to_result(value: Value) -> HashMap<String, Value> {
    match value {
        Value::Object(map) => map.into_iter().collect(),
        other => {
            let mut m = HashMap::new();
            m.insert("data".to_string(), other);
            m
        }
    }
}
