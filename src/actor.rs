//! Per-satellite actor.
//!
//! One actor owns exactly one satellite's volatile runtime state. Mutation
//! requests arrive over an mpsc mailbox and are processed strictly one at a
//! time by the actor's own task, so no two mutations for the same
//! satellite ever run concurrently — one task per satellite, each with its
//! own mailbox.

use crate::error::StellarError;
use crate::models::{Mode, Position, SatelliteRecord};
use tokio::sync::{mpsc, oneshot};

#[derive(Debug)]
enum ActorMessage {
    GetState(oneshot::Sender<SatelliteRecord>),
    UpdateEnergy(f64, oneshot::Sender<SatelliteRecord>),
    UpdateMemory(f64, oneshot::Sender<Result<SatelliteRecord, StellarError>>),
    UpdatePosition(Position, oneshot::Sender<Result<SatelliteRecord, StellarError>>),
    SetMode(Mode, oneshot::Sender<SatelliteRecord>),
}

fn clamp_energy(e: f64) -> f64 {
    e.clamp(0.0, 100.0)
}

/// Pure mode-transition rule (`energy_to_mode()`).
/// Kept free-standing (not a method) so it is trivially unit-testable and
/// so the executor's `system_diagnostic` handler can reuse it without a
/// running actor.
pub fn next_mode(energy: f64, current: Mode) -> Mode {
    if energy < 5.0 {
        Mode::Survival
    } else if energy < 20.0 {
        Mode::Safe
    } else if energy > 30.0 && matches!(current, Mode::Safe | Mode::Survival) {
        Mode::Nominal
    } else if energy > 10.0 && matches!(current, Mode::Survival) {
        Mode::Safe
    } else {
        current
    }
}

struct SatelliteActorLoop {
    state: SatelliteRecord,
    inbox: mpsc::Receiver<ActorMessage>,
}

impl SatelliteActorLoop {
    async fn run(mut self) {
        while let Some(msg) = self.inbox.recv().await {
            match msg {
                ActorMessage::GetState(reply) => {
                    let _ = reply.send(self.state.clone());
                }
                ActorMessage::UpdateEnergy(delta, reply) => {
                    self.state.energy = clamp_energy(self.state.energy + delta);
                    self.state.mode = next_mode(self.state.energy, self.state.mode);
                    let _ = reply.send(self.state.clone());
                }
                ActorMessage::UpdateMemory(value, reply) => {
                    let result = if value < 0.0 {
                        Err(StellarError::validation("memory_used must be >= 0"))
                    } else {
                        self.state.memory_used = value;
                        Ok(self.state.clone())
                    };
                    let _ = reply.send(result);
                }
                ActorMessage::UpdatePosition(pos, reply) => {
                    let result = if pos.x.is_finite() && pos.y.is_finite() && pos.z.is_finite() {
                        self.state.position = pos;
                        Ok(self.state.clone())
                    } else {
                        Err(StellarError::validation("position components must be finite"))
                    };
                    let _ = reply.send(result);
                }
                ActorMessage::SetMode(mode, reply) => {
                    self.state.mode = mode;
                    let _ = reply.send(self.state.clone());
                }
            }
        }
        tracing::debug!(satellite_id = %self.state.id, "satellite actor mailbox closed");
    }
}

/// Cheap-to-clone handle to a running actor. All methods round-trip through
/// the actor's own task via a oneshot reply channel, so callers observe a
/// consistent snapshot and never race the actor's internal mutation.
#[derive(Clone)]
pub struct ActorHandle {
    satellite_id: String,
    tx: mpsc::Sender<ActorMessage>,
}

impl ActorHandle {
    pub fn satellite_id(&self) -> &str {
        &self.satellite_id
    }

    /// Spawn a fresh actor task seeded with `initial` state. Restart resets
    /// to default/initial state rather than reloading from the durable
    /// store — this is what the registry calls both at first start and on
    /// crash-restart.
    pub fn spawn(initial: SatelliteRecord) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let satellite_id = initial.id.clone();
        let actor = SatelliteActorLoop { state: initial, inbox: rx };
        tokio::spawn(actor.run());
        Self { satellite_id, tx }
    }

    pub async fn get_state(&self) -> Result<SatelliteRecord, StellarError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ActorMessage::GetState(reply_tx))
            .await
            .map_err(|_| StellarError::not_found("satellite actor is not running"))?;
        reply_rx
            .await
            .map_err(|_| StellarError::not_found("satellite actor is not running"))
    }

    pub async fn update_energy(&self, delta: f64) -> Result<SatelliteRecord, StellarError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ActorMessage::UpdateEnergy(delta, reply_tx))
            .await
            .map_err(|_| StellarError::not_found("satellite actor is not running"))?;
        reply_rx
            .await
            .map_err(|_| StellarError::not_found("satellite actor is not running"))
    }

    pub async fn update_memory(&self, value: f64) -> Result<SatelliteRecord, StellarError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ActorMessage::UpdateMemory(value, reply_tx))
            .await
            .map_err(|_| StellarError::not_found("satellite actor is not running"))?;
        reply_rx
            .await
            .map_err(|_| StellarError::not_found("satellite actor is not running"))?
    }

    pub async fn update_position(&self, pos: Position) -> Result<SatelliteRecord, StellarError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ActorMessage::UpdatePosition(pos, reply_tx))
            .await
            .map_err(|_| StellarError::not_found("satellite actor is not running"))?;
        reply_rx
            .await
            .map_err(|_| StellarError::not_found("satellite actor is not running"))?
    }

    pub async fn set_mode(&self, mode: Mode) -> Result<SatelliteRecord, StellarError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ActorMessage::SetMode(mode, reply_tx))
            .await
            .map_err(|_| StellarError::not_found("satellite actor is not running"))?;
        reply_rx
            .await
            .map_err(|_| StellarError::not_found("satellite actor is not running"))
    }

    /// Whether the actor's mailbox is still open. Does not guarantee the
    /// task hasn't panicked mid-message, but a closed channel is the
    /// reliable half of that signal; the registry's supervisor is what
    /// actually detects the crash and restarts.
    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_energy_stays_in_bounds() {
        assert_eq!(clamp_energy(150.0), 100.0);
        assert_eq!(clamp_energy(-50.0), 0.0);
        assert_eq!(clamp_energy(42.0), 42.0);
    }

    #[test]
    fn mode_transitions_follow_energy_rules() {
        assert_eq!(next_mode(3.0, Mode::Nominal), Mode::Survival);
        assert_eq!(next_mode(15.0, Mode::Nominal), Mode::Safe);
        assert_eq!(next_mode(50.0, Mode::Safe), Mode::Nominal);
        assert_eq!(next_mode(12.0, Mode::Survival), Mode::Safe);
        assert_eq!(next_mode(25.0, Mode::Safe), Mode::Safe);
    }

    #[tokio::test]
    async fn actor_serializes_mutations_and_clamps_energy() {
        let handle = ActorHandle::spawn(SatelliteRecord::new("SAT-TEST", "Test"));
        let state = handle.update_energy(-200.0).await.unwrap();
        assert_eq!(state.energy, 0.0);
        assert_eq!(state.mode, Mode::Survival);

        let state = handle.update_energy(200.0).await.unwrap();
        assert_eq!(state.energy, 100.0);
        assert_eq!(state.mode, Mode::Nominal);
    }

    #[tokio::test]
    async fn update_memory_rejects_negative() {
        let handle = ActorHandle::spawn(SatelliteRecord::new("SAT-TEST", "Test"));
        let err = handle.update_memory(-1.0).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Validation);
    }
}
