//! Circuit breaker.
//!
//! One breaker per external-call name, keyed in a `DashMap`, each guarding
//! its own sliding failure window. `closed` runs calls normally; enough
//! classified failures within `window_ms` trips it to `open`, where calls
//! are short-circuited until `refresh_ms` elapses and it half-opens again.

use crate::config::{BreakerConfig, FallbackPolicy};
use crate::error::{ErrorKind, StellarError};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// How a caller's outcome should be interpreted by the breaker. This is
/// the outcome classification: `connection_refused`,
/// `timeout`, and `http_error_5xx` trip the breaker; an uncaught `exception`
/// always trips too; other error kinds pass through without affecting its
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Trips,
    Passthrough,
}

pub fn classify(kind: ErrorKind) -> Outcome {
    match kind {
        ErrorKind::Timeout | ErrorKind::Transient | ErrorKind::Exception => Outcome::Trips,
        _ => Outcome::Passthrough,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
}

struct BreakerState {
    state: State,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
}

struct Breaker {
    config: BreakerConfig,
    state: Mutex<BreakerState>,
}

/// Registry of named breakers, one entry per `call(name, ..)` target.
#[derive(Clone)]
pub struct CircuitBreakerRegistry {
    breakers: Arc<DashMap<String, Arc<Breaker>>>,
    default_config: BreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(configs: std::collections::HashMap<String, BreakerConfig>) -> Self {
        let breakers = Arc::new(DashMap::new());
        for (name, config) in configs {
            breakers.insert(
                name,
                Arc::new(Breaker {
                    config,
                    state: Mutex::new(BreakerState {
                        state: State::Closed,
                        failures: VecDeque::new(),
                        opened_at: None,
                    }),
                }),
            );
        }
        Self {
            breakers,
            default_config: BreakerConfig::default(),
        }
    }

    fn breaker_for(&self, name: &str) -> Arc<Breaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(Breaker {
                    config: self.default_config.clone(),
                    state: Mutex::new(BreakerState {
                        state: State::Closed,
                        failures: VecDeque::new(),
                        opened_at: None,
                    }),
                })
            })
            .clone()
    }

    /// Whether the breaker is currently allowing calls through. Refreshes
    /// `open -> closed` if `refresh_ms` has elapsed (the "half-open" step:
    /// the next call is let through and its outcome decides the state).
    fn try_enter(&self, breaker: &Breaker) -> bool {
        let mut state = breaker.state.lock();
        if state.state == State::Open {
            if let Some(opened_at) = state.opened_at {
                if opened_at.elapsed() >= Duration::from_millis(breaker.config.refresh_ms) {
                    state.state = State::Closed;
                    state.failures.clear();
                    state.opened_at = None;
                    tracing::info!("circuit breaker auto-refreshed to closed");
                    return true;
                }
            }
            return false;
        }
        true
    }

    fn record(&self, breaker: &Breaker, outcome: Outcome) {
        if outcome != Outcome::Trips {
            return;
        }
        let mut state = breaker.state.lock();
        let now = Instant::now();
        let window = Duration::from_millis(breaker.config.window_ms);
        state.failures.push_back(now);
        while let Some(front) = state.failures.front() {
            if now.duration_since(*front) > window {
                state.failures.pop_front();
            } else {
                break;
            }
        }
        if state.failures.len() as u32 >= breaker.config.window_failures && state.state == State::Closed {
            state.state = State::Open;
            state.opened_at = Some(now);
            tracing::warn!("circuit breaker tripped open");
        }
    }

    /// Run `f`, classifying its `Result`. If the breaker
    /// is open, `f` never runs and the configured fallback policy decides
    /// the returned error/value.
    pub async fn call<T, F, Fut>(&self, name: &str, f: F) -> Result<T, StellarError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, StellarError>>,
    {
        let breaker = self.breaker_for(name);
        if !self.try_enter(&breaker) {
            tracing::debug!(breaker = name, "call blocked by open circuit breaker");
            return match breaker.config.fallback {
                FallbackPolicy::Skip => Err(StellarError::new(ErrorKind::CircuitOpen, "skipped")),
                FallbackPolicy::Error | FallbackPolicy::CachedOrError => {
                    Err(StellarError::new(ErrorKind::CircuitOpen, format!("breaker {name} is open")))
                }
            };
        }

        match f().await {
            Ok(value) => {
                self.record(&breaker, Outcome::Success);
                Ok(value)
            }
            Err(e) => {
                self.record(&breaker, classify(e.kind));
                Err(e)
            }
        }
    }

    pub fn status(&self, name: &str) -> &'static str {
        let breaker = self.breaker_for(name);
        let state = breaker.state.lock();
        match state.state {
            State::Closed => "closed",
            State::Open => "open",
        }
    }

    pub fn reset(&self, name: &str) {
        let breaker = self.breaker_for(name);
        let mut state = breaker.state.lock();
        state.state = State::Closed;
        state.failures.clear();
        state.opened_at = None;
    }

    /// Force the breaker open regardless of the failure window — the
    /// operator-facing `melt(name)` escape hatch.
    pub fn melt(&self, name: &str) {
        let breaker = self.breaker_for(name);
        let mut state = breaker.state.lock();
        state.state = State::Open;
        state.opened_at = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn registry() -> CircuitBreakerRegistry {
        let mut configs = HashMap::new();
        configs.insert(
            "orbital_service".to_string(),
            BreakerConfig {
                window_failures: 5,
                window_ms: 10_000,
                refresh_ms: 30_000,
                fallback: FallbackPolicy::Error,
            },
        );
        CircuitBreakerRegistry::new(configs)
    }

    #[tokio::test]
    async fn trips_after_threshold_and_blocks_calls() {
        let reg = registry();
        for _ in 0..5 {
            let _ = reg
                .call("orbital_service", || async {
                    Err::<(), _>(StellarError::timeout("timed out"))
                })
                .await;
        }
        assert_eq!(reg.status("orbital_service"), "open");

        let mut ran = false;
        let result = reg
            .call("orbital_service", || {
                ran = true;
                async { Ok::<_, StellarError>(()) }
            })
            .await;
        assert!(!ran);
        assert_eq!(result.unwrap_err().kind, ErrorKind::CircuitOpen);
    }

    #[tokio::test]
    async fn passthrough_errors_do_not_trip() {
        let reg = registry();
        for _ in 0..10 {
            let _ = reg
                .call("orbital_service", || async {
                    Err::<(), _>(StellarError::validation("bad input"))
                })
                .await;
        }
        assert_eq!(reg.status("orbital_service"), "closed");
    }
}
