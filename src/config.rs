//! `StellarConfig` — the runtime configuration surface.
//!
//! Every named constant lives here instead of as a scattered magic number.
//! Defaults match the documented operational values.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub window_failures: u32,
    pub window_ms: u64,
    pub refresh_ms: u64,
    pub fallback: FallbackPolicy,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window_failures: 5,
            window_ms: 10_000,
            refresh_ms: 30_000,
            fallback: FallbackPolicy::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    Error,
    Skip,
    CachedOrError,
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        FallbackPolicy::Error
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryThresholds {
    pub energy_low: f64,
    pub energy_critical: f64,
    pub memory_high: f64,
    pub memory_critical: f64,
    pub temperature_high: f64,
    pub temperature_critical: f64,
    pub temperature_low: f64,
}

impl Default for TelemetryThresholds {
    fn default() -> Self {
        Self {
            energy_low: 15.0,
            energy_critical: 5.0,
            memory_high: 90.0,
            memory_critical: 95.0,
            temperature_high: 60.0,
            temperature_critical: 80.0,
            temperature_low: -40.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GroundStationSeed {
    pub id: String,
    pub name: String,
}

fn default_ground_stations() -> Vec<GroundStationSeed> {
    vec![
        GroundStationSeed {
            id: "gs-svalbard".into(),
            name: "Svalbard".into(),
        },
        GroundStationSeed {
            id: "gs-fairbanks".into(),
            name: "Fairbanks".into(),
        },
        GroundStationSeed {
            id: "gs-hawaii".into(),
            name: "Hawaii".into(),
        },
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StellarConfig {
    pub default_timeout_ms: u64,
    pub max_retries: u32,
    pub tick_interval_ms: u64,
    pub retention_days: i64,
    pub heartbeat_timeout_ms: u64,
    pub health_check_interval_ms: u64,
    pub aggregator_persist_interval_ms: u64,
    pub aggregator_cleanup_interval_ms: u64,
    pub telemetry_retention_interval_ms: u64,
    pub base_transmission_delay_ms: u64,
    pub transmission_jitter_ms: u64,
    pub telemetry_thresholds: TelemetryThresholds,
    pub breakers: HashMap<String, BreakerConfig>,
    pub ground_stations: Vec<GroundStationSeed>,
    pub orbital_service_url: Option<String>,
    pub database_url: Option<String>,
    pub auth_token: Option<String>,
    pub allow_anonymous_ws: bool,
}

impl Default for StellarConfig {
    fn default() -> Self {
        let mut breakers = HashMap::new();
        breakers.insert(
            "orbital_service".to_string(),
            BreakerConfig {
                window_failures: 5,
                window_ms: 10_000,
                refresh_ms: 30_000,
                fallback: FallbackPolicy::Error,
            },
        );
        Self {
            default_timeout_ms: 60_000,
            max_retries: 3,
            tick_interval_ms: 5_000,
            retention_days: 90,
            heartbeat_timeout_ms: 120_000,
            health_check_interval_ms: 30_000,
            aggregator_persist_interval_ms: 60_000,
            aggregator_cleanup_interval_ms: 300_000,
            telemetry_retention_interval_ms: 86_400_000,
            base_transmission_delay_ms: 500,
            transmission_jitter_ms: 500,
            telemetry_thresholds: TelemetryThresholds::default(),
            breakers,
            ground_stations: default_ground_stations(),
            orbital_service_url: None,
            database_url: None,
            auth_token: None,
            allow_anonymous_ws: false,
        }
    }
}

impl StellarConfig {
    /// Overlay environment variables onto the defaults using
    /// `STELLAROPS_*`-prefixed plain `std::env::var` lookups. Semantics
    /// never change based on presence of an override; only the
    /// numeric/string value does.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("STELLAROPS_DEFAULT_TIMEOUT_MS") {
            if let Ok(n) = v.parse() {
                cfg.default_timeout_ms = n;
            }
        }
        if let Ok(v) = std::env::var("STELLAROPS_MAX_RETRIES") {
            if let Ok(n) = v.parse() {
                cfg.max_retries = n;
            }
        }
        if let Ok(v) = std::env::var("STELLAROPS_TICK_INTERVAL_MS") {
            if let Ok(n) = v.parse() {
                cfg.tick_interval_ms = n;
            }
        }
        if let Ok(v) = std::env::var("STELLAROPS_RETENTION_DAYS") {
            if let Ok(n) = v.parse() {
                cfg.retention_days = n;
            }
        }
        if let Ok(v) = std::env::var("STELLAROPS_HEARTBEAT_TIMEOUT_MS") {
            if let Ok(n) = v.parse() {
                cfg.heartbeat_timeout_ms = n;
            }
        }
        if let Ok(v) = std::env::var("ORBITAL_SERVICE_URL") {
            cfg.orbital_service_url = Some(v);
        }
        if let Ok(v) = std::env::var("DATABASE_URL") {
            cfg.database_url = Some(v);
        }
        if let Ok(v) = std::env::var("STELLAROPS_AUTH_TOKEN") {
            cfg.auth_token = Some(v);
        }
        if let Ok(v) = std::env::var("STELLAROPS_ALLOW_ANONYMOUS_WS") {
            cfg.allow_anonymous_ws = matches!(v.as_str(), "1" | "true" | "yes");
        }

        cfg
    }
}
