use serde::{Deserialize, Serialize};

/// Operational mode, driven by the `energy_to_mode()` rules in `actor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Nominal,
    Safe,
    Survival,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Mode::Nominal => "nominal",
            Mode::Safe => "safe",
            Mode::Survival => "survival",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// The durable record an operator creates for a satellite. This is the
/// row the store adapter owns; [`crate::actor::SatelliteActor`] owns the
/// volatile runtime copy that is seeded from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SatelliteRecord {
    pub id: String,
    pub name: String,
    pub mode: Mode,
    pub energy: f64,
    pub memory_used: f64,
    pub position: Position,
    pub norad_id: Option<u32>,
    pub tle_line1: Option<String>,
    pub tle_line2: Option<String>,
    pub tle_epoch: Option<chrono::DateTime<chrono::Utc>>,
}

impl SatelliteRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            mode: Mode::Nominal,
            energy: 100.0,
            memory_used: 0.0,
            position: Position::default(),
            norad_id: None,
            tle_line1: None,
            tle_line2: None,
            tle_epoch: None,
        }
    }
}
