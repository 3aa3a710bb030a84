//! Standalone TLE refresh binary.
//!
//! Runs the TLE refresh service against a store seeded with whatever
//! satellites are passed on stdin as a newline-delimited 2-line TLE stream,
//! independent of the main server process — this repository's TLE refresh
//! service is callable either embedded (via [`stellarops::App`]) or as its
//! own small process, per the "runnable in its own process later" framing
//! in this repository's component design.

use std::io::Read;
use std::sync::Arc;
use stellarops::breaker::CircuitBreakerRegistry;
use stellarops::bus::PubSubBus;
use stellarops::config::StellarConfig;
use stellarops::models::satellite::SatelliteRecord;
use stellarops::store::InMemoryStore;
use stellarops::tle::{StaticTleSource, TleRefreshService};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stellarops=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = StellarConfig::from_env();

    let mut text = String::new();
    std::io::stdin().read_to_string(&mut text)?;

    let store: stellarops::store::SharedStore = Arc::new(InMemoryStore::new());
    for (norad_id, name) in [(25544u32, "ISS"), (43013, "NOAA-20"), (48274, "SWOT")] {
        let mut record = SatelliteRecord::new(format!("NORAD-{norad_id}"), name);
        record.norad_id = Some(norad_id);
        store.create_satellite(record).await?;
    }

    let bus = PubSubBus::new();
    let breakers = CircuitBreakerRegistry::new(config.breakers.clone());
    let source = Arc::new(StaticTleSource { text });
    let service = Arc::new(TleRefreshService::new(source, store, bus, breakers));

    service.refresh_once().await;
    tracing::info!("TLE refresh cycle complete");

    Ok(())
}
