//! StellarOps server binary.
//!
//! Boots every subsystem via [`stellarops::App`], starts background tasks
//! (dispatcher tick, executor, health checks, aggregator persistence,
//! telemetry retention sweep, TLE refresh), seeds a handful of demo
//! satellites if the store is empty, and serves the WebSocket channel
//! layer. The HTTP REST surface itself is out of this repository's scope;
//! what's here is the process entrypoint and liveness probe.

use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use serde_json::{json, Value};
use stellarops::app::App;
use stellarops::config::StellarConfig;
use stellarops::models::satellite::SatelliteRecord;
use std::net::SocketAddr;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser, Debug)]
#[command(name = "stellarops-server")]
#[command(about = "Satellite constellation operations backend")]
struct Args {
    #[arg(long, env = "STELLAROPS_PORT", default_value_t = 4000)]
    port: u16,

    #[arg(long, env = "STELLAROPS_HOST", default_value = "0.0.0.0")]
    host: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stellarops=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = StellarConfig::from_env();
    info!(
        tick_interval_ms = config.tick_interval_ms,
        heartbeat_timeout_ms = config.heartbeat_timeout_ms,
        "configuration loaded"
    );

    let app = App::bootstrap(config);
    seed_demo_satellites(&app).await;
    app.start_known_satellites().await;
    let _background = app.spawn_background_tasks().await;

    let router = Router::new()
        .route("/healthz", get(healthz))
        .route("/ws", get(stellarops::ws::upgrade))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(app.channel_state());

    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    info!(%addr, "starting StellarOps server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

async fn healthz() -> Json<Value> {
    Json(json!({"status": "ok", "timestamp": chrono::Utc::now().to_rfc3339()}))
}

/// Seeds three demo satellites on an empty store so a fresh boot has
/// something to actor-start and dispatch commands against.
async fn seed_demo_satellites(app: &App) {
    let existing = app.store.list_satellites().await.unwrap_or_default();
    if !existing.is_empty() {
        return;
    }
    let seeds = [
        ("SAT-ALPHA", "Alpha", 25544u32),
        ("SAT-BRAVO", "Bravo", 43013u32),
        ("SAT-CHARLIE", "Charlie", 48274u32),
    ];
    for (id, name, norad_id) in seeds {
        let mut record = SatelliteRecord::new(id, name);
        record.norad_id = Some(norad_id);
        if let Err(e) = app.store.create_satellite(record).await {
            tracing::warn!(satellite_id = id, error = %e, "failed to seed demo satellite");
        }
    }
}
