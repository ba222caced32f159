mod domain;
mod error;
mod config;
mod timeutil;
mod statebus;
mod persistence;
mod sensors;
mod hardware;
mod devices;
mod control;
mod alarms;
mod engine;
mod api;

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::api::ControlCore;
use crate::config::ControlConfig;
use crate::control::pid::{PidBank, PidParameters};
use crate::devices::{DeviceState, RelayManager};
use crate::domain::{DeviceId, ZoneMode};
use crate::engine::{ControlEngine, RealClock, TickSource};
use crate::hardware::{DacBus, RelayBus, SimulatedBus};
use crate::persistence::sink::InMemorySink;
use crate::persistence::{PersistenceWriter, TimeseriesSink};
use crate::sensors::SensorCache;
use crate::statebus::{InMemoryStateBus, StateBus};

/// Controlled-environment agriculture automation control core.
#[derive(Debug, Parser)]
#[command(name = "cea-control-core", version, about)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "config.toml")]
    config: String,

    /// Force the in-memory simulated hardware/state-bus/sink backends
    /// regardless of `hardware.simulation` in the config file.
    #[arg(long)]
    simulate: bool,

    /// Tracing filter directive, e.g. "info" or "cea_control_core=debug".
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ControlConfig::load(&cli.config)?;
    tracing::info!(
        devices = config.devices.len(),
        zones = config.climate_phases.len(),
        "configuration loaded"
    );

    let simulate = cli.simulate || config.hardware.simulation;
    if !simulate {
        anyhow::bail!(
            "real I2C/Redis/Postgres backends are not wired up in this build; \
             pass --simulate or set hardware.simulation = true"
        );
    }

    let config = Arc::new(config);

    let sim_bus = Arc::new(SimulatedBus::new());
    let relay_bus: Arc<dyn RelayBus> = sim_bus.clone();
    let dac_bus: Arc<dyn DacBus> = sim_bus;
    let state_bus: Arc<dyn StateBus> = Arc::new(InMemoryStateBus::new());
    let sink: Arc<dyn TimeseriesSink> = Arc::new(InMemorySink::new(10_000));

    let relay = Arc::new(
        RelayManager::start(
            config.devices.clone(),
            relay_bus,
            dac_bus,
            BTreeMap::<DeviceId, DeviceState>::new(),
            true,
        )
        .await?,
    );

    let sensors = Arc::new(SensorCache::new(
        state_bus,
        sink.clone(),
        Duration::from_secs(config.control.update_interval_seconds.max(1) * 2),
        Duration::from_secs(config.control.last_good_hold_period_seconds),
        Duration::from_secs(config.control.max_db_lookback_seconds),
    ));

    let persistence = Arc::new(PersistenceWriter::spawn(sink, 10_000));

    let mut pid_bank = PidBank::new(Duration::from_secs(
        config.control.rate_limit.pid_params_per_device_type_seconds,
    ));
    let mut seeded_types = BTreeSet::new();
    for device in config.devices.values() {
        if device.pid_enabled && seeded_types.insert(device.kind.type_label()) {
            pid_bank.seed_params(device.kind.type_label(), PidParameters::default());
        }
    }

    let engine = Arc::new(ControlEngine::new(
        &config,
        relay.clone(),
        sensors,
        persistence,
        pid_bank,
    ));
    let core = Arc::new(ControlCore::new(config.clone(), relay.clone(), engine.clone()));
    let _ = core; // held for the process lifetime; the operator API has no transport wired up in this build

    let health_port = config.server.health_port;
    let health_config = config.clone();
    let health_relay = relay.clone();
    let health_engine = engine.clone();
    tokio::spawn(async move {
        if let Err(err) = serve_health(health_port, health_config, health_relay, health_engine).await {
            tracing::error!(error = %err, "health/metrics server exited");
        }
    });

    run_control_worker(config, engine).await;

    Ok(())
}

/// Drives `ControlEngine::tick` off `RealClock` until a `SIGINT`/ctrl-c is
/// observed (spec §5: a tick in flight runs to completion before the
/// process exits; no mid-tick cancellation).
async fn run_control_worker(config: Arc<ControlConfig>, engine: Arc<ControlEngine>) {
    let period = Duration::from_secs(config.control.update_interval_seconds.max(1));
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);

    let worker = tokio::spawn(async move {
        let mut clock = RealClock::new(period);
        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            tokio::select! {
                now = clock.tick() => {
                    engine.tick(now, chrono::Utc::now()).await;
                }
                _ = shutdown_rx.changed() => {
                    break;
                }
            }
        }
        tracing::info!("control worker stopped");
    });

    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("shutdown signal received, finishing in-flight tick"),
        Err(err) => tracing::error!(error = %err, "failed to listen for shutdown signal"),
    }
    let _ = shutdown_tx.send(true);
    let _ = worker.await;
    tracing::info!("shutdown complete");
}

#[derive(Clone)]
struct HealthState {
    config: Arc<ControlConfig>,
    relay: Arc<RelayManager>,
    engine: Arc<ControlEngine>,
}

/// Ambient observability surface only (spec §1 Non-goals: no CRUD API here —
/// the operator-facing calls in `api.rs` are an out-of-scope collaborator's
/// transport to wire up).
async fn serve_health(
    port: u16,
    config: Arc<ControlConfig>,
    relay: Arc<RelayManager>,
    engine: Arc<ControlEngine>,
) -> anyhow::Result<()> {
    let state = HealthState { config, relay, engine };

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "health/metrics server listening");
    axum_server::bind(addr).serve(app.into_make_service()).await?;
    Ok(())
}

async fn health_handler(State(state): State<HealthState>) -> Json<serde_json::Value> {
    let zones: BTreeSet<_> = state.config.devices.keys().map(|id| id.zone.clone()).collect();
    let mut failsafe_zones = Vec::new();
    for zone in &zones {
        if state.engine.zone_mode(zone).await == ZoneMode::Failsafe {
            failsafe_zones.push(zone.to_string());
        }
    }
    let status = if failsafe_zones.is_empty() { "ok" } else { "degraded" };
    Json(serde_json::json!({
        "status": status,
        "zones": zones.len(),
        "failsafe_zones": failsafe_zones,
    }))
}

async fn metrics_handler(State(state): State<HealthState>) -> String {
    let states = state.relay.all_states().await;
    let mut out = String::new();
    out.push_str("# HELP cea_device_state Current commanded state (0/1) per device.\n");
    out.push_str("# TYPE cea_device_state gauge\n");
    for (id, ds) in &states {
        out.push_str(&format!(
            "cea_device_state{{zone=\"{}\",device=\"{}\"}} {}\n",
            id.zone, id.name, ds.state
        ));
    }

    let zones: BTreeSet<_> = state.config.devices.keys().map(|id| id.zone.clone()).collect();
    out.push_str("# HELP cea_zone_failsafe Whether a zone is currently in failsafe (1) or not (0).\n");
    out.push_str("# TYPE cea_zone_failsafe gauge\n");
    for zone in &zones {
        let failsafe = state.engine.zone_mode(zone).await == ZoneMode::Failsafe;
        out.push_str(&format!("cea_zone_failsafe{{zone=\"{}\"}} {}\n", zone, failsafe as u8));
    }
    out
}
