mod feed;
#[cfg(feature = "gpio")]
mod relay;
#[cfg(all(feature = "sim", not(feature = "gpio")))]
mod sim;
mod workers;

#[cfg(not(any(feature = "sim", feature = "gpio")))]
compile_error!("enable a hardware backend: `sim` or `gpio`");

use anyhow::Result;
use std::{env, sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use hydro_dosing::{Actuate, ConfigStore, ControllerConfig, DosingEngine, SensorSource, TomlFileStore};

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

type Backends = (Arc<dyn Actuate>, Arc<dyn SensorSource>);

#[cfg(feature = "gpio")]
fn backends(config: &ControllerConfig) -> Result<Backends> {
    use anyhow::Context;

    // Many common relay boards are active-low. If yours is active-high, set false.
    let active_low = env::var("RELAY_ACTIVE_LOW")
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(true);

    let wiring: Vec<_> = config
        .pumps
        .wired()
        .filter_map(|(a, e)| e.physical.gpio_pin.map(|pin| (a, pin)))
        .collect();
    if wiring.len() < config.pumps.wired().count() {
        warn!("some wired pumps have no gpio_pin; they will report not-present");
    }
    let relays = relay::RelayBoard::new(&wiring, active_low)?;

    let feed_path = env::var("SENSOR_FEED_PATH")
        .context("SENSOR_FEED_PATH must point at the sensor feed file")?;
    info!(feed = %feed_path, relays = wiring.len(), active_low, "gpio backend");

    let pumps: Arc<dyn Actuate> = Arc::new(relays);
    let sensors: Arc<dyn SensorSource> = Arc::new(feed::FeedFile::new(feed_path));
    Ok((pumps, sensors))
}

#[cfg(all(feature = "sim", not(feature = "gpio")))]
fn backends(config: &ControllerConfig) -> Result<Backends> {
    const SIM_DIURNAL_PERIOD: Duration = Duration::from_secs(3600);

    let scenario = sim::Scenario::from_str_lossy(
        &env::var("SIM_SCENARIO").unwrap_or_else(|_| "drifting".to_string()),
    );
    let reservoir = Arc::new(sim::ReservoirSim::new(
        scenario,
        &config.targets,
        SIM_DIURNAL_PERIOD,
    ));
    info!(scenario = %reservoir.scenario(), "sim backend");

    let sensors: Arc<dyn SensorSource> = match env::var("SENSOR_FEED_PATH") {
        Ok(path) => {
            info!(feed = %path, "sensors read from feed file");
            Arc::new(feed::FeedFile::new(path))
        }
        Err(_) => reservoir.clone(),
    };
    let pumps: Arc<dyn Actuate> = reservoir;
    Ok((pumps, sensors))
}

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG wins; otherwise info for everything.
    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_target(true)
        .with_env_filter(env_filter)
        .compact()
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let poll = Duration::from_secs(env_u64("SENSOR_POLL_SEC", 10).max(1));
    let control = Duration::from_secs(env_u64("CONTROL_PERIOD_SEC", 60).max(1));

    // ── Config file ─────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "dosing.toml".to_string());
    let store = TomlFileStore::new(&config_path);
    let config = store.load()?;
    if config.pumps.wired().next().is_none() {
        warn!("no pumps configured in {config_path}");
    }

    // ── Hardware + engine ───────────────────────────────────────────
    let (hw, sensors) = backends(&config)?;
    let engine = Arc::new(DosingEngine::new(config, hw, sensors)?);
    // Fail-safe: everything off before the first cycle.
    engine.emergency_stop().await?;

    // ── Workers ─────────────────────────────────────────────────────
    let latest: workers::SharedSnapshot = Arc::new(RwLock::new(None));

    tokio::spawn(workers::event_sink(engine.subscribe()));
    tokio::spawn(workers::sensor_poll(engine.clone(), latest.clone(), poll));
    tokio::spawn(workers::dosing_cycle(engine.clone(), latest, control));
    tokio::spawn(workers::sweep(engine.clone()));

    info!(
        config = %config_path,
        poll_sec = poll.as_secs(),
        control_sec = control.as_secs(),
        "doserd running"
    );

    tokio::signal::ctrl_c().await?;
    warn!("shutdown requested");
    if let Err(e) = engine.emergency_stop().await {
        error!("pumps may still be running: {e}");
    }
    Ok(())
}
