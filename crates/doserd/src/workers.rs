//! Periodic tasks spawned by the daemon.

use std::sync::Arc;
use std::time::Duration;
use time::{Date, OffsetDateTime};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

use hydro_dosing::{Channel, DosingEngine, EventRecord, Notification, SensorSnapshot, Severity};

pub type SharedSnapshot = Arc<RwLock<Option<SensorSnapshot>>>;

const SWEEP_PERIOD: Duration = Duration::from_secs(60);

/// Reads every channel into `latest` each `period`.
pub async fn sensor_poll(engine: Arc<DosingEngine>, latest: SharedSnapshot, period: Duration) {
    let mut tick = tokio::time::interval(period);
    loop {
        tick.tick().await;
        let snapshot = engine.read_sensors().await;
        debug!(
            ph = ?snapshot.get(Channel::Ph).get(),
            ec = ?snapshot.get(Channel::Ec).get(),
            "sensor poll"
        );
        *latest.write().await = Some(snapshot);
    }
}

/// Runs one dosing update per `period` against the latest snapshot.
pub async fn dosing_cycle(engine: Arc<DosingEngine>, latest: SharedSnapshot, period: Duration) {
    let mut tick = tokio::time::interval(period);
    // First tick fires immediately; give the poller a head start.
    tick.tick().await;
    loop {
        tick.tick().await;
        let Some(snapshot) = latest.read().await.clone() else {
            warn!("no sensor snapshot yet, skipping dosing cycle");
            continue;
        };
        let decisions = engine.update(&snapshot).await;
        let dosed = decisions.iter().filter(|d| d.dosed()).count();
        info!(decisions = decisions.len(), dosed, "dosing cycle");
    }
}

/// True when `now` falls on a later UTC day than `last`.
pub fn day_changed(last: Date, now: OffsetDateTime) -> bool {
    now.date() > last
}

/// Once a minute: daily reset on UTC rollover and a health report.
pub async fn sweep(engine: Arc<DosingEngine>) {
    let mut today = OffsetDateTime::now_utc().date();
    let mut tick = tokio::time::interval(SWEEP_PERIOD);
    loop {
        tick.tick().await;

        let now = OffsetDateTime::now_utc();
        if day_changed(today, now) {
            engine.reset_daily().await;
            today = now.date();
        }

        for channel in [Channel::Ph, Channel::Ec] {
            if !engine.is_healthy(channel).await {
                let h = engine.sensor_health(channel).await;
                warn!(
                    %channel,
                    disabled = h.disabled,
                    success_rate = h.success_rate,
                    "sensor channel unhealthy"
                );
            }
        }
    }
}

/// Forward a warning-and-above notification. Log-only for now.
fn notify(n: &Notification) {
    match n.severity {
        Severity::Critical | Severity::Error => error!(source = n.source, "ALERT: {}", n.message),
        _ => warn!(source = n.source, "ALERT: {}", n.message),
    }
}

fn render(record: &EventRecord) -> String {
    serde_json::to_string(record).unwrap_or_else(|e| format!("unserialisable event: {e}"))
}

fn log_event(record: &EventRecord) {
    let payload = render(record);
    match record.event.severity() {
        Severity::Debug => debug!(event = %payload),
        Severity::Info => info!(event = %payload),
        Severity::Warning => warn!(event = %payload),
        Severity::Error | Severity::Critical => error!(event = %payload),
    }
    if let Some(n) = record.event.notification() {
        notify(&n);
    }
}

/// Drains the engine's event bus until it closes.
pub async fn event_sink(mut rx: broadcast::Receiver<EventRecord>) {
    loop {
        match rx.recv().await {
            Ok(record) => log_event(&record),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "event sink lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
