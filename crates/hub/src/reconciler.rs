//! Background loop that drives the pump controller toward what the state
//! machine wants and notices when the two disagree.
//!
//! Two independent cadences:
//!
//! * **tick** (short, default 1 s): countdown expiry, rain interrupt and
//!   pending start/stop commands.
//! * **poll** (long, default 30 s): fetch the device's own running flag and
//!   reconcile:
//!
//! ```text
//! session     device says   action
//! ─────────   ───────────   ─────────────────────────────────────────────
//! Active      off           Completed (device stopped on its own)
//! Stopping    off           Completed
//! Stopping    on            re-issue stop, after one confirming re-poll
//! none        on            stop (orphan run), after one confirming re-poll
//! Active      unreachable   Failed
//! ```
//!
//! No lock is held across a device call. Results are applied afterwards by
//! session id, so an answer about a session that has since finished is
//! dropped.

use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::actuator::Actuator;
use crate::config::DeviceSettings;
use crate::error::DeviceError;
use crate::irrigation::{IrrigationSession, SessionStatus, SharedIrrigation};
use crate::sensors::SensorStore;

pub type Clock = Arc<dyn Fn() -> OffsetDateTime + Send + Sync>;
pub type SharedDeviceHealth = Arc<RwLock<DeviceHealth>>;

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub tick_interval: Duration,
    pub poll_interval: Duration,
    /// Per attempt. A timed-out attempt counts against `max_attempts`.
    pub command_timeout: Duration,
    pub max_attempts: u32,
    pub retry_backoff: Duration,
}

impl From<&DeviceSettings> for ReconcilerConfig {
    fn from(d: &DeviceSettings) -> Self {
        Self {
            tick_interval: Duration::from_millis(d.tick_interval_ms),
            poll_interval: Duration::from_secs(d.poll_interval_sec),
            command_timeout: d.command_timeout(),
            max_attempts: d.max_attempts,
            retry_backoff: Duration::from_millis(d.retry_backoff_ms),
        }
    }
}

/// What the hub last heard from the pump controller.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeviceHealth {
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_poll_at: Option<OffsetDateTime>,
    pub reported_running: Option<bool>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

/// A mismatch seen once and waiting for a second poll before we act on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Drift {
    StillRunning(Uuid),
    Orphan,
}

/// What to do after a poll, decided under the lock and carried out after.
enum PollAction {
    None,
    ReissueStop(Uuid),
    StopOrphan,
}

pub struct Reconciler {
    actuator: Arc<dyn Actuator>,
    irrigation: SharedIrrigation,
    sensors: SensorStore,
    health: SharedDeviceHealth,
    cfg: ReconcilerConfig,
    clock: Clock,
    last_rain: bool,
    /// Session whose stop command the device has acknowledged.
    stop_sent: Option<Uuid>,
    pending_drift: Option<Drift>,
}

impl Reconciler {
    pub fn new(
        actuator: Arc<dyn Actuator>,
        irrigation: SharedIrrigation,
        sensors: SensorStore,
        health: SharedDeviceHealth,
        cfg: ReconcilerConfig,
    ) -> Self {
        Self {
            actuator,
            irrigation,
            sensors,
            health,
            cfg,
            clock: Arc::new(OffsetDateTime::now_utc),
            last_rain: false,
            stop_sent: None,
            pending_drift: None,
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    fn now(&self) -> OffsetDateTime {
        (self.clock)()
    }

    /// Run forever. Intended to be `tokio::spawn`-ed from main.
    pub async fn run(mut self) {
        let mut ticker = interval(self.cfg.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut poller = interval(self.cfg.poll_interval);
        poller.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            tick_ms = self.cfg.tick_interval.as_millis() as u64,
            poll_sec = self.cfg.poll_interval.as_secs(),
            max_attempts = self.cfg.max_attempts,
            "reconciler started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                _ = poller.tick() => self.poll().await,
            }
        }
    }

    // -----------------------------------------------------------------------
    // Short cadence
    // -----------------------------------------------------------------------

    pub(crate) async fn tick(&mut self) {
        let raining = self.sensors.current().await.rain_detected;
        let rain_started = raining && !self.last_rain;
        self.last_rain = raining;

        let now = self.now();
        let session = {
            let mut machine = self.irrigation.lock().await;
            if rain_started {
                machine.interrupt_for_rain();
            }
            machine.tick(now);
            machine.current(now)
        };

        let Some(session) = session else {
            return;
        };
        match session.status {
            SessionStatus::Requested => self.start(&session).await,
            SessionStatus::Stopping if self.stop_sent != Some(session.id) => {
                if self.send_stop(Some(session.id)).await {
                    // Confirm right away instead of waiting for the next poll.
                    self.poll().await;
                }
            }
            _ => {}
        }
    }

    async fn start(&mut self, session: &IrrigationSession) {
        let actuator = &self.actuator;
        let (minutes, origin) = (session.requested_duration_minutes, session.origin);
        let result = with_retries(&self.cfg, "start", move || actuator.start(minutes, origin)).await;

        let now = self.now();
        match result {
            Ok(()) => {
                self.irrigation.lock().await.confirm_started(session.id, now);
            }
            Err(e) => {
                self.record_error(&e).await;
                self.irrigation
                    .lock()
                    .await
                    .fail(session.id, &format!("start failed: {e}"), now);
            }
        }
    }

    /// Returns whether the device acknowledged. A failed stop for a session
    /// fails the session; a failed orphan stop is retried on later polls.
    async fn send_stop(&mut self, session: Option<Uuid>) -> bool {
        let actuator = &self.actuator;
        let result = with_retries(&self.cfg, "stop", move || actuator.stop()).await;

        match (result, session) {
            (Ok(()), Some(id)) => {
                self.stop_sent = Some(id);
                true
            }
            (Ok(()), None) => true,
            (Err(e), Some(id)) => {
                self.record_error(&e).await;
                let now = self.now();
                self.irrigation
                    .lock()
                    .await
                    .fail(id, &format!("stop failed: {e}"), now);
                false
            }
            (Err(e), None) => {
                self.record_error(&e).await;
                warn!("could not stop unexpected pump run: {e}");
                false
            }
        }
    }

    // -----------------------------------------------------------------------
    // Long cadence
    // -----------------------------------------------------------------------

    pub(crate) async fn poll(&mut self) {
        let actuator = &self.actuator;
        let result = with_retries(&self.cfg, "status", move || actuator.status()).await;
        let now = self.now();

        let running = match result {
            Ok(status) => status.running,
            Err(e) => {
                self.record_error(&e).await;
                let mut machine = self.irrigation.lock().await;
                if let Some(session) = machine.current(now) {
                    if session.status != SessionStatus::Requested {
                        machine.fail(session.id, &format!("device unreachable: {e}"), now);
                    }
                }
                return;
            }
        };

        {
            let mut health = self.health.write().await;
            health.last_poll_at = Some(now);
            health.reported_running = Some(running);
            health.consecutive_failures = 0;
        }
        self.sensors.set_pump_running(running).await;

        let irrigation = Arc::clone(&self.irrigation);
        let action = {
            let mut machine = irrigation.lock().await;
            match machine.current(now) {
                Some(s) if s.status == SessionStatus::Active && !running => {
                    info!(session = %s.id, "device reports pump off while active");
                    machine.device_stopped(s.id, now);
                    self.pending_drift = None;
                    PollAction::None
                }
                Some(s) if s.status == SessionStatus::Stopping && !running => {
                    machine.confirm_stopped(s.id, now);
                    self.pending_drift = None;
                    PollAction::None
                }
                Some(s)
                    if s.status == SessionStatus::Stopping && self.stop_sent == Some(s.id) =>
                {
                    self.confirm_drift(Drift::StillRunning(s.id), PollAction::ReissueStop(s.id))
                }
                None if running => self.confirm_drift(Drift::Orphan, PollAction::StopOrphan),
                _ => {
                    self.pending_drift = None;
                    PollAction::None
                }
            }
        };

        match action {
            PollAction::None => {}
            PollAction::ReissueStop(id) => {
                warn!(session = %id, "pump still running after stop, re-issuing");
                self.send_stop(Some(id)).await;
            }
            PollAction::StopOrphan => {
                warn!("pump running with no session, stopping");
                self.send_stop(None).await;
            }
        }
    }

    /// First sighting arms `drift`; a second consecutive one returns `action`.
    fn confirm_drift(&mut self, drift: Drift, action: PollAction) -> PollAction {
        if self.pending_drift == Some(drift) {
            self.pending_drift = None;
            action
        } else {
            debug!(?drift, "drift seen, waiting for confirming poll");
            self.pending_drift = Some(drift);
            PollAction::None
        }
    }

    async fn record_error(&self, e: &DeviceError) {
        let mut health = self.health.write().await;
        health.consecutive_failures += 1;
        health.last_error = Some(e.to_string());
    }
}

/// Call `op` until it succeeds, fails with a non-retryable error, or runs
/// out of attempts. Each attempt is bounded by `cfg.command_timeout`.
async fn with_retries<T, F, Fut>(
    cfg: &ReconcilerConfig,
    what: &str,
    mut op: F,
) -> Result<T, DeviceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DeviceError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = match tokio::time::timeout(cfg.command_timeout, op()).await {
            Ok(r) => r,
            Err(_) => Err(DeviceError::Timeout {
                timeout_ms: cfg.command_timeout.as_millis() as u64,
            }),
        };
        match result {
            Ok(v) => return Ok(v),
            Err(e) if !e.is_retryable() || attempt >= cfg.max_attempts => {
                warn!(op = what, attempt, "device call failed: {e}");
                return Err(e);
            }
            Err(e) => {
                debug!(op = what, attempt, "device call failed, retrying: {e}");
                sleep(cfg.retry_backoff).await;
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
