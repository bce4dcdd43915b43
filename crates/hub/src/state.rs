use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::actuator::DeviceRegistry;
use crate::config::{Config, OperationMode};
use crate::decision::{self, DurationTable, Recommendation, Thresholds};
use crate::error::ValidationError;
use crate::events::BoundedLog;
use crate::irrigation::{IrrigationMachine, IrrigationSession, SharedIrrigation};
use crate::reconciler::{DeviceHealth, SharedDeviceHealth};
use crate::sensors::{SensorSnapshot, SensorStore, SensorUpdate};

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Everything the HTTP handlers, the MQTT loop and the reconciler share.
/// Each piece carries its own lock; cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    pub sensors: SensorStore,
    pub irrigation: SharedIrrigation,
    pub registry: DeviceRegistry,
    pub health: SharedDeviceHealth,
    pub settings: Arc<HubSettings>,
    decisions: Arc<RwLock<BoundedLog<Recommendation>>>,
    mqtt_connected: Arc<AtomicBool>,
    started_at: Instant,
}

/// The immutable part of the config the running hub needs.
#[derive(Debug)]
pub struct HubSettings {
    pub mode: OperationMode,
    pub zone: String,
    pub thresholds: Thresholds,
    pub durations: DurationTable,
    pub freshness_window: time::Duration,
}

/// Result of feeding one sensor update through the hub.
#[derive(Debug, Clone, Serialize)]
pub struct Ingested {
    pub snapshot: SensorSnapshot,
    pub recommendation: Recommendation,
    pub started: Option<IrrigationSession>,
}

// ---------------------------------------------------------------------------
// JSON responses
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub mode: OperationMode,
    pub zone: String,
    pub sensors: SensorSnapshot,
    pub active_irrigation: Option<IrrigationSession>,
    pub last_ai_decision: Option<Recommendation>,
    pub device: DeviceView,
}

#[derive(Serialize)]
pub struct DeviceView {
    pub endpoint: Option<String>,
    #[serde(flatten)]
    pub health: DeviceHealth,
}

#[derive(Serialize)]
pub struct IrrigationStatusResponse {
    pub active_irrigation: Option<IrrigationSession>,
    pub sensor_data: SensorSnapshot,
    pub last_ai_decision: Option<Recommendation>,
}

// ---------------------------------------------------------------------------
// Construction & operations
// ---------------------------------------------------------------------------

impl AppState {
    pub fn new(cfg: &Config) -> Self {
        let irrigation = IrrigationMachine::new(
            cfg.irrigation.max_duration_minutes,
            cfg.irrigation.event_log_capacity,
        )
        .shared();

        Self {
            sensors: SensorStore::new(SensorSnapshot::seed()),
            irrigation,
            registry: DeviceRegistry::default(),
            health: Arc::default(),
            settings: Arc::new(HubSettings {
                mode: cfg.mode,
                zone: cfg.zone.clone(),
                thresholds: cfg.thresholds.clone(),
                durations: cfg.durations.clone(),
                freshness_window: cfg.freshness_window(),
            }),
            decisions: Arc::new(RwLock::new(BoundedLog::new(
                cfg.irrigation.decision_history,
            ))),
            mqtt_connected: Arc::new(AtomicBool::new(false)),
            started_at: Instant::now(),
        }
    }

    pub fn set_mqtt_connected(&self, connected: bool) {
        self.mqtt_connected.store(connected, Ordering::Relaxed);
    }

    /// Merge a sensor update, then evaluate and possibly start irrigation.
    /// A rejected update changes nothing and produces no recommendation.
    pub async fn ingest(
        &self,
        update: &SensorUpdate,
        now: OffsetDateTime,
    ) -> Result<Ingested, ValidationError> {
        let snapshot = self.sensors.update(update, now).await?;
        let (recommendation, started) = self.evaluate_and_act(snapshot, now).await;
        Ok(Ingested {
            snapshot,
            recommendation,
            started,
        })
    }

    /// Evaluate the current snapshot on demand. Same actuation rules as
    /// ingestion.
    pub async fn analyze(&self, now: OffsetDateTime) -> Recommendation {
        let snapshot = self.sensors.current().await;
        self.evaluate_and_act(snapshot, now).await.0
    }

    async fn evaluate_and_act(
        &self,
        snapshot: SensorSnapshot,
        now: OffsetDateTime,
    ) -> (Recommendation, Option<IrrigationSession>) {
        let s = &self.settings;
        let rec = decision::evaluate(&snapshot, &s.thresholds, &s.durations, now);
        self.decisions.write().await.push(rec.clone());

        debug!(
            should_irrigate = rec.should_irrigate,
            reason = ?rec.reason,
            moisture = snapshot.soil_moisture,
            "sensors evaluated"
        );

        if !rec.should_irrigate {
            return (rec, None);
        }
        if s.mode == OperationMode::Monitor {
            info!(
                duration_min = rec.duration_minutes,
                urgency = ?rec.urgency,
                "monitor mode: irrigation recommended, not starting"
            );
            return (rec, None);
        }
        if !snapshot.is_fresh(now, s.freshness_window) {
            info!(
                observed_at = %snapshot.observed_at,
                "sensor data is stale, not starting irrigation"
            );
            return (rec, None);
        }

        let started = self
            .irrigation
            .lock()
            .await
            .apply_recommendation(&rec, &s.zone, now);
        (rec, started)
    }

    pub async fn last_decision(&self) -> Option<Recommendation> {
        self.decisions.read().await.latest().cloned()
    }

    pub async fn current_session(&self, now: OffsetDateTime) -> Option<IrrigationSession> {
        self.irrigation.lock().await.current(now)
    }

    /// Build the JSON-serialisable status snapshot.
    pub async fn to_status(&self, now: OffsetDateTime) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected.load(Ordering::Relaxed),
            mode: self.settings.mode,
            zone: self.settings.zone.clone(),
            sensors: self.sensors.current().await,
            active_irrigation: self.current_session(now).await,
            last_ai_decision: self.last_decision().await,
            device: DeviceView {
                endpoint: self.registry.endpoint().await.map(|u| u.to_string()),
                health: self.health.read().await.clone(),
            },
        }
    }

    pub async fn irrigation_status(&self, now: OffsetDateTime) -> IrrigationStatusResponse {
        IrrigationStatusResponse {
            active_irrigation: self.current_session(now).await,
            sensor_data: self.sensors.current().await,
            last_ai_decision: self.last_decision().await,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::Reason;
    use crate::irrigation::{Origin, SessionStatus};
    use time::macros::datetime;

    const T0: OffsetDateTime = datetime!(2024-06-01 06:00 UTC);

    fn state_with(mode: OperationMode) -> AppState {
        let cfg = Config {
            mode,
            ..Config::default()
        };
        AppState::new(&cfg)
    }

    fn dry() -> SensorUpdate {
        SensorUpdate {
            soil_moisture: Some(15.0),
            ..Default::default()
        }
    }

    // -- Ingestion ------------------------------------------------------------

    #[tokio::test]
    async fn dry_soil_starts_automatic_session() {
        let state = state_with(OperationMode::Auto);
        let out = state.ingest(&dry(), T0).await.unwrap();

        assert!(out.recommendation.should_irrigate);
        assert_eq!(out.recommendation.reason, Reason::CriticalMoisture);
        let session = out.started.expect("session started");
        assert_eq!(session.origin, Origin::AiAutomatic);
        assert_eq!(session.requested_duration_minutes, 30);
        assert_eq!(session.zone, "zone1");
        assert_eq!(session.status, SessionStatus::Requested);
    }

    #[tokio::test]
    async fn monitor_mode_records_but_never_starts() {
        let state = state_with(OperationMode::Monitor);
        let out = state.ingest(&dry(), T0).await.unwrap();

        assert!(out.recommendation.should_irrigate);
        assert!(out.started.is_none());
        assert!(state.current_session(T0).await.is_none());
        assert_eq!(state.last_decision().await, Some(out.recommendation));
    }

    #[tokio::test]
    async fn invalid_update_is_rejected_without_side_effects() {
        let state = state_with(OperationMode::Auto);
        let bad = SensorUpdate {
            soil_moisture: Some(140.0),
            ..Default::default()
        };
        assert!(state.ingest(&bad, T0).await.is_err());
        assert_eq!(state.sensors.current().await.soil_moisture, 45.0);
        assert!(state.last_decision().await.is_none());
    }

    #[tokio::test]
    async fn ingestion_never_preempts_manual_session() {
        let state = state_with(OperationMode::Auto);
        let manual = state
            .irrigation
            .lock()
            .await
            .request_start(Origin::Manual, "zone1", 5, T0)
            .unwrap();

        let out = state.ingest(&dry(), T0).await.unwrap();
        assert!(out.started.is_none());
        assert_eq!(state.current_session(T0).await.unwrap().id, manual.id);
    }

    // -- Analyze --------------------------------------------------------------

    #[tokio::test]
    async fn analyze_records_decision_history() {
        let state = state_with(OperationMode::Auto);
        let rec = state.analyze(T0).await;
        assert_eq!(rec.reason, Reason::Optimal);
        assert_eq!(state.last_decision().await, Some(rec));
    }

    #[tokio::test]
    async fn seed_values_never_start_the_pump() {
        let mut cfg = Config::default();
        cfg.thresholds.soil_moisture_min = 50.0;
        let state = AppState::new(&cfg);

        // Seed moisture 45 is below the raised minimum.
        let rec = state.analyze(T0 + time::Duration::seconds(5)).await;
        assert!(rec.should_irrigate);
        assert!(state.current_session(T0).await.is_none());

        // The first real reading counts.
        let reading = SensorUpdate {
            soil_moisture: Some(45.0),
            ..Default::default()
        };
        let out = state.ingest(&reading, T0 + time::Duration::seconds(6)).await.unwrap();
        assert!(out.started.is_some());
    }

    #[tokio::test]
    async fn stale_snapshot_does_not_start() {
        let state = state_with(OperationMode::Monitor);
        state.ingest(&dry(), T0).await.unwrap();

        // Same dry reading, re-evaluated long after it was taken.
        let auto = AppState {
            settings: Arc::new(HubSettings {
                mode: OperationMode::Auto,
                zone: "zone1".into(),
                thresholds: Thresholds::default(),
                durations: DurationTable::default(),
                freshness_window: time::Duration::minutes(10),
            }),
            ..state.clone()
        };
        let rec = auto.analyze(T0 + time::Duration::minutes(11)).await;
        assert!(rec.should_irrigate);
        assert!(auto.current_session(T0).await.is_none());

        // Within the window the same analysis does start.
        let rec = auto.analyze(T0 + time::Duration::minutes(9)).await;
        assert!(rec.should_irrigate);
        assert!(auto.current_session(T0).await.is_some());
    }

    // -- Status ---------------------------------------------------------------

    #[tokio::test]
    async fn status_reports_session_and_device() {
        let state = state_with(OperationMode::Auto);
        state.set_mqtt_connected(true);
        state.registry.register("http://10.0.0.9").await.unwrap();
        state.ingest(&dry(), T0).await.unwrap();

        let status = state.to_status(T0).await;
        assert!(status.mqtt_connected);
        assert_eq!(status.mode, OperationMode::Auto);
        assert_eq!(status.device.endpoint.as_deref(), Some("http://10.0.0.9/"));
        assert!(status.active_irrigation.is_some());
        assert!(status.last_ai_decision.is_some());

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["mode"], "auto");
        assert_eq!(json["device"]["consecutive_failures"], 0);
        assert_eq!(json["active_irrigation"]["type"], "ai_automatic");
    }

    #[tokio::test]
    async fn decision_history_is_bounded() {
        let mut cfg = Config::default();
        cfg.irrigation.decision_history = 2;
        let state = AppState::new(&cfg);
        for _ in 0..5 {
            state.analyze(T0).await;
        }
        assert_eq!(state.decisions.read().await.len(), 2);
    }
}
