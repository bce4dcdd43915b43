//! Latest environmental readings for the single irrigation zone.
//!
//! The store only keeps the current value. Every write builds a complete new
//! snapshot and swaps it in under the lock, so readers always see one whole
//! write and never a mix of two.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::sync::RwLock;

use crate::error::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SensorSnapshot {
    /// °C
    pub temperature: f64,
    /// percent, 0-100
    pub soil_moisture: f64,
    /// percent, 0-100
    pub humidity: f64,
    /// tank level, litres
    pub water_level: f64,
    pub rain_detected: bool,
    /// Reported by the pump controller, not by the sensor node.
    pub pump_running: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub observed_at: OffsetDateTime,
}

impl SensorSnapshot {
    /// Values the hub assumes before the first telemetry arrives. Stamped
    /// at the epoch: never observed, so never fresh.
    pub fn seed() -> Self {
        Self {
            temperature: 25.5,
            soil_moisture: 45.0,
            humidity: 68.0,
            water_level: 750.0,
            rain_detected: false,
            pump_running: false,
            observed_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    /// Whether this snapshot is recent enough to start irrigation from.
    pub fn is_fresh(&self, now: OffsetDateTime, window: Duration) -> bool {
        now - self.observed_at <= window
    }
}

/// Partial update from a sensor node. Absent fields keep their last value.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SensorUpdate {
    pub temperature: Option<f64>,
    pub soil_moisture: Option<f64>,
    pub humidity: Option<f64>,
    pub water_level: Option<f64>,
    pub rain_detected: Option<bool>,
    pub pump_running: Option<bool>,
}

impl SensorUpdate {
    /// Parse a JSON object of field -> value pairs.
    pub fn from_json(payload: &[u8]) -> Result<Self, ValidationError> {
        serde_json::from_slice(payload).map_err(|e| ValidationError::InvalidBody(e.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        check("temperature", self.temperature, f64::MIN, f64::MAX)?;
        check("soil_moisture", self.soil_moisture, 0.0, 100.0)?;
        check("humidity", self.humidity, 0.0, 100.0)?;
        check("water_level", self.water_level, 0.0, f64::MAX)?;
        Ok(())
    }

    fn apply(&self, base: &SensorSnapshot, now: OffsetDateTime) -> SensorSnapshot {
        SensorSnapshot {
            temperature: self.temperature.unwrap_or(base.temperature),
            soil_moisture: self.soil_moisture.unwrap_or(base.soil_moisture),
            humidity: self.humidity.unwrap_or(base.humidity),
            water_level: self.water_level.unwrap_or(base.water_level),
            rain_detected: self.rain_detected.unwrap_or(base.rain_detected),
            pump_running: self.pump_running.unwrap_or(base.pump_running),
            // never step backwards, even if the wall clock does
            observed_at: now.max(base.observed_at),
        }
    }
}

fn check(field: &'static str, value: Option<f64>, min: f64, max: f64) -> Result<(), ValidationError> {
    match value {
        Some(v) if !v.is_finite() || v < min || v > max => Err(ValidationError::OutOfRange {
            field,
            value: v,
            min,
            max,
        }),
        _ => Ok(()),
    }
}

#[derive(Clone)]
pub struct SensorStore {
    inner: Arc<RwLock<SensorSnapshot>>,
}

impl SensorStore {
    pub fn new(initial: SensorSnapshot) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial)),
        }
    }

    /// Merge a partial update and stamp `observed_at`. A rejected update
    /// leaves the stored snapshot untouched.
    pub async fn update(
        &self,
        update: &SensorUpdate,
        now: OffsetDateTime,
    ) -> Result<SensorSnapshot, ValidationError> {
        update.validate()?;
        let mut current = self.inner.write().await;
        let next = update.apply(&current, now);
        *current = next;
        Ok(next)
    }

    pub async fn current(&self) -> SensorSnapshot {
        *self.inner.read().await
    }

    /// Record the pump controller's own running flag. Does not restamp
    /// `observed_at`; a device poll says nothing about soil freshness.
    pub async fn set_pump_running(&self, running: bool) {
        let mut current = self.inner.write().await;
        if current.pump_running != running {
            *current = SensorSnapshot {
                pump_running: running,
                ..*current
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const T0: OffsetDateTime = datetime!(2024-06-01 12:00 UTC);

    fn store() -> SensorStore {
        SensorStore::new(SensorSnapshot::seed())
    }

    #[tokio::test]
    async fn update_merges_only_present_fields() {
        let store = store();
        let update = SensorUpdate {
            soil_moisture: Some(18.0),
            rain_detected: Some(true),
            ..Default::default()
        };
        let snap = store.update(&update, T0 + Duration::minutes(1)).await.unwrap();

        assert_eq!(snap.soil_moisture, 18.0);
        assert!(snap.rain_detected);
        assert_eq!(snap.temperature, 25.5);
        assert_eq!(snap.water_level, 750.0);
        assert_eq!(snap.observed_at, T0 + Duration::minutes(1));
        assert_eq!(store.current().await, snap);
    }

    #[tokio::test]
    async fn last_write_wins_per_field() {
        let store = store();
        for m in [40.0, 35.0, 22.0] {
            let update = SensorUpdate {
                soil_moisture: Some(m),
                ..Default::default()
            };
            store.update(&update, T0).await.unwrap();
        }
        assert_eq!(store.current().await.soil_moisture, 22.0);
    }

    #[tokio::test]
    async fn out_of_range_update_does_not_mutate() {
        let store = store();
        let update = SensorUpdate {
            temperature: Some(30.0),
            humidity: Some(140.0),
            ..Default::default()
        };
        let err = store.update(&update, T0 + Duration::minutes(5)).await.unwrap_err();

        assert!(matches!(err, ValidationError::OutOfRange { field: "humidity", .. }));
        let snap = store.current().await;
        assert_eq!(snap.temperature, 25.5);
        assert_eq!(snap.observed_at, OffsetDateTime::UNIX_EPOCH);
    }

    #[tokio::test]
    async fn negative_water_level_rejected() {
        let update = SensorUpdate {
            water_level: Some(-1.0),
            ..Default::default()
        };
        assert!(store().update(&update, T0).await.is_err());
    }

    #[tokio::test]
    async fn nan_rejected() {
        let update = SensorUpdate {
            temperature: Some(f64::NAN),
            ..Default::default()
        };
        assert!(update.validate().is_err());
    }

    #[tokio::test]
    async fn observed_at_never_goes_backwards() {
        let store = store();
        let update = SensorUpdate {
            humidity: Some(50.0),
            ..Default::default()
        };
        store.update(&update, T0 + Duration::minutes(10)).await.unwrap();
        let snap = store.update(&update, T0 + Duration::minutes(3)).await.unwrap();
        assert_eq!(snap.observed_at, T0 + Duration::minutes(10));
    }

    #[tokio::test]
    async fn pump_flag_does_not_refresh_timestamp() {
        let store = store();
        store.set_pump_running(true).await;
        let snap = store.current().await;
        assert!(snap.pump_running);
        assert_eq!(snap.observed_at, OffsetDateTime::UNIX_EPOCH);
    }

    #[test]
    fn freshness_window() {
        let snap = SensorSnapshot {
            observed_at: T0,
            ..SensorSnapshot::seed()
        };
        let window = Duration::minutes(10);
        assert!(snap.is_fresh(T0 + Duration::minutes(10), window));
        assert!(!snap.is_fresh(T0 + Duration::minutes(11), window));
    }

    #[tokio::test]
    async fn seed_is_stale_until_first_update() {
        let store = store();
        let window = Duration::minutes(10);
        assert!(!store.current().await.is_fresh(T0, window));

        let update = SensorUpdate {
            temperature: Some(21.0),
            ..Default::default()
        };
        store.update(&update, T0).await.unwrap();
        assert!(store.current().await.is_fresh(T0, window));
    }

    // -- JSON parsing ---------------------------------------------------------

    #[test]
    fn parse_partial_json() {
        let update = SensorUpdate::from_json(br#"{"soil_moisture": 15, "rain_detected": false}"#)
            .unwrap();
        assert_eq!(update.soil_moisture, Some(15.0));
        assert_eq!(update.rain_detected, Some(false));
        assert_eq!(update.temperature, None);
    }

    #[test]
    fn parse_unknown_field_rejected() {
        let err = SensorUpdate::from_json(br#"{"soil_moisture": 15, "ph": 6.5}"#).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidBody(msg) if msg.contains("ph")));
    }

    #[test]
    fn parse_wrong_type_rejected() {
        assert!(SensorUpdate::from_json(br#"{"humidity": "wet"}"#).is_err());
    }

    #[test]
    fn empty_object_is_empty_update() {
        assert!(SensorUpdate::from_json(b"{}").unwrap().is_empty());
    }
}
