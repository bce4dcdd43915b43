//! Rule-based irrigation decisions.
//!
//! `evaluate` is a pure function of a sensor snapshot and the thresholds.
//! Rules are checked in a fixed order and the first match wins:
//!
//! ```text
//! rain ─▶ pump already running ─▶ low water ─▶ soil moisture
//!                                              ├─ ≤ critical        → heavy
//!                                              ├─ ≤ min             → moderate
//!                                              │   (hot AND dry     → heavy)
//!                                              └─ otherwise         → none
//! ```

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::sensors::SensorSnapshot;

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub soil_moisture_min: f64,
    pub soil_moisture_critical: f64,
    pub water_level_min: f64,
    pub temperature_max: f64,
    pub humidity_min: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            soil_moisture_min: 30.0,
            soil_moisture_critical: 20.0,
            water_level_min: 200.0,
            temperature_max: 35.0,
            humidity_min: 40.0,
        }
    }
}

/// Run length in minutes for each irrigation intensity.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DurationTable {
    pub light: u32,
    pub moderate: u32,
    pub heavy: u32,
}

impl Default for DurationTable {
    fn default() -> Self {
        Self {
            light: 10,
            moderate: 20,
            heavy: 30,
        }
    }
}

// ---------------------------------------------------------------------------
// Recommendation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    None,
    Moderate,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    Rain,
    AlreadyRunning,
    LowWater,
    CriticalMoisture,
    LowMoisture,
    Optimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub should_irrigate: bool,
    pub duration_minutes: u32,
    pub urgency: Urgency,
    pub reason: Reason,
    pub reasoning: String,
    #[serde(with = "time::serde::rfc3339")]
    pub evaluated_at: OffsetDateTime,
}

impl Recommendation {
    fn skip(reason: Reason, reasoning: String, now: OffsetDateTime) -> Self {
        Self {
            should_irrigate: false,
            duration_minutes: 0,
            urgency: Urgency::None,
            reason,
            reasoning,
            evaluated_at: now,
        }
    }

    fn irrigate(
        urgency: Urgency,
        reason: Reason,
        duration_minutes: u32,
        reasoning: String,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            should_irrigate: true,
            duration_minutes,
            urgency,
            reason,
            reasoning,
            evaluated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

pub fn evaluate(
    s: &SensorSnapshot,
    t: &Thresholds,
    durations: &DurationTable,
    now: OffsetDateTime,
) -> Recommendation {
    if s.rain_detected {
        return Recommendation::skip(
            Reason::Rain,
            format!(
                "Rain detected with soil moisture at {}%. Natural irrigation occurring, pump not needed.",
                s.soil_moisture
            ),
            now,
        );
    }

    if s.pump_running {
        return Recommendation::skip(
            Reason::AlreadyRunning,
            format!(
                "Pump already running (soil moisture {}%). No additional irrigation requested.",
                s.soil_moisture
            ),
            now,
        );
    }

    // Hard gate: never run the pump dry, however thirsty the soil is.
    if s.water_level < t.water_level_min {
        return Recommendation::skip(
            Reason::LowWater,
            format!(
                "Water tank level {} is below the minimum of {}. Insufficient supply for safe irrigation (soil moisture {}%).",
                s.water_level, t.water_level_min, s.soil_moisture
            ),
            now,
        );
    }

    if s.soil_moisture <= t.soil_moisture_critical {
        return Recommendation::irrigate(
            Urgency::Critical,
            Reason::CriticalMoisture,
            durations.heavy,
            format!(
                "Soil moisture at critical level ({}% <= {}%). Extended irrigation of {} min recommended.",
                s.soil_moisture, t.soil_moisture_critical, durations.heavy
            ),
            now,
        );
    }

    if s.soil_moisture <= t.soil_moisture_min {
        let hot = s.temperature > t.temperature_max;
        let dry = s.humidity < t.humidity_min;

        let (duration, reasoning) = if hot && dry {
            (
                durations.heavy,
                format!(
                    "Low soil moisture ({}%) with high temperature ({}°C > {}°C) and low humidity ({}% < {}%). Extended irrigation of {} min needed.",
                    s.soil_moisture,
                    s.temperature,
                    t.temperature_max,
                    s.humidity,
                    t.humidity_min,
                    durations.heavy
                ),
            )
        } else {
            (
                durations.moderate,
                format!(
                    "Soil moisture below optimal ({}% <= {}%). Moderate irrigation of {} min recommended (temperature {}°C, humidity {}%).",
                    s.soil_moisture, t.soil_moisture_min, durations.moderate, s.temperature, s.humidity
                ),
            )
        };

        return Recommendation::irrigate(
            Urgency::Moderate,
            Reason::LowMoisture,
            duration,
            reasoning,
            now,
        );
    }

    Recommendation::skip(
        Reason::Optimal,
        format!(
            "Soil moisture adequate ({}% > {}%). No irrigation required.",
            s.soil_moisture, t.soil_moisture_min
        ),
        now,
    )
}

// ===========================================================================
// Tests
// ===========================================================================
