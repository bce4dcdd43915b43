//! Irrigation lifecycle state machine: the single source of truth for what
//! the pump should be doing.
//!
//! ```text
//!              request_start / recommendation
//!   Idle ───────────────────────────────────▶ Requested
//!    ▲                                           │ confirm_started
//!    │                                           ▼
//!    │        device_stopped (drift)           Active ──[stop | expiry | rain]──▶ Stopping
//!    ├─────────── Completed ◀────────────────────┘                                 │
//!    ├─────────── Completed ◀───────────────── confirm_stopped ─────────────────────┘
//!    └─────────── Failed ◀──── fail (from Requested, Active or Stopping)
//! ```
//!
//! `Idle` is "no current session". Terminal states are never stored: the
//! transition into them appends one event log entry and clears the current
//! session inside the same critical section. Every device-driven transition
//! names the session it is for, so a late answer about a session that has
//! already finished is a no-op.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::decision::Recommendation;
use crate::error::{CommandError, ValidationError};
use crate::events::{BoundedLog, EventAction, EventLogEntry};

pub type SharedIrrigation = Arc<Mutex<IrrigationMachine>>;

// ---------------------------------------------------------------------------
// Session types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Manual,
    #[serde(alias = "ai")]
    AiAutomatic,
    #[serde(alias = "automatic")]
    Scheduled,
}

impl Origin {
    pub fn as_str(self) -> &'static str {
        match self {
            Origin::Manual => "manual",
            Origin::AiAutomatic => "ai_automatic",
            Origin::Scheduled => "scheduled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Start command not yet confirmed by the device.
    Requested,
    /// Device confirmed the pump is on.
    Active,
    /// Stop command issued or pending, waiting for the device to report off.
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StopReason {
    Manual,
    Expired,
    Rain,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IrrigationSession {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub origin: Origin,
    pub zone: String,
    pub requested_duration_minutes: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub requested_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    pub status: SessionStatus,
    /// Only populated while `Active`.
    pub remaining_seconds: Option<i64>,
    pub stop_reason: Option<StopReason>,
    /// A stop (manual or rain) arrived before the device confirmed the
    /// start; `stop_reason` says which.
    pub stop_requested: bool,
}

impl IrrigationSession {
    fn elapsed(&self, now: OffsetDateTime) -> Duration {
        match self.started_at {
            Some(started) => (now - started).max(Duration::ZERO),
            None => Duration::ZERO,
        }
    }

    fn run_time(&self) -> Duration {
        Duration::minutes(i64::from(self.requested_duration_minutes))
    }

    /// Computed from wall-clock time so missed ticks don't stretch the run.
    fn remaining_seconds_at(&self, now: OffsetDateTime) -> i64 {
        (self.run_time() - self.elapsed(now))
            .whole_seconds()
            .max(0)
    }

    fn minutes_completed(&self, now: OffsetDateTime) -> f64 {
        let run = self.elapsed(now).min(self.run_time());
        run.as_seconds_f64() / 60.0
    }
}

// ---------------------------------------------------------------------------
// Machine
// ---------------------------------------------------------------------------

pub struct IrrigationMachine {
    current: Option<IrrigationSession>,
    events: BoundedLog<EventLogEntry>,
    max_duration_minutes: u32,
}

impl IrrigationMachine {
    pub fn new(max_duration_minutes: u32, event_capacity: usize) -> Self {
        Self {
            current: None,
            events: BoundedLog::new(event_capacity),
            max_duration_minutes,
        }
    }

    pub fn shared(self) -> SharedIrrigation {
        Arc::new(Mutex::new(self))
    }

    // -- Read side ------------------------------------------------------------

    /// The current session as of `now`, with `remaining_seconds` filled in.
    pub fn current(&self, now: OffsetDateTime) -> Option<IrrigationSession> {
        self.current.as_ref().map(|s| {
            let mut view = s.clone();
            if view.status == SessionStatus::Active {
                view.remaining_seconds = Some(s.remaining_seconds_at(now));
            }
            view
        })
    }

    #[cfg(test)]
    pub fn is_idle(&self) -> bool {
        self.current.is_none()
    }

    pub fn recent_events(&self, limit: usize) -> Vec<EventLogEntry> {
        self.events.recent(limit)
    }

    // -- Commands -------------------------------------------------------------

    /// `Idle → Requested`. Rejects bad input and refuses to replace a
    /// session that is still running.
    pub fn request_start(
        &mut self,
        origin: Origin,
        zone: &str,
        duration_minutes: i64,
        now: OffsetDateTime,
    ) -> Result<IrrigationSession, CommandError> {
        let zone = zone.trim();
        if zone.is_empty() {
            return Err(ValidationError::EmptyZone.into());
        }
        if duration_minutes < 1 || duration_minutes > i64::from(self.max_duration_minutes) {
            return Err(ValidationError::Duration {
                value: duration_minutes,
                max: self.max_duration_minutes,
            }
            .into());
        }
        if let Some(existing) = &self.current {
            return Err(CommandError::Conflict {
                session_id: existing.id,
            });
        }

        let session = IrrigationSession {
            id: Uuid::new_v4(),
            origin,
            zone: zone.to_string(),
            requested_duration_minutes: duration_minutes as u32,
            requested_at: now,
            started_at: None,
            status: SessionStatus::Requested,
            remaining_seconds: None,
            stop_reason: None,
            stop_requested: false,
        };

        info!(
            session = %session.id,
            origin = origin.as_str(),
            zone = %session.zone,
            duration_min = duration_minutes,
            "irrigation requested"
        );

        self.current = Some(session.clone());
        Ok(session)
    }

    /// Start an automatic session if the recommendation asks for one and
    /// nothing is running. Never preempts an existing session.
    pub fn apply_recommendation(
        &mut self,
        rec: &Recommendation,
        zone: &str,
        now: OffsetDateTime,
    ) -> Option<IrrigationSession> {
        if !rec.should_irrigate {
            return None;
        }
        if let Some(existing) = &self.current {
            debug!(
                session = %existing.id,
                "recommendation to irrigate ignored: session already current"
            );
            return None;
        }
        match self.request_start(
            Origin::AiAutomatic,
            zone,
            i64::from(rec.duration_minutes),
            now,
        ) {
            Ok(session) => Some(session),
            Err(e) => {
                warn!("automatic start rejected: {e}");
                None
            }
        }
    }

    /// Manual stop. Idempotent: stopping nothing, or something already
    /// stopping, changes nothing.
    pub fn request_stop(&mut self, now: OffsetDateTime) -> Option<IrrigationSession> {
        let session = self.current.as_mut()?;
        match session.status {
            SessionStatus::Active => {
                session.status = SessionStatus::Stopping;
                session.stop_reason = Some(StopReason::Manual);
                info!(session = %session.id, "manual stop requested");
            }
            SessionStatus::Requested => {
                // Honored as soon as the device confirms the start.
                session.stop_requested = true;
                session.stop_reason.get_or_insert(StopReason::Manual);
                info!(session = %session.id, "manual stop requested before start confirmed");
            }
            SessionStatus::Stopping => {}
        }
        self.current(now)
    }

    // -- Device and clock driven transitions ----------------------------------

    /// `Requested → Active`. A stop that arrived in the meantime moves the
    /// session straight on to `Stopping` with the reason it was given.
    pub fn confirm_started(&mut self, id: Uuid, now: OffsetDateTime) -> bool {
        let Some(session) = self.session_in(id, SessionStatus::Requested) else {
            return false;
        };
        session.status = SessionStatus::Active;
        session.started_at = Some(now);
        info!(session = %id, "pump confirmed running");

        if session.stop_requested {
            session.status = SessionStatus::Stopping;
            let reason = *session.stop_reason.get_or_insert(StopReason::Manual);
            info!(session = %id, reason = ?reason, "applying pending stop");
        }
        true
    }

    /// `Active → Stopping` once the requested run time has elapsed.
    pub fn tick(&mut self, now: OffsetDateTime) -> bool {
        let Some(session) = self.current.as_mut() else {
            return false;
        };
        if session.status != SessionStatus::Active || session.remaining_seconds_at(now) > 0 {
            return false;
        }
        session.status = SessionStatus::Stopping;
        session.stop_reason = Some(StopReason::Expired);
        info!(
            session = %session.id,
            duration_min = session.requested_duration_minutes,
            "run time elapsed, stopping"
        );
        true
    }

    /// `Active → Stopping` because rain started mid-session. A session
    /// still waiting on its start is marked to stop once confirmed.
    pub fn interrupt_for_rain(&mut self) -> bool {
        let Some(session) = self.current.as_mut() else {
            return false;
        };
        match session.status {
            SessionStatus::Active => {
                session.status = SessionStatus::Stopping;
                session.stop_reason = Some(StopReason::Rain);
                info!(session = %session.id, "rain detected, stopping");
                true
            }
            SessionStatus::Requested => {
                session.stop_requested = true;
                session.stop_reason = Some(StopReason::Rain);
                info!(session = %session.id, "rain detected before start confirmed");
                true
            }
            SessionStatus::Stopping => false,
        }
    }

    /// `Stopping → Completed`, once the device reports the pump off.
    pub fn confirm_stopped(&mut self, id: Uuid, now: OffsetDateTime) -> bool {
        let Some(session) = self.session_in(id, SessionStatus::Stopping) else {
            return false;
        };
        let (action, detail) = match session.stop_reason {
            Some(StopReason::Manual) | None => (EventAction::Stop, "stopped by operator"),
            Some(StopReason::Expired) => (EventAction::AutoStop, "run time elapsed"),
            Some(StopReason::Rain) => (EventAction::AutoStop, "rain detected"),
        };
        self.finish(action, detail.to_string(), now);
        true
    }

    /// `Active → Completed`: the device stopped on its own.
    pub fn device_stopped(&mut self, id: Uuid, now: OffsetDateTime) -> bool {
        if self.session_in(id, SessionStatus::Active).is_none() {
            return false;
        }
        self.finish(
            EventAction::Completed,
            "device reported pump stopped".to_string(),
            now,
        );
        true
    }

    /// Any non-terminal state → `Failed`. Frees the slot for the next session.
    pub fn fail(&mut self, id: Uuid, cause: &str, now: OffsetDateTime) -> bool {
        match &self.current {
            Some(session) if session.id == id => {}
            _ => return false,
        }
        self.finish(EventAction::Failed, cause.to_string(), now);
        true
    }

    fn session_in(&mut self, id: Uuid, status: SessionStatus) -> Option<&mut IrrigationSession> {
        self.current
            .as_mut()
            .filter(|s| s.id == id && s.status == status)
    }

    fn finish(&mut self, action: EventAction, detail: String, now: OffsetDateTime) {
        let Some(session) = self.current.take() else {
            return;
        };
        let entry = EventLogEntry {
            timestamp: now,
            action,
            session_id: session.id,
            origin: session.origin,
            zone: session.zone.clone(),
            requested_duration_minutes: session.requested_duration_minutes,
            started_at: session.started_at,
            duration_completed_minutes: session.minutes_completed(now),
            detail,
        };
        match action {
            EventAction::Failed => warn!(
                session = %session.id,
                zone = %session.zone,
                detail = %entry.detail,
                "irrigation failed"
            ),
            _ => info!(
                session = %session.id,
                zone = %session.zone,
                action = ?action,
                minutes = format!("{:.2}", entry.duration_completed_minutes),
                "irrigation finished"
            ),
        }
        self.events.push(entry);
    }
}

// ===========================================================================
// Tests
// ===========================================================================
