//! Bounded history: the irrigation event log and the decision history.

use serde::Serialize;
use std::collections::VecDeque;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::irrigation::Origin;

/// FIFO with a hard capacity. Pushing past capacity evicts the oldest item.
#[derive(Debug, Clone)]
pub struct BoundedLog<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T: Clone> BoundedLog<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, item: T) {
        if self.capacity == 0 {
            return;
        }
        if self.items.len() >= self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    /// Up to `limit` items, newest first.
    pub fn recent(&self, limit: usize) -> Vec<T> {
        self.items.iter().rev().take(limit).cloned().collect()
    }

    pub fn latest(&self) -> Option<&T> {
        self.items.back()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.items.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventAction {
    /// Operator stop, confirmed by the device.
    Stop,
    /// Duration expiry or rain interrupt, confirmed by the device.
    AutoStop,
    /// Device stopped on its own while the session was active.
    Completed,
    Failed,
}

/// One finished irrigation session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventLogEntry {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub action: EventAction,
    pub session_id: Uuid,
    #[serde(rename = "type")]
    pub origin: Origin,
    pub zone: String,
    pub requested_duration_minutes: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    pub duration_completed_minutes: f64,
    pub detail: String,
}
