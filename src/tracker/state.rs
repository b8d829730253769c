use serde::Serialize;

use crate::models::SleepSession;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TrackerStatus {
    /// No in-progress session.
    Idle,
    /// One in-progress session exists.
    Tracking,
    /// The session just stopped and has no rating yet.
    AwaitingRating,
}

impl Default for TrackerStatus {
    fn default() -> Self {
        TrackerStatus::Idle
    }
}

/// Which presentation controls are live, recomputed from the state on read.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Controls {
    pub start_enabled: bool,
    pub stop_enabled: bool,
    pub clear_enabled: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerState {
    pub status: TrackerStatus,
    /// Cached copy of the active or just-ended session. Advisory: the store
    /// is the source of truth and the cache is reconciled from it.
    pub current: Option<SleepSession>,
    #[serde(skip)]
    pub history_empty: bool,
}

impl Default for TrackerState {
    fn default() -> Self {
        Self {
            status: TrackerStatus::Idle,
            current: None,
            history_empty: true,
        }
    }
}

impl TrackerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn controls(&self) -> Controls {
        Controls {
            start_enabled: self.status == TrackerStatus::Idle,
            stop_enabled: self.status == TrackerStatus::Tracking,
            clear_enabled: !self.history_empty,
        }
    }

    /// Adopt `session` as the tracked in-progress night.
    pub fn track(&mut self, session: SleepSession) {
        self.status = TrackerStatus::Tracking;
        self.current = Some(session);
        self.history_empty = false;
    }

    /// The cached session has stopped; hold it until it gets rated.
    pub fn await_rating(&mut self, session: SleepSession) {
        self.status = TrackerStatus::AwaitingRating;
        self.current = Some(session);
    }

    /// Back to idle with no cached session.
    pub fn reset(&mut self) {
        self.status = TrackerStatus::Idle;
        self.current = None;
    }
}
