use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::{info, warn};
use serde::Serialize;
use tokio::sync::{broadcast, watch, Mutex};

use crate::{
    db::Database,
    error::{Result, StoreError},
    models::{session::truncate_to_millis, SleepSession},
};

use super::{Controls, TrackerState, TrackerStatus};

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TrackerSnapshot {
    pub status: TrackerStatus,
    pub current: Option<SleepSession>,
    pub controls: Controls,
}

/// One-shot cues for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerEvent {
    /// A session just stopped; surface the rating UI for it.
    RatingRequested { session_id: i64 },
    /// The history was wiped; surface the confirmation.
    HistoryCleared,
}

struct Signals {
    current: watch::Sender<Option<SleepSession>>,
    controls: watch::Sender<Controls>,
    events: broadcast::Sender<TrackerEvent>,
}

/// Orchestrates the session lifecycle on top of [`Database`].
///
/// Every mutating operation holds the state lock across its storage calls,
/// so start/stop/rate/clear on one tracker are serialized end to end: two
/// racing `start()` calls cannot both observe an idle tracker, and storage
/// effects commit in program order.
#[derive(Clone)]
pub struct SessionTracker {
    state: Arc<Mutex<TrackerState>>,
    db: Database,
    signals: Arc<Signals>,
}

impl SessionTracker {
    /// Builds a tracker over `db` and reconciles with whatever it holds: a
    /// most-recent session whose end time still equals its start time was
    /// interrupted mid-tracking (process death) and is picked back up.
    pub async fn new(db: Database) -> Result<Self> {
        let mut state = TrackerState::new();
        state.history_empty = db.get_all().await?.is_empty();

        if let Some(most_recent) = db.get_most_recent().await? {
            if most_recent.in_progress() {
                info!("resuming in-progress session {}", most_recent.id);
                state.track(most_recent);
            }
        }

        let (current_tx, _) = watch::channel(state.current.clone());
        let (controls_tx, _) = watch::channel(state.controls());
        let (events_tx, _) = broadcast::channel(16);

        let tracker = Self {
            state: Arc::new(Mutex::new(state)),
            db,
            signals: Arc::new(Signals {
                current: current_tx,
                controls: controls_tx,
                events: events_tx,
            }),
        };
        tracker.spawn_history_watcher();

        Ok(tracker)
    }

    pub async fn snapshot(&self) -> TrackerSnapshot {
        let state = self.state.lock().await;
        TrackerSnapshot {
            status: state.status,
            current: state.current.clone(),
            controls: state.controls(),
        }
    }

    /// Begins tracking a new night.
    ///
    /// Returns `Ok(None)` without touching storage unless the tracker is
    /// idle, which absorbs duplicate taps and racing callers.
    pub async fn start(&self) -> Result<Option<SleepSession>> {
        let mut state = self.state.lock().await;
        if state.status != TrackerStatus::Idle {
            return Ok(None);
        }

        self.db.insert(&SleepSession::begin(Utc::now())).await?;

        // Adopt the row the store actually assigned instead of guessing the
        // id from this side.
        match self.db.get_most_recent().await? {
            Some(session) if session.in_progress() => {
                info!("started session {}", session.id);
                state.track(session.clone());
                self.publish(&state);
                Ok(Some(session))
            }
            _ => {
                warn!("no in-progress session visible after insert");
                Ok(None)
            }
        }
    }

    /// Ends the tracked session and asks the presentation layer to rate it.
    ///
    /// No-op unless the tracker is actively tracking.
    pub async fn stop(&self) -> Result<Option<SleepSession>> {
        let mut state = self.state.lock().await;
        if state.status != TrackerStatus::Tracking {
            return Ok(None);
        }
        let Some(mut session) = state.current.clone() else {
            return Ok(None);
        };

        session.end_time = stop_time(session.start_time);
        self.db.update(&session).await?;

        info!("stopped session {} at {}", session.id, session.end_time);
        state.await_rating(session.clone());
        self.publish(&state);
        let _ = self.signals.events.send(TrackerEvent::RatingRequested {
            session_id: session.id,
        });

        Ok(Some(session))
    }

    /// Rates the session that is awaiting its rating.
    ///
    /// Out-of-range values fail loudly before any state is consulted;
    /// otherwise a no-op unless a stopped session is actually waiting.
    pub async fn rate(&self, quality: i32) -> Result<Option<SleepSession>> {
        let quality = validate_quality(quality)?;

        let mut state = self.state.lock().await;
        if state.status != TrackerStatus::AwaitingRating {
            return Ok(None);
        }
        let Some(id) = state.current.as_ref().map(|s| s.id) else {
            return Ok(None);
        };

        let session = self.apply_rating(&mut state, id, quality).await?;
        Ok(Some(session))
    }

    /// Rates a session by id, independent of the cached state. This is the
    /// path a rating surface takes after a process restart, when the id from
    /// a [`TrackerEvent::RatingRequested`] outlives the tracker that sent it.
    pub async fn rate_session(&self, session_id: i64, quality: i32) -> Result<SleepSession> {
        let quality = validate_quality(quality)?;

        let mut state = self.state.lock().await;
        self.apply_rating(&mut state, session_id, quality).await
    }

    /// Deletes every recorded session, from any state.
    pub async fn clear(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.db.clear().await?;

        state.reset();
        state.history_empty = true;
        self.publish(&state);
        let _ = self.signals.events.send(TrackerEvent::HistoryCleared);
        info!("cleared sleep history");

        Ok(())
    }

    pub async fn history(&self) -> Result<Vec<SleepSession>> {
        self.db.get_all().await
    }

    pub fn subscribe_current(&self) -> watch::Receiver<Option<SleepSession>> {
        self.signals.current.subscribe()
    }

    pub fn subscribe_controls(&self) -> watch::Receiver<Controls> {
        self.signals.controls.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<TrackerEvent> {
        self.signals.events.subscribe()
    }

    pub fn subscribe_history(&self) -> watch::Receiver<Vec<SleepSession>> {
        self.db.subscribe()
    }

    /// Writes the rating through the store and reconciles the cached state.
    /// Always re-fetches by id; the cache may predate a process restart.
    async fn apply_rating(
        &self,
        state: &mut TrackerState,
        session_id: i64,
        quality: u8,
    ) -> Result<SleepSession> {
        let Some(mut session) = self.db.get(session_id).await? else {
            return Err(StoreError::NotFound { id: session_id });
        };
        if session.in_progress() {
            return Err(StoreError::StillInProgress { id: session_id });
        }

        session.quality = Some(quality);
        self.db.update(&session).await?;

        if state.current.as_ref().map(|s| s.id) == Some(session_id) {
            state.reset();
            self.publish(state);
        }
        info!("rated session {session_id} as {quality}");

        Ok(session)
    }

    // send_replace keeps the stored values fresh even while nobody
    // subscribes; a late subscriber starts from the live state.
    fn publish(&self, state: &TrackerState) {
        self.signals.current.send_replace(state.current.clone());
        self.signals.controls.send_replace(state.controls());
    }

    /// Follows the store's history snapshots and republishes the control
    /// flags when emptiness flips (the clear control tracks the collection,
    /// not the lifecycle). Ends when the store goes away.
    fn spawn_history_watcher(&self) {
        let mut history_rx = self.db.subscribe();
        let state = self.state.clone();
        let signals = self.signals.clone();

        tokio::spawn(async move {
            while history_rx.changed().await.is_ok() {
                let empty = history_rx.borrow_and_update().is_empty();
                let mut guard = state.lock().await;
                if guard.history_empty != empty {
                    guard.history_empty = empty;
                    signals.controls.send_replace(guard.controls());
                }
            }
        });
    }
}

fn validate_quality(quality: i32) -> Result<u8> {
    u8::try_from(quality)
        .ok()
        .filter(|q| *q <= 5)
        .ok_or(StoreError::InvalidQuality { quality })
}

/// The persisted record distinguishes "still tracking" by exact equality of
/// the two timestamps, so a stop landing in the same millisecond as the
/// start must settle one step later.
fn stop_time(started: DateTime<Utc>) -> DateTime<Utc> {
    let now = truncate_to_millis(Utc::now());
    if now > started {
        now
    } else {
        started + Duration::milliseconds(1)
    }
}
