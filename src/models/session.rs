use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Raw storage value meaning "this session has not been rated yet".
pub const UNRATED: i64 = -1;

/// One recorded night of sleep.
///
/// A session is *in progress* while `end_time == start_time`; stopping it
/// moves `end_time` strictly past `start_time`. `quality` is `None` until the
/// completed session gets rated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SleepSession {
    /// Store-assigned rowid. Zero marks a record that has not been persisted
    /// yet; `Database::insert` lets SQLite pick the id in that case.
    pub id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub quality: Option<u8>,
}

impl SleepSession {
    /// New in-progress session anchored at `now`, not yet persisted.
    pub fn begin(now: DateTime<Utc>) -> Self {
        let now = truncate_to_millis(now);
        Self {
            id: 0,
            start_time: now,
            end_time: now,
            quality: None,
        }
    }

    pub fn in_progress(&self) -> bool {
        self.end_time == self.start_time
    }

    pub fn completed(&self) -> bool {
        self.end_time > self.start_time
    }

    /// Quality as stored: the rating itself, or the unrated sentinel.
    pub fn quality_raw(&self) -> i64 {
        match self.quality {
            Some(q) => i64::from(q),
            None => UNRATED,
        }
    }

    pub fn quality_from_raw(raw: i64) -> Option<u8> {
        u8::try_from(raw).ok()
    }
}

/// Timestamps are persisted as integer milliseconds, so anything the tracker
/// writes is truncated up front; otherwise an in-progress session would stop
/// comparing equal to itself after a storage round trip.
pub(crate) fn truncate_to_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    match Utc.timestamp_millis_opt(ts.timestamp_millis()) {
        chrono::LocalResult::Single(t) => t,
        _ => ts,
    }
}
