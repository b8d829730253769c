use chrono::{TimeZone, Utc};
use sleeplog::{Database, SessionTracker, SleepSession, StoreError, TrackerEvent, TrackerStatus};
use tempfile::TempDir;

fn open_db(dir: &TempDir) -> Database {
    Database::open(dir.path().join("sleeplog.sqlite3")).expect("failed to open database")
}

async fn tracker_over(db: &Database) -> SessionTracker {
    SessionTracker::new(db.clone())
        .await
        .expect("failed to build tracker")
}

async fn in_progress_count(db: &Database) -> usize {
    db.get_all()
        .await
        .unwrap()
        .iter()
        .filter(|s| s.in_progress())
        .count()
}

#[tokio::test]
async fn start_persists_an_in_progress_session() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    let tracker = tracker_over(&db).await;

    let session = tracker.start().await.unwrap().expect("no session started");
    assert!(session.in_progress());
    assert_eq!(session.quality, None);

    let most_recent = db.get_most_recent().await.unwrap().unwrap();
    assert_eq!(most_recent.id, session.id);
    assert_eq!(most_recent.start_time, most_recent.end_time);

    let snapshot = tracker.snapshot().await;
    assert_eq!(snapshot.status, TrackerStatus::Tracking);
    assert!(snapshot.controls.stop_enabled);
    assert!(!snapshot.controls.start_enabled);
}

#[tokio::test]
async fn second_start_is_a_noop_while_tracking() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    let tracker = tracker_over(&db).await;

    tracker.start().await.unwrap().expect("no session started");
    assert_eq!(tracker.start().await.unwrap(), None);

    assert_eq!(db.get_all().await.unwrap().len(), 1);
    assert_eq!(in_progress_count(&db).await, 1);
}

#[tokio::test]
async fn concurrent_starts_produce_exactly_one_session() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    let tracker = tracker_over(&db).await;

    let first = tracker.clone();
    let second = tracker.clone();
    let (a, b) = tokio::join!(first.start(), second.start());

    let started = [a.unwrap(), b.unwrap()]
        .into_iter()
        .flatten()
        .count();
    assert_eq!(started, 1);
    assert_eq!(in_progress_count(&db).await, 1);
}

#[tokio::test]
async fn stop_completes_the_session_and_awaits_rating() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    let tracker = tracker_over(&db).await;

    let started = tracker.start().await.unwrap().expect("no session started");
    let stopped = tracker.stop().await.unwrap().expect("no session stopped");

    assert_eq!(stopped.id, started.id);
    assert!(stopped.completed());
    assert!(stopped.end_time >= stopped.start_time);

    let snapshot = tracker.snapshot().await;
    assert_eq!(snapshot.status, TrackerStatus::AwaitingRating);
    assert!(!snapshot.controls.start_enabled);
    assert!(!snapshot.controls.stop_enabled);

    // A new night cannot begin until the rating lands.
    assert_eq!(tracker.start().await.unwrap(), None);
    tracker.rate(3).await.unwrap().expect("rating was a noop");
    assert!(tracker.start().await.unwrap().is_some());
}

#[tokio::test]
async fn stop_without_tracking_is_a_noop() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    let tracker = tracker_over(&db).await;

    assert_eq!(tracker.stop().await.unwrap(), None);

    tracker.start().await.unwrap().expect("no session started");
    tracker.stop().await.unwrap().expect("no session stopped");
    // A duplicate stop event must not move the end time again.
    assert_eq!(tracker.stop().await.unwrap(), None);
}

#[tokio::test]
async fn out_of_range_ratings_fail_loudly_and_leave_storage_unchanged() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    let tracker = tracker_over(&db).await;

    tracker.start().await.unwrap().expect("no session started");
    let stopped = tracker.stop().await.unwrap().expect("no session stopped");

    let err = tracker.rate(-1).await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidQuality { quality: -1 }));
    let err = tracker.rate(6).await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidQuality { quality: 6 }));

    assert_eq!(db.get(stopped.id).await.unwrap().unwrap().quality, None);
    assert_eq!(tracker.snapshot().await.status, TrackerStatus::AwaitingRating);
}

#[tokio::test]
async fn rating_persists_and_returns_the_tracker_to_idle() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    let tracker = tracker_over(&db).await;

    tracker.start().await.unwrap().expect("no session started");
    let stopped = tracker.stop().await.unwrap().expect("no session stopped");

    let rated = tracker.rate(4).await.unwrap().expect("rating was a noop");
    assert_eq!(rated.id, stopped.id);
    assert_eq!(rated.quality, Some(4));
    assert_eq!(db.get(stopped.id).await.unwrap().unwrap().quality, Some(4));

    let snapshot = tracker.snapshot().await;
    assert_eq!(snapshot.status, TrackerStatus::Idle);
    assert_eq!(snapshot.current, None);
    assert!(snapshot.controls.start_enabled);

    // Rating again without a stopped session pending is absorbed.
    assert_eq!(tracker.rate(2).await.unwrap(), None);
}

#[tokio::test]
async fn clear_wipes_history_and_disables_the_clear_control() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    let tracker = tracker_over(&db).await;
    let mut events = tracker.subscribe_events();

    tracker.start().await.unwrap().expect("no session started");
    tracker.stop().await.unwrap().expect("no session stopped");
    tracker.rate(5).await.unwrap().expect("rating was a noop");
    assert!(tracker.snapshot().await.controls.clear_enabled);

    tracker.clear().await.unwrap();

    assert!(db.get_all().await.unwrap().is_empty());
    assert_eq!(db.get_most_recent().await.unwrap(), None);

    let snapshot = tracker.snapshot().await;
    assert_eq!(snapshot.status, TrackerStatus::Idle);
    assert!(!snapshot.controls.clear_enabled);

    loop {
        match events.recv().await.unwrap() {
            TrackerEvent::HistoryCleared => break,
            TrackerEvent::RatingRequested { .. } => continue,
        }
    }
}

#[tokio::test]
async fn clear_while_tracking_abandons_the_session() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    let tracker = tracker_over(&db).await;

    tracker.start().await.unwrap().expect("no session started");
    tracker.clear().await.unwrap();

    assert_eq!(tracker.snapshot().await.status, TrackerStatus::Idle);
    assert!(db.get_all().await.unwrap().is_empty());
    assert!(tracker.start().await.unwrap().is_some());
}

#[tokio::test]
async fn restart_adopts_a_persisted_in_progress_session() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    let seeded = SleepSession {
        id: 0,
        start_time: Utc.timestamp_millis_opt(1_000).unwrap(),
        end_time: Utc.timestamp_millis_opt(1_000).unwrap(),
        quality: None,
    };
    db.insert(&seeded).await.unwrap();
    let persisted = db.get_most_recent().await.unwrap().unwrap();

    let tracker = tracker_over(&db).await;
    let snapshot = tracker.snapshot().await;
    assert_eq!(snapshot.status, TrackerStatus::Tracking);
    assert_eq!(snapshot.current.unwrap().id, persisted.id);
}

#[tokio::test]
async fn restart_with_a_completed_most_recent_session_is_idle() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    db.insert(&SleepSession {
        id: 0,
        start_time: Utc.timestamp_millis_opt(1_000).unwrap(),
        end_time: Utc.timestamp_millis_opt(9_000).unwrap(),
        quality: None,
    })
    .await
    .unwrap();

    let tracker = tracker_over(&db).await;
    let snapshot = tracker.snapshot().await;
    assert_eq!(snapshot.status, TrackerStatus::Idle);
    assert_eq!(snapshot.current, None);
    assert!(snapshot.controls.clear_enabled);
}

#[tokio::test]
async fn rating_event_id_remains_usable_after_a_restart() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);

    let session_id = {
        let tracker = tracker_over(&db).await;
        let mut events = tracker.subscribe_events();

        tracker.start().await.unwrap().expect("no session started");
        let stopped = tracker.stop().await.unwrap().expect("no session stopped");

        match events.recv().await.unwrap() {
            TrackerEvent::RatingRequested { session_id } => {
                assert_eq!(session_id, stopped.id);
                session_id
            }
            other => panic!("unexpected event: {other:?}"),
        }
    };

    // Same store, fresh tracker: the stopped session is completed, so the
    // tracker comes up idle, but the id from the event still rates it.
    let tracker = tracker_over(&db).await;
    assert_eq!(tracker.snapshot().await.status, TrackerStatus::Idle);

    let rated = tracker.rate_session(session_id, 2).await.unwrap();
    assert_eq!(rated.quality, Some(2));
    assert_eq!(db.get(session_id).await.unwrap().unwrap().quality, Some(2));
}

#[tokio::test]
async fn rate_session_refuses_missing_and_in_progress_targets() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    let tracker = tracker_over(&db).await;

    let err = tracker.rate_session(12, 3).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound { id: 12 }));

    let started = tracker.start().await.unwrap().expect("no session started");
    let err = tracker.rate_session(started.id, 3).await.unwrap_err();
    assert!(matches!(err, StoreError::StillInProgress { id } if id == started.id));
    assert_eq!(db.get(started.id).await.unwrap().unwrap().quality, None);
}

#[tokio::test]
async fn control_signals_follow_the_lifecycle() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    let tracker = tracker_over(&db).await;
    let mut controls = tracker.subscribe_controls();

    assert!(controls.borrow_and_update().start_enabled);

    tracker.start().await.unwrap().expect("no session started");
    controls.changed().await.unwrap();
    assert!(controls.borrow_and_update().stop_enabled);

    tracker.stop().await.unwrap().expect("no session stopped");
    controls.changed().await.unwrap();
    {
        let flags = controls.borrow_and_update();
        assert!(!flags.start_enabled);
        assert!(!flags.stop_enabled);
        assert!(flags.clear_enabled);
    }

    tracker.rate(1).await.unwrap().expect("rating was a noop");
    controls.changed().await.unwrap();
    assert!(controls.borrow_and_update().start_enabled);
}

#[tokio::test]
async fn current_session_signal_tracks_the_cache() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    let tracker = tracker_over(&db).await;
    let mut current = tracker.subscribe_current();

    assert_eq!(*current.borrow_and_update(), None);

    let started = tracker.start().await.unwrap().expect("no session started");
    current.changed().await.unwrap();
    assert_eq!(
        current.borrow_and_update().as_ref().map(|s| s.id),
        Some(started.id)
    );

    tracker.stop().await.unwrap().expect("no session stopped");
    tracker.rate(0).await.unwrap().expect("rating was a noop");
    current.changed().await.unwrap();
    assert_eq!(*current.borrow_and_update(), None);
}

#[tokio::test]
async fn history_signal_reflects_every_persisted_night() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    let tracker = tracker_over(&db).await;
    let mut history = tracker.subscribe_history();

    tracker.start().await.unwrap().expect("no session started");
    history.changed().await.unwrap();
    assert_eq!(history.borrow_and_update().len(), 1);

    tracker.stop().await.unwrap().expect("no session stopped");
    tracker.rate(4).await.unwrap().expect("rating was a noop");
    history.changed().await.unwrap();
    let latest = history.borrow_and_update().first().cloned().unwrap();
    assert_eq!(latest.quality, Some(4));
}
