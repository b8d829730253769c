use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex, OnceLock},
    thread::{self, JoinHandle},
};

use chrono::{DateTime, TimeZone, Utc};
use log::{error, info};
use rusqlite::{params, Connection, Row};
use tokio::sync::{oneshot, watch};

mod migrations;

use migrations::initialize_schema;

use crate::error::{Result, StoreError};
use crate::models::SleepSession;

type DbTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum DbCommand {
    Execute(DbTask),
    Shutdown,
}

struct DatabaseInner {
    sender: mpsc::Sender<DbCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
    history: Arc<watch::Sender<Vec<SleepSession>>>,
}

impl Drop for DatabaseInner {
    fn drop(&mut self) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(handle) = guard.take() {
            // The shutdown command queues behind any in-flight writes, so
            // they commit before the worker exits.
            if let Err(err) = self.sender.send(DbCommand::Shutdown) {
                error!("failed to send shutdown to db thread: {err}");
            }
            if let Err(join_err) = handle.join() {
                error!("failed to join db thread: {join_err:?}");
            }
        }
    }
}

fn millis_to_datetime(value: i64, field: &'static str) -> Result<DateTime<Utc>> {
    match Utc.timestamp_millis_opt(value) {
        chrono::LocalResult::Single(ts) => Ok(ts),
        _ => Err(StoreError::CorruptTimestamp { field, value }),
    }
}

fn row_to_session(row: &Row<'_>) -> Result<SleepSession> {
    let quality: i64 = row.get("quality")?;

    Ok(SleepSession {
        id: row.get("id")?,
        start_time: millis_to_datetime(row.get("startTime")?, "startTime")?,
        end_time: millis_to_datetime(row.get("endTime")?, "endTime")?,
        quality: SleepSession::quality_from_raw(quality),
    })
}

fn query_all(conn: &Connection) -> Result<Vec<SleepSession>> {
    let mut stmt = conn.prepare(
        "SELECT id, startTime, endTime, quality
         FROM sessions
         ORDER BY id DESC",
    )?;

    let mut rows = stmt.query([])?;
    let mut sessions = Vec::new();
    while let Some(row) = rows.next()? {
        sessions.push(row_to_session(row)?);
    }

    Ok(sessions)
}

fn publish_history(conn: &Connection, history: &watch::Sender<Vec<SleepSession>>) {
    match query_all(conn) {
        // send_replace stores the snapshot even while nobody subscribes, so
        // a late subscriber still starts from the live collection.
        Ok(sessions) => {
            history.send_replace(sessions);
        }
        Err(err) => error!("failed to refresh history snapshot: {err}"),
    }
}

/// Handle to the session store.
///
/// All SQLite access happens on one dedicated worker thread; callers submit
/// closures and await the reply, so every operation observes a consistent
/// snapshot and mutations commit in submission order.
///
/// The on-disk schema is versioned with a DESTRUCTIVE reset policy: opening a
/// file written by a different schema version drops the whole `sessions`
/// table. See `migrations::initialize_schema`.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
    db_path: Arc<PathBuf>,
}

static SHARED: OnceLock<Mutex<HashMap<PathBuf, Database>>> = OnceLock::new();

impl Database {
    /// Opens the store at `db_path`, creating parent directories and the
    /// schema as needed.
    ///
    /// Callers that may open the same location twice should go through
    /// [`Database::shared`] instead; two handles onto one file mean two
    /// connections and two worker threads.
    pub fn open(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let (command_tx, command_rx) = mpsc::channel::<DbCommand>();
        let (ready_tx, ready_rx) = mpsc::channel();
        let path_for_thread = db_path.clone();

        let worker = thread::Builder::new()
            .name("sleeplog-db".into())
            .spawn(move || {
                let mut conn = match Connection::open(&path_for_thread) {
                    Ok(connection) => connection,
                    Err(err) => {
                        let _ = ready_tx.send(Err(StoreError::Storage(err)));
                        return;
                    }
                };

                if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
                    error!("failed to enable WAL mode: {err}");
                }

                let init_result = initialize_schema(&mut conn)
                    .and_then(|_| query_all(&conn));
                let init_failed = init_result.is_err();
                if ready_tx.send(init_result).is_err() {
                    error!("db initialization receiver dropped before ready signal");
                    return;
                }
                if init_failed {
                    return;
                }

                while let Ok(command) = command_rx.recv() {
                    match command {
                        DbCommand::Execute(task) => {
                            task(&mut conn);
                        }
                        DbCommand::Shutdown => break,
                    }
                }

                info!("database thread shutting down");
            })?;

        let initial = ready_rx.recv().map_err(|_| StoreError::WorkerGone)??;
        let (history_tx, _) = watch::channel(initial);

        info!("database initialized at {}", db_path.display());

        Ok(Self {
            inner: Arc::new(DatabaseInner {
                sender: command_tx,
                worker: Mutex::new(Some(worker)),
                history: Arc::new(history_tx),
            }),
            db_path: Arc::new(db_path),
        })
    }

    /// Process-wide accessor: at most one store handle per storage location.
    ///
    /// Paths are keyed as given (no canonicalization); callers must agree on
    /// the spelling to share a handle.
    pub fn shared(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        let registry = SHARED.get_or_init(|| Mutex::new(HashMap::new()));
        let mut guard = match registry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(db) = guard.get(&db_path) {
            return Ok(db.clone());
        }

        let db = Database::open(db_path.clone())?;
        guard.insert(db_path, db.clone());
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        self.db_path.as_path()
    }

    /// Full history snapshots, descending by id. A refreshed snapshot (never
    /// a delta) is published after every successful mutation, in commit
    /// order.
    pub fn subscribe(&self) -> watch::Receiver<Vec<SleepSession>> {
        self.inner.history.subscribe()
    }

    async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();

        let command = DbCommand::Execute(Box::new(move |conn| {
            let result = task(conn);
            if reply_tx.send(result).is_err() {
                error!("db caller dropped before receiving result");
            }
        }));

        self.inner
            .sender
            .send(command)
            .map_err(|_| StoreError::WorkerGone)?;

        reply_rx.await.map_err(|_| StoreError::WorkerGone)?
    }

    /// Persists `session`. A zero id lets SQLite assign the next rowid; a
    /// non-zero id is written as given.
    pub async fn insert(&self, session: &SleepSession) -> Result<()> {
        let record = session.clone();
        let history = self.inner.history.clone();
        self.execute(move |conn| {
            if record.id == 0 {
                conn.execute(
                    "INSERT INTO sessions (startTime, endTime, quality)
                     VALUES (?1, ?2, ?3)",
                    params![
                        record.start_time.timestamp_millis(),
                        record.end_time.timestamp_millis(),
                        record.quality_raw(),
                    ],
                )?;
            } else {
                conn.execute(
                    "INSERT INTO sessions (id, startTime, endTime, quality)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        record.id,
                        record.start_time.timestamp_millis(),
                        record.end_time.timestamp_millis(),
                        record.quality_raw(),
                    ],
                )?;
            }

            publish_history(conn, &history);
            Ok(())
        })
        .await
    }

    /// Overwrites the record matching `session.id`.
    ///
    /// A missing id is an error rather than an upsert; a row that silently
    /// reappeared would mask history loss.
    pub async fn update(&self, session: &SleepSession) -> Result<()> {
        let record = session.clone();
        let history = self.inner.history.clone();
        self.execute(move |conn| {
            let rows_affected = conn.execute(
                "UPDATE sessions
                 SET startTime = ?1,
                     endTime = ?2,
                     quality = ?3
                 WHERE id = ?4",
                params![
                    record.start_time.timestamp_millis(),
                    record.end_time.timestamp_millis(),
                    record.quality_raw(),
                    record.id,
                ],
            )?;

            if rows_affected == 0 {
                return Err(StoreError::NotFound { id: record.id });
            }

            publish_history(conn, &history);
            Ok(())
        })
        .await
    }

    /// Fetches one session by id; absence is a normal outcome.
    pub async fn get(&self, id: i64) -> Result<Option<SleepSession>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, startTime, endTime, quality
                 FROM sessions
                 WHERE id = ?1",
            )?;

            let mut rows = stmt.query(params![id])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_session(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    /// The session with the greatest id, if any.
    pub async fn get_most_recent(&self) -> Result<Option<SleepSession>> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, startTime, endTime, quality
                 FROM sessions
                 ORDER BY id DESC
                 LIMIT 1",
            )?;

            let mut rows = stmt.query([])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_session(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    /// All sessions, descending by id.
    pub async fn get_all(&self) -> Result<Vec<SleepSession>> {
        self.execute(|conn| query_all(conn)).await
    }

    /// Deletes every session.
    pub async fn clear(&self) -> Result<()> {
        let history = self.inner.history.clone();
        self.execute(move |conn| {
            conn.execute("DELETE FROM sessions", [])?;
            publish_history(conn, &history);
            Ok(())
        })
        .await
    }
}
