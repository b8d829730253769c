pub mod db;
pub mod error;
pub mod models;
pub mod tracker;

use std::path::PathBuf;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};

pub use db::Database;
pub use error::{Result, StoreError};
pub use models::{SleepSession, UNRATED};
pub use tracker::{
    Controls, SessionTracker, TrackerEvent, TrackerSnapshot, TrackerState, TrackerStatus,
};

/// Entry point for the bundled REPL binary: a stand-in presentation layer
/// that just calls the tracker's operations and prints what comes back.
pub fn run() -> anyhow::Result<()> {
    // Initialize logging (reads RUST_LOG env var)
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    log::info!("sleeplog starting up...");

    let db_path = default_db_path()?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        let database = Database::shared(db_path)?;
        let tracker = SessionTracker::new(database).await?;
        repl(tracker).await
    })
}

/// `SLEEPLOG_DB` overrides the platform data directory.
fn default_db_path() -> anyhow::Result<PathBuf> {
    if let Some(path) = std::env::var_os("SLEEPLOG_DB") {
        return Ok(PathBuf::from(path));
    }

    let base = dirs::data_dir().context("no platform data directory")?;
    Ok(base.join("sleeplog").join("sleeplog.sqlite3"))
}

async fn repl(tracker: SessionTracker) -> anyhow::Result<()> {
    let mut events = tracker.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                TrackerEvent::RatingRequested { session_id } => {
                    println!("(session {session_id} stopped; `rate <0-5>` to score it)");
                }
                TrackerEvent::HistoryCleared => {
                    println!("(history cleared)");
                }
            }
        }
    });

    println!("commands: start | stop | rate <0-5> | clear | history | status | quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("start") => match tracker.start().await {
                Ok(Some(session)) => println!("tracking session {}", session.id),
                Ok(None) => println!("already tracking (or a rating is pending)"),
                Err(err) => println!("error: {err}"),
            },
            Some("stop") => match tracker.stop().await {
                Ok(Some(session)) => println!("stopped session {}", session.id),
                Ok(None) => println!("nothing to stop"),
                Err(err) => println!("error: {err}"),
            },
            Some("rate") => {
                let quality = parts.next().and_then(|arg| arg.parse::<i32>().ok());
                match quality {
                    Some(quality) => match tracker.rate(quality).await {
                        Ok(Some(session)) => {
                            println!("rated session {} as {quality}", session.id);
                        }
                        Ok(None) => println!("nothing awaiting a rating"),
                        Err(err) => println!("error: {err}"),
                    },
                    None => println!("usage: rate <0-5>"),
                }
            }
            Some("clear") => {
                if let Err(err) = tracker.clear().await {
                    println!("error: {err}");
                }
            }
            Some("history") => match tracker.history().await {
                Ok(sessions) => println!("{}", serde_json::to_string_pretty(&sessions)?),
                Err(err) => println!("error: {err}"),
            },
            Some("status") => {
                let snapshot = tracker.snapshot().await;
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            }
            Some("quit") | Some("exit") => break,
            Some(other) => println!("unknown command: {other}"),
            None => {}
        }
    }

    Ok(())
}
