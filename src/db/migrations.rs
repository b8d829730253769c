use log::warn;
use rusqlite::Connection;

use crate::error::Result;

pub(crate) const SCHEMA_VERSION: i32 = 1;

/// Brings `conn` up to the current schema.
///
/// The schema is versioned by the `user_version` pragma. A fresh file
/// (version 0) gets the table created; the current version is a no-op; ANY
/// other value drops the `sessions` table and recreates it. Bumping
/// `SCHEMA_VERSION` therefore wipes all recorded history.
pub(crate) fn initialize_schema(conn: &mut Connection) -> Result<()> {
    let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if version == SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn.transaction()?;

    if version != 0 {
        warn!(
            "schema version {version} does not match expected {SCHEMA_VERSION}; \
             resetting sessions table"
        );
        tx.execute_batch("DROP TABLE IF EXISTS sessions;")?;
    }

    tx.execute_batch(include_str!("schemas/schema_v1.sql"))?;
    tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    tx.commit()?;

    Ok(())
}
