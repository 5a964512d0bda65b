//! Shared SQLite connection tuning for the event store
//!
//! Both the writer and the reader connection go through here so the WAL
//! settings stay identical.

use rusqlite::Connection;
use std::time::Duration;

/// Pages between automatic WAL checkpoints
pub const WAL_AUTOCHECKPOINT_PAGES: i64 = 1000;

/// How long a connection waits on a locked database before reporting BUSY
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Apply journal and durability PRAGMAs.
///
/// - `journal_mode=WAL`: readers never block the writer
/// - `synchronous=NORMAL`: a committed row survives a process crash
/// - `wal_autocheckpoint=1000`: bound WAL growth
/// - `busy_timeout=5s`: contention shows up as a delay before it shows up as BUSY
pub fn apply_optimized_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        log::warn!("SQLite refused WAL journal mode, running with '{}'", mode);
    }

    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "wal_autocheckpoint", WAL_AUTOCHECKPOINT_PAGES)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_pragmas_applied() {
        let dir = tempdir().unwrap();
        let conn = Connection::open(dir.path().join("pragma.db")).unwrap();

        apply_optimized_pragmas(&conn).unwrap();

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(journal_mode.to_lowercase(), "wal");

        let checkpoint: i64 = conn
            .query_row("PRAGMA wal_autocheckpoint", [], |row| row.get(0))
            .unwrap();
        assert_eq!(checkpoint, WAL_AUTOCHECKPOINT_PAGES);

        // NORMAL == 1
        let synchronous: i64 = conn
            .query_row("PRAGMA synchronous", [], |row| row.get(0))
            .unwrap();
        assert_eq!(synchronous, 1);
    }
}
