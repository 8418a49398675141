use rusqlite::Connection;

use crate::error::Result;

pub const SCHEMA_VERSION: i64 = 1;

pub fn initialize(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;
    conn.pragma_update(None, "wal_autocheckpoint", 100)?;

    // In-memory databases have no WAL to checkpoint; failure is expected there.
    if conn
        .execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
        .is_ok()
    {
        tracing::info!("startup WAL checkpoint complete");
    }

    // `entities` rows are written once. `field_state` is the mutable physics
    // table, guarded by `version`. `cells` holds every materialized cell of
    // the last full snapshot, entity-bound or not.
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS metadata (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS entities (
            id          TEXT PRIMARY KEY,
            entity_type TEXT NOT NULL DEFAULT 'concept',
            created_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS field_state (
            entity_id     TEXT PRIMARY KEY REFERENCES entities(id),
            coord_v       INTEGER NOT NULL,
            coord_a       INTEGER NOT NULL,
            coord_e       INTEGER NOT NULL,
            excitation    TEXT NOT NULL,
            version       INTEGER NOT NULL,
            updated_at    TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS cells (
            coord_v    INTEGER NOT NULL,
            coord_a    INTEGER NOT NULL,
            coord_e    INTEGER NOT NULL,
            re_v       REAL NOT NULL,
            im_v       REAL NOT NULL,
            re_a       REAL NOT NULL,
            im_a       REAL NOT NULL,
            re_e       REAL NOT NULL,
            im_e       REAL NOT NULL,
            phase      REAL NOT NULL,
            coupling_v REAL NOT NULL,
            coupling_a REAL NOT NULL,
            coupling_e REAL NOT NULL,
            velocity_v REAL NOT NULL,
            velocity_a REAL NOT NULL,
            velocity_e REAL NOT NULL,
            vacuum     REAL NOT NULL,
            version    INTEGER NOT NULL,
            PRIMARY KEY (coord_v, coord_a, coord_e)
        );

        CREATE INDEX IF NOT EXISTS idx_state_coord ON field_state(coord_v, coord_a, coord_e);
        ",
    )?;

    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES ('schema_version', ?1)",
        [SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

pub fn get_schema_version(conn: &Connection) -> Result<Option<i64>> {
    let mut stmt = conn.prepare("SELECT value FROM metadata WHERE key = 'schema_version'")?;
    let version = stmt
        .query_row([], |row| {
            let v: String = row.get(0)?;
            Ok(v.parse::<i64>().unwrap_or(0))
        })
        .ok();
    Ok(version)
}
