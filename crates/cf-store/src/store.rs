use std::collections::{HashMap, HashSet};
use std::path::Path;

use num_complex::Complex64;
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use uuid::Uuid;

use cf_core::{
    CellSnapshot, EntitySnapshot, FieldExcitation, FieldSnapshot, QuantizedCoordinate,
    SNAPSHOT_VERSION, SyncBaseline,
};

use crate::error::{Result, StoreError};
use crate::schema;
use crate::time::now_iso8601;

/// Immutable registry row.
#[derive(Clone, Debug, PartialEq)]
pub struct EntityRecord {
    pub id: Uuid,
    pub entity_type: String,
    pub created_at: String,
}

/// Mutable physics row of one entity.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldStateRow {
    pub entity_id: Uuid,
    pub coordinate: QuantizedCoordinate,
    pub excitation: FieldExcitation,
    pub version: u64,
    pub updated_at: String,
}

pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    // --- Metadata ---

    pub fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT value FROM metadata WHERE key = ?1")?;
        let result = stmt.query_row([key], |row| row.get(0)).optional()?;
        Ok(result)
    }

    pub fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        set_metadata_on(&self.conn, key, value)
    }

    // --- Entity registry ---

    /// Register an entity. Returns false if it already existed; the
    /// original row is never modified.
    pub fn register_entity(&self, id: Uuid, entity_type: &str) -> Result<bool> {
        register_on(&self.conn, id, entity_type)
    }

    pub fn get_entity(&self, id: Uuid) -> Result<Option<EntityRecord>> {
        let row = self
            .conn
            .query_row(
                "SELECT entity_type, created_at FROM entities WHERE id = ?1",
                [id.to_string()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        Ok(row.map(|(entity_type, created_at)| EntityRecord {
            id,
            entity_type,
            created_at,
        }))
    }

    pub fn list_entities(&self) -> Result<Vec<EntityRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, entity_type, created_at FROM entities ORDER BY created_at, id")?;
        stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?
        .map(|r| {
            let (id, entity_type, created_at) = r?;
            Ok(EntityRecord {
                id: parse_uuid(&id)?,
                entity_type,
                created_at,
            })
        })
        .collect()
    }

    // --- Field state (optimistic concurrency) ---

    /// Write an entity's physics row if the stored version is still
    /// `expected_version` (0 for a row that does not exist yet). Returns the
    /// new version.
    pub fn save_field_state(
        &self,
        entity_id: Uuid,
        coordinate: QuantizedCoordinate,
        excitation: &FieldExcitation,
        expected_version: u64,
    ) -> Result<u64> {
        let tx = self.conn.unchecked_transaction()?;
        let next = write_field_state_on(&tx, entity_id, coordinate, excitation, expected_version)?;
        tx.commit()?;
        tracing::debug!(%entity_id, version = next, "field state saved");
        Ok(next)
    }

    pub fn load_field_state(&self, entity_id: Uuid) -> Result<Option<FieldStateRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT coord_v, coord_a, coord_e, excitation, version, updated_at
                 FROM field_state WHERE entity_id = ?1",
                [entity_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;
        row.map(|(v, a, e, json, version, updated_at)| {
            Ok(FieldStateRow {
                entity_id,
                coordinate: parse_coordinate(v, a, e)?,
                excitation: parse_excitation(&json)?,
                version: version as u64,
                updated_at,
            })
        })
        .transpose()
    }

    // --- Snapshots ---

    /// Write what changed in `snapshot` since its baseline, all or nothing.
    ///
    /// Cells whose version still equals the baseline are left alone, so rows
    /// written by another handle survive. A changed cell, a pruned cell or
    /// an entity row is only written while its stored version still equals
    /// the baseline; otherwise the save fails with a conflict and nothing is
    /// written. Returns the baseline the caller should sync to.
    pub fn save_snapshot(&self, snapshot: &FieldSnapshot) -> Result<SyncBaseline> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let base = &snapshot.baseline;
        let mut synced = SyncBaseline::default();
        let live: HashSet<QuantizedCoordinate> =
            snapshot.cells.iter().map(|c| c.coordinate).collect();

        let mut removed = 0;
        for (&coordinate, &expected) in &base.cells {
            if live.contains(&coordinate) {
                continue;
            }
            match cell_version_on(&tx, coordinate)? {
                None => {}
                Some(found) if found == expected => {
                    let [v, a, e] = coordinate.to_array();
                    tx.execute(
                        "DELETE FROM cells WHERE coord_v = ?1 AND coord_a = ?2 AND coord_e = ?3",
                        params![v, a, e],
                    )?;
                    removed += 1;
                }
                Some(found) => {
                    return Err(StoreError::CellConflict {
                        coordinate,
                        expected,
                        found,
                    });
                }
            }
        }

        let mut written = HashSet::new();
        for cell in &snapshot.cells {
            let expected = base.cells.get(&cell.coordinate).copied();
            if expected != Some(cell.version) {
                let found = cell_version_on(&tx, cell.coordinate)?;
                if found != expected {
                    return Err(StoreError::CellConflict {
                        coordinate: cell.coordinate,
                        expected: expected.unwrap_or(0),
                        found: found.unwrap_or(0),
                    });
                }
                write_cell_on(&tx, cell)?;
                written.insert(cell.coordinate);
            }
            synced.cells.insert(cell.coordinate, cell.version);
        }

        let by_coord: HashMap<QuantizedCoordinate, &FieldExcitation> = snapshot
            .cells
            .iter()
            .map(|c| (c.coordinate, &c.excitation))
            .collect();
        let vacuum = FieldExcitation::vacuum();
        for entity in &snapshot.entities {
            let expected = base.entities.get(&entity.id).copied();
            let version = match expected {
                Some(v) if !written.contains(&entity.coordinate) => v,
                _ => {
                    let excitation = by_coord.get(&entity.coordinate).copied().unwrap_or(&vacuum);
                    write_field_state_on(
                        &tx,
                        entity.id,
                        entity.coordinate,
                        excitation,
                        expected.unwrap_or(0),
                    )?
                }
            };
            synced.entities.insert(entity.id, version);
        }

        set_metadata_on(&tx, "snapshot_version", &snapshot.version.to_string())?;
        set_metadata_on(&tx, "time", &snapshot.time.to_string())?;
        set_metadata_on(&tx, "ticks", &snapshot.ticks.to_string())?;
        tx.commit()?;
        tracing::info!(
            written = written.len(),
            removed,
            entities = snapshot.entities.len(),
            "snapshot saved"
        );
        Ok(synced)
    }

    /// Replace the stored lattice with `snapshot` outright, ignoring any
    /// versions already stored. Used for imports.
    pub fn replace_snapshot(&self, snapshot: &FieldSnapshot) -> Result<()> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        tx.execute_batch("DELETE FROM cells;")?;
        for cell in &snapshot.cells {
            write_cell_on(&tx, cell)?;
        }

        let by_coord: HashMap<QuantizedCoordinate, &FieldExcitation> = snapshot
            .cells
            .iter()
            .map(|c| (c.coordinate, &c.excitation))
            .collect();
        let now = now_iso8601();
        for entity in &snapshot.entities {
            register_on(&tx, entity.id, "concept")?;
            let vacuum = FieldExcitation::vacuum();
            let excitation = by_coord.get(&entity.coordinate).copied().unwrap_or(&vacuum);
            let json = encode_excitation(excitation)?;
            let [v, a, e] = entity.coordinate.to_array();
            tx.execute(
                "INSERT INTO field_state (entity_id, coord_v, coord_a, coord_e, excitation, version, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)
                 ON CONFLICT(entity_id) DO UPDATE SET
                     coord_v = excluded.coord_v, coord_a = excluded.coord_a, coord_e = excluded.coord_e,
                     excitation = excluded.excitation, version = field_state.version + 1,
                     updated_at = excluded.updated_at",
                params![entity.id.to_string(), v, a, e, json, now],
            )?;
        }

        set_metadata_on(&tx, "snapshot_version", &snapshot.version.to_string())?;
        set_metadata_on(&tx, "time", &snapshot.time.to_string())?;
        set_metadata_on(&tx, "ticks", &snapshot.ticks.to_string())?;
        tx.commit()?;
        tracing::info!(
            cells = snapshot.cells.len(),
            entities = snapshot.entities.len(),
            "snapshot replaced"
        );
        Ok(())
    }

    /// Load the last saved snapshot. An empty database yields an empty field
    /// at time zero.
    pub fn load_snapshot(&self) -> Result<FieldSnapshot> {
        let time = self
            .get_metadata("time")?
            .map(|s| s.parse::<f64>())
            .transpose()
            .map_err(|e| StoreError::InvalidData(format!("invalid time: {e}")))?
            .unwrap_or(0.0);
        let ticks = self
            .get_metadata("ticks")?
            .map(|s| s.parse::<u64>())
            .transpose()
            .map_err(|e| StoreError::InvalidData(format!("invalid ticks: {e}")))?
            .unwrap_or(0);

        let mut stmt = self.conn.prepare(
            "SELECT coord_v, coord_a, coord_e, re_v, im_v, re_a, im_a, re_e, im_e,
                    phase, coupling_v, coupling_a, coupling_e,
                    velocity_v, velocity_a, velocity_e, vacuum, version
             FROM cells ORDER BY coord_v, coord_a, coord_e",
        )?;
        let cells = stmt
            .query_map([], |row| {
                let mut f = [0.0; 14];
                for (i, slot) in f.iter_mut().enumerate() {
                    *slot = row.get::<_, f64>(i + 3)?;
                }
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    f,
                    row.get::<_, i64>(17)?,
                ))
            })?
            .map(|r| {
                let (v, a, e, f, version) = r?;
                Ok(CellSnapshot {
                    coordinate: parse_coordinate(v, a, e)?,
                    excitation: FieldExcitation {
                        amplitudes: [
                            Complex64::new(f[0], f[1]),
                            Complex64::new(f[2], f[3]),
                            Complex64::new(f[4], f[5]),
                        ],
                        phase: f[6],
                        coupling: [f[7], f[8], f[9]],
                        velocity: [f[10], f[11], f[12]],
                        vacuum_energy: f[13],
                    },
                    version: version as u64,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut stmt = self.conn.prepare(
            "SELECT entity_id, coord_v, coord_a, coord_e, version FROM field_state ORDER BY entity_id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?
            .map(|r| {
                let (id, v, a, e, version) = r?;
                Ok((
                    EntitySnapshot {
                        id: parse_uuid(&id)?,
                        coordinate: parse_coordinate(v, a, e)?,
                    },
                    version as u64,
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        let baseline = SyncBaseline {
            cells: cells.iter().map(|c| (c.coordinate, c.version)).collect(),
            entities: rows.iter().map(|(e, version)| (e.id, *version)).collect(),
        };
        Ok(FieldSnapshot {
            version: SNAPSHOT_VERSION,
            time,
            ticks,
            cells,
            entities: rows.into_iter().map(|(e, _)| e).collect(),
            baseline,
        })
    }
}

fn set_metadata_on(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
        params![key, value],
    )?;
    Ok(())
}

fn register_on(conn: &Connection, id: Uuid, entity_type: &str) -> Result<bool> {
    let rows = conn.execute(
        "INSERT OR IGNORE INTO entities (id, entity_type, created_at) VALUES (?1, ?2, ?3)",
        params![id.to_string(), entity_type, now_iso8601()],
    )?;
    Ok(rows == 1)
}

fn write_field_state_on(
    conn: &Connection,
    entity_id: Uuid,
    coordinate: QuantizedCoordinate,
    excitation: &FieldExcitation,
    expected_version: u64,
) -> Result<u64> {
    let json = encode_excitation(excitation)?;
    let [v, a, e] = coordinate.to_array();
    match current_version_on(conn, entity_id)? {
        None if expected_version == 0 => {
            register_on(conn, entity_id, "concept")?;
            conn.execute(
                "INSERT INTO field_state (entity_id, coord_v, coord_a, coord_e, excitation, version, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)",
                params![entity_id.to_string(), v, a, e, json, now_iso8601()],
            )?;
            Ok(1)
        }
        Some(current) if current == expected_version => {
            let rows = conn.execute(
                "UPDATE field_state
                 SET coord_v = ?1, coord_a = ?2, coord_e = ?3, excitation = ?4,
                     version = version + 1, updated_at = ?5
                 WHERE entity_id = ?6 AND version = ?7",
                params![v, a, e, json, now_iso8601(), entity_id.to_string(), current as i64],
            )?;
            if rows != 1 {
                return Err(StoreError::Conflict {
                    entity_id,
                    expected: expected_version,
                    found: current_version_on(conn, entity_id)?.unwrap_or(0),
                });
            }
            Ok(current + 1)
        }
        other => Err(StoreError::Conflict {
            entity_id,
            expected: expected_version,
            found: other.unwrap_or(0),
        }),
    }
}

fn write_cell_on(conn: &Connection, cell: &CellSnapshot) -> Result<()> {
    let [v, a, e] = cell.coordinate.to_array();
    let ex = &cell.excitation;
    let z = ex.amplitudes;
    conn.execute(
        "INSERT OR REPLACE INTO cells (coord_v, coord_a, coord_e, re_v, im_v, re_a, im_a, re_e, im_e,
                                       phase, coupling_v, coupling_a, coupling_e,
                                       velocity_v, velocity_a, velocity_e, vacuum, version)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
        params![
            v,
            a,
            e,
            z[0].re,
            z[0].im,
            z[1].re,
            z[1].im,
            z[2].re,
            z[2].im,
            ex.phase,
            ex.coupling[0],
            ex.coupling[1],
            ex.coupling[2],
            ex.velocity[0],
            ex.velocity[1],
            ex.velocity[2],
            ex.vacuum_energy,
            cell.version as i64,
        ],
    )?;
    Ok(())
}

fn cell_version_on(conn: &Connection, coordinate: QuantizedCoordinate) -> Result<Option<u64>> {
    let [v, a, e] = coordinate.to_array();
    let version = conn
        .query_row(
            "SELECT version FROM cells WHERE coord_v = ?1 AND coord_a = ?2 AND coord_e = ?3",
            params![v, a, e],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;
    Ok(version.map(|v| v as u64))
}

fn current_version_on(conn: &Connection, entity_id: Uuid) -> Result<Option<u64>> {
    let version = conn
        .query_row(
            "SELECT version FROM field_state WHERE entity_id = ?1",
            [entity_id.to_string()],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;
    Ok(version.map(|v| v as u64))
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| StoreError::InvalidData(format!("invalid UUID '{s}': {e}")))
}

fn parse_coordinate(v: i64, a: i64, e: i64) -> Result<QuantizedCoordinate> {
    QuantizedCoordinate::new(v, a, e).map_err(|err| StoreError::InvalidData(err.to_string()))
}

fn encode_excitation(excitation: &FieldExcitation) -> Result<String> {
    serde_json::to_string(excitation)
        .map_err(|e| StoreError::InvalidData(format!("excitation encode failed: {e}")))
}

fn parse_excitation(json: &str) -> Result<FieldExcitation> {
    serde_json::from_str(json)
        .map_err(|e| StoreError::InvalidData(format!("invalid excitation: {e}")))
}
