use std::path::PathBuf;

use chrono::{DateTime, Utc};
use puck_common::{Error, Result, Snapshot};
use rusqlite::{OptionalExtension, Row};

use crate::{store_err, Store};

const SNAPSHOT_COLUMNS: &str = "id, puck_id, puck_name, name, path, size_bytes, created_at";

fn scan_snapshot(row: &Row<'_>) -> rusqlite::Result<Snapshot> {
    let path: String = row.get(4)?;
    let created_at: DateTime<Utc> = row.get(6)?;
    Ok(Snapshot {
        id: row.get(0)?,
        puck_id: row.get(1)?,
        puck_name: row.get(2)?,
        name: row.get(3)?,
        path: PathBuf::from(path),
        size_bytes: row.get(5)?,
        created_at,
    })
}

impl Store {
    pub async fn create_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let s = snapshot.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO snapshots
                        (id, puck_id, puck_name, name, path, size_bytes, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![
                        s.id,
                        s.puck_id,
                        s.puck_name,
                        s.name,
                        s.path.to_string_lossy().to_string(),
                        s.size_bytes,
                        s.created_at,
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(store_err)
    }

    pub async fn get_snapshot(&self, puck_id: &str, name: &str) -> Result<Snapshot> {
        let puck_id = puck_id.to_string();
        let name = name.to_string();
        let found = {
            let puck_id = puck_id.clone();
            let name = name.clone();
            self.conn
                .call(move |conn| {
                    let snapshot = conn
                        .query_row(
                            &format!(
                                "SELECT {SNAPSHOT_COLUMNS} FROM snapshots
                                 WHERE puck_id = ?1 AND name = ?2"
                            ),
                            [&puck_id, &name],
                            scan_snapshot,
                        )
                        .optional()?;
                    Ok(snapshot)
                })
                .await
                .map_err(store_err)?
        };
        found.ok_or_else(|| Error::NotFound(format!("snapshot '{name}'")))
    }

    /// All snapshots for one puck, newest first.
    pub async fn list_snapshots(&self, puck_id: &str) -> Result<Vec<Snapshot>> {
        let puck_id = puck_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SNAPSHOT_COLUMNS} FROM snapshots
                     WHERE puck_id = ?1 ORDER BY created_at DESC, rowid DESC"
                ))?;
                let snapshots = stmt
                    .query_map([&puck_id], scan_snapshot)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(snapshots)
            })
            .await
            .map_err(store_err)
    }

    pub async fn delete_snapshot(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM snapshots WHERE id = ?1", [&id])?;
                Ok(())
            })
            .await
            .map_err(store_err)
    }
}
