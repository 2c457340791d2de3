use std::path::PathBuf;

use chrono::{DateTime, Utc};
use puck_common::{Error, Puck, Result, Status};
use rusqlite::{OptionalExtension, Row};

use crate::{store_err, Store};

const PUCK_COLUMNS: &str =
    "id, name, image, status, volume_dir, ports, host_port, container_ip, created_at, updated_at";

fn scan_puck(row: &Row<'_>) -> rusqlite::Result<Puck> {
    let status: String = row.get(3)?;
    let volume_dir: String = row.get(4)?;
    let ports_json: String = row.get(5)?;
    let host_port: i64 = row.get(6)?;
    let container_ip: Option<String> = row.get(7)?;
    let created_at: DateTime<Utc> = row.get(8)?;
    let updated_at: DateTime<Utc> = row.get(9)?;

    Ok(Puck {
        id: row.get(0)?,
        name: row.get(1)?,
        image: row.get(2)?,
        status: Status::parse(&status),
        volume_dir: PathBuf::from(volume_dir),
        ports: serde_json::from_str(&ports_json).unwrap_or_default(),
        host_port: host_port as u16,
        container_ip: container_ip.unwrap_or_default(),
        created_at,
        updated_at,
    })
}

impl Store {
    pub async fn create_puck(&self, puck: &Puck) -> Result<()> {
        let p = puck.clone();
        self.conn
            .call(move |conn| {
                let ports_json = serde_json::to_string(&p.ports).unwrap_or_else(|_| "[]".into());
                conn.execute(
                    "INSERT INTO pucks
                        (id, name, image, status, volume_dir, ports, host_port, container_ip,
                         created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    rusqlite::params![
                        p.id,
                        p.name,
                        p.image,
                        p.status.as_str(),
                        p.volume_dir.to_string_lossy().to_string(),
                        ports_json,
                        p.host_port,
                        p.container_ip,
                        p.created_at,
                        p.updated_at,
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(store_err)
    }

    pub async fn get_puck(&self, name: &str) -> Result<Puck> {
        let name = name.to_string();
        let found = {
            let name = name.clone();
            self.conn
                .call(move |conn| {
                    let puck = conn
                        .query_row(
                            &format!("SELECT {PUCK_COLUMNS} FROM pucks WHERE name = ?1"),
                            [&name],
                            scan_puck,
                        )
                        .optional()?;
                    Ok(puck)
                })
                .await
                .map_err(store_err)?
        };
        found.ok_or_else(|| Error::NotFound(format!("puck '{name}'")))
    }

    pub async fn get_puck_by_id(&self, id: &str) -> Result<Puck> {
        let id = id.to_string();
        let found = {
            let id = id.clone();
            self.conn
                .call(move |conn| {
                    let puck = conn
                        .query_row(
                            &format!("SELECT {PUCK_COLUMNS} FROM pucks WHERE id = ?1"),
                            [&id],
                            scan_puck,
                        )
                        .optional()?;
                    Ok(puck)
                })
                .await
                .map_err(store_err)?
        };
        found.ok_or_else(|| Error::NotFound(format!("puck id '{id}'")))
    }

    /// All pucks, newest first.
    pub async fn list_pucks(&self) -> Result<Vec<Puck>> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {PUCK_COLUMNS} FROM pucks ORDER BY created_at DESC, rowid DESC"
                ))?;
                let pucks = stmt
                    .query_map([], scan_puck)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(pucks)
            })
            .await
            .map_err(store_err)
    }

    pub async fn update_status(&self, name: &str, status: Status) -> Result<()> {
        let name = name.to_string();
        let rows = {
            let name = name.clone();
            self.conn
                .call(move |conn| {
                    let rows = conn.execute(
                        "UPDATE pucks SET status = ?1, updated_at = ?2 WHERE name = ?3",
                        rusqlite::params![status.as_str(), Utc::now(), name],
                    )?;
                    Ok(rows)
                })
                .await
                .map_err(store_err)?
        };
        if rows == 0 {
            return Err(Error::NotFound(format!("puck '{name}'")));
        }
        Ok(())
    }

    pub async fn update_container_ip(&self, name: &str, ip: &str) -> Result<()> {
        let name = name.to_string();
        let ip = ip.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE pucks SET container_ip = ?1, updated_at = ?2 WHERE name = ?3",
                    rusqlite::params![ip, Utc::now(), name],
                )?;
                Ok(())
            })
            .await
            .map_err(store_err)
    }

    /// Rewrite a puck's runtime id after a restore, marking it running and
    /// refreshing the container IP in the same statement. The snapshot FK
    /// cascades on the id change.
    pub async fn update_runtime_id(
        &self,
        old_id: &str,
        new_id: &str,
        ip: Option<String>,
    ) -> Result<()> {
        let old_id = old_id.to_string();
        let new_id = new_id.to_string();
        let rows = {
            let old_id = old_id.clone();
            self.conn
                .call(move |conn| {
                    let rows = conn.execute(
                        "UPDATE pucks
                         SET id = ?1, status = ?2,
                             container_ip = COALESCE(?3, container_ip),
                             updated_at = ?4
                         WHERE id = ?5",
                        rusqlite::params![
                            new_id,
                            Status::Running.as_str(),
                            ip,
                            Utc::now(),
                            old_id
                        ],
                    )?;
                    Ok(rows)
                })
                .await
                .map_err(store_err)?
        };
        if rows == 0 {
            return Err(Error::NotFound(format!("puck id '{old_id}'")));
        }
        Ok(())
    }

    /// Delete a puck row; snapshot rows go with it via the FK cascade.
    pub async fn delete_puck(&self, name: &str) -> Result<()> {
        let name = name.to_string();
        let rows = {
            let name = name.clone();
            self.conn
                .call(move |conn| {
                    let rows = conn.execute("DELETE FROM pucks WHERE name = ?1", [&name])?;
                    Ok(rows)
                })
                .await
                .map_err(store_err)?
        };
        if rows == 0 {
            return Err(Error::NotFound(format!("puck '{name}'")));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_puck(name: &str) -> Puck {
        let now = Utc::now();
        Puck {
            id: format!("id-{name}"),
            name: name.to_string(),
            image: "fedora:latest".to_string(),
            status: Status::Running,
            volume_dir: PathBuf::from(format!("/data/pucks/{name}")),
            ports: vec!["8080:80".to_string()],
            host_port: 9000,
            container_ip: "10.88.0.2".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn create_and_get_roundtrip() {
        let store = Store::open_in_memory().await.unwrap();
        let p = sample_puck("web");
        store.create_puck(&p).await.unwrap();

        let got = store.get_puck("web").await.unwrap();
        assert_eq!(got.id, p.id);
        assert_eq!(got.image, "fedora:latest");
        assert_eq!(got.status, Status::Running);
        assert_eq!(got.ports, vec!["8080:80".to_string()]);
        assert_eq!(got.host_port, 9000);
        assert_eq!(got.container_ip, "10.88.0.2");

        let by_id = store.get_puck_by_id(&p.id).await.unwrap();
        assert_eq!(by_id.name, "web");
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let store = Store::open_in_memory().await.unwrap();
        let err = store.get_puck("ghost").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)), "got {err}");
    }

    #[tokio::test]
    async fn duplicate_name_is_already_exists() {
        let store = Store::open_in_memory().await.unwrap();
        store.create_puck(&sample_puck("dup")).await.unwrap();

        let mut second = sample_puck("dup");
        second.id = "other-id".to_string();
        second.host_port = 9001;
        let err = store.create_puck(&second).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)), "got {err}");
    }

    #[tokio::test]
    async fn list_is_newest_first() {
        let store = Store::open_in_memory().await.unwrap();
        for (i, name) in ["oldest", "middle", "newest"].iter().enumerate() {
            let mut p = sample_puck(name);
            p.id = format!("id-{name}");
            p.host_port = 9000 + i as u16;
            p.created_at = Utc::now() + chrono::Duration::seconds(i as i64);
            p.updated_at = p.created_at;
            store.create_puck(&p).await.unwrap();
        }

        let names: Vec<String> = store
            .list_pucks()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, ["newest", "middle", "oldest"]);
    }

    #[tokio::test]
    async fn status_updates_touch_updated_at() {
        let store = Store::open_in_memory().await.unwrap();
        let p = sample_puck("s");
        store.create_puck(&p).await.unwrap();

        store.update_status("s", Status::Stopped).await.unwrap();
        let got = store.get_puck("s").await.unwrap();
        assert_eq!(got.status, Status::Stopped);
        assert!(got.updated_at >= p.updated_at);

        let err = store
            .update_status("ghost", Status::Stopped)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn runtime_id_rewrite_marks_running() {
        let store = Store::open_in_memory().await.unwrap();
        let mut p = sample_puck("r");
        p.status = Status::Checkpointed;
        store.create_puck(&p).await.unwrap();

        store
            .update_runtime_id(&p.id, "fresh-id", Some("10.88.0.9".into()))
            .await
            .unwrap();

        let got = store.get_puck("r").await.unwrap();
        assert_eq!(got.id, "fresh-id");
        assert_eq!(got.status, Status::Running);
        assert_eq!(got.container_ip, "10.88.0.9");

        // Missing IP keeps the previous value.
        store
            .update_runtime_id("fresh-id", "fresher-id", None)
            .await
            .unwrap();
        let got = store.get_puck("r").await.unwrap();
        assert_eq!(got.id, "fresher-id");
        assert_eq!(got.container_ip, "10.88.0.9");
    }

    #[tokio::test]
    async fn delete_puck_removes_row() {
        let store = Store::open_in_memory().await.unwrap();
        store.create_puck(&sample_puck("gone")).await.unwrap();
        store.delete_puck("gone").await.unwrap();

        assert!(matches!(
            store.get_puck("gone").await.unwrap_err(),
            Error::NotFound(_)
        ));
        assert!(matches!(
            store.delete_puck("gone").await.unwrap_err(),
            Error::NotFound(_)
        ));
    }
}
