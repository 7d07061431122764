use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::task;

/// Durable per-file progress: the byte offset up to which a file has been processed.
///
/// Tailers read the offset once when they start and write it back after every tail pass, so
/// implementations must tolerate concurrent calls for different paths.
#[async_trait]
pub trait OffsetStore: Send + Sync {
    /// Return the stored offset for `file_path`, or 0 if none was recorded.
    async fn get_offset(&self, file_path: &Path) -> Result<u64>;

    async fn set_offset(&self, file_path: &Path, offset: u64) -> Result<()>;
}

/// SQLite-backed offset store.
#[derive(Debug, Clone)]
pub struct CheckpointDB {
    path: Arc<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct CheckpointRecord {
    pub file_path: PathBuf,
    pub byte_offset: u64,
    pub updated_at: i64,
}

impl CheckpointDB {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create checkpoint directory {}", parent.display())
            })?;
        }

        let conn = open_connection(&path)?;
        initialize_schema(&conn)?;

        Ok(Self {
            path: Arc::new(path),
        })
    }

    pub async fn get(&self, file_path: &Path) -> Result<Option<CheckpointRecord>> {
        let db_path = self.path.clone();
        let path = normalize_path(file_path);
        task::spawn_blocking(move || {
            let conn = open_connection(&db_path)?;
            let mut stmt = conn
                .prepare(
                    "
                    SELECT file_path, byte_offset, updated_at
                    FROM checkpoints
                    WHERE file_path = ?1
                    ",
                )
                .context("failed to prepare checkpoint select statement")?;

            let record = stmt
                .query_row(params![path], |row| {
                    let file_path: String = row.get(0)?;
                    Ok(CheckpointRecord {
                        file_path: PathBuf::from(file_path),
                        byte_offset: row.get::<_, i64>(1)? as u64,
                        updated_at: row.get::<_, i64>(2)?,
                    })
                })
                .optional()
                .context("failed to query checkpoint table")?;

            Ok::<_, anyhow::Error>(record)
        })
        .await
        .context("checkpoint get join error")?
    }
}

#[async_trait]
impl OffsetStore for CheckpointDB {
    async fn get_offset(&self, file_path: &Path) -> Result<u64> {
        Ok(self
            .get(file_path)
            .await?
            .map(|rec| rec.byte_offset)
            .unwrap_or(0))
    }

    async fn set_offset(&self, file_path: &Path, offset: u64) -> Result<()> {
        let db_path = self.path.clone();
        let path = normalize_path(file_path);
        let timestamp = current_timestamp();
        task::spawn_blocking(move || {
            let conn = open_connection(&db_path)?;
            conn.execute(
                "
                INSERT INTO checkpoints (file_path, byte_offset, updated_at)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(file_path) DO UPDATE SET
                    byte_offset = excluded.byte_offset,
                    updated_at = excluded.updated_at
                ",
                params![path, offset as i64, timestamp],
            )
            .context("failed to upsert checkpoint record")?;
            Ok::<_, anyhow::Error>(())
        })
        .await
        .context("checkpoint set join error")??;

        Ok(())
    }
}

/// In-process offset store, used where persistence across restarts is not wanted.
#[derive(Debug, Default)]
pub struct MemoryOffsetStore {
    offsets: Mutex<HashMap<PathBuf, u64>>,
}

impl MemoryOffsetStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OffsetStore for MemoryOffsetStore {
    async fn get_offset(&self, file_path: &Path) -> Result<u64> {
        let offsets = self
            .offsets
            .lock()
            .map_err(|_| anyhow::anyhow!("offset map lock poisoned"))?;
        Ok(offsets.get(file_path).copied().unwrap_or(0))
    }

    async fn set_offset(&self, file_path: &Path, offset: u64) -> Result<()> {
        let mut offsets = self
            .offsets
            .lock()
            .map_err(|_| anyhow::anyhow!("offset map lock poisoned"))?;
        offsets.insert(file_path.to_path_buf(), offset);
        Ok(())
    }
}

fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("failed to open checkpoint db {}", path.display()))?;

    conn.pragma_update(None, "journal_mode", "WAL")
        .context("failed to enable WAL mode for checkpoint db")?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .context("failed to set checkpoint db synchronous mode")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .context("failed to set checkpoint db busy timeout")?;

    Ok(conn)
}

fn initialize_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS checkpoints (
            file_path TEXT PRIMARY KEY,
            byte_offset INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        ",
    )
    .context("failed to create checkpoints table")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_checkpoint_reads_as_zero() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = CheckpointDB::new(dir.path().join("state/offsets.db")).expect("open db");

        let offset = db
            .get_offset(Path::new("/var/log/app.log"))
            .await
            .expect("get offset");
        assert_eq!(offset, 0);
    }

    #[tokio::test]
    async fn offsets_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("offsets.db");
        let log_a = Path::new("/var/log/a.log");
        let log_b = Path::new("/var/log/b.log");

        {
            let db = CheckpointDB::new(&db_path).expect("open db");
            db.set_offset(log_a, 42).await.expect("set a");
            db.set_offset(log_b, 7).await.expect("set b");
            db.set_offset(log_a, 128).await.expect("update a");
        }

        let db = CheckpointDB::new(&db_path).expect("reopen db");
        assert_eq!(db.get_offset(log_a).await.expect("get a"), 128);
        assert_eq!(db.get_offset(log_b).await.expect("get b"), 7);

        let record = db.get(log_a).await.expect("get record").expect("record exists");
        assert_eq!(record.file_path, log_a);
        assert!(record.updated_at > 0);
    }

    #[tokio::test]
    async fn memory_store_tracks_paths_independently() {
        let store = MemoryOffsetStore::new();
        store.set_offset(Path::new("/a"), 10).await.expect("set");
        assert_eq!(store.get_offset(Path::new("/a")).await.expect("get"), 10);
        assert_eq!(store.get_offset(Path::new("/b")).await.expect("get"), 0);
    }
}
