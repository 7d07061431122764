use rusqlite::types::ValueRef;
use rusqlite::{params, params_from_iter, Connection};
use serde_json::{Map, Value as JsonValue};
use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::{self, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Field, Query, Row, StorageConfig};
use crate::error::{StorageError, StorageResult};
use crate::metrics::{INSERT_ERRORS_TOTAL, RECORDS_STORED_TOTAL};

/// Maximum number of queued inserts before `write` applies backpressure.
pub(crate) const INSERT_QUEUE_CAPACITY: usize = 256;

/// System-managed row identifier present in every stream table.
pub const CURSOR_COLUMN: &str = "_cursor";

/// Columns with this prefix belong to the storage engine and are never migrated.
const INTERNAL_COLUMN_PREFIX: &str = "_";

type SharedConnection = Arc<Mutex<Option<Connection>>>;

#[derive(Debug)]
struct InsertTask {
    table: String,
    row: Row,
}

/// Alterations performed by one [`SqliteStorage::migrate`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Migration {
    pub created: bool,
    pub dropped: Vec<String>,
    pub added: Vec<String>,
}

impl Migration {
    pub fn is_noop(&self) -> bool {
        !self.created && self.dropped.is_empty() && self.added.is_empty()
    }
}

/// SQLite storage with one connection and one background writer.
///
/// All inserts go through a bounded FIFO queue drained by a single task, so rows reach the
/// database in the order they were queued and no two inserts race on the connection.
/// Migrations and queries share the same connection.
#[derive(Debug)]
pub struct SqliteStorage {
    conn: SharedConnection,
    insert_tx: mpsc::Sender<InsertTask>,
    cancel_token: CancellationToken,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl SqliteStorage {
    /// Open the database and start the writer task. Must be called within a tokio runtime.
    pub fn open(config: &StorageConfig) -> StorageResult<Self> {
        let conn = open_connection(config)?;
        let conn: SharedConnection = Arc::new(Mutex::new(Some(conn)));

        let (insert_tx, insert_rx) = mpsc::channel(INSERT_QUEUE_CAPACITY);
        let cancel_token = CancellationToken::new();
        let writer = tokio::spawn(run_writer(conn.clone(), insert_rx, cancel_token.clone()));

        info!(path = %config.path, journal_mode = %config.journal_mode, "storage opened");

        Ok(Self {
            conn,
            insert_tx,
            cancel_token,
            writer: Mutex::new(Some(writer)),
        })
    }

    /// Create or alter `name` so its columns match `fields`.
    ///
    /// A column whose declared type changed is dropped and re-added, losing its data.
    pub async fn migrate(&self, name: &str, fields: &[Field]) -> StorageResult<Migration> {
        validate_identifier(name)?;
        for field in fields {
            validate_identifier(&field.name)?;
        }

        let conn = self.conn.clone();
        let table = name.to_string();
        let fields = fields.to_vec();
        let migration = task::spawn_blocking(move || {
            let mut guard = lock(&conn)?;
            let conn = guard.as_mut().ok_or(StorageError::Closed)?;
            migrate_table(conn, &table, &fields)
        })
        .await??;

        if migration.is_noop() {
            debug!(table = name, "schema already up to date");
        } else {
            info!(
                table = name,
                created = migration.created,
                dropped = ?migration.dropped,
                added = ?migration.added,
                "schema migrated"
            );
        }
        Ok(migration)
    }

    /// Queue `row` for insertion into `name`.
    ///
    /// Waits only while the queue is full. Insert failures are logged by the writer, never
    /// returned here.
    pub async fn write(&self, name: &str, row: Row) -> StorageResult<()> {
        let task = InsertTask {
            table: name.to_string(),
            row,
        };
        self.insert_tx
            .send(task)
            .await
            .map_err(|_| StorageError::Closed)
    }

    /// Write the rows of `name` selected by `query` to `sink` as newline-delimited JSON.
    ///
    /// Returns the number of rows written.
    pub async fn query<W: Write>(
        &self,
        name: &str,
        query: &Query,
        sink: &mut W,
    ) -> StorageResult<usize> {
        validate_identifier(name)?;

        let conn = self.conn.clone();
        let table = name.to_string();
        let query = query.clone();
        let rows = task::spawn_blocking(move || {
            let guard = lock(&conn)?;
            let conn = guard.as_ref().ok_or(StorageError::Closed)?;
            select_rows(conn, &table, &query)
        })
        .await??;

        for row in &rows {
            serde_json::to_writer(&mut *sink, row)?;
            sink.write_all(b"\n")?;
        }
        sink.flush()?;
        Ok(rows.len())
    }

    /// Stop the writer and close the connection.
    ///
    /// Rows still queued when this is called may be discarded.
    pub async fn close(&self) -> StorageResult<()> {
        self.cancel_token.cancel();

        let writer = self
            .writer
            .lock()
            .map_err(|_| StorageError::Poisoned)?
            .take();
        if let Some(writer) = writer {
            if let Err(err) = writer.await {
                warn!(error = %err, "storage writer exited abnormally");
            }
        }

        let conn = lock(&self.conn)?.take();
        if let Some(conn) = conn {
            conn.close().map_err(|(_, err)| StorageError::Sqlite(err))?;
            info!("storage closed");
        }
        Ok(())
    }
}

impl Drop for SqliteStorage {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

fn lock(conn: &SharedConnection) -> StorageResult<MutexGuard<'_, Option<Connection>>> {
    conn.lock().map_err(|_| StorageError::Poisoned)
}

fn open_connection(config: &StorageConfig) -> StorageResult<Connection> {
    // Paths such as ":memory:" are not files.
    if !config.path.starts_with(':') {
        if let Some(parent) = Path::new(&config.path)
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
        {
            std::fs::create_dir_all(parent)?;
        }
    }

    let conn = Connection::open(&config.path)?;
    conn.pragma_update(None, "foreign_keys", "OFF")?;
    conn.pragma_update(None, "journal_mode", &config.journal_mode)?;
    conn.pragma_update(None, "synchronous", &config.synchronous)?;
    conn.pragma_update(None, "cache_size", config.cache_size)?;
    Ok(conn)
}

async fn run_writer(
    conn: SharedConnection,
    mut insert_rx: mpsc::Receiver<InsertTask>,
    cancel_token: CancellationToken,
) {
    loop {
        let task = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => break,
            task = insert_rx.recv() => match task {
                Some(task) => task,
                None => break,
            },
        };

        let conn = conn.clone();
        let table = task.table.clone();
        let result = task::spawn_blocking(move || {
            let guard = lock(&conn)?;
            let conn = guard.as_ref().ok_or(StorageError::Closed)?;
            insert_row(conn, &task.table, &task.row)
        })
        .await;

        match result {
            Ok(Ok(())) => RECORDS_STORED_TOTAL.inc(),
            Ok(Err(err)) => {
                INSERT_ERRORS_TOTAL.inc();
                error!(table = %table, error = %err, "failed to insert record; dropping");
            }
            Err(err) => {
                INSERT_ERRORS_TOTAL.inc();
                error!(table = %table, error = %err, "insert task panicked; dropping record");
            }
        }
    }

    debug!("storage writer stopped");
}

fn validate_identifier(name: &str) -> StorageResult<()> {
    if name.is_empty() || name.contains('\0') {
        return Err(StorageError::InvalidIdentifier(name.to_string()));
    }
    Ok(())
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn table_exists(conn: &Connection, name: &str) -> StorageResult<bool> {
    let exists = conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![name],
        |row| row.get::<_, bool>(0),
    )?;
    Ok(exists)
}

/// Current non-internal columns of `name` with their declared types.
fn table_columns(conn: &Connection, name: &str) -> StorageResult<BTreeMap<String, String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(name)))?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(1)?, row.get::<_, String>(2)?))
    })?;

    let mut columns = BTreeMap::new();
    for row in rows {
        let (column, column_type) = row?;
        if column.starts_with(INTERNAL_COLUMN_PREFIX) {
            continue;
        }
        columns.insert(column, column_type);
    }
    Ok(columns)
}

fn create_table(conn: &Connection, name: &str, fields: &[(&str, &str)]) -> StorageResult<()> {
    let mut columns = vec![format!(
        "{} INTEGER PRIMARY KEY AUTOINCREMENT",
        quote_ident(CURSOR_COLUMN)
    )];
    columns.extend(
        fields
            .iter()
            .map(|(field, column_type)| format!("{} {column_type}", quote_ident(field))),
    );

    conn.execute_batch(&format!(
        "CREATE TABLE {} ({})",
        quote_ident(name),
        columns.join(", ")
    ))?;
    Ok(())
}

fn migrate_table(conn: &mut Connection, name: &str, fields: &[Field]) -> StorageResult<Migration> {
    // Declaration order, first occurrence of each name wins.
    let mut seen = HashSet::new();
    let desired: Vec<(&str, &str)> = fields
        .iter()
        .filter(|field| seen.insert(field.name.as_str()))
        .map(|field| (field.name.as_str(), field.field_type.column_type()))
        .collect();

    let tx = conn.transaction()?;
    let mut migration = Migration::default();

    if !table_exists(&tx, name)? {
        create_table(&tx, name, &desired)?;
        tx.commit()?;
        migration.created = true;
        return Ok(migration);
    }

    let mut current = table_columns(&tx, name)?;
    let desired_types: BTreeMap<&str, &str> = desired.iter().copied().collect();

    let stale: Vec<String> = current
        .iter()
        .filter(|(column, column_type)| match desired_types.get(column.as_str()) {
            Some(desired_type) => !column_type.eq_ignore_ascii_case(desired_type),
            None => true,
        })
        .map(|(column, _)| column.clone())
        .collect();

    for column in stale {
        tx.execute_batch(&format!(
            "ALTER TABLE {} DROP COLUMN {}",
            quote_ident(name),
            quote_ident(&column)
        ))?;
        current.remove(&column);
        migration.dropped.push(column);
    }

    for (column, column_type) in &desired {
        if current.contains_key(*column) {
            continue;
        }
        tx.execute_batch(&format!(
            "ALTER TABLE {} ADD COLUMN {} {column_type}",
            quote_ident(name),
            quote_ident(column)
        ))?;
        migration.added.push(column.to_string());
    }

    tx.commit()?;
    Ok(migration)
}

fn insert_row(conn: &Connection, table: &str, row: &Row) -> StorageResult<()> {
    if row.is_empty() {
        conn.execute(&format!("INSERT INTO {} DEFAULT VALUES", quote_ident(table)), [])?;
        return Ok(());
    }

    let columns: Vec<String> = row.keys().map(|column| quote_ident(column)).collect();
    let placeholders: Vec<String> = (1..=row.len()).map(|idx| format!("?{idx}")).collect();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(table),
        columns.join(", "),
        placeholders.join(", ")
    );

    conn.prepare_cached(&sql)?
        .execute(params_from_iter(row.values()))?;
    Ok(())
}

fn select_rows(
    conn: &Connection,
    table: &str,
    query: &Query,
) -> StorageResult<Vec<Map<String, JsonValue>>> {
    let sql = format!(
        "SELECT * FROM {} WHERE {} > ?1 ORDER BY {} LIMIT ?2",
        quote_ident(table),
        quote_ident(CURSOR_COLUMN),
        quote_ident(CURSOR_COLUMN)
    );
    let after = query.after_cursor.unwrap_or(i64::MIN);
    let limit = query
        .limit
        .map(|limit| i64::try_from(limit).unwrap_or(i64::MAX))
        .unwrap_or(-1);

    let mut stmt = conn.prepare(&sql)?;
    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt.query(params![after, limit])?;

    let mut selected = Vec::new();
    while let Some(row) = rows.next()? {
        let mut object = Map::with_capacity(names.len());
        for (idx, name) in names.iter().enumerate() {
            object.insert(name.clone(), json_value(row.get_ref(idx)?));
        }
        selected.push(object);
    }
    Ok(selected)
}

fn json_value(value: ValueRef<'_>) -> JsonValue {
    match value {
        ValueRef::Null => JsonValue::Null,
        ValueRef::Integer(v) => JsonValue::from(v),
        ValueRef::Real(v) => serde_json::Number::from_f64(v)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            JsonValue::String(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}
