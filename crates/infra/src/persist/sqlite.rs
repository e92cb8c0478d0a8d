//! SQLite-backed event table.
//!
//! The table trait is synchronous while sqlx is async. The table owns a
//! private current-thread tokio runtime and drives every query with
//! `block_on`, so callers must not be inside an async context (the worker is
//! a plain OS thread; async callers go through `spawn_blocking`).
//!
//! ## Error Mapping
//!
//! | SQLx Error | PersistError |
//! |------------|--------------|
//! | Database (any code) | `Storage` |
//! | ColumnDecode / ColumnNotFound / Decode | `Decode` |
//! | PoolClosed / PoolTimedOut | `Storage` |
//! | Other | `Storage` |

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tokio::runtime::Runtime;
use tracing::{debug, instrument};

use eventproc_core::{DataId, EventKind, EventParams, Priority};

use super::{EventRow, EventTable, PersistError, table_name};

/// Rows per multi-row INSERT. Seven binds per row keeps each statement well
/// below SQLite's bind-parameter limit.
const INSERT_CHUNK: usize = 100;

const COLUMNS: &str =
    "dataId, dataIdHash, eventTime, eventUser, eventType, eventPriority, eventParams";

#[derive(Debug)]
pub struct SqliteEventTable {
    runtime: Runtime,
    pool: SqlitePool,
    table: String,
}

impl SqliteEventTable {
    /// Open (or create) the database at `database_url` for one processor.
    ///
    /// `sqlite::memory:` is supported; the pool is then pinned to a single
    /// connection that never expires, since every connection would otherwise
    /// see its own empty database.
    pub fn connect(database_url: &str, processor: &str) -> Result<Self, PersistError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| PersistError::Storage(format!("failed to create runtime: {e}")))?;

        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| map_sqlx_error("parse_url", e))?
            .create_if_missing(true);

        let in_memory = database_url.contains(":memory:");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new()
                .max_connections(4)
                .acquire_timeout(Duration::from_secs(10))
        };

        let pool = runtime
            .block_on(pool_options.connect_with(options))
            .map_err(|e| map_sqlx_error("connect", e))?;

        debug!(processor, database_url, "connected event table");
        Ok(Self {
            runtime,
            pool,
            table: table_name(processor),
        })
    }

    async fn insert_rows(&self, rows: &[EventRow]) -> Result<(), PersistError> {
        for chunk in rows.chunks(INSERT_CHUNK) {
            let mut builder: QueryBuilder<'_, Sqlite> =
                QueryBuilder::new(format!("INSERT INTO \"{}\" ({COLUMNS}) ", self.table));
            builder.push_values(chunk, |mut b, row| {
                b.push_bind(row.data_id.as_str().to_owned())
                    .push_bind(row.data_id_hash)
                    .push_bind(row.event_time)
                    .push_bind(row.stored_user().to_owned())
                    .push_bind(row.kind.code().to_string())
                    .push_bind(row.priority.code().to_string())
                    .push_bind(row.params.to_storage());
            });
            builder
                .build()
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("insert_batch", e))?;
        }
        Ok(())
    }
}

impl EventTable for SqliteEventTable {
    fn table(&self) -> &str {
        &self.table
    }

    #[instrument(skip(self), fields(table = %self.table), err)]
    fn ensure_schema(&self) -> Result<(), PersistError> {
        let t = &self.table;
        let statements = [
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS "{t}" (
                    dataId VARCHAR(32) NOT NULL,
                    dataIdHash INTEGER NOT NULL,
                    eventTime BIGINT NOT NULL,
                    eventUser VARCHAR(32) NOT NULL,
                    eventType CHAR(1) NOT NULL,
                    eventPriority CHAR(1) NOT NULL,
                    eventParams BIGINT NOT NULL
                )
                "#
            ),
            format!(r#"CREATE INDEX IF NOT EXISTS "{t}_dataId" ON "{t}" (dataId)"#),
            format!(r#"CREATE INDEX IF NOT EXISTS "{t}_dataIdHash" ON "{t}" (dataIdHash)"#),
        ];

        self.runtime.block_on(async {
            for sql in &statements {
                sqlx::query(sql)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| PersistError::Schema(format!("{t}: {e}")))?;
            }
            Ok(())
        })
    }

    fn insert_batch(&self, rows: &[EventRow]) -> Result<(), PersistError> {
        if rows.is_empty() {
            return Ok(());
        }
        self.runtime.block_on(self.insert_rows(rows))
    }

    fn update(&self, row: &EventRow) -> Result<u64, PersistError> {
        let sql = format!(
            r#"
            UPDATE "{}"
            SET eventUser = ?, eventType = ?, eventPriority = ?, eventParams = ?
            WHERE dataIdHash = ? AND dataId = ? AND eventTime = ?
            "#,
            self.table
        );
        self.runtime.block_on(async {
            let result = sqlx::query(&sql)
                .bind(row.stored_user())
                .bind(row.kind.code().to_string())
                .bind(row.priority.code().to_string())
                .bind(row.params.to_storage())
                .bind(row.data_id_hash)
                .bind(row.data_id.as_str())
                .bind(row.event_time)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("update", e))?;
            Ok(result.rows_affected())
        })
    }

    fn delete_for(&self, data_id: &DataId) -> Result<u64, PersistError> {
        let sql = format!(
            r#"DELETE FROM "{}" WHERE dataIdHash = ? AND dataId = ?"#,
            self.table
        );
        self.runtime.block_on(async {
            let result = sqlx::query(&sql)
                .bind(data_id.hash_code())
                .bind(data_id.as_str())
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("delete_for", e))?;
            Ok(result.rows_affected())
        })
    }

    fn delete_exact(&self, data_id: &DataId, event_time: i64) -> Result<u64, PersistError> {
        let sql = format!(
            r#"DELETE FROM "{}" WHERE dataIdHash = ? AND dataId = ? AND eventTime = ?"#,
            self.table
        );
        self.runtime.block_on(async {
            let result = sqlx::query(&sql)
                .bind(data_id.hash_code())
                .bind(data_id.as_str())
                .bind(event_time)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("delete_exact", e))?;
            Ok(result.rows_affected())
        })
    }

    #[instrument(skip(self), fields(table = %self.table), err)]
    fn load_all(&self) -> Result<Vec<EventRow>, PersistError> {
        let sql = format!(
            r#"SELECT {COLUMNS} FROM "{}" ORDER BY eventTime ASC"#,
            self.table
        );
        let rows = self.runtime.block_on(async {
            sqlx::query(&sql)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("load_all", e))
        })?;
        rows.iter().map(decode_row).collect()
    }
}

fn decode_row(row: &SqliteRow) -> Result<EventRow, PersistError> {
    let get_str = |column: &str| -> Result<String, PersistError> {
        row.try_get::<String, _>(column)
            .map_err(|e| map_sqlx_error("decode", e))
    };
    let single_char = |column: &str| -> Result<char, PersistError> {
        let value = get_str(column)?;
        let mut chars = value.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Ok(c),
            _ => Err(PersistError::Decode(format!(
                "{column}: expected one character, got '{value}'"
            ))),
        }
    };

    let data_id = DataId::new(get_str("dataId")?)
        .map_err(|e| PersistError::Decode(e.to_string()))?;
    let kind = EventKind::from_code(single_char("eventType")?)
        .map_err(|e| PersistError::Decode(e.to_string()))?;
    let priority = Priority::from_code(single_char("eventPriority")?)
        .map_err(|e| PersistError::Decode(e.to_string()))?;
    let event_time: i64 = row
        .try_get("eventTime")
        .map_err(|e| map_sqlx_error("decode", e))?;
    let data_id_hash: i32 = row
        .try_get("dataIdHash")
        .map_err(|e| map_sqlx_error("decode", e))?;
    let params: i64 = row
        .try_get("eventParams")
        .map_err(|e| map_sqlx_error("decode", e))?;

    Ok(EventRow {
        data_id,
        data_id_hash,
        event_time,
        user: EventRow::user_from_storage(get_str("eventUser")?),
        kind,
        priority,
        params: EventParams::from_storage(params),
    })
}

/// Map SQLx errors to PersistError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> PersistError {
    match err {
        sqlx::Error::Database(db_err) => PersistError::Storage(format!(
            "database error in {operation}: {}",
            db_err.message()
        )),
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::Decode(_) => {
            PersistError::Decode(format!("{operation}: {err}"))
        }
        sqlx::Error::PoolClosed => {
            PersistError::Storage(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::PoolTimedOut => {
            PersistError::Storage(format!("timed out acquiring connection in {operation}"))
        }
        _ => PersistError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}
