use parking_lot::Mutex;
use rusqlite::types::ValueRef;
use rusqlite::Connection;

use tessera_types::Error;

fn sql_err(e: rusqlite::Error) -> Error {
    Error::Storage(e.to_string())
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<ValueRef<'_>> for SqlValue {
    fn from(v: ValueRef<'_>) -> Self {
        match v {
            ValueRef::Null => SqlValue::Null,
            ValueRef::Integer(i) => SqlValue::Integer(i),
            ValueRef::Real(f) => SqlValue::Real(f),
            ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => SqlValue::Blob(b.to_vec()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
}

/// In-memory SQLite copy of the catalog.
///
/// Only committed SQL commands reach `execute`; the replica is rebuilt from
/// the log whenever the process starts or installs a snapshot.
pub struct SqlReplica {
    conn: Mutex<Connection>,
}

impl SqlReplica {
    pub fn open() -> Result<Self, Error> {
        Ok(SqlReplica { conn: Mutex::new(Connection::open_in_memory().map_err(sql_err)?) })
    }

    /// Drop all relational state.
    pub fn reset(&self) -> Result<(), Error> {
        *self.conn.lock() = Connection::open_in_memory().map_err(sql_err)?;
        Ok(())
    }

    /// Run one or more statements. The error is the SQLite message, meant for
    /// `CommandResponse::error_message`.
    pub fn execute(&self, query: &str) -> Result<(), String> {
        self.conn.lock().execute_batch(query).map_err(|e| e.to_string())
    }

    /// Run a read-only statement against this replica. Anything that would
    /// write is refused; writes replicate through `exec`.
    pub fn query(&self, sql: &str) -> Result<QueryResult, Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql).map_err(sql_err)?;
        if !stmt.readonly() {
            return Err(Error::InvalidArgument(
                "query only runs read-only statements; use exec for writes".into(),
            ));
        }
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let width = columns.len();

        let mut rows = stmt.query([]).map_err(sql_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(sql_err)? {
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                values.push(SqlValue::from(row.get_ref(i).map_err(sql_err)?));
            }
            out.push(values);
        }
        Ok(QueryResult { columns, rows: out })
    }
}
