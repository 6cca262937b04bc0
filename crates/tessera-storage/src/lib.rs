pub mod fsm;
pub mod keys;
pub mod kv;
pub mod log;
pub mod sql;
pub mod types;

pub use fsm::Fsm;
pub use kv::{KvStore, WriteBatch};
pub use log::{LogStore, StableStore};
pub use sql::{QueryResult, SqlReplica, SqlValue};
pub use types::{LogRecord, LogType};

use tessera_types::Error;

/// Run blocking fjall/SQLite work off the async runtime.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, Error>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, Error> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Storage(e.to_string()))?
}
