//! Bridge from async handlers to the synchronous store.

use std::sync::Arc;

use devmess_store::Database;

use crate::error::ServerError;

pub type Db = Arc<Database>;

/// Run a store call on the blocking pool.
pub async fn with_db<T, F>(db: &Db, f: F) -> Result<T, ServerError>
where
    F: FnOnce(&Database) -> devmess_store::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let db = Arc::clone(db);
    tokio::task::spawn_blocking(move || f(&db))
        .await
        .map_err(ServerError::internal)?
        .map_err(ServerError::from)
}
