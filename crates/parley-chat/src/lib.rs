pub mod directory;
pub mod error;
pub mod locks;
pub mod presence;
pub mod store;

mod convert;

pub use directory::ChatDirectory;
pub use error::ChatError;
pub use presence::PresenceTracker;
pub use store::MessageStore;

use std::sync::Arc;

use error::Result;
use parley_db::Database;

/// Run blocking rusqlite work off the async runtime.
pub(crate) async fn run_blocking<T, F>(db: Arc<Database>, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&Database) -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(&db))
        .await
        .map_err(|e| ChatError::Storage(anyhow::anyhow!("spawn_blocking join error: {}", e)))?
}
