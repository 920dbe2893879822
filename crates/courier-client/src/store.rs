use std::path::Path;
use std::sync::{Arc, Mutex};

use courier_store::{Database, Result};

/// Shared handle to the local database. Every access holds the lock for one
/// closure, so writes to the same row never interleave.
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<Mutex<Database>>,
}

impl LocalStore {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    /// Open at `path`, or the platform default when `None`.
    pub fn open(path: Option<&Path>) -> Result<Self> {
        let db = match path {
            Some(path) => Database::open_at(path)?,
            None => Database::new()?,
        };
        Ok(Self::new(db))
    }

    pub fn with<T>(&self, f: impl FnOnce(&Database) -> T) -> T {
        let db = self.db.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&db)
    }
}
