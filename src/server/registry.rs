//! Database registry
//!
//! Process-wide map from database name to open store handle. All
//! lookups and insertions go through one async mutex so concurrent
//! opens of the same name cannot race into duplicate handles, and a
//! delete cannot overlap an in-flight open. The handles themselves
//! serve concurrent requests; the registry only guards lifecycle.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::store::{valid_database_name, Database, StoreEngine};

pub struct DatabaseRegistry {
    engine: Arc<dyn StoreEngine>,
    dbs: Mutex<HashMap<String, Arc<dyn Database>>>,
}

impl DatabaseRegistry {
    pub fn new(engine: Arc<dyn StoreEngine>) -> Self {
        Self {
            engine,
            dbs: Mutex::new(HashMap::new()),
        }
    }

    /// Open and register a new database. Fails with `AlreadyExists`
    /// when the name is already registered.
    pub async fn create(&self, name: &str) -> Result<Arc<dyn Database>> {
        let mut dbs = self.dbs.lock().await;
        if dbs.contains_key(name) {
            return Err(Error::AlreadyExists(
                "The database could not be created.".to_string(),
            ));
        }
        let db = self.engine.open(name).await?;
        dbs.insert(name.to_string(), db.clone());
        info!(db = %name, "Database created");
        Ok(db)
    }

    /// Resolve a name to its live handle. Unknown names are probed on
    /// disk and reopened when a database directory exists, so a
    /// restarted process rediscovers databases lazily instead of
    /// pre-enumerating them.
    pub async fn resolve(&self, name: &str) -> Result<Arc<dyn Database>> {
        // A name that cannot be a single path segment cannot exist on
        // disk; refusing it here keeps the probe inside the data dir.
        if !valid_database_name(name) {
            return Err(Error::NotFound("no_db_file".to_string()));
        }

        let mut dbs = self.dbs.lock().await;
        if let Some(db) = dbs.get(name) {
            return Ok(db.clone());
        }

        let path = self.engine.database_path(name);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => {
                let db = self.engine.open(name).await?;
                dbs.insert(name.to_string(), db.clone());
                debug!(db = %name, "Database rediscovered from storage");
                Ok(db)
            }
            _ => Err(Error::NotFound("no_db_file".to_string())),
        }
    }

    /// Destroy a database's storage and drop its handle.
    pub async fn destroy(&self, name: &str) -> Result<()> {
        let mut dbs = self.dbs.lock().await;
        self.engine.destroy(name).await?;
        dbs.remove(name);
        info!(db = %name, "Database destroyed");
        Ok(())
    }

    /// Is `name` currently registered?
    pub async fn contains(&self, name: &str) -> bool {
        self.dbs.lock().await.contains_key(name)
    }

    /// Drop every registered handle. Called on shutdown.
    pub async fn close_all(&self) {
        self.dbs.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryEngine;
    use uuid::Uuid;

    fn test_engine() -> Arc<MemoryEngine> {
        let dir = std::env::temp_dir().join(format!(
            "futondb_registry_test_{}_{}",
            std::process::id(),
            Uuid::new_v4().simple()
        ));
        Arc::new(MemoryEngine::new(dir))
    }

    #[tokio::test]
    async fn test_duplicate_create_is_rejected() {
        let registry = DatabaseRegistry::new(test_engine());
        registry.create("pets").await.unwrap();
        let err = registry.create("pets").await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_resolve_unknown_name_is_not_found() {
        let registry = DatabaseRegistry::new(test_engine());
        let err = registry.resolve("nope").await.unwrap_err();
        match err {
            Error::NotFound(reason) => assert_eq!(reason, "no_db_file"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_resolve_rediscovers_after_restart() {
        let engine = test_engine();
        let first = DatabaseRegistry::new(engine.clone());
        first.create("pets").await.unwrap();

        // A fresh registry over the same storage stands in for a
        // restarted process.
        let second = DatabaseRegistry::new(engine);
        assert!(!second.contains("pets").await);
        second.resolve("pets").await.unwrap();
        assert!(second.contains("pets").await);
    }

    #[tokio::test]
    async fn test_resolve_never_probes_outside_data_dir() {
        let root = std::env::temp_dir().join(format!(
            "futondb_registry_test_{}_{}",
            std::process::id(),
            Uuid::new_v4().simple()
        ));
        // A sibling of the data dir must stay invisible to traversal
        // names.
        std::fs::create_dir_all(root.join("victim")).unwrap();
        let registry = DatabaseRegistry::new(Arc::new(MemoryEngine::new(root.join("data"))));

        let err = registry.resolve("../victim").await.unwrap_err();
        match err {
            Error::NotFound(reason) => assert_eq!(reason, "no_db_file"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_destroy_unregisters() {
        let registry = DatabaseRegistry::new(test_engine());
        registry.create("pets").await.unwrap();
        registry.destroy("pets").await.unwrap();
        assert!(!registry.contains("pets").await);
        assert!(registry.resolve("pets").await.is_err());
    }
}
