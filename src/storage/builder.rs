//! Storage builder and handles.
//!
//! Provides a builder pattern for constructing the storage layer
//! and a handles struct for accessing all storage facades.

use std::path::Path;

use crate::storage::db::{DEFAULT_MAX_CONNECTIONS, SqlitePool};
use crate::storage::schema::init_schema;
use crate::storage::{
    BillingStore, IngestStore, MetricsStore, RegistryStore, RetentionStore, StorageError,
};

/// Builder for constructing the storage layer.
pub struct StorageBuilder {
    url: String,
    max_connections: u32,
}

impl StorageBuilder {
    /// Create a new storage builder from a sqlx SQLite URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }

    /// Create a builder for a database file, creating its parent directory on build.
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        Self::new(format!("sqlite:{}?mode=rwc", path.as_ref().display()))
    }

    /// Set the connection pool size.
    pub fn max_connections(mut self, size: u32) -> Self {
        self.max_connections = size;
        self
    }

    fn file_path(&self) -> Option<&Path> {
        let rest = self.url.strip_prefix("sqlite:")?;
        let rest = rest.strip_prefix("//").unwrap_or(rest);
        let path = rest.split('?').next()?;
        if path.is_empty() || path.starts_with(':') {
            return None;
        }
        Some(Path::new(path))
    }

    /// Connect, apply the schema and make sure the billing project exists.
    pub async fn build(self) -> Result<StorageHandles, StorageError> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = self.file_path().and_then(Path::parent)
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::Internal(format!(
                    "Failed to create database directory '{}': {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let pool = SqlitePool::connect_with(&self.url, self.max_connections).await?;
        init_schema(&pool).await?;

        let billing = BillingStore::new(pool.clone());
        billing.ensure_billing_project().await?;

        Ok(StorageHandles {
            ingest: IngestStore::new(pool.clone()),
            registry: RegistryStore::new(pool.clone()),
            retention: RetentionStore::new(pool.clone()),
            metrics: MetricsStore::new(pool.clone()),
            billing,
            pool,
        })
    }
}

/// Handles to all storage layer facades.
#[derive(Clone)]
pub struct StorageHandles {
    /// Atomic flush commits and aggregate lookups.
    pub ingest: IngestStore,
    /// Tag and rule name reference tables.
    pub registry: RegistryStore,
    /// Billing rules and tag projects.
    pub billing: BillingStore,
    /// Expired row deletion.
    pub retention: RetentionStore,
    /// Metric reports.
    pub metrics: MetricsStore,
    /// Shared pool, for shutdown and ad-hoc queries.
    pub pool: SqlitePool,
}

impl std::fmt::Debug for StorageHandles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageHandles").finish_non_exhaustive()
    }
}

impl StorageHandles {
    /// Gracefully shutdown the storage layer.
    ///
    /// Waits for checked-out connections to be returned, then closes the pool.
    pub async fn shutdown(self) -> Result<(), StorageError> {
        self.pool.close().await;
        Ok(())
    }
}
