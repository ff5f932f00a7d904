//! Database abstraction layer.
//!
//! The core pipeline depends only on a handful of primitives: transactional
//! batch insert, upsert with additive update, paged select/delete and simple
//! lookups. SQLite is the only backend today.
//!
//! # Example
//!
//! ```ignore
//! let pool = SqlitePool::connect("sqlite:data/logbill.db?mode=rwc").await?;
//! let row = sqlx::query("SELECT 1").fetch_one(pool.inner()).await?;
//! ```

mod sqlite;

pub use sqlite::{DEFAULT_MAX_CONNECTIONS, SqlitePool};
