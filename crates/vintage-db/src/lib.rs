//! Catalog persistence layer for the Cose Vintage shop.
//!
//! This crate owns the SQLite schema (products and their image references),
//! the field validation rules applied to product records, and the object
//! storage backends that hold uploaded image binaries. The HTTP surface lives
//! in `vintage-admin` and only talks to the stores exposed here.

use std::{path::Path, str::FromStr, time::Duration};

use anyhow::{anyhow, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};

pub mod error;
pub mod images;
pub mod products;
pub mod storage;
pub mod validation;

pub use error::StoreError;
pub use images::{ImageReference, ImageStore, PrimaryOutcome, UploadedImage};
pub use products::{Product, ProductFilter, ProductStore};
pub use storage::{
    FsObjectStorage, MemoryObjectStorage, ObjectStorage, S3ObjectStorage, StoredObject,
};
pub use validation::{
    validate, Category, Condition, Era, FieldError, Gender, NewProduct, ProductDraft,
    ProductPatch, ValidationErrors, ValidationMode,
};

/// Default SQLite busy timeout in milliseconds when the DB is under load.
const SQLITE_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Shared handle to the catalog database. Cheap to clone.
#[derive(Clone, Debug)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes (or creates) a connection pool to the SQLite database located at
    /// the given URL (e.g. `sqlite:///var/lib/vintage/catalog.db`) and applies the
    /// embedded schema.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_millis(SQLITE_BUSY_TIMEOUT_MS));

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(8)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Connects to a file path via `sqlite://` scheme.
    pub async fn connect_file(path: &Path) -> Result<Self> {
        let url = format!("sqlite://{}", path.display());
        Self::connect(&url).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Fixed-width RFC 3339 so that lexical order in SQLite matches time order.
pub(crate) fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_datetime(value: String) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| anyhow!("invalid RFC3339 timestamp '{}': {}", value, err))
}

#[cfg(test)]
pub(crate) mod test_support {
    use tempfile::TempDir;

    use super::Database;

    pub async fn setup_db() -> (Database, TempDir) {
        let temp = TempDir::new().expect("tempdir");
        let db = Database::connect_file(&temp.path().join("catalog.sqlite"))
            .await
            .expect("db");
        (db, temp)
    }
}
