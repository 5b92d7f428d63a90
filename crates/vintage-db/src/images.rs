//! Image binaries and the `product_images` reference rows that attach them
//! to products.
//!
//! Binaries and rows are managed separately: callers upload a binary, then
//! record a reference to its locator; on removal they delete the row, then the
//! binary.

use std::{path::Path, sync::Arc};

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use rand::{distributions::Alphanumeric, Rng};
use serde::Serialize;
use sqlx::{sqlite::SqliteRow, Row};
use tracing::{info, warn};

use crate::{
    error::{corrupt, is_foreign_key_violation, StoreError},
    parse_datetime,
    storage::{ObjectStorage, StoredObject},
    timestamp, Database,
};

/// Content types accepted for upload.
pub const ALLOWED_CONTENT_TYPES: [&str; 4] = ["image/jpeg", "image/png", "image/webp", "image/gif"];

/// Upload ceiling (25 MiB, inclusive).
pub const MAX_IMAGE_BYTES: usize = 25 * 1024 * 1024;

/// Prefix under which stored binaries are served publicly.
pub const DEFAULT_LOCATOR_PREFIX: &str = "/images/";

const KEY_PREFIX: &str = "products/";
const KEY_SUFFIX_LEN: usize = 24;

/// Persisted image reference row.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ImageReference {
    pub id: i64,
    pub product_id: i64,
    pub url: String,
    pub is_primary: bool,
    pub created_at: DateTime<Utc>,
}

/// Result of a successful binary upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedImage {
    pub key: String,
    pub url: String,
}

/// Outcome of [`ImageStore::set_primary`]. `promoted` is false when the image
/// does not belong to the product; every primary flag of the product has still
/// been cleared in that case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrimaryOutcome {
    pub promoted: bool,
}

#[derive(Clone, Debug)]
pub struct ImageStore {
    db: Database,
    storage: Arc<dyn ObjectStorage>,
    locator_prefix: String,
}

impl ImageStore {
    pub fn new(db: Database, storage: Arc<dyn ObjectStorage>) -> Self {
        Self {
            db,
            storage,
            locator_prefix: DEFAULT_LOCATOR_PREFIX.to_string(),
        }
    }

    pub fn with_locator_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.locator_prefix = prefix.into();
        self
    }

    /// Public locator for a storage key.
    pub fn locator_for(&self, key: &str) -> String {
        format!("{}{}", self.locator_prefix, key)
    }

    /// Reverses [`ImageStore::locator_for`]; `None` for locators minted elsewhere.
    pub fn key_for_locator<'a>(&self, locator: &'a str) -> Option<&'a str> {
        locator
            .strip_prefix(self.locator_prefix.as_str())
            .filter(|key| !key.is_empty())
    }

    /// Validates and stores an image binary. Type and size rejections are
    /// reported before anything is written.
    pub async fn upload_binary(
        &self,
        bytes: &[u8],
        filename: &str,
        content_type: &str,
    ) -> Result<UploadedImage, StoreError> {
        let content_type = content_type.trim().to_ascii_lowercase();
        if !ALLOWED_CONTENT_TYPES.contains(&content_type.as_str()) {
            return Err(StoreError::InvalidUpload(format!(
                "Invalid file type. Allowed types: {}",
                ALLOWED_CONTENT_TYPES.join(", ")
            )));
        }

        if bytes.len() > MAX_IMAGE_BYTES {
            return Err(StoreError::InvalidUpload(format!(
                "File too large. Maximum size: {}MB",
                MAX_IMAGE_BYTES / 1024 / 1024
            )));
        }

        let key = generate_image_key(filename, &content_type);
        self.storage
            .put_object(&key, bytes, &content_type)
            .await?;

        info!(key = %key, size = bytes.len(), content_type = %content_type, "image stored");
        Ok(UploadedImage {
            url: self.locator_for(&key),
            key,
        })
    }

    pub async fn fetch_binary(&self, key: &str) -> Result<Option<StoredObject>, StoreError> {
        Ok(self.storage.get_object(key).await?)
    }

    pub async fn delete_binary(&self, key: &str) -> Result<(), StoreError> {
        self.storage.delete_object(key).await?;
        info!(key = %key, "image binary deleted");
        Ok(())
    }

    /// Records that the binary at `url` belongs to `product_id`. The schema's
    /// foreign key turns an unknown product into [`StoreError::NotFound`].
    pub async fn add_reference(
        &self,
        product_id: i64,
        url: &str,
        is_primary: bool,
    ) -> Result<i64, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO product_images (product_id, url, is_primary, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(product_id)
        .bind(url)
        .bind(is_primary)
        .bind(timestamp(Utc::now()))
        .execute(self.db.pool())
        .await
        .map_err(|err| {
            if is_foreign_key_violation(&err) {
                StoreError::NotFound("Product")
            } else {
                StoreError::Database(err)
            }
        })?;

        let id = result.last_insert_rowid();
        info!(product_id, image_id = id, is_primary, "image reference added");
        Ok(id)
    }

    /// All references of a product, primary first, then oldest first.
    pub async fn list_references(&self, product_id: i64) -> Result<Vec<ImageReference>, StoreError> {
        let mut rows = sqlx::query(
            r#"
            SELECT * FROM product_images
            WHERE product_id = ?
            ORDER BY is_primary DESC, created_at ASC, id ASC
            "#,
        )
        .bind(product_id)
        .fetch(self.db.pool());

        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_image(row)?);
        }
        Ok(out)
    }

    /// Removes one reference row and returns it. The binary is left in place.
    pub async fn delete_reference(&self, id: i64) -> Result<ImageReference, StoreError> {
        let row = sqlx::query("DELETE FROM product_images WHERE id = ? RETURNING *")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?
            .ok_or(StoreError::NotFound("Image"))?;

        let image = map_image(row)?;
        info!(image_id = id, product_id = image.product_id, "image reference deleted");
        Ok(image)
    }

    /// Clears every primary flag of the product, then flags `image_id`. Both
    /// statements share one transaction. A mismatched pairing is still reported
    /// as success and leaves the product without a primary image.
    pub async fn set_primary(
        &self,
        product_id: i64,
        image_id: i64,
    ) -> Result<PrimaryOutcome, StoreError> {
        let mut tx = self.db.pool().begin().await?;

        sqlx::query("UPDATE product_images SET is_primary = 0 WHERE product_id = ?")
            .bind(product_id)
            .execute(&mut *tx)
            .await?;

        let promoted =
            sqlx::query("UPDATE product_images SET is_primary = 1 WHERE id = ? AND product_id = ?")
                .bind(image_id)
                .bind(product_id)
                .execute(&mut *tx)
                .await?
                .rows_affected()
                > 0;

        tx.commit().await?;

        if promoted {
            info!(product_id, image_id, "primary image set");
        } else {
            warn!(
                product_id,
                image_id, "image does not belong to product; product left without a primary image"
            );
        }
        Ok(PrimaryOutcome { promoted })
    }
}

fn generate_image_key(filename: &str, content_type: &str) -> String {
    let millis = Utc::now().timestamp_millis();
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(KEY_SUFFIX_LEN)
        .map(char::from)
        .collect();
    let ext = file_extension(filename).unwrap_or_else(|| extension_for(content_type).to_string());
    format!("{KEY_PREFIX}{millis}-{suffix}.{ext}")
}

fn file_extension(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty() && ext.len() <= 8)
        .filter(|ext| ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(str::to_ascii_lowercase)
}

fn extension_for(content_type: &str) -> &'static str {
    match content_type {
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        _ => "jpg",
    }
}

pub(crate) fn map_image(row: SqliteRow) -> Result<ImageReference, StoreError> {
    let is_primary: i64 = row.try_get("is_primary")?;

    Ok(ImageReference {
        id: row.try_get("id")?,
        product_id: row.try_get("product_id")?,
        url: row.try_get("url")?,
        is_primary: is_primary != 0,
        created_at: parse_datetime(row.try_get("created_at")?).map_err(corrupt)?,
    })
}
