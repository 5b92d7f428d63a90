//! Product catalog operations.

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::Serialize;
use sqlx::{sqlite::SqliteRow, QueryBuilder, Row, Sqlite};
use tracing::info;

use crate::{
    error::{corrupt, StoreError},
    images::{map_image, ImageReference},
    parse_datetime, timestamp,
    validation::{Category, Condition, Era, Gender, ProductDraft, ValidationMode},
    Database,
};

/// Persisted product row.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Product {
    pub id: i64,
    pub nome: String,
    pub prezzo: f64,
    pub descrizione: Option<String>,
    pub categoria: Category,
    pub genere: Gender,
    pub taglia: Option<String>,
    pub epoca: Option<Era>,
    pub condizione: Condition,
    pub disponibile: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Equality filters for [`ProductStore::list`]. Unset (or empty) fields impose
/// no constraint; category and gender are compared lowercased.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProductFilter {
    pub categoria: Option<String>,
    pub genere: Option<String>,
    pub disponibile: Option<bool>,
    pub epoca: Option<String>,
}

#[derive(Clone, Debug)]
pub struct ProductStore {
    db: Database,
}

impl ProductStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Validates and inserts a product, returning its generated id.
    pub async fn create(&self, draft: &ProductDraft) -> Result<i64, StoreError> {
        let product = draft.check_new()?;
        let now = timestamp(Utc::now());

        let result = sqlx::query(
            r#"
            INSERT INTO products (
                nome, prezzo, descrizione, categoria, genere,
                taglia, epoca, condizione, disponibile, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&product.nome)
        .bind(product.prezzo)
        .bind(&product.descrizione)
        .bind(product.categoria.as_str())
        .bind(product.genere.as_str())
        .bind(&product.taglia)
        .bind(product.epoca.map(Era::as_str))
        .bind(product.condizione.as_str())
        .bind(product.disponibile)
        .bind(&now)
        .bind(&now)
        .execute(self.db.pool())
        .await?;

        let id = result.last_insert_rowid();
        info!(product_id = id, nome = %product.nome, "product created");
        Ok(id)
    }

    /// Products matching `filter`, newest first.
    pub async fn list(&self, filter: &ProductFilter) -> Result<Vec<Product>, StoreError> {
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT * FROM products WHERE 1 = 1");

        if let Some(categoria) = non_empty(&filter.categoria) {
            builder
                .push(" AND categoria = ")
                .push_bind(categoria.to_lowercase());
        }
        if let Some(genere) = non_empty(&filter.genere) {
            builder.push(" AND genere = ").push_bind(genere.to_lowercase());
        }
        if let Some(disponibile) = filter.disponibile {
            builder.push(" AND disponibile = ").push_bind(disponibile);
        }
        if let Some(epoca) = non_empty(&filter.epoca) {
            builder.push(" AND epoca = ").push_bind(epoca.to_string());
        }
        builder.push(" ORDER BY created_at DESC, id DESC");

        let mut rows = builder.build().fetch(self.db.pool());
        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_product(row)?);
        }
        Ok(out)
    }

    pub async fn get(&self, id: i64) -> Result<Product, StoreError> {
        let row = sqlx::query("SELECT * FROM products WHERE id = ?")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?
            .ok_or(StoreError::NotFound("Product"))?;

        map_product(row)
    }

    /// Writes only the fields present in `draft`; `updated_at` is always
    /// refreshed.
    pub async fn update(&self, id: i64, draft: &ProductDraft) -> Result<(), StoreError> {
        self.get(id).await?;

        let patch = draft.check(ValidationMode::Update)?;
        if patch.is_empty() {
            return Err(StoreError::NothingToUpdate);
        }

        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE products SET ");
        let mut fields = builder.separated(", ");

        if let Some(nome) = patch.nome {
            fields.push("nome = ").push_bind_unseparated(nome);
        }
        if let Some(prezzo) = patch.prezzo {
            fields.push("prezzo = ").push_bind_unseparated(prezzo);
        }
        if let Some(descrizione) = patch.descrizione {
            fields.push("descrizione = ").push_bind_unseparated(descrizione);
        }
        if let Some(categoria) = patch.categoria {
            fields
                .push("categoria = ")
                .push_bind_unseparated(categoria.as_str());
        }
        if let Some(genere) = patch.genere {
            fields.push("genere = ").push_bind_unseparated(genere.as_str());
        }
        if let Some(taglia) = patch.taglia {
            fields.push("taglia = ").push_bind_unseparated(taglia);
        }
        if let Some(epoca) = patch.epoca {
            fields
                .push("epoca = ")
                .push_bind_unseparated(epoca.map(Era::as_str));
        }
        if let Some(condizione) = patch.condizione {
            fields
                .push("condizione = ")
                .push_bind_unseparated(condizione.as_str());
        }
        if let Some(disponibile) = patch.disponibile {
            fields
                .push("disponibile = ")
                .push_bind_unseparated(disponibile);
        }
        fields
            .push("updated_at = ")
            .push_bind_unseparated(timestamp(Utc::now()));

        builder.push(" WHERE id = ").push_bind(id);
        builder.build().execute(self.db.pool()).await?;

        info!(product_id = id, "product updated");
        Ok(())
    }

    /// Deletes a product. Its image rows go with it through the foreign key,
    /// inside the same transaction; they are returned so the caller can remove
    /// the binaries.
    pub async fn delete(&self, id: i64) -> Result<Vec<ImageReference>, StoreError> {
        let mut tx = self.db.pool().begin().await?;

        sqlx::query("SELECT id FROM products WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::NotFound("Product"))?;

        let rows = sqlx::query(
            "SELECT * FROM product_images WHERE product_id = ? ORDER BY is_primary DESC, created_at ASC, id ASC",
        )
        .bind(id)
        .fetch_all(&mut *tx)
        .await?;
        let images = rows
            .into_iter()
            .map(map_image)
            .collect::<Result<Vec<_>, _>>()?;

        sqlx::query("DELETE FROM products WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        info!(product_id = id, images = images.len(), "product deleted");
        Ok(images)
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|text| !text.is_empty())
}

fn map_product(row: SqliteRow) -> Result<Product, StoreError> {
    let categoria: String = row.try_get("categoria")?;
    let genere: String = row.try_get("genere")?;
    let condizione: String = row.try_get("condizione")?;
    let epoca: Option<String> = row.try_get("epoca")?;
    let disponibile: i64 = row.try_get("disponibile")?;

    Ok(Product {
        id: row.try_get("id")?,
        nome: row.try_get("nome")?,
        prezzo: row.try_get("prezzo")?,
        descrizione: row.try_get("descrizione")?,
        categoria: Category::parse(&categoria)
            .ok_or_else(|| corrupt(format!("unknown categoria {categoria}")))?,
        genere: Gender::parse(&genere)
            .ok_or_else(|| corrupt(format!("unknown genere {genere}")))?,
        taglia: row.try_get("taglia")?,
        epoca: epoca
            .map(|raw| Era::parse(&raw).ok_or_else(|| corrupt(format!("unknown epoca {raw}"))))
            .transpose()?,
        condizione: Condition::parse(&condizione)
            .ok_or_else(|| corrupt(format!("unknown condizione {condizione}")))?,
        disponibile: disponibile != 0,
        created_at: parse_datetime(row.try_get("created_at")?).map_err(corrupt)?,
        updated_at: parse_datetime(row.try_get("updated_at")?).map_err(corrupt)?,
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{json, Value};

    use super::*;
    use crate::{images::ImageStore, storage::MemoryObjectStorage, test_support::setup_db};

    fn draft(value: Value) -> ProductDraft {
        serde_json::from_value(value).expect("draft")
    }

    fn blazer() -> ProductDraft {
        draft(json!({
            "nome": "Blazer Vintage",
            "prezzo": 85,
            "descrizione": "Bellissimo blazer anni 80",
            "categoria": "giacche",
            "genere": "donna",
            "taglia": "M",
            "epoca": "80",
            "condizione": "eccellente"
        }))
    }

    #[tokio::test]
    async fn create_then_get_returns_supplied_fields() {
        let (db, _tmp) = setup_db().await;
        let store = ProductStore::new(db);

        let id = store.create(&blazer()).await.unwrap();
        assert!(id > 0);

        let product = store.get(id).await.unwrap();
        assert_eq!(product.nome, "Blazer Vintage");
        assert_eq!(product.prezzo, 85.0);
        assert_eq!(product.descrizione.as_deref(), Some("Bellissimo blazer anni 80"));
        assert_eq!(product.categoria, Category::Giacche);
        assert_eq!(product.genere, Gender::Donna);
        assert_eq!(product.taglia.as_deref(), Some("M"));
        assert_eq!(product.epoca, Some(Era::Eighties));
        assert_eq!(product.condizione, Condition::Eccellente);
        assert!(product.disponibile);
    }

    #[tokio::test]
    async fn create_normalizes_and_applies_defaults() {
        let (db, _tmp) = setup_db().await;
        let store = ProductStore::new(db);

        let id = store
            .create(&draft(json!({
                "nome": "  Gonna plissé  ",
                "prezzo": 35.5,
                "categoria": "GONNE",
                "genere": "Donna"
            })))
            .await
            .unwrap();

        let product = store.get(id).await.unwrap();
        assert_eq!(product.nome, "Gonna plissé");
        assert_eq!(product.categoria, Category::Gonne);
        assert_eq!(product.genere, Gender::Donna);
        assert_eq!(product.condizione, Condition::Buona);
        assert!(product.disponibile);
        assert_eq!(product.epoca, None);
        assert_eq!(product.created_at, product.updated_at);
    }

    #[tokio::test]
    async fn create_rejects_invalid_records() {
        let (db, _tmp) = setup_db().await;
        let store = ProductStore::new(db);

        let err = store
            .create(&draft(json!({ "descrizione": "Missing required fields" })))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
        assert!(err.to_string().contains("required"));

        let err = store
            .create(&draft(json!({
                "nome": "Blazer", "prezzo": 0, "categoria": "giacche", "genere": "donna"
            })))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("prezzo"));

        let err = store
            .create(&draft(json!({
                "nome": "Blazer", "prezzo": 10, "categoria": "scarpe", "genere": "donna"
            })))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("categoria"));

        assert!(store.list(&ProductFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_filters_and_orders_newest_first() {
        let (db, _tmp) = setup_db().await;
        let store = ProductStore::new(db);

        let blazer_id = store.create(&blazer()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        let shirt_id = store
            .create(&draft(json!({
                "nome": "Camicia", "prezzo": 30, "categoria": "camicie",
                "genere": "uomo", "disponibile": false, "epoca": "70"
            })))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        let jacket_id = store
            .create(&draft(json!({
                "nome": "Giubbotto", "prezzo": 60, "categoria": "Giacche", "genere": "unisex"
            })))
            .await
            .unwrap();

        let all: Vec<_> = store
            .list(&ProductFilter::default())
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(all, vec![jacket_id, shirt_id, blazer_id]);

        let jackets = store
            .list(&ProductFilter {
                categoria: Some("GIACCHE".into()),
                ..ProductFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(jackets.len(), 2);
        assert!(jackets.iter().all(|p| p.categoria == Category::Giacche));

        let available = store
            .list(&ProductFilter {
                disponibile: Some(true),
                ..ProductFilter::default()
            })
            .await
            .unwrap();
        assert!(available.iter().all(|p| p.id != shirt_id));

        let unavailable = store
            .list(&ProductFilter {
                disponibile: Some(false),
                ..ProductFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(unavailable.len(), 1);
        assert_eq!(unavailable[0].id, shirt_id);

        let seventies = store
            .list(&ProductFilter {
                epoca: Some("70".into()),
                genere: Some("UOMO".into()),
                ..ProductFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(seventies.len(), 1);

        let empty_filter = store
            .list(&ProductFilter {
                categoria: Some(String::new()),
                ..ProductFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(empty_filter.len(), 3);
    }

    #[tokio::test]
    async fn update_writes_only_supplied_fields() {
        let (db, _tmp) = setup_db().await;
        let store = ProductStore::new(db);
        let id = store.create(&blazer()).await.unwrap();
        let before = store.get(id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;

        store
            .update(id, &draft(json!({ "prezzo": 70, "genere": "UNISEX", "taglia": null })))
            .await
            .unwrap();

        let after = store.get(id).await.unwrap();
        assert_eq!(after.prezzo, 70.0);
        assert_eq!(after.genere, Gender::Unisex);
        assert_eq!(after.taglia, None);
        assert_eq!(after.nome, before.nome);
        assert_eq!(after.descrizione, before.descrizione);
        assert_eq!(after.epoca, before.epoca);
        assert_eq!(after.created_at, before.created_at);
        assert!(after.updated_at > before.updated_at);
    }

    #[tokio::test]
    async fn update_distinguishes_failures() {
        let (db, _tmp) = setup_db().await;
        let store = ProductStore::new(db);
        let id = store.create(&blazer()).await.unwrap();

        let err = store
            .update(id + 1, &draft(json!({ "prezzo": 10 })))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "Product not found");

        let err = store
            .update(id, &draft(json!({ "prezzo": -1 })))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("prezzo"));

        let err = store.update(id, &ProductDraft::default()).await.unwrap_err();
        assert!(matches!(err, StoreError::NothingToUpdate));
        assert!(err.is_client_error());

        assert_eq!(store.get(id).await.unwrap().prezzo, 85.0);
    }

    #[tokio::test]
    async fn undecodable_row_is_reported_as_corrupt() {
        let (db, _tmp) = setup_db().await;
        let store = ProductStore::new(db.clone());
        let id = store.create(&blazer()).await.unwrap();

        sqlx::query("UPDATE products SET categoria = 'scarpe' WHERE id = ?")
            .bind(id)
            .execute(db.pool())
            .await
            .unwrap();

        let err = store.get(id).await.unwrap_err();
        assert!(matches!(err, StoreError::CorruptRow(_)), "{err:?}");
        assert!(!err.is_client_error());
        assert!(err.to_string().contains("unknown categoria scarpe"));
    }

    #[tokio::test]
    async fn delete_twice_reports_not_found() {
        let (db, _tmp) = setup_db().await;
        let store = ProductStore::new(db);
        let id = store.create(&blazer()).await.unwrap();

        store.delete(id).await.unwrap();
        for _ in 0..2 {
            let err = store.delete(id).await.unwrap_err();
            assert!(err.is_not_found());
        }
        assert!(store.get(id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn delete_cascades_image_rows() {
        let (db, _tmp) = setup_db().await;
        let store = ProductStore::new(db.clone());
        let images = ImageStore::new(db, std::sync::Arc::new(MemoryObjectStorage::new()));

        let id = store.create(&blazer()).await.unwrap();
        let keep = store.create(&blazer()).await.unwrap();
        images.add_reference(id, "/images/products/a.jpg", true).await.unwrap();
        images.add_reference(id, "/images/products/b.jpg", false).await.unwrap();
        images.add_reference(keep, "/images/products/c.jpg", true).await.unwrap();

        let removed = store.delete(id).await.unwrap();
        let urls: Vec<_> = removed.iter().map(|image| image.url.as_str()).collect();
        assert_eq!(urls, vec!["/images/products/a.jpg", "/images/products/b.jpg"]);

        assert!(images.list_references(id).await.unwrap().is_empty());
        assert_eq!(images.list_references(keep).await.unwrap().len(), 1);
    }
}
