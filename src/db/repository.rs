//! Database repository for CRUD operations.
//!
//! Uses prepared statements and transactions for data integrity.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::catalog::{
    add_tag, normalize_tags, parse_stored_tags, primary_image, slugify, unique_slug, LinkStore,
    TagCase,
};
use crate::errors::AppError;
use crate::models::{
    Collection, CollectionProduct, CollectionProductCount, CreateCollectionRequest,
    CreateProductRequest, NewProductImage, Product, ProductImage, RevisionInfo,
    UpdateCollectionRequest, UpdateProductRequest,
};

const COLLECTION_COLUMNS: &str =
    "id, title, slug, icon, description, published, sort_order, tags, updated_at, version";

const PRODUCT_COLUMNS: &str =
    "id, title, slug, description, tags, published, price, updated_at, version";

/// Fresh slug picks after a concurrent create took the chosen one.
const SLUG_RETRIES: usize = 16;

/// Database repository for all data operations.
#[derive(Clone)]
pub struct Repository {
    pool: SqlitePool,
    tag_case: TagCase,
}

impl Repository {
    pub fn new(pool: SqlitePool, tag_case: TagCase) -> Self {
        Self { pool, tag_case }
    }

    pub fn tag_case(&self) -> TagCase {
        self.tag_case
    }

    /// Get the current revision ID.
    pub async fn get_revision_id(&self) -> Result<i64, AppError> {
        let row = sqlx::query("SELECT revision_id FROM meta WHERE id = 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("revision_id"))
    }

    /// Get revision info.
    pub async fn get_revision_info(&self) -> Result<RevisionInfo, AppError> {
        let row = sqlx::query("SELECT revision_id, generated_at FROM meta WHERE id = 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(RevisionInfo {
            revision_id: row.get("revision_id"),
            generated_at: row.get("generated_at"),
        })
    }

    /// Increment the revision ID and return the new value.
    pub async fn increment_revision(&self) -> Result<i64, AppError> {
        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE meta SET revision_id = revision_id + 1, generated_at = ? WHERE id = 1")
            .bind(&now)
            .execute(&self.pool)
            .await?;
        self.get_revision_id().await
    }

    // ==================== COLLECTION OPERATIONS ====================

    /// List collections by sort order, optionally only the published ones.
    pub async fn list_collections(
        &self,
        published_only: bool,
    ) -> Result<Vec<Collection>, AppError> {
        let sql = if published_only {
            format!(
                "SELECT {} FROM collections WHERE published = 1 ORDER BY sort_order, title",
                COLLECTION_COLUMNS
            )
        } else {
            format!(
                "SELECT {} FROM collections ORDER BY sort_order, title",
                COLLECTION_COLUMNS
            )
        };

        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(collection_from_row).collect())
    }

    /// Get a collection by ID.
    pub async fn get_collection(&self, id: &str) -> Result<Option<Collection>, AppError> {
        let sql = format!("SELECT {} FROM collections WHERE id = ?", COLLECTION_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(collection_from_row))
    }

    /// Ids from `ids` that name no collection.
    pub async fn missing_collection_ids(&self, ids: &[String]) -> Result<Vec<String>, AppError> {
        let mut missing = Vec::new();
        for id in ids {
            let found = sqlx::query("SELECT 1 FROM collections WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            if found.is_none() {
                missing.push(id.clone());
            }
        }
        Ok(missing)
    }

    /// Create a new collection.
    pub async fn create_collection(
        &self,
        request: &CreateCollectionRequest,
    ) -> Result<Collection, AppError> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let tags = normalize_tags(&request.tags, self.tag_case)?;
        let tags_json = serde_json::to_string(&tags)?;
        let title = request.title.trim().to_string();

        let mut retries = 0;
        let slug = loop {
            let slug = self.next_slug("collections", &title, &id).await?;
            let inserted = sqlx::query(
                "INSERT INTO collections (id, title, slug, icon, description, published, sort_order, tags, updated_at, version) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 1)"
            )
            .bind(&id)
            .bind(&title)
            .bind(&slug)
            .bind(&request.icon)
            .bind(&request.description)
            .bind(request.published as i32)
            .bind(request.sort_order)
            .bind(&tags_json)
            .bind(&now)
            .execute(&self.pool)
            .await;

            match inserted {
                Ok(_) => break slug,
                Err(e) if is_slug_clash(&e) && retries < SLUG_RETRIES => {
                    retries += 1;
                    tracing::debug!(slug = %slug, retries, "Collection slug taken concurrently");
                }
                Err(e) => return Err(e.into()),
            }
        };

        self.increment_revision().await?;
        tracing::info!(collection_id = %id, slug = %slug, "Created collection");

        Ok(Collection {
            id,
            title,
            slug,
            icon: request.icon.clone(),
            description: request.description.clone(),
            published: request.published,
            sort_order: request.sort_order,
            tags,
            updated_at: now,
            version: 1,
        })
    }

    /// Update a collection with optimistic concurrency control.
    ///
    /// Without an expected version the last write wins. The slug is kept.
    pub async fn update_collection(
        &self,
        id: &str,
        request: &UpdateCollectionRequest,
    ) -> Result<Collection, AppError> {
        let existing = self
            .get_collection(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Collection {} not found", id)))?;

        check_expected_version(request.expected_version, existing.version)?;

        let title = match &request.title {
            Some(title) if title.trim().is_empty() => {
                return Err(AppError::Validation("Title is required".to_string()));
            }
            Some(title) => title.trim().to_string(),
            None => existing.title.clone(),
        };
        let tags = match &request.tags {
            Some(tags) => normalize_tags(tags, self.tag_case)?,
            None => existing.tags.clone(),
        };

        let updated = Collection {
            title,
            icon: request.icon.clone().unwrap_or(existing.icon.clone()),
            description: match &request.description {
                Some(description) => description.clone(),
                None => existing.description.clone(),
            },
            published: request.published.unwrap_or(existing.published),
            sort_order: request.sort_order.unwrap_or(existing.sort_order),
            tags,
            updated_at: Utc::now().to_rfc3339(),
            version: existing.version + 1,
            ..existing.clone()
        };

        self.write_collection(&updated, existing.version).await?;
        self.increment_revision().await?;

        Ok(updated)
    }

    /// Add one tag to a collection, rejecting a duplicate.
    pub async fn add_collection_tag(&self, id: &str, tag: &str) -> Result<Collection, AppError> {
        let existing = self
            .get_collection(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Collection {} not found", id)))?;

        let mut tags = existing.tags.clone();
        add_tag(&mut tags, tag, self.tag_case)?;

        let updated = Collection {
            tags,
            updated_at: Utc::now().to_rfc3339(),
            version: existing.version + 1,
            ..existing.clone()
        };

        self.write_collection(&updated, existing.version).await?;
        self.increment_revision().await?;

        Ok(updated)
    }

    /// Conditional UPDATE of every mutable collection column.
    async fn write_collection(
        &self,
        c: &Collection,
        expected_version: i64,
    ) -> Result<(), AppError> {
        let tags_json = serde_json::to_string(&c.tags)?;

        let result = sqlx::query(
            "UPDATE collections SET title = ?, icon = ?, description = ?, published = ?, sort_order = ?, tags = ?, updated_at = ?, version = ? WHERE id = ? AND version = ?"
        )
        .bind(&c.title)
        .bind(&c.icon)
        .bind(&c.description)
        .bind(c.published as i32)
        .bind(c.sort_order)
        .bind(&tags_json)
        .bind(&c.updated_at)
        .bind(c.version)
        .bind(&c.id)
        .bind(expected_version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Race condition - version changed between read and write
            let current = self.get_collection(&c.id).await?;
            return Err(AppError::Conflict {
                message: "Concurrent modification detected".to_string(),
                current_version: current.map(|c| c.version).unwrap_or(0),
            });
        }

        Ok(())
    }

    /// Delete a collection together with its memberships and links.
    pub async fn delete_collection(&self, id: &str) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("DELETE FROM collections WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Collection {} not found", id)));
        }

        sqlx::query("DELETE FROM product_collections WHERE collection_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "DELETE FROM collection_links WHERE parent_collection_id = ? OR linked_collection_id = ?",
        )
        .bind(id)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        bump_revision(&mut tx).await?;
        tx.commit().await?;

        tracing::info!(collection_id = %id, "Deleted collection");
        Ok(())
    }

    // ==================== PRODUCT OPERATIONS ====================

    /// List all products with their images.
    pub async fn list_products(&self) -> Result<Vec<Product>, AppError> {
        let sql = format!("SELECT {} FROM products ORDER BY title", PRODUCT_COLUMNS);
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

        let image_rows = sqlx::query(
            "SELECT id, product_id, url, is_primary, position FROM product_images ORDER BY product_id, position",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut images = group_images(&image_rows);

        Ok(rows
            .iter()
            .map(|row| {
                let id: String = row.get("id");
                let product_images = images.remove(&id).unwrap_or_default();
                product_from_row(row, product_images)
            })
            .collect())
    }

    /// Get a product by ID.
    pub async fn get_product(&self, id: &str) -> Result<Option<Product>, AppError> {
        let sql = format!("SELECT {} FROM products WHERE id = ?", PRODUCT_COLUMNS);
        let Some(row) = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };

        let image_rows = sqlx::query(
            "SELECT id, product_id, url, is_primary, position FROM product_images WHERE product_id = ? ORDER BY position",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        let images = image_rows.iter().map(image_from_row).collect();

        Ok(Some(product_from_row(&row, images)))
    }

    /// Create a new product and its images.
    pub async fn create_product(
        &self,
        request: &CreateProductRequest,
    ) -> Result<Product, AppError> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let tags = normalize_tags(&request.tags, self.tag_case)?;
        let tags_json = serde_json::to_string(&tags)?;
        let title = request.title.trim().to_string();

        let mut retries = 0;
        let (slug, images) = loop {
            let slug = self.next_slug("products", &title, &id).await?;
            let mut tx = self.pool.begin().await?;

            let inserted = sqlx::query(
                "INSERT INTO products (id, title, slug, description, tags, published, price, updated_at, version) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1)"
            )
            .bind(&id)
            .bind(&title)
            .bind(&slug)
            .bind(&request.description)
            .bind(&tags_json)
            .bind(request.published as i32)
            .bind(request.price)
            .bind(&now)
            .execute(&mut *tx)
            .await;

            match inserted {
                Ok(_) => {}
                // Dropping `tx` rolls it back before the next attempt.
                Err(e) if is_slug_clash(&e) && retries < SLUG_RETRIES => {
                    retries += 1;
                    tracing::debug!(slug = %slug, retries, "Product slug taken concurrently");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            let images = insert_images(&mut tx, &id, &request.images).await?;

            bump_revision(&mut tx).await?;
            tx.commit().await?;
            break (slug, images);
        };

        tracing::info!(product_id = %id, slug = %slug, "Created product");

        Ok(Product {
            id,
            title,
            slug,
            description: request.description.clone(),
            tags,
            published: request.published,
            price: request.price,
            images,
            updated_at: now,
            version: 1,
        })
    }

    /// Update a product with optimistic concurrency control.
    pub async fn update_product(
        &self,
        id: &str,
        request: &UpdateProductRequest,
    ) -> Result<Product, AppError> {
        let existing = self
            .get_product(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Product {} not found", id)))?;

        check_expected_version(request.expected_version, existing.version)?;

        let title = match &request.title {
            Some(title) if title.trim().is_empty() => {
                return Err(AppError::Validation("Title is required".to_string()));
            }
            Some(title) => title.trim().to_string(),
            None => existing.title.clone(),
        };
        let tags = match &request.tags {
            Some(tags) => normalize_tags(tags, self.tag_case)?,
            None => existing.tags.clone(),
        };
        let description = match &request.description {
            Some(description) => description.clone(),
            None => existing.description.clone(),
        };
        let published = request.published.unwrap_or(existing.published);
        let price = request.price.unwrap_or(existing.price);
        let tags_json = serde_json::to_string(&tags)?;
        let now = Utc::now().to_rfc3339();
        let new_version = existing.version + 1;

        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE products SET title = ?, description = ?, tags = ?, published = ?, price = ?, updated_at = ?, version = ? WHERE id = ? AND version = ?"
        )
        .bind(&title)
        .bind(&description)
        .bind(&tags_json)
        .bind(published as i32)
        .bind(price)
        .bind(&now)
        .bind(new_version)
        .bind(id)
        .bind(existing.version)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            // Race condition - version changed between read and write
            let current: Option<i64> =
                sqlx::query_scalar("SELECT version FROM products WHERE id = ?")
                    .bind(id)
                    .fetch_optional(&mut *tx)
                    .await?;
            return Err(AppError::Conflict {
                message: "Concurrent modification detected".to_string(),
                current_version: current.unwrap_or(0),
            });
        }

        let images = match &request.images {
            Some(new_images) => {
                sqlx::query("DELETE FROM product_images WHERE product_id = ?")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                insert_images(&mut tx, id, new_images).await?
            }
            None => existing.images.clone(),
        };

        bump_revision(&mut tx).await?;
        tx.commit().await?;

        Ok(Product {
            id: id.to_string(),
            title,
            slug: existing.slug,
            description,
            tags,
            published,
            price,
            images,
            updated_at: now,
            version: new_version,
        })
    }

    /// Delete a product together with its images and memberships.
    pub async fn delete_product(&self, id: &str) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("DELETE FROM products WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Product {} not found", id)));
        }

        sqlx::query("DELETE FROM product_images WHERE product_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM product_collections WHERE product_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        bump_revision(&mut tx).await?;
        tx.commit().await?;

        tracing::info!(product_id = %id, "Deleted product");
        Ok(())
    }

    // ==================== MEMBERSHIP OPERATIONS ====================

    /// Put a product in a collection; a no-op if it already is.
    pub async fn add_product_to_collection(
        &self,
        collection_id: &str,
        product_id: &str,
    ) -> Result<(), AppError> {
        if self.get_collection(collection_id).await?.is_none() {
            return Err(AppError::NotFound(format!(
                "Collection {} not found",
                collection_id
            )));
        }
        let exists = sqlx::query("SELECT 1 FROM products WHERE id = ?")
            .bind(product_id)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            return Err(AppError::NotFound(format!("Product {} not found", product_id)));
        }

        let result = sqlx::query(
            "INSERT OR IGNORE INTO product_collections (product_id, collection_id, created_at) VALUES (?, ?, ?)",
        )
        .bind(product_id)
        .bind(collection_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            self.increment_revision().await?;
        }
        Ok(())
    }

    /// Take a product out of a collection.
    pub async fn remove_product_from_collection(
        &self,
        collection_id: &str,
        product_id: &str,
    ) -> Result<(), AppError> {
        let result =
            sqlx::query("DELETE FROM product_collections WHERE collection_id = ? AND product_id = ?")
                .bind(collection_id)
                .bind(product_id)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!(
                "Product {} is not in collection {}",
                product_id, collection_id
            )));
        }

        self.increment_revision().await?;
        Ok(())
    }

    /// Count the membership rows of a collection. Unknown ids count as zero.
    pub async fn count_collection_products(&self, collection_id: &str) -> Result<i64, AppError> {
        let row =
            sqlx::query("SELECT COUNT(*) AS count FROM product_collections WHERE collection_id = ?")
                .bind(collection_id)
                .fetch_one(&self.pool)
                .await?;
        let count: i64 = row.get("count");
        Ok(count.max(0))
    }

    /// Product counts for every collection, in collection sort order.
    pub async fn count_products_per_collection(
        &self,
    ) -> Result<Vec<CollectionProductCount>, AppError> {
        let rows = sqlx::query(
            r#"SELECT c.id AS collection_id, COUNT(pc.product_id) AS count
               FROM collections c
               LEFT JOIN product_collections pc ON pc.collection_id = c.id
               GROUP BY c.id
               ORDER BY c.sort_order, c.title"#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| CollectionProductCount {
                collection_id: row.get("collection_id"),
                count: row.get::<i64, _>("count").max(0),
            })
            .collect())
    }

    /// Products explicitly assigned to a collection.
    ///
    /// Membership rows whose product no longer exists are skipped with a warning.
    pub async fn list_collection_products(
        &self,
        collection_id: &str,
    ) -> Result<Vec<CollectionProduct>, AppError> {
        let rows = sqlx::query(
            r#"SELECT pc.product_id AS member_id,
                      p.id, p.title, p.slug, p.description, p.tags, p.published, p.price,
                      p.updated_at, p.version
               FROM product_collections pc
               LEFT JOIN products p ON p.id = pc.product_id
               WHERE pc.collection_id = ?
               ORDER BY pc.rowid"#,
        )
        .bind(collection_id)
        .fetch_all(&self.pool)
        .await?;

        let image_rows = sqlx::query(
            r#"SELECT id, product_id, url, is_primary, position FROM product_images
               WHERE product_id IN (SELECT product_id FROM product_collections WHERE collection_id = ?)
               ORDER BY product_id, position"#,
        )
        .bind(collection_id)
        .fetch_all(&self.pool)
        .await?;
        let mut images = group_images(&image_rows);

        let mut products = Vec::with_capacity(rows.len());
        for row in &rows {
            let product_id: Option<String> = row.get("id");
            let Some(product_id) = product_id else {
                let member_id: String = row.get("member_id");
                tracing::warn!(
                    collection_id,
                    product_id = %member_id,
                    "Skipping membership row without a product"
                );
                continue;
            };

            let product = product_from_row(row, images.remove(&product_id).unwrap_or_default());
            let primary = primary_image(&product.images).cloned();
            products.push(CollectionProduct {
                product,
                primary_image: primary,
            });
        }

        Ok(products)
    }

    // ==================== LINK OPERATIONS ====================

    /// Collections linked from `parent_id`, in collection sort order.
    pub async fn list_linked_collections(
        &self,
        parent_id: &str,
    ) -> Result<Vec<Collection>, AppError> {
        let rows = sqlx::query(
            r#"SELECT c.id, c.title, c.slug, c.icon, c.description, c.published, c.sort_order,
                      c.tags, c.updated_at, c.version
               FROM collection_links l
               JOIN collections c ON c.id = l.linked_collection_id
               WHERE l.parent_collection_id = ?
               ORDER BY c.sort_order, c.title"#,
        )
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(collection_from_row).collect())
    }

    // ==================== HELPERS ====================

    /// Unused slug derived from `title` in `table`.
    async fn next_slug(
        &self,
        table: &'static str,
        title: &str,
        id: &str,
    ) -> Result<String, AppError> {
        let mut base = slugify(title);
        if base.is_empty() {
            base = id.chars().take(8).collect();
        }

        let sql = format!("SELECT slug FROM {} WHERE slug = ? OR slug LIKE ?", table);
        let taken: HashSet<String> = sqlx::query(&sql)
            .bind(&base)
            .bind(format!("{}-%", base))
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(|row| row.get("slug"))
            .collect();

        Ok(unique_slug(&base, &taken))
    }
}

impl LinkStore for Repository {
    async fn linked_collection_ids(&self, parent_id: &str) -> Result<Vec<String>, AppError> {
        let rows = sqlx::query(
            "SELECT linked_collection_id FROM collection_links WHERE parent_collection_id = ? ORDER BY rowid",
        )
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| row.get("linked_collection_id"))
            .collect())
    }

    async fn add_link(&self, parent_id: &str, linked_id: &str) -> Result<(), AppError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO collection_links (parent_collection_id, linked_collection_id, created_at) VALUES (?, ?, ?)",
        )
        .bind(parent_id)
        .bind(linked_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            self.increment_revision().await?;
        }
        Ok(())
    }

    async fn remove_link(&self, parent_id: &str, linked_id: &str) -> Result<(), AppError> {
        let result = sqlx::query(
            "DELETE FROM collection_links WHERE parent_collection_id = ? AND linked_collection_id = ?",
        )
        .bind(parent_id)
        .bind(linked_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            self.increment_revision().await?;
        }
        Ok(())
    }
}

fn check_expected_version(expected: Option<i64>, current: i64) -> Result<(), AppError> {
    match expected {
        Some(expected) if expected != current => Err(AppError::Conflict {
            message: format!(
                "Version mismatch: expected {}, current {}",
                expected, current
            ),
            current_version: current,
        }),
        _ => Ok(()),
    }
}

/// A UNIQUE violation on a `slug` column.
fn is_slug_clash(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.is_unique_violation() && db.message().contains(".slug"),
        _ => false,
    }
}

async fn bump_revision(tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>) -> Result<(), AppError> {
    let now = Utc::now().to_rfc3339();
    sqlx::query("UPDATE meta SET revision_id = revision_id + 1, generated_at = ? WHERE id = 1")
        .bind(&now)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn insert_images(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    product_id: &str,
    images: &[NewProductImage],
) -> Result<Vec<ProductImage>, AppError> {
    let mut inserted = Vec::with_capacity(images.len());

    for (position, image) in images.iter().enumerate() {
        let stored = ProductImage {
            id: uuid::Uuid::new_v4().to_string(),
            url: image.url.trim().to_string(),
            is_primary: image.is_primary,
            position: position as i64,
        };

        sqlx::query(
            "INSERT INTO product_images (id, product_id, url, is_primary, position) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&stored.id)
        .bind(product_id)
        .bind(&stored.url)
        .bind(stored.is_primary as i32)
        .bind(stored.position)
        .execute(&mut **tx)
        .await?;

        inserted.push(stored);
    }

    Ok(inserted)
}

// Helper functions for row conversion

fn collection_from_row(row: &SqliteRow) -> Collection {
    let id: String = row.get("id");
    let published: i32 = row.get("published");
    let tags_str: String = row.get("tags");
    Collection {
        tags: parse_stored_tags(&tags_str, &id),
        id,
        title: row.get("title"),
        slug: row.get("slug"),
        icon: row.get("icon"),
        description: row.get("description"),
        published: published != 0,
        sort_order: row.get("sort_order"),
        updated_at: row.get("updated_at"),
        version: row.get("version"),
    }
}

fn product_from_row(row: &SqliteRow, images: Vec<ProductImage>) -> Product {
    let id: String = row.get("id");
    let published: i32 = row.get("published");
    let tags_str: String = row.get("tags");
    Product {
        tags: parse_stored_tags(&tags_str, &id),
        id,
        title: row.get("title"),
        slug: row.get("slug"),
        description: row.get("description"),
        published: published != 0,
        price: row.get("price"),
        images,
        updated_at: row.get("updated_at"),
        version: row.get("version"),
    }
}

fn image_from_row(row: &SqliteRow) -> ProductImage {
    let is_primary: i32 = row.get("is_primary");
    ProductImage {
        id: row.get("id"),
        url: row.get("url"),
        is_primary: is_primary != 0,
        position: row.get("position"),
    }
}

/// Group image rows by product, keeping the query's position order.
fn group_images(rows: &[SqliteRow]) -> HashMap<String, Vec<ProductImage>> {
    let mut grouped: HashMap<String, Vec<ProductImage>> = HashMap::new();
    for row in rows {
        let product_id: String = row.get("product_id");
        grouped.entry(product_id).or_default().push(image_from_row(row));
    }
    grouped
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::db::init_database;

    async fn repo(case: TagCase) -> (Repository, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let pool = init_database(&temp_dir.path().join("test.sqlite"))
            .await
            .expect("Failed to init DB");
        (Repository::new(pool, case), temp_dir)
    }

    fn new_collection(title: &str, tags: &[&str]) -> CreateCollectionRequest {
        CreateCollectionRequest {
            title: title.to_string(),
            icon: "star".to_string(),
            description: None,
            published: true,
            sort_order: 0,
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    fn new_product(title: &str, images: &[(&str, bool)]) -> CreateProductRequest {
        CreateProductRequest {
            title: title.to_string(),
            description: None,
            tags: vec![],
            published: true,
            price: Some(12.5),
            images: images
                .iter()
                .map(|(url, is_primary)| NewProductImage {
                    url: url.to_string(),
                    is_primary: *is_primary,
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_count_for_empty_collection_is_zero() {
        let (repo, _dir) = repo(TagCase::Sensitive).await;
        let collection = repo.create_collection(&new_collection("Empty", &[])).await.unwrap();

        assert_eq!(repo.count_collection_products(&collection.id).await.unwrap(), 0);
        assert_eq!(repo.count_collection_products("no-such-id").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_orphan_membership_rows_are_skipped() {
        let (repo, _dir) = repo(TagCase::Sensitive).await;
        let collection = repo.create_collection(&new_collection("Toys", &[])).await.unwrap();
        let product = repo
            .create_product(&new_product("Robot", &[("a.jpg", false), ("b.jpg", true)]))
            .await
            .unwrap();
        repo.add_product_to_collection(&collection.id, &product.id)
            .await
            .unwrap();

        sqlx::query(
            "INSERT INTO product_collections (product_id, collection_id, created_at) VALUES ('ghost', ?, ?)",
        )
        .bind(&collection.id)
        .bind(Utc::now().to_rfc3339())
        .execute(&repo.pool)
        .await
        .unwrap();

        let listed = repo.list_collection_products(&collection.id).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].product.id, product.id);
        assert_eq!(listed[0].primary_image.as_ref().unwrap().url, "b.jpg");

        // The count is taken over membership rows, orphans included.
        assert_eq!(repo.count_collection_products(&collection.id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_stored_non_string_tags_are_dropped() {
        let (repo, _dir) = repo(TagCase::Sensitive).await;
        let collection = repo.create_collection(&new_collection("Mixed", &["stem"])).await.unwrap();

        sqlx::query("UPDATE collections SET tags = '[\"stem\", 7, \"art\"]' WHERE id = ?")
            .bind(&collection.id)
            .execute(&repo.pool)
            .await
            .unwrap();

        let loaded = repo.get_collection(&collection.id).await.unwrap().unwrap();
        assert_eq!(loaded.tags, vec!["stem".to_string(), "art".to_string()]);
    }

    #[tokio::test]
    async fn test_slugs_are_unique() {
        let (repo, _dir) = repo(TagCase::Sensitive).await;
        let first = repo.create_collection(&new_collection("Arts & Crafts", &[])).await.unwrap();
        let second = repo.create_collection(&new_collection("Arts  Crafts", &[])).await.unwrap();
        let third = repo.create_collection(&new_collection("!!!", &[])).await.unwrap();

        assert_eq!(first.slug, "arts-crafts");
        assert_eq!(second.slug, "arts-crafts-2");
        assert_eq!(third.slug, third.id.chars().take(8).collect::<String>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creates_get_distinct_slugs() {
        let (repo, _dir) = repo(TagCase::Sensitive).await;

        let mut handles = Vec::new();
        for _ in 0..12 {
            let repo = repo.clone();
            handles.push(tokio::spawn(async move {
                repo.create_collection(&new_collection("Toys", &[]))
                    .await
                    .map(|c| c.slug)
            }));
        }
        for _ in 0..8 {
            let repo = repo.clone();
            handles.push(tokio::spawn(async move {
                repo.create_product(&new_product("Kit", &[("kit.jpg", true)]))
                    .await
                    .map(|p| p.slug)
            }));
        }

        let mut slugs = HashSet::new();
        for handle in handles {
            let slug = handle.await.unwrap().expect("create should pick a free slug");
            assert!(slugs.insert(slug));
        }

        assert!(slugs.contains("toys") && slugs.contains("toys-12"));
        assert!(slugs.contains("kit") && slugs.contains("kit-8"));
        assert_eq!(repo.list_collections(false).await.unwrap().len(), 12);
        let products = repo.list_products().await.unwrap();
        assert_eq!(products.len(), 8);
        assert!(products.iter().all(|p| p.images.len() == 1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_lost_update_reports_current_version() {
        let (repo, _dir) = repo(TagCase::Sensitive).await;
        let product = repo.create_product(&new_product("Kit", &[])).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let repo = repo.clone();
            let id = product.id.clone();
            handles.push(tokio::spawn(async move {
                let request = UpdateProductRequest {
                    title: Some(format!("Kit {}", i)),
                    ..Default::default()
                };
                repo.update_product(&id, &request).await
            }));
        }

        let mut applied = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => applied += 1,
                // Somebody else won, so the reported version is past the first one.
                Err(AppError::Conflict { current_version, .. }) => assert!(current_version > 1),
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        let stored = repo.get_product(&product.id).await.unwrap().unwrap();
        assert!(applied >= 1);
        assert_eq!(stored.version, 1 + applied);
    }

    #[tokio::test]
    async fn test_links_are_idempotent() {
        let (repo, _dir) = repo(TagCase::Sensitive).await;
        let a = repo.create_collection(&new_collection("A", &[])).await.unwrap();
        let b = repo.create_collection(&new_collection("B", &[])).await.unwrap();

        repo.add_link(&a.id, &b.id).await.unwrap();
        repo.add_link(&a.id, &b.id).await.unwrap();
        assert_eq!(repo.linked_collection_ids(&a.id).await.unwrap(), vec![b.id.clone()]);

        repo.remove_link(&a.id, &b.id).await.unwrap();
        repo.remove_link(&a.id, &b.id).await.unwrap();
        assert!(repo.linked_collection_ids(&a.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_collection_clears_memberships_and_links() {
        let (repo, _dir) = repo(TagCase::Sensitive).await;
        let a = repo.create_collection(&new_collection("A", &[])).await.unwrap();
        let b = repo.create_collection(&new_collection("B", &[])).await.unwrap();
        let product = repo.create_product(&new_product("P", &[])).await.unwrap();

        repo.add_product_to_collection(&b.id, &product.id).await.unwrap();
        repo.add_link(&a.id, &b.id).await.unwrap();
        repo.add_link(&b.id, &a.id).await.unwrap();

        repo.delete_collection(&b.id).await.unwrap();

        assert!(repo.linked_collection_ids(&a.id).await.unwrap().is_empty());
        assert!(repo.linked_collection_ids(&b.id).await.unwrap().is_empty());
        assert_eq!(repo.count_collection_products(&b.id).await.unwrap(), 0);
        assert!(matches!(
            repo.delete_collection(&b.id).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_add_tag_uses_case_policy() {
        let (repo, _dir) = repo(TagCase::Insensitive).await;
        let c = repo.create_collection(&new_collection("Tagged", &["Stem"])).await.unwrap();

        assert!(matches!(
            repo.add_collection_tag(&c.id, "STEM").await,
            Err(AppError::Validation(_))
        ));
        let updated = repo.add_collection_tag(&c.id, "art").await.unwrap();
        assert_eq!(updated.tags, vec!["Stem".to_string(), "art".to_string()]);
        assert_eq!(updated.version, 2);
    }
}
