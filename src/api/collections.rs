//! Collection API endpoints.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::Utc;

use super::{error, success, ApiResult};
use crate::catalog::{paginate, DeleteTarget, Page, PressOutcome};
use crate::errors::AppError;
use crate::models::{
    AddTagRequest, Collection, CollectionProduct, CollectionProductCount,
    CreateCollectionRequest, DeleteStatus, ListCollectionsQuery, PageQuery,
    UpdateCollectionRequest,
};
use crate::AppState;

/// GET /api/collections - List collections in sort order.
pub async fn list_collections(
    State(state): State<AppState>,
    Query(query): Query<ListCollectionsQuery>,
) -> ApiResult<Vec<Collection>> {
    let revision_id = state.repo.get_revision_id().await.unwrap_or(0);
    let published_only = query.published.unwrap_or(false);

    match state.repo.list_collections(published_only).await {
        Ok(collections) => success(collections, revision_id),
        Err(e) => error(e, revision_id),
    }
}

/// GET /api/collections/:id - Get a single collection.
pub async fn get_collection(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Collection> {
    let revision_id = state.repo.get_revision_id().await.unwrap_or(0);

    match state.repo.get_collection(&id).await {
        Ok(Some(collection)) => success(collection, revision_id),
        Ok(None) => error(
            AppError::NotFound(format!("Collection {} not found", id)),
            revision_id,
        ),
        Err(e) => error(e, revision_id),
    }
}

/// POST /api/collections - Create a new collection.
pub async fn create_collection(
    State(state): State<AppState>,
    Json(request): Json<CreateCollectionRequest>,
) -> ApiResult<Collection> {
    let revision_id = state.repo.get_revision_id().await.unwrap_or(0);

    if request.title.trim().is_empty() {
        return error(
            AppError::Validation("Title is required".to_string()),
            revision_id,
        );
    }
    if request.icon.trim().is_empty() {
        return error(
            AppError::Validation("Icon is required".to_string()),
            revision_id,
        );
    }

    match state.repo.create_collection(&request).await {
        Ok(collection) => {
            let new_revision = state.repo.get_revision_id().await.unwrap_or(revision_id);
            success(collection, new_revision)
        }
        Err(e) => error(e, revision_id),
    }
}

/// PUT /api/collections/:id - Update a collection.
pub async fn update_collection(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<UpdateCollectionRequest>,
) -> ApiResult<Collection> {
    let revision_id = state.repo.get_revision_id().await.unwrap_or(0);

    match state.repo.update_collection(&id, &request).await {
        Ok(collection) => {
            let new_revision = state.repo.get_revision_id().await.unwrap_or(revision_id);
            success(collection, new_revision)
        }
        Err(e) => error(e, revision_id),
    }
}

/// POST /api/collections/:id/tags - Add one tag to a collection.
pub async fn add_collection_tag(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<AddTagRequest>,
) -> ApiResult<Collection> {
    let revision_id = state.repo.get_revision_id().await.unwrap_or(0);

    match state.repo.add_collection_tag(&id, &request.tag).await {
        Ok(collection) => {
            let new_revision = state.repo.get_revision_id().await.unwrap_or(revision_id);
            success(collection, new_revision)
        }
        Err(e) => error(e, revision_id),
    }
}

/// DELETE /api/collections/:id - Arm, then confirm, deletion of a collection.
pub async fn delete_collection(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<DeleteStatus> {
    let revision_id = state.repo.get_revision_id().await.unwrap_or(0);

    match state.repo.get_collection(&id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return error(
                AppError::NotFound(format!("Collection {} not found", id)),
                revision_id,
            )
        }
        Err(e) => return error(e, revision_id),
    }

    match state
        .delete_guard
        .press(DeleteTarget::Collection, &id, Utc::now())
    {
        PressOutcome::Armed { expires_at } => {
            tracing::debug!(collection_id = %id, %expires_at, "Collection delete armed");
            success(DeleteStatus::Armed { expires_at }, revision_id)
        }
        PressOutcome::Confirmed => match state.repo.delete_collection(&id).await {
            Ok(()) => {
                let new_revision = state.repo.get_revision_id().await.unwrap_or(revision_id);
                success(DeleteStatus::Deleted, new_revision)
            }
            Err(e) => error(e, revision_id),
        },
    }
}

/// GET /api/collections/counts - Product counts for every collection.
pub async fn collection_product_counts(
    State(state): State<AppState>,
) -> ApiResult<Vec<CollectionProductCount>> {
    let revision_id = state.repo.get_revision_id().await.unwrap_or(0);

    match state.repo.count_products_per_collection().await {
        Ok(counts) => success(counts, revision_id),
        Err(e) => error(e, revision_id),
    }
}

/// GET /api/collections/:id/products/count - Count products in a collection.
pub async fn count_collection_products(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<CollectionProductCount> {
    let revision_id = state.repo.get_revision_id().await.unwrap_or(0);

    match state.repo.count_collection_products(&id).await {
        Ok(count) => success(
            CollectionProductCount {
                collection_id: id,
                count,
            },
            revision_id,
        ),
        Err(e) => error(e, revision_id),
    }
}

/// GET /api/collections/:id/products - One page of the products in a collection.
pub async fn list_collection_products(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Page<CollectionProduct>> {
    let revision_id = state.repo.get_revision_id().await.unwrap_or(0);

    match state.repo.list_collection_products(&id).await {
        Ok(products) => success(paginate(products, query.page, query.per_page), revision_id),
        Err(e) => error(e, revision_id),
    }
}

/// PUT /api/collections/:id/products/:product_id - Add a product to a collection.
pub async fn add_collection_product(
    State(state): State<AppState>,
    Path((id, product_id)): Path<(String, String)>,
) -> ApiResult<CollectionProductCount> {
    let revision_id = state.repo.get_revision_id().await.unwrap_or(0);

    if let Err(e) = state.repo.add_product_to_collection(&id, &product_id).await {
        return error(e, revision_id);
    }
    membership_count(&state, id, revision_id).await
}

/// DELETE /api/collections/:id/products/:product_id - Remove a product from a collection.
pub async fn remove_collection_product(
    State(state): State<AppState>,
    Path((id, product_id)): Path<(String, String)>,
) -> ApiResult<CollectionProductCount> {
    let revision_id = state.repo.get_revision_id().await.unwrap_or(0);

    if let Err(e) = state
        .repo
        .remove_product_from_collection(&id, &product_id)
        .await
    {
        return error(e, revision_id);
    }
    membership_count(&state, id, revision_id).await
}

/// Answer a membership change with the collection's new count.
async fn membership_count(
    state: &AppState,
    collection_id: String,
    revision_id: i64,
) -> ApiResult<CollectionProductCount> {
    let new_revision = state.repo.get_revision_id().await.unwrap_or(revision_id);
    match state.repo.count_collection_products(&collection_id).await {
        Ok(count) => success(
            CollectionProductCount {
                collection_id,
                count,
            },
            new_revision,
        ),
        Err(e) => error(e, new_revision),
    }
}
