//! Product API endpoints.

use axum::{
    extract::{Path, State},
    Json,
};
use chrono::Utc;

use super::{error, success, ApiResult};
use crate::catalog::{match_collections, CollectionMatch, DeleteTarget, PressOutcome};
use crate::errors::AppError;
use crate::models::{
    CreateProductRequest, DeleteStatus, NewProductImage, Product, UpdateProductRequest,
};
use crate::AppState;

/// GET /api/products - List all products.
pub async fn list_products(State(state): State<AppState>) -> ApiResult<Vec<Product>> {
    let revision_id = state.repo.get_revision_id().await.unwrap_or(0);

    match state.repo.list_products().await {
        Ok(products) => success(products, revision_id),
        Err(e) => error(e, revision_id),
    }
}

/// GET /api/products/:id - Get a single product.
pub async fn get_product(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Product> {
    let revision_id = state.repo.get_revision_id().await.unwrap_or(0);

    match state.repo.get_product(&id).await {
        Ok(Some(product)) => success(product, revision_id),
        Ok(None) => error(
            AppError::NotFound(format!("Product {} not found", id)),
            revision_id,
        ),
        Err(e) => error(e, revision_id),
    }
}

/// POST /api/products - Create a new product.
pub async fn create_product(
    State(state): State<AppState>,
    Json(request): Json<CreateProductRequest>,
) -> ApiResult<Product> {
    let revision_id = state.repo.get_revision_id().await.unwrap_or(0);

    if request.title.trim().is_empty() {
        return error(
            AppError::Validation("Title is required".to_string()),
            revision_id,
        );
    }
    if let Err(e) = validate_price(request.price).and_then(|_| validate_images(&request.images)) {
        return error(e, revision_id);
    }

    match state.repo.create_product(&request).await {
        Ok(product) => {
            let new_revision = state.repo.get_revision_id().await.unwrap_or(revision_id);
            success(product, new_revision)
        }
        Err(e) => error(e, revision_id),
    }
}

/// PUT /api/products/:id - Update a product.
pub async fn update_product(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<UpdateProductRequest>,
) -> ApiResult<Product> {
    let revision_id = state.repo.get_revision_id().await.unwrap_or(0);

    let images = request.images.as_deref().unwrap_or_default();
    let price = request.price.flatten();
    if let Err(e) = validate_price(price).and_then(|_| validate_images(images)) {
        return error(e, revision_id);
    }

    match state.repo.update_product(&id, &request).await {
        Ok(product) => {
            let new_revision = state.repo.get_revision_id().await.unwrap_or(revision_id);
            success(product, new_revision)
        }
        Err(e) => error(e, revision_id),
    }
}

/// DELETE /api/products/:id - Arm, then confirm, deletion of a product.
pub async fn delete_product(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<DeleteStatus> {
    let revision_id = state.repo.get_revision_id().await.unwrap_or(0);

    match state.repo.get_product(&id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return error(
                AppError::NotFound(format!("Product {} not found", id)),
                revision_id,
            )
        }
        Err(e) => return error(e, revision_id),
    }

    match state.delete_guard.press(DeleteTarget::Product, &id, Utc::now()) {
        PressOutcome::Armed { expires_at } => {
            tracing::debug!(product_id = %id, %expires_at, "Product delete armed");
            success(DeleteStatus::Armed { expires_at }, revision_id)
        }
        PressOutcome::Confirmed => match state.repo.delete_product(&id).await {
            Ok(()) => {
                let new_revision = state.repo.get_revision_id().await.unwrap_or(revision_id);
                success(DeleteStatus::Deleted, new_revision)
            }
            Err(e) => error(e, revision_id),
        },
    }
}

/// GET /api/products/:id/matching-collections - Published collections sharing a tag.
pub async fn matching_collections(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Vec<CollectionMatch>> {
    let revision_id = state.repo.get_revision_id().await.unwrap_or(0);

    let product = match state.repo.get_product(&id).await {
        Ok(Some(product)) => product,
        Ok(None) => {
            return error(
                AppError::NotFound(format!("Product {} not found", id)),
                revision_id,
            )
        }
        Err(e) => return error(e, revision_id),
    };

    match state.repo.list_collections(true).await {
        Ok(collections) => success(
            match_collections(&product.tags, &collections, state.config.tag_case),
            revision_id,
        ),
        Err(e) => error(e, revision_id),
    }
}

fn validate_price(price: Option<f64>) -> Result<(), AppError> {
    match price {
        Some(p) if !p.is_finite() || p < 0.0 => Err(AppError::Validation(
            "Price must be a non-negative number".to_string(),
        )),
        _ => Ok(()),
    }
}

fn validate_images(images: &[NewProductImage]) -> Result<(), AppError> {
    if images.iter().any(|img| img.url.trim().is_empty()) {
        return Err(AppError::Validation("Image URL is required".to_string()));
    }
    Ok(())
}
