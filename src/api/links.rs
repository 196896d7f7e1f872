//! Linked collection API endpoints.

use axum::{
    extract::{Path, State},
    Json,
};

use super::{error, success, ApiResult};
use crate::catalog::{LinkedCollectionEditor, PendingChanges};
use crate::errors::AppError;
use crate::models::{Collection, LinkCommitResult};
use crate::AppState;

/// GET /api/collections/:id/links - Collections linked from a collection.
pub async fn list_links(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Vec<Collection>> {
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

    match state.repo.list_linked_collections(&id).await {
        Ok(linked) => success(linked, revision_id),
        Err(e) => error(e, revision_id),
    }
}

/// POST /api/collections/:id/links/commit - Apply staged link changes.
///
/// Removals run before additions. When a store call fails the already applied
/// calls stay applied and the response is a `PARTIAL_COMMIT` error whose
/// details list what was applied and what is still pending; posting the
/// pending changes again retries only those.
pub async fn commit_links(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(changes): Json<PendingChanges>,
) -> ApiResult<LinkCommitResult> {
    let revision_id = state.repo.get_revision_id().await.unwrap_or(0);

    if let Err(e) = validate_changes(&state, &id, &changes).await {
        return error(e, revision_id);
    }

    let span = tracing::info_span!("linked_collections", parent = %id);
    let mut editor = match LinkedCollectionEditor::load(&*state.repo, &id, span).await {
        Ok(editor) => editor.on_changes(|pending| {
            tracing::debug!(
                to_add = pending.to_add.len(),
                to_remove = pending.to_remove.len(),
                "Staged link changes"
            );
        }),
        Err(e) => return error(e, revision_id),
    };

    for target in &changes.to_remove {
        if let Err(e) = editor.stage_remove(target) {
            return error(e, revision_id);
        }
    }
    for target in &changes.to_add {
        if let Err(e) = editor.stage_add(target) {
            return error(e, revision_id);
        }
    }

    let report = editor.commit(&*state.repo).await;
    let new_revision = state.repo.get_revision_id().await.unwrap_or(revision_id);

    if let Some(failed) = &report.failed {
        let message = format!(
            "Link commit stopped at {:?} {}: {}",
            failed.op, failed.collection_id, failed.message
        );
        return error(
            AppError::PartialCommit {
                message,
                report: Box::new(report),
            },
            new_revision,
        );
    }

    match state.repo.list_linked_collections(&id).await {
        Ok(linked) => success(LinkCommitResult { report, linked }, new_revision),
        Err(e) => error(e, new_revision),
    }
}

/// Reject a change set before any store write.
async fn validate_changes(
    state: &AppState,
    parent_id: &str,
    changes: &PendingChanges,
) -> Result<(), AppError> {
    if state.repo.get_collection(parent_id).await?.is_none() {
        return Err(AppError::NotFound(format!(
            "Collection {} not found",
            parent_id
        )));
    }

    if let Some(id) = changes.overlap() {
        return Err(AppError::Validation(format!(
            "Collection {} is staged for both add and remove",
            id
        )));
    }

    // Removing a link to a deleted collection is allowed; adding one is not.
    let missing = state.repo.missing_collection_ids(&changes.to_add).await?;
    if !missing.is_empty() {
        return Err(AppError::NotFound(format!(
            "Collections not found: {}",
            missing.join(", ")
        )));
    }

    Ok(())
}
