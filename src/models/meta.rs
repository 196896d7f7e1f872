//! Store-wide metadata and status payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Collection;
use crate::catalog::CommitReport;

/// Revision information for change detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionInfo {
    pub revision_id: i64,
    pub generated_at: String,
}

/// Answer to a delete request.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum DeleteStatus {
    /// First press: repeat before `expires_at` to delete.
    Armed {
        #[serde(rename = "expiresAt")]
        expires_at: DateTime<Utc>,
    },
    Deleted,
}

/// Result of a successful link commit.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkCommitResult {
    pub report: CommitReport,
    pub linked: Vec<Collection>,
}
