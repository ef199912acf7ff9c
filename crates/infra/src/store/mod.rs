//! Purchase storage boundary.
//!
//! This module defines the storage contract the purchasing services run
//! against, without making storage assumptions. Two implementations exist:
//!
//! - [`InMemoryPurchaseStore`] for tests and local development
//! - [`PostgresPurchaseStore`] for production
//!
//! ## Atomicity
//!
//! Single-record writes (`update`, `change_status`, `set_deleted`) are one
//! atomic read-modify-write each: two concurrent status changes on the same
//! record both land in the history, in some order. `bulk_write` items are
//! independent; one failing item never rolls back another.

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use procura_core::{DomainError, PurchaseId};
use procura_purchasing::{
    MatchKey, Predicate, Purchase, PurchasePatch, PurchaseStatus, Sort, StatusChange, UserRef,
};

pub use in_memory::InMemoryPurchaseStore;
pub use postgres::PostgresPurchaseStore;

/// Storage operation error.
///
/// Domain failures (missing record, duplicate key, rejected values) keep their
/// typed [`DomainError`]; everything else is an opaque backend error carrying
/// its original cause.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// A bulk write exceeded the backend's payload limit. Retrying with fewer
    /// operations may succeed.
    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("storage backend failed during {operation}: {source}")]
    Backend {
        operation: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl StoreError {
    pub fn backend(
        operation: &'static str,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Backend {
            operation,
            source: source.into(),
        }
    }

    pub fn domain(&self) -> Option<&DomainError> {
        match self {
            Self::Domain(err) => Some(err),
            _ => None,
        }
    }
}

/// Window and order for `find_all`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FindOptions {
    pub skip: u64,
    pub limit: Option<u64>,
    pub sort: Sort,
}

/// How a bulk item treats an existing record with the same key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// Merge into the match, or insert when there is none.
    #[default]
    Upsert,
    /// Insert only; an existing match is a duplicate-key failure.
    Insert,
}

/// One conditional write of a bulk operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertOp {
    /// Position of the source row in the submitted batch.
    pub index: usize,
    pub match_key: MatchKey,
    pub key_value: String,
    /// Sanitized fields merged on match and written on insert.
    pub set: PurchasePatch,
    /// Initial status, insert only.
    pub status: Option<PurchaseStatus>,
    /// Seed the history with `status` on insert.
    pub seed_history: bool,
    pub created_by: Option<UserRef>,
    pub mode: WriteMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    DuplicateKey,
    Other,
}

impl FailureKind {
    pub fn of(err: &StoreError) -> Self {
        match err {
            StoreError::Domain(DomainError::Validation { .. } | DomainError::InvalidId(_)) => {
                Self::Validation
            }
            StoreError::Domain(DomainError::DuplicateKey { .. }) => Self::DuplicateKey,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteFailure {
    pub index: usize,
    pub kind: FailureKind,
    pub message: String,
}

/// Outcome of one `bulk_write` call.
///
/// `matched` counts every operation that found an existing record, including
/// those that then changed it; `modified` is the subset that changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkWriteReport {
    pub inserted: usize,
    pub modified: usize,
    pub matched: usize,
    pub failures: Vec<WriteFailure>,
}

/// Reject a bulk payload whose serialized size exceeds `limit`.
pub(crate) fn check_payload(ops: &[UpsertOp], limit: Option<usize>) -> Result<(), StoreError> {
    let Some(limit) = limit else {
        return Ok(());
    };
    let size = serde_json::to_vec(ops)
        .map_err(|e| StoreError::backend("measure_payload", e))?
        .len();
    if size > limit {
        return Err(StoreError::PayloadTooLarge { size, limit });
    }
    Ok(())
}

/// Storage contract for purchases.
#[async_trait::async_trait]
pub trait PurchaseStore: Send + Sync {
    async fn find_all(
        &self,
        predicate: &Predicate,
        options: &FindOptions,
    ) -> Result<Vec<Purchase>, StoreError>;

    async fn count(&self, predicate: &Predicate) -> Result<u64, StoreError>;

    /// Any record with this id, soft-deleted ones included.
    async fn find_by_id(&self, id: PurchaseId) -> Result<Option<Purchase>, StoreError>;

    /// Persist a new record. Fails without a creator reference or when the
    /// entry number is taken by a live record.
    async fn create(&self, purchase: Purchase) -> Result<Purchase, StoreError>;

    /// Merge a normalized patch into a live record.
    async fn update(&self, id: PurchaseId, patch: &PurchasePatch) -> Result<Purchase, StoreError>;

    /// Append a status transition to a live record; a no-op when the record
    /// already has the requested status.
    async fn change_status(
        &self,
        id: PurchaseId,
        change: &StatusChange,
    ) -> Result<Purchase, StoreError>;

    /// Flip the soft-deletion flag. Works on deleted records too.
    async fn set_deleted(&self, id: PurchaseId, deleted: bool) -> Result<Purchase, StoreError>;

    /// Apply independent conditional writes. Per-item failures are reported in
    /// the result; `Err` means the call as a whole was refused.
    async fn bulk_write(&self, ops: &[UpsertOp]) -> Result<BulkWriteReport, StoreError>;

    /// Sorted matches, at most `max_rows` of them.
    async fn find_for_export(
        &self,
        predicate: &Predicate,
        sort: &Sort,
        max_rows: usize,
    ) -> Result<Vec<Purchase>, StoreError>;
}

#[async_trait::async_trait]
impl<S: PurchaseStore + ?Sized> PurchaseStore for Arc<S> {
    async fn find_all(
        &self,
        predicate: &Predicate,
        options: &FindOptions,
    ) -> Result<Vec<Purchase>, StoreError> {
        (**self).find_all(predicate, options).await
    }

    async fn count(&self, predicate: &Predicate) -> Result<u64, StoreError> {
        (**self).count(predicate).await
    }

    async fn find_by_id(&self, id: PurchaseId) -> Result<Option<Purchase>, StoreError> {
        (**self).find_by_id(id).await
    }

    async fn create(&self, purchase: Purchase) -> Result<Purchase, StoreError> {
        (**self).create(purchase).await
    }

    async fn update(&self, id: PurchaseId, patch: &PurchasePatch) -> Result<Purchase, StoreError> {
        (**self).update(id, patch).await
    }

    async fn change_status(
        &self,
        id: PurchaseId,
        change: &StatusChange,
    ) -> Result<Purchase, StoreError> {
        (**self).change_status(id, change).await
    }

    async fn set_deleted(&self, id: PurchaseId, deleted: bool) -> Result<Purchase, StoreError> {
        (**self).set_deleted(id, deleted).await
    }

    async fn bulk_write(&self, ops: &[UpsertOp]) -> Result<BulkWriteReport, StoreError> {
        (**self).bulk_write(ops).await
    }

    async fn find_for_export(
        &self,
        predicate: &Predicate,
        sort: &Sort,
        max_rows: usize,
    ) -> Result<Vec<Purchase>, StoreError> {
        (**self).find_for_export(predicate, sort, max_rows).await
    }
}
