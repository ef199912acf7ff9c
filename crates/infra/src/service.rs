//! Purchase use cases on top of a [`PurchaseStore`].
//!
//! Single-record operations surface typed errors; batch imports always
//! return an outcome with counts, whatever happened to individual rows.

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use procura_core::{DomainError, PurchaseId};
use procura_purchasing::{
    FilterCompiler, ImportRow, MatchKey, NewPurchase, Purchase, PurchaseFilter, PurchasePatch,
    StatusChange, UserRef,
};

use crate::export::{self, ExportFile};
use crate::reconcile::{BatchOutcome, ReconcileOptions, ReconciliationEngine};
use crate::store::{FindOptions, PurchaseStore, StoreError, WriteMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Hard cap on exported rows; larger result sets are truncated.
    pub export_max_rows: usize,
    pub batch_chunk_size: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            export_max_rows: 20_000,
            batch_chunk_size: ReconciliationEngine::<Arc<dyn PurchaseStore>>::DEFAULT_CHUNK_SIZE,
        }
    }
}

/// One page of a listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchasePage {
    pub items: Vec<Purchase>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

/// Batch import request as submitted by callers.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchImportRequest {
    #[serde(default)]
    pub items: Vec<ImportRow>,
    #[serde(default)]
    pub mode: WriteMode,
    #[serde(default)]
    pub match_by: Option<MatchKey>,
    #[serde(default)]
    pub write_status_history_on_insert: Option<bool>,
}

#[derive(Clone)]
pub struct PurchaseService {
    store: Arc<dyn PurchaseStore>,
    config: ServiceConfig,
}

impl PurchaseService {
    pub fn new(store: Arc<dyn PurchaseStore>, config: ServiceConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    #[instrument(skip(self, filter), err)]
    pub async fn list(&self, filter: &PurchaseFilter) -> Result<PurchasePage, StoreError> {
        let query = FilterCompiler::compile(filter)?;
        let options = FindOptions {
            skip: query.page.offset(),
            limit: Some(query.page.limit()),
            sort: query.sort,
        };
        let items = self.store.find_all(&query.predicate, &options).await?;
        let total = self.store.count(&query.predicate).await?;

        Ok(PurchasePage {
            items,
            total,
            page: query.page.number,
            page_size: query.page.size,
        })
    }

    /// Records selected by `filter` in listing order, at most
    /// `export_max_rows` of them.
    #[instrument(skip(self, filter), err)]
    pub async fn export(&self, filter: &PurchaseFilter) -> Result<Vec<Purchase>, StoreError> {
        let query = FilterCompiler::compile_export(filter, self.config.export_max_rows)?;
        let rows = self
            .store
            .find_for_export(&query.predicate, &query.sort, query.max_rows)
            .await?;
        if rows.len() == query.max_rows {
            info!(max_rows = query.max_rows, "export reached the row cap");
        }
        Ok(rows)
    }

    pub async fn export_csv(
        &self,
        filter: &PurchaseFilter,
        today: NaiveDate,
    ) -> Result<ExportFile, StoreError> {
        let rows = self.export(filter).await?;
        Ok(ExportFile {
            file_name: ExportFile::file_name_for(today),
            content_type: "text/csv; charset=utf-8",
            content: export::render_csv(&rows)?,
        })
    }

    /// A live record. Soft-deleted records read as missing.
    #[instrument(skip(self), fields(purchase_id = %id), err)]
    pub async fn get(&self, id: PurchaseId) -> Result<Purchase, StoreError> {
        self.store
            .find_by_id(id)
            .await?
            .filter(|p| !p.is_deleted())
            .ok_or_else(|| DomainError::not_found("purchase", id).into())
    }

    #[instrument(skip(self, input), err)]
    pub async fn create(&self, input: NewPurchase) -> Result<Purchase, StoreError> {
        let purchase = Purchase::create(input, Utc::now())?;
        self.store.create(purchase).await
    }

    /// Merge `patch` into a live record. Status, history and authorship are
    /// not part of a patch and cannot change through here.
    #[instrument(skip(self, patch), fields(purchase_id = %id), err)]
    pub async fn update(&self, id: PurchaseId, patch: PurchasePatch) -> Result<Purchase, StoreError> {
        let patch = patch.normalized();
        patch.validate()?;
        if patch.is_empty() {
            debug!("empty patch; returning the record unchanged");
            return self.get(id).await;
        }
        self.store.update(id, &patch).await
    }

    #[instrument(skip(self, change), fields(purchase_id = %id, status = %change.status), err)]
    pub async fn change_status(
        &self,
        id: PurchaseId,
        change: StatusChange,
    ) -> Result<Purchase, StoreError> {
        self.store.change_status(id, &change).await
    }

    #[instrument(skip(self), fields(purchase_id = %id), err)]
    pub async fn set_deleted(&self, id: PurchaseId, deleted: bool) -> Result<Purchase, StoreError> {
        self.store.set_deleted(id, deleted).await
    }

    #[instrument(skip(self, request, created_by), fields(items = request.items.len()), err)]
    pub async fn import_batch(
        &self,
        request: BatchImportRequest,
        created_by: Option<UserRef>,
    ) -> Result<BatchOutcome, StoreError> {
        if request.items.is_empty() {
            return Err(DomainError::invalid_field("items", "must contain at least one row").into());
        }

        let defaults = ReconcileOptions::default();
        let options = ReconcileOptions {
            match_by: request.match_by.unwrap_or(defaults.match_by),
            write_status_history_on_insert: request
                .write_status_history_on_insert
                .unwrap_or(defaults.write_status_history_on_insert),
            mode: request.mode,
            created_by,
        };
        let engine = ReconciliationEngine::new(self.store.clone())
            .with_chunk_size(self.config.batch_chunk_size);
        Ok(engine.reconcile(&request.items, &options).await)
    }
}
