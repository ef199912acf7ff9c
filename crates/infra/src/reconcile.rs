//! Idempotent bulk reconciliation of imported rows into the purchase store.
//!
//! ```text
//! rows
//!   ↓
//! 1. Skip rows without a matching-key value
//!   ↓
//! 2. Normalize (coerce loose values, split combined references)
//!   ↓
//! 3. Build one conditional upsert per row
//!   ↓
//! 4. Submit in bounded chunks (halving on oversized payloads)
//!   ↓
//! BatchOutcome (counts + per-row diagnostics)
//! ```
//!
//! Writes merge only the supplied fields, so re-running the same batch leaves
//! every record as it was. One bad row never aborts the rest of the batch.

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use procura_purchasing::{ImportRow, MatchKey, UserRef, normalize_row};

use crate::store::{BulkWriteReport, FailureKind, PurchaseStore, StoreError, UpsertOp, WriteMode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOptions {
    pub match_by: MatchKey,
    /// Seed the status history of inserted records that carry a status.
    pub write_status_history_on_insert: bool,
    pub mode: WriteMode,
    /// Recorded as the creator of inserted records.
    pub created_by: Option<UserRef>,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            match_by: MatchKey::default(),
            write_status_history_on_insert: true,
            mode: WriteMode::default(),
            created_by: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureCounts {
    pub validation: usize,
    pub duplicate_key: usize,
    pub other: usize,
}

impl FailureCounts {
    pub fn total(&self) -> usize {
        self.validation + self.duplicate_key + self.other
    }

    fn count(&mut self, kind: FailureKind) {
        match kind {
            FailureKind::Validation => self.validation += 1,
            FailureKind::DuplicateKey => self.duplicate_key += 1,
            FailureKind::Other => self.other += 1,
        }
    }
}

/// Why one submitted row did not land.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowDiagnostic {
    /// Position of the row in the submitted batch.
    pub index: usize,
    pub kind: FailureKind,
    pub message: String,
}

/// Aggregate result of a reconciliation run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
    pub inserted: usize,
    /// Matched records whose fields changed.
    pub modified: usize,
    /// Every row that found an existing record, changed or not.
    pub matched: usize,
    /// Rows without a matching-key value.
    pub skipped: usize,
    pub failed: FailureCounts,
    pub diagnostics: Vec<RowDiagnostic>,
}

impl BatchOutcome {
    /// Matched rows that left their record as it was.
    pub fn unchanged(&self) -> usize {
        self.matched.saturating_sub(self.modified)
    }

    fn fail(&mut self, index: usize, kind: FailureKind, message: impl Into<String>) {
        self.failed.count(kind);
        self.diagnostics.push(RowDiagnostic {
            index,
            kind,
            message: message.into(),
        });
    }

    fn absorb(&mut self, report: BulkWriteReport) {
        self.inserted += report.inserted;
        self.modified += report.modified;
        self.matched += report.matched;
        for failure in report.failures {
            self.fail(failure.index, failure.kind, failure.message);
        }
    }
}

/// Drives batches of import rows through a [`PurchaseStore`].
///
/// The engine holds no locks of its own; insert-if-absent-else-update per key
/// is the store's `bulk_write` primitive.
#[derive(Debug, Clone)]
pub struct ReconciliationEngine<S> {
    store: S,
    chunk_size: usize,
}

impl<S> ReconciliationEngine<S>
where
    S: PurchaseStore,
{
    pub const DEFAULT_CHUNK_SIZE: usize = 500;

    pub fn new(store: S) -> Self {
        Self {
            store,
            chunk_size: Self::DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Normalize rows into upsert operations. Rows without a key are skipped
    /// before any coercion; rows that fail normalization are counted as
    /// validation failures.
    pub fn prepare(rows: &[ImportRow], options: &ReconcileOptions) -> (Vec<UpsertOp>, BatchOutcome) {
        let mut outcome = BatchOutcome::default();
        let mut ops = Vec::with_capacity(rows.len());

        for (index, row) in rows.iter().enumerate() {
            if options.match_by.value_in_row(row).is_none() {
                outcome.skipped += 1;
                continue;
            }
            let normalized = match normalize_row(row) {
                Ok(normalized) => normalized,
                Err(errors) => {
                    let message = errors
                        .iter()
                        .map(|(field, msg)| format!("{field}: {msg}"))
                        .collect::<Vec<_>>()
                        .join("; ");
                    outcome.fail(index, FailureKind::Validation, message);
                    continue;
                }
            };

            let key_value = options
                .match_by
                .value_in_patch(&normalized.patch)
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string);
            let Some(key_value) = key_value else {
                outcome.skipped += 1;
                continue;
            };

            ops.push(UpsertOp {
                index,
                match_key: options.match_by,
                key_value,
                seed_history: options.write_status_history_on_insert && normalized.status.is_some(),
                status: normalized.status,
                set: normalized.patch,
                created_by: options.created_by.clone(),
                mode: options.mode,
            });
        }

        (ops, outcome)
    }

    #[instrument(skip(self, rows, options), fields(rows = rows.len(), match_by = options.match_by.field_name()))]
    pub async fn reconcile(&self, rows: &[ImportRow], options: &ReconcileOptions) -> BatchOutcome {
        let (ops, mut outcome) = Self::prepare(rows, options);

        let mut chunk_size = self.chunk_size;
        let mut offset = 0;
        while offset < ops.len() {
            let end = (offset + chunk_size).min(ops.len());
            let chunk = &ops[offset..end];

            match self.store.bulk_write(chunk).await {
                Ok(report) => {
                    outcome.absorb(report);
                    offset = end;
                }
                Err(StoreError::PayloadTooLarge { size, limit }) if chunk.len() > 1 => {
                    chunk_size = (chunk.len() / 2).max(1);
                    warn!(offset, size, limit, chunk_size, "bulk payload too large; halving chunk");
                }
                Err(err) => {
                    warn!(offset, items = chunk.len(), error = %err, "bulk write failed for chunk");
                    let kind = FailureKind::of(&err);
                    let message = err.to_string();
                    for op in chunk {
                        outcome.fail(op.index, kind, message.clone());
                    }
                    offset = end;
                }
            }
        }

        outcome.diagnostics.sort_by_key(|d| d.index);
        info!(
            inserted = outcome.inserted,
            modified = outcome.modified,
            unchanged = outcome.unchanged(),
            skipped = outcome.skipped,
            failed = outcome.failed.total(),
            "reconciliation finished"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryPurchaseStore;

    fn row(code: &str, amount: f64) -> ImportRow {
        ImportRow::new()
            .with("entryNumber", code)
            .with("purchaseAmount", amount)
    }

    #[test]
    fn rows_without_key_are_skipped() {
        let rows = vec![
            row("A-1", 1.0),
            ImportRow::new().with("supplierName", "ООО Ромашка"),
            row("   ", 2.0),
        ];

        let (ops, outcome) =
            ReconciliationEngine::<InMemoryPurchaseStore>::prepare(&rows, &ReconcileOptions::default());
        assert_eq!(ops.len(), 1);
        assert_eq!(outcome.skipped, 2);
    }

    #[test]
    fn keyless_row_is_skipped_even_with_malformed_cells() {
        let rows = vec![ImportRow::new().with("purchaseAmount", "abc")];

        let (ops, outcome) =
            ReconciliationEngine::<InMemoryPurchaseStore>::prepare(&rows, &ReconcileOptions::default());
        assert!(ops.is_empty());
        assert_eq!(outcome.skipped, 1);
        assert_eq!(outcome.failed.total(), 0);
        assert!(outcome.diagnostics.is_empty());
    }

    #[test]
    fn combined_reference_supplies_the_key() {
        let rows = vec![ImportRow::new().with("incomingNumber", "956-вн/ск от 23.07.2025")];

        let (ops, _) =
            ReconciliationEngine::<InMemoryPurchaseStore>::prepare(&rows, &ReconcileOptions::default());
        assert_eq!(ops[0].key_value, "956-вн/ск");
        assert!(ops[0].set.entry_date.is_some());
    }

    #[test]
    fn malformed_values_are_validation_failures() {
        let rows = vec![row("A-1", 1.0).with("purchaseAmount", "много")];

        let (ops, outcome) =
            ReconciliationEngine::<InMemoryPurchaseStore>::prepare(&rows, &ReconcileOptions::default());
        assert!(ops.is_empty());
        assert_eq!(outcome.failed.validation, 1);
        assert_eq!(outcome.diagnostics[0].index, 0);
        assert!(outcome.diagnostics[0].message.contains("purchaseAmount"));
    }

    #[test]
    fn history_seeded_only_when_status_present() {
        let rows = vec![row("A-1", 1.0), row("A-2", 1.0).with("status", "отказано")];

        let (ops, _) =
            ReconciliationEngine::<InMemoryPurchaseStore>::prepare(&rows, &ReconcileOptions::default());
        assert!(!ops[0].seed_history);
        assert!(ops[1].seed_history);
    }

    #[tokio::test]
    async fn oversized_chunks_are_halved_until_they_fit() {
        let store = InMemoryPurchaseStore::new().with_max_payload_bytes(250);
        let engine = ReconciliationEngine::new(store).with_chunk_size(4);
        let rows: Vec<_> = (0..5).map(|i| row(&format!("A-{i}"), 10.0)).collect();

        let outcome = engine.reconcile(&rows, &ReconcileOptions::default()).await;
        assert_eq!(outcome.inserted, 5);
        assert_eq!(outcome.failed.total(), 0);
        assert_eq!(engine.store().len(), 5);
    }

    #[tokio::test]
    async fn single_oversized_row_fails_alone() {
        let store = InMemoryPurchaseStore::new().with_max_payload_bytes(250);
        let engine = ReconciliationEngine::new(store).with_chunk_size(2);
        let rows = vec![
            row("A-1", 10.0),
            row("A-2", 10.0).with("comment", "x".repeat(400)),
            row("A-3", 10.0),
        ];

        let outcome = engine.reconcile(&rows, &ReconcileOptions::default()).await;
        assert_eq!(outcome.inserted, 2);
        assert_eq!(outcome.failed.other, 1);
        assert_eq!(outcome.diagnostics[0].index, 1);
    }
}
