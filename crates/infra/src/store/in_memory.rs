use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use tracing::instrument;

use procura_core::{DomainError, PurchaseId};
use procura_purchasing::{Predicate, Purchase, PurchasePatch, Sort, StatusChange};

use super::{
    check_payload, BulkWriteReport, FailureKind, FindOptions, PurchaseStore, StoreError,
    UpsertOp, WriteFailure, WriteMode,
};

/// In-memory purchase store.
///
/// Intended for tests/dev. Not optimized for performance: every query scans
/// all records. Entry numbers are unique among live records, matching the
/// partial unique index of the Postgres schema.
#[derive(Debug, Default)]
pub struct InMemoryPurchaseStore {
    records: RwLock<HashMap<PurchaseId, Purchase>>,
    max_payload_bytes: Option<usize>,
}

enum ItemOutcome {
    Inserted,
    Matched { modified: bool },
}

impl InMemoryPurchaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse bulk writes whose serialized operations exceed `limit` bytes.
    pub fn with_max_payload_bytes(mut self, limit: usize) -> Self {
        self.max_payload_bytes = Some(limit);
        self
    }

    pub fn len(&self) -> usize {
        self.read().map(|records| records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<PurchaseId, Purchase>>, StoreError> {
        self.records
            .read()
            .map_err(|_| StoreError::backend("read_lock", "lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<PurchaseId, Purchase>>, StoreError> {
        self.records
            .write()
            .map_err(|_| StoreError::backend("write_lock", "lock poisoned"))
    }

    fn matching(records: &HashMap<PurchaseId, Purchase>, predicate: &Predicate, sort: &Sort) -> Vec<Purchase> {
        let mut found: Vec<Purchase> = records
            .values()
            .filter(|p| predicate.matches(p))
            .cloned()
            .collect();
        found.sort_by(|a, b| sort.compare(a, b));
        found
    }

    fn live<'a>(
        records: &'a mut HashMap<PurchaseId, Purchase>,
        id: PurchaseId,
    ) -> Result<&'a mut Purchase, StoreError> {
        records
            .get_mut(&id)
            .filter(|p| !p.is_deleted())
            .ok_or_else(|| DomainError::not_found("purchase", id).into())
    }

    /// Entry numbers must be unique among live records other than the candidate.
    fn ensure_unique(
        records: &HashMap<PurchaseId, Purchase>,
        candidate: &Purchase,
    ) -> Result<(), DomainError> {
        let Some(code) = candidate.entry_number() else {
            return Ok(());
        };
        if candidate.is_deleted() {
            return Ok(());
        }
        let taken = records.values().any(|p| {
            p.id_typed() != candidate.id_typed() && !p.is_deleted() && p.entry_number() == Some(code)
        });
        if taken {
            return Err(DomainError::duplicate_key("entryNumber", code));
        }
        Ok(())
    }

    fn apply_op(
        records: &mut HashMap<PurchaseId, Purchase>,
        op: &UpsertOp,
        now: DateTime<Utc>,
    ) -> Result<ItemOutcome, DomainError> {
        let key_value = op.key_value.trim();
        if key_value.is_empty() {
            return Err(DomainError::invalid_field(op.match_key.field_name(), "match key is empty"));
        }

        let existing = records
            .values()
            .filter(|p| !p.is_deleted() && op.match_key.value_in(p) == Some(key_value))
            .min_by_key(|p| (p.created_at(), p.id_typed()))
            .map(Purchase::id_typed);

        match existing {
            Some(_) if op.mode == WriteMode::Insert => Err(DomainError::duplicate_key(
                op.match_key.field_name(),
                key_value,
            )),
            Some(id) => {
                let Some(current) = records.get(&id) else {
                    return Err(DomainError::not_found("purchase", id));
                };
                let mut next = current.clone();
                let modified = next.apply_patch(&op.set, now)?;
                if modified {
                    Self::ensure_unique(records, &next)?;
                    records.insert(id, next);
                }
                Ok(ItemOutcome::Matched { modified })
            }
            None => {
                let purchase = Purchase::imported(
                    &op.set,
                    op.status,
                    op.seed_history,
                    op.created_by.clone(),
                    now,
                );
                Self::ensure_unique(records, &purchase)?;
                records.insert(purchase.id_typed(), purchase);
                Ok(ItemOutcome::Inserted)
            }
        }
    }
}

#[async_trait::async_trait]
impl PurchaseStore for InMemoryPurchaseStore {
    async fn find_all(
        &self,
        predicate: &Predicate,
        options: &FindOptions,
    ) -> Result<Vec<Purchase>, StoreError> {
        let records = self.read()?;
        let skip = usize::try_from(options.skip).unwrap_or(usize::MAX);
        let limit = options
            .limit
            .map(|l| usize::try_from(l).unwrap_or(usize::MAX))
            .unwrap_or(usize::MAX);
        Ok(Self::matching(&records, predicate, &options.sort)
            .into_iter()
            .skip(skip)
            .take(limit)
            .collect())
    }

    async fn count(&self, predicate: &Predicate) -> Result<u64, StoreError> {
        let records = self.read()?;
        Ok(records.values().filter(|p| predicate.matches(p)).count() as u64)
    }

    async fn find_by_id(&self, id: PurchaseId) -> Result<Option<Purchase>, StoreError> {
        Ok(self.read()?.get(&id).cloned())
    }

    async fn create(&self, purchase: Purchase) -> Result<Purchase, StoreError> {
        if purchase.created_by().is_none() {
            return Err(DomainError::invalid_field("createdBy", "is required").into());
        }
        let mut records = self.write()?;
        if records.contains_key(&purchase.id_typed()) {
            return Err(DomainError::conflict(format!("purchase {} already exists", purchase.id_typed())).into());
        }
        Self::ensure_unique(&records, &purchase)?;
        records.insert(purchase.id_typed(), purchase.clone());
        Ok(purchase)
    }

    async fn update(&self, id: PurchaseId, patch: &PurchasePatch) -> Result<Purchase, StoreError> {
        let mut records = self.write()?;
        let mut next = Self::live(&mut records, id)?.clone();
        if next.apply_patch(patch, Utc::now())? {
            Self::ensure_unique(&records, &next)?;
            records.insert(id, next.clone());
        }
        Ok(next)
    }

    async fn change_status(
        &self,
        id: PurchaseId,
        change: &StatusChange,
    ) -> Result<Purchase, StoreError> {
        let mut records = self.write()?;
        let purchase = Self::live(&mut records, id)?;
        purchase.change_status(change, Utc::now());
        Ok(purchase.clone())
    }

    async fn set_deleted(&self, id: PurchaseId, deleted: bool) -> Result<Purchase, StoreError> {
        let mut records = self.write()?;
        let Some(current) = records.get(&id) else {
            return Err(DomainError::not_found("purchase", id).into());
        };
        let mut next = current.clone();
        if next.set_deleted(deleted, Utc::now()) {
            Self::ensure_unique(&records, &next)?;
            records.insert(id, next.clone());
        }
        Ok(next)
    }

    #[instrument(skip(self, ops), fields(op_count = ops.len()), err)]
    async fn bulk_write(&self, ops: &[UpsertOp]) -> Result<BulkWriteReport, StoreError> {
        check_payload(ops, self.max_payload_bytes)?;

        let mut records = self.write()?;
        let now = Utc::now();
        let mut report = BulkWriteReport::default();
        for op in ops {
            match Self::apply_op(&mut records, op, now) {
                Ok(ItemOutcome::Inserted) => report.inserted += 1,
                Ok(ItemOutcome::Matched { modified }) => {
                    report.matched += 1;
                    if modified {
                        report.modified += 1;
                    }
                }
                Err(err) => {
                    let err = StoreError::from(err);
                    report.failures.push(WriteFailure {
                        index: op.index,
                        kind: FailureKind::of(&err),
                        message: err.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }

    async fn find_for_export(
        &self,
        predicate: &Predicate,
        sort: &Sort,
        max_rows: usize,
    ) -> Result<Vec<Purchase>, StoreError> {
        let records = self.read()?;
        let mut found = Self::matching(&records, predicate, sort);
        found.truncate(max_rows);
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use procura_purchasing::{
        MatchKey, NewPurchase, PurchaseAttributes, PurchaseStatus, UserRef,
    };

    fn test_author() -> UserRef {
        UserRef::new("Анна Иванова", "a.ivanova@example.org")
    }

    fn new_purchase(code: &str) -> Purchase {
        Purchase::create(
            NewPurchase {
                patch: PurchasePatch {
                    entry_number: Some(code.to_string()),
                    ..PurchasePatch::default()
                },
                created_by: Some(test_author()),
                ..NewPurchase::default()
            },
            Utc::now(),
        )
        .unwrap()
    }

    fn upsert(index: usize, code: &str, amount: f64) -> UpsertOp {
        UpsertOp {
            index,
            match_key: MatchKey::EntryNumber,
            key_value: code.to_string(),
            set: PurchasePatch {
                entry_number: Some(code.to_string()),
                attributes: PurchaseAttributes {
                    purchase_amount: Some(amount),
                    ..PurchaseAttributes::default()
                },
                ..PurchasePatch::default()
            },
            status: Some(PurchaseStatus::UnderReview),
            seed_history: true,
            created_by: None,
            mode: WriteMode::Upsert,
        }
    }

    #[tokio::test]
    async fn duplicate_entry_number_among_live_records_is_rejected() {
        let store = InMemoryPurchaseStore::new();
        let first = store.create(new_purchase("A-1")).await.unwrap();

        let err = store.create(new_purchase("A-1")).await.unwrap_err();
        assert!(matches!(err, StoreError::Domain(DomainError::DuplicateKey { .. })));

        store.set_deleted(first.id_typed(), true).await.unwrap();
        store.create(new_purchase("A-1")).await.unwrap();

        let err = store.set_deleted(first.id_typed(), false).await.unwrap_err();
        assert_eq!(FailureKind::of(&err), FailureKind::DuplicateKey);
    }

    #[tokio::test]
    async fn deleted_records_reject_updates_and_status_changes() {
        let store = InMemoryPurchaseStore::new();
        let purchase = store.create(new_purchase("B-1")).await.unwrap();
        store.set_deleted(purchase.id_typed(), true).await.unwrap();

        let err = store
            .change_status(purchase.id_typed(), &StatusChange::to(PurchaseStatus::Rejected))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Domain(DomainError::NotFound { .. })));

        let still_there = store.find_by_id(purchase.id_typed()).await.unwrap().unwrap();
        assert!(still_there.is_deleted());
        assert_eq!(still_there.status(), PurchaseStatus::InProgress);
    }

    #[tokio::test]
    async fn bulk_write_merges_on_match_and_seeds_history_on_insert_only() {
        let store = InMemoryPurchaseStore::new();

        let report = store.bulk_write(&[upsert(0, "C-1", 10.0)]).await.unwrap();
        assert_eq!((report.inserted, report.matched, report.modified), (1, 0, 0));

        let report = store.bulk_write(&[upsert(0, "C-1", 20.0)]).await.unwrap();
        assert_eq!((report.inserted, report.matched, report.modified), (0, 1, 1));

        let report = store.bulk_write(&[upsert(0, "C-1", 20.0)]).await.unwrap();
        assert_eq!((report.inserted, report.matched, report.modified), (0, 1, 0));

        let all = store
            .find_all(&Predicate::And(vec![]), &FindOptions::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].attributes().purchase_amount, Some(20.0));
        assert_eq!(all[0].status_history().len(), 1);
        assert_eq!(all[0].status(), PurchaseStatus::UnderReview);
    }

    #[tokio::test]
    async fn insert_mode_reports_existing_keys_per_item() {
        let store = InMemoryPurchaseStore::new();
        store.create(new_purchase("D-1")).await.unwrap();

        let mut taken = upsert(0, "D-1", 1.0);
        taken.mode = WriteMode::Insert;
        let mut fresh = upsert(1, "D-2", 2.0);
        fresh.mode = WriteMode::Insert;

        let report = store.bulk_write(&[taken, fresh]).await.unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].index, 0);
        assert_eq!(report.failures[0].kind, FailureKind::DuplicateKey);
    }

    #[tokio::test]
    async fn oversized_payload_is_refused_whole() {
        let store = InMemoryPurchaseStore::new().with_max_payload_bytes(64);
        let ops: Vec<UpsertOp> = (0..4).map(|i| upsert(i, &format!("E-{i}"), 1.0)).collect();

        let err = store.bulk_write(&ops).await.unwrap_err();
        assert!(matches!(err, StoreError::PayloadTooLarge { limit: 64, .. }));
        assert!(store.is_empty());
    }
}
