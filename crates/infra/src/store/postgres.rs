//! Postgres-backed purchase store.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database (unique violation) | `23505` | `Domain(DuplicateKey)` | Entry number taken by another live record |
//! | Database (other) | Any other | `Backend` | Constraint, syntax or type errors |
//! | PoolClosed / Io / other | N/A | `Backend` | Connection failures, etc. |
//!
//! ## Atomicity
//!
//! Every single-record write runs in its own transaction and locks the row
//! with `SELECT ... FOR UPDATE` before applying domain logic, so concurrent
//! status changes serialize instead of overwriting each other's history.
//! Bulk items each get their own transaction, holding an advisory lock on the
//! match-key value so that two imports of a new key cannot both insert it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::{instrument, Span};

use procura_core::{DomainError, PurchaseId};
use procura_purchasing::{
    EntryReference, MatchKey, Predicate, Purchase, PurchaseAttributes, PurchaseCategory, PurchaseParts,
    PurchasePatch, PurchaseSite, PurchaseStatus, Sort, SortOrder, StatusChange,
    StatusHistoryEntry, UserRef,
};

use super::{
    check_payload, BulkWriteReport, FailureKind, FindOptions, PurchaseStore, StoreError,
    UpsertOp, WriteFailure, WriteMode,
};

/// Table, partial unique index and filter indexes. Safe to run repeatedly.
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS purchases (
    id UUID PRIMARY KEY,
    entry_number TEXT,
    entry_date TIMESTAMPTZ,
    contract_subject TEXT,
    supplier_name TEXT,
    smp BOOLEAN,
    supplier_inn TEXT,
    purchase_amount DOUBLE PRECISION,
    contract_number TEXT,
    contract_date TIMESTAMPTZ,
    valid_from TIMESTAMPTZ,
    valid_to TIMESTAMPTZ,
    contract_end TIMESTAMPTZ,
    initial_price DOUBLE PRECISION,
    placement_date TIMESTAMPTZ,
    method_of_purchase TEXT,
    document_number TEXT,
    completed BOOLEAN NOT NULL DEFAULT FALSE,
    savings DOUBLE PRECISION,
    performance_amount DOUBLE PRECISION,
    performance_form TEXT,
    additional_agreement_number TEXT,
    current_contract_amount DOUBLE PRECISION,
    publication TEXT,
    responsible TEXT,
    plan_number TEXT,
    application_amount DOUBLE PRECISION,
    comment TEXT,
    site TEXT,
    category TEXT,
    bank_guarantee_valid_from TIMESTAMPTZ,
    bank_guarantee_valid_to TIMESTAMPTZ,
    status TEXT NOT NULL,
    status_history JSONB NOT NULL DEFAULT '[]'::jsonb,
    last_status_changed_at TIMESTAMPTZ,
    is_deleted BOOLEAN NOT NULL DEFAULT FALSE,
    created_by JSONB,
    procurement_responsible JSONB,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS purchases_entry_number_live
    ON purchases (entry_number)
    WHERE NOT is_deleted AND entry_number IS NOT NULL;

CREATE INDEX IF NOT EXISTS purchases_created_at ON purchases (created_at DESC);
CREATE INDEX IF NOT EXISTS purchases_status ON purchases (status) WHERE NOT is_deleted;
CREATE INDEX IF NOT EXISTS purchases_contract_date ON purchases (contract_date);
CREATE INDEX IF NOT EXISTS purchases_contract_number ON purchases (contract_number);
CREATE INDEX IF NOT EXISTS purchases_document_number ON purchases (document_number);
CREATE INDEX IF NOT EXISTS purchases_plan_number ON purchases (plan_number);
CREATE INDEX IF NOT EXISTS purchases_supplier_inn ON purchases (supplier_inn);
"#;

const SELECT_PURCHASE: &str = "SELECT * FROM purchases";

/// Arbiter clause for the `purchases_entry_number_live` partial index.
const ON_ENTRY_NUMBER_CONFLICT: &str =
    " ON CONFLICT (entry_number) WHERE NOT is_deleted AND entry_number IS NOT NULL DO NOTHING";

/// Postgres-backed purchase store.
///
/// ## Thread Safety
///
/// Uses SQLx connection pool which is thread-safe (Arc + Send + Sync).
#[derive(Debug, Clone)]
pub struct PostgresPurchaseStore {
    pool: Arc<PgPool>,
    max_payload_bytes: Option<usize>,
}

impl PostgresPurchaseStore {
    /// Create a new PostgresPurchaseStore with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            max_payload_bytes: None,
        }
    }

    /// Refuse bulk writes whose serialized operations exceed `limit` bytes.
    pub fn with_max_payload_bytes(mut self, limit: usize) -> Self {
        self.max_payload_bytes = Some(limit);
        self
    }

    /// Create the table and indexes if they do not exist yet.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA_SQL)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, StoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }

    async fn commit(tx: Transaction<'static, Postgres>) -> Result<(), StoreError> {
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    /// One conditional write. Concurrent imports of the same key serialize on
    /// a transaction-scoped advisory lock; a record that another writer
    /// inserts under the same entry number in the meantime is caught by the
    /// partial unique index and merged into instead.
    async fn apply_op(&self, op: &UpsertOp, now: DateTime<Utc>) -> Result<ItemOutcome, StoreError> {
        let key_value = op.key_value.trim();
        if key_value.is_empty() {
            return Err(DomainError::invalid_field(op.match_key.field_name(), "match key is empty").into());
        }

        let mut tx = self.begin().await?;
        lock_key(&mut tx, op.match_key, key_value).await?;

        let existing = lock_match(&mut tx, op.match_key, key_value).await?;
        let outcome = match existing {
            Some(_) if op.mode == WriteMode::Insert => {
                return Err(DomainError::duplicate_key(op.match_key.field_name(), key_value).into());
            }
            Some(purchase) => merge_row(&mut tx, purchase, &op.set, now).await?,
            None => {
                let purchase = Purchase::imported(
                    &op.set,
                    op.status,
                    op.seed_history,
                    op.created_by.clone(),
                    now,
                );
                if insert_if_absent(&mut tx, &purchase).await? {
                    ItemOutcome::Inserted
                } else {
                    let code = purchase.entry_number().unwrap_or_default();
                    let taken = match (op.match_key, op.mode) {
                        (MatchKey::EntryNumber, WriteMode::Upsert) => {
                            lock_match(&mut tx, MatchKey::EntryNumber, code).await?
                        }
                        _ => None,
                    };
                    match taken {
                        Some(existing) => merge_row(&mut tx, existing, &op.set, now).await?,
                        None => return Err(DomainError::duplicate_key("entryNumber", code).into()),
                    }
                }
            }
        };
        Self::commit(tx).await?;
        Ok(outcome)
    }
}

enum ItemOutcome {
    Inserted,
    Matched { modified: bool },
}

#[async_trait::async_trait]
impl PurchaseStore for PostgresPurchaseStore {
    #[instrument(
        skip(self, predicate, options),
        fields(offset = options.skip, limit = ?options.limit, row_count = tracing::field::Empty),
        err
    )]
    async fn find_all(
        &self,
        predicate: &Predicate,
        options: &FindOptions,
    ) -> Result<Vec<Purchase>, StoreError> {
        let mut query = QueryBuilder::<Postgres>::new(SELECT_PURCHASE);
        query.push(" WHERE ");
        push_predicate(&mut query, predicate);
        push_order(&mut query, &options.sort);
        if let Some(limit) = options.limit {
            query.push(" LIMIT ").push_bind(to_i64(limit));
        }
        query.push(" OFFSET ").push_bind(to_i64(options.skip));

        let rows = query
            .build()
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_all", e))?;
        Span::current().record("row_count", rows.len());
        decode_rows(rows)
    }

    #[instrument(skip(self, predicate), err)]
    async fn count(&self, predicate: &Predicate) -> Result<u64, StoreError> {
        let mut query = QueryBuilder::<Postgres>::new("SELECT COUNT(*) AS total FROM purchases WHERE ");
        push_predicate(&mut query, predicate);

        let row = query
            .build()
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count", e))?;
        let total: i64 = row
            .try_get("total")
            .map_err(|e| map_sqlx_error("count", e))?;
        Ok(u64::try_from(total).unwrap_or(0))
    }

    #[instrument(skip(self), fields(purchase_id = %id), err)]
    async fn find_by_id(&self, id: PurchaseId) -> Result<Option<Purchase>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM purchases
            WHERE id = $1
            "#,
        )
        .bind(*id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_by_id", e))?;

        row.map(|row| {
            PurchaseRow::from_row(&row)
                .map_err(|e| map_sqlx_error("find_by_id", e))
                .and_then(PurchaseRow::into_purchase)
        })
        .transpose()
    }

    #[instrument(skip(self, purchase), fields(purchase_id = %purchase.id_typed()), err)]
    async fn create(&self, purchase: Purchase) -> Result<Purchase, StoreError> {
        if purchase.created_by().is_none() {
            return Err(DomainError::invalid_field("createdBy", "is required").into());
        }
        let mut tx = self.begin().await?;
        insert_row(&mut tx, &purchase).await?;
        Self::commit(tx).await?;
        Ok(purchase)
    }

    #[instrument(skip(self, patch), fields(purchase_id = %id), err)]
    async fn update(&self, id: PurchaseId, patch: &PurchasePatch) -> Result<Purchase, StoreError> {
        let mut tx = self.begin().await?;
        let mut purchase = lock_live(&mut tx, id).await?;
        if purchase.apply_patch(patch, Utc::now())? {
            write_row(&mut tx, &purchase).await?;
        }
        Self::commit(tx).await?;
        Ok(purchase)
    }

    #[instrument(skip(self, change), fields(purchase_id = %id, status = %change.status), err)]
    async fn change_status(
        &self,
        id: PurchaseId,
        change: &StatusChange,
    ) -> Result<Purchase, StoreError> {
        let mut tx = self.begin().await?;
        let mut purchase = lock_live(&mut tx, id).await?;
        if purchase.change_status(change, Utc::now()).is_some() {
            write_row(&mut tx, &purchase).await?;
        }
        Self::commit(tx).await?;
        Ok(purchase)
    }

    #[instrument(skip(self), fields(purchase_id = %id), err)]
    async fn set_deleted(&self, id: PurchaseId, deleted: bool) -> Result<Purchase, StoreError> {
        let mut tx = self.begin().await?;
        let mut purchase = lock_row(&mut tx, id)
            .await?
            .ok_or_else(|| StoreError::from(DomainError::not_found("purchase", id)))?;
        if purchase.set_deleted(deleted, Utc::now()) {
            write_row(&mut tx, &purchase).await?;
        }
        Self::commit(tx).await?;
        Ok(purchase)
    }

    #[instrument(skip(self, ops), fields(op_count = ops.len()), err)]
    async fn bulk_write(&self, ops: &[UpsertOp]) -> Result<BulkWriteReport, StoreError> {
        check_payload(ops, self.max_payload_bytes)?;

        let now = Utc::now();
        let mut report = BulkWriteReport::default();
        for op in ops {
            match self.apply_op(op, now).await {
                Ok(ItemOutcome::Inserted) => report.inserted += 1,
                Ok(ItemOutcome::Matched { modified }) => {
                    report.matched += 1;
                    if modified {
                        report.modified += 1;
                    }
                }
                Err(err) => report.failures.push(WriteFailure {
                    index: op.index,
                    kind: FailureKind::of(&err),
                    message: err.to_string(),
                }),
            }
        }
        Ok(report)
    }

    #[instrument(skip(self, predicate, sort), err)]
    async fn find_for_export(
        &self,
        predicate: &Predicate,
        sort: &Sort,
        max_rows: usize,
    ) -> Result<Vec<Purchase>, StoreError> {
        let mut query = QueryBuilder::<Postgres>::new(SELECT_PURCHASE);
        query.push(" WHERE ");
        push_predicate(&mut query, predicate);
        push_order(&mut query, sort);
        query
            .push(" LIMIT ")
            .push_bind(i64::try_from(max_rows).unwrap_or(i64::MAX));

        let rows = query
            .build()
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_for_export", e))?;
        decode_rows(rows)
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn match_column(key: MatchKey) -> &'static str {
    match key {
        MatchKey::EntryNumber => "entry_number",
        MatchKey::ContractNumber => "contract_number",
        MatchKey::DocumentNumber => "document_number",
        MatchKey::PlanNumber => "plan_number",
        MatchKey::SupplierInn => "supplier_inn",
    }
}

/// Render a predicate as a SQL boolean expression. Column names come from
/// closed enums; every value is a bind parameter.
fn push_predicate(query: &mut QueryBuilder<'_, Postgres>, predicate: &Predicate) {
    match predicate {
        Predicate::And(parts) | Predicate::Or(parts) if parts.is_empty() => {
            query.push(if matches!(predicate, Predicate::And(_)) { "TRUE" } else { "FALSE" });
        }
        Predicate::And(parts) | Predicate::Or(parts) => {
            let joiner = if matches!(predicate, Predicate::And(_)) { " AND " } else { " OR " };
            query.push("(");
            for (i, part) in parts.iter().enumerate() {
                if i > 0 {
                    query.push(joiner);
                }
                push_predicate(query, part);
            }
            query.push(")");
        }
        Predicate::TextContains { field, pattern } => {
            query
                .push(field.column())
                .push(" ILIKE ")
                .push_bind(pattern.like_pattern())
                .push(" ESCAPE '\\'");
        }
        Predicate::StatusIs(status) => {
            query.push("status = ").push_bind(status.as_str());
        }
        Predicate::SiteIs(site) => {
            query.push("site = ").push_bind(site.as_str());
        }
        Predicate::CategoryIs(category) => {
            query.push("category = ").push_bind(category.as_str());
        }
        Predicate::CompletedIs(flag) => {
            query.push("completed = ").push_bind(*flag);
        }
        Predicate::DeletedIs(flag) => {
            query.push("is_deleted = ").push_bind(*flag);
        }
        Predicate::DateWithin { field, range } => {
            query.push("(").push(field.column()).push(" IS NOT NULL");
            if let Some(from) = range.from {
                query.push(" AND ").push(field.column()).push(" >= ").push_bind(from);
            }
            if let Some(to) = range.to {
                query.push(" AND ").push(field.column()).push(" <= ").push_bind(to);
            }
            query.push(")");
        }
    }
}

/// Missing values sort first ascending and last descending, ties break on id.
fn push_order(query: &mut QueryBuilder<'_, Postgres>, sort: &Sort) {
    let (direction, nulls) = match sort.order {
        SortOrder::Asc => ("ASC", "NULLS FIRST"),
        SortOrder::Desc => ("DESC", "NULLS LAST"),
    };
    query
        .push(" ORDER BY ")
        .push(sort.field.column())
        .push(format!(" {direction} {nulls}, id {direction}"));
}

async fn lock_row(
    tx: &mut Transaction<'_, Postgres>,
    id: PurchaseId,
) -> Result<Option<Purchase>, StoreError> {
    let row = sqlx::query(
        r#"
        SELECT * FROM purchases
        WHERE id = $1
        FOR UPDATE
        "#,
    )
    .bind(*id.as_uuid())
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("lock_row", e))?;

    row.map(|row| {
        PurchaseRow::from_row(&row)
            .map_err(|e| map_sqlx_error("lock_row", e))
            .and_then(PurchaseRow::into_purchase)
    })
    .transpose()
}

async fn lock_live(
    tx: &mut Transaction<'_, Postgres>,
    id: PurchaseId,
) -> Result<Purchase, StoreError> {
    lock_row(tx, id)
        .await?
        .filter(|p| !p.is_deleted())
        .ok_or_else(|| DomainError::not_found("purchase", id).into())
}

fn insert_query(purchase: &Purchase) -> Result<QueryBuilder<'static, Postgres>, StoreError> {
    let columns = row_values(purchase)?;
    let mut query = QueryBuilder::<Postgres>::new("INSERT INTO purchases (");
    for (i, (column, _)) in columns.iter().enumerate() {
        if i > 0 {
            query.push(", ");
        }
        query.push(*column);
    }
    query.push(") VALUES (");
    for (i, (_, value)) in columns.into_iter().enumerate() {
        if i > 0 {
            query.push(", ");
        }
        value.bind_into(&mut query);
    }
    query.push(")");
    Ok(query)
}

async fn insert_row(tx: &mut Transaction<'_, Postgres>, purchase: &Purchase) -> Result<(), StoreError> {
    insert_query(purchase)?
        .build()
        .execute(&mut **tx)
        .await
        .map_err(|e| map_write_error("insert_purchase", e, purchase))?;
    Ok(())
}

/// Insert unless a live record already holds the entry number. Returns
/// whether the row was written.
async fn insert_if_absent(
    tx: &mut Transaction<'_, Postgres>,
    purchase: &Purchase,
) -> Result<bool, StoreError> {
    let mut query = insert_query(purchase)?;
    query.push(ON_ENTRY_NUMBER_CONFLICT);
    let done = query
        .build()
        .execute(&mut **tx)
        .await
        .map_err(|e| map_write_error("insert_purchase", e, purchase))?;
    Ok(done.rows_affected() == 1)
}

/// Serialize writers of one match-key value until the transaction ends.
async fn lock_key(
    tx: &mut Transaction<'_, Postgres>,
    key: MatchKey,
    value: &str,
) -> Result<(), StoreError> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
        .bind(advisory_key(key, value))
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("lock_key", e))?;
    Ok(())
}

fn advisory_key(key: MatchKey, value: &str) -> String {
    format!("purchases:{}:{}", match_column(key), value)
}

/// The oldest live record whose `key` equals `value`, locked for update.
async fn lock_match(
    tx: &mut Transaction<'_, Postgres>,
    key: MatchKey,
    value: &str,
) -> Result<Option<Purchase>, StoreError> {
    let mut select = QueryBuilder::<Postgres>::new(SELECT_PURCHASE);
    select
        .push(" WHERE NOT is_deleted AND ")
        .push(match_column(key))
        .push(" = ")
        .push_bind(value.to_string())
        .push(" ORDER BY created_at ASC, id ASC LIMIT 1 FOR UPDATE");
    select
        .build()
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("bulk_select", e))?
        .map(|row| {
            PurchaseRow::from_row(&row)
                .map_err(|e| map_sqlx_error("bulk_decode", e))
                .and_then(PurchaseRow::into_purchase)
        })
        .transpose()
}

async fn merge_row(
    tx: &mut Transaction<'_, Postgres>,
    mut purchase: Purchase,
    patch: &PurchasePatch,
    now: DateTime<Utc>,
) -> Result<ItemOutcome, StoreError> {
    let modified = purchase.apply_patch(patch, now)?;
    if modified {
        write_row(tx, &purchase).await?;
    }
    Ok(ItemOutcome::Matched { modified })
}

async fn write_row(tx: &mut Transaction<'_, Postgres>, purchase: &Purchase) -> Result<(), StoreError> {
    let columns = row_values(purchase)?;
    let mut query = QueryBuilder::<Postgres>::new("UPDATE purchases SET ");
    for (i, (column, value)) in columns.into_iter().skip(1).enumerate() {
        if i > 0 {
            query.push(", ");
        }
        query.push(column).push(" = ");
        value.bind_into(&mut query);
    }
    query.push(" WHERE id = ").push_bind(*purchase.id_typed().as_uuid());

    query
        .build()
        .execute(&mut **tx)
        .await
        .map_err(|e| map_write_error("update_purchase", e, purchase))?;
    Ok(())
}

/// A typed column value awaiting binding.
enum Column {
    Id(uuid::Uuid),
    Text(Option<String>),
    Flag(Option<bool>),
    Amount(Option<f64>),
    Time(Option<DateTime<Utc>>),
    Doc(Option<serde_json::Value>),
}

impl Column {
    fn bind_into(self, query: &mut QueryBuilder<'_, Postgres>) {
        match self {
            Column::Id(v) => query.push_bind(v),
            Column::Text(v) => query.push_bind(v),
            Column::Flag(v) => query.push_bind(v),
            Column::Amount(v) => query.push_bind(v),
            Column::Time(v) => query.push_bind(v),
            Column::Doc(v) => query.push_bind(v),
        };
    }
}

/// Every column of a purchase row; `id` first.
fn row_values(purchase: &Purchase) -> Result<Vec<(&'static str, Column)>, StoreError> {
    let a = purchase.attributes();
    let text = |v: &Option<String>| Column::Text(v.clone());
    let doc = |value: Result<serde_json::Value, serde_json::Error>| {
        value.map_err(|e| StoreError::backend("encode_purchase", e))
    };
    let history = doc(serde_json::to_value(purchase.status_history()))?;
    let created_by = purchase
        .created_by()
        .map(|u| doc(serde_json::to_value(u)))
        .transpose()?;
    let responsible = purchase
        .procurement_responsible()
        .map(|u| doc(serde_json::to_value(u)))
        .transpose()?;

    Ok(vec![
        ("id", Column::Id(*purchase.id_typed().as_uuid())),
        ("entry_number", Column::Text(purchase.entry_number().map(str::to_string))),
        ("entry_date", Column::Time(purchase.reference().date)),
        ("contract_subject", text(&a.contract_subject)),
        ("supplier_name", text(&a.supplier_name)),
        ("smp", Column::Flag(a.smp)),
        ("supplier_inn", text(&a.supplier_inn)),
        ("purchase_amount", Column::Amount(a.purchase_amount)),
        ("contract_number", text(&a.contract_number)),
        ("contract_date", Column::Time(a.contract_date)),
        ("valid_from", Column::Time(a.valid_from)),
        ("valid_to", Column::Time(a.valid_to)),
        ("contract_end", Column::Time(a.contract_end)),
        ("initial_price", Column::Amount(a.initial_price)),
        ("placement_date", Column::Time(a.placement_date)),
        ("method_of_purchase", text(&a.method_of_purchase)),
        ("document_number", text(&a.document_number)),
        ("completed", Column::Flag(Some(purchase.completed()))),
        ("savings", Column::Amount(a.savings)),
        ("performance_amount", Column::Amount(a.performance_amount)),
        ("performance_form", text(&a.performance_form)),
        ("additional_agreement_number", text(&a.additional_agreement_number)),
        ("current_contract_amount", Column::Amount(a.current_contract_amount)),
        ("publication", text(&a.publication)),
        ("responsible", text(&a.responsible)),
        ("plan_number", text(&a.plan_number)),
        ("application_amount", Column::Amount(a.application_amount)),
        ("comment", text(&a.comment)),
        ("site", Column::Text(a.site.map(|s| s.as_str().to_string()))),
        ("category", Column::Text(a.category.map(|c| c.as_str().to_string()))),
        ("bank_guarantee_valid_from", Column::Time(a.bank_guarantee_valid_from)),
        ("bank_guarantee_valid_to", Column::Time(a.bank_guarantee_valid_to)),
        ("status", Column::Text(Some(purchase.status().as_str().to_string()))),
        ("status_history", Column::Doc(Some(history))),
        ("last_status_changed_at", Column::Time(purchase.last_status_changed_at())),
        ("is_deleted", Column::Flag(Some(purchase.is_deleted()))),
        ("created_by", Column::Doc(created_by)),
        ("procurement_responsible", Column::Doc(responsible)),
        ("created_at", Column::Time(Some(purchase.created_at()))),
        ("updated_at", Column::Time(Some(purchase.updated_at()))),
    ])
}

fn decode_rows(rows: Vec<PgRow>) -> Result<Vec<Purchase>, StoreError> {
    rows.iter()
        .map(|row| {
            PurchaseRow::from_row(row)
                .map_err(|e| map_sqlx_error("decode_purchase", e))
                .and_then(PurchaseRow::into_purchase)
        })
        .collect()
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> StoreError {
    StoreError::backend(operation, err)
}

/// Like [`map_sqlx_error`], but a unique violation names the entry number
/// that collided.
fn map_write_error(operation: &'static str, err: sqlx::Error, purchase: &Purchase) -> StoreError {
    if is_unique_violation(&err) {
        return DomainError::duplicate_key("entryNumber", purchase.entry_number().unwrap_or_default()).into();
    }
    map_sqlx_error(operation, err)
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

// SQLx row type
#[derive(Debug)]
struct PurchaseRow {
    id: uuid::Uuid,
    reference: EntryReference,
    attributes: PurchaseAttributes,
    status: String,
    status_history: Json<Vec<StatusHistoryEntry>>,
    is_deleted: bool,
    created_by: Option<Json<UserRef>>,
    procurement_responsible: Option<Json<UserRef>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for PurchaseRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let site: Option<String> = row.try_get("site")?;
        let category: Option<String> = row.try_get("category")?;

        let attributes = PurchaseAttributes {
            contract_subject: row.try_get("contract_subject")?,
            supplier_name: row.try_get("supplier_name")?,
            smp: row.try_get("smp")?,
            supplier_inn: row.try_get("supplier_inn")?,
            purchase_amount: row.try_get("purchase_amount")?,
            contract_number: row.try_get("contract_number")?,
            contract_date: row.try_get("contract_date")?,
            valid_from: row.try_get("valid_from")?,
            valid_to: row.try_get("valid_to")?,
            contract_end: row.try_get("contract_end")?,
            initial_price: row.try_get("initial_price")?,
            placement_date: row.try_get("placement_date")?,
            method_of_purchase: row.try_get("method_of_purchase")?,
            document_number: row.try_get("document_number")?,
            completed: Some(row.try_get("completed")?),
            savings: row.try_get("savings")?,
            performance_amount: row.try_get("performance_amount")?,
            performance_form: row.try_get("performance_form")?,
            additional_agreement_number: row.try_get("additional_agreement_number")?,
            current_contract_amount: row.try_get("current_contract_amount")?,
            publication: row.try_get("publication")?,
            responsible: row.try_get("responsible")?,
            plan_number: row.try_get("plan_number")?,
            application_amount: row.try_get("application_amount")?,
            comment: row.try_get("comment")?,
            site: decode_label("site", site, PurchaseSite::parse)?,
            category: decode_label("category", category, PurchaseCategory::parse)?,
            bank_guarantee_valid_from: row.try_get("bank_guarantee_valid_from")?,
            bank_guarantee_valid_to: row.try_get("bank_guarantee_valid_to")?,
        };

        Ok(PurchaseRow {
            id: row.try_get("id")?,
            reference: EntryReference {
                code: row.try_get("entry_number")?,
                date: row.try_get("entry_date")?,
            },
            attributes,
            status: row.try_get("status")?,
            status_history: row.try_get("status_history")?,
            is_deleted: row.try_get("is_deleted")?,
            created_by: row.try_get("created_by")?,
            procurement_responsible: row.try_get("procurement_responsible")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

fn decode_label<T>(
    column: &str,
    raw: Option<String>,
    parse: fn(&str) -> Option<T>,
) -> Result<Option<T>, sqlx::Error> {
    raw.map(|value| {
        parse(&value).ok_or_else(|| sqlx::Error::ColumnDecode {
            index: column.to_string(),
            source: format!("unknown value {value:?}").into(),
        })
    })
    .transpose()
}

impl PurchaseRow {
    fn into_purchase(self) -> Result<Purchase, StoreError> {
        let status = PurchaseStatus::parse(&self.status).ok_or_else(|| {
            StoreError::backend("decode_purchase", format!("unknown status {:?}", self.status))
        })?;
        let purchase = Purchase::restore(PurchaseParts {
            id: PurchaseId::from_uuid(self.id),
            reference: self.reference,
            attributes: self.attributes,
            status,
            status_history: self.status_history.0,
            is_deleted: self.is_deleted,
            created_by: self.created_by.map(|u| u.0),
            procurement_responsible: self.procurement_responsible.map(|u| u.0),
            created_at: self.created_at,
            updated_at: self.updated_at,
        })?;
        Ok(purchase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use procura_purchasing::{
        DateField, DateRange, FilterCompiler, PurchaseFilter, SortField, TextField, TextPattern,
    };

    fn sql_of(predicate: &Predicate) -> String {
        let mut query = QueryBuilder::<Postgres>::new("");
        push_predicate(&mut query, predicate);
        query.sql().to_string()
    }

    #[test]
    fn default_filter_renders_live_records_only() {
        let predicate = FilterCompiler::predicate(&PurchaseFilter::default()).unwrap();
        assert_eq!(sql_of(&predicate), "(is_deleted = $1)");
    }

    #[test]
    fn free_text_renders_escaped_ilike_per_field() {
        let predicate = Predicate::Or(vec![
            Predicate::TextContains {
                field: TextField::SupplierName,
                pattern: TextPattern::new("50%").unwrap(),
            },
            Predicate::TextContains {
                field: TextField::Comment,
                pattern: TextPattern::new("50%").unwrap(),
            },
        ]);
        assert_eq!(
            sql_of(&predicate),
            "(supplier_name ILIKE $1 ESCAPE '\\' OR comment ILIKE $2 ESCAPE '\\')"
        );
    }

    #[test]
    fn half_open_range_renders_one_bound() {
        let predicate = Predicate::DateWithin {
            field: DateField::ContractDate,
            range: DateRange { from: Some(Utc::now()), to: None },
        };
        assert_eq!(sql_of(&predicate), "(contract_date IS NOT NULL AND contract_date >= $1)");
    }

    #[test]
    fn empty_disjunction_matches_nothing() {
        assert_eq!(sql_of(&Predicate::Or(vec![])), "FALSE");
    }

    #[test]
    fn conditional_insert_targets_the_live_entry_number_index() {
        let purchase = Purchase::imported(&PurchasePatch::default(), None, false, None, Utc::now());
        let mut query = insert_query(&purchase).unwrap();
        query.push(ON_ENTRY_NUMBER_CONFLICT);
        let sql = query.sql().to_string();
        assert!(sql.starts_with("INSERT INTO purchases (id, entry_number,"));
        assert!(sql.ends_with(
            "ON CONFLICT (entry_number) WHERE NOT is_deleted AND entry_number IS NOT NULL DO NOTHING"
        ));
        assert!(SCHEMA_SQL.contains("WHERE NOT is_deleted AND entry_number IS NOT NULL;"));
    }

    #[test]
    fn advisory_lock_is_scoped_to_key_column_and_value() {
        assert_eq!(advisory_key(MatchKey::ContractNumber, "K-1"), "purchases:contract_number:K-1");
        assert_ne!(
            advisory_key(MatchKey::ContractNumber, "K-1"),
            advisory_key(MatchKey::DocumentNumber, "K-1")
        );
    }

    /// Needs a reachable Postgres in `DATABASE_URL`; does nothing otherwise.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_imports_of_a_new_key_create_one_record() {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            return;
        };
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(8)
            .connect(&url)
            .await
            .unwrap();
        let store = Arc::new(PostgresPurchaseStore::new(pool));
        store.ensure_schema().await.unwrap();

        let key = format!("K-{}", uuid::Uuid::now_v7());
        let op = UpsertOp {
            index: 0,
            match_key: MatchKey::ContractNumber,
            key_value: key.clone(),
            set: PurchasePatch {
                attributes: PurchaseAttributes {
                    contract_number: Some(key.clone()),
                    purchase_amount: Some(10.0),
                    ..PurchaseAttributes::default()
                },
                ..PurchasePatch::default()
            },
            status: None,
            seed_history: false,
            created_by: None,
            mode: WriteMode::Upsert,
        };

        let writers: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let op = op.clone();
                tokio::spawn(async move { store.bulk_write(&[op]).await })
            })
            .collect();
        let mut inserted = 0;
        let mut matched = 0;
        for writer in writers {
            let report = writer.await.unwrap().unwrap();
            assert!(report.failures.is_empty(), "{:?}", report.failures);
            inserted += report.inserted;
            matched += report.matched;
        }
        assert_eq!(inserted, 1);
        assert_eq!(matched, 7);

        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM purchases WHERE contract_number = $1")
            .bind(&key)
            .fetch_one(&*store.pool)
            .await
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn order_keeps_nulls_on_the_small_side() {
        let mut query = QueryBuilder::<Postgres>::new("");
        push_order(&mut query, &Sort { field: SortField::PurchaseAmount, order: SortOrder::Desc });
        assert_eq!(query.sql(), " ORDER BY purchase_amount DESC NULLS LAST, id DESC");
    }
}
