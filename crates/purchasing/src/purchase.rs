use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use procura_core::{DomainError, DomainResult, Entity, FieldErrors, PurchaseId};

use crate::ledger::{StatusChange, StatusHistoryEntry, StatusLedger};
use crate::reference::{self, EntryReference};

/// Implements `ALL`, stable ids, localized labels and lenient parsing for a
/// closed set of unit variants.
macro_rules! impl_labelled_enum {
    ($name:ident, $field:literal, { $($variant:ident => ($id:literal, $label:literal)),+ $(,)? }) => {
        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Stable machine identifier (the serialized form).
            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $id),+
                }
            }

            /// Human-readable label as shown to procurement staff.
            pub fn label(self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }

            /// Accepts either the identifier or the label, ignoring case and
            /// surrounding whitespace.
            pub fn parse(raw: &str) -> Option<Self> {
                let needle = raw.trim().to_lowercase();
                if needle.is_empty() {
                    return None;
                }
                Self::ALL.iter().copied().find(|v| {
                    v.as_str().to_lowercase() == needle || v.label().to_lowercase() == needle
                })
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl core::str::FromStr for $name {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s).ok_or_else(|| {
                    DomainError::invalid_field($field, format!("unknown value {s:?}"))
                })
            }
        }
    };
}

/// Workflow state of a purchase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseStatus {
    #[default]
    #[serde(alias = "в работе")]
    InProgress,
    #[serde(alias = "на рассмотрении")]
    UnderReview,
    #[serde(alias = "получено отделом закупок")]
    ReceivedByProcurement,
    #[serde(alias = "на доработку")]
    NeedsRework,
    #[serde(alias = "отказано")]
    Rejected,
    #[serde(alias = "аннулировано")]
    Canceled,
}

impl_labelled_enum!(PurchaseStatus, "status", {
    InProgress => ("in_progress", "в работе"),
    UnderReview => ("under_review", "на рассмотрении"),
    ReceivedByProcurement => ("received_by_procurement", "получено отделом закупок"),
    NeedsRework => ("needs_rework", "на доработку"),
    Rejected => ("rejected", "отказано"),
    Canceled => ("canceled", "аннулировано"),
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseSite {
    #[serde(alias = "Скатертный")]
    Skatertny,
    #[serde(alias = "Ломоносовский")]
    Lomonosovsky,
    #[serde(alias = "Вороново")]
    Voronovo,
}

impl_labelled_enum!(PurchaseSite, "site", {
    Skatertny => ("skatertny", "Скатертный"),
    Lomonosovsky => ("lomonosovsky", "Ломоносовский"),
    Voronovo => ("voronovo", "Вороново"),
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PurchaseCategory {
    It,
    Food,
    Equipment,
    Consumables,
}

impl_labelled_enum!(PurchaseCategory, "category", {
    It => ("IT", "ИТ"),
    Food => ("FOOD", "Продукты питания"),
    Equipment => ("EQUIPMENT", "Оборудование"),
    Consumables => ("CONSUMABLES", "Расходные материалы"),
});

/// A person as known to the external identity directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRef {
    pub full_name: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory_id: Option<String>,
}

impl UserRef {
    pub fn new(full_name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            full_name: full_name.into(),
            email: email.into(),
            directory_id: None,
        }
    }

    fn collect_errors(&self, field: &str, errors: &mut FieldErrors) {
        if self.full_name.trim().is_empty() {
            errors.insert(format!("{field}.fullName"), "must not be empty");
        }
        if !self.email.contains('@') {
            errors.insert(format!("{field}.email"), "must be an email address");
        }
    }
}

/// Expands `merge_from` and text sanitizing over every optional attribute.
macro_rules! attribute_ops {
    (text: [$($text:ident),+ $(,)?], other: [$($other:ident),+ $(,)?]) => {
        impl PurchaseAttributes {
            /// Copy every attribute present in `patch`. Returns whether anything
            /// actually changed.
            pub fn merge_from(&mut self, patch: &PurchaseAttributes) -> bool {
                let mut changed = false;
                $(
                    if let Some(value) = &patch.$text {
                        if self.$text.as_ref() != Some(value) {
                            self.$text = Some(value.clone());
                            changed = true;
                        }
                    }
                )+
                $(
                    if let Some(value) = &patch.$other {
                        if self.$other.as_ref() != Some(value) {
                            self.$other = Some(value.clone());
                            changed = true;
                        }
                    }
                )+
                changed
            }

            /// Trim free-text values; blank text counts as absent.
            pub fn sanitize(&mut self) {
                $(
                    self.$text = self
                        .$text
                        .take()
                        .map(|v| v.trim().to_string())
                        .filter(|v| !v.is_empty());
                )+
            }
        }
    };
}

/// Business attributes of a purchase. Every one is optional; a `None` inside a
/// patch means "leave unchanged".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supplier_name: Option<String>,
    /// Supplier is a small or medium business.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smp: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supplier_inn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purchase_amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_to: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_end: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placement_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method_of_purchase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub savings: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performance_amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performance_form: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_agreement_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_contract_amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publication: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responsible: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site: Option<PurchaseSite>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<PurchaseCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bank_guarantee_valid_from: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bank_guarantee_valid_to: Option<DateTime<Utc>>,
}

attribute_ops!(
    text: [
        contract_subject,
        supplier_name,
        supplier_inn,
        contract_number,
        method_of_purchase,
        document_number,
        performance_form,
        additional_agreement_number,
        publication,
        responsible,
        plan_number,
        comment,
    ],
    other: [
        smp,
        purchase_amount,
        contract_date,
        valid_from,
        valid_to,
        contract_end,
        initial_price,
        placement_date,
        completed,
        savings,
        performance_amount,
        current_contract_amount,
        application_amount,
        site,
        category,
        bank_guarantee_valid_from,
        bank_guarantee_valid_to,
    ]
);

impl PurchaseAttributes {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    fn collect_errors(&self, errors: &mut FieldErrors) {
        let amounts = [
            ("purchaseAmount", self.purchase_amount),
            ("initialPrice", self.initial_price),
            ("savings", self.savings),
            ("performanceAmount", self.performance_amount),
            ("currentContractAmount", self.current_contract_amount),
            ("applicationAmount", self.application_amount),
        ];
        for (field, value) in amounts {
            if value.is_some_and(|v| !v.is_finite()) {
                errors.insert(field, "must be a finite number");
            }
        }
        if let (Some(from), Some(to)) = (self.valid_from, self.valid_to) {
            if to < from {
                errors.insert("validTo", "must not precede validFrom");
            }
        }
        if let (Some(from), Some(to)) = (self.bank_guarantee_valid_from, self.bank_guarantee_valid_to) {
            if to < from {
                errors.insert("bankGuaranteeValidTo", "must not precede bankGuaranteeValidFrom");
            }
        }
    }
}

/// Partial update of a purchase.
///
/// `entry_raw` carries the combined "number от date" text as it appears in
/// registers; [`PurchasePatch::normalized`] splits it into the entry number and
/// entry date.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchasePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_date: Option<DateTime<Utc>>,
    #[serde(default, alias = "incomingNumber", skip_serializing_if = "Option::is_none")]
    pub entry_raw: Option<String>,
    #[serde(flatten)]
    pub attributes: PurchaseAttributes,
}

impl PurchasePatch {
    /// Resolve the entry reference and sanitize text attributes.
    pub fn normalized(mut self) -> Self {
        let resolved = reference::resolve(
            self.entry_number.as_deref(),
            self.entry_date,
            self.entry_raw.as_deref(),
        );
        self.entry_number = resolved.code;
        self.entry_date = resolved.date;
        self.entry_raw = None;
        self.attributes.sanitize();
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entry_number.is_none()
            && self.entry_date.is_none()
            && self.entry_raw.is_none()
            && self.attributes.is_empty()
    }

    pub fn validate(&self) -> DomainResult<()> {
        let mut errors = FieldErrors::new();
        self.attributes.collect_errors(&mut errors);
        errors.into_result("purchase update rejected")
    }
}

/// Input for creating a purchase through the single-record API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPurchase {
    #[serde(flatten)]
    pub patch: PurchasePatch,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PurchaseStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<UserRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub procurement_responsible: Option<UserRef>,
}

/// Everything a store needs to rebuild a [`Purchase`] from persisted state.
#[derive(Debug, Clone)]
pub struct PurchaseParts {
    pub id: PurchaseId,
    pub reference: EntryReference,
    pub attributes: PurchaseAttributes,
    pub status: PurchaseStatus,
    pub status_history: Vec<StatusHistoryEntry>,
    pub is_deleted: bool,
    pub created_by: Option<UserRef>,
    pub procurement_responsible: Option<UserRef>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One procurement record.
///
/// Serializes with the derived `remainingContractAmount` alongside the
/// stored attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct Purchase {
    id: PurchaseId,
    reference: EntryReference,
    attributes: PurchaseAttributes,
    ledger: StatusLedger,
    is_deleted: bool,
    created_by: Option<UserRef>,
    procurement_responsible: Option<UserRef>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PurchaseJson<'a> {
    id: PurchaseId,
    #[serde(flatten)]
    reference: &'a EntryReference,
    #[serde(flatten)]
    attributes: &'a PurchaseAttributes,
    #[serde(skip_serializing_if = "Option::is_none")]
    remaining_contract_amount: Option<f64>,
    #[serde(flatten)]
    ledger: &'a StatusLedger,
    is_deleted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    created_by: Option<&'a UserRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    procurement_responsible: Option<&'a UserRef>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Serialize for Purchase {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        PurchaseJson {
            id: self.id,
            reference: &self.reference,
            attributes: &self.attributes,
            remaining_contract_amount: self.remaining_contract_amount(),
            ledger: &self.ledger,
            is_deleted: self.is_deleted,
            created_by: self.created_by.as_ref(),
            procurement_responsible: self.procurement_responsible.as_ref(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
        .serialize(serializer)
    }
}

impl Purchase {
    /// Create a purchase from the single-record API. The author is mandatory;
    /// a status given at creation seeds the history.
    pub fn create(input: NewPurchase, now: DateTime<Utc>) -> DomainResult<Self> {
        let mut errors = FieldErrors::new();
        match &input.created_by {
            Some(user) => user.collect_errors("createdBy", &mut errors),
            None => errors.insert("createdBy", "is required"),
        }
        if let Some(user) = &input.procurement_responsible {
            user.collect_errors("procurementResponsible", &mut errors);
        }
        let patch = input.patch.normalized();
        patch.attributes.collect_errors(&mut errors);
        errors.into_result("purchase rejected")?;

        let ledger = match input.status {
            Some(status) => StatusLedger::seeded(status, now),
            None => StatusLedger::new(PurchaseStatus::default()),
        };
        let mut attributes = patch.attributes;
        attributes.completed.get_or_insert(false);

        Ok(Self {
            id: PurchaseId::new(),
            reference: EntryReference {
                code: patch.entry_number,
                date: patch.entry_date,
            },
            attributes,
            ledger,
            is_deleted: false,
            created_by: input.created_by,
            procurement_responsible: input.procurement_responsible,
            created_at: now,
            updated_at: now,
        })
    }

    /// Build the record inserted by a bulk import when no existing record
    /// matched. `seed_history` adds the initial status as the first history
    /// entry.
    pub fn imported(
        patch: &PurchasePatch,
        status: Option<PurchaseStatus>,
        seed_history: bool,
        created_by: Option<UserRef>,
        now: DateTime<Utc>,
    ) -> Self {
        let status = status.unwrap_or_default();
        let ledger = if seed_history {
            StatusLedger::seeded(status, now)
        } else {
            StatusLedger::new(status)
        };
        let mut attributes = patch.attributes.clone();
        attributes.completed.get_or_insert(false);

        Self {
            id: PurchaseId::new(),
            reference: EntryReference {
                code: patch.entry_number.clone(),
                date: patch.entry_date,
            },
            attributes,
            ledger,
            is_deleted: false,
            created_by,
            procurement_responsible: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Rehydrate from storage. Fails when the persisted history is out of order.
    pub fn restore(parts: PurchaseParts) -> DomainResult<Self> {
        let ledger = StatusLedger::from_parts(parts.status, parts.status_history)?;
        Ok(Self {
            id: parts.id,
            reference: parts.reference,
            attributes: parts.attributes,
            ledger,
            is_deleted: parts.is_deleted,
            created_by: parts.created_by,
            procurement_responsible: parts.procurement_responsible,
            created_at: parts.created_at,
            updated_at: parts.updated_at,
        })
    }

    pub fn id_typed(&self) -> PurchaseId {
        self.id
    }

    pub fn reference(&self) -> &EntryReference {
        &self.reference
    }

    pub fn entry_number(&self) -> Option<&str> {
        self.reference.code.as_deref()
    }

    pub fn attributes(&self) -> &PurchaseAttributes {
        &self.attributes
    }

    pub fn ledger(&self) -> &StatusLedger {
        &self.ledger
    }

    pub fn status(&self) -> PurchaseStatus {
        self.ledger.status()
    }

    pub fn status_history(&self) -> &[StatusHistoryEntry] {
        self.ledger.history()
    }

    pub fn last_status_changed_at(&self) -> Option<DateTime<Utc>> {
        self.ledger.last_changed_at()
    }

    pub fn is_deleted(&self) -> bool {
        self.is_deleted
    }

    pub fn created_by(&self) -> Option<&UserRef> {
        self.created_by.as_ref()
    }

    pub fn procurement_responsible(&self) -> Option<&UserRef> {
        self.procurement_responsible.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn completed(&self) -> bool {
        self.attributes.completed.unwrap_or(false)
    }

    /// Contract amount not yet covered by performance, never negative.
    pub fn remaining_contract_amount(&self) -> Option<f64> {
        let current = self.attributes.current_contract_amount?;
        let performed = self.attributes.performance_amount.unwrap_or(0.0);
        Some((current - performed).max(0.0))
    }

    /// Apply a normalized patch. The merged attributes are validated as a
    /// whole, so a patch carrying only `validTo` is checked against the stored
    /// `validFrom`; a rejected patch leaves the record untouched.
    /// `updated_at` only moves when something changed.
    pub fn apply_patch(&mut self, patch: &PurchasePatch, now: DateTime<Utc>) -> DomainResult<bool> {
        let mut attributes = self.attributes.clone();
        let mut changed = attributes.merge_from(&patch.attributes);
        if changed {
            let mut errors = FieldErrors::new();
            attributes.collect_errors(&mut errors);
            errors.into_result("purchase update rejected")?;
            self.attributes = attributes;
        }
        if let Some(code) = &patch.entry_number {
            if self.reference.code.as_ref() != Some(code) {
                self.reference.code = Some(code.clone());
                changed = true;
            }
        }
        if let Some(date) = patch.entry_date {
            if self.reference.date != Some(date) {
                self.reference.date = Some(date);
                changed = true;
            }
        }
        if changed {
            self.touch(now);
        }
        Ok(changed)
    }

    /// Move to `change.status`, appending one history entry. Returns `None`
    /// when the record already has that status.
    pub fn change_status(
        &mut self,
        change: &StatusChange,
        now: DateTime<Utc>,
    ) -> Option<StatusHistoryEntry> {
        let entry = self.ledger.decide(change, now)?;
        self.ledger.apply(entry.clone());
        if let Some(user) = &change.procurement_responsible {
            self.procurement_responsible = Some(user.clone());
        }
        self.touch(now);
        Some(entry)
    }

    pub fn set_deleted(&mut self, deleted: bool, now: DateTime<Utc>) -> bool {
        if self.is_deleted == deleted {
            return false;
        }
        self.is_deleted = deleted;
        self.touch(now);
        true
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = self.updated_at.max(now);
    }
}

impl Entity for Purchase {
    type Id = PurchaseId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn is_soft_deleted(&self) -> bool {
        self.is_deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn test_author() -> UserRef {
        UserRef::new("Ирина Петрова", "i.petrova@example.org")
    }

    fn test_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 7, 23, 9, 30, 0).unwrap()
    }

    fn new_purchase() -> NewPurchase {
        NewPurchase {
            patch: PurchasePatch {
                entry_raw: Some("956-вн/ск от 23.07.2025".to_string()),
                attributes: PurchaseAttributes {
                    supplier_name: Some("  ООО Ромашка ".to_string()),
                    ..PurchaseAttributes::default()
                },
                ..PurchasePatch::default()
            },
            created_by: Some(test_author()),
            ..NewPurchase::default()
        }
    }

    #[test]
    fn create_requires_author() {
        let mut input = new_purchase();
        input.created_by = None;

        let err = Purchase::create(input, test_time()).unwrap_err();
        assert_eq!(err.details().and_then(|d| d.get("createdBy")), Some("is required"));
    }

    #[test]
    fn create_splits_combined_reference_and_trims_text() {
        let purchase = Purchase::create(new_purchase(), test_time()).unwrap();

        assert_eq!(purchase.entry_number(), Some("956-вн/ск"));
        assert_eq!(
            purchase.reference().date,
            Some(Utc.with_ymd_and_hms(2025, 7, 23, 0, 0, 0).unwrap())
        );
        assert_eq!(purchase.attributes().supplier_name.as_deref(), Some("ООО Ромашка"));
        assert_eq!(purchase.status(), PurchaseStatus::InProgress);
        assert!(purchase.status_history().is_empty());
        assert!(!purchase.completed());
        assert_eq!(purchase.created_at(), purchase.updated_at());
    }

    #[test]
    fn create_with_status_seeds_history() {
        let mut input = new_purchase();
        input.status = Some(PurchaseStatus::UnderReview);

        let purchase = Purchase::create(input, test_time()).unwrap();
        assert_eq!(purchase.status_history().len(), 1);
        assert_eq!(purchase.last_status_changed_at(), Some(test_time()));
    }

    #[test]
    fn noop_patch_keeps_updated_at() {
        let mut purchase = Purchase::create(new_purchase(), test_time()).unwrap();
        let later = test_time() + chrono::Duration::hours(1);
        let patch = PurchasePatch {
            attributes: PurchaseAttributes {
                supplier_name: Some("ООО Ромашка".to_string()),
                ..PurchaseAttributes::default()
            },
            ..PurchasePatch::default()
        };

        assert!(!purchase.apply_patch(&patch, later).unwrap());
        assert_eq!(purchase.updated_at(), test_time());

        let patch = PurchasePatch {
            attributes: PurchaseAttributes {
                savings: Some(1500.0),
                ..PurchaseAttributes::default()
            },
            ..PurchasePatch::default()
        };
        assert!(purchase.apply_patch(&patch, later).unwrap());
        assert_eq!(purchase.updated_at(), later);
    }

    #[test]
    fn patch_is_validated_against_the_stored_dates() {
        let mut input = new_purchase();
        input.patch.attributes.valid_from = Some(test_time());
        let mut purchase = Purchase::create(input, test_time()).unwrap();

        let patch = PurchasePatch {
            attributes: PurchaseAttributes {
                valid_to: Some(test_time() - chrono::Duration::days(1)),
                ..PurchaseAttributes::default()
            },
            ..PurchasePatch::default()
        };
        let err = purchase.apply_patch(&patch, test_time()).unwrap_err();
        assert_eq!(err.details().and_then(|d| d.get("validTo")), Some("must not precede validFrom"));
        assert_eq!(purchase.attributes().valid_to, None);
    }

    #[test]
    fn status_change_records_responsible() {
        let mut purchase = Purchase::create(new_purchase(), test_time()).unwrap();
        let buyer = UserRef::new("Олег Смирнов", "o.smirnov@example.org");
        let change = StatusChange {
            status: PurchaseStatus::ReceivedByProcurement,
            comment: None,
            procurement_responsible: Some(buyer.clone()),
        };

        let entry = purchase.change_status(&change, test_time()).unwrap();
        assert_eq!(entry.status, PurchaseStatus::ReceivedByProcurement);
        assert_eq!(purchase.procurement_responsible(), Some(&buyer));
        assert!(purchase.change_status(&change, test_time()).is_none());
        assert_eq!(purchase.status_history().len(), 1);
    }

    #[test]
    fn remaining_amount_never_negative() {
        let mut input = new_purchase();
        input.patch.attributes.current_contract_amount = Some(100.0);
        input.patch.attributes.performance_amount = Some(250.0);

        let purchase = Purchase::create(input, test_time()).unwrap();
        assert_eq!(purchase.remaining_contract_amount(), Some(0.0));
    }

    #[test]
    fn json_carries_the_remaining_amount() {
        let mut input = new_purchase();
        input.patch.attributes.current_contract_amount = Some(1000.0);
        input.patch.attributes.performance_amount = Some(150.0);
        let purchase = Purchase::create(input, test_time()).unwrap();

        let json = serde_json::to_value(&purchase).unwrap();
        assert_eq!(json["remainingContractAmount"], 850.0);
        assert_eq!(json["currentContractAmount"], 1000.0);

        let json = serde_json::to_value(Purchase::create(new_purchase(), test_time()).unwrap()).unwrap();
        assert!(json.get("remainingContractAmount").is_none());
    }

    #[test]
    fn labels_and_ids_both_parse() {
        assert_eq!(PurchaseStatus::parse("На доработку"), Some(PurchaseStatus::NeedsRework));
        assert_eq!(PurchaseStatus::parse("rejected"), Some(PurchaseStatus::Rejected));
        assert_eq!(PurchaseSite::parse(" Вороново "), Some(PurchaseSite::Voronovo));
        assert_eq!(PurchaseCategory::parse("it"), Some(PurchaseCategory::It));
        assert!("unknown".parse::<PurchaseStatus>().is_err());
    }

    #[test]
    fn status_deserializes_from_label() {
        let status: PurchaseStatus = serde_json::from_str("\"отказано\"").unwrap();
        assert_eq!(status, PurchaseStatus::Rejected);
        assert_eq!(serde_json::to_string(&status).unwrap(), "\"rejected\"");
    }

    #[test]
    fn serialized_purchase_uses_flat_camel_case_fields() {
        let purchase = Purchase::create(new_purchase(), test_time()).unwrap();
        let json = serde_json::to_value(&purchase).unwrap();

        assert_eq!(json["entryNumber"], "956-вн/ск");
        assert_eq!(json["supplierName"], "ООО Ромашка");
        assert_eq!(json["status"], "in_progress");
        assert_eq!(json["isDeleted"], false);
        assert!(json["statusHistory"].as_array().unwrap().is_empty());
    }
}
