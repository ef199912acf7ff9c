//! Bulk import rows: loosely typed spreadsheet records turned into patches.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use procura_core::FieldErrors;

use crate::coerce::{self, Coerced, LooseValue};
use crate::purchase::{Purchase, PurchaseCategory, PurchasePatch, PurchaseSite, PurchaseStatus};
use crate::reference;

/// Attribute used to find the existing record an import row reconciles with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MatchKey {
    #[default]
    EntryNumber,
    ContractNumber,
    DocumentNumber,
    PlanNumber,
    SupplierInn,
}

impl MatchKey {
    /// Wire and column name of the key attribute.
    pub fn field_name(self) -> &'static str {
        match self {
            Self::EntryNumber => "entryNumber",
            Self::ContractNumber => "contractNumber",
            Self::DocumentNumber => "documentNumber",
            Self::PlanNumber => "planNumber",
            Self::SupplierInn => "supplierInn",
        }
    }

    pub fn value_in_patch(self, patch: &PurchasePatch) -> Option<&str> {
        let attrs = &patch.attributes;
        match self {
            Self::EntryNumber => patch.entry_number.as_deref(),
            Self::ContractNumber => attrs.contract_number.as_deref(),
            Self::DocumentNumber => attrs.document_number.as_deref(),
            Self::PlanNumber => attrs.plan_number.as_deref(),
            Self::SupplierInn => attrs.supplier_inn.as_deref(),
        }
    }

    /// Key value read straight from the raw cells, before any other column
    /// is coerced. A combined reference supplies the entry number when the
    /// row has no explicit one.
    pub fn value_in_row(self, row: &ImportRow) -> Option<String> {
        let text = |wanted: ImportField| {
            row.0
                .iter()
                .find(|(key, _)| ImportField::from_key(key) == Some(wanted))
                .and_then(|(_, value)| coerce::to_text(value))
        };
        let value = match self {
            Self::EntryNumber => {
                let number = text(ImportField::EntryNumber);
                let raw = text(ImportField::EntryRaw);
                reference::resolve(number.as_deref(), None, raw.as_deref()).code
            }
            Self::ContractNumber => text(ImportField::ContractNumber),
            Self::DocumentNumber => text(ImportField::DocumentNumber),
            Self::PlanNumber => text(ImportField::PlanNumber),
            Self::SupplierInn => text(ImportField::SupplierInn),
        };
        value
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    pub fn value_in(self, purchase: &Purchase) -> Option<&str> {
        let attrs = purchase.attributes();
        match self {
            Self::EntryNumber => purchase.entry_number(),
            Self::ContractNumber => attrs.contract_number.as_deref(),
            Self::DocumentNumber => attrs.document_number.as_deref(),
            Self::PlanNumber => attrs.plan_number.as_deref(),
            Self::SupplierInn => attrs.supplier_inn.as_deref(),
        }
    }
}

/// Column of an import row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ImportField {
    EntryNumber,
    EntryDate,
    EntryRaw,
    ContractSubject,
    SupplierName,
    Smp,
    SupplierInn,
    PurchaseAmount,
    ContractNumber,
    ContractDate,
    ValidFrom,
    ValidTo,
    ContractEnd,
    InitialPrice,
    PlacementDate,
    MethodOfPurchase,
    DocumentNumber,
    Completed,
    Savings,
    PerformanceAmount,
    PerformanceForm,
    AdditionalAgreementNumber,
    CurrentContractAmount,
    Publication,
    Responsible,
    PlanNumber,
    ApplicationAmount,
    Comment,
    Site,
    Category,
    BankGuaranteeValidFrom,
    BankGuaranteeValidTo,
    Status,
}

impl ImportField {
    pub fn from_key(key: &str) -> Option<Self> {
        use ImportField::*;
        let field = match key.trim() {
            "entryNumber" => EntryNumber,
            "entryDate" => EntryDate,
            "entryRaw" | "incomingNumber" => EntryRaw,
            "contractSubject" => ContractSubject,
            "supplierName" => SupplierName,
            "smp" => Smp,
            "supplierInn" => SupplierInn,
            "purchaseAmount" => PurchaseAmount,
            "contractNumber" => ContractNumber,
            "contractDate" => ContractDate,
            "validFrom" => ValidFrom,
            "validTo" => ValidTo,
            "contractEnd" => ContractEnd,
            "initialPrice" => InitialPrice,
            "placementDate" => PlacementDate,
            "methodOfPurchase" => MethodOfPurchase,
            "documentNumber" => DocumentNumber,
            "completed" => Completed,
            "savings" => Savings,
            "performanceAmount" => PerformanceAmount,
            "performanceForm" => PerformanceForm,
            "additionalAgreementNumber" => AdditionalAgreementNumber,
            "currentContractAmount" => CurrentContractAmount,
            "publication" => Publication,
            "responsible" => Responsible,
            "planNumber" => PlanNumber,
            "applicationAmount" => ApplicationAmount,
            "comment" => Comment,
            "site" => Site,
            "category" => Category,
            "bankGuaranteeValidFrom" => BankGuaranteeValidFrom,
            "bankGuaranteeValidTo" => BankGuaranteeValidTo,
            "status" => Status,
            _ => return None,
        };
        Some(field)
    }
}

/// One raw record of a bulk import, keyed by attribute name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImportRow(BTreeMap<String, LooseValue>);

impl ImportRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<LooseValue>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&LooseValue> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Import row after coercion and reference normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRow {
    pub patch: PurchasePatch,
    /// Status for a newly inserted record; ignored for matched ones.
    pub status: Option<PurchaseStatus>,
}

/// Coerce every recognised column. Unknown columns are ignored; malformed
/// values are reported per field and reject the whole row.
pub fn normalize_row(row: &ImportRow) -> Result<NormalizedRow, FieldErrors> {
    let mut errors = FieldErrors::new();
    let mut patch = PurchasePatch::default();
    let mut status = None;

    for (key, value) in &row.0 {
        let Some(field) = ImportField::from_key(key) else {
            tracing::debug!(column = %key, "ignoring unknown import column");
            continue;
        };
        let attrs = &mut patch.attributes;
        match field {
            ImportField::EntryNumber => patch.entry_number = coerce::to_text(value),
            ImportField::EntryRaw => patch.entry_raw = coerce::to_text(value),
            ImportField::EntryDate => assign(&mut errors, key, &mut patch.entry_date, coerce::to_date(value)),
            ImportField::ContractSubject => attrs.contract_subject = coerce::to_text(value),
            ImportField::SupplierName => attrs.supplier_name = coerce::to_text(value),
            ImportField::Smp => assign(&mut errors, key, &mut attrs.smp, coerce::to_bool(value)),
            ImportField::SupplierInn => attrs.supplier_inn = coerce::to_text(value),
            ImportField::PurchaseAmount => {
                assign(&mut errors, key, &mut attrs.purchase_amount, coerce::to_number(value))
            }
            ImportField::ContractNumber => attrs.contract_number = coerce::to_text(value),
            ImportField::ContractDate => {
                assign(&mut errors, key, &mut attrs.contract_date, coerce::to_date(value))
            }
            ImportField::ValidFrom => assign(&mut errors, key, &mut attrs.valid_from, coerce::to_date(value)),
            ImportField::ValidTo => assign(&mut errors, key, &mut attrs.valid_to, coerce::to_date(value)),
            ImportField::ContractEnd => {
                assign(&mut errors, key, &mut attrs.contract_end, coerce::to_date(value))
            }
            ImportField::InitialPrice => {
                assign(&mut errors, key, &mut attrs.initial_price, coerce::to_number(value))
            }
            ImportField::PlacementDate => {
                assign(&mut errors, key, &mut attrs.placement_date, coerce::to_date(value))
            }
            ImportField::MethodOfPurchase => attrs.method_of_purchase = coerce::to_text(value),
            ImportField::DocumentNumber => attrs.document_number = coerce::to_text(value),
            ImportField::Completed => {
                assign(&mut errors, key, &mut attrs.completed, coerce::to_completed(value))
            }
            ImportField::Savings => assign(&mut errors, key, &mut attrs.savings, coerce::to_number(value)),
            ImportField::PerformanceAmount => {
                assign(&mut errors, key, &mut attrs.performance_amount, coerce::to_number(value))
            }
            ImportField::PerformanceForm => attrs.performance_form = coerce::to_text(value),
            ImportField::AdditionalAgreementNumber => {
                attrs.additional_agreement_number = coerce::to_text(value)
            }
            ImportField::CurrentContractAmount => assign(
                &mut errors,
                key,
                &mut attrs.current_contract_amount,
                coerce::to_number(value),
            ),
            ImportField::Publication => attrs.publication = coerce::to_text(value),
            ImportField::Responsible => attrs.responsible = coerce::to_text(value),
            ImportField::PlanNumber => attrs.plan_number = coerce::to_text(value),
            ImportField::ApplicationAmount => {
                assign(&mut errors, key, &mut attrs.application_amount, coerce::to_number(value))
            }
            ImportField::Comment => attrs.comment = coerce::to_text(value),
            ImportField::Site => assign(&mut errors, key, &mut attrs.site, labelled(value, PurchaseSite::parse)),
            ImportField::Category => {
                assign(&mut errors, key, &mut attrs.category, labelled(value, PurchaseCategory::parse))
            }
            ImportField::BankGuaranteeValidFrom => assign(
                &mut errors,
                key,
                &mut attrs.bank_guarantee_valid_from,
                coerce::to_date(value),
            ),
            ImportField::BankGuaranteeValidTo => assign(
                &mut errors,
                key,
                &mut attrs.bank_guarantee_valid_to,
                coerce::to_date(value),
            ),
            ImportField::Status => assign(&mut errors, key, &mut status, labelled(value, PurchaseStatus::parse)),
        }
    }

    if !errors.is_empty() {
        return Err(errors);
    }
    let patch = patch.normalized();
    if let Err(err) = patch.validate() {
        return Err(err.details().cloned().unwrap_or_default());
    }
    Ok(NormalizedRow { patch, status })
}

fn assign<T>(errors: &mut FieldErrors, key: &str, slot: &mut Option<T>, coerced: Coerced<T>) {
    match coerced {
        Ok(value) => *slot = value,
        Err(message) => errors.insert(key, message),
    }
}

fn labelled<T>(value: &LooseValue, parse: fn(&str) -> Option<T>) -> Coerced<T> {
    match coerce::to_text(value) {
        None => Ok(None),
        Some(text) => parse(&text)
            .map(Some)
            .ok_or_else(|| format!("unknown value {text:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn coerces_register_row() {
        let row = ImportRow::new()
            .with("incomingNumber", "956-вн/ск от 23.07.2025")
            .with("purchaseAmount", "1 200 000,50")
            .with("smp", "да")
            .with("completed", "не состоялась")
            .with("contractDate", 45861.0)
            .with("site", "Вороново")
            .with("status", "на рассмотрении")
            .with("supplierInn", 7_701_234_567.0)
            .with("unexpected", "ignored");

        let normalized = normalize_row(&row).unwrap();
        let patch = &normalized.patch;

        assert_eq!(patch.entry_number.as_deref(), Some("956-вн/ск"));
        assert_eq!(patch.entry_date, Some(Utc.with_ymd_and_hms(2025, 7, 23, 0, 0, 0).unwrap()));
        assert_eq!(patch.entry_raw, None);
        assert_eq!(patch.attributes.purchase_amount, Some(1_200_000.5));
        assert_eq!(patch.attributes.smp, Some(true));
        assert_eq!(patch.attributes.completed, Some(false));
        assert_eq!(patch.attributes.site, Some(PurchaseSite::Voronovo));
        assert_eq!(patch.attributes.supplier_inn.as_deref(), Some("7701234567"));
        assert_eq!(normalized.status, Some(PurchaseStatus::UnderReview));
    }

    #[test]
    fn malformed_cells_are_reported_per_field() {
        let row = ImportRow::new()
            .with("entryNumber", "A-1")
            .with("purchaseAmount", "много")
            .with("contractDate", "позавчера")
            .with("category", "furniture");

        let errors = normalize_row(&row).unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors.get("purchaseAmount").is_some());
        assert!(errors.get("contractDate").is_some());
        assert!(errors.get("category").is_some());
    }

    #[test]
    fn rows_deserialize_from_json_with_nulls() {
        let row: ImportRow =
            serde_json::from_str(r#"{"entryNumber":"B-2","savings":null,"smp":true,"initialPrice":15}"#).unwrap();

        let normalized = normalize_row(&row).unwrap();
        assert_eq!(normalized.patch.entry_number.as_deref(), Some("B-2"));
        assert_eq!(normalized.patch.attributes.savings, None);
        assert_eq!(normalized.patch.attributes.initial_price, Some(15.0));
    }

    #[test]
    fn match_key_reads_the_right_attribute() {
        let row = ImportRow::new().with("entryNumber", "E-1").with("planNumber", "P-9");
        let patch = normalize_row(&row).unwrap().patch;

        assert_eq!(MatchKey::default().value_in_patch(&patch), Some("E-1"));
        assert_eq!(MatchKey::PlanNumber.value_in_patch(&patch), Some("P-9"));
        assert_eq!(MatchKey::SupplierInn.value_in_patch(&patch), None);
    }

    #[test]
    fn raw_key_ignores_malformed_neighbours() {
        let row = ImportRow::new()
            .with("incomingNumber", "956-вн/ск от 23.07.2025")
            .with("purchaseAmount", "много");

        assert_eq!(MatchKey::EntryNumber.value_in_row(&row).as_deref(), Some("956-вн/ск"));
        assert_eq!(MatchKey::ContractNumber.value_in_row(&row), None);
        assert_eq!(
            MatchKey::SupplierInn.value_in_row(&ImportRow::new().with("supplierInn", 7701234567.0)).as_deref(),
            Some("7701234567")
        );
    }
}
