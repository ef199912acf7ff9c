//! Filter compilation: an optional-field filter turned into a typed predicate,
//! a sort order and a page window.
//!
//! The same predicate and sort serve paginated listing and capped export, so
//! both always agree on which records a filter selects. Stores either evaluate
//! [`Predicate::matches`] directly or render the predicate into their own
//! query language.

use std::cmp::Ordering;

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use procura_core::{DomainError, DomainResult, ValueObject};

use crate::purchase::{Purchase, PurchaseCategory, PurchaseSite, PurchaseStatus};

/// Caller-facing filter. Every field is optional and independent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PurchaseFilter {
    /// Free text searched across [`TextField::SEARCHABLE`].
    pub q: Option<String>,
    pub page: Option<i64>,
    pub page_size: Option<i64>,
    pub sort_by: Option<SortField>,
    pub sort_order: Option<SortOrder>,
    pub completed: Option<bool>,
    /// Substring of the responsible person's name.
    pub responsible: Option<String>,
    pub status: Option<PurchaseStatus>,
    pub site: Option<PurchaseSite>,
    pub category: Option<PurchaseCategory>,
    /// Generic range, applied to the contract date.
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    /// Calendar year shorthand for the generic range.
    pub year: Option<i32>,
    pub last_status_changed_from: Option<NaiveDate>,
    pub last_status_changed_to: Option<NaiveDate>,
    pub bank_guarantee_valid_from_from: Option<NaiveDate>,
    pub bank_guarantee_valid_from_to: Option<NaiveDate>,
    pub bank_guarantee_valid_to_from: Option<NaiveDate>,
    pub bank_guarantee_valid_to_to: Option<NaiveDate>,
    /// `Some(true)` lists soft-deleted records instead of live ones.
    pub deleted: Option<bool>,
}

/// Text attributes a predicate can search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextField {
    SupplierName,
    ContractSubject,
    ContractNumber,
    EntryNumber,
    SupplierInn,
    MethodOfPurchase,
    DocumentNumber,
    PlanNumber,
    Publication,
    Responsible,
    Comment,
}

impl TextField {
    /// Fields the free-text query is OR'd across.
    pub const SEARCHABLE: [TextField; 11] = [
        TextField::SupplierName,
        TextField::ContractSubject,
        TextField::ContractNumber,
        TextField::EntryNumber,
        TextField::SupplierInn,
        TextField::MethodOfPurchase,
        TextField::DocumentNumber,
        TextField::PlanNumber,
        TextField::Publication,
        TextField::Responsible,
        TextField::Comment,
    ];

    /// Storage column name.
    pub fn column(self) -> &'static str {
        match self {
            Self::SupplierName => "supplier_name",
            Self::ContractSubject => "contract_subject",
            Self::ContractNumber => "contract_number",
            Self::EntryNumber => "entry_number",
            Self::SupplierInn => "supplier_inn",
            Self::MethodOfPurchase => "method_of_purchase",
            Self::DocumentNumber => "document_number",
            Self::PlanNumber => "plan_number",
            Self::Publication => "publication",
            Self::Responsible => "responsible",
            Self::Comment => "comment",
        }
    }

    pub fn value(self, purchase: &Purchase) -> Option<&str> {
        let attrs = purchase.attributes();
        match self {
            Self::SupplierName => attrs.supplier_name.as_deref(),
            Self::ContractSubject => attrs.contract_subject.as_deref(),
            Self::ContractNumber => attrs.contract_number.as_deref(),
            Self::EntryNumber => purchase.entry_number(),
            Self::SupplierInn => attrs.supplier_inn.as_deref(),
            Self::MethodOfPurchase => attrs.method_of_purchase.as_deref(),
            Self::DocumentNumber => attrs.document_number.as_deref(),
            Self::PlanNumber => attrs.plan_number.as_deref(),
            Self::Publication => attrs.publication.as_deref(),
            Self::Responsible => attrs.responsible.as_deref(),
            Self::Comment => attrs.comment.as_deref(),
        }
    }
}

/// Timestamp attributes a predicate can range over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DateField {
    ContractDate,
    LastStatusChangedAt,
    BankGuaranteeValidFrom,
    BankGuaranteeValidTo,
}

impl DateField {
    pub fn column(self) -> &'static str {
        match self {
            Self::ContractDate => "contract_date",
            Self::LastStatusChangedAt => "last_status_changed_at",
            Self::BankGuaranteeValidFrom => "bank_guarantee_valid_from",
            Self::BankGuaranteeValidTo => "bank_guarantee_valid_to",
        }
    }

    pub fn value(self, purchase: &Purchase) -> Option<DateTime<Utc>> {
        let attrs = purchase.attributes();
        match self {
            Self::ContractDate => attrs.contract_date,
            Self::LastStatusChangedAt => purchase.last_status_changed_at(),
            Self::BankGuaranteeValidFrom => attrs.bank_guarantee_valid_from,
            Self::BankGuaranteeValidTo => attrs.bank_guarantee_valid_to,
        }
    }
}

/// Inclusive instant range; a missing bound is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl ValueObject for DateRange {}

impl DateRange {
    /// Whole-day range: `from` at 00:00:00.000 UTC, `to` at 23:59:59.999 UTC.
    /// `None` when both days are absent.
    pub fn days(from: Option<NaiveDate>, to: Option<NaiveDate>) -> Option<Self> {
        if from.is_none() && to.is_none() {
            return None;
        }
        Some(Self {
            from: from.map(start_of_day),
            to: to.map(end_of_day),
        })
    }

    pub fn year(year: i32) -> DomainResult<Self> {
        let first = NaiveDate::from_ymd_opt(year, 1, 1);
        let last = NaiveDate::from_ymd_opt(year, 12, 31);
        match (first, last) {
            (Some(first), Some(last)) if (1..=9999).contains(&first.year()) => {
                Ok(Self { from: Some(start_of_day(first)), to: Some(end_of_day(last)) })
            }
            _ => Err(DomainError::invalid_field("year", format!("{year} is not a valid year"))),
        }
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.from.is_none_or(|from| instant >= from) && self.to.is_none_or(|to| instant <= to)
    }
}

fn start_of_day(day: NaiveDate) -> DateTime<Utc> {
    day.and_time(NaiveTime::MIN).and_utc()
}

fn end_of_day(day: NaiveDate) -> DateTime<Utc> {
    let last_milli = NaiveTime::from_hms_milli_opt(23, 59, 59, 999).unwrap_or(NaiveTime::MIN);
    day.and_time(last_milli).and_utc()
}

/// Case-insensitive substring pattern, stored literally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextPattern {
    literal: String,
    folded: String,
}

impl TextPattern {
    /// `None` for blank input.
    pub fn new(raw: &str) -> Option<Self> {
        let literal = raw.trim();
        if literal.is_empty() {
            return None;
        }
        Some(Self {
            literal: literal.to_string(),
            folded: literal.to_lowercase(),
        })
    }

    pub fn literal(&self) -> &str {
        &self.literal
    }

    pub fn is_match(&self, haystack: &str) -> bool {
        haystack.to_lowercase().contains(&self.folded)
    }

    /// SQL `LIKE` pattern with `\`, `%` and `_` escaped (use with `ESCAPE '\'`).
    pub fn like_pattern(&self) -> String {
        let mut pattern = String::with_capacity(self.literal.len() + 2);
        pattern.push('%');
        for c in self.literal.chars() {
            if matches!(c, '\\' | '%' | '_') {
                pattern.push('\\');
            }
            pattern.push(c);
        }
        pattern.push('%');
        pattern
    }
}

/// Typed, store-independent query predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    TextContains { field: TextField, pattern: TextPattern },
    StatusIs(PurchaseStatus),
    SiteIs(PurchaseSite),
    CategoryIs(PurchaseCategory),
    CompletedIs(bool),
    DeletedIs(bool),
    DateWithin { field: DateField, range: DateRange },
}

impl Predicate {
    /// Records without a value for a ranged or searched field never match it.
    pub fn matches(&self, purchase: &Purchase) -> bool {
        match self {
            Self::And(parts) => parts.iter().all(|p| p.matches(purchase)),
            Self::Or(parts) => parts.iter().any(|p| p.matches(purchase)),
            Self::TextContains { field, pattern } => {
                field.value(purchase).is_some_and(|v| pattern.is_match(v))
            }
            Self::StatusIs(status) => purchase.status() == *status,
            Self::SiteIs(site) => purchase.attributes().site == Some(*site),
            Self::CategoryIs(category) => purchase.attributes().category == Some(*category),
            Self::CompletedIs(flag) => purchase.completed() == *flag,
            Self::DeletedIs(flag) => purchase.is_deleted() == *flag,
            Self::DateWithin { field, range } => {
                field.value(purchase).is_some_and(|t| range.contains(t))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortField {
    #[default]
    CreatedAt,
    UpdatedAt,
    EntryNumber,
    EntryDate,
    ContractDate,
    PlacementDate,
    LastStatusChangedAt,
    Status,
    SupplierName,
    PurchaseAmount,
    Responsible,
}

impl SortField {
    pub fn column(self) -> &'static str {
        match self {
            Self::CreatedAt => "created_at",
            Self::UpdatedAt => "updated_at",
            Self::EntryNumber => "entry_number",
            Self::EntryDate => "entry_date",
            Self::ContractDate => "contract_date",
            Self::PlacementDate => "placement_date",
            Self::LastStatusChangedAt => "last_status_changed_at",
            Self::Status => "status",
            Self::SupplierName => "supplier_name",
            Self::PurchaseAmount => "purchase_amount",
            Self::Responsible => "responsible",
        }
    }

    fn key(self, purchase: &Purchase) -> SortKey<'_> {
        let attrs = purchase.attributes();
        match self {
            Self::CreatedAt => SortKey::Time(Some(purchase.created_at())),
            Self::UpdatedAt => SortKey::Time(Some(purchase.updated_at())),
            Self::EntryNumber => SortKey::Text(purchase.entry_number()),
            Self::EntryDate => SortKey::Time(purchase.reference().date),
            Self::ContractDate => SortKey::Time(attrs.contract_date),
            Self::PlacementDate => SortKey::Time(attrs.placement_date),
            Self::LastStatusChangedAt => SortKey::Time(purchase.last_status_changed_at()),
            Self::Status => SortKey::Text(Some(purchase.status().as_str())),
            Self::SupplierName => SortKey::Text(attrs.supplier_name.as_deref()),
            Self::PurchaseAmount => SortKey::Number(attrs.purchase_amount),
            Self::Responsible => SortKey::Text(attrs.responsible.as_deref()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

enum SortKey<'a> {
    Text(Option<&'a str>),
    Time(Option<DateTime<Utc>>),
    Number(Option<f64>),
}

impl SortKey<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Text(a), Self::Text(b)) => a.cmp(b),
            (Self::Time(a), Self::Time(b)) => a.cmp(b),
            (Self::Number(a), Self::Number(b)) => match (a, b) {
                (Some(a), Some(b)) => a.total_cmp(b),
                _ => a.is_some().cmp(&b.is_some()),
            },
            _ => Ordering::Equal,
        }
    }
}

/// Sort order; missing values sort before present ones, ties break on id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sort {
    pub field: SortField,
    pub order: SortOrder,
}

impl Sort {
    pub fn compare(&self, a: &Purchase, b: &Purchase) -> Ordering {
        let ordering = self
            .field
            .key(a)
            .cmp(&self.field.key(b))
            .then_with(|| a.id_typed().cmp(&b.id_typed()));
        match self.order {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        }
    }
}

/// One-based page window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub number: u32,
    pub size: u32,
}

impl Page {
    pub const DEFAULT_SIZE: u32 = 20;
    pub const MAX_SIZE: u32 = 200;

    /// Page below 1 becomes 1; size is clamped to `1..=MAX_SIZE`.
    pub fn new(page: Option<i64>, size: Option<i64>) -> Self {
        let number = page.unwrap_or(1).clamp(1, i64::from(u32::MAX)) as u32;
        let size = size
            .unwrap_or(i64::from(Self::DEFAULT_SIZE))
            .clamp(1, i64::from(Self::MAX_SIZE)) as u32;
        Self { number, size }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.number - 1) * u64::from(self.size)
    }

    pub fn limit(&self) -> u64 {
        u64::from(self.size)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// Listing query: predicate, sort and page window.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub predicate: Predicate,
    pub sort: Sort,
    pub page: Page,
}

/// Export query: listing predicate and sort, capped instead of paged.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportQuery {
    pub predicate: Predicate,
    pub sort: Sort,
    pub max_rows: usize,
}

pub struct FilterCompiler;

impl FilterCompiler {
    pub fn compile(filter: &PurchaseFilter) -> DomainResult<CompiledQuery> {
        Ok(CompiledQuery {
            predicate: Self::predicate(filter)?,
            sort: Self::sort(filter),
            page: Page::new(filter.page, filter.page_size),
        })
    }

    pub fn compile_export(filter: &PurchaseFilter, max_rows: usize) -> DomainResult<ExportQuery> {
        Ok(ExportQuery {
            predicate: Self::predicate(filter)?,
            sort: Self::sort(filter),
            max_rows,
        })
    }

    pub fn sort(filter: &PurchaseFilter) -> Sort {
        Sort {
            field: filter.sort_by.unwrap_or_default(),
            order: filter.sort_order.unwrap_or_default(),
        }
    }

    /// Conjunction of every supplied criterion plus the deletion scope.
    pub fn predicate(filter: &PurchaseFilter) -> DomainResult<Predicate> {
        let mut parts = vec![Predicate::DeletedIs(filter.deleted.unwrap_or(false))];

        if let Some(pattern) = filter.q.as_deref().and_then(TextPattern::new) {
            parts.push(Predicate::Or(
                TextField::SEARCHABLE
                    .iter()
                    .map(|&field| Predicate::TextContains { field, pattern: pattern.clone() })
                    .collect(),
            ));
        }
        if let Some(status) = filter.status {
            parts.push(Predicate::StatusIs(status));
        }
        if let Some(site) = filter.site {
            parts.push(Predicate::SiteIs(site));
        }
        if let Some(category) = filter.category {
            parts.push(Predicate::CategoryIs(category));
        }
        if let Some(completed) = filter.completed {
            parts.push(Predicate::CompletedIs(completed));
        }
        if let Some(pattern) = filter.responsible.as_deref().and_then(TextPattern::new) {
            parts.push(Predicate::TextContains { field: TextField::Responsible, pattern });
        }

        let generic = match (DateRange::days(filter.date_from, filter.date_to), filter.year) {
            (Some(range), _) => Some(range),
            (None, Some(year)) => Some(DateRange::year(year)?),
            (None, None) => None,
        };
        let ranges = [
            (DateField::ContractDate, generic),
            (
                DateField::LastStatusChangedAt,
                DateRange::days(filter.last_status_changed_from, filter.last_status_changed_to),
            ),
            (
                DateField::BankGuaranteeValidFrom,
                DateRange::days(filter.bank_guarantee_valid_from_from, filter.bank_guarantee_valid_from_to),
            ),
            (
                DateField::BankGuaranteeValidTo,
                DateRange::days(filter.bank_guarantee_valid_to_from, filter.bank_guarantee_valid_to_to),
            ),
        ];
        for (field, range) in ranges {
            if let Some(range) = range {
                parts.push(Predicate::DateWithin { field, range });
            }
        }

        Ok(Predicate::And(parts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    use crate::purchase::{NewPurchase, PurchaseAttributes, PurchasePatch, UserRef};

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn purchase_with(attributes: PurchaseAttributes) -> Purchase {
        Purchase::create(
            NewPurchase {
                patch: PurchasePatch {
                    entry_number: Some("A-1".to_string()),
                    attributes,
                    ..PurchasePatch::default()
                },
                created_by: Some(UserRef::new("Test User", "test@example.org")),
                ..NewPurchase::default()
            },
            Utc.with_ymd_and_hms(2025, 1, 10, 8, 0, 0).unwrap(),
        )
        .unwrap()
    }

    fn date_range_of(predicate: &Predicate, wanted: DateField) -> Option<DateRange> {
        let Predicate::And(parts) = predicate else {
            return None;
        };
        parts.iter().find_map(|p| match p {
            Predicate::DateWithin { field, range } if *field == wanted => Some(*range),
            _ => None,
        })
    }

    #[test]
    fn defaults_exclude_deleted_and_sort_newest_first() {
        let query = FilterCompiler::compile(&PurchaseFilter::default()).unwrap();

        assert_eq!(query.predicate, Predicate::And(vec![Predicate::DeletedIs(false)]));
        assert_eq!(query.sort, Sort { field: SortField::CreatedAt, order: SortOrder::Desc });
        assert_eq!(query.page, Page { number: 1, size: 20 });
    }

    #[test]
    fn year_expands_to_whole_calendar_year() {
        let filter = PurchaseFilter { year: Some(2025), ..PurchaseFilter::default() };
        let predicate = FilterCompiler::predicate(&filter).unwrap();

        let range = date_range_of(&predicate, DateField::ContractDate).unwrap();
        assert_eq!(range.from, Some(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()));
        assert_eq!(
            range.to,
            Some(Utc.with_ymd_and_hms(2025, 12, 31, 23, 59, 59).unwrap() + chrono::Duration::milliseconds(999))
        );
    }

    #[test]
    fn explicit_range_wins_over_year() {
        let filter = PurchaseFilter {
            year: Some(2020),
            date_from: Some(day(2025, 3, 1)),
            ..PurchaseFilter::default()
        };
        let predicate = FilterCompiler::predicate(&filter).unwrap();

        let range = date_range_of(&predicate, DateField::ContractDate).unwrap();
        assert_eq!(range.from, Some(Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap()));
        assert_eq!(range.to, None);
    }

    #[test]
    fn half_open_ranges_keep_missing_bound_open() {
        let filter = PurchaseFilter {
            last_status_changed_to: Some(day(2025, 6, 30)),
            ..PurchaseFilter::default()
        };
        let predicate = FilterCompiler::predicate(&filter).unwrap();

        let range = date_range_of(&predicate, DateField::LastStatusChangedAt).unwrap();
        assert_eq!(range.from, None);
        assert!(range.contains(Utc.with_ymd_and_hms(2025, 6, 30, 23, 59, 59).unwrap()));
        assert!(!range.contains(Utc.with_ymd_and_hms(2025, 7, 1, 0, 0, 0).unwrap()));
    }

    #[test]
    fn invalid_year_is_a_validation_error() {
        let filter = PurchaseFilter { year: Some(0), ..PurchaseFilter::default() };
        let err = FilterCompiler::compile(&filter).unwrap_err();
        assert!(err.details().unwrap().get("year").is_some());
    }

    #[test]
    fn free_text_matches_any_searchable_field_case_insensitively() {
        let filter = PurchaseFilter { q: Some("  ромаш ".to_string()), ..PurchaseFilter::default() };
        let predicate = FilterCompiler::predicate(&filter).unwrap();

        let hit = purchase_with(PurchaseAttributes {
            supplier_name: Some("ООО РОМАШКА".to_string()),
            ..PurchaseAttributes::default()
        });
        let miss = purchase_with(PurchaseAttributes {
            supplier_name: Some("ООО Лютик".to_string()),
            ..PurchaseAttributes::default()
        });

        assert!(predicate.matches(&hit));
        assert!(!predicate.matches(&miss));
    }

    #[test]
    fn metacharacters_are_literal() {
        let pattern = TextPattern::new("100%_a\\b").unwrap();
        assert_eq!(pattern.like_pattern(), "%100\\%\\_a\\\\b%");
        assert!(pattern.is_match("Итого 100%_A\\B"));
        assert!(!TextPattern::new("a.*").unwrap().is_match("abc"));
    }

    #[test]
    fn deleted_records_only_when_asked() {
        let mut purchase = purchase_with(PurchaseAttributes::default());
        let live = FilterCompiler::predicate(&PurchaseFilter::default()).unwrap();
        let bin = FilterCompiler::predicate(&PurchaseFilter {
            deleted: Some(true),
            ..PurchaseFilter::default()
        })
        .unwrap();

        assert!(live.matches(&purchase));
        purchase.set_deleted(true, purchase.created_at());
        assert!(!live.matches(&purchase));
        assert!(bin.matches(&purchase));
    }

    #[test]
    fn missing_sort_values_come_first_ascending() {
        let with_amount = purchase_with(PurchaseAttributes {
            purchase_amount: Some(5.0),
            ..PurchaseAttributes::default()
        });
        let without = purchase_with(PurchaseAttributes::default());
        let sort = Sort { field: SortField::PurchaseAmount, order: SortOrder::Asc };

        assert_eq!(sort.compare(&without, &with_amount), Ordering::Less);
    }

    #[test]
    fn filter_deserializes_from_camel_case() {
        let filter: PurchaseFilter = serde_json::from_str(
            r#"{"q":"x","pageSize":50,"sortBy":"contractDate","sortOrder":"asc","status":"rejected","dateFrom":"2025-01-01"}"#,
        )
        .unwrap();

        assert_eq!(filter.page_size, Some(50));
        assert_eq!(filter.sort_by, Some(SortField::ContractDate));
        assert_eq!(filter.sort_order, Some(SortOrder::Asc));
        assert_eq!(filter.status, Some(PurchaseStatus::Rejected));
        assert_eq!(filter.date_from, Some(day(2025, 1, 1)));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        #[test]
        fn page_window_is_always_clamped(page in proptest::option::of(any::<i64>()), size in proptest::option::of(any::<i64>())) {
            let window = Page::new(page, size);
            prop_assert!(window.number >= 1);
            prop_assert!((1..=Page::MAX_SIZE).contains(&window.size));
        }
    }
}
