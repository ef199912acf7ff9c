//! Purchasing domain: procurement records, their status ledger, reference
//! parsing, filter compilation and import normalization.
//!
//! Everything here is deterministic domain logic (no IO, no HTTP, no storage).

pub mod coerce;
pub mod filter;
pub mod import;
pub mod ledger;
pub mod purchase;
pub mod reference;

pub use filter::{
    CompiledQuery, DateField, DateRange, ExportQuery, FilterCompiler, Page, Predicate,
    PurchaseFilter, Sort, SortField, SortOrder, TextField, TextPattern,
};
pub use import::{ImportField, ImportRow, MatchKey, NormalizedRow, normalize_row};
pub use ledger::{StatusChange, StatusHistoryEntry, StatusLedger};
pub use purchase::{
    NewPurchase, Purchase, PurchaseAttributes, PurchaseCategory, PurchaseParts, PurchasePatch,
    PurchaseSite, PurchaseStatus, UserRef,
};
pub use reference::EntryReference;
