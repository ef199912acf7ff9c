//! Infrastructure layer: purchase storage, bulk reconciliation, use-case
//! services, export rendering and configuration.

pub mod config;
pub mod export;
pub mod reconcile;
pub mod service;
pub mod store;


pub use config::{AppConfig, ConfigError};
pub use export::ExportFile;
pub use reconcile::{BatchOutcome, FailureCounts, ReconcileOptions, ReconciliationEngine, RowDiagnostic};
pub use service::{BatchImportRequest, PurchasePage, PurchaseService, ServiceConfig};
pub use store::{
    BulkWriteReport, FailureKind, FindOptions, InMemoryPurchaseStore, PostgresPurchaseStore,
    PurchaseStore, StoreError, UpsertOp, WriteFailure, WriteMode,
};
