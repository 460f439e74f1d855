//! Core types and traits for tallybridge staging backends.
//!
//! This crate provides the `StagingStore` and `CompanyDirectory` traits and the
//! domain records they hold, so backends can live in separate crates.

pub mod models;
pub mod storage;

// Re-export key types at crate root for convenience
pub use models::{
    company_slug, date_to_str, parse_date, CompanyBinding, DrCr, JournalPosting, LedgerMaster,
    RecordId, TransactionRecord, UploadId, BANK_ACCOUNTS_PARENT,
};
pub use models::read::{BatchSummary, StagedRecord};
pub use models::write::{NewBatch, RecordSelection, STATUS_SENT};
pub use storage::{CompanyDirectory, StagingStore, StorageError, Store};
