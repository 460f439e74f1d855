use crate::models::{
    read::{BatchSummary, StagedRecord},
    write::{NewBatch, RecordSelection},
    CompanyBinding, LedgerMaster, RecordId, TransactionRecord, UploadId,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{0}")]
    Other(String),
    #[error("batch not found: {0}")]
    BatchNotFound(String),
    #[error("company not found: {0}")]
    CompanyNotFound(String),
}

/// Holding area for uploaded transaction batches and the ledger masters they
/// get assigned to.
///
/// Mutating methods are expected to be called from a single writer; backends
/// still keep each call atomic on its own.
pub trait StagingStore: Send + Sync {
    fn create_batch(&self, batch: &NewBatch) -> Result<UploadId, StorageError>;
    /// Deletes every record of the batch and inserts `records` in their place.
    fn replace_batch(&self, upload_id: &str, records: &[TransactionRecord]) -> Result<usize, StorageError>;
    fn list_batches(&self, owner: &str, company: &str) -> Result<Vec<BatchSummary>, StorageError>;
    fn get_batch(&self, upload_id: &str) -> Result<Vec<StagedRecord>, StorageError>;
    fn get_records(&self, upload_id: &str, ids: &[RecordId]) -> Result<Vec<StagedRecord>, StorageError>;
    fn set_status(&self, upload_id: &str, selection: &RecordSelection, status: &str) -> Result<usize, StorageError>;

    fn get_ledger_options(&self, company_id: &str) -> Result<Vec<String>, StorageError>;
    fn get_bank_accounts(&self, owner: &str, company_id: &str) -> Result<Vec<String>, StorageError>;
    /// Inserts ledgers the company does not have yet; returns how many were new.
    fn upsert_ledgers(&self, company_id: &str, ledgers: &[LedgerMaster]) -> Result<usize, StorageError>;
}

pub trait CompanyDirectory: Send + Sync {
    fn get_or_create(&self, owner: &str, display_name: &str) -> Result<String, StorageError>;
    fn resolve(&self, company_id: &str) -> Result<Option<String>, StorageError>;
    fn record_last_sync(&self, owner: &str, company_id: &str) -> Result<(), StorageError>;
    fn list_companies(&self, owner: &str) -> Result<Vec<CompanyBinding>, StorageError>;
}

pub trait Store: StagingStore + CompanyDirectory {}

impl<T: StagingStore + CompanyDirectory> Store for T {}

pub fn format_timestamp(ts: time::OffsetDateTime) -> String {
    format!(
        "{} {:02}:{:02}:{:02}",
        crate::models::date_to_str(ts.date()),
        ts.hour(),
        ts.minute(),
        ts.second()
    )
}
