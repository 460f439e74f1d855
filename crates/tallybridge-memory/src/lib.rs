//! In-memory staging backend. Nothing survives a restart; used by tests and
//! by `storage.backend = "memory"`.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        RwLock,
    },
};

use tallybridge_core::{
    company_slug,
    storage::format_timestamp,
    BatchSummary, CompanyBinding, CompanyDirectory, LedgerMaster, NewBatch, RecordId, RecordSelection,
    StagedRecord, StagingStore, StorageError, TransactionRecord, UploadId,
};
use uuid::Uuid;

struct BatchData {
    sequence: u64,
    owner: String,
    company: String,
    bank_account: String,
    source_name: String,
    records: Vec<(RecordId, TransactionRecord)>,
}

struct CompanyData {
    display_name: String,
    ledgers: BTreeMap<String, LedgerMaster>,
}

#[derive(Default)]
struct Binding {
    last_sync_time: Option<String>,
}

pub struct InMemoryStore {
    batches: RwLock<BTreeMap<UploadId, BatchData>>,
    companies: RwLock<BTreeMap<String, CompanyData>>,
    bindings: RwLock<BTreeMap<(String, String), Binding>>,
    sequence_counter: AtomicU64,
    record_counter: AtomicI64,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            batches: RwLock::new(BTreeMap::new()),
            companies: RwLock::new(BTreeMap::new()),
            bindings: RwLock::new(BTreeMap::new()),
            sequence_counter: AtomicU64::new(1),
            record_counter: AtomicI64::new(1),
        }
    }

    fn next_sequence(&self) -> u64 {
        self.sequence_counter.fetch_add(1, Ordering::SeqCst)
    }

    fn number_records(&self, records: &[TransactionRecord]) -> Vec<(RecordId, TransactionRecord)> {
        records
            .iter()
            .map(|r| (self.record_counter.fetch_add(1, Ordering::SeqCst), r.clone()))
            .collect()
    }
}

fn staged(upload_id: &str, batch: &BatchData, id: RecordId, record: &TransactionRecord) -> StagedRecord {
    StagedRecord {
        id,
        upload_id: upload_id.to_string(),
        bank_account: batch.bank_account.clone(),
        record: record.clone(),
    }
}

impl StagingStore for InMemoryStore {
    fn create_batch(&self, batch: &NewBatch) -> Result<UploadId, StorageError> {
        let upload_id = Uuid::new_v4().to_string();
        let data = BatchData {
            sequence: self.next_sequence(),
            owner: batch.owner.clone(),
            company: batch.company.clone(),
            bank_account: batch.bank_account.clone(),
            source_name: batch.source_name.clone(),
            records: self.number_records(&batch.records),
        };
        self.batches.write().unwrap().insert(upload_id.clone(), data);
        tracing::debug!(%upload_id, records = batch.records.len(), "Batch created");
        Ok(upload_id)
    }

    fn replace_batch(&self, upload_id: &str, records: &[TransactionRecord]) -> Result<usize, StorageError> {
        let numbered = self.number_records(records);
        let mut batches = self.batches.write().unwrap();
        let batch = batches
            .get_mut(upload_id)
            .ok_or_else(|| StorageError::BatchNotFound(upload_id.to_string()))?;
        batch.records = numbered;
        Ok(batch.records.len())
    }

    fn list_batches(&self, owner: &str, company: &str) -> Result<Vec<BatchSummary>, StorageError> {
        let batches = self.batches.read().unwrap();
        let mut matching: Vec<(u64, BatchSummary)> = batches
            .iter()
            .filter(|(_, b)| b.owner == owner && b.company == company)
            .map(|(id, b)| {
                (
                    b.sequence,
                    BatchSummary {
                        upload_id: id.clone(),
                        source_name: b.source_name.clone(),
                    },
                )
            })
            .collect();
        matching.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(matching.into_iter().map(|(_, s)| s).collect())
    }

    fn get_batch(&self, upload_id: &str) -> Result<Vec<StagedRecord>, StorageError> {
        let batches = self.batches.read().unwrap();
        let batch = batches
            .get(upload_id)
            .ok_or_else(|| StorageError::BatchNotFound(upload_id.to_string()))?;
        Ok(batch
            .records
            .iter()
            .map(|(id, r)| staged(upload_id, batch, *id, r))
            .collect())
    }

    fn get_records(&self, upload_id: &str, ids: &[RecordId]) -> Result<Vec<StagedRecord>, StorageError> {
        let batches = self.batches.read().unwrap();
        let batch = batches
            .get(upload_id)
            .ok_or_else(|| StorageError::BatchNotFound(upload_id.to_string()))?;
        Ok(batch
            .records
            .iter()
            .filter(|(id, _)| ids.contains(id))
            .map(|(id, r)| staged(upload_id, batch, *id, r))
            .collect())
    }

    fn set_status(&self, upload_id: &str, selection: &RecordSelection, status: &str) -> Result<usize, StorageError> {
        let mut batches = self.batches.write().unwrap();
        let batch = batches
            .get_mut(upload_id)
            .ok_or_else(|| StorageError::BatchNotFound(upload_id.to_string()))?;
        let mut updated = 0;
        for (id, record) in batch.records.iter_mut() {
            if selection.contains(*id) {
                record.status = status.to_string();
                updated += 1;
            }
        }
        tracing::debug!(%upload_id, updated, status, "Record status updated");
        Ok(updated)
    }

    fn get_ledger_options(&self, company_id: &str) -> Result<Vec<String>, StorageError> {
        let companies = self.companies.read().unwrap();
        Ok(match companies.get(company_id) {
            Some(c) => c.ledgers.keys().cloned().collect(),
            None => Vec::new(),
        })
    }

    fn get_bank_accounts(&self, owner: &str, company_id: &str) -> Result<Vec<String>, StorageError> {
        let bound = self
            .bindings
            .read()
            .unwrap()
            .contains_key(&(owner.to_string(), company_id.to_string()));
        if !bound {
            tracing::warn!(owner, company_id, "Owner has no access to company");
            return Ok(Vec::new());
        }
        let companies = self.companies.read().unwrap();
        Ok(match companies.get(company_id) {
            Some(c) => c
                .ledgers
                .values()
                .filter(|l| l.is_bank_account())
                .map(|l| l.name.clone())
                .collect(),
            None => Vec::new(),
        })
    }

    fn upsert_ledgers(&self, company_id: &str, ledgers: &[LedgerMaster]) -> Result<usize, StorageError> {
        let mut companies = self.companies.write().unwrap();
        let company = companies
            .get_mut(company_id)
            .ok_or_else(|| StorageError::CompanyNotFound(company_id.to_string()))?;
        let mut inserted = 0;
        for ledger in ledgers {
            if company.ledgers.contains_key(&ledger.name) {
                continue;
            }
            company.ledgers.insert(ledger.name.clone(), ledger.clone());
            inserted += 1;
        }
        Ok(inserted)
    }
}

impl CompanyDirectory for InMemoryStore {
    fn get_or_create(&self, owner: &str, display_name: &str) -> Result<String, StorageError> {
        let company_id = company_slug(display_name);
        self.companies
            .write()
            .unwrap()
            .entry(company_id.clone())
            .or_insert_with(|| CompanyData {
                display_name: display_name.to_string(),
                ledgers: BTreeMap::new(),
            });
        self.bindings
            .write()
            .unwrap()
            .entry((owner.to_string(), company_id.clone()))
            .or_default();
        Ok(company_id)
    }

    fn resolve(&self, company_id: &str) -> Result<Option<String>, StorageError> {
        Ok(self
            .companies
            .read()
            .unwrap()
            .get(company_id)
            .map(|c| c.display_name.clone()))
    }

    fn record_last_sync(&self, owner: &str, company_id: &str) -> Result<(), StorageError> {
        let mut bindings = self.bindings.write().unwrap();
        let binding = bindings
            .get_mut(&(owner.to_string(), company_id.to_string()))
            .ok_or_else(|| StorageError::CompanyNotFound(company_id.to_string()))?;
        binding.last_sync_time = Some(format_timestamp(time::OffsetDateTime::now_utc()));
        Ok(())
    }

    fn list_companies(&self, owner: &str) -> Result<Vec<CompanyBinding>, StorageError> {
        let bindings = self.bindings.read().unwrap();
        let companies = self.companies.read().unwrap();
        Ok(bindings
            .iter()
            .filter(|((o, _), _)| o == owner)
            .filter_map(|((o, id), b)| {
                companies.get(id).map(|c| CompanyBinding {
                    owner: o.clone(),
                    company_id: id.clone(),
                    display_name: c.display_name.clone(),
                    last_sync_time: b.last_sync_time.clone(),
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn record(desc: &str, ledger: &str) -> TransactionRecord {
        TransactionRecord {
            description: desc.to_string(),
            amount: Some(dec!(120.50)),
            assigned_ledger: ledger.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_replace_is_full_overwrite() {
        let store = InMemoryStore::new();
        let id = store
            .create_batch(&NewBatch {
                owner: "ana".into(),
                company: "acme".into(),
                bank_account: "HDFC".into(),
                source_name: "may.xlsx".into(),
                records: vec![record("a", ""), record("b", "Rent")],
            })
            .unwrap();

        store.replace_batch(&id, &[record("c", "Fuel")]).unwrap();

        let rows = store.get_batch(&id).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].record.description, "c");
        assert_eq!(rows[0].bank_account, "HDFC");
    }

    #[test]
    fn test_unknown_batch_is_not_found() {
        let store = InMemoryStore::new();
        assert!(matches!(
            store.replace_batch("missing", &[]),
            Err(StorageError::BatchNotFound(_))
        ));
        assert!(matches!(store.get_batch("missing"), Err(StorageError::BatchNotFound(_))));
    }
}
