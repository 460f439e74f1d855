//! Moves staged data into the engine and engine data back into the store.

use std::sync::Arc;

use serde::Serialize;
use tallybridge_core::{
    company_slug, CompanyDirectory, JournalPosting, LedgerMaster, RecordId, RecordSelection, StagedRecord,
    StagingStore, Store, STATUS_SENT,
};

use crate::{
    codec::{self, ImportSummary, Payload, VoucherKind},
    engine::EngineTransport,
    error::BridgeError,
    serializer::WriteSerializer,
};

const CURRENT_COMPANY_FUNCTION: &str = "$$CurrentCompany";
const LEDGER_COLLECTION_ID: &str = "LedgerList";
const LEDGER_FIELDS: &[&str] = &["LEDGERNAME", "PARENT", "CLOSINGBALANCE"];

#[derive(Debug, Clone)]
pub enum RelayRequest {
    /// Payment/receipt vouchers from a staged batch.
    Batch { upload_id: String, selection: RecordSelection },
    Journals(Vec<JournalPosting>),
    Ledgers(Vec<LedgerMaster>),
}

impl RelayRequest {
    pub fn kind(&self) -> VoucherKind {
        match self {
            RelayRequest::Batch { .. } => VoucherKind::PaymentReceipt,
            RelayRequest::Journals(_) => VoucherKind::Journal,
            RelayRequest::Ledgers(_) => VoucherKind::LedgerMaster,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RelayOutcome {
    pub records_sent: usize,
    pub record_ids: Vec<RecordId>,
    pub engine_response: String,
    pub summary: ImportSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncOutcome {
    pub company_id: String,
    pub display_name: String,
    pub ledgers_total: usize,
    pub ledgers_added: usize,
}

pub struct Relay {
    store: Arc<dyn Store>,
    writer: Arc<WriteSerializer>,
    engine: Arc<dyn EngineTransport>,
}

impl Relay {
    pub fn new(store: Arc<dyn Store>, writer: Arc<WriteSerializer>, engine: Arc<dyn EngineTransport>) -> Self {
        Self { store, writer, engine }
    }

    pub fn relay(&self, company_id: &str, request: RelayRequest) -> Result<RelayOutcome, BridgeError> {
        let kind = request.kind();
        let result = self.relay_inner(company_id, request);
        let outcome = match &result {
            Ok(_) => "sent",
            Err(e) => e.kind(),
        };
        metrics::increment_counter!("relay_requests_total", "kind" => kind.as_str(), "outcome" => outcome);
        result
    }

    fn relay_inner(&self, company_id: &str, request: RelayRequest) -> Result<RelayOutcome, BridgeError> {
        let company = self
            .store
            .resolve(company_id)?
            .ok_or_else(|| BridgeError::NotFound(format!("company {}", company_id)))?;

        match request {
            RelayRequest::Batch { upload_id, selection } => {
                let staged = match &selection {
                    RecordSelection::All => self.store.get_batch(&upload_id)?,
                    RecordSelection::Ids(ids) => self.store.get_records(&upload_id, ids)?,
                };
                let selected = staged.len();
                let ready: Vec<StagedRecord> = staged.into_iter().filter(|r| r.record.is_assigned()).collect();
                if ready.is_empty() {
                    return Err(BridgeError::Validation(
                        "no selected record has an assigned ledger".to_string(),
                    ));
                }
                tracing::info!(
                    %upload_id,
                    company = %company,
                    selected,
                    skipped = selected - ready.len(),
                    "Relaying batch"
                );

                let body = codec::encode(&company, Payload::PaymentReceipts(&ready))?;
                let raw = self.exchange(body)?;

                let ids: Vec<RecordId> = ready.iter().map(|r| r.id).collect();
                let marked_ids = ids.clone();
                let marked = self.writer.submit(move |store| {
                    Ok(store.set_status(&upload_id, &RecordSelection::Ids(marked_ids), STATUS_SENT)?)
                })?;
                tracing::debug!(marked, "Records marked sent");
                Ok(outcome(ids, raw))
            }
            RelayRequest::Journals(postings) => {
                if postings.is_empty() {
                    return Err(BridgeError::Validation("no journal postings to send".to_string()));
                }
                tracing::info!(company = %company, postings = postings.len(), "Relaying journals");
                let body = codec::encode(&company, Payload::Journals(&postings))?;
                let raw = self.exchange(body)?;
                let mut out = outcome(Vec::new(), raw);
                out.records_sent = postings.len();
                Ok(out)
            }
            RelayRequest::Ledgers(ledgers) => {
                if ledgers.is_empty() {
                    return Err(BridgeError::Validation("no ledgers to send".to_string()));
                }
                tracing::info!(company = %company, ledgers = ledgers.len(), "Relaying ledger masters");
                let body = codec::encode(&company, Payload::LedgerMasters(&ledgers))?;
                let raw = self.exchange(body)?;

                let count = ledgers.len();
                let target = company_id.to_string();
                self.writer
                    .submit(move |store| Ok(store.upsert_ledgers(&target, &ledgers)?))?;
                let mut out = outcome(Vec::new(), raw);
                out.records_sent = count;
                Ok(out)
            }
        }
    }

    /// One probe-then-post round trip. Never retried: an import is not idempotent.
    fn exchange(&self, body: Vec<u8>) -> Result<String, BridgeError> {
        if !self.engine.probe() {
            return Err(BridgeError::Transport("engine is not reachable".to_string()));
        }
        let raw = self.engine.post(body)?;
        if codec::is_rejected(&raw) {
            tracing::warn!(response = %raw, "Engine rejected import");
            return Err(BridgeError::EngineRejected(raw));
        }
        Ok(raw)
    }

    /// Read-only export round trip; the caller may retry freely.
    fn export(&self, body: Vec<u8>) -> Result<String, BridgeError> {
        if !self.engine.probe() {
            return Err(BridgeError::Transport("engine is not reachable".to_string()));
        }
        let raw = self.engine.post(body)?;
        Ok(codec::decode(&raw)?)
    }

    /// Display name of the company currently open in the engine. Unlike the
    /// ledger read there is no empty fallback: an unreadable answer is a
    /// `Parse` error, since nothing can be bound to a nameless company.
    pub fn active_company(&self) -> Result<String, BridgeError> {
        let envelope = self.export(codec::export_function(CURRENT_COMPANY_FUNCTION)?)?;
        let name = codec::read_function_result(&envelope)?;
        if name.is_empty() {
            return Err(BridgeError::Parse("engine returned an empty company name".to_string()));
        }
        Ok(name)
    }

    /// Ledger masters of the engine's active company. An export the codec
    /// cannot make sense of reads as no ledgers; transport failures still fail.
    pub fn fetch_ledgers(&self) -> Result<Vec<LedgerMaster>, BridgeError> {
        let body = codec::export_collection(LEDGER_COLLECTION_ID, "Ledger", LEDGER_FIELDS)?;
        let ledgers = self
            .export(body)
            .and_then(|envelope| Ok(codec::read_collection(&envelope, "LEDGER")?));
        match ledgers {
            Err(BridgeError::Parse(reason)) => {
                tracing::warn!(%reason, "Ledger export unreadable, treating as empty");
                Ok(Vec::new())
            }
            other => other,
        }
    }

    /// Copies the engine's ledgers for its active company into the store and
    /// binds that company to `owner`. With `restrict_to` set, only the company
    /// of that name may be synced. An unreadable ledger export still binds
    /// the company and records the sync, with nothing added.
    pub fn sync_ledgers(&self, owner: &str, restrict_to: Option<&str>) -> Result<SyncOutcome, BridgeError> {
        let display_name = self.active_company()?;
        if let Some(allowed) = restrict_to {
            if company_slug(allowed) != company_slug(&display_name) {
                return Err(BridgeError::Forbidden(format!(
                    "trial accounts may only sync the company named {}",
                    allowed
                )));
            }
        }
        let ledgers = self.fetch_ledgers()?;
        let ledgers_total = ledgers.len();

        let owner = owner.to_string();
        let name = display_name.clone();
        let (company_id, ledgers_added) = self.writer.submit(move |store| {
            let company_id = store.get_or_create(&owner, &name)?;
            let added = store.upsert_ledgers(&company_id, &ledgers)?;
            store.record_last_sync(&owner, &company_id)?;
            Ok((company_id, added))
        })?;
        tracing::info!(%company_id, ledgers_total, ledgers_added, "Ledgers synced from engine");

        Ok(SyncOutcome {
            company_id,
            display_name,
            ledgers_total,
            ledgers_added,
        })
    }
}

fn outcome(ids: Vec<RecordId>, raw: String) -> RelayOutcome {
    let summary = codec::decode(&raw)
        .map(|envelope| ImportSummary::read(&envelope))
        .unwrap_or_default();
    RelayOutcome {
        records_sent: ids.len(),
        record_ids: ids,
        engine_response: raw,
        summary,
    }
}
