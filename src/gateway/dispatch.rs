use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use serde_json::{json, Value};
use tallybridge_core::{
    storage::format_timestamp, CompanyDirectory, NewBatch, RecordSelection, StagingStore, Store,
};
use time::OffsetDateTime;

use crate::{
    auth::CallerIdentity,
    error::BridgeError,
    ingest,
    relay::{Relay, RelayRequest},
    serializer::WriteSerializer,
};

use super::protocol::{self, Incoming, Request};

/// Company the engine last reported as open, as seen by one session.
#[derive(Debug, Clone)]
pub struct ActiveCompany {
    pub value: String,
    pub observed_at: OffsetDateTime,
    fetched: Instant,
}

/// Per-connection state carried between messages.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub identity: CallerIdentity,
    pub active_company: Option<ActiveCompany>,
}

impl SessionContext {
    pub fn new(identity: CallerIdentity) -> Self {
        Self {
            identity,
            active_company: None,
        }
    }
}

/// Routes one client frame to the store, the serializer or the relay and
/// renders the reply. Blocking; sessions call it through `spawn_blocking`.
pub struct Dispatcher {
    store: Arc<dyn Store>,
    writer: Arc<WriteSerializer>,
    relay: Arc<Relay>,
    company_ttl: Duration,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn Store>, writer: Arc<WriteSerializer>, relay: Arc<Relay>, company_ttl: Duration) -> Self {
        Self {
            store,
            writer,
            relay,
            company_ttl,
        }
    }

    pub fn handle_text(&self, ctx: &mut SessionContext, text: &str) -> String {
        let incoming = match protocol::parse(text) {
            Ok(incoming) => incoming,
            Err(rejected) => {
                metrics::increment_counter!("gateway_errors_total", "kind" => rejected.kind);
                tracing::debug!(kind = rejected.kind, error = %rejected.message, "Rejected client frame");
                return protocol::error_reply(
                    rejected.kind,
                    &rejected.message,
                    rejected.request.as_deref(),
                    rejected.request_id.as_ref(),
                );
            }
        };
        metrics::increment_counter!("gateway_messages_total", "type" => incoming.msg_type.clone());

        let Incoming {
            msg_type,
            request_id,
            request,
        } = incoming;
        match self.handle(ctx, request) {
            Ok((reply_type, body)) => protocol::reply(reply_type, body, request_id.as_ref()),
            Err(e) => {
                metrics::increment_counter!("gateway_errors_total", "kind" => e.kind());
                tracing::warn!(
                    user = %ctx.identity.name,
                    request = %msg_type,
                    kind = e.kind(),
                    error = %e,
                    "Request failed"
                );
                protocol::error_reply_with_details(
                    e.kind(),
                    &e.to_string(),
                    e.details(),
                    Some(&msg_type),
                    request_id.as_ref(),
                )
            }
        }
    }

    fn handle(&self, ctx: &mut SessionContext, request: Request) -> Result<(&'static str, Value), BridgeError> {
        if request.is_mutation() && !ctx.identity.can_write() {
            return Err(BridgeError::Forbidden(format!(
                "role {} is read-only",
                ctx.identity.role
            )));
        }
        let owner = ctx.identity.name.clone();

        match request {
            Request::Ping => Ok(("pong", Value::Null)),
            Request::UploadBatch {
                company_id,
                bank_account,
                source_name,
                records,
            } => {
                let records = ingest::transactions(&records)?;
                let count = records.len();
                let batch = NewBatch {
                    owner,
                    company: company_id.clone(),
                    bank_account,
                    source_name,
                    records,
                };
                let upload_id = self.writer.submit(move |store| Ok(store.create_batch(&batch)?))?;
                Ok((
                    "batch_uploaded",
                    json!({"upload_id": upload_id, "company_id": company_id, "records": count}),
                ))
            }
            Request::ListBatches { company_id } => {
                let batches = self.store.list_batches(&owner, &company_id)?;
                Ok(("batches", json!({"company_id": company_id, "batches": batches})))
            }
            Request::FetchBatch { upload_id } => {
                let records = self.store.get_batch(&upload_id)?;
                Ok(("batch", json!({"upload_id": upload_id, "records": records})))
            }
            Request::ReplaceBatch { upload_id, records } => {
                let records = ingest::transactions(&records)?;
                let target = upload_id.clone();
                let count = self
                    .writer
                    .submit(move |store| Ok(store.replace_batch(&target, &records)?))?;
                Ok(("batch_replaced", json!({"upload_id": upload_id, "records": count})))
            }
            Request::UpdateStatus {
                upload_id,
                record_ids,
                status,
            } => {
                let selection = RecordSelection::from_ids(record_ids);
                let target = upload_id.clone();
                let updated = self
                    .writer
                    .submit(move |store| Ok(store.set_status(&target, &selection, &status)?))?;
                Ok(("status_updated", json!({"upload_id": upload_id, "updated": updated})))
            }
            Request::LedgerOptions { company_id } => {
                let ledgers = self.store.get_ledger_options(&company_id)?;
                Ok(("ledger_options", json!({"company_id": company_id, "ledgers": ledgers})))
            }
            Request::BankAccounts { company_id } => {
                let accounts = self.store.get_bank_accounts(&owner, &company_id)?;
                Ok(("bank_accounts", json!({"company_id": company_id, "accounts": accounts})))
            }
            Request::ListCompanies => {
                let companies = self.store.list_companies(&owner)?;
                Ok(("companies", json!({ "companies": companies })))
            }
            Request::RefreshCompany { force } => {
                let (company, cached) = self.refresh_company(ctx, force)?;
                Ok((
                    "active_company",
                    json!({
                        "company": company.value,
                        "observed_at": format_timestamp(company.observed_at),
                        "cached": cached,
                    }),
                ))
            }
            Request::SyncLedgers => {
                let restrict_to = ctx.identity.is_trial().then_some(owner.as_str());
                let outcome = self.relay.sync_ledgers(&owner, restrict_to)?;
                ctx.active_company = Some(ActiveCompany {
                    value: outcome.display_name.clone(),
                    observed_at: OffsetDateTime::now_utc(),
                    fetched: Instant::now(),
                });
                Ok(("ledgers_synced", serde_json::to_value(outcome).map_err(json_err)?))
            }
            Request::RelayBatch {
                company_id,
                upload_id,
                record_ids,
            } => {
                let request = RelayRequest::Batch {
                    upload_id: upload_id.clone(),
                    selection: RecordSelection::from_ids(record_ids),
                };
                let outcome = self.relay.relay(&company_id, request)?;
                Ok((
                    "relay_result",
                    json!({"company_id": company_id, "upload_id": upload_id, "outcome": outcome}),
                ))
            }
            Request::RelayJournals { company_id, postings } => {
                let postings = ingest::postings(&postings)?;
                let outcome = self.relay.relay(&company_id, RelayRequest::Journals(postings))?;
                Ok(("relay_result", json!({"company_id": company_id, "outcome": outcome})))
            }
            Request::RelayLedgers { company_id, ledgers } => {
                let ledgers = ingest::ledgers(&ledgers)?;
                let outcome = self.relay.relay(&company_id, RelayRequest::Ledgers(ledgers))?;
                Ok(("relay_result", json!({"company_id": company_id, "outcome": outcome})))
            }
        }
    }

    /// Returns the session's cached active company while it is fresh, asking
    /// the engine otherwise. A failed lookup leaves the old value in place.
    fn refresh_company(&self, ctx: &mut SessionContext, force: bool) -> Result<(ActiveCompany, bool), BridgeError> {
        if !force {
            if let Some(current) = &ctx.active_company {
                if current.fetched.elapsed() < self.company_ttl {
                    return Ok((current.clone(), true));
                }
            }
        }
        let value = self.relay.active_company()?;
        tracing::info!(user = %ctx.identity.name, company = %value, "Active company refreshed");
        let company = ActiveCompany {
            value,
            observed_at: OffsetDateTime::now_utc(),
            fetched: Instant::now(),
        };
        ctx.active_company = Some(company.clone());
        Ok((company, false))
    }
}

fn json_err(e: serde_json::Error) -> BridgeError {
    BridgeError::Parse(e.to_string())
}
