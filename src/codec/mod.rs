//! XML wire protocol of the accounting engine.
//!
//! `encode` builds import envelopes for the three record shapes the engine
//! accepts; `decode` and the readers turn the engine's noisy responses back
//! into something a strict parser can handle.

mod decode;
mod encode;

pub use decode::{decode, is_rejected, read_collection, read_function_result, ImportSummary};
pub use encode::{encode, export_collection, export_function};

use tallybridge_core::{JournalPosting, LedgerMaster, StagedRecord};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("XML write error: {0}")]
    Xml(String),
    #[error("{0}")]
    Parse(String),
    #[error("journal {journal_no} does not balance (off by {difference})")]
    UnbalancedJournal { journal_no: String, difference: String },
    #[error("record {record} has no {field}")]
    MissingField { record: String, field: &'static str },
}

impl From<quick_xml::Error> for CodecError {
    fn from(e: quick_xml::Error) -> Self {
        CodecError::Xml(e.to_string())
    }
}

/// The three import shapes, borrowed from the caller.
#[derive(Debug, Clone, Copy)]
pub enum Payload<'a> {
    LedgerMasters(&'a [LedgerMaster]),
    Journals(&'a [JournalPosting]),
    PaymentReceipts(&'a [StagedRecord]),
}

/// Label for what a relay sends, used in metrics and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoucherKind {
    LedgerMaster,
    Journal,
    PaymentReceipt,
}

impl VoucherKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoucherKind::LedgerMaster => "ledger_master",
            VoucherKind::Journal => "journal",
            VoucherKind::PaymentReceipt => "payment_receipt",
        }
    }
}
