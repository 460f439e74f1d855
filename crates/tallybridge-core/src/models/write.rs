use serde::{Deserialize, Serialize};

use super::{RecordId, TransactionRecord};

#[derive(Debug, Clone, PartialEq)]
pub struct NewBatch {
    pub owner: String,
    pub company: String,
    pub bank_account: String,
    pub source_name: String,
    pub records: Vec<TransactionRecord>,
}

/// Which records of a batch an operation touches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordSelection {
    All,
    Ids(Vec<RecordId>),
}

impl RecordSelection {
    /// An empty or missing id list means the whole batch.
    pub fn from_ids(ids: Option<Vec<RecordId>>) -> Self {
        match ids {
            Some(ids) if !ids.is_empty() => RecordSelection::Ids(ids),
            _ => RecordSelection::All,
        }
    }

    pub fn contains(&self, id: RecordId) -> bool {
        match self {
            RecordSelection::All => true,
            RecordSelection::Ids(ids) => ids.contains(&id),
        }
    }
}

pub const STATUS_SENT: &str = "sent";
