use serde::{Deserialize, Serialize};

use super::{RecordId, TransactionRecord, UploadId};

/// A record as persisted: the client-facing fields plus the keys the store assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedRecord {
    pub id: RecordId,
    pub upload_id: UploadId,
    pub bank_account: String,
    #[serde(flatten)]
    pub record: TransactionRecord,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub upload_id: UploadId,
    pub source_name: String,
}
