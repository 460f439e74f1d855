//! JSON frames exchanged with clients over the WebSocket.

use serde::Deserialize;
use serde_json::{json, Map, Value};
use tallybridge_core::RecordId;

/// Every `type` a client may send.
pub const REQUEST_TYPES: &[&str] = &[
    "ping",
    "upload_batch",
    "list_batches",
    "fetch_batch",
    "replace_batch",
    "update_status",
    "ledger_options",
    "bank_accounts",
    "list_companies",
    "refresh_company",
    "sync_ledgers",
    "relay_batch",
    "relay_journals",
    "relay_ledgers",
];

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Ping,
    UploadBatch {
        company_id: String,
        bank_account: String,
        #[serde(default)]
        source_name: String,
        records: Vec<Value>,
    },
    ListBatches {
        company_id: String,
    },
    FetchBatch {
        upload_id: String,
    },
    ReplaceBatch {
        upload_id: String,
        records: Vec<Value>,
    },
    UpdateStatus {
        upload_id: String,
        #[serde(default)]
        record_ids: Option<Vec<RecordId>>,
        status: String,
    },
    LedgerOptions {
        company_id: String,
    },
    BankAccounts {
        company_id: String,
    },
    ListCompanies,
    RefreshCompany {
        #[serde(default)]
        force: bool,
    },
    SyncLedgers,
    RelayBatch {
        company_id: String,
        upload_id: String,
        #[serde(default)]
        record_ids: Option<Vec<RecordId>>,
    },
    RelayJournals {
        company_id: String,
        postings: Vec<Value>,
    },
    RelayLedgers {
        company_id: String,
        ledgers: Vec<Value>,
    },
}

impl Request {
    /// Requests that change staged data or push to the engine.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Request::UploadBatch { .. }
                | Request::ReplaceBatch { .. }
                | Request::UpdateStatus { .. }
                | Request::SyncLedgers
                | Request::RelayBatch { .. }
                | Request::RelayJournals { .. }
                | Request::RelayLedgers { .. }
        )
    }
}

/// A frame that failed before it could be turned into a `Request`.
#[derive(Debug)]
pub struct Rejected {
    pub kind: &'static str,
    pub message: String,
    pub request: Option<String>,
    pub request_id: Option<Value>,
}

/// Parsed envelope fields shared by every request.
#[derive(Debug)]
pub struct Incoming {
    pub msg_type: String,
    pub request_id: Option<Value>,
    pub request: Request,
}

pub fn parse(text: &str) -> Result<Incoming, Rejected> {
    let value: Value = serde_json::from_str(text).map_err(|e| Rejected {
        kind: "invalid_json",
        message: format!("invalid JSON: {}", e),
        request: None,
        request_id: None,
    })?;
    let request_id = value.get("request_id").filter(|v| !v.is_null()).cloned();
    let msg_type = match value.get("type").and_then(Value::as_str) {
        Some(t) => t.to_string(),
        None => {
            return Err(Rejected {
                kind: "validation_error",
                message: "message has no type".to_string(),
                request: None,
                request_id,
            })
        }
    };
    if !REQUEST_TYPES.contains(&msg_type.as_str()) {
        return Err(Rejected {
            kind: "unknown_type",
            message: format!("unknown message type: {}", msg_type),
            request: Some(msg_type),
            request_id,
        });
    }
    match serde_json::from_value::<Request>(value) {
        Ok(request) => Ok(Incoming {
            msg_type,
            request_id,
            request,
        }),
        Err(e) => Err(Rejected {
            kind: "validation_error",
            message: e.to_string(),
            request: Some(msg_type),
            request_id,
        }),
    }
}

/// Serializes a reply of `msg_type` whose fields are those of `body`.
pub fn reply(msg_type: &str, body: Value, request_id: Option<&Value>) -> String {
    let mut frame = match body {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("data".to_string(), other);
            map
        }
    };
    frame.insert("type".to_string(), Value::String(msg_type.to_string()));
    if let Some(id) = request_id {
        frame.insert("request_id".to_string(), id.clone());
    }
    Value::Object(frame).to_string()
}

pub fn error_reply(kind: &str, message: &str, request: Option<&str>, request_id: Option<&Value>) -> String {
    error_reply_with_details(kind, message, None, request, request_id)
}

/// Error frame that also carries `details`, the engine's own text when it
/// refused an import.
pub fn error_reply_with_details(
    kind: &str,
    message: &str,
    details: Option<&str>,
    request: Option<&str>,
    request_id: Option<&Value>,
) -> String {
    let mut body = json!({
        "kind": kind,
        "error": message,
        "request": request,
    });
    if let (Some(details), Value::Object(map)) = (details, &mut body) {
        map.insert("details".to_string(), Value::String(details.to_string()));
    }
    reply("error", body, request_id)
}

pub fn connection_ack(user: &str, session_id: &str) -> String {
    reply(
        "connection",
        json!({"status": "connected", "user": user, "session_id": session_id}),
        None,
    )
}

pub fn heartbeat(timestamp: i64) -> String {
    reply("heartbeat", json!({ "timestamp": timestamp }), None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_is_echoed_on_rejection() {
        let rejected = parse(r#"{"type":"bogus","request_id":42}"#).unwrap_err();
        assert_eq!(rejected.kind, "unknown_type");
        assert_eq!(rejected.request.as_deref(), Some("bogus"));
        assert_eq!(rejected.request_id, Some(json!(42)));
    }

    #[test]
    fn missing_field_is_a_validation_error() {
        let rejected = parse(r#"{"type":"fetch_batch"}"#).unwrap_err();
        assert_eq!(rejected.kind, "validation_error");
        assert_eq!(parse("{not json").unwrap_err().kind, "invalid_json");
    }

    #[test]
    fn parses_relay_batch_with_optional_ids() {
        let incoming = parse(r#"{"type":"relay_batch","company_id":"acme","upload_id":"u1"}"#).unwrap();
        match incoming.request {
            Request::RelayBatch { record_ids, .. } => assert!(record_ids.is_none()),
            other => panic!("unexpected {:?}", other),
        }
        assert!(parse(r#"{"type":"ping"}"#).unwrap().request_id.is_none());
    }

    #[test]
    fn reply_merges_type_and_request_id() {
        let frame: Value = serde_json::from_str(&reply("pong", Value::Null, Some(&json!("r-1")))).unwrap();
        assert_eq!(frame, json!({"type": "pong", "request_id": "r-1"}));
    }
}
