//! Turns loosely-keyed client JSON into typed records.
//!
//! Clients have sent the same field under several names over time; each field
//! declares its accepted keys in priority order and is resolved exactly once here.

use std::{collections::BTreeMap, str::FromStr};

use rust_decimal::Decimal;
use serde_json::{Map, Value};
use tallybridge_core::{parse_date, DrCr, JournalPosting, LedgerMaster, TransactionRecord};

use crate::error::BridgeError;

const DATE_KEYS: &[&str] = &["transaction_date", "txn_date", "date"];
const TYPE_KEYS: &[&str] = &["transaction_type", "type"];
const DESCRIPTION_KEYS: &[&str] = &["description", "narration"];
const AMOUNT_KEYS: &[&str] = &["amount"];
const LEDGER_KEYS: &[&str] = &["assignedLedger", "assigned_ledger", "ledger"];
const STATUS_KEYS: &[&str] = &["status"];

const LEDGER_NAME_KEYS: &[&str] = &["name", "Name", "LEDGERNAME"];
const LEDGER_PARENT_KEYS: &[&str] = &["parent", "PARENT"];
const LEDGER_BALANCE_KEYS: &[&str] = &["closing_balance", "CLOSINGBALANCE"];

const JOURNAL_NO_KEYS: &[&str] = &["journal_no", "journal_number"];
const JOURNAL_DATE_KEYS: &[&str] = &["date", "transaction_date"];
const JOURNAL_LEDGER_KEYS: &[&str] = &["particulars", "ledger_name", "ledger"];
const JOURNAL_DRCR_KEYS: &[&str] = &["dr_cr", "drcr"];

fn first<'a>(row: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| row.get(*k))
        .find(|v| !v.is_null())
}

fn text(row: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    first(row, keys).and_then(scalar_text)
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(true) => Some("Yes".to_string()),
        Value::Bool(false) => Some("No".to_string()),
        _ => None,
    }
}

/// Accepts JSON numbers and numeric strings with thousands separators.
pub fn parse_amount(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => {
            let raw = n.to_string();
            Decimal::from_str(&raw)
                .or_else(|_| Decimal::from_scientific(&raw))
                .ok()
        }
        Value::String(s) => {
            let cleaned: String = s.trim().chars().filter(|c| *c != ',').collect();
            if cleaned.is_empty() {
                return None;
            }
            Decimal::from_str(&cleaned).ok()
        }
        _ => None,
    }
}

fn as_object(value: &Value) -> Result<&Map<String, Value>, BridgeError> {
    value
        .as_object()
        .ok_or_else(|| BridgeError::Validation("expected a JSON object per row".to_string()))
}

pub fn transaction(value: &Value) -> Result<TransactionRecord, BridgeError> {
    let row = as_object(value)?;
    Ok(TransactionRecord {
        date: text(row, DATE_KEYS).as_deref().and_then(parse_date),
        txn_type: text(row, TYPE_KEYS).filter(|t| !t.trim().is_empty()),
        description: text(row, DESCRIPTION_KEYS).unwrap_or_default(),
        amount: first(row, AMOUNT_KEYS).and_then(parse_amount),
        assigned_ledger: text(row, LEDGER_KEYS).unwrap_or_default().trim().to_string(),
        status: text(row, STATUS_KEYS).unwrap_or_default(),
    })
}

pub fn transactions(values: &[Value]) -> Result<Vec<TransactionRecord>, BridgeError> {
    values.iter().map(transaction).collect()
}

pub fn ledger(value: &Value) -> Result<LedgerMaster, BridgeError> {
    let row = as_object(value)?;
    let name = text(row, LEDGER_NAME_KEYS)
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| BridgeError::Validation("ledger is missing a name".to_string()))?;
    let parent = text(row, LEDGER_PARENT_KEYS)
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .ok_or_else(|| BridgeError::Validation(format!("ledger {} is missing a parent", name)))?;

    let consumed: Vec<&str> = LEDGER_NAME_KEYS
        .iter()
        .chain(LEDGER_PARENT_KEYS)
        .chain(LEDGER_BALANCE_KEYS)
        .copied()
        .collect();
    let fields: BTreeMap<String, String> = row
        .iter()
        .filter(|(k, _)| !consumed.contains(&k.as_str()))
        .filter_map(|(k, v)| scalar_text(v).map(|s| (k.clone(), s)))
        .collect();

    Ok(LedgerMaster {
        name,
        parent,
        closing_balance: first(row, LEDGER_BALANCE_KEYS).and_then(parse_amount),
        fields,
    })
}

pub fn ledgers(values: &[Value]) -> Result<Vec<LedgerMaster>, BridgeError> {
    values.iter().map(ledger).collect()
}

pub fn posting(value: &Value) -> Result<JournalPosting, BridgeError> {
    let row = as_object(value)?;
    let journal_no = text(row, JOURNAL_NO_KEYS)
        .filter(|n| !n.trim().is_empty())
        .ok_or_else(|| BridgeError::Validation("posting is missing journal_no".to_string()))?;
    let ledger_name = text(row, JOURNAL_LEDGER_KEYS)
        .filter(|n| !n.trim().is_empty())
        .ok_or_else(|| BridgeError::Validation(format!("posting in journal {} has no ledger", journal_no)))?;
    let dr_cr = text(row, JOURNAL_DRCR_KEYS)
        .ok_or_else(|| BridgeError::Validation(format!("posting in journal {} has no dr_cr", journal_no)))?
        .parse::<DrCr>()
        .map_err(BridgeError::Validation)?;
    let amount = first(row, AMOUNT_KEYS)
        .and_then(parse_amount)
        .ok_or_else(|| BridgeError::Validation(format!("posting in journal {} has no amount", journal_no)))?;

    Ok(JournalPosting {
        journal_no,
        date: text(row, JOURNAL_DATE_KEYS).as_deref().and_then(parse_date),
        ledger_name,
        dr_cr,
        amount,
        narration: text(row, DESCRIPTION_KEYS).unwrap_or_default(),
        ledger_narration: text(row, &["ledger_narration"]).filter(|n| !n.trim().is_empty()),
    })
}

pub fn postings(values: &[Value]) -> Result<Vec<JournalPosting>, BridgeError> {
    values.iter().map(posting).collect()
}
