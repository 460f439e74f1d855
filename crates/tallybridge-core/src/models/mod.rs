use std::{collections::BTreeMap, fmt::Display, str::FromStr};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::{Date, Month};

pub mod read;
pub mod write;

pub type UploadId = String;
pub type RecordId = i64;

/// Parent group the engine files bank ledgers under.
pub const BANK_ACCOUNTS_PARENT: &str = "Bank Accounts";

/// One staged bank transaction as the client edits it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TransactionRecord {
    #[serde(rename = "transaction_date", with = "date_format", default)]
    pub date: Option<Date>,
    #[serde(rename = "transaction_type", default)]
    pub txn_type: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(with = "rust_decimal::serde::float_option", default)]
    pub amount: Option<Decimal>,
    #[serde(default)]
    pub assigned_ledger: String,
    #[serde(default)]
    pub status: String,
}

impl TransactionRecord {
    pub fn is_assigned(&self) -> bool {
        !self.assigned_ledger.trim().is_empty()
    }
}

/// A ledger as the engine knows it: mandatory name and parent group plus a
/// flat bag of passthrough attributes (GST fields, address, ...).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LedgerMaster {
    pub name: String,
    pub parent: String,
    #[serde(with = "rust_decimal::serde::float_option", default)]
    pub closing_balance: Option<Decimal>,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl LedgerMaster {
    pub fn new(name: impl Into<String>, parent: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: parent.into(),
            closing_balance: None,
            fields: BTreeMap::new(),
        }
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn is_bank_account(&self) -> bool {
        self.parent == BANK_ACCOUNTS_PARENT
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DrCr {
    Dr,
    Cr,
}

impl FromStr for DrCr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dr" | "debit" => Ok(DrCr::Dr),
            "cr" | "credit" => Ok(DrCr::Cr),
            other => Err(format!("unknown debit/credit flag: {}", other)),
        }
    }
}

impl Display for DrCr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DrCr::Dr => f.write_str("Dr"),
            DrCr::Cr => f.write_str("Cr"),
        }
    }
}

/// One leg of a journal voucher. Postings sharing a `journal_no` form one voucher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalPosting {
    pub journal_no: String,
    #[serde(with = "date_format", default)]
    pub date: Option<Date>,
    pub ledger_name: String,
    pub dr_cr: DrCr,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    #[serde(default)]
    pub narration: String,
    #[serde(default)]
    pub ledger_narration: Option<String>,
}

impl JournalPosting {
    /// Amount with the sign implied by the debit/credit flag.
    pub fn signed_amount(&self) -> Decimal {
        match self.dr_cr {
            DrCr::Dr => self.amount,
            DrCr::Cr => -self.amount,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyBinding {
    pub owner: String,
    pub company_id: String,
    pub display_name: String,
    pub last_sync_time: Option<String>,
}

/// Stable id for a company display name: spaces become underscores, lowercased.
pub fn company_slug(display_name: &str) -> String {
    display_name.trim().replace(' ', "_").to_lowercase()
}

pub fn date_to_str(d: Date) -> String {
    format!("{:04}-{:02}-{:02}", d.year(), d.month() as u8, d.day())
}

/// Parses `YYYY-MM-DD`, an ISO timestamp (date part only) or `DD/MM/YYYY`.
pub fn parse_date(s: &str) -> Option<Date> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if s.contains('/') {
        let parts: Vec<&str> = s.split('/').collect();
        if parts.len() != 3 {
            return None;
        }
        return build_date(parts[2], parts[1], parts[0]);
    }
    let date_part = s.get(..10)?;
    let parts: Vec<&str> = date_part.split('-').collect();
    if parts.len() != 3 {
        return None;
    }
    build_date(parts[0], parts[1], parts[2])
}

fn build_date(year: &str, month: &str, day: &str) -> Option<Date> {
    let year = year.trim().parse::<i32>().ok()?;
    let month = month.trim().parse::<u8>().ok()?;
    let day = day.trim().parse::<u8>().ok()?;
    Date::from_calendar_date(year, Month::try_from(month).ok()?, day).ok()
}

/// Serde adapter writing `Option<Date>` as `"YYYY-MM-DD"` or null.
pub mod date_format {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::Date;

    pub fn serialize<S: Serializer>(value: &Option<Date>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_str(&super::date_to_str(*d)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Date>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        Ok(raw.as_deref().and_then(super::parse_date))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_supported_date_forms() {
        let expected = Date::from_calendar_date(2024, Month::March, 5).unwrap();
        assert_eq!(parse_date("2024-03-05"), Some(expected));
        assert_eq!(parse_date("2024-03-05T10:22:00"), Some(expected));
        assert_eq!(parse_date("05/03/2024"), Some(expected));
        assert_eq!(parse_date("March 5th"), None);
        assert_eq!(parse_date("2024-02-30"), None);
        assert_eq!(parse_date(""), None);
    }

    #[test]
    fn slug_is_lowercase_with_underscores() {
        assert_eq!(company_slug("Acme Traders Pvt Ltd"), "acme_traders_pvt_ltd");
    }

    #[test]
    fn dr_cr_flag_drives_sign() {
        let mut posting = JournalPosting {
            journal_no: "J1".into(),
            date: None,
            ledger_name: "Rent".into(),
            dr_cr: "Dr".parse().unwrap(),
            amount: Decimal::from(250),
            narration: String::new(),
            ledger_narration: None,
        };
        assert_eq!(posting.signed_amount(), Decimal::from(250));
        posting.dr_cr = DrCr::Cr;
        assert_eq!(posting.signed_amount(), Decimal::from(-250));
        assert!("sideways".parse::<DrCr>().is_err());
    }
}
