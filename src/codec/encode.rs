use quick_xml::{
    events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event},
    Writer,
};
use rust_decimal::Decimal;
use tallybridge_core::{DrCr, JournalPosting, LedgerMaster, StagedRecord};
use time::Date;

use super::{CodecError, Payload};

type XmlResult = Result<(), quick_xml::Error>;

/// Builds the import envelope for `payload`, addressed to the company the
/// engine knows as `company`.
pub fn encode(company: &str, payload: Payload<'_>) -> Result<Vec<u8>, CodecError> {
    match payload {
        Payload::PaymentReceipts(records) => {
            for r in records {
                if r.record.amount.is_none() {
                    return Err(CodecError::MissingField {
                        record: r.id.to_string(),
                        field: "amount",
                    });
                }
            }
            import_envelope(company, "Vouchers", |w| {
                for r in records {
                    message(w, |w| payment_receipt(w, r))?;
                }
                Ok(())
            })
        }
        Payload::Journals(postings) => {
            let groups = group_journals(postings);
            for (journal_no, legs) in &groups {
                let sum: Decimal = legs.iter().map(|p| journal_leg_amount(p)).sum();
                if !sum.is_zero() {
                    return Err(CodecError::UnbalancedJournal {
                        journal_no: journal_no.to_string(),
                        difference: sum.to_string(),
                    });
                }
            }
            import_envelope(company, "Vouchers", |w| {
                for (journal_no, legs) in &groups {
                    message(w, |w| journal(w, journal_no, legs))?;
                }
                Ok(())
            })
        }
        Payload::LedgerMasters(ledgers) => import_envelope(company, "All Masters", |w| {
            for l in ledgers {
                message(w, |w| ledger_master(w, l))?;
            }
            Ok(())
        }),
    }
}

/// Export request evaluating a single engine function such as `$$CurrentCompany`.
pub fn export_function(id: &str) -> Result<Vec<u8>, CodecError> {
    export_envelope("Function", id, "Ledger", &[])
}

/// Export request for a collection of `collection_type` objects with the given fields.
pub fn export_collection(id: &str, collection_type: &str, fields: &[&str]) -> Result<Vec<u8>, CodecError> {
    export_envelope("Collection", id, collection_type, fields)
}

fn export_envelope(request_type: &str, id: &str, collection_type: &str, fields: &[&str]) -> Result<Vec<u8>, CodecError> {
    let mut w = Writer::new_with_indent(Vec::new(), b' ', 2);
    open(&mut w, "ENVELOPE")?;
    open(&mut w, "HEADER")?;
    leaf(&mut w, "VERSION", "1")?;
    leaf(&mut w, "TALLYREQUEST", "Export")?;
    leaf(&mut w, "TYPE", request_type)?;
    leaf(&mut w, "ID", id)?;
    close(&mut w, "HEADER")?;
    open(&mut w, "BODY")?;
    open(&mut w, "DESC")?;
    open(&mut w, "STATICVARIABLES")?;
    leaf(&mut w, "SVEXPORTFORMAT", "$$SysName:XML")?;
    close(&mut w, "STATICVARIABLES")?;
    open(&mut w, "TDL")?;
    open(&mut w, "TDLMESSAGE")?;
    w.write_event(Event::Start(
        BytesStart::new("COLLECTION").with_attributes([("NAME", id), ("ISMODIFY", "No")]),
    ))?;
    leaf(&mut w, "TYPE", collection_type)?;
    if !fields.is_empty() {
        leaf(&mut w, "FETCH", &fields.join(", "))?;
    }
    close(&mut w, "COLLECTION")?;
    close(&mut w, "TDLMESSAGE")?;
    close(&mut w, "TDL")?;
    close(&mut w, "DESC")?;
    close(&mut w, "BODY")?;
    close(&mut w, "ENVELOPE")?;
    Ok(w.into_inner())
}

fn import_envelope<F>(company: &str, report: &str, body: F) -> Result<Vec<u8>, CodecError>
where
    F: FnOnce(&mut Writer<Vec<u8>>) -> XmlResult,
{
    let mut w = Writer::new_with_indent(Vec::new(), b' ', 2);
    w.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    open(&mut w, "ENVELOPE")?;
    open(&mut w, "HEADER")?;
    leaf(&mut w, "TALLYREQUEST", "Import Data")?;
    close(&mut w, "HEADER")?;
    open(&mut w, "BODY")?;
    open(&mut w, "IMPORTDATA")?;
    open(&mut w, "REQUESTDESC")?;
    leaf(&mut w, "REPORTNAME", report)?;
    open(&mut w, "STATICVARIABLES")?;
    leaf(&mut w, "SVCURRENTCOMPANY", company)?;
    close(&mut w, "STATICVARIABLES")?;
    close(&mut w, "REQUESTDESC")?;
    open(&mut w, "REQUESTDATA")?;
    body(&mut w)?;
    close(&mut w, "REQUESTDATA")?;
    close(&mut w, "IMPORTDATA")?;
    close(&mut w, "BODY")?;
    close(&mut w, "ENVELOPE")?;
    Ok(w.into_inner())
}

fn message<F>(w: &mut Writer<Vec<u8>>, inner: F) -> XmlResult
where
    F: FnOnce(&mut Writer<Vec<u8>>) -> XmlResult,
{
    w.write_event(Event::Start(
        BytesStart::new("TALLYMESSAGE").with_attributes([("xmlns:UDF", "TallyUDF")]),
    ))?;
    inner(w)?;
    close(w, "TALLYMESSAGE")
}

fn payment_receipt(w: &mut Writer<Vec<u8>>, staged: &StagedRecord) -> XmlResult {
    let record = &staged.record;
    let is_receipt = record
        .txn_type
        .as_deref()
        .map(|t| t.trim().eq_ignore_ascii_case("receipt"))
        .unwrap_or(false);
    let vch_type = if is_receipt { "Receipt" } else { "Payment" };
    let magnitude = record.amount.unwrap_or_default().abs();

    w.write_event(Event::Start(BytesStart::new("VOUCHER").with_attributes([
        ("VCHTYPE", vch_type),
        ("ACTION", "Create"),
        ("OBJVIEW", "Accounting Voucher View"),
    ])))?;
    if let Some(d) = record.date {
        leaf(w, "DATE", &engine_date(d))?;
    }
    leaf(w, "VOUCHERTYPENAME", vch_type)?;
    leaf(w, "NARRATION", &record.description)?;
    leaf(w, "VOUCHERNUMBER", &staged.id.to_string())?;

    // Money leaves the bank on a payment and enters it on a receipt.
    let bank_negative = !is_receipt;
    ledger_entry(w, &staged.bank_account, magnitude, bank_negative, None)?;
    ledger_entry(w, record.assigned_ledger.trim(), magnitude, !bank_negative, None)?;
    close(w, "VOUCHER")
}

fn journal(w: &mut Writer<Vec<u8>>, journal_no: &str, legs: &[&JournalPosting]) -> XmlResult {
    let head = legs[0];
    w.write_event(Event::Start(
        BytesStart::new("VOUCHER").with_attributes([("VCHTYPE", "Journal"), ("ACTION", "Create")]),
    ))?;
    if let Some(d) = head.date {
        leaf(w, "DATE", &engine_date(d))?;
    }
    leaf(w, "VOUCHERTYPENAME", "Journal")?;
    leaf(w, "VOUCHERNUMBER", journal_no)?;
    leaf(w, "PERSISTEDVIEW", "Accounting Voucher View")?;
    leaf(w, "NARRATION", &head.narration)?;
    for leg in legs {
        ledger_entry(
            w,
            &leg.ledger_name,
            leg.amount.abs(),
            leg.dr_cr == DrCr::Cr,
            leg.ledger_narration.as_deref(),
        )?;
    }
    close(w, "VOUCHER")
}

fn ledger_master(w: &mut Writer<Vec<u8>>, ledger: &LedgerMaster) -> XmlResult {
    w.write_event(Event::Start(
        BytesStart::new("LEDGER").with_attributes([("NAME", ledger.name.as_str()), ("ACTION", "Create")]),
    ))?;
    leaf(w, "NAME", &ledger.name)?;
    leaf(w, "PARENT", &ledger.parent)?;
    leaf(w, "MAILINGNAME", ledger.field("mailing_name").unwrap_or(&ledger.name))?;

    if ledger.field("bill_by_bill") == Some("Yes") {
        leaf(w, "BILLBYBILL", "Yes")?;
    }
    optional_leaf(w, "GSTREGISTRATIONTYPE", ledger.field("registration_type"))?;
    optional_leaf(w, "GSTAPPLICABLE", ledger.field("gst_applicable"))?;
    optional_leaf(w, "GSTTYPEOFSUPPLY", ledger.field("taxability"))?;
    if ledger.field("set_alter_gst_details") == Some("Yes") {
        open(w, "GSTDETAILS.LIST")?;
        optional_leaf(w, "APPLICABLEFROM", ledger.field("applicable_date"))?;
        optional_leaf(w, "TAXABILITY", ledger.field("taxability"))?;
        w.write_event(Event::Empty(BytesStart::new("STATEWISEDETAILS.LIST")))?;
        close(w, "GSTDETAILS.LIST")?;
    }
    optional_leaf(w, "INVENTORYVALUESAREAFFECTED", ledger.field("inventory_affected"))?;
    optional_leaf(w, "CREDITPERIOD", ledger.field("credit_period"))?;
    optional_leaf(w, "ADDRESS", ledger.field("address"))?;
    optional_leaf(w, "STATENAME", ledger.field("state"))?;
    optional_leaf(w, "PINCODE", ledger.field("pincode"))?;
    optional_leaf(w, "INCOMETAXNUMBER", ledger.field("pan_it_no"))?;
    optional_leaf(w, "PARTYGSTIN", ledger.field("gstin_uin"))?;
    close(w, "LEDGER")
}

/// One `ALLLEDGERENTRIES.LIST` leg. The engine wants the deemed-positive flag
/// set on the negative side.
fn ledger_entry(
    w: &mut Writer<Vec<u8>>,
    ledger: &str,
    magnitude: Decimal,
    negative: bool,
    narration: Option<&str>,
) -> XmlResult {
    open(w, "ALLLEDGERENTRIES.LIST")?;
    leaf(w, "LEDGERNAME", ledger)?;
    leaf(w, "ISDEEMEDPOSITIVE", if negative { "Yes" } else { "No" })?;
    leaf(w, "AMOUNT", &format_amount(magnitude, negative))?;
    if let Some(n) = narration {
        leaf(w, "NARRATION", n)?;
    }
    close(w, "ALLLEDGERENTRIES.LIST")
}

fn group_journals(postings: &[JournalPosting]) -> Vec<(&str, Vec<&JournalPosting>)> {
    let mut groups: Vec<(&str, Vec<&JournalPosting>)> = Vec::new();
    for p in postings {
        match groups.iter_mut().find(|(no, _)| *no == p.journal_no) {
            Some((_, legs)) => legs.push(p),
            None => groups.push((p.journal_no.as_str(), vec![p])),
        }
    }
    groups
}

fn journal_leg_amount(p: &JournalPosting) -> Decimal {
    match p.dr_cr {
        DrCr::Dr => p.amount.abs(),
        DrCr::Cr => -p.amount.abs(),
    }
}

fn format_amount(magnitude: Decimal, negative: bool) -> String {
    let rounded = magnitude.round_dp(2);
    if negative && !rounded.is_zero() {
        format!("-{:.2}", rounded)
    } else {
        format!("{:.2}", rounded)
    }
}

fn engine_date(d: Date) -> String {
    format!("{:04}{:02}{:02}", d.year(), d.month() as u8, d.day())
}

fn open(w: &mut Writer<Vec<u8>>, tag: &str) -> XmlResult {
    w.write_event(Event::Start(BytesStart::new(tag)))
}

fn close(w: &mut Writer<Vec<u8>>, tag: &str) -> XmlResult {
    w.write_event(Event::End(BytesEnd::new(tag)))
}

fn leaf(w: &mut Writer<Vec<u8>>, tag: &str, text: &str) -> XmlResult {
    open(w, tag)?;
    w.write_event(Event::Text(BytesText::new(text)))?;
    close(w, tag)
}

fn optional_leaf(w: &mut Writer<Vec<u8>>, tag: &str, text: Option<&str>) -> XmlResult {
    match text {
        Some(t) => leaf(w, tag, t),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;
    use rust_decimal_macros::dec;
    use std::str::FromStr;
    use tallybridge_core::{parse_date, TransactionRecord};

    fn staged(id: i64, txn_type: &str, amount: Decimal) -> StagedRecord {
        StagedRecord {
            id,
            upload_id: "u1".into(),
            bank_account: "HDFC Current".into(),
            record: TransactionRecord {
                date: parse_date("2024-04-01"),
                txn_type: Some(txn_type.into()),
                description: "Diesel & oil".into(),
                amount: Some(amount),
                assigned_ledger: "Fuel".into(),
                status: String::new(),
            },
        }
    }

    fn legs(xml: &str) -> Vec<(String, String, Decimal)> {
        let re = Regex::new(
            r"(?s)<ALLLEDGERENTRIES.LIST>\s*<LEDGERNAME>(.*?)</LEDGERNAME>\s*<ISDEEMEDPOSITIVE>(.*?)</ISDEEMEDPOSITIVE>\s*<AMOUNT>(.*?)</AMOUNT>",
        )
        .unwrap();
        re.captures_iter(xml)
            .map(|c| (c[1].to_string(), c[2].to_string(), Decimal::from_str(&c[3]).unwrap()))
            .collect()
    }

    #[test]
    fn payment_legs_balance_with_bank_negative() {
        let records = [staged(11, "payment", dec!(1500))];
        let xml = String::from_utf8(encode("Acme Traders", Payload::PaymentReceipts(&records)).unwrap()).unwrap();
        let legs = legs(&xml);

        assert_eq!(legs.len(), 2);
        assert_eq!(legs[0], ("HDFC Current".to_string(), "Yes".to_string(), dec!(-1500.00)));
        assert_eq!(legs[1], ("Fuel".to_string(), "No".to_string(), dec!(1500.00)));
        assert!(xml.contains("<SVCURRENTCOMPANY>Acme Traders</SVCURRENTCOMPANY>"));
        assert!(xml.contains("VCHTYPE=\"Payment\""));
        assert!(xml.contains("<DATE>20240401</DATE>"));
        assert!(xml.contains("<VOUCHERNUMBER>11</VOUCHERNUMBER>"));
        assert!(xml.contains("Diesel &amp; oil"));
        assert!(xml.contains("<AMOUNT>-1500.00</AMOUNT>"));
    }

    #[test]
    fn receipt_reverses_the_signs() {
        let records = [staged(3, "Receipt", dec!(-42.5))];
        let xml = String::from_utf8(encode("Acme", Payload::PaymentReceipts(&records)).unwrap()).unwrap();
        let legs = legs(&xml);

        assert_eq!(legs[0].1, "No");
        assert_eq!(legs[0].2, dec!(42.50));
        assert_eq!(legs[1].1, "Yes");
        assert_eq!(legs[1].2, dec!(-42.50));
        assert!(xml.contains("<VOUCHERTYPENAME>Receipt</VOUCHERTYPENAME>"));
    }

    #[test]
    fn every_voucher_leg_pair_sums_to_zero() {
        let records: Vec<StagedRecord> = [dec!(0.01), dec!(99.999), dec!(0), dec!(123456.78)]
            .iter()
            .enumerate()
            .map(|(i, a)| staged(i as i64, if i % 2 == 0 { "payment" } else { "receipt" }, *a))
            .collect();
        let xml = String::from_utf8(encode("Acme", Payload::PaymentReceipts(&records)).unwrap()).unwrap();
        let legs = legs(&xml);
        assert_eq!(legs.len(), 8);
        for pair in legs.chunks(2) {
            assert_eq!(pair[0].2.abs(), pair[1].2.abs());
            assert!((pair[0].2 + pair[1].2).is_zero());
        }
        assert!(!xml.contains("-0.00"));
    }

    #[test]
    fn payment_without_amount_is_refused() {
        let mut record = staged(5, "payment", dec!(1));
        record.record.amount = None;
        assert!(matches!(
            encode("Acme", Payload::PaymentReceipts(&[record])),
            Err(CodecError::MissingField { field: "amount", .. })
        ));
    }

    fn posting(no: &str, ledger: &str, dr_cr: DrCr, amount: Decimal) -> JournalPosting {
        JournalPosting {
            journal_no: no.into(),
            date: parse_date("2024-03-31"),
            ledger_name: ledger.into(),
            dr_cr,
            amount,
            narration: format!("journal {}", no),
            ledger_narration: None,
        }
    }

    #[test]
    fn journals_group_in_first_seen_order() {
        let postings = vec![
            posting("J2", "Rent", DrCr::Dr, dec!(1000)),
            posting("J1", "Salary", DrCr::Dr, dec!(250)),
            posting("J2", "Cash", DrCr::Cr, dec!(1000)),
            posting("J1", "Bank", DrCr::Cr, dec!(250)),
        ];
        let xml = String::from_utf8(encode("Acme", Payload::Journals(&postings)).unwrap()).unwrap();

        let j2 = xml.find("<VOUCHERNUMBER>J2</VOUCHERNUMBER>").unwrap();
        let j1 = xml.find("<VOUCHERNUMBER>J1</VOUCHERNUMBER>").unwrap();
        assert!(j2 < j1);
        assert_eq!(xml.matches("<VOUCHER ").count(), 2);

        let legs = legs(&xml);
        assert_eq!(legs[0], ("Rent".to_string(), "No".to_string(), dec!(1000)));
        assert_eq!(legs[1], ("Cash".to_string(), "Yes".to_string(), dec!(-1000)));
        let total: Decimal = legs.iter().map(|l| l.2).sum();
        assert!(total.is_zero());
        assert!(xml.contains("<PERSISTEDVIEW>Accounting Voucher View</PERSISTEDVIEW>"));
    }

    #[test]
    fn unbalanced_journal_is_rejected() {
        let postings = vec![
            posting("J9", "Rent", DrCr::Dr, dec!(1000)),
            posting("J9", "Cash", DrCr::Cr, dec!(999.99)),
        ];
        match encode("Acme", Payload::Journals(&postings)) {
            Err(CodecError::UnbalancedJournal { journal_no, difference }) => {
                assert_eq!(journal_no, "J9");
                assert_eq!(difference, "0.01");
            }
            other => panic!("expected unbalanced journal, got {:?}", other),
        }
    }

    #[test]
    fn ledger_master_writes_only_present_fields() {
        let mut ledger = LedgerMaster::new("Acme Supplies", "Sundry Creditors");
        ledger.fields.insert("gstin_uin".into(), "27AAAAA0000A1Z5".into());
        ledger.fields.insert("address".into(), "  ".into());
        ledger.fields.insert("set_alter_gst_details".into(), "Yes".into());
        ledger.fields.insert("taxability".into(), "Taxable".into());

        let xml = String::from_utf8(encode("Acme", Payload::LedgerMasters(&[ledger])).unwrap()).unwrap();
        assert!(xml.contains("<REPORTNAME>All Masters</REPORTNAME>"));
        assert!(xml.contains("NAME=\"Acme Supplies\""));
        assert!(xml.contains("<MAILINGNAME>Acme Supplies</MAILINGNAME>"));
        assert!(xml.contains("<PARTYGSTIN>27AAAAA0000A1Z5</PARTYGSTIN>"));
        assert!(xml.contains("<GSTDETAILS.LIST>"));
        assert!(xml.contains("<TAXABILITY>Taxable</TAXABILITY>"));
        assert!(!xml.contains("<ADDRESS>"));
        assert!(!xml.contains("<PINCODE>"));
        assert!(!xml.contains("<BILLBYBILL>"));
    }

    #[test]
    fn export_collection_lists_fields() {
        let xml = String::from_utf8(export_collection("Ledgers", "Ledger", &["LEDGERNAME", "PARENT"]).unwrap()).unwrap();
        assert!(xml.contains("<TALLYREQUEST>Export</TALLYREQUEST>"));
        assert!(xml.contains("<TYPE>Collection</TYPE>"));
        assert!(xml.contains("<FETCH>LEDGERNAME, PARENT</FETCH>"));
        let xml = String::from_utf8(export_function("$$CurrentCompany").unwrap()).unwrap();
        assert!(xml.contains("<ID>$$CurrentCompany</ID>"));
        assert!(!xml.contains("<FETCH>"));
    }
}
