use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rust_decimal::Decimal;
use tallybridge::codec::{self, Payload};
use tallybridge_core::{parse_date, DrCr, JournalPosting, StagedRecord, TransactionRecord};

fn staged_records(n: usize) -> Vec<StagedRecord> {
    (0..n)
        .map(|i| StagedRecord {
            id: i as i64 + 1,
            upload_id: "bench".to_string(),
            bank_account: "HDFC Current".to_string(),
            record: TransactionRecord {
                date: parse_date("2024-06-01"),
                txn_type: Some(if i % 3 == 0 { "receipt" } else { "payment" }.to_string()),
                description: format!("UPI/{} & co <transfer>", i),
                amount: Some(Decimal::new(150_075 + i as i64, 2)),
                assigned_ledger: "Fuel".to_string(),
                status: String::new(),
            },
        })
        .collect()
}

fn journal_postings(vouchers: usize) -> Vec<JournalPosting> {
    let mut postings = Vec::with_capacity(vouchers * 2);
    for i in 0..vouchers {
        for (ledger, dr_cr) in [("Depreciation", DrCr::Dr), ("Machinery", DrCr::Cr)] {
            postings.push(JournalPosting {
                journal_no: format!("J{}", i),
                date: parse_date("2024-03-31"),
                ledger_name: ledger.to_string(),
                dr_cr,
                amount: Decimal::new(1_000_000 + i as i64, 2),
                narration: "Year end".to_string(),
                ledger_narration: None,
            });
        }
    }
    postings
}

fn ledger_export(n: usize) -> String {
    let mut body = String::from("\u{4}<ENVELOPE><BODY><DATA><COLLECTION>");
    for i in 0..n {
        body.push_str(&format!(
            "<LEDGER NAME=\"Ledger&#32;{}\"><PARENT>Sundry Debtors</PARENT><CLOSINGBALANCE>{}.50</CLOSINGBALANCE>&#4;</LEDGER>",
            i, i
        ));
    }
    body.push_str("</COLLECTION></DATA></BODY></ENVELOPE>");
    body
}

fn bench_encode(c: &mut Criterion) {
    let records = staged_records(500);
    c.bench_function("encode_payment_receipts_500", |b| {
        b.iter(|| codec::encode("Acme Traders", Payload::PaymentReceipts(black_box(&records))).unwrap())
    });

    let postings = journal_postings(250);
    c.bench_function("encode_journals_250", |b| {
        b.iter(|| codec::encode("Acme Traders", Payload::Journals(black_box(&postings))).unwrap())
    });
}

fn bench_decode(c: &mut Criterion) {
    let raw = ledger_export(1000);
    c.bench_function("decode_envelope_1000", |b| b.iter(|| codec::decode(black_box(&raw)).unwrap()));

    let envelope = codec::decode(&raw).unwrap();
    c.bench_function("read_ledger_collection_1000", |b| {
        b.iter(|| codec::read_collection(black_box(&envelope), "LEDGER").unwrap())
    });
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
