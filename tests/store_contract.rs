use rust_decimal_macros::dec;
use tallybridge_core::{
    parse_date, CompanyDirectory, LedgerMaster, NewBatch, RecordSelection, StagingStore, StorageError, Store,
    TransactionRecord, BANK_ACCOUNTS_PARENT, STATUS_SENT,
};
use tallybridge_memory::InMemoryStore;
use tallybridge_sqlite::SqliteStore;

const OWNER: &str = "ana@example.com";

fn record(desc: &str, amount: rust_decimal::Decimal, ledger: &str) -> TransactionRecord {
    TransactionRecord {
        date: parse_date("2024-05-02"),
        txn_type: Some("payment".to_string()),
        description: desc.to_string(),
        amount: Some(amount),
        assigned_ledger: ledger.to_string(),
        status: String::new(),
    }
}

fn new_batch(company: &str, source: &str, records: Vec<TransactionRecord>) -> NewBatch {
    NewBatch {
        owner: OWNER.to_string(),
        company: company.to_string(),
        bank_account: "HDFC Current".to_string(),
        source_name: source.to_string(),
        records,
    }
}

fn sqlite() -> SqliteStore {
    SqliteStore::new(":memory:").expect("Failed to open SQLite store")
}

fn check_replace_returns_exactly_new_records(store: &dyn Store) {
    let id = store
        .create_batch(&new_batch(
            "acme_traders",
            "may.xlsx",
            vec![record("Diesel", dec!(1500), ""), record("Rent", dec!(25000), "Rent")],
        ))
        .expect("create");

    let replacement = vec![
        record("Diesel", dec!(1500), "Fuel"),
        record("Rent", dec!(25000), "Rent"),
        record("Tea", dec!(40.5), ""),
    ];
    assert_eq!(store.replace_batch(&id, &replacement).expect("replace"), 3);

    let rows = store.get_batch(&id).expect("get");
    let got: Vec<TransactionRecord> = rows.iter().map(|r| r.record.clone()).collect();
    assert_eq!(got, replacement);
    assert!(rows.iter().all(|r| r.upload_id == id && r.bank_account == "HDFC Current"));
}

fn check_unknown_batch_has_no_side_effect(store: &dyn Store) {
    let id = store
        .create_batch(&new_batch("acme_traders", "a.csv", vec![record("x", dec!(1), "")]))
        .expect("create");
    match store.replace_batch("no-such-batch", &[record("y", dec!(2), "")]) {
        Err(StorageError::BatchNotFound(missing)) => assert_eq!(missing, "no-such-batch"),
        other => panic!("expected BatchNotFound, got {:?}", other),
    }
    assert_eq!(store.get_batch(&id).expect("get").len(), 1);
    assert!(matches!(
        store.set_status("no-such-batch", &RecordSelection::All, STATUS_SENT),
        Err(StorageError::BatchNotFound(_))
    ));
}

fn check_listing_is_most_recent_first(store: &dyn Store) {
    let first = store.create_batch(&new_batch("acme_traders", "april.xlsx", vec![])).expect("first");
    let second = store.create_batch(&new_batch("acme_traders", "may.xlsx", vec![])).expect("second");
    store.create_batch(&new_batch("other_co", "june.xlsx", vec![])).expect("other");

    let listed = store.list_batches(OWNER, "acme_traders").expect("list");
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].upload_id, second);
    assert_eq!(listed[0].source_name, "may.xlsx");
    assert_eq!(listed[1].upload_id, first);
}

fn check_status_selection(store: &dyn Store) {
    let id = store
        .create_batch(&new_batch(
            "acme_traders",
            "a.csv",
            vec![record("a", dec!(1), "Fuel"), record("b", dec!(2), ""), record("c", dec!(3), "Rent")],
        ))
        .expect("create");
    let rows = store.get_batch(&id).expect("get");
    let picked = vec![rows[0].id, rows[2].id];

    let updated = store
        .set_status(&id, &RecordSelection::Ids(picked.clone()), STATUS_SENT)
        .expect("set status");
    assert_eq!(updated, 2);

    let subset = store.get_records(&id, &picked).expect("subset");
    assert_eq!(subset.len(), 2);
    assert!(subset.iter().all(|r| r.record.status == STATUS_SENT));
    let untouched = store.get_records(&id, &[rows[1].id]).expect("untouched");
    assert_eq!(untouched[0].record.status, "");
}

fn check_company_directory_and_ledgers(store: &dyn Store) {
    let company_id = store.get_or_create(OWNER, "Acme Traders").expect("company");
    assert_eq!(company_id, "acme_traders");
    assert_eq!(store.get_or_create(OWNER, "Acme Traders").expect("again"), company_id);
    assert_eq!(store.resolve(&company_id).expect("resolve").as_deref(), Some("Acme Traders"));
    assert_eq!(store.resolve("nobody").expect("resolve missing"), None);

    let ledgers = vec![
        LedgerMaster::new("HDFC Current", BANK_ACCOUNTS_PARENT),
        LedgerMaster::new("Fuel", "Indirect Expenses"),
        LedgerMaster::new("ICICI Savings", BANK_ACCOUNTS_PARENT),
    ];
    assert_eq!(store.upsert_ledgers(&company_id, &ledgers).expect("upsert"), 3);
    assert_eq!(store.upsert_ledgers(&company_id, &ledgers[..1]).expect("upsert again"), 0);

    assert_eq!(
        store.get_ledger_options(&company_id).expect("options"),
        vec!["Fuel", "HDFC Current", "ICICI Savings"]
    );
    assert_eq!(
        store.get_bank_accounts(OWNER, &company_id).expect("banks"),
        vec!["HDFC Current", "ICICI Savings"]
    );
    assert!(store
        .get_bank_accounts("mallory@example.com", &company_id)
        .expect("unbound")
        .is_empty());
    assert!(matches!(
        store.upsert_ledgers("ghost_co", &ledgers),
        Err(StorageError::CompanyNotFound(_))
    ));

    let before = store.list_companies(OWNER).expect("list");
    assert_eq!(before.len(), 1);
    assert!(before[0].last_sync_time.is_none());
    store.record_last_sync(OWNER, &company_id).expect("sync time");
    let after = store.list_companies(OWNER).expect("list");
    assert!(after[0].last_sync_time.is_some());
    assert_eq!(after[0].display_name, "Acme Traders");
}

#[test]
fn test_memory_replace_returns_exactly_new_records() {
    check_replace_returns_exactly_new_records(&InMemoryStore::new());
}

#[test]
fn test_sqlite_replace_returns_exactly_new_records() {
    check_replace_returns_exactly_new_records(&sqlite());
}

#[test]
fn test_memory_unknown_batch_has_no_side_effect() {
    check_unknown_batch_has_no_side_effect(&InMemoryStore::new());
}

#[test]
fn test_sqlite_unknown_batch_has_no_side_effect() {
    check_unknown_batch_has_no_side_effect(&sqlite());
}

#[test]
fn test_memory_listing_is_most_recent_first() {
    check_listing_is_most_recent_first(&InMemoryStore::new());
}

#[test]
fn test_sqlite_listing_is_most_recent_first() {
    check_listing_is_most_recent_first(&sqlite());
}

#[test]
fn test_memory_status_selection() {
    check_status_selection(&InMemoryStore::new());
}

#[test]
fn test_sqlite_status_selection() {
    check_status_selection(&sqlite());
}

#[test]
fn test_memory_company_directory_and_ledgers() {
    check_company_directory_and_ledgers(&InMemoryStore::new());
}

#[test]
fn test_sqlite_company_directory_and_ledgers() {
    check_company_directory_and_ledgers(&sqlite());
}
