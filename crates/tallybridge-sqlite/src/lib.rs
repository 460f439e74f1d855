//! SQLite staging backend. One connection behind a mutex; every mutating call
//! runs in its own SQL transaction.

use std::{collections::BTreeMap, str::FromStr, sync::Mutex};

use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use tallybridge_core::{
    company_slug, date_to_str, parse_date,
    storage::format_timestamp,
    BatchSummary, CompanyBinding, CompanyDirectory, LedgerMaster, NewBatch, RecordId, RecordSelection,
    StagedRecord, StagingStore, StorageError, TransactionRecord, UploadId, BANK_ACCOUNTS_PARENT,
};
use time::OffsetDateTime;
use uuid::Uuid;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn db_err(e: rusqlite::Error) -> StorageError {
    StorageError::Other(e.to_string())
}

impl SqliteStore {
    pub fn new(path: &str) -> Result<Self, StorageError> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(path)
        }
        .map_err(db_err)?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=30000;")
            .map_err(db_err)?;

        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema()?;
        tracing::info!(path, "SQLite staging store opened");
        Ok(storage)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS batches (
                upload_id TEXT PRIMARY KEY,
                sequence INTEGER NOT NULL,
                owner TEXT NOT NULL,
                company TEXT NOT NULL,
                bank_account TEXT NOT NULL,
                source_name TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                upload_id TEXT NOT NULL,
                transaction_date TEXT,
                transaction_type TEXT,
                description TEXT NOT NULL,
                amount TEXT,
                assigned_ledger TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT '',
                FOREIGN KEY (upload_id) REFERENCES batches(upload_id)
            );

            CREATE INDEX IF NOT EXISTS idx_records_upload
                ON records(upload_id);

            CREATE INDEX IF NOT EXISTS idx_batches_owner_company
                ON batches(owner, company, sequence);

            CREATE TABLE IF NOT EXISTS companies (
                company_id TEXT PRIMARY KEY,
                company_name TEXT NOT NULL,
                created_by TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS user_companies (
                user_email TEXT NOT NULL,
                company_id TEXT NOT NULL,
                last_sync_time TEXT,
                PRIMARY KEY (user_email, company_id),
                FOREIGN KEY (company_id) REFERENCES companies(company_id)
            );

            CREATE TABLE IF NOT EXISTS ledgers (
                ledger_id INTEGER PRIMARY KEY AUTOINCREMENT,
                company_id TEXT NOT NULL,
                name TEXT NOT NULL,
                parent TEXT NOT NULL,
                closing_balance TEXT,
                extra_data TEXT NOT NULL DEFAULT '{}',
                UNIQUE (company_id, name),
                FOREIGN KEY (company_id) REFERENCES companies(company_id)
            );

            CREATE TABLE IF NOT EXISTS sequence_counter (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                value INTEGER NOT NULL
            );

            INSERT OR IGNORE INTO sequence_counter (id, value) VALUES (1, 0);
            ",
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn next_sequence(conn: &Connection) -> Result<u64, StorageError> {
        conn.execute("UPDATE sequence_counter SET value = value + 1 WHERE id = 1", [])
            .map_err(db_err)?;
        let seq: u64 = conn
            .query_row("SELECT value FROM sequence_counter WHERE id = 1", [], |r| r.get(0))
            .map_err(db_err)?;
        Ok(seq)
    }

    fn batch_exists(conn: &Connection, upload_id: &str) -> Result<bool, StorageError> {
        conn.query_row(
            "SELECT COUNT(*) > 0 FROM batches WHERE upload_id = ?1",
            params![upload_id],
            |row| row.get(0),
        )
        .map_err(db_err)
    }

    fn insert_records(conn: &Connection, upload_id: &str, records: &[TransactionRecord]) -> Result<(), StorageError> {
        let mut stmt = conn
            .prepare(
                "INSERT INTO records (upload_id, transaction_date, transaction_type, description, amount, assigned_ledger, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )
            .map_err(db_err)?;
        for r in records {
            stmt.execute(params![
                upload_id,
                r.date.map(date_to_str),
                r.txn_type,
                r.description,
                r.amount.map(|a| a.normalize().to_string()),
                r.assigned_ledger,
                r.status,
            ])
            .map_err(db_err)?;
        }
        Ok(())
    }

    fn query_records(conn: &Connection, sql: &str, upload_id: &str) -> Result<Vec<StagedRecord>, StorageError> {
        let mut stmt = conn.prepare(sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params![upload_id], |row| {
                Ok((
                    row.get::<_, RecordId>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })
            .map_err(db_err)?;

        let mut result = Vec::new();
        for row in rows {
            let (id, bank_account, date, txn_type, description, amount, assigned_ledger, status) =
                row.map_err(db_err)?;
            result.push(StagedRecord {
                id,
                upload_id: upload_id.to_string(),
                bank_account,
                record: TransactionRecord {
                    date: date.as_deref().and_then(parse_date),
                    txn_type,
                    description,
                    amount: amount.and_then(|a| Decimal::from_str(&a).ok()),
                    assigned_ledger,
                    status,
                },
            });
        }
        Ok(result)
    }
}

const RECORD_COLUMNS: &str = "SELECT r.id, b.bank_account, r.transaction_date, r.transaction_type, r.description,
            r.amount, r.assigned_ledger, r.status
     FROM records r JOIN batches b ON b.upload_id = r.upload_id
     WHERE r.upload_id = ?1";

impl StagingStore for SqliteStore {
    fn create_batch(&self, batch: &NewBatch) -> Result<UploadId, StorageError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(db_err)?;
        let upload_id = Uuid::new_v4().to_string();
        let seq = Self::next_sequence(&tx)?;
        tx.execute(
            "INSERT INTO batches (upload_id, sequence, owner, company, bank_account, source_name, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                upload_id,
                seq,
                batch.owner,
                batch.company,
                batch.bank_account,
                batch.source_name,
                OffsetDateTime::now_utc().to_string()
            ],
        )
        .map_err(db_err)?;
        Self::insert_records(&tx, &upload_id, &batch.records)?;
        tx.commit().map_err(db_err)?;
        tracing::debug!(%upload_id, records = batch.records.len(), "Batch created");
        Ok(upload_id)
    }

    fn replace_batch(&self, upload_id: &str, records: &[TransactionRecord]) -> Result<usize, StorageError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(db_err)?;
        if !Self::batch_exists(&tx, upload_id)? {
            return Err(StorageError::BatchNotFound(upload_id.to_string()));
        }
        let removed = tx
            .execute("DELETE FROM records WHERE upload_id = ?1", params![upload_id])
            .map_err(db_err)?;
        Self::insert_records(&tx, upload_id, records)?;
        tx.commit().map_err(db_err)?;
        tracing::debug!(upload_id, removed, inserted = records.len(), "Batch replaced");
        Ok(records.len())
    }

    fn list_batches(&self, owner: &str, company: &str) -> Result<Vec<BatchSummary>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT upload_id, source_name FROM batches
                 WHERE owner = ?1 AND company = ?2
                 ORDER BY sequence DESC",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![owner, company], |row| {
                Ok(BatchSummary {
                    upload_id: row.get(0)?,
                    source_name: row.get(1)?,
                })
            })
            .map_err(db_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
    }

    fn get_batch(&self, upload_id: &str) -> Result<Vec<StagedRecord>, StorageError> {
        let conn = self.conn.lock().unwrap();
        if !Self::batch_exists(&conn, upload_id)? {
            return Err(StorageError::BatchNotFound(upload_id.to_string()));
        }
        Self::query_records(&conn, &format!("{} ORDER BY r.id", RECORD_COLUMNS), upload_id)
    }

    fn get_records(&self, upload_id: &str, ids: &[RecordId]) -> Result<Vec<StagedRecord>, StorageError> {
        let all = self.get_batch(upload_id)?;
        Ok(all.into_iter().filter(|r| ids.contains(&r.id)).collect())
    }

    fn set_status(&self, upload_id: &str, selection: &RecordSelection, status: &str) -> Result<usize, StorageError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(db_err)?;
        if !Self::batch_exists(&tx, upload_id)? {
            return Err(StorageError::BatchNotFound(upload_id.to_string()));
        }
        let updated = match selection {
            RecordSelection::All => tx
                .execute(
                    "UPDATE records SET status = ?1 WHERE upload_id = ?2",
                    params![status, upload_id],
                )
                .map_err(db_err)?,
            RecordSelection::Ids(ids) => {
                let mut stmt = tx
                    .prepare("UPDATE records SET status = ?1 WHERE upload_id = ?2 AND id = ?3")
                    .map_err(db_err)?;
                let mut n = 0;
                for id in ids {
                    n += stmt.execute(params![status, upload_id, id]).map_err(db_err)?;
                }
                n
            }
        };
        tx.commit().map_err(db_err)?;
        tracing::debug!(upload_id, updated, status, "Record status updated");
        Ok(updated)
    }

    fn get_ledger_options(&self, company_id: &str) -> Result<Vec<String>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT name FROM ledgers WHERE company_id = ?1 ORDER BY name")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![company_id], |row| row.get::<_, String>(0))
            .map_err(db_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
    }

    fn get_bank_accounts(&self, owner: &str, company_id: &str) -> Result<Vec<String>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let bound: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM user_companies WHERE user_email = ?1 AND company_id = ?2",
                params![owner, company_id],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        if !bound {
            tracing::warn!(owner, company_id, "Owner has no access to company");
            return Ok(Vec::new());
        }
        let mut stmt = conn
            .prepare(
                "SELECT DISTINCT name FROM ledgers
                 WHERE company_id = ?1 AND parent = ?2
                 ORDER BY name",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![company_id, BANK_ACCOUNTS_PARENT], |row| row.get::<_, String>(0))
            .map_err(db_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
    }

    fn upsert_ledgers(&self, company_id: &str, ledgers: &[LedgerMaster]) -> Result<usize, StorageError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(db_err)?;
        let known: bool = tx
            .query_row(
                "SELECT COUNT(*) > 0 FROM companies WHERE company_id = ?1",
                params![company_id],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        if !known {
            return Err(StorageError::CompanyNotFound(company_id.to_string()));
        }
        let mut inserted = 0;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT OR IGNORE INTO ledgers (company_id, name, parent, closing_balance, extra_data)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )
                .map_err(db_err)?;
            for ledger in ledgers {
                let extra = serde_json::to_string(&ledger.fields)
                    .map_err(|e| StorageError::Other(e.to_string()))?;
                inserted += stmt
                    .execute(params![
                        company_id,
                        ledger.name,
                        ledger.parent,
                        ledger.closing_balance.map(|b| b.to_string()),
                        extra
                    ])
                    .map_err(db_err)?;
            }
        }
        tx.commit().map_err(db_err)?;
        tracing::info!(company_id, inserted, total = ledgers.len(), "Ledgers stored");
        Ok(inserted)
    }
}

impl CompanyDirectory for SqliteStore {
    fn get_or_create(&self, owner: &str, display_name: &str) -> Result<String, StorageError> {
        let company_id = company_slug(display_name);
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(db_err)?;
        let created = tx
            .execute(
                "INSERT OR IGNORE INTO companies (company_id, company_name, created_by, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![company_id, display_name, owner, OffsetDateTime::now_utc().to_string()],
            )
            .map_err(db_err)?;
        tx.execute(
            "INSERT OR IGNORE INTO user_companies (user_email, company_id) VALUES (?1, ?2)",
            params![owner, company_id],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        if created > 0 {
            tracing::info!(owner, %company_id, display_name, "Company created");
        }
        Ok(company_id)
    }

    fn resolve(&self, company_id: &str) -> Result<Option<String>, StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT company_name FROM companies WHERE company_id = ?1",
            params![company_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)
    }

    fn record_last_sync(&self, owner: &str, company_id: &str) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        let updated = conn
            .execute(
                "UPDATE user_companies SET last_sync_time = ?1 WHERE user_email = ?2 AND company_id = ?3",
                params![format_timestamp(OffsetDateTime::now_utc()), owner, company_id],
            )
            .map_err(db_err)?;
        if updated == 0 {
            return Err(StorageError::CompanyNotFound(company_id.to_string()));
        }
        tracing::info!(owner, company_id, "Recorded last sync time");
        Ok(())
    }

    fn list_companies(&self, owner: &str) -> Result<Vec<CompanyBinding>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT c.company_id, c.company_name, uc.last_sync_time
                 FROM companies c JOIN user_companies uc ON uc.company_id = c.company_id
                 WHERE uc.user_email = ?1
                 ORDER BY c.company_id",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![owner], |row| {
                Ok(CompanyBinding {
                    owner: owner.to_string(),
                    company_id: row.get(0)?,
                    display_name: row.get(1)?,
                    last_sync_time: row.get(2)?,
                })
            })
            .map_err(db_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
    }
}

/// Reads back the passthrough fields stored for one ledger.
pub fn ledger_fields(store: &SqliteStore, company_id: &str, name: &str) -> Result<BTreeMap<String, String>, StorageError> {
    let conn = store.conn.lock().unwrap();
    let raw: Option<String> = conn
        .query_row(
            "SELECT extra_data FROM ledgers WHERE company_id = ?1 AND name = ?2",
            params![company_id, name],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)?;
    match raw {
        Some(json) => serde_json::from_str(&json).map_err(|e| StorageError::Other(e.to_string())),
        None => Ok(BTreeMap::new()),
    }
}
