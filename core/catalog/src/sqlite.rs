//! SQLite-backed catalog.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use skyshard_common::{
    AccountId, Error, FileRecord, JobId, QuotaSnapshot, Result, TransferJob,
};

use crate::catalog::{check_owner, Catalog};
use crate::model::{Account, FileQuery};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS accounts (
        id TEXT PRIMARY KEY,
        email TEXT NOT NULL,
        display_name TEXT NOT NULL,
        provider TEXT NOT NULL,
        settings TEXT NOT NULL,
        bytes_total INTEGER NOT NULL,
        bytes_used INTEGER NOT NULL,
        quota_taken_at TEXT NOT NULL,
        credential TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS file_records (
        account_id TEXT NOT NULL,
        remote_id TEXT NOT NULL,
        name TEXT NOT NULL,
        size INTEGER NOT NULL,
        content_type TEXT NOT NULL,
        parent_id TEXT,
        modified TEXT NOT NULL,
        PRIMARY KEY (account_id, remote_id)
    );

    CREATE TABLE IF NOT EXISTS transfer_jobs (
        id TEXT PRIMARY KEY,
        account_id TEXT NOT NULL,
        state TEXT NOT NULL,
        body TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_file_records_name ON file_records(account_id, name);
"#;

fn db(err: rusqlite::Error) -> Error {
    Error::Persistence(err.to_string())
}

/// SQLite integers are signed; sizes above `i64::MAX` saturate.
fn to_sql_size(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_sql_size(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn parse_time(column: usize, value: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_json<T: serde::de::DeserializeOwned>(column: usize, value: String) -> rusqlite::Result<T> {
    serde_json::from_str(&value).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_account_id(column: usize, value: String) -> rusqlite::Result<AccountId> {
    AccountId::new(value).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        id: parse_account_id(0, row.get(0)?)?,
        email: row.get(1)?,
        display_name: row.get(2)?,
        provider: row.get(3)?,
        settings: parse_json(4, row.get(4)?)?,
        quota: QuotaSnapshot {
            bytes_total: from_sql_size(row.get(5)?),
            bytes_used: from_sql_size(row.get(6)?),
            taken_at: parse_time(7, row.get(7)?)?,
        },
        credential: parse_json(8, row.get(8)?)?,
        created_at: parse_time(9, row.get(9)?)?,
    })
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<FileRecord> {
    Ok(FileRecord {
        account_id: parse_account_id(0, row.get(0)?)?,
        remote_id: row.get(1)?,
        name: row.get(2)?,
        size: from_sql_size(row.get(3)?),
        content_type: row.get(4)?,
        parent_id: row.get(5)?,
        modified: parse_time(6, row.get(6)?)?,
    })
}

fn insert_record(conn: &Connection, record: &FileRecord) -> rusqlite::Result<usize> {
    conn.execute(
        r#"
        INSERT OR REPLACE INTO file_records
        (account_id, remote_id, name, size, content_type, parent_id, modified)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
        params![
            record.account_id.as_str(),
            record.remote_id,
            record.name,
            to_sql_size(record.size),
            record.content_type,
            record.parent_id,
            record.modified.to_rfc3339(),
        ],
    )
}

/// Catalog persisted in a SQLite database file.
pub struct SqliteCatalog {
    conn: Mutex<Connection>,
}

impl SqliteCatalog {
    /// Create or open a catalog database.
    ///
    /// # Errors
    /// - Database creation or migration failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path).map_err(db)?;
        conn.execute_batch(SCHEMA).map_err(db)?;

        info!("Catalog opened at {}", db_path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory catalog (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db)?;
        conn.execute_batch(SCHEMA).map_err(db)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Persistence("Catalog lock poisoned".to_string()))
    }

    fn put_job(&self, job: &TransferJob, must_exist: bool) -> Result<()> {
        let body = serde_json::to_string(job)?;
        let conn = self.conn()?;
        let sql = if must_exist {
            "UPDATE transfer_jobs SET account_id = ?2, state = ?3, body = ?4, created_at = ?5 WHERE id = ?1"
        } else {
            "INSERT OR REPLACE INTO transfer_jobs (id, account_id, state, body, created_at) VALUES (?1, ?2, ?3, ?4, ?5)"
        };
        let changed = conn
            .execute(
                sql,
                params![
                    job.id.as_str(),
                    job.account_id.as_str(),
                    job.state.as_str(),
                    body,
                    job.created_at.to_rfc3339(),
                ],
            )
            .map_err(db)?;
        if must_exist && changed == 0 {
            return Err(Error::NotFound(format!("Transfer job {}", job.id)));
        }
        debug!("Saved job {} ({})", job.id, job.state);
        Ok(())
    }
}

impl Catalog for SqliteCatalog {
    fn save_account(&self, account: &Account) -> Result<()> {
        let settings = serde_json::to_string(&account.settings)?;
        let credential = serde_json::to_string(&account.credential)?;
        self.conn()?
            .execute(
                r#"
                INSERT OR REPLACE INTO accounts
                (id, email, display_name, provider, settings, bytes_total, bytes_used,
                 quota_taken_at, credential, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
                params![
                    account.id.as_str(),
                    account.email,
                    account.display_name,
                    account.provider,
                    settings,
                    to_sql_size(account.quota.bytes_total),
                    to_sql_size(account.quota.bytes_used),
                    account.quota.taken_at.to_rfc3339(),
                    credential,
                    account.created_at.to_rfc3339(),
                ],
            )
            .map_err(db)?;
        debug!("Saved account {}", account.id);
        Ok(())
    }

    fn get_account(&self, id: &AccountId) -> Result<Option<Account>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT id, email, display_name, provider, settings, bytes_total, bytes_used,
                       quota_taken_at, credential, created_at
                FROM accounts WHERE id = ?1
                "#,
            )
            .map_err(db)?;
        stmt.query_row([id.as_str()], account_from_row)
            .optional()
            .map_err(db)
    }

    fn list_accounts(&self) -> Result<Vec<Account>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT id, email, display_name, provider, settings, bytes_total, bytes_used,
                       quota_taken_at, credential, created_at
                FROM accounts ORDER BY created_at, id
                "#,
            )
            .map_err(db)?;
        let rows = stmt.query_map([], account_from_row).map_err(db)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db)
    }

    fn delete_account(&self, id: &AccountId) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db)?;
        tx.execute("DELETE FROM file_records WHERE account_id = ?1", [id.as_str()])
            .map_err(db)?;
        let removed = tx
            .execute("DELETE FROM accounts WHERE id = ?1", [id.as_str()])
            .map_err(db)?;
        tx.commit().map_err(db)?;
        Ok(removed > 0)
    }

    fn save_file_records(&self, account_id: &AccountId, records: &[FileRecord]) -> Result<()> {
        check_owner(account_id, records)?;
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db)?;
        for record in records {
            insert_record(&tx, record).map_err(db)?;
        }
        tx.commit().map_err(db)?;
        Ok(())
    }

    fn replace_file_records(&self, account_id: &AccountId, records: &[FileRecord]) -> Result<()> {
        check_owner(account_id, records)?;
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db)?;
        tx.execute(
            "DELETE FROM file_records WHERE account_id = ?1",
            [account_id.as_str()],
        )
        .map_err(db)?;
        for record in records {
            insert_record(&tx, record).map_err(db)?;
        }
        tx.commit().map_err(db)?;
        info!("Indexed {} files for {}", records.len(), account_id);
        Ok(())
    }

    fn query_file_records(&self, query: &FileQuery) -> Result<Vec<FileRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT account_id, remote_id, name, size, content_type, parent_id, modified
                FROM file_records
                WHERE (?1 IS NULL OR account_id = ?1)
                  AND (?2 IS NULL OR substr(name, 1, length(?2)) = ?2)
                ORDER BY account_id, name, remote_id
                "#,
            )
            .map_err(db)?;
        let rows = stmt
            .query_map(
                params![
                    query.account_id.as_ref().map(|id| id.as_str()),
                    query.name_prefix.as_deref(),
                ],
                record_from_row,
            )
            .map_err(db)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db)
    }

    fn save_transfer_job(&self, job: &TransferJob) -> Result<()> {
        self.put_job(job, false)
    }

    fn update_transfer_job(&self, job: &TransferJob) -> Result<()> {
        self.put_job(job, true)
    }

    fn get_transfer_job(&self, id: &JobId) -> Result<Option<TransferJob>> {
        let conn = self.conn()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM transfer_jobs WHERE id = ?1",
                [id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db)?;
        body.map(|b| serde_json::from_str(&b).map_err(Error::from))
            .transpose()
    }

    fn list_transfer_jobs(&self) -> Result<Vec<TransferJob>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT body FROM transfer_jobs ORDER BY created_at, id")
            .map_err(db)?;
        let bodies = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(db)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db)?;
        bodies
            .iter()
            .map(|b| serde_json::from_str(b).map_err(Error::from))
            .collect()
    }
}
