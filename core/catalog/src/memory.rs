//! In-memory catalog for testing and dry runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use skyshard_common::{AccountId, Error, FileRecord, JobId, Result, TransferJob};

use crate::catalog::{check_owner, Catalog};
use crate::model::{Account, FileQuery};

#[derive(Default)]
struct Tables {
    accounts: HashMap<AccountId, Account>,
    /// Keyed so iteration yields (account, name, remote id) order.
    files: BTreeMap<(AccountId, String, String), FileRecord>,
    jobs: HashMap<JobId, TransferJob>,
}

impl Tables {
    fn drop_files(&mut self, account_id: &AccountId) {
        self.files.retain(|(owner, _, _), _| owner != account_id);
    }

    fn put_file(&mut self, record: &FileRecord) {
        // A rename leaves the old key behind; clear it first.
        self.files.retain(|(owner, _, id), _| {
            !(owner == &record.account_id && id == &record.remote_id)
        });
        self.files.insert(
            (
                record.account_id.clone(),
                record.name.clone(),
                record.remote_id.clone(),
            ),
            record.clone(),
        );
    }
}

/// Catalog held entirely in memory. Lost on drop.
#[derive(Default)]
pub struct MemoryCatalog {
    tables: RwLock<Tables>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| Error::Persistence("Catalog lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| Error::Persistence("Catalog lock poisoned".to_string()))
    }
}

impl Catalog for MemoryCatalog {
    fn save_account(&self, account: &Account) -> Result<()> {
        self.write()?
            .accounts
            .insert(account.id.clone(), account.clone());
        Ok(())
    }

    fn get_account(&self, id: &AccountId) -> Result<Option<Account>> {
        Ok(self.read()?.accounts.get(id).cloned())
    }

    fn list_accounts(&self) -> Result<Vec<Account>> {
        let mut accounts: Vec<Account> = self.read()?.accounts.values().cloned().collect();
        accounts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(accounts)
    }

    fn delete_account(&self, id: &AccountId) -> Result<bool> {
        let mut tables = self.write()?;
        tables.drop_files(id);
        Ok(tables.accounts.remove(id).is_some())
    }

    fn save_file_records(&self, account_id: &AccountId, records: &[FileRecord]) -> Result<()> {
        check_owner(account_id, records)?;
        let mut tables = self.write()?;
        for record in records {
            tables.put_file(record);
        }
        Ok(())
    }

    fn replace_file_records(&self, account_id: &AccountId, records: &[FileRecord]) -> Result<()> {
        check_owner(account_id, records)?;
        let mut tables = self.write()?;
        tables.drop_files(account_id);
        for record in records {
            tables.put_file(record);
        }
        Ok(())
    }

    fn query_file_records(&self, query: &FileQuery) -> Result<Vec<FileRecord>> {
        Ok(self
            .read()?
            .files
            .values()
            .filter(|r| query.matches(r))
            .cloned()
            .collect())
    }

    fn save_transfer_job(&self, job: &TransferJob) -> Result<()> {
        self.write()?.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    fn update_transfer_job(&self, job: &TransferJob) -> Result<()> {
        let mut tables = self.write()?;
        match tables.jobs.get_mut(&job.id) {
            Some(existing) => {
                *existing = job.clone();
                Ok(())
            }
            None => Err(Error::NotFound(format!("Transfer job {}", job.id))),
        }
    }

    fn get_transfer_job(&self, id: &JobId) -> Result<Option<TransferJob>> {
        Ok(self.read()?.jobs.get(id).cloned())
    }

    fn list_transfer_jobs(&self) -> Result<Vec<TransferJob>> {
        let mut jobs: Vec<TransferJob> = self.read()?.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.as_str().cmp(b.id.as_str())));
        Ok(jobs)
    }
}
