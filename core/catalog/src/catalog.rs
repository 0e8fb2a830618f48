//! Catalog trait definition.

use skyshard_common::{AccountId, FileRecord, JobId, Result, TransferJob};

use crate::model::{Account, FileQuery};

/// Synchronous record store.
///
/// Every write is an idempotent upsert keyed by id, so callers may repeat a
/// write after an uncertain failure. All failures surface as
/// `Error::Persistence`, except `update_transfer_job` on an unknown job which
/// is `Error::NotFound`.
pub trait Catalog: Send + Sync {
    /// Insert or replace an account.
    fn save_account(&self, account: &Account) -> Result<()>;

    fn get_account(&self, id: &AccountId) -> Result<Option<Account>>;

    /// All accounts, oldest first.
    fn list_accounts(&self) -> Result<Vec<Account>>;

    /// Delete an account and its file records.
    ///
    /// Returns whether the account existed.
    fn delete_account(&self, id: &AccountId) -> Result<bool>;

    /// Insert or replace file records of one account.
    ///
    /// Records whose `account_id` differs from `account_id` are rejected.
    fn save_file_records(&self, account_id: &AccountId, records: &[FileRecord]) -> Result<()>;

    /// Atomically swap the whole file index of one account.
    fn replace_file_records(&self, account_id: &AccountId, records: &[FileRecord]) -> Result<()>;

    /// Records matching `query`, ordered by account, name, then remote id.
    fn query_file_records(&self, query: &FileQuery) -> Result<Vec<FileRecord>>;

    /// Insert or replace a transfer job.
    fn save_transfer_job(&self, job: &TransferJob) -> Result<()>;

    /// Replace an existing transfer job.
    fn update_transfer_job(&self, job: &TransferJob) -> Result<()>;

    fn get_transfer_job(&self, id: &JobId) -> Result<Option<TransferJob>>;

    /// All jobs, oldest first.
    fn list_transfer_jobs(&self) -> Result<Vec<TransferJob>>;
}

pub(crate) fn check_owner(account_id: &AccountId, records: &[FileRecord]) -> Result<()> {
    match records.iter().find(|r| &r.account_id != account_id) {
        Some(stray) => Err(skyshard_common::Error::InvalidInput(format!(
            "Record {} belongs to {}, not {}",
            stray.remote_id, stray.account_id, account_id
        ))),
        None => Ok(()),
    }
}
