//! Behavior every [`Catalog`] implementation must share.

use chrono::{Duration, TimeZone, Utc};

use skyshard_common::{AccountId, Error, FileDescriptor, FileRecord, JobState, QuotaSnapshot, TransferJob};
use skyshard_crypto::CipherBlob;
use skyshard_crypto::KdfParams;

use crate::catalog::Catalog;
use crate::model::{Account, FileQuery};

pub fn account(id: &str, order: i64) -> Account {
    let created_at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(order);
    Account {
        id: AccountId::new(id).unwrap(),
        email: format!("{}@example.com", id),
        display_name: id.to_uppercase(),
        provider: "memory".to_string(),
        settings: serde_json::json!({"folder_id": "backups"}),
        quota: QuotaSnapshot {
            bytes_total: 15 << 30,
            bytes_used: 1 << 30,
            taken_at: created_at,
        },
        credential: CipherBlob {
            version: 1,
            kdf: KdfParams::moderate(),
            salt: vec![7; 32],
            nonce: vec![9; 12],
            ciphertext: vec![1, 2, 3],
        },
        created_at,
    }
}

pub fn record(account: &str, remote_id: &str, name: &str) -> FileRecord {
    FileRecord {
        remote_id: remote_id.to_string(),
        account_id: AccountId::new(account).unwrap(),
        name: name.to_string(),
        size: 42,
        content_type: "application/octet-stream".to_string(),
        parent_id: Some("backups".to_string()),
        modified: Utc.with_ymd_and_hms(2024, 2, 1, 12, 0, 0).unwrap(),
    }
}

pub fn job(account: &str) -> TransferJob {
    TransferJob::new(
        FileDescriptor::new("photos.tar", 1000, "application/x-tar"),
        AccountId::new(account).unwrap(),
    )
}

pub fn accounts(catalog: &dyn Catalog) {
    // Inserted out of creation order
    let b = account("acct-b", 2);
    let a = account("acct-a", 1);
    catalog.save_account(&b).unwrap();
    catalog.save_account(&a).unwrap();

    let listed: Vec<String> = catalog
        .list_accounts()
        .unwrap()
        .into_iter()
        .map(|x| x.id.to_string())
        .collect();
    assert_eq!(listed, vec!["acct-a", "acct-b"]);

    // Upsert replaces in place
    let mut updated = a.clone();
    updated.quota.bytes_used = 5 << 30;
    catalog.save_account(&updated).unwrap();
    catalog.save_account(&updated).unwrap();
    assert_eq!(catalog.get_account(&a.id).unwrap(), Some(updated));
    assert_eq!(catalog.list_accounts().unwrap().len(), 2);

    assert!(catalog.delete_account(&a.id).unwrap());
    assert!(!catalog.delete_account(&a.id).unwrap());
    assert_eq!(catalog.get_account(&a.id).unwrap(), None);
}

pub fn file_records(catalog: &dyn Catalog) {
    let a = AccountId::new("acct-a").unwrap();
    let b = AccountId::new("acct-b").unwrap();
    catalog.save_account(&account("acct-a", 1)).unwrap();
    catalog.save_account(&account("acct-b", 2)).unwrap();

    catalog
        .save_file_records(
            &a,
            &[record("acct-a", "a2", "2024-02.tar"), record("acct-a", "a1", "2024-01.tar")],
        )
        .unwrap();
    catalog
        .save_file_records(&b, &[record("acct-b", "b1", "notes.txt")])
        .unwrap();

    // Foreign records are refused
    assert!(matches!(
        catalog.save_file_records(&a, &[record("acct-b", "x", "x")]),
        Err(Error::InvalidInput(_))
    ));

    let all = catalog.query_file_records(&FileQuery::default()).unwrap();
    let ids: Vec<&str> = all.iter().map(|r| r.remote_id.as_str()).collect();
    assert_eq!(ids, vec!["a1", "a2", "b1"]);

    let prefixed = catalog
        .query_file_records(&FileQuery::default().with_prefix("2024-"))
        .unwrap();
    assert_eq!(prefixed.len(), 2);

    // Upsert by (account, remote id), including renames
    let mut renamed = record("acct-a", "a1", "renamed.tar");
    renamed.size = 7;
    catalog.save_file_records(&a, &[renamed.clone()]).unwrap();
    let of_a = catalog.query_file_records(&FileQuery::account(a.clone())).unwrap();
    assert_eq!(of_a.len(), 2);
    assert!(of_a.contains(&renamed));

    catalog
        .replace_file_records(&a, &[record("acct-a", "a9", "fresh.bin")])
        .unwrap();
    let of_a = catalog.query_file_records(&FileQuery::account(a.clone())).unwrap();
    assert_eq!(of_a.len(), 1);
    assert_eq!(of_a[0].remote_id, "a9");

    // Deleting an account cascades to its records only
    catalog.delete_account(&a).unwrap();
    assert!(catalog.query_file_records(&FileQuery::account(a)).unwrap().is_empty());
    assert_eq!(catalog.query_file_records(&FileQuery::account(b)).unwrap().len(), 1);
}

pub fn transfer_jobs(catalog: &dyn Catalog) {
    let mut first = job("acct-a");
    let mut second = job("acct-b");
    second.created_at = first.created_at + Duration::seconds(1);

    assert!(matches!(
        catalog.update_transfer_job(&first),
        Err(Error::NotFound(_))
    ));

    catalog.save_transfer_job(&first).unwrap();
    catalog.save_transfer_job(&second).unwrap();
    catalog.save_transfer_job(&first).unwrap();

    first.mark_uploading().unwrap();
    first.record_progress(300);
    catalog.update_transfer_job(&first).unwrap();

    let stored = catalog.get_transfer_job(&first.id).unwrap().unwrap();
    assert_eq!(stored.state, JobState::Uploading);
    assert_eq!(stored.bytes_transferred, 300);

    let jobs = catalog.list_transfer_jobs().unwrap();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].id, first.id);
    assert!(catalog.get_transfer_job(&skyshard_common::JobId::new()).unwrap().is_none());
}
