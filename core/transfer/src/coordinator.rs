//! Transfer coordinator: executes uploads as persisted jobs.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{broadcast, mpsc, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use skyshard_accounts::AccountRegistry;
use skyshard_catalog::Catalog;
use skyshard_common::{
    AccountId, Error, FileDescriptor, FileRecord, JobId, JobState, Result, TransferJob,
};
use skyshard_storage::{
    upload_file, ContentSource, FileSource, RemoteStore, RetryConfig, UploadConfig, UploadEvent,
    UploadOutcome,
};

use crate::events::TransferEvent;
use crate::item::UploadItem;
use crate::planner::{self, Placement, Plan};

/// Buffered events per subscriber before the slowest one starts lagging.
const EVENT_CAPACITY: usize = 1024;

/// Replanning rounds for files that fail their live capacity check.
const MAX_REPLANS: usize = 3;

const INTERRUPTED: &str = "Interrupted before upload";

/// Transfer tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Jobs running at once across all accounts.
    pub max_workers: usize,
    /// Jobs running at once against one account.
    pub per_account_concurrency: usize,
    pub upload: UploadConfig,
    /// Backoff for a job whose upload failed transiently.
    pub job_retry: RetryConfig,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            per_account_concurrency: 1,
            upload: UploadConfig::default(),
            job_retry: RetryConfig::new(3),
        }
    }
}

impl TransferConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 || self.per_account_concurrency == 0 {
            return Err(Error::InvalidInput(
                "Worker counts must be positive".to_string(),
            ));
        }
        self.upload.validate()
    }
}

/// Final state of a [`TransferCoordinator::backup`] run.
#[derive(Debug, Clone, Default)]
pub struct BackupReport {
    /// Every job that was started, in completion order.
    pub jobs: Vec<TransferJob>,
    /// Files no account could hold.
    pub unplaced: Vec<FileDescriptor>,
    /// Files whose job could not be created, with the reason.
    pub not_started: Vec<(FileDescriptor, String)>,
}

impl BackupReport {
    fn count(&self, state: JobState) -> usize {
        self.jobs.iter().filter(|j| j.state == state).count()
    }

    pub fn completed(&self) -> usize {
        self.count(JobState::Completed)
    }

    pub fn failed(&self) -> usize {
        self.count(JobState::Failed)
    }

    pub fn paused(&self) -> usize {
        self.count(JobState::Paused)
    }

    /// `CapacityExceeded` naming the unplaced files, if any.
    pub fn check_capacity(&self) -> Result<()> {
        if self.unplaced.is_empty() {
            return Ok(());
        }
        Err(Error::CapacityExceeded {
            unplaced: self.unplaced.iter().map(|f| f.name.clone()).collect(),
        })
    }
}

enum Attempt {
    Ran(TransferJob),
    Deferred(usize),
    Interrupted(usize),
}

struct Inner {
    accounts: AccountRegistry,
    catalog: Arc<dyn Catalog>,
    config: TransferConfig,
    workers: Arc<Semaphore>,
    account_slots: StdMutex<HashMap<AccountId, Arc<Semaphore>>>,
    /// Bytes promised to running jobs, not yet visible in quota.
    reserved: StdMutex<HashMap<AccountId, u64>>,
    active: Mutex<HashMap<JobId, CancellationToken>>,
    /// Parent of every job token; replaced each time it fires.
    halt: StdMutex<CancellationToken>,
    sources: Mutex<HashMap<JobId, Arc<dyn ContentSource>>>,
    events: broadcast::Sender<TransferEvent>,
}

/// Runs transfer jobs on a bounded worker pool.
///
/// Cheap to clone; clones share the pool, the running jobs and the event
/// channel.
#[derive(Clone)]
pub struct TransferCoordinator {
    inner: Arc<Inner>,
}

impl TransferCoordinator {
    /// # Errors
    /// - `InvalidInput` for an invalid `config`
    pub fn new(accounts: AccountRegistry, config: TransferConfig) -> Result<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            inner: Arc::new(Inner {
                catalog: accounts.catalog().clone(),
                accounts,
                workers: Arc::new(Semaphore::new(config.max_workers)),
                config,
                account_slots: StdMutex::new(HashMap::new()),
                reserved: StdMutex::new(HashMap::new()),
                active: Mutex::new(HashMap::new()),
                halt: StdMutex::new(CancellationToken::new()),
                sources: Mutex::new(HashMap::new()),
                events,
            }),
        })
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.inner.events.subscribe()
    }

    pub fn config(&self) -> &TransferConfig {
        &self.inner.config
    }

    fn emit(&self, event: TransferEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    fn persist(&self, job: &TransferJob) {
        if let Err(e) = self.inner.catalog.update_transfer_job(job) {
            warn!("Could not persist job {}: {}", job.id, e);
        }
    }

    /// Account permit first so a queue on one account does not hold workers.
    async fn permits(
        &self,
        account_id: &AccountId,
    ) -> Result<(OwnedSemaphorePermit, OwnedSemaphorePermit)> {
        let slot = {
            let mut slots = self
                .inner
                .account_slots
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            slots
                .entry(account_id.clone())
                .or_insert_with(|| Arc::new(Semaphore::new(self.inner.config.per_account_concurrency)))
                .clone()
        };
        let closed = |_: tokio::sync::AcquireError| Error::InvalidState("Worker pool closed".to_string());
        let account = slot.acquire_owned().await.map_err(closed)?;
        let worker = self.inner.workers.clone().acquire_owned().await.map_err(closed)?;
        Ok((account, worker))
    }

    /// Live free space, falling back to the last snapshot when the remote
    /// cannot be reached.
    async fn live_free(&self, account_id: &AccountId) -> Result<u64> {
        match self.inner.accounts.refresh_quota(account_id).await {
            Ok(quota) => Ok(quota.free_bytes()),
            Err(e @ (Error::NotFound(_) | Error::NeedsPassphrase(_) | Error::RemoteAuth(_))) => Err(e),
            Err(e) => {
                warn!("Live quota of {} unavailable, using snapshot: {}", account_id, e);
                let account = self
                    .inner
                    .catalog
                    .get_account(account_id)?
                    .ok_or_else(|| Error::NotFound(format!("Account {}", account_id)))?;
                Ok(account.quota.free_bytes())
            }
        }
    }

    fn try_reserve(&self, account_id: &AccountId, free: u64, size: u64) -> bool {
        let mut reserved = self.inner.reserved.lock().unwrap_or_else(|e| e.into_inner());
        let held = reserved.entry(account_id.clone()).or_default();
        if free.saturating_sub(*held) < size {
            return false;
        }
        *held += size;
        true
    }

    fn release(&self, account_id: &AccountId, size: u64) {
        let mut reserved = self.inner.reserved.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(held) = reserved.get_mut(account_id) {
            *held = held.saturating_sub(size);
        }
    }

    fn halt_token(&self) -> CancellationToken {
        self.inner.halt.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Mark `job_id` as running under `parent`. Fails if it already is.
    async fn claim(&self, job_id: &JobId, parent: &CancellationToken) -> Result<CancellationToken> {
        let mut active = self.inner.active.lock().await;
        if active.contains_key(job_id) {
            return Err(Error::InvalidState(format!("Job {} is already running", job_id)));
        }
        let token = parent.child_token();
        active.insert(job_id.clone(), token.clone());
        Ok(token)
    }

    async fn unclaim(&self, job_id: &JobId) {
        self.inner.active.lock().await.remove(job_id);
    }

    async fn create_job(
        &self,
        item: &UploadItem,
        account_id: AccountId,
        parent: &CancellationToken,
    ) -> Result<(TransferJob, CancellationToken)> {
        let mut job = TransferJob::new(item.descriptor.clone(), account_id);
        if let Some(path) = &item.path {
            job = job.with_source_path(path.clone());
        }
        self.inner.catalog.save_transfer_job(&job)?;
        self.inner
            .sources
            .lock()
            .await
            .insert(job.id.clone(), item.source.clone());
        let cancel = self.claim(&job.id, parent).await?;

        info!(
            "Queued {} ({} bytes) for {} as job {}",
            job.file.name, job.file.size_bytes, job.account_id, job.id
        );
        self.emit(TransferEvent::Queued {
            job_id: job.id.clone(),
            account_id: job.account_id.clone(),
            file_name: job.file.name.clone(),
        });
        Ok((job, cancel))
    }

    /// Upload `items`, letting the planner choose the accounts.
    ///
    /// Each file's target is re-checked against live free space right
    /// before its upload; files that no longer fit are replanned over the
    /// refreshed capacities. Individual job failures are reported, not
    /// returned. After [`cancel_all`](Self::cancel_all) no further file is
    /// started; those still waiting are reported in `not_started`.
    pub async fn backup(&self, items: Vec<UploadItem>) -> Result<BackupReport> {
        let halt = self.halt_token();
        let files: Vec<FileDescriptor> = items.iter().map(|i| i.descriptor.clone()).collect();
        let mut plan = planner::plan(&files, &self.inner.accounts.capacities()?);
        let mut unplaced = std::mem::take(&mut plan.unplaced);
        let mut report = BackupReport::default();

        info!(
            "Backing up {} file(s): {} placed, {} unplaced",
            files.len(),
            plan.placements.len(),
            unplaced.len()
        );

        let mut round = 0;
        loop {
            let mut tasks = JoinSet::new();
            for Placement { index, account_id } in plan.placements {
                let this = self.clone();
                let item = items[index].clone();
                let halt = halt.clone();
                tasks.spawn(async move {
                    let outcome = this.place_and_run(index, &item, account_id, &halt).await;
                    (index, outcome)
                });
            }

            let mut deferred = Vec::new();
            while let Some(joined) = tasks.join_next().await {
                let (index, outcome) = joined
                    .map_err(|e| Error::InvalidState(format!("Transfer task failed: {}", e)))?;
                match outcome {
                    Ok(Attempt::Ran(job)) => report.jobs.push(job),
                    Ok(Attempt::Deferred(index)) => deferred.push(index),
                    Ok(Attempt::Interrupted(index)) => {
                        report.not_started.push((files[index].clone(), INTERRUPTED.to_string()));
                    }
                    Err(e) => {
                        error!("Could not start upload of {}: {}", files[index].name, e);
                        report.not_started.push((files[index].clone(), e.to_string()));
                    }
                }
            }

            if deferred.is_empty() {
                break;
            }
            deferred.sort_unstable();
            if halt.is_cancelled() {
                report.not_started.extend(
                    deferred.iter().map(|&i| (files[i].clone(), INTERRUPTED.to_string())),
                );
                break;
            }
            round += 1;
            if round > MAX_REPLANS {
                unplaced.extend(deferred);
                break;
            }

            let subset: Vec<FileDescriptor> = deferred.iter().map(|&i| files[i].clone()).collect();
            let replanned = planner::plan(&subset, &self.inner.accounts.capacities()?);
            debug!(
                "Replanned {} deferred file(s): {} placed",
                subset.len(),
                replanned.placements.len()
            );
            unplaced.extend(replanned.unplaced.iter().map(|&i| deferred[i]));
            plan = Plan {
                placements: replanned
                    .placements
                    .into_iter()
                    .map(|p| Placement {
                        index: deferred[p.index],
                        account_id: p.account_id,
                    })
                    .collect(),
                unplaced: Vec::new(),
            };
        }

        unplaced.sort_unstable();
        report.unplaced = unplaced.iter().map(|&i| files[i].clone()).collect();
        if !report.unplaced.is_empty() {
            warn!("{} file(s) did not fit on any account", report.unplaced.len());
        }
        info!(
            "Backup finished: {} completed, {} failed, {} paused",
            report.completed(),
            report.failed(),
            report.paused()
        );
        Ok(report)
    }

    async fn place_and_run(
        &self,
        index: usize,
        item: &UploadItem,
        account_id: AccountId,
        halt: &CancellationToken,
    ) -> Result<Attempt> {
        let _permits = tokio::select! {
            biased;
            _ = halt.cancelled() => return Ok(Attempt::Interrupted(index)),
            permits = self.permits(&account_id) => permits?,
        };
        let size = item.descriptor.size_bytes;
        let free = self.live_free(&account_id).await?;
        if !self.try_reserve(&account_id, free, size) {
            info!(
                "{} no longer fits on {} ({} bytes free)",
                item.descriptor.name, account_id, free
            );
            self.emit(TransferEvent::Deferred {
                file_name: item.descriptor.name.clone(),
                account_id,
            });
            return Ok(Attempt::Deferred(index));
        }
        if halt.is_cancelled() {
            self.release(&account_id, size);
            return Ok(Attempt::Interrupted(index));
        }

        let result = match self.create_job(item, account_id.clone(), halt).await {
            Ok((job, cancel)) => Ok(Attempt::Ran(self.run_job(job, item.source.clone(), cancel).await)),
            Err(e) => Err(e),
        };
        self.release(&account_id, size);
        result
    }

    /// Upload one file to a chosen account.
    ///
    /// Only that account's live free space is checked.
    ///
    /// # Errors
    /// - `CapacityExceeded` if the file does not fit
    /// - `NotFound` for an unknown account
    pub async fn upload_to(&self, account_id: &AccountId, item: UploadItem) -> Result<TransferJob> {
        let halt = self.halt_token();
        let _permits = self.permits(account_id).await?;
        let size = item.descriptor.size_bytes;
        let free = self.live_free(account_id).await?;
        if !self.try_reserve(account_id, free, size) {
            return Err(Error::CapacityExceeded {
                unplaced: vec![item.descriptor.name],
            });
        }

        let result = match self.create_job(&item, account_id.clone(), &halt).await {
            Ok((job, cancel)) => Ok(self.run_job(job, item.source.clone(), cancel).await),
            Err(e) => Err(e),
        };
        self.release(account_id, size);
        result
    }

    /// Continue a paused job from the last acknowledged byte.
    ///
    /// A job left `uploading` by an interrupted process is resumed as well.
    pub async fn resume(&self, job_id: &JobId) -> Result<TransferJob> {
        let cancel = self.claim(job_id, &self.halt_token()).await?;
        let prepared = self.load(job_id).and_then(|mut job| {
            match job.state {
                JobState::Paused | JobState::Pending => {}
                JobState::Uploading => job.mark_paused()?,
                _ => {
                    return Err(Error::InvalidState(format!(
                        "Job {} is {} and cannot be resumed",
                        job_id, job.state
                    )))
                }
            }
            Ok(job)
        });
        match prepared {
            Ok(job) => self.launch(job, cancel).await,
            Err(e) => {
                self.unclaim(job_id).await;
                Err(e)
            }
        }
    }

    /// Run a failed job again, continuing its session when it has one.
    pub async fn retry(&self, job_id: &JobId) -> Result<TransferJob> {
        let cancel = self.claim(job_id, &self.halt_token()).await?;
        let prepared = self.load(job_id).and_then(|mut job| {
            job.reset_for_retry()?;
            self.persist(&job);
            Ok(job)
        });
        match prepared {
            Ok(job) => self.launch(job, cancel).await,
            Err(e) => {
                self.unclaim(job_id).await;
                Err(e)
            }
        }
    }

    /// Pause a running job. Its session is kept for [`resume`](Self::resume).
    pub async fn cancel(&self, job_id: &JobId) -> Result<()> {
        if let Some(token) = self.inner.active.lock().await.get(job_id) {
            info!("Cancelling job {}", job_id);
            token.cancel();
            return Ok(());
        }
        match self.inner.catalog.get_transfer_job(job_id)? {
            Some(job) => Err(Error::InvalidState(format!(
                "Job {} is not running ({})",
                job_id, job.state
            ))),
            None => Err(Error::NotFound(format!("Transfer job {}", job_id))),
        }
    }

    /// Pause every running job and stop running backups from starting
    /// more. Returns how many jobs were signalled.
    ///
    /// Work started afterwards runs normally.
    pub async fn cancel_all(&self) -> usize {
        let halt = {
            let mut halt = self.inner.halt.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *halt)
        };
        halt.cancel();
        let active = self.inner.active.lock().await;
        for token in active.values() {
            token.cancel();
        }
        info!("Interrupted {} running job(s)", active.len());
        active.len()
    }

    /// All persisted jobs, oldest first.
    pub fn jobs(&self) -> Result<Vec<TransferJob>> {
        self.inner.catalog.list_transfer_jobs()
    }

    fn load(&self, job_id: &JobId) -> Result<TransferJob> {
        self.inner
            .catalog
            .get_transfer_job(job_id)?
            .ok_or_else(|| Error::NotFound(format!("Transfer job {}", job_id)))
    }

    /// Run a claimed job, giving the claim back if it cannot start.
    async fn launch(&self, job: TransferJob, cancel: CancellationToken) -> Result<TransferJob> {
        let ready = async {
            let source = self.source_for(&job).await?;
            let permits = self.permits(&job.account_id).await?;
            Ok::<_, Error>((source, permits))
        }
        .await;
        match ready {
            Ok((source, _permits)) => Ok(self.run_job(job, source, cancel).await),
            Err(e) => {
                self.unclaim(&job.id).await;
                Err(e)
            }
        }
    }

    async fn source_for(&self, job: &TransferJob) -> Result<Arc<dyn ContentSource>> {
        if let Some(source) = self.inner.sources.lock().await.get(&job.id) {
            return Ok(source.clone());
        }
        match &job.source_path {
            Some(path) => {
                let source: Arc<dyn ContentSource> = Arc::new(FileSource::open(path).await?);
                self.inner
                    .sources
                    .lock()
                    .await
                    .insert(job.id.clone(), source.clone());
                Ok(source)
            }
            None => Err(Error::InvalidState(format!(
                "Job {} has no source to read {} from",
                job.id, job.file.name
            ))),
        }
    }

    async fn run_job(
        &self,
        job: TransferJob,
        source: Arc<dyn ContentSource>,
        cancel: CancellationToken,
    ) -> TransferJob {
        let id = job.id.clone();
        let job = self.drive(job, source, cancel).await;

        self.unclaim(&id).await;
        if job.state == JobState::Completed {
            self.inner.sources.lock().await.remove(&id);
        }
        job
    }

    async fn drive(
        &self,
        mut job: TransferJob,
        source: Arc<dyn ContentSource>,
        cancel: CancellationToken,
    ) -> TransferJob {
        let store = match self.inner.accounts.store_for(&job.account_id) {
            Ok(store) => store,
            Err(e) => return self.fail(job, e),
        };
        let policy = &self.inner.config.job_retry;
        let mut retries = 0;
        // Only a session carried over from an earlier run may be restarted
        let mut restartable = job.session.is_some();

        loop {
            if job.state != JobState::Uploading {
                if let Err(e) = job.mark_uploading() {
                    return self.fail(job, e);
                }
                self.persist(&job);
                self.emit(TransferEvent::Started {
                    job_id: job.id.clone(),
                    attempt: job.attempts,
                });
            }

            match self.attempt(&mut job, store.as_ref(), source.as_ref(), &cancel).await {
                Ok(UploadOutcome::Completed { remote_id }) => {
                    return self.complete(job, remote_id).await;
                }
                Ok(UploadOutcome::Paused { session }) => {
                    if let Some(session) = session {
                        job.set_session(session);
                    }
                    return self.pause(job);
                }
                Err(Error::RemoteRejected(reason)) if restartable => {
                    warn!(
                        "Remote refused the resumed session of job {} ({}); starting over",
                        job.id, reason
                    );
                    restartable = false;
                    if let Err(e) = job.restart() {
                        return self.fail(job, e);
                    }
                    self.persist(&job);
                }
                Err(e) if e.is_retryable() && retries < policy.max_retries => {
                    retries += 1;
                    let delay = policy.delay_for_attempt(retries - 1);
                    warn!(
                        "Job {} hit {} (retry {} of {}), backing off {:?}",
                        job.id, e, retries, policy.max_retries, delay
                    );
                    self.emit(TransferEvent::Retrying {
                        job_id: job.id.clone(),
                        retry: retries,
                        error: e.to_string(),
                    });
                    tokio::select! {
                        _ = cancel.cancelled() => return self.pause(job),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return self.fail(job, e),
            }
        }
    }

    /// One pass of the upload driver, folding its events into `job`.
    async fn attempt(
        &self,
        job: &mut TransferJob,
        store: &dyn RemoteStore,
        source: &dyn ContentSource,
        cancel: &CancellationToken,
    ) -> Result<UploadOutcome> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let file = job.file.clone();
        let resume = job.session.clone();
        let upload = upload_file(
            store,
            &file,
            source,
            resume,
            &self.inner.config.upload,
            &tx,
            cancel,
        );
        tokio::pin!(upload);

        let result = loop {
            tokio::select! {
                biased;
                Some(event) = rx.recv() => self.apply(job, event),
                result = &mut upload => break result,
            }
        };
        while let Ok(event) = rx.try_recv() {
            self.apply(job, event);
        }
        result
    }

    fn apply(&self, job: &mut TransferJob, event: UploadEvent) {
        match event {
            UploadEvent::Session(session) => {
                job.set_session(session);
                self.persist(job);
            }
            UploadEvent::Acknowledged(acknowledged) => {
                if let Some(session) = job.session.as_mut() {
                    session.acknowledged = session.acknowledged.max(acknowledged);
                }
                if job.record_progress(acknowledged) {
                    self.persist(job);
                    self.emit(TransferEvent::Progress {
                        job_id: job.id.clone(),
                        bytes_transferred: job.bytes_transferred,
                        total_bytes: job.file.size_bytes,
                    });
                }
            }
        }
    }

    async fn complete(&self, mut job: TransferJob, remote_id: String) -> TransferJob {
        if let Err(e) = job.mark_completed(remote_id.clone()) {
            return self.fail(job, e);
        }
        self.persist(&job);

        let record = FileRecord {
            remote_id: remote_id.clone(),
            account_id: job.account_id.clone(),
            name: job.file.name.clone(),
            size: job.file.size_bytes,
            content_type: job.file.content_type.clone(),
            parent_id: None,
            modified: Utc::now(),
        };
        if let Err(e) = self.inner.catalog.save_file_records(&job.account_id, &[record]) {
            warn!("Could not index {}: {}", job.file.name, e);
        }
        if let Err(e) = self.inner.accounts.refresh_quota(&job.account_id).await {
            warn!("Quota refresh after job {} failed: {}", job.id, e);
        }

        info!("Job {} completed: {} is {}", job.id, job.file.name, remote_id);
        self.emit(TransferEvent::Completed {
            job_id: job.id.clone(),
            remote_id,
        });
        job
    }

    fn pause(&self, mut job: TransferJob) -> TransferJob {
        if let Err(e) = job.mark_paused() {
            return self.fail(job, e);
        }
        self.persist(&job);
        info!(
            "Job {} paused at {} of {} bytes",
            job.id, job.bytes_transferred, job.file.size_bytes
        );
        self.emit(TransferEvent::Paused {
            job_id: job.id.clone(),
        });
        job
    }

    fn fail(&self, mut job: TransferJob, err: Error) -> TransferJob {
        if let Err(e) = job.mark_failed(err.to_string()) {
            warn!("Job {}: {}", job.id, e);
        }
        self.persist(&job);
        error!("Job {} failed: {}", job.id, err);
        self.emit(TransferEvent::Failed {
            job_id: job.id.clone(),
            error: err.to_string(),
        });
        job
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use serde_json::Value;
    use skyshard_catalog::{FileQuery, MemoryCatalog};
    use skyshard_crypto::{CredentialVault, KdfParams};
    use skyshard_storage::{
        BytesSource, MemoryStore, ScriptedAuth, StoreContext, StoreRegistry, CHUNK_ALIGNMENT,
    };
    use std::time::Duration;

    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * 1024;

    struct Fixture {
        coordinator: TransferCoordinator,
        accounts: AccountRegistry,
        stores: HashMap<String, MemoryStore>,
    }

    impl Fixture {
        fn id(&self, code: &str) -> AccountId {
            AccountId::new(format!("acct-{}", code)).unwrap()
        }

        fn store(&self, code: &str) -> &MemoryStore {
            &self.stores[&format!("acct-{}", code)]
        }
    }

    fn test_config() -> TransferConfig {
        TransferConfig {
            max_workers: 4,
            per_account_concurrency: 1,
            upload: UploadConfig {
                resumable_threshold: CHUNK_ALIGNMENT,
                chunk_size: CHUNK_ALIGNMENT,
                chunk_retry: RetryConfig::new(0).with_initial_delay(Duration::from_millis(1)),
                call_timeout: Duration::from_secs(5),
            },
            job_retry: RetryConfig::new(2)
                .with_initial_delay(Duration::from_millis(1))
                .with_jitter(false),
        }
    }

    /// Accounts `acct-<code>` connected in the given order, each backed by
    /// a memory store of the given capacity.
    async fn fixture(accounts: &[(&str, u64)]) -> Fixture {
        let stores: HashMap<String, MemoryStore> = accounts
            .iter()
            .map(|(code, capacity)| {
                let id = AccountId::new(format!("acct-{}", code)).unwrap();
                (id.to_string(), MemoryStore::new(id, *capacity))
            })
            .collect();

        let shared = stores.clone();
        let mut providers = StoreRegistry::new();
        providers
            .register(
                "memory",
                Box::new(move |ctx: StoreContext| {
                    let store = shared
                        .get(ctx.account_id.as_str())
                        .cloned()
                        .ok_or_else(|| Error::NotFound(ctx.account_id.to_string()))?;
                    Ok(Arc::new(store) as Arc<dyn RemoteStore>)
                }),
            )
            .unwrap();

        let registry = AccountRegistry::new(
            Arc::new(MemoryCatalog::new()),
            Arc::new(ScriptedAuth::new()),
            Arc::new(providers),
            CredentialVault::new(KdfParams {
                memory_cost: 1024,
                time_cost: 1,
                parallelism: 1,
            }),
        );
        for (code, _) in accounts {
            registry
                .connect_account(code, "pw", "memory", Value::Null)
                .await
                .unwrap();
        }

        Fixture {
            coordinator: TransferCoordinator::new(registry.clone(), test_config()).unwrap(),
            accounts: registry,
            stores,
        }
    }

    fn data(len: u64, seed: u8) -> Bytes {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect::<Vec<u8>>().into()
    }

    fn item(name: &str, bytes: &Bytes) -> UploadItem {
        UploadItem::new(
            FileDescriptor::new(name, bytes.len() as u64, "application/octet-stream"),
            Arc::new(BytesSource::new(bytes.clone())),
        )
    }

    fn stored(store: &MemoryStore, name: &str) -> Option<Bytes> {
        let record = store.files().into_iter().find(|r| r.name == name)?;
        store.file_bytes(&record.remote_id)
    }

    async fn next_matching(
        rx: &mut broadcast::Receiver<TransferEvent>,
        pred: impl Fn(&TransferEvent) -> bool,
    ) -> TransferEvent {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let event = rx.recv().await.unwrap();
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_backup_spreads_files() {
        let f = fixture(&[("a", 3 * MIB), ("b", 2 * MIB)]).await;
        let big = data(1536 * KIB, 1);
        let medium = data(MIB, 2);
        let small = data(100 * KIB, 3);

        let report = f
            .coordinator
            .backup(vec![item("small", &small), item("big", &big), item("medium", &medium)])
            .await
            .unwrap();

        assert_eq!(report.completed(), 3);
        assert!(report.unplaced.is_empty());
        report.check_capacity().unwrap();

        // big -> a, medium -> b, small -> a (1.5 MiB left beats 1 MiB)
        assert_eq!(stored(f.store("a"), "big").unwrap(), big);
        assert_eq!(stored(f.store("b"), "medium").unwrap(), medium);
        assert_eq!(stored(f.store("a"), "small").unwrap(), small);

        let indexed = f
            .accounts
            .catalog()
            .query_file_records(&FileQuery::default())
            .unwrap();
        assert_eq!(indexed.len(), 3);

        let a = f.accounts.catalog().get_account(&f.id("a")).unwrap().unwrap();
        assert_eq!(a.quota.bytes_used, 1636 * KIB);
    }

    #[tokio::test]
    async fn test_live_check_replans_deferred_file() {
        let f = fixture(&[("a", 2 * MIB), ("b", 1536 * KIB)]).await;
        // Something else filled `a` after its snapshot was taken
        f.store("a").set_external_used(1900 * KIB);
        let mut events = f.coordinator.subscribe();

        let payload = data(MIB, 7);
        let report = f.coordinator.backup(vec![item("file", &payload)]).await.unwrap();

        assert_eq!(report.completed(), 1);
        assert_eq!(report.jobs[0].account_id, f.id("b"));
        assert_eq!(stored(f.store("b"), "file").unwrap(), payload);

        let deferred = next_matching(&mut events, |e| matches!(e, TransferEvent::Deferred { .. })).await;
        assert_eq!(
            deferred,
            TransferEvent::Deferred {
                file_name: "file".to_string(),
                account_id: f.id("a"),
            }
        );
    }

    #[tokio::test]
    async fn test_unplaced_file_starts_no_upload() {
        let f = fixture(&[("a", MIB)]).await;
        let report = f
            .coordinator
            .backup(vec![item("huge", &data(2 * MIB, 0))])
            .await
            .unwrap();

        assert!(report.jobs.is_empty());
        assert_eq!(report.unplaced.len(), 1);
        assert!(matches!(
            report.check_capacity(),
            Err(Error::CapacityExceeded { .. })
        ));
        assert_eq!(f.store("a").stats().chunk_calls, 0);
        assert!(f.store("a").files().is_empty());
        assert!(f.coordinator.jobs().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let f = fixture(&[("a", 4 * MIB)]).await;
        f.store("a").inject_chunk_failures(2);
        let mut events = f.coordinator.subscribe();

        let payload = data(MIB, 9);
        let job = f
            .coordinator
            .upload_to(&f.id("a"), item("file", &payload))
            .await
            .unwrap();

        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.attempts, 1);
        assert_eq!(stored(f.store("a"), "file").unwrap(), payload);
        assert_eq!(f.store("a").stats().overlap_bytes, 0);

        let mut retries = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, TransferEvent::Retrying { .. }) {
                retries += 1;
            }
        }
        assert_eq!(retries, 2);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_then_retry_succeeds() {
        let f = fixture(&[("a", 4 * MIB)]).await;
        f.store("a").inject_chunk_failures(3);

        let payload = data(MIB, 4);
        let job = f
            .coordinator
            .upload_to(&f.id("a"), item("file", &payload))
            .await
            .unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert!(job.error.as_deref().unwrap().contains("connection reset"));
        assert!(job.session.is_some());

        let job = f.coordinator.retry(&job.id).await.unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(stored(f.store("a"), "file").unwrap(), payload);
        assert_eq!(f.store("a").stats().overlap_bytes, 0);
    }

    #[tokio::test]
    async fn test_rejection_fails_without_retry() {
        let f = fixture(&[("a", 4 * MIB)]).await;
        f.store("a").reject_uploads();
        let mut events = f.coordinator.subscribe();

        let job = f
            .coordinator
            .upload_to(&f.id("a"), item("small", &data(10 * KIB, 0)))
            .await
            .unwrap();

        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts, 1);
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, TransferEvent::Retrying { .. }));
        }
        let persisted = f.accounts.catalog().get_transfer_job(&job.id).unwrap().unwrap();
        assert_eq!(persisted.state, JobState::Failed);
    }

    #[tokio::test]
    async fn test_manual_upload_checks_only_target() {
        let f = fixture(&[("a", MIB), ("b", 10 * MIB)]).await;
        let result = f
            .coordinator
            .upload_to(&f.id("a"), item("big", &data(2 * MIB, 0)))
            .await;

        assert!(matches!(result, Err(Error::CapacityExceeded { .. })));
        assert!(f.store("b").files().is_empty());
        assert!(f.coordinator.jobs().unwrap().is_empty());
    }

    /// Start an upload, cancel it after the first acknowledged chunk.
    async fn paused_upload(f: &Fixture, upload: UploadItem) -> TransferJob {
        f.store("a").set_chunk_delay(Duration::from_millis(20));
        let mut events = f.coordinator.subscribe();

        let coordinator = f.coordinator.clone();
        let target = f.id("a");
        let running = tokio::spawn(async move { coordinator.upload_to(&target, upload).await });

        let progress = next_matching(&mut events, |e| matches!(e, TransferEvent::Progress { .. })).await;
        f.coordinator.cancel(progress.job_id().unwrap()).await.unwrap();

        let job = running.await.unwrap().unwrap();
        f.store("a").set_chunk_delay(Duration::ZERO);
        job
    }

    #[tokio::test]
    async fn test_cancel_then_resume_continues_at_offset() {
        let f = fixture(&[("a", 4 * MIB)]).await;
        let payload = data(MIB, 5);

        let paused = paused_upload(&f, item("file", &payload)).await;
        assert_eq!(paused.state, JobState::Paused);
        assert!(paused.session.is_some());
        assert!(paused.bytes_transferred > 0 && paused.bytes_transferred < MIB);
        assert!(matches!(
            f.coordinator.cancel(&paused.id).await,
            Err(Error::InvalidState(_))
        ));

        let mut events = f.coordinator.subscribe();
        let job = f.coordinator.resume(&paused.id).await.unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.attempts, 2);
        assert_eq!(stored(f.store("a"), "file").unwrap(), payload);
        assert_eq!(f.store("a").stats().overlap_bytes, 0);

        let mut last = paused.bytes_transferred;
        while let Ok(event) = events.try_recv() {
            if let TransferEvent::Progress { bytes_transferred, .. } = event {
                assert!(bytes_transferred > last);
                last = bytes_transferred;
            }
        }
        assert_eq!(last, MIB);
    }

    #[tokio::test]
    async fn test_expired_session_restarts_from_scratch() {
        let f = fixture(&[("a", 4 * MIB)]).await;
        let payload = data(MIB, 6);

        let paused = paused_upload(&f, item("file", &payload)).await;
        f.store("a").expire_sessions();

        let job = f.coordinator.resume(&paused.id).await.unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(stored(f.store("a"), "file").unwrap(), payload);
    }

    #[tokio::test]
    async fn test_session_lost_mid_upload_fails() {
        let f = fixture(&[("a", 4 * MIB)]).await;
        f.store("a").set_chunk_delay(Duration::from_millis(20));
        let mut events = f.coordinator.subscribe();

        let coordinator = f.coordinator.clone();
        let target = f.id("a");
        let upload = item("file", &data(MIB, 2));
        let running = tokio::spawn(async move { coordinator.upload_to(&target, upload).await });

        next_matching(&mut events, |e| matches!(e, TransferEvent::Progress { .. })).await;
        f.store("a").expire_sessions();

        let job = running.await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert!(job.bytes_transferred < MIB);
        assert!(stored(f.store("a"), "file").is_none());
        assert!(f.store("a").stats().bytes_received < MIB);
    }

    #[tokio::test]
    async fn test_concurrent_resumes_run_job_once() {
        let f = fixture(&[("a", 4 * MIB)]).await;
        let payload = data(MIB, 11);
        let paused = paused_upload(&f, item("file", &payload)).await;
        f.store("a").set_chunk_delay(Duration::from_millis(10));

        let (first, second) = tokio::join!(
            f.coordinator.resume(&paused.id),
            f.coordinator.resume(&paused.id)
        );
        let (done, refused) = match (first, second) {
            (Ok(job), Err(e)) | (Err(e), Ok(job)) => (job, e),
            other => panic!("expected one resume to run, got {:?}", other),
        };
        assert_eq!(done.state, JobState::Completed);
        assert!(matches!(refused, Error::InvalidState(_)));
        assert_eq!(stored(f.store("a"), "file").unwrap(), payload);
        assert_eq!(f.store("a").stats().overlap_bytes, 0);

        // The claim is released once the job ends
        assert!(matches!(
            f.coordinator.resume(&paused.id).await,
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(
            f.coordinator.cancel(&paused.id).await,
            Err(Error::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_all_stops_queued_backup_files() {
        let f = fixture(&[("a", 8 * MIB)]).await;
        f.store("a").set_chunk_delay(Duration::from_millis(20));
        let mut events = f.coordinator.subscribe();

        let coordinator = f.coordinator.clone();
        let files = vec![
            item("one", &data(MIB, 1)),
            item("two", &data(MIB, 2)),
            item("three", &data(MIB, 3)),
        ];
        let running = tokio::spawn(async move { coordinator.backup(files).await });

        next_matching(&mut events, |e| matches!(e, TransferEvent::Progress { .. })).await;
        assert_eq!(f.coordinator.cancel_all().await, 1);

        let report = running.await.unwrap().unwrap();
        assert_eq!(report.completed(), 0);
        assert_eq!(report.paused(), 1);
        assert_eq!(report.not_started.len(), 2);
        assert!(f.store("a").files().is_empty());
        assert_eq!(f.coordinator.jobs().unwrap().len(), 1);

        // Later work is not affected by the earlier interrupt
        f.store("a").set_chunk_delay(Duration::ZERO);
        let report = f.coordinator.backup(vec![item("four", &data(KIB, 4))]).await.unwrap();
        assert_eq!(report.completed(), 1);

        let paused = f
            .coordinator
            .jobs()
            .unwrap()
            .into_iter()
            .find(|j| j.state == JobState::Paused)
            .unwrap();
        let job = f.coordinator.resume(&paused.id).await.unwrap();
        assert_eq!(job.state, JobState::Completed);
    }

    #[tokio::test]
    async fn test_resume_in_new_process_reads_source_path() {
        let f = fixture(&[("a", 4 * MIB)]).await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let payload = data(MIB, 8);
        std::fs::write(&path, &payload).unwrap();

        let paused = paused_upload(&f, UploadItem::from_path(&path).await.unwrap()).await;
        assert_eq!(paused.state, JobState::Paused);

        // Fresh coordinator: no in-memory sources
        let restarted = TransferCoordinator::new(f.accounts.clone(), test_config()).unwrap();
        let job = restarted.resume(&paused.id).await.unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(stored(f.store("a"), "disk.img").unwrap(), payload);
    }

    #[tokio::test]
    async fn test_resume_rejects_terminal_jobs() {
        let f = fixture(&[("a", 4 * MIB)]).await;
        let job = f
            .coordinator
            .upload_to(&f.id("a"), item("x", &data(KIB, 0)))
            .await
            .unwrap();

        assert!(matches!(
            f.coordinator.resume(&job.id).await,
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(
            f.coordinator.retry(&job.id).await,
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(
            f.coordinator.resume(&JobId::new()).await,
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_config_validation() {
        assert!(TransferConfig::default().validate().is_ok());
        let zero = TransferConfig {
            max_workers: 0,
            ..TransferConfig::default()
        };
        assert!(zero.validate().is_err());
    }
}
