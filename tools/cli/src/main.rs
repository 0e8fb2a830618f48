//! SkyShard CLI - back up files across several cloud storage accounts.
//!
//! Accounts are connected once with an OAuth authorization code; their
//! refresh tokens are sealed under a passphrase in the local catalog.
//! Backups are spread over the accounts by free space, and restores stream
//! indexed files back into a single ZIP archive.

mod config;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use zeroize::Zeroizing;

use skyshard_accounts::AccountRegistry;
use skyshard_archive::ArchiveComposer;
use skyshard_catalog::{FileQuery, SqliteCatalog};
use skyshard_common::{AccountId, Error, FileDescriptor, JobId, TransferJob};
use skyshard_crypto::CredentialVault;
use skyshard_storage::gdrive::{DriveSettings, GoogleAuth, PROVIDER_NAME};
use skyshard_storage::create_default_registry;
use skyshard_transfer::{plan, TransferCoordinator, TransferEvent, UploadItem};

use crate::config::AppConfig;

#[derive(Parser)]
#[command(name = "skyshard")]
#[command(about = "SkyShard - one backup target made of many cloud accounts")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (default: platform config dir).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the configuration file.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Manage connected accounts.
    Accounts {
        #[command(subcommand)]
        action: AccountAction,
    },

    /// Rebuild the file index of an account from its remote listing.
    Index {
        /// Account to index (default: all).
        account: Option<String>,
    },

    /// Show where a backup would place each file, without uploading.
    Plan {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Upload files, spreading them over the accounts.
    Backup {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Upload one file to a chosen account.
    Upload {
        #[arg(short, long)]
        account: String,

        path: PathBuf,
    },

    /// List transfer jobs.
    Jobs,

    /// Resume a paused or interrupted job.
    Resume { job: String },

    /// Run a failed job again.
    Retry { job: String },

    /// Download indexed files into a ZIP archive.
    Restore {
        /// Archive to write.
        #[arg(short, long)]
        out: PathBuf,

        /// Only files of this account.
        #[arg(short, long)]
        account: Option<String>,

        /// Only files whose name starts with this prefix.
        #[arg(short, long)]
        prefix: Option<String>,
    },

    /// Manage the credential passphrase.
    Passphrase {
        #[command(subcommand)]
        action: PassphraseAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a configuration file with default settings.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration.
    Show,
}

#[derive(Subcommand)]
enum AccountAction {
    /// Print the URL that authorizes a new account.
    AuthUrl {
        /// Open the URL in the default browser.
        #[arg(long)]
        open: bool,
    },
    /// Connect an account with the code returned after authorization.
    Add {
        #[arg(long)]
        code: String,

        /// Drive folder that receives uploads.
        #[arg(long)]
        folder: Option<String>,
    },
    /// List connected accounts with their free space.
    List,
    /// Disconnect an account. Remote files are left in place.
    Remove { account: String },
    /// Read current quota from the remote.
    Refresh {
        /// Account to refresh (default: all).
        account: Option<String>,
    },
}

#[derive(Subcommand)]
enum PassphraseAction {
    /// Reseal every credential under a new passphrase.
    Change,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config_path = match cli.config {
        Some(path) => path,
        None => AppConfig::default_path()?,
    };

    let app = || App::open(&config_path);
    match cli.command {
        Commands::Config { action } => match action {
            ConfigAction::Init { force } => cmd_config_init(&config_path, force),
            ConfigAction::Show => cmd_config_show(&config_path),
        },
        Commands::Accounts { action } => {
            let app = app()?;
            match action {
                AccountAction::AuthUrl { open } => app.cmd_auth_url(open),
                AccountAction::Add { code, folder } => app.cmd_add_account(&code, folder).await,
                AccountAction::List => app.cmd_list_accounts(),
                AccountAction::Remove { account } => app.cmd_remove_account(&account),
                AccountAction::Refresh { account } => app.cmd_refresh(account.as_deref()).await,
            }
        }
        Commands::Index { account } => app()?.cmd_index(account.as_deref()).await,
        Commands::Plan { paths } => app()?.cmd_plan(&paths).await,
        Commands::Backup { paths } => app()?.cmd_backup(&paths).await,
        Commands::Upload { account, path } => app()?.cmd_upload(&account, &path).await,
        Commands::Jobs => app()?.cmd_jobs(),
        Commands::Resume { job } => app()?.cmd_resume(&job).await,
        Commands::Retry { job } => app()?.cmd_retry(&job).await,
        Commands::Restore {
            out,
            account,
            prefix,
        } => app()?.cmd_restore(&out, account.as_deref(), prefix).await,
        Commands::Passphrase {
            action: PassphraseAction::Change,
        } => app()?.cmd_change_passphrase().await,
    }
}

/// Prompt for a passphrase without echo.
fn prompt_passphrase(prompt: &str) -> Result<Zeroizing<String>> {
    let passphrase = rpassword::prompt_password(prompt).context("Failed to read passphrase")?;
    Ok(Zeroizing::new(passphrase))
}

fn parse_account(id: &str) -> Result<AccountId> {
    AccountId::new(id).with_context(|| format!("Invalid account id '{}'", id))
}

fn parse_job(id: &str) -> Result<JobId> {
    JobId::parse(id).with_context(|| format!("Invalid job id '{}'", id))
}

fn human(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Regular files under `paths`, directories walked recursively.
fn collect_files(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending: Vec<PathBuf> = paths.iter().rev().cloned().collect();
    while let Some(path) = pending.pop() {
        let meta = std::fs::metadata(&path)
            .with_context(|| format!("Cannot read {}", path.display()))?;
        if meta.is_dir() {
            let mut children: Vec<PathBuf> = std::fs::read_dir(&path)
                .with_context(|| format!("Cannot list {}", path.display()))?
                .map(|entry| entry.map(|e| e.path()))
                .collect::<std::io::Result<_>>()?;
            children.sort();
            pending.extend(children.into_iter().rev());
        } else if meta.is_file() {
            files.push(path);
        }
    }
    Ok(files)
}

async fn upload_items(paths: &[PathBuf]) -> Result<Vec<UploadItem>> {
    let mut items = Vec::new();
    for path in collect_files(paths)? {
        let item = UploadItem::from_path(&path)
            .await
            .with_context(|| format!("Cannot open {}", path.display()))?;
        items.push(item);
    }
    if items.is_empty() {
        bail!("No files to upload");
    }
    Ok(items)
}

fn print_job(job: &TransferJob) {
    let percent = if job.file.size_bytes == 0 {
        100
    } else {
        job.bytes_transferred * 100 / job.file.size_bytes
    };
    println!(
        "  {}  {:<9} {:>3}%  {:<24} {} ({})",
        job.id,
        job.state,
        percent,
        job.account_id,
        job.file.name,
        human(job.file.size_bytes)
    );
    if let Some(error) = &job.error {
        println!("      error: {}", error);
    }
}

fn cmd_config_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    AppConfig::default().save(path)?;
    println!("Configuration written to {}", path.display());
    Ok(())
}

fn cmd_config_show(path: &Path) -> Result<()> {
    let config = AppConfig::load(path)?;
    println!("# {}", path.display());
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

/// Opened catalog, registry and auth for one command.
struct App {
    config: AppConfig,
    accounts: AccountRegistry,
    auth: Arc<GoogleAuth>,
}

impl App {
    fn open(config_path: &Path) -> Result<Self> {
        let config = AppConfig::load(config_path)?;
        let catalog = SqliteCatalog::open(&config.catalog_path).with_context(|| {
            format!("Failed to open catalog {}", config.catalog_path.display())
        })?;
        let auth = Arc::new(GoogleAuth::new(config.auth.clone()).context("Invalid OAuth settings")?);
        let vault = CredentialVault::new(config.kdf_params()?);
        let accounts = AccountRegistry::new(
            Arc::new(catalog),
            auth.clone(),
            Arc::new(create_default_registry()),
            vault,
        );
        Ok(Self {
            config,
            accounts,
            auth,
        })
    }

    /// Ask for the passphrase and unlock the registry.
    async fn unlock(&self) -> Result<()> {
        if self.accounts.list_accounts()?.is_empty() {
            bail!("No accounts connected. Run `skyshard accounts add` first");
        }
        let passphrase = prompt_passphrase("Passphrase: ")?;
        self.accounts
            .unlock(&passphrase)
            .await
            .context("Failed to unlock credentials")
    }

    fn coordinator(&self) -> Result<TransferCoordinator> {
        Ok(TransferCoordinator::new(
            self.accounts.clone(),
            self.config.transfer.clone(),
        )?)
    }

    fn cmd_auth_url(&self, open: bool) -> Result<()> {
        let (url, _csrf) = self.auth.authorization_url();
        println!("Visit this URL and authorize access:\n\n{}\n", url);
        println!("Then run: skyshard accounts add --code <code>");
        if open {
            open::that(&url).context("Failed to open browser")?;
        }
        Ok(())
    }

    async fn cmd_add_account(&self, code: &str, folder: Option<String>) -> Result<()> {
        let first = self.accounts.list_accounts()?.is_empty();
        let passphrase = prompt_passphrase("Passphrase: ")?;
        if first {
            let confirm = prompt_passphrase("Confirm passphrase: ")?;
            if *passphrase != *confirm {
                bail!("Passphrases do not match");
            }
        }

        let settings = serde_json::to_value(DriveSettings { folder_id: folder })?;
        let account = self
            .accounts
            .connect_account(code, &passphrase, PROVIDER_NAME, settings)
            .await
            .context("Failed to connect account")?;

        println!("Connected {} ({})", account.email, account.id);
        println!(
            "  Free: {} of {}",
            human(account.quota.free_bytes()),
            human(account.quota.bytes_total)
        );
        Ok(())
    }

    fn cmd_list_accounts(&self) -> Result<()> {
        let accounts = self.accounts.list_accounts()?;
        if accounts.is_empty() {
            println!("No accounts connected.");
            return Ok(());
        }
        for account in accounts {
            println!(
                "  {:<24} {:<32} {:>10} free of {:>10}  (as of {})",
                account.id,
                account.email,
                human(account.quota.free_bytes()),
                human(account.quota.bytes_total),
                account.quota.taken_at.format("%Y-%m-%d %H:%M")
            );
        }
        Ok(())
    }

    fn cmd_remove_account(&self, id: &str) -> Result<()> {
        let id = parse_account(id)?;
        if self.accounts.remove_account(&id)? {
            println!("Removed {}", id);
        } else {
            println!("No account {}", id);
        }
        Ok(())
    }

    async fn cmd_refresh(&self, id: Option<&str>) -> Result<()> {
        self.unlock().await?;
        let ids = match id {
            Some(id) => vec![parse_account(id)?],
            None => self.accounts.list_accounts()?.into_iter().map(|a| a.id).collect(),
        };
        for id in ids {
            match self.accounts.refresh_quota(&id).await {
                Ok(quota) => println!("  {:<24} {} free", id, human(quota.free_bytes())),
                Err(e) => warn!("Quota refresh of {} failed: {}", id, e),
            }
        }
        Ok(())
    }

    async fn cmd_index(&self, id: Option<&str>) -> Result<()> {
        self.unlock().await?;
        let ids = match id {
            Some(id) => vec![parse_account(id)?],
            None => self.accounts.list_accounts()?.into_iter().map(|a| a.id).collect(),
        };
        for id in ids {
            let count = self
                .accounts
                .refresh_index(&id)
                .await
                .with_context(|| format!("Failed to index {}", id))?;
            println!("  {:<24} {} file(s)", id, count);
        }
        Ok(())
    }

    async fn cmd_plan(&self, paths: &[PathBuf]) -> Result<()> {
        let items = upload_items(paths).await?;
        let files: Vec<FileDescriptor> = items.iter().map(|i| i.descriptor.clone()).collect();
        let plan = plan(&files, &self.accounts.capacities()?);

        for placement in &plan.placements {
            let file = &files[placement.index];
            println!(
                "  {:<24} {} ({})",
                placement.account_id,
                file.name,
                human(file.size_bytes)
            );
        }
        for &index in &plan.unplaced {
            println!("  {:<24} {} ({})", "UNPLACED", files[index].name, human(files[index].size_bytes));
        }
        println!("Free space as of the last refresh; run `skyshard accounts refresh` to update.");
        plan.check(&files)?;
        Ok(())
    }

    /// Print events until the channel closes. Ctrl-C pauses running jobs.
    fn watch(&self, coordinator: &TransferCoordinator) {
        let mut events = coordinator.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => print_event(&event),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Skipped {} progress event(s)", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            let paused = coordinator.cancel_all().await;
            warn!("Interrupted: pausing {} job(s); resume them with `skyshard resume`", paused);

            // A second interrupt stops without waiting for the pause to settle
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted again, exiting");
                std::process::exit(130);
            }
        });
    }

    async fn cmd_backup(&self, paths: &[PathBuf]) -> Result<()> {
        let items = upload_items(paths).await?;
        self.unlock().await?;
        let coordinator = self.coordinator()?;
        self.watch(&coordinator);

        let report = coordinator.backup(items).await.context("Backup failed")?;
        println!(
            "Backup done: {} completed, {} failed, {} paused",
            report.completed(),
            report.failed(),
            report.paused()
        );
        for job in &report.jobs {
            print_job(job);
        }
        for (file, reason) in &report.not_started {
            println!("  not started: {} ({})", file.name, reason);
        }
        report.check_capacity()?;
        if report.failed() > 0 {
            bail!("{} upload(s) failed; retry them with `skyshard retry`", report.failed());
        }
        Ok(())
    }

    async fn cmd_upload(&self, account: &str, path: &Path) -> Result<()> {
        let account = parse_account(account)?;
        let item = UploadItem::from_path(path)
            .await
            .with_context(|| format!("Cannot open {}", path.display()))?;
        self.unlock().await?;
        let coordinator = self.coordinator()?;
        self.watch(&coordinator);

        let job = coordinator.upload_to(&account, item).await?;
        print_job(&job);
        Ok(())
    }

    fn cmd_jobs(&self) -> Result<()> {
        let jobs = self.accounts.catalog().list_transfer_jobs()?;
        if jobs.is_empty() {
            println!("No transfer jobs.");
        }
        for job in &jobs {
            print_job(job);
        }
        Ok(())
    }

    async fn cmd_resume(&self, job: &str) -> Result<()> {
        let id = parse_job(job)?;
        self.unlock().await?;
        let coordinator = self.coordinator()?;
        self.watch(&coordinator);
        let job = coordinator.resume(&id).await.context("Failed to resume")?;
        print_job(&job);
        Ok(())
    }

    async fn cmd_retry(&self, job: &str) -> Result<()> {
        let id = parse_job(job)?;
        self.unlock().await?;
        let coordinator = self.coordinator()?;
        self.watch(&coordinator);
        let job = coordinator.retry(&id).await.context("Failed to retry")?;
        print_job(&job);
        Ok(())
    }

    async fn cmd_restore(
        &self,
        out: &Path,
        account: Option<&str>,
        prefix: Option<String>,
    ) -> Result<()> {
        let mut query = match account {
            Some(id) => FileQuery::account(parse_account(id)?),
            None => FileQuery::default(),
        };
        if let Some(prefix) = prefix {
            query = query.with_prefix(prefix);
        }
        self.unlock().await?;

        let composer = ArchiveComposer::new(self.accounts.clone())
            .with_retry(self.config.transfer.upload.chunk_retry.clone());
        let mut archive = composer.compose_query(&query)?;
        let mut file = tokio::fs::File::create(out)
            .await
            .with_context(|| format!("Failed to create {}", out.display()))?;

        let mut written = 0u64;
        while let Some(piece) = archive.body.next().await {
            let piece = piece.context("Archive stream failed")?;
            file.write_all(&piece).await?;
            written += piece.len() as u64;
        }
        file.flush().await?;

        let report = archive.report.await?;
        info!("Wrote {} to {}", human(written), out.display());
        println!(
            "Restored {} file(s) into {} ({})",
            report.entries.len(),
            out.display(),
            human(written)
        );
        match report.into_result() {
            Ok(_) => Ok(()),
            Err(Error::PartialArchive { failed }) => {
                println!("{} file(s) could not be restored in full:", failed.len());
                for name in failed {
                    println!("  {}", name);
                }
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn cmd_change_passphrase(&self) -> Result<()> {
        let old = prompt_passphrase("Current passphrase: ")?;
        let new = prompt_passphrase("New passphrase: ")?;
        let confirm = prompt_passphrase("Confirm new passphrase: ")?;
        if *new != *confirm {
            bail!("New passphrases do not match");
        }

        let count = self
            .accounts
            .change_passphrase(&old, &new)
            .await
            .context("Failed to change passphrase")?;
        println!("Passphrase changed for {} account(s)", count);
        Ok(())
    }
}

fn print_event(event: &TransferEvent) {
    match event {
        TransferEvent::Queued {
            job_id,
            account_id,
            file_name,
        } => info!("{} queued on {} as {}", file_name, account_id, job_id),
        TransferEvent::Started { job_id, attempt } if *attempt > 1 => {
            info!("{} attempt {}", job_id, attempt)
        }
        TransferEvent::Progress {
            job_id,
            bytes_transferred,
            total_bytes,
        } => info!(
            "{} {} / {}",
            job_id,
            human(*bytes_transferred),
            human(*total_bytes)
        ),
        TransferEvent::Retrying { job_id, retry, error } => {
            warn!("{} retry {}: {}", job_id, retry, error)
        }
        TransferEvent::Deferred {
            file_name,
            account_id,
        } => info!("{} no longer fits on {}, replanning", file_name, account_id),
        TransferEvent::Paused { job_id } => info!("{} paused", job_id),
        TransferEvent::Completed { .. } | TransferEvent::Failed { .. } | TransferEvent::Started { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_human_sizes() {
        assert_eq!(human(512), "512 B");
        assert_eq!(human(1536), "1.5 KiB");
        assert_eq!(human(5 * 1024 * 1024 * 1024), "5.0 GiB");
    }

    #[test]
    fn test_collect_files_walks_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("b.txt"), b"b").unwrap();
        std::fs::write(dir.path().join("sub/a.txt"), b"a").unwrap();

        let files = collect_files(&[dir.path().to_path_buf()]).unwrap();
        assert_eq!(
            files,
            vec![dir.path().join("b.txt"), dir.path().join("sub/a.txt")]
        );
        assert!(collect_files(&[dir.path().join("missing")]).is_err());
    }

    #[test]
    fn test_cli_parses_commands() {
        let cli = Cli::try_parse_from(["skyshard", "upload", "--account", "acct-1", "disk.img"]).unwrap();
        assert!(matches!(cli.command, Commands::Upload { ref account, .. } if account == "acct-1"));

        let cli = Cli::try_parse_from(["skyshard", "restore", "--out", "all.zip", "--prefix", "docs/"])
            .unwrap();
        assert!(matches!(cli.command, Commands::Restore { prefix: Some(_), account: None, .. }));

        assert!(Cli::try_parse_from(["skyshard", "backup"]).is_err());
    }
}
