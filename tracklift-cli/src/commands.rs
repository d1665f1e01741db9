use std::path::Path;
use std::sync::Arc;

use keyvault::{ContentKey, FileVault, KeyId, MemoryVault, SqliteVault, Vault, Vaults};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracklift_engine::{
    CdmRegistry, FileSink, JobReport, JobRunner, KeyExport, KeyReport, OutputSink,
};

use crate::cli::{DownloadArgs, VaultArgs, VaultCommand};
use crate::config::AppConfig;
use crate::error::{AppError, Result};
use crate::job::{JobDocument, output_path};
use crate::progress::{ProgressReporter, spawn_key_printer};

/// Name of the vault holding keys passed with `--key`.
const CLI_VAULT: &str = "command-line";

pub struct CommandExecutor {
    config: AppConfig,
    quiet: bool,
}

impl CommandExecutor {
    pub fn new(config: AppConfig, quiet: bool) -> Self {
        Self { config, quiet }
    }

    /// Runs a job document. Returns `false` when any track failed.
    pub async fn download(mut self, args: DownloadArgs) -> Result<bool> {
        self.config.apply_download_args(&args);
        let engine = self.config.engine_config()?;
        let job = JobDocument::load(&args.job).await?;
        info!(
            job = %args.job.display(),
            tracks = job.tracks.len(),
            "Loaded job"
        );

        let mut vaults = Vaults::new();
        if !args.keys.is_empty() {
            vaults.push(Arc::new(seed_vault(&args.keys, &job).await?));
        }
        for vault in open_vaults(&self.config).await? {
            vaults.push(vault);
        }

        let runner = JobRunner::with_http(engine, vaults, CdmRegistry::with_builtin())?;
        install_interrupt_handler(runner.cancellation_token());

        let success = if args.license_only {
            let reports = runner.resolve_keys(job.tracks).await;
            print_key_reports(&reports);
            if let Some(path) = &args.export_keys {
                let mut export = KeyExport::load(path).await?;
                for report in &reports {
                    if let Ok(keys) = &report.result {
                        export.add(&report.track_id, keys.iter().map(|k| &k.key));
                    }
                }
                save_export(&export, path).await?;
            }
            reports.iter().all(|r| r.result.is_ok())
        } else {
            let mut reporter = ProgressReporter::new(self.quiet);
            let key_printer = spawn_key_printer(runner.subscribe(), reporter.printer());
            let mut tasks = Vec::with_capacity(job.tracks.len());
            for track in job.tracks {
                let path = output_path(&self.config.output_dir, &track);
                let pipeline = runner.prepare(track);
                reporter.add(&pipeline.track().id, pipeline.progress());
                let sink = FileSink::create(&path).await?;
                tasks.push((pipeline, Box::new(sink) as Box<dyn OutputSink>));
            }

            let refresh_token = CancellationToken::new();
            let refresher = reporter.spawn(refresh_token.clone());
            let report = runner.run(tasks).await;
            refresh_token.cancel();
            let _ = refresher.await;
            key_printer.abort();

            print_job_report(&report, &self.config);
            if let Some(path) = &args.export_keys {
                let mut export = KeyExport::load(path).await?;
                for track in &report.tracks {
                    export.add(&track.track_id, track.keys.iter().map(|k| &k.key));
                }
                save_export(&export, path).await?;
            }
            report.all_completed()
        };
        Ok(success)
    }

    pub async fn vault(self, command: VaultCommand, store: VaultArgs) -> Result<()> {
        let mut config = self.config;
        if store.vault_file.is_some() {
            config.vault_file = store.vault_file;
        }
        if store.vault_db.is_some() {
            config.vault_db = store.vault_db;
        }

        let opened = open_vaults(&config).await?;
        if opened.is_empty() {
            return Err(AppError::InvalidInput(
                "no vault configured, pass --vault-file or --vault-db".into(),
            ));
        }
        let mut vaults = Vaults::new();
        for vault in opened {
            vaults.push(vault);
        }

        match command {
            VaultCommand::Get { kid, scope } => {
                let kid: KeyId = kid.parse()?;
                match vaults.get_key(&scope, &kid).await? {
                    Some(found) => println!("{}:{}  ({})", kid, found.key.key_hex(), found.vault),
                    None => {
                        return Err(AppError::InvalidInput(format!(
                            "no key stored for {kid} in scope `{scope}`"
                        )));
                    }
                }
            }
            VaultCommand::Add { pair, scope } => {
                let key = ContentKey::parse_pair(&pair)?;
                let written = vaults.add_key(&scope, &key).await?;
                println!("Stored {} in {written} vault(s)", key.kid());
            }
            VaultCommand::List { scope } => {
                for vault in vaults.iter() {
                    for key in vault.list(&scope).await? {
                        println!("{}:{}  ({})", key.kid(), key.key_hex(), vault.name());
                    }
                }
            }
        }
        Ok(())
    }
}

async fn open_vaults(config: &AppConfig) -> Result<Vec<Arc<dyn Vault>>> {
    let mut vaults: Vec<Arc<dyn Vault>> = Vec::new();
    if let Some(path) = &config.vault_file {
        vaults.push(Arc::new(FileVault::open(path.clone()).await?));
    }
    if let Some(path) = &config.vault_db {
        let url = format!("sqlite:{}", path.display());
        vaults.push(Arc::new(SqliteVault::connect(&url).await?));
    }
    Ok(vaults)
}

/// `--key` pairs carry no DRM system, so they are offered under every
/// system the job uses.
async fn seed_vault(pairs: &[String], job: &JobDocument) -> Result<MemoryVault> {
    let vault = MemoryVault::new(CLI_VAULT);
    let scopes = job.scopes();
    for pair in pairs {
        let key = ContentKey::parse_pair(pair)?;
        for scope in &scopes {
            vault.put(scope, &key).await?;
        }
    }
    Ok(vault)
}

fn install_interrupt_handler(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling job");
            token.cancel();
        }
    });
}

async fn save_export(export: &KeyExport, path: &Path) -> Result<()> {
    export.save(path).await?;
    info!(path = %path.display(), keys = export.key_count(), "Exported keys");
    Ok(())
}

fn print_key_reports(reports: &[KeyReport]) {
    for report in reports {
        match &report.result {
            Ok(keys) if keys.is_empty() => println!("{}: not encrypted", report.track_id),
            Ok(keys) => {
                for key in keys {
                    println!(
                        "{}: {}:{} ({})",
                        report.track_id,
                        key.key.kid(),
                        key.key.key_hex(),
                        key.source
                    );
                }
            }
            Err(e) => {
                error!(track = %report.track_id, error = %e, "Key resolution failed");
                println!("{}: failed: {e}", report.track_id);
            }
        }
    }
}

fn print_job_report(report: &JobReport, config: &AppConfig) {
    println!();
    for track in &report.tracks {
        let progress = &track.progress;
        match &track.error {
            None => println!(
                "{:<16} {:<9} {}  {}/{} segments, {} bytes -> {}",
                track.track_id,
                track.kind.to_string(),
                track.state,
                progress.decrypted,
                progress.total,
                progress.bytes_written,
                config.output_dir.display()
            ),
            Some(reason) => println!(
                "{:<16} {:<9} {}  {}/{} segments: {reason}",
                track.track_id,
                track.kind.to_string(),
                track.state,
                progress.decrypted,
                progress.total
            ),
        }
    }
    let failed = report.failed().count();
    if failed > 0 {
        println!("{failed} of {} track(s) failed", report.tracks.len());
    } else {
        println!("All {} track(s) completed", report.tracks.len());
    }
}
