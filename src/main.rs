// ABOUTME: Command-line entry point for the site migration orchestrator
// ABOUTME: Wires the file-backed catalog, state store and backups into the engine

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use dialoguer::{theme::ColorfulTheme, Confirm};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use site_migrator::backup::{BackupProvider, FsBackupProvider};
use site_migrator::catalog::Catalog;
use site_migrator::config::{ExecutionMode, OrchestratorConfig, RunOptions};
use site_migrator::diff::{
    CleanupOptions, DiffOptions, EnvironmentDiffAnalyzer, OrphanCleaner, ResourceNaming,
};
use site_migrator::providers::{CommandMigrator, UnitMigrator};
use site_migrator::recovery::{AutomaticPolicy, DecisionProvider, PromptDecision};
use site_migrator::state::{force_unlock, StateStore};
use site_migrator::{logging, Collaborators, MigrationEngine, MigratorError, ResumeMode};

#[derive(Parser)]
#[command(name = "site-migrator")]
#[command(about = "Resumable, batched migration of multi-tenant sites between environments")]
#[command(long_about = None)]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// JSON catalog describing the environments
    #[arg(long, global = true, default_value = "catalog.json")]
    catalog: PathBuf,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Migrate shared resources and every active site from source to target
    Migrate(MigrateArgs),
    /// List sites and tables that exist in targets but not in the source
    Diff {
        #[arg(long)]
        source: String,
        /// Target environments to compare, comma separated
        #[arg(long, value_delimiter = ',', required = true)]
        targets: Vec<String>,
        /// Only report whole orphaned sites
        #[arg(long)]
        sites_only: bool,
    },
    /// Delete orphaned sites (and optionally tables) from a non-production target
    Cleanup {
        #[arg(long)]
        source: String,
        #[arg(long)]
        target: String,
        #[arg(long)]
        sites_only: bool,
        #[arg(long)]
        dry_run: bool,
        /// Skip the per-site backup taken before deletion
        #[arg(long)]
        no_backup: bool,
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// Inspect or purge recorded migration runs
    Runs {
        #[command(subcommand)]
        command: RunsCommand,
    },
    /// Re-check the checksums of a backup
    VerifyBackup { backup_id: String },
    /// Remove a leftover run lease on a target
    Unlock {
        #[arg(long)]
        target: String,
        /// Break the lease even if it is not stale
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum RunsCommand {
    List,
    Show { run_id: String },
    Purge { run_id: String },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    Sequential,
    Concurrent,
}

#[derive(Args)]
struct MigrateArgs {
    #[arg(long)]
    source: String,
    #[arg(long)]
    target: String,
    /// Only these site ids, comma separated
    #[arg(long, value_delimiter = ',')]
    include: Vec<String>,
    /// Never these site ids, comma separated
    #[arg(long, value_delimiter = ',')]
    exclude: Vec<String>,
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    skip_shared: bool,
    /// Back up the target before writing to it
    #[arg(long)]
    backup: bool,
    /// Refuse to start unless the backup succeeds
    #[arg(long)]
    require_backup: bool,
    /// Resume a run: the latest incomplete one, or the given id
    #[arg(long, num_args = 0..=1, default_missing_value = "latest")]
    resume: Option<String>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long, value_enum)]
    mode: Option<Mode>,
    #[arg(long)]
    concurrency: Option<usize>,
    /// Roll back automatically when recovery is triggered
    #[arg(long)]
    auto_rollback: bool,
    /// Ask how to recover when a step fails
    #[arg(long)]
    interactive: bool,
    #[arg(long)]
    no_progress: bool,
    /// Command template for the shared step ({source}, {target})
    #[arg(long, requires = "unit_command")]
    shared_command: Option<String>,
    /// Command template per site ({unit}, {source}, {target})
    #[arg(long, requires = "shared_command")]
    unit_command: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let config = OrchestratorConfig::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Commands::Migrate(args) => migrate(&config, &cli.catalog, args).await,
        Commands::Diff {
            source,
            targets,
            sites_only,
        } => diff(&config, &cli.catalog, &source, &targets, sites_only).await,
        Commands::Cleanup {
            source,
            target,
            sites_only,
            dry_run,
            no_backup,
            yes,
        } => {
            let options = CleanupOptions {
                dry_run,
                sites_only,
                backup_first: config.cleanup.backup_before_delete && !no_backup,
                batch_size: config.cleanup.batch_size,
            };
            cleanup(&config, &cli.catalog, &source, &target, options, yes).await
        }
        Commands::Runs { command } => runs(&config, command),
        Commands::VerifyBackup { backup_id } => {
            verify_backup(&config, &cli.catalog, &backup_id).await
        }
        Commands::Unlock { target, force } => {
            let removed = force_unlock(
                &config.state_dir,
                &target,
                Duration::from_secs(config.lease_stale_secs),
                force,
            )?;
            if removed {
                println!("Removed lease on '{}'", target);
            } else {
                println!("No lease held on '{}'", target);
            }
            Ok(())
        }
    }
}

fn open_catalog(config: &OrchestratorConfig, path: &Path) -> Result<Arc<Catalog>> {
    let catalog =
        Catalog::open(path)?.with_naming(ResourceNaming::new(&config.cleanup.base_prefix));
    Ok(Arc::new(catalog))
}

async fn migrate(
    config: &OrchestratorConfig,
    catalog_path: &Path,
    args: MigrateArgs,
) -> Result<()> {
    let catalog = open_catalog(config, catalog_path)?;
    let store = StateStore::open(&config.state_dir)?;

    let mut options = RunOptions::new(config, &args.source, &args.target);
    options.include_ids = args.include;
    options.exclude_ids = args.exclude;
    options.dry_run = args.dry_run;
    options.skip_shared = args.skip_shared;
    options.backup_before_migrate = args.backup;
    options.require_backup = args.require_backup;
    if let Some(size) = args.batch_size {
        options.batch.batch_size = size;
    }
    if let Some(mode) = args.mode {
        options.batch.mode = match mode {
            Mode::Sequential => ExecutionMode::Sequential,
            Mode::Concurrent => ExecutionMode::Concurrent,
        };
    }
    if let Some(concurrency) = args.concurrency {
        options.batch.concurrency = concurrency;
    }
    options.recovery.auto_rollback |= args.auto_rollback;
    options.recovery.interactive |= args.interactive;
    options.batch.show_progress &= !args.no_progress;

    let migrator: Arc<dyn UnitMigrator> = match (args.shared_command, args.unit_command) {
        (Some(shared), Some(unit)) => Arc::new(CommandMigrator::new(
            shared.split_whitespace().map(String::from).collect(),
            unit.split_whitespace().map(String::from).collect(),
        )),
        _ => catalog.clone(),
    };
    let decisions: Arc<dyn DecisionProvider> = if options.recovery.interactive {
        Arc::new(PromptDecision)
    } else {
        Arc::new(AutomaticPolicy)
    };
    let backups: Arc<dyn BackupProvider> =
        Arc::new(FsBackupProvider::new(&config.backup_dir, catalog.clone()));

    let engine = MigrationEngine::new(
        store,
        Collaborators {
            inventory: catalog.clone(),
            migrator,
            health: catalog.clone(),
            backups: Some(backups),
            decisions,
        },
    );

    let cancel = engine.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, finishing in-flight sites then pausing");
            cancel.cancel();
        }
    });

    let resume = match args.resume.as_deref() {
        None => ResumeMode::Fresh,
        Some("latest") => ResumeMode::Latest,
        Some(id) => ResumeMode::Run(id.to_string()),
    };

    let report = engine.run(options, resume).await?;
    println!("{}", report);
    report.ensure_success()
}

async fn diff(
    config: &OrchestratorConfig,
    catalog_path: &Path,
    source: &str,
    targets: &[String],
    sites_only: bool,
) -> Result<()> {
    let catalog = open_catalog(config, catalog_path)?;
    let analyzer = EnvironmentDiffAnalyzer::new(catalog.clone(), catalog);
    let comparisons = analyzer
        .compare_environments(source, targets, &DiffOptions { sites_only })
        .await?;

    for comparison in &comparisons {
        println!("{} vs {}:", comparison.source, comparison.target);
        if comparison.is_clean() {
            println!("  no orphans");
            continue;
        }
        for orphan in &comparison.orphaned_units {
            println!(
                "  orphaned site {} ({}): {} table(s)",
                orphan.unit.id,
                orphan.unit.domain,
                orphan.resources.len()
            );
        }
        for group in &comparison.orphaned_resources {
            println!(
                "  site {} has {} extra table(s): {}",
                group.unit_id,
                group.resources.len(),
                group.resources.join(", ")
            );
        }
        println!(
            "  {} orphaned table(s) in total",
            comparison.total_orphaned_resources
        );
    }
    Ok(())
}

async fn cleanup(
    config: &OrchestratorConfig,
    catalog_path: &Path,
    source: &str,
    target: &str,
    options: CleanupOptions,
    assume_yes: bool,
) -> Result<()> {
    let catalog = open_catalog(config, catalog_path)?;
    let analyzer = EnvironmentDiffAnalyzer::new(catalog.clone(), catalog.clone());
    let comparison = analyzer
        .compare_environments(
            source,
            &[target.to_string()],
            &DiffOptions {
                sites_only: options.sites_only,
            },
        )
        .await?
        .into_iter()
        .next()
        .context("Source and target are the same environment")?;

    if comparison.is_clean() {
        println!("Nothing to clean up in '{}'", target);
        return Ok(());
    }

    if !options.dry_run && !assume_yes {
        let prompt = format!(
            "Delete {} orphaned site(s) and {} table(s) from '{}'?",
            comparison.orphaned_units.len(),
            comparison.total_orphaned_resources,
            target
        );
        let confirmed = Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(prompt)
            .default(false)
            .interact()
            .context("Failed to read confirmation")?;
        if !confirmed {
            bail!("Cleanup cancelled");
        }
    }

    let backups: Arc<dyn BackupProvider> =
        Arc::new(FsBackupProvider::new(&config.backup_dir, catalog.clone()));
    let cleaner = OrphanCleaner::new(catalog, Some(backups), analyzer.cache(), options);
    let report = cleaner.cleanup_orphaned_tables(&comparison).await?;

    if report.dry_run {
        println!("[dry run] Would drop {} table(s):", report.planned.len());
        for name in &report.planned {
            println!("  {}", name);
        }
        return Ok(());
    }
    println!(
        "Deleted {} site(s), dropped {} table(s) from '{}'",
        report.deleted_units.len(),
        report.dropped_resources.len(),
        target
    );
    for backup in &report.backups {
        println!("  backup {}", backup);
    }
    for (name, err) in &report.failed {
        println!("  FAILED {}: {}", name, err);
    }
    if !report.failed.is_empty() {
        bail!("{} table(s) could not be dropped", report.failed.len());
    }
    Ok(())
}

fn runs(config: &OrchestratorConfig, command: RunsCommand) -> Result<()> {
    let store = StateStore::open(&config.state_dir)?;
    match command {
        RunsCommand::List => {
            let summaries = store.list_runs()?;
            if summaries.is_empty() {
                println!("No migration runs recorded in {}", store.root().display());
            }
            for summary in summaries {
                println!("{}", summary);
            }
        }
        RunsCommand::Show { run_id } => {
            let run = store
                .load_run(&run_id)?
                .ok_or_else(|| MigratorError::Validation(format!("run '{}' not found", run_id)))?;
            println!("{}", run.summary());
            println!("  shared resources done: {}", run.shared_resources_done);
            if let Some(backup) = &run.backup_id {
                println!("  backup: {}", backup);
            }
            if run.rolled_back {
                println!("  rolled back");
            }
            for (id, record) in &run.failed {
                println!(
                    "  failed site {} ({} attempt(s), {}): {}",
                    id, record.attempts, record.kind, record.error
                );
            }
            if !run.skipped.is_empty() {
                let skipped: Vec<&str> = run.skipped.iter().map(String::as_str).collect();
                println!("  skipped: {}", skipped.join(", "));
            }
        }
        RunsCommand::Purge { run_id } => {
            if store.purge_run(&run_id)? {
                println!("Purged run {}", run_id);
            } else {
                println!("No run {} to purge", run_id);
            }
        }
    }
    Ok(())
}

async fn verify_backup(
    config: &OrchestratorConfig,
    catalog_path: &Path,
    backup_id: &str,
) -> Result<()> {
    let catalog = open_catalog(config, catalog_path)?;
    let provider = FsBackupProvider::new(&config.backup_dir, catalog);
    let record = provider
        .load_backup(backup_id)
        .await?
        .ok_or_else(|| MigratorError::Validation(format!("backup '{}' not found", backup_id)))?;

    let report = provider.verify_integrity(&record).await;
    if report.is_valid() {
        println!(
            "Backup {} is intact ({} artifact(s), {} bytes)",
            record.id,
            record.artifacts.len(),
            record.total_size
        );
        return Ok(());
    }
    for error in &report.errors {
        println!("  {}", error);
    }
    Err(MigratorError::Integrity(format!(
        "backup {} failed verification with {} error(s)",
        backup_id,
        report.errors.len()
    ))
    .into())
}
