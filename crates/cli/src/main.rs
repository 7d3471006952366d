use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use pg_backup_cli::config::{self, Config, Settings};
use pg_backup_cli::output::{render_info, render_listing};
use pg_backup_cli::{BackupManager, RestoreOptions, RestorePlan};
use pg_backup_core::{exit_code_for, format_size, BackupError, BackupFormat, RetentionPolicy};
use pg_backup_tools::cron::{self, CronEntry, DEFAULT_SCHEDULE};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pg-backup", version, about = "PostgreSQL backup and restore")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new backup
    Create {
        /// Label added to the file name, e.g. before_migration
        #[arg(short, long)]
        name: Option<String>,

        /// sql, custom (or dump), directory or tar
        #[arg(short, long)]
        format: Option<BackupFormat>,
    },

    /// List backups, newest first
    List,

    /// Restore the database from a backup
    Restore {
        /// Backup path, or a file name inside the backup directory
        path: PathBuf,

        /// Skip the confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,

        /// Drop and recreate the database first
        #[arg(short, long)]
        drop: bool,

        /// Skip checksum verification
        #[arg(long)]
        no_verify: bool,
    },

    /// Check a backup against its stored checksum
    Verify { path: PathBuf },

    /// Delete backups outside the retention window
    Cleanup {
        /// Override the configured retention, e.g. "14days"
        #[arg(long, value_parser = humantime::parse_duration)]
        older_than: Option<Duration>,
    },

    /// Show configuration and backup statistics
    Info,

    /// Create, verify and clean up in one go (for schedulers)
    Run,

    /// Print or install a crontab entry for `run`
    Cron {
        #[arg(long, default_value = DEFAULT_SCHEDULE)]
        schedule: String,

        /// Append output of scheduled runs to this file
        #[arg(long)]
        log: Option<PathBuf>,

        /// Add the entry to the current user's crontab
        #[arg(long)]
        install: bool,
    },
}

fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let cfg = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => Config::default(),
    };
    init_tracing(cli.verbose || cfg.backup.verbose.unwrap_or(false));
    if let Some(path) = &cli.config {
        debug!(?path, "loaded config file");
    }
    let settings = Settings::from_env(cfg)?;

    let manager = BackupManager::new(settings)?;
    match cli.command {
        Commands::Create { name, format } => {
            let artifact = manager.create(name.as_deref(), format)?;
            println!("Backup created: {}", artifact.path.display());
            println!("Size:           {}", format_size(artifact.metadata.size_bytes));
            println!("Checksum:       {}", artifact.metadata.checksum);
        }
        Commands::List => {
            print!("{}", render_listing(&manager.list()?));
        }
        Commands::Restore {
            path,
            yes,
            drop,
            no_verify,
        } => {
            let opts = RestoreOptions {
                drop_and_recreate: drop,
                verify_first: !no_verify,
            };
            let restored = manager.restore(&path, opts, |plan| yes || confirm(plan))?;
            println!("Database restored from {}", restored.display());
        }
        Commands::Verify { path } => {
            let report = manager.check(&path)?;
            let shown = report.path.clone();
            report.ensure_valid()?;
            println!("Backup is valid: {}", shown.display());
        }
        Commands::Cleanup { older_than } => {
            let policy = match older_than {
                Some(d) => {
                    let max_age = chrono::Duration::from_std(d).map_err(|_| {
                        BackupError::config(format!(
                            "retention {} is too large",
                            humantime::format_duration(d)
                        ))
                    })?;
                    RetentionPolicy::MaxAge(max_age)
                }
                None => manager.settings().retention,
            };
            let report = manager.cleanup_with(&policy, Utc::now())?;
            if report.count() == 0 {
                println!("No old backups to delete");
            } else {
                for name in &report.removed {
                    println!("Deleted {name}");
                }
                println!("Deleted {} old backup(s)", report.count());
            }
        }
        Commands::Info => {
            let info = manager.info()?;
            print!("{}", render_info(manager.settings(), &info));
        }
        Commands::Run => {
            let outcome = manager.run_scheduled()?;
            println!("Backup created:  {}", outcome.artifact.path.display());
            println!("Old backups removed: {}", outcome.cleanup.count());
            println!(
                "Total backups:   {} ({})",
                outcome.info.count,
                format_size(outcome.info.total_bytes)
            );
        }
        Commands::Cron {
            schedule,
            log,
            install,
        } => {
            cron_command(manager.settings(), cli.config.as_ref(), &schedule, log, install)?;
        }
    }
    Ok(())
}

fn confirm(plan: &RestorePlan) -> bool {
    eprintln!("WARNING: this will overwrite database {:?}", plan.database);
    eprintln!("Backup: {}", plan.source.display());
    if plan.drop_and_recreate {
        eprintln!("The database will be dropped and recreated first.");
    }
    if !plan.verified {
        eprintln!("Checksum verification is disabled.");
    }
    eprint!("Continue? (yes/no): ");
    let _ = io::stderr().flush();

    let mut answer = String::new();
    if io::stdin().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().to_ascii_lowercase().as_str(), "yes" | "y")
}

fn cron_command(
    settings: &Settings,
    config: Option<&PathBuf>,
    schedule: &str,
    log: Option<PathBuf>,
    install: bool,
) -> Result<()> {
    let executable = std::env::current_exe().context("locate pg-backup executable")?;
    let config = config
        .map(|p| std::fs::canonicalize(p).with_context(|| format!("resolve {}", p.display())))
        .transpose()?;
    let entry = CronEntry::new(schedule, executable)?
        .with_config(config)
        .with_log(log);

    println!("{}", entry.line());
    if install {
        if cron::install(&settings.tools.crontab, &entry)? {
            println!("Installed into crontab");
        } else {
            println!("Already present in crontab");
        }
    }
    Ok(())
}
