use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};

use autoupdated::config::Config;
use autoupdated::daemon::Daemon;
use autoupdated::observability::ObservabilityGuard;
use autoupdated::self_update::{SelfUpdateOutcome, SelfUpdater};
use autoupdated::sources;
use autoupdated::status::StatusReporter;
use autoupdated::verifier::Verifier;

#[derive(Parser, Debug)]
#[command(name = "autoupdated")]
#[command(about = "Unattended self-healing updater daemon", long_about = None)]
struct Cli {
    /// Config file (defaults to AUTOUPDATED_CONFIG, then ./config.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply a pending self-update, then check for updates until interrupted.
    Run,
    /// Run a single check cycle and print its result.
    CheckOnce,
    /// Print the current status document.
    Status,
    /// Validate config and show resolved paths.
    Doctor,
    /// Apply a pending self-update of the daemon and exit.
    SelfUpdate,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Doctor => {
            let report = config.doctor_report();
            println!("autoupdated doctor");
            println!("install_root: {}", report.install_root.display());
            println!("deploy_dir: {}", report.deploy_dir.display());
            println!("staging_dir: {}", report.staging_dir.display());
            println!("backup_dir: {}", report.backup_dir.display());
            println!("status_file: {}", report.status_file.display());
            println!("env_file: {}", report.env_file.display());
            println!("controller: {}", report.controller);
            println!(
                "sources: {}",
                if report.enabled_sources.is_empty() {
                    "<none>".to_string()
                } else {
                    report.enabled_sources.join(", ")
                }
            );
            println!(
                "pinned_version: {}",
                report.pinned_version.unwrap_or_else(|| "<unset>".to_string())
            );
            println!("allow_downgrade: {}", report.allow_downgrade);
            println!("backups_enabled: {}", report.backups_enabled);
            println!("require_hash: {}", report.require_hash);
            println!("require_signature: {}", report.require_signature);
            println!("check_interval_ms: {}", report.check_interval_ms);
            println!("self_update_enabled: {}", report.self_update_enabled);
            if report.warnings.is_empty() {
                println!("status: ok");
            } else {
                println!("status: warning");
                for warning in report.warnings {
                    println!("- {}", warning);
                }
            }
        }
        Commands::Status => {
            let document = StatusReporter::new(config.status_file()).load()?;
            println!("{}", serde_json::to_string_pretty(&document)?);
        }
        Commands::CheckOnce => {
            let _guard = ObservabilityGuard::init(&config.logging)?;
            let mut daemon = Daemon::from_config(&config)?;
            let report = daemon.run_cycle();
            println!("result: {}", report.result);
            if let Some(candidate) = report.candidate {
                println!("candidate: {} ({})", candidate.version, candidate.source);
            }
            if let Some(error) = report.error {
                println!("error: {}", error);
            }
        }
        Commands::SelfUpdate => {
            let _guard = ObservabilityGuard::init(&config.logging)?;
            let outcome = if config.self_update.enabled {
                self_updater(&config)?.run()?
            } else {
                SelfUpdateOutcome::Disabled
            };
            println!("self_update: {:?}", outcome);
        }
        Commands::Run => {
            let _guard = ObservabilityGuard::init(&config.logging)?;
            if config.self_update.enabled {
                match self_updater(&config) {
                    Ok(updater) => {
                        updater.check_and_apply();
                    }
                    Err(err) => tracing::error!(error = %format!("{:#}", err), "self-update unavailable"),
                }
            }

            let shutdown = Arc::new(AtomicBool::new(false));
            let signal_flag = Arc::clone(&shutdown);
            ctrlc::set_handler(move || {
                signal_flag.store(true, Ordering::SeqCst);
                tracing::info!("interrupt received, stopping after current cycle");
            })?;

            let mut daemon = Daemon::from_config(&config)?;
            daemon.run_forever(&shutdown);
        }
    }

    Ok(())
}

fn self_updater(config: &Config) -> Result<SelfUpdater> {
    let verifier = Verifier::from_config(&config.security)?;
    let agent = sources::http_agent(Duration::from_millis(
        config.network.request_timeout_ms.max(1),
    ));
    SelfUpdater::from_config(config, verifier, agent)
}
