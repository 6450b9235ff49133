//! vpsctl - Entry Point
//!
//! Deploys a Node.js + PostgreSQL web application onto a single VPS and
//! keeps it healthy: PM2 supervises the process, nginx fronts it.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::{error, info};

use vpsctl::app::inspect;
use vpsctl::app::options::{RunMode, RunOptions, TargetOverrides};
use vpsctl::app::run::{print_report, run};
use vpsctl::deploy::credentials::CredentialMode;
use vpsctl::errors::DeployError;
use vpsctl::host::system::SystemHost;
use vpsctl::logs::{init_logging, LogLevel, LogOptions};
use vpsctl::storage::layout::StorageLayout;
use vpsctl::storage::settings::{Settings, DEFAULT_SETTINGS_PATH};
use vpsctl::utils::version_info;

#[derive(Parser)]
#[command(name = "vpsctl")]
#[command(about = "Idempotent single-host deployment for a Node.js + PostgreSQL application", long_about = None)]
struct Cli {
    /// Settings file
    #[arg(long, global = true, env = "VPSCTL_CONFIG", default_value = DEFAULT_SETTINGS_PATH)]
    config: PathBuf,

    /// Application name (PM2 process and nginx site)
    #[arg(long, global = true, env = "VPSCTL_APP_NAME")]
    app_name: Option<String>,

    /// Installation directory
    #[arg(long, global = true, env = "VPSCTL_INSTALL_DIR")]
    install_dir: Option<PathBuf>,

    /// Port the application binds
    #[arg(long, global = true, env = "VPSCTL_APP_PORT")]
    app_port: Option<u16>,

    /// Port nginx listens on
    #[arg(long, global = true, env = "VPSCTL_PUBLIC_PORT")]
    public_port: Option<u16>,

    /// nginx server_name (`_` for any host)
    #[arg(long, global = true, env = "VPSCTL_DOMAIN")]
    domain: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the full deployment pipeline
    Deploy {
        /// Reuse credentials from the installed .env instead of generating new ones
        #[arg(long)]
        preserve_credentials: bool,
    },
    /// Show supervisor, proxy and database health (read-only)
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Tail process and proxy logs (read-only)
    Logs {
        /// Lines per log
        #[arg(long, short = 'n', default_value_t = 100)]
        lines: usize,
    },
    /// Restart the supervised process
    Restart,
    /// Recover a partially working deployment
    Fix {
        /// Regenerate credentials and reset the database even if it is reachable
        #[arg(long)]
        reset: bool,
    },
    /// Print version information
    Version,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let code = run_cli(Cli::parse()).await;
    std::process::exit(code);
}

async fn run_cli(cli: Cli) -> i32 {
    if let Command::Version = cli.command {
        match serde_json::to_string_pretty(&version_info()) {
            Ok(text) => println!("{}", text),
            Err(e) => eprintln!("{}", e),
        }
        return 0;
    }

    let settings = match load_settings(&cli.config).await {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{} {}", "✗".red().bold(), e);
            return e.exit_code();
        }
    };
    let overrides = TargetOverrides {
        app_name: cli.app_name.clone(),
        install_dir: cli.install_dir.clone(),
        app_port: cli.app_port,
        public_port: cli.public_port,
        domain: cli.domain.clone(),
    };
    let target = overrides.resolve(&settings);
    if let Err(e) = target.validate() {
        eprintln!("{} {}", "✗".red().bold(), e);
        return e.exit_code();
    }

    let run_options = match &cli.command {
        Command::Deploy {
            preserve_credentials,
        } => Some(RunOptions {
            mode: RunMode::Deploy {
                credentials: if *preserve_credentials {
                    CredentialMode::Preserve
                } else {
                    CredentialMode::Fresh
                },
            },
            ..Default::default()
        }),
        Command::Fix { reset } => Some(RunOptions {
            mode: RunMode::Fix {
                force_reset: *reset,
            },
            ..Default::default()
        }),
        _ => None,
    };

    // Read-only commands keep the terminal quiet unless asked otherwise.
    let layout = StorageLayout::new(&target, &settings);
    let log_options = LogOptions {
        log_level: if run_options.is_some() {
            settings.log_level.clone()
        } else {
            LogLevel::Warn
        },
        log_file: run_options
            .as_ref()
            .filter(|o| o.log_to_file)
            .map(|_| layout.log_dir.join("vpsctl.log")),
        json_format: settings.json_logs,
        ..Default::default()
    };
    let _guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        }
    };

    let host = SystemHost::new();
    let outcome = match cli.command {
        Command::Deploy { .. } | Command::Fix { .. } => {
            let Some(options) = run_options else {
                return 1;
            };
            info!("vpsctl {}", version_info().version);
            let mut report = run(&host, &settings, &target, &options, await_shutdown_signal()).await;
            print_report(&mut report);
            return report.exit_code();
        }
        Command::Status { json } => inspect::status(&host, &settings, &target, json)
            .await
            .map(|healthy| if healthy { 0 } else { 1 }),
        Command::Logs { lines } => inspect::logs(&host, &settings, &target, lines)
            .await
            .map(|_| 0),
        Command::Restart => inspect::restart(&host, &target).await.map(|_| 0),
        Command::Version => Ok(0),
    };

    match outcome {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            eprintln!("{} {}", "✗".red().bold(), e);
            e.exit_code()
        }
    }
}

async fn load_settings(path: &std::path::Path) -> Result<Settings, DeployError> {
    let settings = Settings::load(path).await?;
    settings.validate()?;
    Ok(settings)
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (Ok(mut sigterm), Ok(mut sigint)) = (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) else {
            // Signal handlers unavailable; Ctrl-C only.
            let _ = tokio::signal::ctrl_c().await;
            return;
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, aborting...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, aborting...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Ctrl+C received, aborting...");
    }
}
