//! Command-line surface of the `simhost` binary.
use std::{path::PathBuf, time::Duration};

use clap::{ArgAction, Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use crate::config::{Config, DEFAULT_CONFIG_PATH};
use crate::error::CommandError;
use crate::fetch::HttpFetcher;
use crate::installer::Installer;
use crate::supervisor::{StartOutcome, Supervisor};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, name = "simhost", bin_name = "simhost")]
#[command(propagate_version = true)]
pub struct CliArgs {
    /// Path to the TOML config file.
    #[arg(long, short, global = true, env = "SIMHOST_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Cancel long-running work (download, extraction, readiness) after this many seconds.
    #[arg(long, global = true)]
    pub deadline_secs: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Download and unpack the artifact unless this version is already installed.
    Install,
    /// Launch the simulator unless an instance is already running.
    Start,
    /// Stop every running instance (SIGTERM, then SIGKILL after the grace period).
    Stop {
        #[arg(long)]
        grace_secs: Option<u64>,
    },
    /// Stop, then start again.
    Restart {
        #[arg(long)]
        grace_secs: Option<u64>,
    },
    /// Print installation and process status.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Install if needed, then start.
    Up,
}

impl Command {
    pub async fn run(
        &self,
        config: &Config,
        cancel: &CancellationToken,
    ) -> Result<(), CommandError> {
        let grace = |secs: &Option<u64>| {
            secs.map(Duration::from_secs)
                .unwrap_or(config.supervisor.stop_grace)
        };

        match self {
            Command::Install => install(config, cancel).await,
            Command::Start => start(config, cancel).await,
            Command::Stop { grace_secs } => {
                let mut sup = Supervisor::new(config.supervisor);
                sup.stop(&config.process, grace(grace_secs)).await?;
                Ok(())
            }
            Command::Restart { grace_secs } => {
                ensure_installed(config)?;
                let mut sup = Supervisor::new(config.supervisor);
                let out = sup
                    .restart(&config.process, grace(grace_secs), cancel)
                    .await?;
                report_start(&config.process.name, &out);
                Ok(())
            }
            Command::Status { json } => status(config, *json),
            Command::Up => {
                install(config, cancel).await?;
                start(config, cancel).await
            }
        }
    }
}

async fn install(config: &Config, cancel: &CancellationToken) -> Result<(), CommandError> {
    let fetcher = HttpFetcher::new().map_err(CommandError::Setup)?;
    let installer = Installer::new(fetcher, config.installer);
    let state = installer.ensure(&config.artifact, cancel).await?;
    println!(
        "installed {} at {} (downloaded={}, extractions={}, hoisted={})",
        config.artifact.version,
        state.install_dir.display(),
        state.actions.downloaded,
        state.actions.extractions,
        state.actions.hoisted,
    );
    Ok(())
}

fn ensure_installed(config: &Config) -> Result<(), CommandError> {
    if Installer::<HttpFetcher>::query(&config.artifact).installed {
        return Ok(());
    }
    Err(CommandError::NotInstalled {
        version: config.artifact.version.clone(),
        install_dir: config.artifact.install_dir.clone(),
    })
}

fn report_start(name: &str, out: &StartOutcome) {
    match out {
        StartOutcome::Started { pid } => println!("{name} started (pid {pid})"),
        StartOutcome::AlreadyRunning { pids } => {
            println!("{name} already running (pids {pids:?})")
        }
    }
}

async fn start(config: &Config, cancel: &CancellationToken) -> Result<(), CommandError> {
    ensure_installed(config)?;
    let mut sup = Supervisor::new(config.supervisor);
    let out = sup.start(&config.process, cancel).await?;
    report_start(&config.process.name, &out);
    Ok(())
}

fn status(config: &Config, json: bool) -> Result<(), CommandError> {
    let install = Installer::<HttpFetcher>::query(&config.artifact);
    let process = Supervisor::new(config.supervisor).status(&config.process);

    if json {
        let doc = serde_json::json!({
            "artifact": {
                "version": config.artifact.version,
                "installed": install.installed,
                "marker_path": install.marker_path,
                "install_dir": install.install_dir,
            },
            "process": process,
        });
        let out = serde_json::to_string_pretty(&doc)
            .map_err(|e| CommandError::Setup(anyhow::Error::from(e)))?;
        println!("{out}");
        return Ok(());
    }

    println!(
        "artifact {}: {} ({})",
        config.artifact.version,
        if install.installed { "installed" } else { "not installed" },
        install.install_dir.display()
    );
    println!(
        "process {}: {} pids={:?}",
        process.name, process.state, process.pids
    );
    if let Some(run) = &process.run {
        println!(
            "  last launch: pid {} run {} at_unix_ms {}",
            run.pid, run.run_id.0, run.started_at_unix_ms
        );
    }
    if let Some(msg) = &process.message {
        println!("  note: {msg}");
    }
    Ok(())
}
