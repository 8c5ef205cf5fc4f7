use std::{process::ExitCode, time::Duration};

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt;

mod artifact;
mod cli;
mod config;
mod error;
mod error_payload;
mod extract;
mod fetch;
mod host;
mod installer;
mod launch;
mod layout;
mod log_tail;
mod ownership;
mod proc_table;
mod readiness;
mod supervisor;

use cli::CliArgs;
use config::Config;
use error::{Classify, CommandError, Outcome};

/// Installs the subscriber. The returned guard must live until exit so the file layer flushes.
fn init_tracing(verbose: u8) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let level = match verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let log_dir = std::env::var_os("SIMHOST_LOG_DIR").filter(|v| !v.is_empty());
    if let Some(dir) = log_dir {
        match std::fs::create_dir_all(&dir) {
            Ok(()) => {
                let appender = tracing_appender::rolling::never(&dir, "simhost.log");
                let (file_writer, guard) = tracing_appender::non_blocking(appender);
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_ansi(false)
                    .with_writer(std::io::stderr.and(file_writer))
                    .try_init();
                return Some(guard);
            }
            Err(e) => eprintln!(
                "[simhost] cannot create log dir {}: {e}; logging to stderr only",
                std::path::Path::new(&dir).display()
            ),
        }
    }

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
    None
}

fn cancellation(deadline: Option<Duration>) -> CancellationToken {
    let token = CancellationToken::new();

    let on_signal = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; cancelling");
            on_signal.cancel();
        }
    });

    if let Some(deadline) = deadline {
        let on_deadline = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            tracing::warn!(deadline_secs = deadline.as_secs(), "deadline reached; cancelling");
            on_deadline.cancel();
        });
    }

    token
}

fn fail(err: &CommandError) -> ExitCode {
    let outcome = err.outcome();
    if outcome == Outcome::Retryable {
        tracing::warn!(code = err.code(), error = %err, "command failed (retryable)");
    } else {
        tracing::error!(code = err.code(), error = %err, "command failed");
    }
    eprintln!("{}", error_payload::for_error(err));
    ExitCode::from(outcome.exit_code())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();
    let _log_guard = init_tracing(args.verbose);

    let config = match Config::load(&args.config) {
        Ok(c) => c,
        Err(e) => return fail(&CommandError::Setup(e)),
    };
    tracing::debug!(
        config = %args.config.display(),
        version = %config.artifact.version,
        install_dir = %config.artifact.install_dir.display(),
        "config loaded"
    );

    let cancel = cancellation(args.deadline_secs.map(Duration::from_secs));
    match args.command.run(&config, &cancel).await {
        Ok(()) => ExitCode::from(Outcome::Success.exit_code()),
        Err(e) => fail(&e),
    }
}
