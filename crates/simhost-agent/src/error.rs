use std::{path::PathBuf, time::Duration};

use thiserror::Error;

/// Tri-state result the orchestration layer maps to exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Retryable,
    Fatal,
}

impl Outcome {
    pub fn exit_code(self) -> u8 {
        match self {
            Outcome::Success => 0,
            // EX_TEMPFAIL
            Outcome::Retryable => 75,
            Outcome::Fatal => 1,
        }
    }
}

pub trait Classify {
    fn outcome(&self) -> Outcome;

    /// Stable snake_case label for logs and the error payload.
    fn code(&self) -> &'static str;

    fn hint(&self) -> Option<String> {
        None
    }
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("invalid artifact spec: {0}")]
    InvalidSpec(String),

    #[error(
        "insufficient disk space for {purpose} at {}: free {free} bytes < required {required} bytes (short by {shortfall} bytes)",
        .path.display()
    )]
    Capacity {
        purpose: &'static str,
        path: PathBuf,
        free: u64,
        required: u64,
        shortfall: u64,
    },

    #[error("download of {url} failed after {attempts} attempt(s): {reason}")]
    Transfer {
        url: String,
        attempts: u32,
        reason: String,
    },

    #[error("extracting {} failed: {reason}", .archive.display())]
    Extract { archive: PathBuf, reason: String },

    #[error(
        "extraction of {} stalled: no progress for {}s",
        .archive.display(),
        .stalled_for.as_secs()
    )]
    ExtractStalled {
        archive: PathBuf,
        stalled_for: Duration,
    },

    #[error(
        "entry point {} not found under {} after {attempts} extraction attempt(s)",
        .entry_point.display(),
        .install_dir.display()
    )]
    Layout {
        entry_point: PathBuf,
        install_dir: PathBuf,
        attempts: u32,
    },

    #[error("install cancelled during {stage}")]
    Cancelled { stage: &'static str },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl InstallError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        InstallError::Io {
            context: context.into(),
            source,
        }
    }
}

impl Classify for InstallError {
    fn outcome(&self) -> Outcome {
        match self {
            InstallError::Capacity { .. }
            | InstallError::Transfer { .. }
            | InstallError::Extract { .. }
            | InstallError::ExtractStalled { .. }
            | InstallError::Cancelled { .. } => Outcome::Retryable,
            InstallError::InvalidSpec(_)
            | InstallError::Layout { .. }
            | InstallError::Io { .. } => Outcome::Fatal,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            InstallError::InvalidSpec(_) => "invalid_spec",
            InstallError::Capacity { .. } => "insufficient_disk",
            InstallError::Transfer { .. } => "download_failed",
            InstallError::Extract { .. } => "extract_failed",
            InstallError::ExtractStalled { .. } => "extract_stalled",
            InstallError::Layout { .. } => "layout_invalid",
            InstallError::Cancelled { .. } => "cancelled",
            InstallError::Io { .. } => "io_error",
        }
    }

    fn hint(&self) -> Option<String> {
        match self {
            InstallError::Capacity {
                path, shortfall, ..
            } => Some(format!(
                "Free at least {shortfall} bytes on the filesystem holding {}, or point the path at a larger volume.",
                path.display()
            )),
            InstallError::Transfer { .. } => {
                Some("Check network access to the artifact URL and retry.".to_string())
            }
            InstallError::Extract { .. } => Some(
                "The damaged cached archive was removed; retry to download it again."
                    .to_string(),
            ),
            InstallError::Layout { .. } => Some(
                "The archive does not contain the configured entry point; check `entry_point` and the archive contents."
                    .to_string(),
            ),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum SuperviseError {
    #[error("executable {} is not usable: {reason}", .path.display())]
    ExecutableMissing { path: PathBuf, reason: String },

    #[error("unknown run_as_user: {0}")]
    UnknownUser(String),

    #[error("failed to launch {}: {source}", .exec.display())]
    Launch {
        exec: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "{name} (pid {pid}) did not become ready within {}ms{}; process left running. log tail:\n{log_tail}",
        .timeout.as_millis(),
        .port.map(|p| format!(" (port {p} never accepted connections)")).unwrap_or_default()
    )]
    ReadinessTimeout {
        name: String,
        pid: u32,
        port: Option<u16>,
        timeout: Duration,
        log_tail: String,
    },

    #[error("{name} (pid {pid}) exited during startup ({status}). log tail:\n{log_tail}")]
    LaunchExited {
        name: String,
        pid: u32,
        status: String,
        log_tail: String,
    },

    #[error("{name} still running after stop (pids {pids:?}, waited {}ms)", .waited.as_millis())]
    StopFailed {
        name: String,
        pids: Vec<u32>,
        waited: Duration,
    },

    #[error("supervision cancelled during {stage}")]
    Cancelled { stage: &'static str },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl SuperviseError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        SuperviseError::Io {
            context: context.into(),
            source,
        }
    }
}

impl Classify for SuperviseError {
    fn outcome(&self) -> Outcome {
        match self {
            SuperviseError::Cancelled { .. } => Outcome::Retryable,
            _ => Outcome::Fatal,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            SuperviseError::ExecutableMissing { .. } => "executable_missing",
            SuperviseError::UnknownUser(_) => "unknown_user",
            SuperviseError::Launch { .. } => "spawn_failed",
            SuperviseError::ReadinessTimeout { .. } => "readiness_timeout",
            SuperviseError::LaunchExited { .. } => "early_exit",
            SuperviseError::StopFailed { .. } => "stop_failed",
            SuperviseError::Cancelled { .. } => "cancelled",
            SuperviseError::Io { .. } => "io_error",
        }
    }

    fn hint(&self) -> Option<String> {
        match self {
            SuperviseError::ExecutableMissing { .. } => {
                Some("Run `simhost install` first and check `process.executable`.".to_string())
            }
            SuperviseError::ReadinessTimeout { .. } => Some(
                "Inspect the log tail; stop the leftover process with `simhost stop` before retrying."
                    .to_string(),
            ),
            SuperviseError::StopFailed { .. } => Some(
                "The process survived SIGKILL; it may be stuck in uninterruptible I/O (check the GPU driver)."
                    .to_string(),
            ),
            _ => None,
        }
    }
}

/// What a CLI command can fail with.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Install(#[from] InstallError),

    #[error(transparent)]
    Supervise(#[from] SuperviseError),

    #[error("artifact {version} is not installed in {}", .install_dir.display())]
    NotInstalled { version: String, install_dir: PathBuf },

    #[error("{}", format_error_chain(.0))]
    Setup(anyhow::Error),
}

impl Classify for CommandError {
    fn outcome(&self) -> Outcome {
        match self {
            CommandError::Install(e) => e.outcome(),
            CommandError::Supervise(e) => e.outcome(),
            CommandError::NotInstalled { .. } | CommandError::Setup(_) => Outcome::Fatal,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            CommandError::Install(e) => e.code(),
            CommandError::Supervise(e) => e.code(),
            CommandError::NotInstalled { .. } => "not_installed",
            CommandError::Setup(_) => "invalid_config",
        }
    }

    fn hint(&self) -> Option<String> {
        match self {
            CommandError::Install(e) => e.hint(),
            CommandError::Supervise(e) => e.hint(),
            CommandError::NotInstalled { .. } => {
                Some("Run `simhost install` (or `simhost up`) first.".to_string())
            }
            CommandError::Setup(_) => None,
        }
    }
}

pub fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_chain_skips_duplicates() {
        let err = anyhow::anyhow!("connection reset")
            .context("read body chunk")
            .context("read body chunk");
        assert_eq!(
            format_error_chain(&err),
            "read body chunk: connection reset"
        );
    }

    #[test]
    fn capacity_error_names_the_shortfall() {
        let err = InstallError::Capacity {
            purpose: "install",
            path: PathBuf::from("/opt/carla"),
            free: 10,
            required: 30,
            shortfall: 20,
        };
        let msg = err.to_string();
        assert!(msg.contains("/opt/carla"));
        assert!(msg.contains("short by 20 bytes"));
        assert_eq!(err.outcome(), Outcome::Retryable);
        assert_eq!(err.code(), "insufficient_disk");
        assert!(err.hint().unwrap().contains("20 bytes"));
    }

    #[test]
    fn layout_and_readiness_are_fatal() {
        let layout = InstallError::Layout {
            entry_point: PathBuf::from("CarlaUE4.sh"),
            install_dir: PathBuf::from("/opt/carla"),
            attempts: 2,
        };
        assert_eq!(layout.outcome(), Outcome::Fatal);

        let timeout = SuperviseError::ReadinessTimeout {
            name: "carla".to_string(),
            pid: 42,
            port: Some(2000),
            timeout: Duration::from_secs(3),
            log_tail: "LowLevelFatalError".to_string(),
        };
        assert_eq!(timeout.outcome(), Outcome::Fatal);
        let msg = timeout.to_string();
        assert!(msg.contains("port 2000"));
        assert!(msg.contains("LowLevelFatalError"));
    }

    #[test]
    fn cancellation_is_retryable() {
        assert_eq!(
            InstallError::Cancelled { stage: "download" }.outcome(),
            Outcome::Retryable
        );
        assert_eq!(
            SuperviseError::Cancelled { stage: "readiness" }.outcome(),
            Outcome::Retryable
        );
    }

    #[test]
    fn exit_codes() {
        assert_eq!(Outcome::Success.exit_code(), 0);
        assert_eq!(Outcome::Retryable.exit_code(), 75);
        assert_eq!(Outcome::Fatal.exit_code(), 1);
    }

    #[test]
    fn command_error_delegates_classification() {
        let err = CommandError::from(InstallError::Cancelled { stage: "download" });
        assert_eq!(err.outcome(), Outcome::Retryable);
        assert_eq!(err.code(), "cancelled");

        let err = CommandError::NotInstalled {
            version: "0.9.16".to_string(),
            install_dir: PathBuf::from("/opt/carla"),
        };
        assert_eq!(err.outcome().exit_code(), 1);
        assert!(err.hint().is_some());

        let err = CommandError::Setup(
            anyhow::anyhow!("missing field `artifact`").context("parse config"),
        );
        assert_eq!(err.to_string(), "parse config: missing field `artifact`");
    }
}
