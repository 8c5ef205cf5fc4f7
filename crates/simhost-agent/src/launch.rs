use std::{
    collections::BTreeMap,
    io::Write,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use anyhow::Context;
use simhost_process::{LogMode, ProcessSpec, RunId, RunRecord};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};

use crate::artifact::now_unix_ms;
use crate::error::SuperviseError;
use crate::error_payload::truncate_utf8;
use crate::host;

#[derive(Debug)]
pub struct Launched {
    pub child: Child,
    pub pid: u32,
    pub started_at_unix_ms: u64,
    pub run_id: RunId,
}

/// Fails unless `path` is a regular file with at least one execute bit.
pub fn check_executable(path: &Path) -> Result<(), SuperviseError> {
    let missing = |reason: String| SuperviseError::ExecutableMissing {
        path: path.to_path_buf(),
        reason,
    };
    let meta = std::fs::metadata(path).map_err(|e| missing(e.to_string()))?;
    if !meta.is_file() {
        return Err(missing("not a regular file".to_string()));
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if meta.permissions().mode() & 0o111 == 0 {
            return Err(missing("no execute permission".to_string()));
        }
    }
    Ok(())
}

fn open_log(spec: &ProcessSpec) -> Result<std::fs::File, SuperviseError> {
    let path = &spec.log_path;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| SuperviseError::io(format!("create {}", parent.display()), e))?;
    }
    let mut opts = std::fs::OpenOptions::new();
    opts.create(true);
    match spec.log_mode {
        LogMode::Truncate => opts.write(true).truncate(true),
        LogMode::Append => opts.append(true),
    };
    opts.open(path)
        .map_err(|e| SuperviseError::io(format!("open log {}", path.display()), e))
}

fn redact(key: &str, value: &str) -> String {
    let upper = key.to_ascii_uppercase();
    if ["PASSWORD", "SECRET", "TOKEN", "KEY"]
        .iter()
        .any(|s| upper.contains(s))
    {
        "<redacted>".to_string()
    } else {
        truncate_utf8(value, 512)
    }
}

fn collect_safe_env(extra: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for key in ["PATH", "LD_LIBRARY_PATH", "DISPLAY", "SDL_VIDEODRIVER"] {
        if let Ok(v) = std::env::var(key) {
            out.insert(key.to_string(), redact(key, &v));
        }
    }
    for (k, v) in extra {
        out.insert(k.clone(), redact(k, v));
    }
    out
}

pub async fn write_run_record(path: &Path, record: &RunRecord) -> anyhow::Result<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("create {}", dir.display()))?;
    }
    let tmp = PathBuf::from(format!("{}.tmp", path.display()));
    let data = serde_json::to_vec_pretty(record).context("serialize run record")?;
    let mut f = tokio::fs::File::create(&tmp)
        .await
        .with_context(|| format!("create {}", tmp.display()))?;
    f.write_all(&data).await.context("write run record")?;
    f.flush().await.ok();
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("persist {}", path.display()))?;
    Ok(())
}

pub fn read_run_record(path: &Path) -> Option<RunRecord> {
    let data = std::fs::read(path).ok()?;
    match serde_json::from_slice(&data) {
        Ok(r) => Some(r),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable run record");
            None
        }
    }
}

fn build_command(spec: &ProcessSpec, log: &std::fs::File) -> Result<Command, SuperviseError> {
    let log_io = |e| SuperviseError::io(format!("dup log {}", spec.log_path.display()), e);

    let mut cmd = Command::new(&spec.executable);
    cmd.args(&spec.args)
        .current_dir(&spec.working_dir)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log.try_clone().map_err(log_io)?))
        .stderr(Stdio::from(log.try_clone().map_err(log_io)?));

    #[cfg(unix)]
    {
        if let Some(user) = spec.run_as_user.as_deref() {
            let (uid, gid) = host::lookup_user(user)
                .ok_or_else(|| SuperviseError::UnknownUser(user.to_string()))?;
            cmd.uid(uid).gid(gid);
        }

        unsafe {
            // New session: the simulator outlives this invocation and can be signalled as a group.
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }
    #[cfg(not(unix))]
    {
        if let Some(user) = spec.run_as_user.as_deref()
            && host::lookup_user(user).is_none()
        {
            return Err(SuperviseError::UnknownUser(user.to_string()));
        }
    }

    Ok(cmd)
}

const SPAWN_BUSY_RETRIES: u32 = 5;

/// Launches `spec` detached, with stdout and stderr appended to its log file.
pub async fn launch(spec: &ProcessSpec) -> Result<Launched, SuperviseError> {
    check_executable(&spec.executable)?;

    let mut log = open_log(spec)?;
    let header = format!(
        "[simhost] start {}: exec={} args=[{}] cwd={} at_unix_ms={}\n",
        spec.name,
        spec.executable.display(),
        spec.args.join(" "),
        spec.working_dir.display(),
        now_unix_ms(),
    );
    log.write_all(header.as_bytes())
        .map_err(|e| SuperviseError::io(format!("write log {}", spec.log_path.display()), e))?;

    let mut cmd = build_command(spec, &log)?;

    let mut attempt = 0;
    let child = loop {
        attempt += 1;
        match cmd.spawn() {
            Ok(c) => break c,
            // A freshly written executable can still be open for writing elsewhere.
            Err(e) if e.raw_os_error() == Some(libc::ETXTBSY) && attempt < SPAWN_BUSY_RETRIES => {
                tracing::debug!(
                    attempt,
                    exec = %spec.executable.display(),
                    "executable busy; retrying spawn"
                );
                tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
            }
            Err(source) => {
                let _ = writeln!(log, "[simhost] spawn failed: {source}");
                return Err(SuperviseError::Launch {
                    exec: spec.executable.clone(),
                    source,
                });
            }
        }
    };

    let Some(pid) = child.id() else {
        return Err(SuperviseError::io(
            "read child pid",
            std::io::Error::other("child exited before its pid was observed"),
        ));
    };
    let started_at_unix_ms = now_unix_ms();
    let run_id = RunId::new();

    let record = RunRecord {
        run_id: run_id.clone(),
        name: spec.name.clone(),
        pid,
        started_at_unix_ms,
        agent_version: env!("CARGO_PKG_VERSION").to_string(),
        exec: spec.executable.display().to_string(),
        args: spec.args.clone(),
        cwd: spec.working_dir.display().to_string(),
        env: collect_safe_env(&spec.env),
    };
    // Informational only; a failed write must not orphan a running simulator.
    if let Err(e) = write_run_record(&spec.run_record_path(), &record).await {
        tracing::warn!(error = %crate::error::format_error_chain(&e), "failed to write run record");
    }

    tracing::info!(
        name = %spec.name,
        pid,
        run_id = %run_id.0,
        exec = %spec.executable.display(),
        log = %spec.log_path.display(),
        "process launched"
    );

    Ok(Launched {
        child,
        pid,
        started_at_unix_ms,
        run_id,
    })
}
