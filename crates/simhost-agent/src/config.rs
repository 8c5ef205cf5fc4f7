use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;
use simhost_process::{LogMode, ProcessSpec};

use crate::artifact::ArtifactSpec;
use crate::log_tail::{DEFAULT_TAIL_BYTES, DEFAULT_TAIL_LINES};

pub const DEFAULT_CONFIG_PATH: &str = "simhost.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstallerConfig {
    pub download_attempts: u32,
    pub stall_timeout: Duration,
    pub stall_check_interval: Duration,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            download_attempts: 3,
            stall_timeout: Duration::from_secs(300),
            stall_check_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorConfig {
    pub ready_timeout: Duration,
    pub ready_poll_interval: Duration,
    pub stop_grace: Duration,
    pub stop_poll_interval: Duration,
    pub kill_wait: Duration,
    pub log_tail_bytes: u64,
    pub log_tail_lines: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            // The simulator takes a while to load its first map.
            ready_timeout: Duration::from_secs(180),
            ready_poll_interval: Duration::from_secs(1),
            stop_grace: Duration::from_secs(20),
            stop_poll_interval: Duration::from_millis(250),
            kill_wait: Duration::from_secs(10),
            log_tail_bytes: DEFAULT_TAIL_BYTES,
            log_tail_lines: DEFAULT_TAIL_LINES,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    artifact: ArtifactSpec,
    process: ProcessSection,
    #[serde(default)]
    installer: InstallerSection,
    #[serde(default)]
    supervisor: SupervisorSection,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProcessSection {
    #[serde(default = "default_process_name")]
    name: String,
    /// Defaults to `install_dir/entry_point`.
    executable: Option<PathBuf>,
    #[serde(default)]
    args: Vec<String>,
    /// Defaults to the executable's directory.
    working_dir: Option<PathBuf>,
    log_path: PathBuf,
    #[serde(default)]
    log_mode: LogMode,
    readiness_port: Option<u16>,
    run_as_user: Option<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    signature: Option<String>,
}

fn default_process_name() -> String {
    "carla".to_string()
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct InstallerSection {
    download_attempts: Option<u32>,
    extract_stall_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SupervisorSection {
    ready_timeout_ms: Option<u64>,
    ready_poll_ms: Option<u64>,
    stop_grace_ms: Option<u64>,
    stop_poll_ms: Option<u64>,
    kill_wait_ms: Option<u64>,
    log_tail_lines: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub artifact: ArtifactSpec,
    pub process: ProcessSpec,
    pub installer: InstallerConfig,
    pub supervisor: SupervisorConfig,
}

fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

fn parse_env<T: std::str::FromStr>(get: &dyn Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = get(name)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(name, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}

fn resolve(base: &Path, p: &Path) -> PathBuf {
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base.join(p)
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let path = std::path::absolute(path)
            .with_context(|| format!("resolve config path {}", path.display()))?;
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("read config {}", path.display()))?;
        let base = path.parent().unwrap_or(Path::new("/"));
        let mut cfg = Self::from_toml_str(&raw, base)
            .with_context(|| format!("parse config {}", path.display()))?;
        cfg.apply_env_overrides(&|k| std::env::var(k).ok());
        Ok(cfg)
    }

    /// Parses a config document, resolving relative paths against `base`.
    pub fn from_toml_str(raw: &str, base: &Path) -> anyhow::Result<Self> {
        let file: FileConfig = toml::from_str(raw)?;

        let mut artifact = file.artifact;
        artifact.cache_file = resolve(base, &artifact.cache_file);
        artifact.install_dir = resolve(base, &artifact.install_dir);

        let p = file.process;
        let executable = match p.executable {
            Some(exe) => resolve(base, &exe),
            None => artifact.entry_point_path(),
        };
        let working_dir = match p.working_dir {
            Some(dir) => resolve(base, &dir),
            None => executable
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| artifact.install_dir.clone()),
        };
        let process = ProcessSpec {
            name: p.name,
            executable,
            args: p.args,
            working_dir,
            log_path: resolve(base, &p.log_path),
            log_mode: p.log_mode,
            readiness_port: p.readiness_port,
            run_as_user: p.run_as_user,
            env: p.env,
            signature: p.signature,
        };

        let mut installer = InstallerConfig::default();
        if let Some(n) = file.installer.download_attempts {
            installer.download_attempts = n;
        }
        if let Some(v) = file.installer.extract_stall_ms {
            installer.stall_timeout = ms(v);
        }

        let s = file.supervisor;
        let mut supervisor = SupervisorConfig::default();
        if let Some(v) = s.ready_timeout_ms {
            supervisor.ready_timeout = ms(v);
        }
        if let Some(v) = s.ready_poll_ms {
            supervisor.ready_poll_interval = ms(v);
        }
        if let Some(v) = s.stop_grace_ms {
            supervisor.stop_grace = ms(v);
        }
        if let Some(v) = s.stop_poll_ms {
            supervisor.stop_poll_interval = ms(v);
        }
        if let Some(v) = s.kill_wait_ms {
            supervisor.kill_wait = ms(v);
        }
        if let Some(v) = s.log_tail_lines {
            supervisor.log_tail_lines = v;
        }

        let mut cfg = Self {
            artifact,
            process,
            installer,
            supervisor,
        };
        cfg.clamp();
        Ok(cfg)
    }

    /// Applies `SIMHOST_*` overrides; values are clamped to sane bounds afterwards.
    pub fn apply_env_overrides(&mut self, get: &dyn Fn(&str) -> Option<String>) {
        if let Some(v) = parse_env::<u64>(get, "SIMHOST_READY_TIMEOUT_MS") {
            self.supervisor.ready_timeout = ms(v);
        }
        if let Some(v) = parse_env::<u64>(get, "SIMHOST_READY_POLL_MS") {
            self.supervisor.ready_poll_interval = ms(v);
        }
        if let Some(v) = parse_env::<u64>(get, "SIMHOST_STOP_GRACE_MS") {
            self.supervisor.stop_grace = ms(v);
        }
        if let Some(v) = parse_env::<u64>(get, "SIMHOST_KILL_WAIT_MS") {
            self.supervisor.kill_wait = ms(v);
        }
        if let Some(v) = parse_env::<u64>(get, "SIMHOST_EXTRACT_STALL_MS") {
            self.installer.stall_timeout = ms(v);
        }
        if let Some(v) = parse_env::<u32>(get, "SIMHOST_DOWNLOAD_ATTEMPTS") {
            self.installer.download_attempts = v;
        }
        self.clamp();
    }

    fn clamp(&mut self) {
        let s = &mut self.supervisor;
        s.ready_timeout = s.ready_timeout.clamp(ms(100), Duration::from_secs(24 * 60 * 60));
        s.ready_poll_interval = s.ready_poll_interval.clamp(ms(20), Duration::from_secs(60));
        s.stop_grace = s.stop_grace.min(Duration::from_secs(60 * 60));
        s.stop_poll_interval = s.stop_poll_interval.clamp(ms(20), Duration::from_secs(10));
        s.kill_wait = s.kill_wait.clamp(ms(100), Duration::from_secs(5 * 60));
        s.log_tail_lines = s.log_tail_lines.clamp(1, 1000);

        let i = &mut self.installer;
        i.download_attempts = i.download_attempts.clamp(1, 20);
        i.stall_timeout = i.stall_timeout.clamp(ms(1000), Duration::from_secs(24 * 60 * 60));
        i.stall_check_interval = i.stall_check_interval.min(i.stall_timeout);
    }
}
