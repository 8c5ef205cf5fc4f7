use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::InstallError;
use crate::extract::ArchiveKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArtifactSpec {
    pub version: String,
    pub source_url: String,
    pub cache_file: PathBuf,
    pub install_dir: PathBuf,
    #[serde(default)]
    pub min_cache_free_bytes: u64,
    #[serde(default)]
    pub min_install_free_bytes: u64,
    /// Launcher path relative to `install_dir`.
    pub entry_point: PathBuf,
    /// Principal that should own the installed tree.
    #[serde(default)]
    pub runtime_user: Option<String>,
    #[serde(default)]
    pub sha256: Option<String>,
}

impl ArtifactSpec {
    pub fn marker_path(&self) -> PathBuf {
        self.install_dir.join(format!(".installed_{}", self.version))
    }

    pub fn entry_point_path(&self) -> PathBuf {
        self.install_dir.join(&self.entry_point)
    }

    pub fn validate(&self) -> Result<(), InstallError> {
        let invalid = |msg: String| Err(InstallError::InvalidSpec(msg));

        if self.version.is_empty()
            || !self
                .version
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '+'))
        {
            return invalid(format!("invalid version: {:?}", self.version));
        }

        match reqwest::Url::parse(&self.source_url) {
            Ok(u) if matches!(u.scheme(), "http" | "https") => {}
            Ok(u) => return invalid(format!("unsupported URL scheme: {}", u.scheme())),
            Err(e) => return invalid(format!("invalid source_url {}: {e}", self.source_url)),
        }

        if self.entry_point.as_os_str().is_empty()
            || !self
                .entry_point
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
        {
            return invalid(format!(
                "entry_point must be a relative path without `..`: {}",
                self.entry_point.display()
            ));
        }

        if self.cache_file == self.install_dir
            || self.cache_file.starts_with(&self.install_dir)
            || self.install_dir.starts_with(&self.cache_file)
        {
            return invalid(format!(
                "cache_file {} must live outside install_dir {}",
                self.cache_file.display(),
                self.install_dir.display()
            ));
        }

        if ArchiveKind::from_path(&self.cache_file).is_none() {
            return invalid(format!(
                "unsupported archive type (expected .tar.gz, .tgz, .tar or .zip): {}",
                self.cache_file.display()
            ));
        }

        if let Some(sha) = &self.sha256
            && (sha.len() != 64 || !sha.chars().all(|c| c.is_ascii_hexdigit()))
        {
            return invalid(format!("sha256 must be 64 hex characters: {sha}"));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnershipMode {
    #[default]
    Untouched,
    Chowned,
    PermissiveFallback,
}

/// What an `ensure` call actually did. All-default means the marker short-circuited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstallActions {
    pub downloaded: bool,
    pub extractions: u32,
    pub hoisted: bool,
    pub ownership: OwnershipMode,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstallState {
    pub installed: bool,
    pub marker_path: PathBuf,
    pub install_dir: PathBuf,
    pub entry_point: PathBuf,
    pub actions: InstallActions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkerRecord {
    pub version: String,
    pub source_url: String,
    pub installed_at_unix_ms: u64,
    pub installer_version: String,
}

pub fn write_marker(spec: &ArtifactSpec) -> Result<PathBuf, InstallError> {
    let path = spec.marker_path();
    let record = MarkerRecord {
        version: spec.version.clone(),
        source_url: spec.source_url.clone(),
        installed_at_unix_ms: now_unix_ms(),
        installer_version: env!("CARGO_PKG_VERSION").to_string(),
    };
    let data = serde_json::to_vec_pretty(&record)
        .map_err(|e| InstallError::io("serialize install marker", e.into()))?;

    let tmp = PathBuf::from(format!("{}.tmp", path.display()));
    std::fs::write(&tmp, data)
        .map_err(|e| InstallError::io(format!("write {}", tmp.display()), e))?;
    std::fs::rename(&tmp, &path)
        .map_err(|e| InstallError::io(format!("persist {}", path.display()), e))?;
    Ok(path)
}

pub fn remove_marker(path: &Path) -> Result<(), InstallError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(InstallError::io(format!("remove {}", path.display()), e)),
    }
}

pub fn now_unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
