use std::path::Path;

use tokio_util::sync::CancellationToken;

use crate::artifact::{self, ArtifactSpec, InstallActions, InstallState};
use crate::config::InstallerConfig;
use crate::error::InstallError;
use crate::extract::{self, ExtractOptions};
use crate::fetch::{self, Fetch, HttpFetcher};
use crate::host;
use crate::layout::{self, EntryPointLocation};
use crate::ownership;

/// Extraction passes before a missing entry point is reported as a layout error.
const MAX_EXTRACTIONS: u32 = 2;

pub struct Installer<F = HttpFetcher> {
    fetcher: F,
    config: InstallerConfig,
}

impl<F: Fetch> Installer<F> {
    pub fn new(fetcher: F, config: InstallerConfig) -> Self {
        Self { fetcher, config }
    }

    /// Reports marker state without touching the filesystem beyond a stat.
    pub fn query(spec: &ArtifactSpec) -> InstallState {
        let marker_path = spec.marker_path();
        let entry_point = spec.entry_point_path();
        InstallState {
            installed: marker_path.is_file() && entry_point.exists(),
            marker_path,
            install_dir: spec.install_dir.clone(),
            entry_point,
            actions: InstallActions::default(),
        }
    }

    pub async fn ensure(
        &self,
        spec: &ArtifactSpec,
        cancel: &CancellationToken,
    ) -> Result<InstallState, InstallError> {
        spec.validate()?;

        let marker_path = spec.marker_path();
        let entry_point = spec.entry_point_path();

        if marker_path.is_file() {
            if entry_point.exists() {
                tracing::info!(
                    version = %spec.version,
                    install_dir = %spec.install_dir.display(),
                    "artifact already installed"
                );
                return Ok(Self::query(spec));
            }
            tracing::warn!(
                marker = %marker_path.display(),
                entry_point = %entry_point.display(),
                "install marker present but entry point missing; reinstalling"
            );
            artifact::remove_marker(&marker_path)?;
        }

        let mut actions = InstallActions::default();
        let mut cache_present = spec.cache_file.is_file();

        // Preflight: nothing below may run when either filesystem is too small.
        if !cache_present {
            let cache_dir = spec.cache_file.parent().unwrap_or(Path::new("."));
            host::ensure_free_space("cache", cache_dir, spec.min_cache_free_bytes)?;
        }
        host::ensure_free_space("install", &spec.install_dir, spec.min_install_free_bytes)?;
        if cancel.is_cancelled() {
            return Err(InstallError::Cancelled { stage: "preflight" });
        }

        if cache_present && let Some(expected) = spec.sha256.as_deref() {
            if let Err(e) = fetch::verify_sha256(&spec.cache_file, expected).await {
                tracing::warn!(
                    path = %spec.cache_file.display(),
                    error = %e,
                    "cached archive failed verification; downloading again"
                );
                std::fs::remove_file(&spec.cache_file).map_err(|e| {
                    InstallError::io(format!("remove {}", spec.cache_file.display()), e)
                })?;
                cache_present = false;
                let cache_dir = spec.cache_file.parent().unwrap_or(Path::new("."));
                host::ensure_free_space("cache", cache_dir, spec.min_cache_free_bytes)?;
            }
        }

        if cache_present {
            tracing::info!(path = %spec.cache_file.display(), "reusing cached archive");
        } else {
            fetch::download_to_cache(
                &self.fetcher,
                &spec.source_url,
                &spec.cache_file,
                self.config.download_attempts,
                spec.sha256.as_deref(),
                cancel,
            )
            .await?;
            actions.downloaded = true;
        }

        self.extract_and_normalize(spec, &mut actions, cancel).await?;

        actions.ownership =
            ownership::apply_runtime_ownership(&spec.install_dir, spec.runtime_user.as_deref())?;
        ownership::ensure_executable(&entry_point)?;

        let marker_path = artifact::write_marker(spec)?;
        tracing::info!(
            version = %spec.version,
            marker = %marker_path.display(),
            extractions = actions.extractions,
            hoisted = actions.hoisted,
            "artifact installed"
        );

        Ok(InstallState {
            installed: true,
            marker_path,
            install_dir: spec.install_dir.clone(),
            entry_point,
            actions,
        })
    }

    async fn extract_and_normalize(
        &self,
        spec: &ArtifactSpec,
        actions: &mut InstallActions,
        cancel: &CancellationToken,
    ) -> Result<(), InstallError> {
        let opts = ExtractOptions {
            stall_timeout: self.config.stall_timeout,
            check_interval: self.config.stall_check_interval,
        };
        let clear = |dir: &Path| {
            layout::clear_dir(dir)
                .map_err(|e| InstallError::io(format!("clear {}", dir.display()), e))
        };

        for attempt in 1..=MAX_EXTRACTIONS {
            // Never extract on top of another version's files (this also drops any marker).
            clear(&spec.install_dir)?;

            actions.extractions = attempt;
            let extracted =
                extract::extract_archive(&spec.cache_file, &spec.install_dir, opts, cancel).await;
            match extracted {
                Ok(_) => {}
                Err(e @ InstallError::Extract { .. }) => {
                    // Undecodable bytes never get better; the next run downloads afresh.
                    tracing::warn!(
                        path = %spec.cache_file.display(),
                        error = %e,
                        "discarding cached archive that failed to extract"
                    );
                    std::fs::remove_file(&spec.cache_file).map_err(|rm| {
                        InstallError::io(format!("remove {}", spec.cache_file.display()), rm)
                    })?;
                    return Err(e);
                }
                Err(e) => return Err(e),
            }

            let location = layout::locate_entry_point(&spec.install_dir, &spec.entry_point)
                .map_err(|e| {
                    InstallError::io(format!("scan {}", spec.install_dir.display()), e)
                })?;
            match location {
                EntryPointLocation::Root => {
                    tracing::debug!("entry point at install root; layout unchanged");
                    return Ok(());
                }
                EntryPointLocation::Nested(subdir) => {
                    let moved = layout::hoist_subdir(&spec.install_dir, &subdir).map_err(|e| {
                        InstallError::io(format!("hoist {}", subdir.display()), e)
                    })?;
                    tracing::info!(
                        subdir = %subdir.display(),
                        moved,
                        "hoisted nested archive root"
                    );
                    actions.hoisted = true;
                    if spec.entry_point_path().exists() {
                        return Ok(());
                    }
                }
                EntryPointLocation::Missing => {}
            }

            tracing::warn!(
                attempt,
                entry_point = %spec.entry_point.display(),
                install_dir = %spec.install_dir.display(),
                "entry point not found after extraction"
            );
        }

        // Leave nothing behind that would count against the next preflight.
        clear(&spec.install_dir)?;
        Err(InstallError::Layout {
            entry_point: spec.entry_point.clone(),
            install_dir: spec.install_dir.clone(),
            attempts: actions.extractions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::OwnershipMode;
    use crate::extract::tests::tar_gz;
    use crate::fetch::tests::FakeFetcher;
    use std::path::PathBuf;
    use std::time::Duration;

    fn config() -> InstallerConfig {
        InstallerConfig {
            download_attempts: 2,
            stall_timeout: Duration::from_secs(30),
            stall_check_interval: Duration::from_millis(20),
        }
    }

    fn spec(root: &Path) -> ArtifactSpec {
        ArtifactSpec {
            version: "0.9.16".to_string(),
            source_url: "https://example.invalid/CARLA_0.9.16.tar.gz".to_string(),
            cache_file: root.join("cache").join("CARLA_0.9.16.tar.gz"),
            install_dir: root.join("carla"),
            min_cache_free_bytes: 0,
            min_install_free_bytes: 0,
            entry_point: PathBuf::from("CarlaUE4.sh"),
            runtime_user: None,
            sha256: None,
        }
    }

    fn flat_archive() -> Vec<u8> {
        tar_gz(&[
            ("CarlaUE4.sh", b"#!/bin/sh\nexec sleep 1000\n", 0o644),
            ("CarlaUE4/Content/Carla.pak", b"pak", 0o644),
            ("PythonAPI/carla/agents/__init__.py", b"", 0o644),
        ])
    }

    fn nested_archive() -> Vec<u8> {
        tar_gz(&[
            ("CARLA_0.9.16/CarlaUE4.sh", b"#!/bin/sh\n", 0o755),
            ("CARLA_0.9.16/.hidden/engine.ini", b"[x]", 0o644),
            ("CARLA_0.9.16/Import/README", b"import here", 0o644),
        ])
    }

    #[tokio::test]
    async fn fresh_install_then_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = spec(tmp.path());
        let fetcher = FakeFetcher::new(flat_archive());
        let installer = Installer::new(fetcher.clone(), config());
        let cancel = CancellationToken::new();

        let first = installer.ensure(&spec, &cancel).await.unwrap();
        assert!(first.installed);
        assert!(first.actions.downloaded);
        assert_eq!(first.actions.extractions, 1);
        assert!(!first.actions.hoisted);
        assert_eq!(first.actions.ownership, OwnershipMode::Untouched);
        assert!(spec.marker_path().is_file());
        assert_eq!(fetcher.calls(), 1);

        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(spec.entry_point_path())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o755, 0o755);

        let second = installer.ensure(&spec, &cancel).await.unwrap();
        assert!(second.installed);
        assert_eq!(second.actions, InstallActions::default());
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn cached_archive_is_reused_without_network() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = spec(tmp.path());
        std::fs::create_dir_all(spec.cache_file.parent().unwrap()).unwrap();
        std::fs::write(&spec.cache_file, flat_archive()).unwrap();

        let fetcher = FakeFetcher::new(Vec::new());
        let installer = Installer::new(fetcher.clone(), config());
        let cancel = CancellationToken::new();

        let state = installer.ensure(&spec, &cancel).await.unwrap();
        assert!(!state.actions.downloaded);
        assert_eq!(state.actions.extractions, 1);
        assert!(!state.actions.hoisted);
        assert!(spec.marker_path().is_file());

        let again = installer.ensure(&spec, &cancel).await.unwrap();
        assert_eq!(again.actions, InstallActions::default());
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn nested_root_is_hoisted_exactly() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = spec(tmp.path());
        let installer = Installer::new(FakeFetcher::new(nested_archive()), config());

        let state = installer
            .ensure(&spec, &CancellationToken::new())
            .await
            .unwrap();
        assert!(state.actions.hoisted);
        assert!(spec.install_dir.join("CarlaUE4.sh").is_file());
        assert!(spec.install_dir.join(".hidden/engine.ini").is_file());
        assert!(spec.install_dir.join("Import/README").is_file());
        assert!(!spec.install_dir.join("CARLA_0.9.16").exists());
        assert_eq!(state.entry_point, spec.install_dir.join("CarlaUE4.sh"));

        let mut names: Vec<String> = std::fs::read_dir(&spec.install_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec![".hidden", ".installed_0.9.16", "CarlaUE4.sh", "Import"]
        );
    }

    #[tokio::test]
    async fn missing_entry_point_extracts_twice_then_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = spec(tmp.path());
        let archive = tar_gz(&[("deep/er/CarlaUE4.sh", b"x", 0o755)]);
        let fetcher = FakeFetcher::new(archive);
        let installer = Installer::new(fetcher.clone(), config());

        let err = installer
            .ensure(&spec, &CancellationToken::new())
            .await
            .unwrap_err();
        match &err {
            InstallError::Layout { attempts, .. } => assert_eq!(*attempts, 2),
            other => panic!("unexpected error: {other}"),
        }
        assert!(!spec.marker_path().exists());
        assert_eq!(std::fs::read_dir(&spec.install_dir).unwrap().count(), 0);
        // The archive stays cached; only extraction was repeated.
        assert!(spec.cache_file.is_file());
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn insufficient_install_space_fails_before_download() {
        let tmp = tempfile::tempdir().unwrap();
        let mut spec = spec(tmp.path());
        spec.min_install_free_bytes = u64::MAX;
        let fetcher = FakeFetcher::new(flat_archive());
        let installer = Installer::new(fetcher.clone(), config());

        let err = installer
            .ensure(&spec, &CancellationToken::new())
            .await
            .unwrap_err();
        match &err {
            InstallError::Capacity {
                purpose, shortfall, ..
            } => {
                assert_eq!(*purpose, "install");
                assert!(*shortfall > 0);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fetcher.calls(), 0);
        assert!(!spec.cache_file.exists());
        assert!(!spec.install_dir.exists());
    }

    #[tokio::test]
    async fn insufficient_cache_space_fails_before_download() {
        let tmp = tempfile::tempdir().unwrap();
        let mut spec = spec(tmp.path());
        spec.min_cache_free_bytes = u64::MAX;
        let fetcher = FakeFetcher::new(flat_archive());
        let installer = Installer::new(fetcher.clone(), config());

        let err = installer
            .ensure(&spec, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, InstallError::Capacity { purpose: "cache", .. }));
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn other_version_is_wiped_before_extraction() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = spec(tmp.path());
        std::fs::create_dir_all(&spec.install_dir).unwrap();
        std::fs::write(spec.install_dir.join(".installed_0.9.15"), b"{}").unwrap();
        std::fs::write(spec.install_dir.join("stale-0.9.15.pak"), b"old").unwrap();

        let installer = Installer::new(FakeFetcher::new(flat_archive()), config());
        installer
            .ensure(&spec, &CancellationToken::new())
            .await
            .unwrap();
        assert!(!spec.install_dir.join(".installed_0.9.15").exists());
        assert!(!spec.install_dir.join("stale-0.9.15.pak").exists());
        assert!(spec.marker_path().is_file());
    }

    #[tokio::test]
    async fn marker_without_entry_point_triggers_reinstall() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = spec(tmp.path());
        let fetcher = FakeFetcher::new(flat_archive());
        let installer = Installer::new(fetcher.clone(), config());
        let cancel = CancellationToken::new();

        installer.ensure(&spec, &cancel).await.unwrap();
        std::fs::remove_file(spec.entry_point_path()).unwrap();
        assert!(!Installer::<FakeFetcher>::query(&spec).installed);

        let state = installer.ensure(&spec, &cancel).await.unwrap();
        assert_eq!(state.actions.extractions, 1);
        assert!(!state.actions.downloaded);
        assert!(spec.entry_point_path().is_file());
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn bad_cached_checksum_redownloads() {
        let tmp = tempfile::tempdir().unwrap();
        let mut spec = spec(tmp.path());
        let archive = flat_archive();
        let path = tmp.path().join("good.tar.gz");
        std::fs::write(&path, &archive).unwrap();
        spec.sha256 = Some(fetch::sha256_file(&path).unwrap());

        std::fs::create_dir_all(spec.cache_file.parent().unwrap()).unwrap();
        std::fs::write(&spec.cache_file, b"corrupt but complete").unwrap();

        let fetcher = FakeFetcher::new(archive);
        let installer = Installer::new(fetcher.clone(), config());
        let state = installer
            .ensure(&spec, &CancellationToken::new())
            .await
            .unwrap();
        assert!(state.actions.downloaded);
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn truncated_cache_without_checksum_is_discarded() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = spec(tmp.path());
        let archive = flat_archive();
        std::fs::create_dir_all(spec.cache_file.parent().unwrap()).unwrap();
        std::fs::write(&spec.cache_file, &archive[..archive.len() / 2]).unwrap();

        let fetcher = FakeFetcher::new(archive);
        let installer = Installer::new(fetcher.clone(), config());
        let cancel = CancellationToken::new();

        let err = installer.ensure(&spec, &cancel).await.unwrap_err();
        assert!(matches!(err, InstallError::Extract { .. }));
        assert!(!spec.cache_file.exists());
        assert!(!spec.marker_path().exists());
        assert_eq!(fetcher.calls(), 0);

        let state = installer.ensure(&spec, &cancel).await.unwrap();
        assert!(state.actions.downloaded);
        assert_eq!(state.actions.extractions, 1);
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn cancellation_leaves_no_marker() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = spec(tmp.path());
        let installer = Installer::new(FakeFetcher::new(flat_archive()), config());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = installer.ensure(&spec, &cancel).await.unwrap_err();
        assert!(matches!(err, InstallError::Cancelled { .. }));
        assert!(!spec.marker_path().exists());
    }

    #[tokio::test]
    async fn invalid_spec_is_rejected_up_front() {
        let tmp = tempfile::tempdir().unwrap();
        let mut spec = spec(tmp.path());
        spec.cache_file = spec.install_dir.join("CARLA.tar.gz");
        let fetcher = FakeFetcher::new(flat_archive());
        let installer = Installer::new(fetcher.clone(), config());

        let err = installer
            .ensure(&spec, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, InstallError::InvalidSpec(_)));
        assert_eq!(fetcher.calls(), 0);
    }
}
