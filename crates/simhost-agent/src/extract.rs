use std::{
    fs,
    io::{self, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio_util::sync::CancellationToken;

use crate::error::InstallError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    TarGz,
    Tar,
    Zip,
}

impl ArchiveKind {
    pub fn from_path(p: &Path) -> Option<Self> {
        let name = p.file_name()?.to_str()?.to_ascii_lowercase();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveKind::TarGz)
        } else if name.ends_with(".tar") {
            Some(ArchiveKind::Tar)
        } else if name.ends_with(".zip") {
            Some(ArchiveKind::Zip)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExtractOptions {
    pub stall_timeout: Duration,
    pub check_interval: Duration,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractReport {
    pub entries: u64,
    pub bytes_read: u64,
}

/// Counts archive bytes consumed and fails reads once `abort` is raised.
struct ProgressReader<R> {
    inner: R,
    read: Arc<AtomicU64>,
    abort: Arc<AtomicBool>,
}

impl<R: Read> Read for ProgressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.abort.load(Ordering::Relaxed) {
            // Not `Interrupted`: callers retry those.
            return Err(io::Error::other("extraction aborted"));
        }
        let n = self.inner.read(buf)?;
        self.read.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

impl<R: Seek> Seek for ProgressReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}

fn unpack_tar<R: Read>(reader: R, dest: &Path) -> io::Result<u64> {
    let mut archive = tar::Archive::new(reader);
    // Files belong to whoever runs the install, not the UID recorded by the build machine.
    archive.set_preserve_ownerships(false);
    archive.set_preserve_permissions(true);
    archive.set_unpack_xattrs(false);
    archive.set_overwrite(true);

    let mut entries = 0u64;
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.unpack_in(dest)? {
            tracing::warn!(
                path = %entry.path().map(|p| p.display().to_string()).unwrap_or_default(),
                "skipping archive entry outside the install directory"
            );
            continue;
        }
        entries += 1;
    }
    Ok(entries)
}

fn unpack_zip<R: Read + Seek>(reader: R, dest: &Path) -> io::Result<u64> {
    let mut archive = zip::ZipArchive::new(reader).map_err(io::Error::other)?;
    let mut entries = 0u64;
    for i in 0..archive.len() {
        let mut file = archive.by_index(i).map_err(io::Error::other)?;
        let Some(rel) = file.enclosed_name() else {
            tracing::warn!(
                name = file.name(),
                "skipping archive entry outside the install directory"
            );
            continue;
        };
        let out_path = dest.join(rel);

        if file.is_dir() {
            fs::create_dir_all(&out_path)?;
            entries += 1;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = fs::File::create(&out_path)?;
        io::copy(&mut file, &mut out)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = file.unix_mode() {
                fs::set_permissions(&out_path, fs::Permissions::from_mode(mode & 0o777))?;
            }
        }
        entries += 1;
    }
    Ok(entries)
}

fn unpack_blocking(
    kind: ArchiveKind,
    archive: &Path,
    dest: &Path,
    read: Arc<AtomicU64>,
    abort: Arc<AtomicBool>,
) -> io::Result<u64> {
    fs::create_dir_all(dest)?;
    let reader = ProgressReader {
        inner: fs::File::open(archive)?,
        read,
        abort,
    };
    match kind {
        ArchiveKind::TarGz => {
            unpack_tar(flate2::read::GzDecoder::new(io::BufReader::new(reader)), dest)
        }
        ArchiveKind::Tar => unpack_tar(io::BufReader::new(reader), dest),
        ArchiveKind::Zip => unpack_zip(io::BufReader::new(reader), dest),
    }
}

/// Extracts `archive` into `dest` on a blocking worker while a watchdog checks for progress.
pub async fn extract_archive(
    archive: &Path,
    dest: &Path,
    opts: ExtractOptions,
    cancel: &CancellationToken,
) -> Result<ExtractReport, InstallError> {
    let kind = ArchiveKind::from_path(archive).ok_or_else(|| {
        InstallError::InvalidSpec(format!("unsupported archive type: {}", archive.display()))
    })?;
    let total_bytes = fs::metadata(archive)
        .map_err(|e| InstallError::io(format!("stat {}", archive.display()), e))?
        .len();

    tracing::info!(
        archive = %archive.display(),
        dest = %dest.display(),
        total_bytes,
        "extracting artifact"
    );

    let read = Arc::new(AtomicU64::new(0));
    let abort = Arc::new(AtomicBool::new(false));
    // Detached: the watchdog may return while the worker is still stuck in a syscall.
    let (done_tx, mut done_rx) = tokio::sync::oneshot::channel();
    std::thread::Builder::new()
        .name("simhost-extract".to_string())
        .spawn({
            let archive: PathBuf = archive.to_path_buf();
            let dest: PathBuf = dest.to_path_buf();
            let read = read.clone();
            let abort = abort.clone();
            move || {
                let _ = done_tx.send(unpack_blocking(kind, &archive, &dest, read, abort));
            }
        })
        .map_err(|e| InstallError::io("spawn extraction worker", e))?;

    let mut last_bytes = 0u64;
    let mut last_progress_at = tokio::time::Instant::now();
    let mut last_logged_decile = 0u64;

    let joined = loop {
        tokio::select! {
            res = &mut done_rx => break res,
            _ = cancel.cancelled() => {
                abort.store(true, Ordering::Relaxed);
                return Err(InstallError::Cancelled { stage: "extract" });
            }
            _ = tokio::time::sleep(opts.check_interval) => {
                let now = tokio::time::Instant::now();
                let bytes = read.load(Ordering::Relaxed);
                if bytes != last_bytes {
                    last_bytes = bytes;
                    last_progress_at = now;
                    let decile = bytes.saturating_mul(10) / total_bytes.max(1);
                    if decile > last_logged_decile {
                        last_logged_decile = decile;
                        tracing::info!(
                            read_bytes = bytes,
                            total_bytes,
                            "extraction {}% done",
                            decile * 10
                        );
                    }
                } else if now.duration_since(last_progress_at) >= opts.stall_timeout {
                    abort.store(true, Ordering::Relaxed);
                    tracing::warn!(
                        archive = %archive.display(),
                        read_bytes = bytes,
                        "extraction stalled; abandoning worker"
                    );
                    return Err(InstallError::ExtractStalled {
                        archive: archive.to_path_buf(),
                        stalled_for: now.duration_since(last_progress_at),
                    });
                }
            }
        }
    };

    let entries = joined
        .map_err(|_| {
            InstallError::io(
                "join extraction worker",
                io::Error::other("worker exited without a result"),
            )
        })?
        .map_err(|e| InstallError::Extract {
            archive: archive.to_path_buf(),
            reason: e.to_string(),
        })?;

    let report = ExtractReport {
        entries,
        bytes_read: read.load(Ordering::Relaxed),
    };
    tracing::info!(entries = report.entries, "extraction finished");
    Ok(report)
}
