use std::{fs, io, path::Path};

use walkdir::WalkDir;

use crate::artifact::OwnershipMode;
use crate::error::InstallError;
use crate::host;

fn is_ownership_refusal(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::PermissionDenied
        || matches!(
            e.raw_os_error(),
            Some(libc::EPERM | libc::EACCES | libc::EROFS | libc::ENOTSUP | libc::EINVAL)
        )
}

fn walk_err(root: &Path, e: walkdir::Error) -> InstallError {
    let ctx = format!("walk {}", root.display());
    match e.into_io_error() {
        Some(io) => InstallError::io(ctx, io),
        None => InstallError::io(ctx, io::Error::other("filesystem loop")),
    }
}

#[cfg(unix)]
fn chown_tree(root: &Path, uid: u32, gid: u32) -> Result<u64, ChownFailure> {
    let mut n = 0u64;
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| ChownFailure::Walk(walk_err(root, e)))?;
        std::os::unix::fs::lchown(entry.path(), Some(uid), Some(gid)).map_err(|e| {
            if is_ownership_refusal(&e) {
                ChownFailure::Refused(e)
            } else {
                ChownFailure::Walk(InstallError::io(
                    format!("chown {}", entry.path().display()),
                    e,
                ))
            }
        })?;
        n += 1;
    }
    Ok(n)
}

#[cfg(not(unix))]
fn chown_tree(_root: &Path, _uid: u32, _gid: u32) -> Result<u64, ChownFailure> {
    Err(ChownFailure::Refused(io::Error::from(io::ErrorKind::Unsupported)))
}

enum ChownFailure {
    Refused(io::Error),
    Walk(InstallError),
}

/// Adds world read (and traverse/execute where the owner already has it) bits.
#[cfg(unix)]
pub fn relax_permissions(root: &Path) -> Result<u64, InstallError> {
    use std::os::unix::fs::PermissionsExt;

    let mut n = 0u64;
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| walk_err(root, e))?;
        let ft = entry.file_type();
        if ft.is_symlink() {
            continue;
        }
        let meta = entry
            .metadata()
            .map_err(|e| walk_err(root, e))?;
        let mode = meta.permissions().mode() & 0o7777;
        let wanted = if ft.is_dir() || mode & 0o100 != 0 {
            mode | 0o755
        } else {
            mode | 0o644
        };
        if wanted != mode {
            fs::set_permissions(entry.path(), fs::Permissions::from_mode(wanted)).map_err(|e| {
                InstallError::io(format!("chmod {}", entry.path().display()), e)
            })?;
        }
        n += 1;
    }
    Ok(n)
}

#[cfg(not(unix))]
pub fn relax_permissions(_root: &Path) -> Result<u64, InstallError> {
    Ok(0)
}

/// Hands the installed tree to `runtime_user`, degrading to permissive mode bits when the
/// host refuses ownership changes (rootless containers, overlay or network mounts).
pub fn apply_runtime_ownership(
    root: &Path,
    runtime_user: Option<&str>,
) -> Result<OwnershipMode, InstallError> {
    let Some(user) = runtime_user else {
        return Ok(OwnershipMode::Untouched);
    };

    let refused = match host::lookup_user(user) {
        None => format!("user {user} not found"),
        Some((uid, gid)) => match chown_tree(root, uid, gid) {
            Ok(n) => {
                tracing::info!(user, uid, gid, entries = n, "install tree ownership updated");
                return Ok(OwnershipMode::Chowned);
            }
            Err(ChownFailure::Walk(e)) => return Err(e),
            Err(ChownFailure::Refused(e)) => e.to_string(),
        },
    };

    tracing::warn!(
        user,
        reason = %refused,
        root = %root.display(),
        "ownership change refused; falling back to permissive mode bits"
    );
    let n = relax_permissions(root)?;
    tracing::debug!(entries = n, "permissions relaxed");
    Ok(OwnershipMode::PermissiveFallback)
}

#[cfg(unix)]
pub fn ensure_executable(path: &Path) -> Result<(), InstallError> {
    use std::os::unix::fs::PermissionsExt;

    let meta =
        fs::metadata(path).map_err(|e| InstallError::io(format!("stat {}", path.display()), e))?;
    let mode = meta.permissions().mode() & 0o7777;
    if mode & 0o755 != 0o755 {
        fs::set_permissions(path, fs::Permissions::from_mode(mode | 0o755))
            .map_err(|e| InstallError::io(format!("chmod {}", path.display()), e))?;
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn ensure_executable(_path: &Path) -> Result<(), InstallError> {
    Ok(())
}
