use std::path::{Path, PathBuf};

use crate::error::InstallError;

#[cfg(unix)]
pub fn free_bytes(p: &Path) -> Option<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c = CString::new(p.as_os_str().as_bytes()).ok()?;
    let mut s: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c.as_ptr(), &mut s) };
    if rc != 0 {
        return None;
    }
    Some((s.f_frsize as u64).saturating_mul(s.f_bavail as u64))
}

#[cfg(not(unix))]
pub fn free_bytes(_p: &Path) -> Option<u64> {
    None
}

/// Nearest ancestor that exists, so directories not created yet can still be probed.
pub fn probe_path(p: &Path) -> PathBuf {
    let mut cur = p;
    loop {
        if cur.exists() {
            return cur.to_path_buf();
        }
        match cur.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => cur = parent,
            _ => return PathBuf::from("."),
        }
    }
}

pub fn ensure_free_space(
    purpose: &'static str,
    path: &Path,
    required: u64,
) -> Result<(), InstallError> {
    if required == 0 {
        return Ok(());
    }

    let probe = probe_path(path);
    let Some(free) = free_bytes(&probe) else {
        tracing::warn!(
            path = %probe.display(),
            purpose,
            "could not determine free space; skipping check"
        );
        return Ok(());
    };

    tracing::debug!(path = %probe.display(), purpose, free, required, "disk space preflight");
    if free < required {
        return Err(InstallError::Capacity {
            purpose,
            path: path.to_path_buf(),
            free,
            required,
            shortfall: required - free,
        });
    }
    Ok(())
}

#[cfg(unix)]
pub fn lookup_user(name: &str) -> Option<(u32, u32)> {
    use std::ffi::CString;

    let c = CString::new(name).ok()?;
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut buf = vec![0 as libc::c_char; 16 * 1024];
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    let rc = unsafe {
        libc::getpwnam_r(
            c.as_ptr(),
            &mut pwd,
            buf.as_mut_ptr(),
            buf.len(),
            &mut result,
        )
    };
    if rc != 0 || result.is_null() {
        return None;
    }
    Some((pwd.pw_uid, pwd.pw_gid))
}

#[cfg(not(unix))]
pub fn lookup_user(_name: &str) -> Option<(u32, u32)> {
    None
}
