use std::{
    fs, io,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryPointLocation {
    Root,
    /// Found inside this immediate subdirectory of the install dir.
    Nested(PathBuf),
    Missing,
}

fn exists_no_follow(p: &Path) -> bool {
    fs::symlink_metadata(p).is_ok()
}

pub fn locate_entry_point(
    install_dir: &Path,
    entry_point: &Path,
) -> io::Result<EntryPointLocation> {
    if exists_no_follow(&install_dir.join(entry_point)) {
        return Ok(EntryPointLocation::Root);
    }

    let mut hits = Vec::<PathBuf>::new();
    for e in fs::read_dir(install_dir)? {
        let e = e?;
        if !e.file_type()?.is_dir() {
            continue;
        }
        let candidate = e.path();
        if exists_no_follow(&candidate.join(entry_point)) {
            hits.push(candidate);
        }
    }

    hits.sort();
    if hits.len() > 1 {
        tracing::warn!(
            candidates = ?hits,
            "entry point found in several subdirectories; using the first"
        );
    }
    Ok(hits
        .into_iter()
        .next()
        .map(EntryPointLocation::Nested)
        .unwrap_or(EntryPointLocation::Missing))
}

fn remove_any(p: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(p)?;
    if meta.is_dir() {
        fs::remove_dir_all(p)
    } else {
        fs::remove_file(p)
    }
}

/// Moves every entry of `subdir` (hidden ones included) into `install_dir` and removes `subdir`.
///
/// The subdirectory is first renamed to a staging name so that a child sharing its name
/// (e.g. `CARLA/CARLA`) can take its place.
pub fn hoist_subdir(install_dir: &Path, subdir: &Path) -> io::Result<usize> {
    let staging = install_dir.join(format!(".hoist-{}", uuid::Uuid::new_v4()));
    fs::rename(subdir, &staging)?;

    let mut moved = 0usize;
    for e in fs::read_dir(&staging)? {
        let e = e?;
        let target = install_dir.join(e.file_name());
        if exists_no_follow(&target) {
            tracing::warn!(path = %target.display(), "replacing top-level entry with nested copy");
            remove_any(&target)?;
        }
        fs::rename(e.path(), &target)?;
        moved += 1;
    }

    fs::remove_dir(&staging)?;
    Ok(moved)
}

/// Removes everything inside `dir` but keeps `dir` itself (it may be a mount point).
pub fn clear_dir(dir: &Path) -> io::Result<()> {
    match fs::read_dir(dir) {
        Ok(rd) => {
            for e in rd {
                remove_any(&e?.path())?;
            }
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => fs::create_dir_all(dir),
        Err(e) => Err(e),
    }
}
