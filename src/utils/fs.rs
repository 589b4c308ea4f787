use crate::error::{Result, UpdateError};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Decides which entries a recursive copy leaves behind.
///
/// Paths handed to the predicates are relative to the root of the copy.
pub trait CopyFilter: Send + Sync {
    fn skip_dir(&self, relative: &Path) -> bool;
    fn skip_file(&self, relative: &Path) -> bool;
}

/// Copies everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct CopyAll;

impl CopyFilter for CopyAll {
    fn skip_dir(&self, _relative: &Path) -> bool {
        false
    }

    fn skip_file(&self, _relative: &Path) -> bool {
        false
    }
}

/// Rules applied when a new build is copied over a live installation.
///
/// Directories whose relative path contains `user_data_marker` are skipped whole,
/// and files named `protected_file` (case-insensitive) are never overwritten.
#[derive(Debug, Clone)]
pub struct InstallRules {
    pub user_data_marker: String,
    pub protected_file: String,
}

impl InstallRules {
    pub fn new<M: Into<String>, P: Into<String>>(user_data_marker: M, protected_file: P) -> Self {
        Self {
            user_data_marker: user_data_marker.into(),
            protected_file: protected_file.into(),
        }
    }
}

impl CopyFilter for InstallRules {
    fn skip_dir(&self, relative: &Path) -> bool {
        !self.user_data_marker.is_empty()
            && relative.to_string_lossy().contains(&self.user_data_marker)
    }

    fn skip_file(&self, relative: &Path) -> bool {
        !self.protected_file.is_empty()
            && relative
                .file_name()
                .map(|name| {
                    name.to_string_lossy()
                        .eq_ignore_ascii_case(&self.protected_file)
                })
                .unwrap_or(false)
    }
}

pub fn ensure_dir_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path).map_err(|e| UpdateError::filesystem(path, e))?;
    }
    Ok(())
}

pub fn remove_dir_recursive(path: &Path) -> Result<()> {
    if path.exists() {
        std::fs::remove_dir_all(path).map_err(|e| UpdateError::filesystem(path, e))?;
    }
    Ok(())
}

pub fn copy_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        ensure_dir_exists(parent)?;
    }

    std::fs::copy(from, to).map_err(|e| UpdateError::filesystem(to, e))?;
    Ok(())
}

/// Recursively copies `src` into `dst`, overwriting files that already exist.
///
/// Returns the number of files copied. The first failing copy aborts the walk, so a
/// partially written `dst` is possible.
pub fn copy_dir_filtered(src: &Path, dst: &Path, filter: &dyn CopyFilter) -> Result<usize> {
    info!("Copying folder '{}' to '{}'", src.display(), dst.display());
    copy_dir_inner(src, src, dst, filter)
}

fn copy_dir_inner(root: &Path, src: &Path, dst: &Path, filter: &dyn CopyFilter) -> Result<usize> {
    ensure_dir_exists(dst)?;

    let mut copied = 0;
    for entry in std::fs::read_dir(src).map_err(|e| UpdateError::filesystem(src, e))? {
        let entry = entry.map_err(|e| UpdateError::filesystem(src, e))?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let relative = src_path.strip_prefix(root).unwrap_or(&src_path);
        let file_type = entry
            .file_type()
            .map_err(|e| UpdateError::filesystem(&src_path, e))?;

        if file_type.is_symlink() {
            if filter.skip_dir(relative) || filter.skip_file(relative) {
                warn!("Skipping link {}", src_path.display());
                continue;
            }
            if copy_symlink(&src_path, &dst_path)? {
                copied += 1;
            }
        } else if file_type.is_dir() {
            if filter.skip_dir(relative) {
                warn!("Skipping directory {}", src_path.display());
                continue;
            }
            copied += copy_dir_inner(root, &src_path, &dst_path, filter)?;
        } else if filter.skip_file(relative) {
            warn!("Skipping file {}", src_path.display());
        } else {
            std::fs::copy(&src_path, &dst_path)
                .map_err(|e| UpdateError::filesystem(&dst_path, e))?;
            copied += 1;
        }
    }

    Ok(copied)
}

/// Recreates the link at `src` as a link at `dst`, without following it.
///
/// Returns `false` when the platform cannot recreate it and the link was skipped.
#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> Result<bool> {
    let target = std::fs::read_link(src).map_err(|e| UpdateError::filesystem(src, e))?;

    match std::fs::symlink_metadata(dst) {
        Ok(meta) if meta.is_dir() => {
            return Err(UpdateError::filesystem(
                dst,
                std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "a directory is in the way of a link",
                ),
            ));
        }
        Ok(_) => std::fs::remove_file(dst).map_err(|e| UpdateError::filesystem(dst, e))?,
        Err(_) => {}
    }

    std::os::unix::fs::symlink(&target, dst).map_err(|e| UpdateError::filesystem(dst, e))?;
    Ok(true)
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, _dst: &Path) -> Result<bool> {
    warn!("Skipping link {}", src.display());
    Ok(false)
}

/// Deletes a directory tree entry by entry, carrying on past individual failures.
///
/// Returns the number of entries that could not be removed (0 means the tree is gone).
pub fn remove_tree_best_effort(path: &Path) -> usize {
    let entries = match std::fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) => {
            error!("Failed to read folder '{}'. {}", path.display(), e);
            return 1;
        }
    };

    let mut failures = 0;
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                error!("Failed to read entry in '{}'. {}", path.display(), e);
                failures += 1;
                continue;
            }
        };

        let entry_path = entry.path();
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);

        if is_dir {
            failures += remove_tree_best_effort(&entry_path);
        } else if let Err(e) = std::fs::remove_file(&entry_path) {
            error!("Failed to delete file '{}'. {}", entry_path.display(), e);
            failures += 1;
        }
    }

    if let Err(e) = std::fs::remove_dir(path) {
        // A non-empty directory is already accounted for by its children.
        if failures == 0 {
            error!("Failed to delete folder '{}'. {}", path.display(), e);
            failures += 1;
        }
    }

    failures
}

/// Outcome of clearing the subdirectories of a folder.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
}

/// Removes every subdirectory of `root` using `remove`, logging and skipping failures.
///
/// Plain files directly under `root` are left alone.
pub fn clear_subdirectories<F>(root: &Path, mut remove: F) -> Result<CleanupReport>
where
    F: FnMut(&Path) -> Result<()>,
{
    let mut report = CleanupReport::default();

    if !root.exists() {
        return Ok(report);
    }

    for entry in std::fs::read_dir(root).map_err(|e| UpdateError::filesystem(root, e))? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Unable to read entry in '{}'. {}", root.display(), e);
                continue;
            }
        };

        let path = entry.path();
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }

        match remove(&path) {
            Ok(()) => report.removed.push(path),
            Err(e) => {
                info!("Unable to delete '{}'. {}", path.display(), e);
                report.failed.push(path);
            }
        }
    }

    Ok(report)
}

/// Default remover for [`clear_subdirectories`].
pub fn remove_tree(path: &Path) -> Result<()> {
    match remove_tree_best_effort(path) {
        0 => Ok(()),
        failures => Err(UpdateError::filesystem(
            path,
            std::io::Error::other(format!("{failures} entries could not be removed")),
        )),
    }
}

pub fn make_executable(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(path)
            .map_err(|e| UpdateError::filesystem(path, e))?
            .permissions();
        perms.set_mode(perms.mode() | 0o755);
        std::fs::set_permissions(path, perms).map_err(|e| UpdateError::filesystem(path, e))?;
    }

    // On Windows, executable permission is determined by file extension
    #[cfg(windows)]
    {
        let _ = path;
    }

    Ok(())
}
