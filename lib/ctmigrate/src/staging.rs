// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Directories that hold checkpoint images.
//!
//! Two kinds of directory live here. A *staging area* is scratch space for a
//! single migration: it is created (preferably on a tmpfs) when the migration
//! starts and removed when the owning session goes away, whatever the outcome.
//! A *checkpoint directory* is the durable target of a local save; there may
//! be only one checkpoint per directory.

use std::fs::DirBuilder;
use std::io;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use ctmigrate_config::{Migration, StagingKind};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use serde::{Deserialize, Serialize};
use slog::{debug, info, warn, Logger};
use thiserror::Error;

/// Name of the scratch directory created under a container's configuration
/// directory while it migrates.
pub const MIGRATE_STAGING_LABEL: &str = "migrate_tmpfs";

const STAGING_DIR_MODE: u32 = 0o700;
const CHECKPOINT_DIR_MODE: u32 = 0o750;

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("path '{0}' does not exist")]
    NotFound(PathBuf),

    #[error("path '{0}' is not a directory")]
    NotADirectory(PathBuf),

    #[error("already a checkpoint present at '{0}'")]
    AlreadyExists(PathBuf),

    #[error("failed to prepare '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl StagingError {
    fn io(path: &Path, source: io::Error) -> Self {
        StagingError::Io { path: path.to_owned(), source }
    }
}

/// What is currently on disk at a path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingInfo {
    pub path: PathBuf,
    pub exists: bool,
    pub is_dir: bool,
}

impl StagingInfo {
    pub fn inspect(path: &Path) -> Self {
        let meta = std::fs::metadata(path).ok();
        StagingInfo {
            path: path.to_owned(),
            exists: meta.is_some(),
            is_dir: meta.map(|m| m.is_dir()).unwrap_or(false),
        }
    }

    /// Fails unless the path is an existing directory.
    pub fn require_dir(&self) -> Result<(), StagingError> {
        if !self.exists {
            return Err(StagingError::NotFound(self.path.clone()));
        }
        if !self.is_dir {
            return Err(StagingError::NotADirectory(self.path.clone()));
        }
        Ok(())
    }
}

/// Backing storage requested for a staging area.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StagingMode {
    Tmpfs { size_mib: u64 },
    Directory,
}

impl From<&Migration> for StagingMode {
    fn from(cfg: &Migration) -> Self {
        match cfg.staging {
            StagingKind::Tmpfs => {
                StagingMode::Tmpfs { size_mib: cfg.tmpfs_size_mib }
            }
            StagingKind::Directory => StagingMode::Directory,
        }
    }
}

/// Joins a container's configuration directory with a scratch label.
pub fn staging_path_for(config_dir: &Path, label: &str) -> PathBuf {
    config_dir.join(label)
}

/// Creates the directory a local save writes `name`'s checkpoint into.
///
/// `target_dir` must already exist. Fails with
/// [`StagingError::AlreadyExists`] if a checkpoint for `name` is already
/// there, so a second save into the same place is refused until the first
/// is cleaned up.
pub fn checkpoint_dir_for(
    target_dir: &Path,
    name: &str,
) -> Result<PathBuf, StagingError> {
    StagingInfo::inspect(target_dir).require_dir()?;

    let path = target_dir.join(name);
    match DirBuilder::new().mode(CHECKPOINT_DIR_MODE).create(&path) {
        Ok(()) => Ok(path),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            Err(StagingError::AlreadyExists(path))
        }
        Err(e) => Err(StagingError::io(&path, e)),
    }
}

/// Scratch space for one migration. Dropping it unmounts anything it mounted
/// and removes anything it created.
#[derive(Debug)]
pub struct StagingArea {
    path: PathBuf,
    created: bool,
    mounted: bool,
    log: Logger,
}

impl StagingArea {
    /// Makes `path` ready to receive a checkpoint image.
    ///
    /// A missing directory is created with mode 0700. An existing one is
    /// emptied. If something is already mounted there it is used as is;
    /// otherwise a tmpfs is mounted when `mode` asks for one and the mount
    /// succeeds.
    pub fn prepare(
        path: &Path,
        mode: StagingMode,
        log: &Logger,
    ) -> Result<Self, StagingError> {
        let log = log.new(slog::o!("staging" => path.display().to_string()));

        let info = StagingInfo::inspect(path);
        let created = if info.exists {
            if !info.is_dir {
                return Err(StagingError::NotADirectory(path.to_owned()));
            }
            clear_dir(path).map_err(|e| StagingError::io(path, e))?;
            false
        } else {
            DirBuilder::new()
                .mode(STAGING_DIR_MODE)
                .create(path)
                .map_err(|e| StagingError::io(path, e))?;
            true
        };

        // From here on, dropping `area` undoes whatever was done above.
        let mut area = StagingArea { path: path.to_owned(), created, mounted: false, log };

        let premounted = is_mountpoint(path).unwrap_or(false);
        match mode {
            StagingMode::Tmpfs { .. } if premounted => {
                info!(area.log, "using scratch storage already mounted");
            }
            StagingMode::Tmpfs { size_mib } => {
                match mount_tmpfs(path, size_mib) {
                    Ok(()) => {
                        area.mounted = true;
                        info!(area.log, "mounted tmpfs"; "size_mib" => size_mib);
                    }
                    Err(e) => {
                        warn!(area.log,
                              "tmpfs unavailable, staging on disk: {e}");
                    }
                }
            }
            StagingMode::Directory => {}
        }

        if !area.mounted && !premounted {
            std::fs::set_permissions(
                path,
                std::fs::Permissions::from_mode(STAGING_DIR_MODE),
            )
            .map_err(|e| StagingError::io(path, e))?;
        }

        debug!(area.log, "staging area ready";
               "created" => area.created,
               "tmpfs" => area.mounted);
        Ok(area)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True if this area mounted a tmpfs that it will unmount on drop.
    pub fn is_tmpfs(&self) -> bool {
        self.mounted
    }

    pub fn info(&self) -> StagingInfo {
        StagingInfo::inspect(&self.path)
    }
}

impl Drop for StagingArea {
    fn drop(&mut self) {
        if self.mounted {
            if let Err(e) = unmount(&self.path) {
                warn!(self.log, "failed to unmount staging tmpfs: {e}");
            }
        }

        let res = if self.created {
            std::fs::remove_dir_all(&self.path)
        } else {
            clear_dir(&self.path)
        };
        match res {
            Ok(()) => debug!(self.log, "staging area cleaned up"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(self.log, "failed to clean up staging area: {e}"),
        }
    }
}

/// Removes everything inside `dir`, leaving `dir` itself in place.
fn clear_dir(dir: &Path) -> io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            std::fs::remove_dir_all(entry.path())?;
        } else {
            std::fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

/// A directory is a mount point if it sits on a different device than its
/// parent.
fn is_mountpoint(path: &Path) -> io::Result<bool> {
    let here = std::fs::metadata(path)?;
    let parent = std::fs::metadata(path.join(".."))?;
    Ok(here.dev() != parent.dev())
}

fn mount_tmpfs(path: &Path, size_mib: u64) -> io::Result<()> {
    let data = format!("size={size_mib}m,mode={STAGING_DIR_MODE:o}");
    mount(
        Some("tmpfs"),
        path,
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        Some(data.as_str()),
    )?;
    Ok(())
}

fn unmount(path: &Path) -> io::Result<()> {
    if umount2(path, MntFlags::empty()).is_ok() {
        return Ok(());
    }
    // Something still holds the mount open; detach it so the directory can
    // still be removed.
    umount2(path, MntFlags::MNT_DETACH)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    #[test]
    fn staging_path_joins_label() {
        assert_eq!(
            staging_path_for(Path::new("/var/lib/lxc/web1"), MIGRATE_STAGING_LABEL),
            PathBuf::from("/var/lib/lxc/web1/migrate_tmpfs")
        );
    }

    #[test]
    fn checkpoint_dir_refuses_second_checkpoint() {
        let target = tempfile::tempdir().unwrap();

        let first = checkpoint_dir_for(target.path(), "web1").unwrap();
        assert_eq!(first, target.path().join("web1"));
        assert!(first.is_dir());

        assert!(matches!(
            checkpoint_dir_for(target.path(), "web1"),
            Err(StagingError::AlreadyExists(p)) if p == first
        ));

        // After cleanup the same name may be used again.
        std::fs::remove_dir(&first).unwrap();
        checkpoint_dir_for(target.path(), "web1").unwrap();
    }

    #[test]
    fn checkpoint_dir_requires_existing_target() {
        let target = tempfile::tempdir().unwrap();
        let missing = target.path().join("nope");
        assert!(matches!(
            checkpoint_dir_for(&missing, "web1"),
            Err(StagingError::NotFound(_))
        ));

        let file = target.path().join("file");
        std::fs::write(&file, b"x").unwrap();
        assert!(matches!(
            checkpoint_dir_for(&file, "web1"),
            Err(StagingError::NotADirectory(_))
        ));
    }

    #[test]
    fn created_area_is_removed_on_drop() {
        let cfg = tempfile::tempdir().unwrap();
        let path = staging_path_for(cfg.path(), MIGRATE_STAGING_LABEL);

        let area =
            StagingArea::prepare(&path, StagingMode::Directory, &test_logger())
                .unwrap();
        let info = area.info();
        assert!(info.exists && info.is_dir);
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, STAGING_DIR_MODE);

        std::fs::write(path.join("pages-1.img"), b"pages").unwrap();
        drop(area);
        assert!(!path.exists());
    }

    #[test]
    fn existing_area_is_emptied_but_kept() {
        let cfg = tempfile::tempdir().unwrap();
        let path = cfg.path().join(MIGRATE_STAGING_LABEL);
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("stale.img"), b"old").unwrap();
        std::fs::create_dir(path.join("nested")).unwrap();

        let area =
            StagingArea::prepare(&path, StagingMode::Directory, &test_logger())
                .unwrap();
        assert_eq!(std::fs::read_dir(&path).unwrap().count(), 0);

        std::fs::write(path.join("core-1.img"), b"new").unwrap();
        drop(area);
        assert!(path.is_dir());
        assert_eq!(std::fs::read_dir(&path).unwrap().count(), 0);
    }

    #[test]
    fn tmpfs_request_always_cleans_up() {
        // Whether or not this process may mount, the area must be usable and
        // must vanish when dropped.
        let cfg = tempfile::tempdir().unwrap();
        let path = cfg.path().join(MIGRATE_STAGING_LABEL);

        let area = StagingArea::prepare(
            &path,
            StagingMode::Tmpfs { size_mib: 16 },
            &test_logger(),
        )
        .unwrap();
        std::fs::write(path.join("inventory.img"), b"inv").unwrap();
        drop(area);
        assert!(!path.exists());
    }

    #[test]
    fn file_in_the_way_is_rejected() {
        let cfg = tempfile::tempdir().unwrap();
        let path = cfg.path().join(MIGRATE_STAGING_LABEL);
        std::fs::write(&path, b"x").unwrap();
        assert!(matches!(
            StagingArea::prepare(&path, StagingMode::Directory, &test_logger()),
            Err(StagingError::NotADirectory(_))
        ));
    }
}
