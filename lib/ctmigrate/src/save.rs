// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Checkpointing a container to a local directory and restoring it again.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use slog::{error, info, Logger};

use crate::migrate::MigrateError;
use crate::registry::{
    lock_container, ContainerRegistry, RunningReason, ShutoffReason,
};
use crate::staging::{checkpoint_dir_for, StagingInfo};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveFlags {
    /// Leave the container running once the checkpoint has been written.
    #[serde(default)]
    pub running: bool,
}

/// Local save and restore against one registry.
pub struct CheckpointStore<'a> {
    registry: &'a ContainerRegistry,
    checkpoint_tool: &'a str,
    log: &'a Logger,
}

impl<'a> CheckpointStore<'a> {
    /// `checkpoint_tool` must be found on `PATH` before anything is
    /// attempted.
    pub fn new(
        registry: &'a ContainerRegistry,
        checkpoint_tool: &'a str,
        log: &'a Logger,
    ) -> Self {
        CheckpointStore { registry, checkpoint_tool, log }
    }

    /// Checkpoints `name` into `to/name`, which must not exist yet.
    ///
    /// Returns the directory the checkpoint was written to.
    pub fn save(
        &self,
        name: &str,
        to: &Path,
        flags: SaveFlags,
    ) -> Result<PathBuf, MigrateError> {
        StagingInfo::inspect(to)
            .require_dir()
            .map_err(|e| MigrateError::staging(name, e))?;

        let container = self
            .registry
            .get(name)
            .ok_or_else(|| MigrateError::NoSuchContainer(name.to_owned()))?;
        let mut guard = lock_container(&container);
        if !guard.is_active() {
            return Err(MigrateError::invalid_state(name, "is not running"));
        }
        let control = guard.control();
        if !control.may_control() {
            return Err(MigrateError::PermissionDenied(name.to_owned()));
        }
        self.require_tool(name)?;

        let dir =
            checkpoint_dir_for(to, name).map_err(|e| MigrateError::staging(name, e))?;

        let log = self.log.new(slog::o!("container" => name.to_owned()));
        control.checkpoint(&dir, !flags.running).map_err(|e| {
            error!(log, "checkpoint failed: {e}"; "dir" => %dir.display());
            // Leave nothing behind that would block the next attempt.
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                error!(log, "failed to remove partial checkpoint: {e}");
            }
            MigrateError::operation(name, e)
        })?;

        if !flags.running {
            guard.set_shutoff(ShutoffReason::Saved);
        }
        info!(log, "container saved";
              "dir" => %dir.display(),
              "running" => flags.running);
        Ok(dir)
    }

    /// Restores the container named by the last component of `from`.
    ///
    /// Returns the container's name and the pid of its restored init process.
    pub fn restore(&self, from: &Path) -> Result<(String, u32), MigrateError> {
        let Some(name) = from
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.is_empty())
        else {
            return Err(MigrateError::configuration(
                &from.display().to_string(),
                "path does not name a container",
            ));
        };

        let container = self
            .registry
            .get(name)
            .ok_or_else(|| MigrateError::NoSuchContainer(name.to_owned()))?;
        let mut guard = lock_container(&container);
        if guard.is_active() {
            return Err(MigrateError::invalid_state(name, "is already running"));
        }
        let control = guard.control();
        if !control.may_control() {
            return Err(MigrateError::PermissionDenied(name.to_owned()));
        }
        self.require_tool(name)?;
        StagingInfo::inspect(from)
            .require_dir()
            .map_err(|e| MigrateError::staging(name, e))?;

        let log = self.log.new(slog::o!("container" => name.to_owned()));
        control.restore(from, true).map_err(|e| {
            error!(log, "restore failed: {e}"; "dir" => %from.display());
            MigrateError::operation(name, e)
        })?;
        let Some(pid) = control.init_pid() else {
            return Err(MigrateError::operation(
                name,
                "restored container has no init process",
            ));
        };

        guard.set_running(pid, RunningReason::Restored);
        info!(log, "container restored"; "pid" => pid, "dir" => %from.display());
        Ok((name.to_owned(), pid))
    }

    fn require_tool(&self, name: &str) -> Result<(), MigrateError> {
        match find_in_path(self.checkpoint_tool) {
            Some(_) => Ok(()),
            None => Err(MigrateError::unavailable(
                name,
                format!("{} not found on PATH", self.checkpoint_tool),
            )),
        }
    }
}

/// Looks for an executable file called `program` in each `PATH` directory.
/// A name containing a slash is checked as given.
pub fn find_in_path(program: &str) -> Option<PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    let is_executable = |p: &Path| {
        std::fs::metadata(p)
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    };

    if program.contains('/') {
        let path = PathBuf::from(program);
        return is_executable(&path).then_some(path);
    }

    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}
