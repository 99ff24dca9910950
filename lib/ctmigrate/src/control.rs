// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The narrow interface migration uses to inspect and manipulate a single
//! container.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors raised by a [`ContainerControl`] implementation.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    CommandFailed { program: String, status: String, stderr: String },

    #[error("configuration key {0} is not set")]
    MissingConfigItem(String),

    #[error("unexpected output from {program}: {output}")]
    UnexpectedOutput { program: String, output: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Operations on one container that the migration and save/restore code
/// needs.
///
/// Implementations wrap whatever actually runs containers on the host. The
/// trait exists so that the protocol logic can be exercised against fakes.
#[cfg_attr(test, mockall::automock)]
pub trait ContainerControl: Send + Sync {
    /// Returns true if the container's init process is alive.
    fn is_running(&self) -> bool;

    /// Returns true if the caller has enough privilege to checkpoint, restore
    /// and stop this container.
    fn may_control(&self) -> bool;

    /// Writes a checkpoint image of the running container into `dir`.
    ///
    /// When `stop` is set, the container is stopped once the image is
    /// complete; otherwise it keeps running.
    fn checkpoint(&self, dir: &Path, stop: bool) -> Result<(), ControlError>;

    /// Restores the container from the image in `dir`. With `detach` the call
    /// returns once the restored tree is running in the background.
    fn restore(&self, dir: &Path, detach: bool) -> Result<(), ControlError>;

    /// Stops the container.
    fn stop(&self) -> Result<(), ControlError>;

    /// Continues a container whose tasks were left stopped by a dump.
    fn resume(&self) -> Result<(), ControlError>;

    /// The pid of the container's init process, if it is running.
    fn init_pid(&self) -> Option<u32>;

    /// Reads one item of the container's configuration.
    fn config_item(&self, key: &str) -> Result<String, ControlError>;

    /// The directory holding the container's configuration.
    fn config_path(&self) -> PathBuf;
}
