// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The five-phase live migration protocol.
//!
//! A migration is driven by an outside caller that invokes, in order, Begin
//! and Perform and Confirm on the source host, interleaved with Prepare and
//! Finish on the destination host:
//!
//! ```text
//!   source        destination
//!   ------        -----------
//!   begin   --->  prepare
//!   perform <---  (address)
//!                 finish
//!   confirm <---  (outcome)
//! ```
//!
//! Prepare and Perform return a [`MigrationSession`] that owns the helper
//! processes and staging area for that host; Finish and Confirm consume it.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ctmigrate_config::Config;
use serde::{Deserialize, Serialize};
use slog::Logger;
use thiserror::Error;

use crate::endpoint::{EndpointError, EndpointResolver};
use crate::params::ParamError;
use crate::registry::{Container, ContainerRegistry};
use crate::session::MigrationSession;
use crate::staging::{StagingError, StagingMode};
use crate::supervisor::{
    self, MigrationPorts, ProcessHandle, ProcessSupervisor, SupervisorError,
};

pub mod destination;
pub mod source;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum MigrateRole {
    Source,
    Destination,
}

impl fmt::Display for MigrateRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MigrateRole::Source => "source",
            MigrateRole::Destination => "destination",
        };
        write!(f, "{}", s)
    }
}

/// The stable category of a [`MigrateError`], suitable for reporting to
/// callers on another host.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ErrorKind {
    NoSuchContainer,
    InvalidState,
    ConfigurationError,
    ResourceUnavailable,
    AlreadyExists,
    ProcessFailure,
    OperationFailed,
    PermissionDenied,
    Cancelled,
    MigrationInProgress,
    NoMigrationInProgress,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Errors which may occur during a migration or a local save/restore.
///
/// Every variant names the container involved.
#[derive(Debug, Error)]
pub enum MigrateError {
    #[error("no container with matching name '{0}'")]
    NoSuchContainer(String),

    /// The container is in the wrong state for the requested operation
    #[error("container '{name}' {reason}")]
    InvalidState { name: String, reason: &'static str },

    /// A parameter, path or address supplied by the caller is unusable
    #[error("invalid request for container '{name}': {detail}")]
    Configuration { name: String, detail: String },

    /// A host resource (address, port, directory) could not be obtained
    #[error("resource unavailable for container '{name}': {detail}")]
    ResourceUnavailable { name: String, detail: String },

    #[error("checkpoint for container '{name}' already present at '{}'", .path.display())]
    AlreadyExists { name: String, path: PathBuf },

    /// A helper process exited unsuccessfully
    #[error("migration of container '{name}' failed: {source}")]
    ProcessFailure {
        name: String,
        #[source]
        source: SupervisorError,
    },

    /// A container control operation or helper launch failed
    #[error("operation on container '{name}' failed: {detail}")]
    OperationFailed { name: String, detail: String },

    #[error("not permitted to control container '{0}'")]
    PermissionDenied(String),

    #[error("migration of container '{0}' was cancelled")]
    Cancelled(String),

    #[error("a migration involving container '{0}' is already in progress")]
    MigrationInProgress(String),

    #[error("no migration of container '{0}' is in progress")]
    NoMigrationInProgress(String),
}

impl MigrateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MigrateError::NoSuchContainer(_) => ErrorKind::NoSuchContainer,
            MigrateError::InvalidState { .. } => ErrorKind::InvalidState,
            MigrateError::Configuration { .. } => ErrorKind::ConfigurationError,
            MigrateError::ResourceUnavailable { .. } => {
                ErrorKind::ResourceUnavailable
            }
            MigrateError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            MigrateError::ProcessFailure { .. } => ErrorKind::ProcessFailure,
            MigrateError::OperationFailed { .. } => ErrorKind::OperationFailed,
            MigrateError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            MigrateError::Cancelled(_) => ErrorKind::Cancelled,
            MigrateError::MigrationInProgress(_) => {
                ErrorKind::MigrationInProgress
            }
            MigrateError::NoMigrationInProgress(_) => {
                ErrorKind::NoMigrationInProgress
            }
        }
    }

    /// The name of the container the error concerns.
    pub fn container(&self) -> &str {
        match self {
            MigrateError::NoSuchContainer(name)
            | MigrateError::PermissionDenied(name)
            | MigrateError::Cancelled(name)
            | MigrateError::MigrationInProgress(name)
            | MigrateError::NoMigrationInProgress(name)
            | MigrateError::InvalidState { name, .. }
            | MigrateError::Configuration { name, .. }
            | MigrateError::ResourceUnavailable { name, .. }
            | MigrateError::AlreadyExists { name, .. }
            | MigrateError::ProcessFailure { name, .. }
            | MigrateError::OperationFailed { name, .. } => name,
        }
    }

    pub(crate) fn invalid_state(name: &str, reason: &'static str) -> Self {
        MigrateError::InvalidState { name: name.to_owned(), reason }
    }

    pub(crate) fn configuration(name: &str, detail: impl fmt::Display) -> Self {
        MigrateError::Configuration {
            name: name.to_owned(),
            detail: detail.to_string(),
        }
    }

    pub(crate) fn unavailable(name: &str, detail: impl fmt::Display) -> Self {
        MigrateError::ResourceUnavailable {
            name: name.to_owned(),
            detail: detail.to_string(),
        }
    }

    pub(crate) fn operation(name: &str, detail: impl fmt::Display) -> Self {
        MigrateError::OperationFailed {
            name: name.to_owned(),
            detail: detail.to_string(),
        }
    }

    pub(crate) fn process(name: &str, source: SupervisorError) -> Self {
        MigrateError::ProcessFailure { name: name.to_owned(), source }
    }

    pub(crate) fn params(name: &str, err: ParamError) -> Self {
        Self::configuration(name, err)
    }

    pub(crate) fn staging(name: &str, err: StagingError) -> Self {
        match err {
            StagingError::AlreadyExists(path) => {
                MigrateError::AlreadyExists { name: name.to_owned(), path }
            }
            StagingError::NotFound(_) | StagingError::NotADirectory(_) => {
                Self::configuration(name, err)
            }
            StagingError::Io { .. } => Self::unavailable(name, err),
        }
    }

    pub(crate) fn endpoint(name: &str, err: EndpointError) -> Self {
        match err {
            EndpointError::Hostname(_) => Self::unavailable(name, err),
            EndpointError::Loopback(_)
            | EndpointError::Empty
            | EndpointError::TooLong(_) => Self::configuration(name, err),
        }
    }
}

/// Runs the phases of the migration protocol against the containers of one
/// host.
///
/// The coordinator holds no per-migration state; that lives in the
/// [`MigrationSession`]s its phases hand back.
pub struct MigrationCoordinator {
    registry: Arc<ContainerRegistry>,
    supervisor: ProcessSupervisor,
    resolver: EndpointResolver,
    ports: MigrationPorts,
    staging_mode: StagingMode,
    wait_timeout: Option<Duration>,
    log: Logger,
}

impl MigrationCoordinator {
    pub fn new(
        registry: Arc<ContainerRegistry>,
        config: &Config,
        log: Logger,
    ) -> Self {
        MigrationCoordinator {
            registry,
            supervisor: ProcessSupervisor::new(
                config.helpers.clone(),
                log.new(slog::o!("component" => "supervisor")),
            ),
            resolver: EndpointResolver::default(),
            ports: MigrationPorts::from(&config.migration),
            staging_mode: StagingMode::from(&config.migration),
            wait_timeout: config.migration.wait_timeout_secs.map(Duration::from_secs),
            log,
        }
    }

    /// Replaces the resolver used to pick the address returned by Prepare.
    pub fn with_resolver(mut self, resolver: EndpointResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn registry(&self) -> &Arc<ContainerRegistry> {
        &self.registry
    }

    pub fn ports(&self) -> MigrationPorts {
        self.ports
    }

    fn lookup(&self, name: &str) -> Result<Arc<Mutex<Container>>, MigrateError> {
        self.registry
            .get(name)
            .ok_or_else(|| MigrateError::NoSuchContainer(name.to_owned()))
    }

    fn session_log(
        &self,
        name: &str,
        role: MigrateRole,
        id: uuid::Uuid,
    ) -> Logger {
        self.log.new(slog::o!(
            "container" => name.to_owned(),
            "migrate_role" => role.to_string(),
            "migration_id" => id.to_string(),
        ))
    }

    /// Waits for a session's helpers, bounded by the configured timeout.
    fn wait_helpers(
        &self,
        name: &str,
        handles: Vec<ProcessHandle>,
    ) -> Result<(), MigrateError> {
        let res = match self.wait_timeout {
            Some(timeout) => supervisor::wait_all_timeout(handles, timeout),
            None => supervisor::wait_all(handles),
        };
        res.map_err(|e| MigrateError::process(name, e))
    }

    /// Checks that a session handed to Finish or Confirm belongs to `name`
    /// and was created for `role`.
    fn claim_session(
        name: &str,
        role: MigrateRole,
        session: Option<MigrationSession>,
    ) -> Result<MigrationSession, MigrateError> {
        match session {
            Some(s) if s.container() == name && s.role() == role => Ok(s),
            _ => Err(MigrateError::NoMigrationInProgress(name.to_owned())),
        }
    }
}
