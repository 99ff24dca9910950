// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Source side of a migration: Begin, Perform and Confirm.

use slog::{error, info, warn, Logger};
use uuid::Uuid;

use crate::endpoint::check_address;
use crate::migrate::{MigrateError, MigrateRole, MigrationCoordinator};
use crate::params::MigrationParams;
use crate::registry::{lock_container, Container, ShutoffReason};
use crate::session::{Endpoint, MigrationSession};
use crate::staging::{staging_path_for, StagingArea, MIGRATE_STAGING_LABEL};

impl MigrationCoordinator {
    /// Starts an outgoing migration of `name`, returning the container's
    /// definition for the destination to use.
    pub fn begin(
        &self,
        name: &str,
        params: &MigrationParams,
    ) -> Result<String, MigrateError> {
        params.check().map_err(|e| MigrateError::params(name, e))?;

        let container = self.lookup(name)?;
        let guard = lock_container(&container);
        if !guard.is_active() {
            return Err(MigrateError::invalid_state(name, "is not running"));
        }

        info!(self.log, "beginning migration"; "container" => name);
        Ok(guard.definition().to_owned())
    }

    /// Checkpoints `name` and streams it to the address in `params`.
    ///
    /// Returns as soon as the helpers are running; the outcome of the
    /// transfer is collected by [`MigrationCoordinator::confirm`].
    pub fn perform(
        &self,
        name: &str,
        params: &MigrationParams,
    ) -> Result<MigrationSession, MigrateError> {
        params.check().map_err(|e| MigrateError::params(name, e))?;
        let Some(address) = params.migrate_uri.as_deref() else {
            return Err(MigrateError::configuration(
                name,
                "no destination address given",
            ));
        };
        check_address(address).map_err(|e| MigrateError::endpoint(name, e))?;

        let container = self.lookup(name)?;
        let guard = lock_container(&container);
        if !guard.is_active() {
            return Err(MigrateError::invalid_state(name, "is not running"));
        }
        let control = guard.control();
        if !control.may_control() {
            return Err(MigrateError::PermissionDenied(name.to_owned()));
        }
        let Some(init_pid) = control.init_pid() else {
            return Err(MigrateError::invalid_state(name, "has no init process"));
        };

        let id = Uuid::new_v4();
        let log = self.session_log(name, MigrateRole::Source, id);

        let staging = StagingArea::prepare(
            &staging_path_for(&control.config_path(), MIGRATE_STAGING_LABEL),
            self.staging_mode,
            &log,
        )
        .map_err(|e| MigrateError::staging(name, e))?;

        let processes = self
            .supervisor
            .start_senders(self.ports, staging.path(), init_pid, address)
            .map_err(|e| {
                error!(log, "failed to start senders: {e}");
                MigrateError::operation(name, e)
            })?;

        info!(log, "checkpoint transfer started"; "init_pid" => init_pid);
        let endpoint = Endpoint { host: address.to_owned(), ports: self.ports };
        Ok(MigrationSession::new(
            id,
            MigrateRole::Source,
            name,
            endpoint,
            staging,
            processes,
            log,
        ))
    }

    /// Settles the source side after the destination has finished.
    ///
    /// If the transfer succeeded the source instance is stopped; if it failed
    /// or `cancelled` is set the source is resumed, so that exactly one host
    /// ends up running the container. A failed transfer is reported even when
    /// the resume fails as well.
    ///
    /// `name` is always the source-side name: the `destination_name` in
    /// `params` only applies on the destination host and is ignored here.
    pub fn confirm(
        &self,
        name: &str,
        params: &MigrationParams,
        session: Option<MigrationSession>,
        cancelled: bool,
    ) -> Result<(), MigrateError> {
        params.check().map_err(|e| MigrateError::params(name, e))?;

        let container = self.lookup(name)?;
        let mut guard = lock_container(&container);
        let mut session = Self::claim_session(name, MigrateRole::Source, session)?;
        let log = session.log().clone();

        if cancelled {
            info!(log, "migration cancelled, resuming source");
            session.terminate();
            resume_source(&guard, &log)?;
            return Err(MigrateError::Cancelled(name.to_owned()));
        }

        if let Err(e) = self.wait_helpers(name, session.take_processes()) {
            error!(log, "transfer failed, resuming source: {e}");
            if let Err(resume) = resume_source(&guard, &log) {
                error!(log, "source left stopped: {resume}");
            }
            return Err(e);
        }

        guard.control().stop().map_err(|e| {
            error!(log, "failed to stop migrated source: {e}");
            MigrateError::operation(name, e)
        })?;
        guard.set_shutoff(ShutoffReason::Migrated);
        info!(log, "migration complete");
        Ok(())
    }
}

/// Lets a source container whose tasks were left stopped by the dump carry
/// on running.
fn resume_source(container: &Container, log: &Logger) -> Result<(), MigrateError> {
    let control = container.control();
    if !control.is_running() {
        warn!(log, "source is no longer running, nothing to resume");
        return Ok(());
    }
    control.resume().map_err(|e| {
        error!(log, "failed to resume source: {e}");
        MigrateError::operation(container.name(), e)
    })
}
