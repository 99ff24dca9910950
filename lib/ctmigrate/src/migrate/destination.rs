// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Destination side of a migration: Prepare and Finish.

use slog::{error, info, warn};
use uuid::Uuid;

use crate::migrate::{MigrateError, MigrateRole, MigrationCoordinator};
use crate::params::MigrationParams;
use crate::registry::{lock_container, RunningReason};
use crate::session::{Endpoint, MigrationSession};
use crate::staging::{staging_path_for, StagingArea, MIGRATE_STAGING_LABEL};

impl MigrationCoordinator {
    /// Readies this host to receive `name` (or the destination name given in
    /// `params`).
    ///
    /// Resolves the address the source should stream to, creates the staging
    /// area under the container's configuration directory and starts the
    /// receiving helpers. Returns the address along with the session, which
    /// must later be handed to [`MigrationCoordinator::finish`].
    pub fn prepare(
        &self,
        name: &str,
        params: &MigrationParams,
    ) -> Result<(String, MigrationSession), MigrateError> {
        let name = params.destination_name_or(name);
        params.check().map_err(|e| MigrateError::params(name, e))?;

        let container = self.lookup(name)?;
        let guard = lock_container(&container);
        if guard.is_active() {
            return Err(MigrateError::invalid_state(name, "is already running"));
        }
        let control = guard.control();
        if !control.may_control() {
            return Err(MigrateError::PermissionDenied(name.to_owned()));
        }

        let address = self
            .resolver
            .resolve_destination(params.migrate_uri.as_deref())
            .map_err(|e| MigrateError::endpoint(name, e))?;

        let id = Uuid::new_v4();
        let log = self.session_log(name, MigrateRole::Destination, id);

        let staging = StagingArea::prepare(
            &staging_path_for(&control.config_path(), MIGRATE_STAGING_LABEL),
            self.staging_mode,
            &log,
        )
        .map_err(|e| MigrateError::staging(name, e))?;

        let processes = self
            .supervisor
            .start_receivers(self.ports, staging.path())
            .map_err(|e| {
                error!(log, "failed to start receivers: {e}");
                MigrateError::unavailable(name, e)
            })?;

        let endpoint = Endpoint { host: address.clone(), ports: self.ports };
        let session = MigrationSession::new(
            id,
            MigrateRole::Destination,
            name,
            endpoint,
            staging,
            processes,
            log,
        );
        Ok((address, session))
    }

    /// Compares the definition relayed from the source's Begin with the one
    /// this host has for `name`. A mismatch is logged but does not stop the
    /// migration, since the restore uses the local configuration.
    pub fn compare_definition(
        &self,
        name: &str,
        definition: &str,
    ) -> Result<bool, MigrateError> {
        let container = self.lookup(name)?;
        let guard = lock_container(&container);
        let same = guard.definition() == definition;
        if !same {
            warn!(self.log, "source definition differs from local one";
                  "container" => name,
                  "local_len" => guard.definition().len(),
                  "source_len" => definition.len());
        }
        Ok(same)
    }

    /// Completes the destination side once the source has performed.
    ///
    /// Unless `cancelled`, waits for the receivers and restores the container
    /// from the staging area. Returns the pid of the restored container. On
    /// any failure the container is left not running, and the session's
    /// helpers and staging area are cleaned up either way.
    pub fn finish(
        &self,
        name: &str,
        params: &MigrationParams,
        session: Option<MigrationSession>,
        cancelled: bool,
    ) -> Result<u32, MigrateError> {
        let name = params.destination_name_or(name);
        params.check().map_err(|e| MigrateError::params(name, e))?;

        let container = self.lookup(name)?;
        let mut guard = lock_container(&container);
        let mut session =
            Self::claim_session(name, MigrateRole::Destination, session)?;
        let log = session.log().clone();

        if cancelled {
            info!(log, "migration cancelled, discarding incoming image");
            session.terminate();
            return Err(MigrateError::Cancelled(name.to_owned()));
        }

        if guard.is_active() {
            return Err(MigrateError::invalid_state(name, "is already running"));
        }

        if let Err(e) = self.wait_helpers(name, session.take_processes()) {
            error!(log, "transfer failed: {e}");
            return Err(e);
        }

        let control = guard.control();
        control.restore(session.staging_path(), true).map_err(|e| {
            error!(log, "restore failed: {e}");
            MigrateError::operation(name, e)
        })?;
        let Some(pid) = control.init_pid() else {
            error!(log, "restored container has no init process");
            return Err(MigrateError::operation(
                name,
                "restored container has no init process",
            ));
        };

        guard.set_running(pid, RunningReason::Migrated);
        info!(log, "container restored"; "pid" => pid);
        Ok(pid)
    }
}
