// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-host state of an in-flight migration.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use slog::{info, warn, Logger};
use uuid::Uuid;

use crate::migrate::{MigrateError, MigrateRole};
use crate::staging::StagingArea;
use crate::supervisor::{self, MigrationPorts, ProcessHandle};

/// Where the checkpoint stream is headed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub ports: MigrationPorts,
}

/// The resources one host holds for a single migration: its helper processes
/// and its staging area.
///
/// Created by Prepare on the destination or Perform on the source and
/// consumed by Finish or Confirm. Dropping a session, on any path, kills its
/// remaining helpers and then removes its staging area.
pub struct MigrationSession {
    id: Uuid,
    role: MigrateRole,
    container: String,
    endpoint: Endpoint,

    // Helpers must be gone before the staging area they write into is
    // removed; fields drop in declaration order.
    processes: Vec<ProcessHandle>,
    staging: StagingArea,

    log: Logger,
}

impl std::fmt::Debug for MigrationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationSession")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("container", &self.container)
            .field("endpoint", &self.endpoint)
            .field("processes", &self.processes)
            .field("staging", &self.staging.path())
            .finish()
    }
}

impl MigrationSession {
    pub(crate) fn new(
        id: Uuid,
        role: MigrateRole,
        container: &str,
        endpoint: Endpoint,
        staging: StagingArea,
        processes: Vec<ProcessHandle>,
        log: Logger,
    ) -> Self {
        info!(log, "migration session started";
              "host" => &endpoint.host,
              "staging" => %staging.path().display());
        MigrationSession {
            id,
            role,
            container: container.to_owned(),
            endpoint,
            processes,
            staging,
            log,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn role(&self) -> MigrateRole {
        self.role
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn staging_path(&self) -> &Path {
        self.staging.path()
    }

    pub fn processes(&self) -> &[ProcessHandle] {
        &self.processes
    }

    pub(crate) fn log(&self) -> &Logger {
        &self.log
    }

    /// Takes the helper handles out of the session so they can be joined.
    pub(crate) fn take_processes(&mut self) -> Vec<ProcessHandle> {
        std::mem::take(&mut self.processes)
    }

    /// Kills every helper still running for this session.
    pub fn terminate(&self) {
        supervisor::terminate_all(&self.processes);
    }
}

impl Drop for MigrationSession {
    fn drop(&mut self) {
        let live = self.processes.iter().filter(|p| p.pid().is_some()).count();
        if live > 0 {
            warn!(self.log, "terminating helpers of abandoned session";
                  "count" => live);
            self.terminate();
        }
        info!(self.log, "migration session ended");
    }
}

enum Entry {
    /// A phase is setting the session up.
    Reserved(MigrateRole),
    Active(MigrationSession),
}

impl Entry {
    fn role(&self) -> MigrateRole {
        match self {
            Entry::Reserved(role) => *role,
            Entry::Active(session) => session.role(),
        }
    }
}

/// Sessions held between phase calls, keyed by container name.
///
/// A container takes part in at most one migration at a time. Because the
/// receiving ports are fixed, a host is also the destination of at most one
/// migration at a time.
#[derive(Default)]
pub struct SessionTable {
    entries: Mutex<BTreeMap<String, Entry>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `name` for a new session in `role`. The claim is released if
    /// the returned reservation is dropped without being filled.
    pub fn reserve(
        &self,
        name: &str,
        role: MigrateRole,
    ) -> Result<Reservation<'_>, MigrateError> {
        let mut entries = self.lock();
        if entries.contains_key(name) {
            return Err(MigrateError::MigrationInProgress(name.to_owned()));
        }
        if role == MigrateRole::Destination
            && entries.values().any(|e| e.role() == MigrateRole::Destination)
        {
            return Err(MigrateError::MigrationInProgress(name.to_owned()));
        }
        entries.insert(name.to_owned(), Entry::Reserved(role));
        Ok(Reservation { table: self, name: name.to_owned(), filled: false })
    }

    /// Removes and returns the session for `name` if it was created in
    /// `role`. The slot stays reserved until the returned reservation is
    /// dropped, so the phase consuming the session keeps its claim on the
    /// container and on the receiving ports until it returns.
    pub fn take(
        &self,
        name: &str,
        role: MigrateRole,
    ) -> Option<(MigrationSession, Reservation<'_>)> {
        let mut entries = self.lock();
        if !matches!(entries.get(name), Some(Entry::Active(s)) if s.role() == role)
        {
            return None;
        }
        let Some(Entry::Active(session)) =
            entries.insert(name.to_owned(), Entry::Reserved(role))
        else {
            return None;
        };
        drop(entries);
        let reservation =
            Reservation { table: self, name: name.to_owned(), filled: false };
        Some((session, reservation))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A claim on a [`SessionTable`] slot.
pub struct Reservation<'a> {
    table: &'a SessionTable,
    name: String,
    filled: bool,
}

impl Reservation<'_> {
    /// Stores `session` in the reserved slot.
    pub fn fill(mut self, session: MigrationSession) {
        self.table.lock().insert(self.name.clone(), Entry::Active(session));
        self.filled = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.filled {
            self.table.lock().remove(&self.name);
        }
    }
}
