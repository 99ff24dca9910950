// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The set of containers known to this host.
//!
//! Each container sits behind its own mutex, which serves as the per-object
//! lock: an operation takes it on entry and drops it before returning.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use slog::{info, warn, Logger};

use crate::control::ContainerControl;
use crate::lxc::LxcTools;

/// Why a container is running.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunningReason {
    Booted,
    Restored,
    Migrated,
}

/// Why a container is not running.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutoffReason {
    Shutdown,
    Saved,
    Migrated,
    Unknown,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerState {
    Running { pid: u32, reason: RunningReason },
    Shutoff { reason: ShutoffReason },
}

impl ContainerState {
    pub fn is_active(&self) -> bool {
        matches!(self, ContainerState::Running { .. })
    }
}

/// A container record: its definition, the state this host believes it is
/// in, and a handle for controlling it.
pub struct Container {
    name: String,
    definition: String,
    state: ContainerState,
    control: Arc<dyn ContainerControl>,
}

impl Container {
    /// Creates a record, deriving the initial state from the container
    /// itself.
    pub fn new(
        name: impl Into<String>,
        definition: impl Into<String>,
        control: Arc<dyn ContainerControl>,
    ) -> Self {
        let state = match (control.is_running(), control.init_pid()) {
            (true, Some(pid)) => {
                ContainerState::Running { pid, reason: RunningReason::Booted }
            }
            _ => ContainerState::Shutoff { reason: ShutoffReason::Unknown },
        };
        Container { name: name.into(), definition: definition.into(), state, control }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The serialized container definition. Never interpreted here.
    pub fn definition(&self) -> &str {
        &self.definition
    }

    pub fn state(&self) -> ContainerState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn control(&self) -> &dyn ContainerControl {
        self.control.as_ref()
    }

    pub fn set_running(&mut self, pid: u32, reason: RunningReason) {
        self.state = ContainerState::Running { pid, reason };
    }

    pub fn set_shutoff(&mut self, reason: ShutoffReason) {
        self.state = ContainerState::Shutoff { reason };
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("name", &self.name)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Name-indexed container records.
#[derive(Default)]
pub struct ContainerRegistry {
    containers: Mutex<BTreeMap<String, Arc<Mutex<Container>>>>,
}

impl ContainerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from an LXC path: every subdirectory holding a
    /// `config` file is a container.
    pub fn scan(lxc_path: &Path, log: &Logger) -> std::io::Result<Self> {
        let registry = Self::new();
        for entry in std::fs::read_dir(lxc_path)? {
            let entry = entry?;
            let config = entry.path().join("config");
            if !config.is_file() {
                continue;
            }

            let Some(name) = entry.file_name().to_str().map(str::to_owned)
            else {
                warn!(log, "skipping container with non-UTF-8 name";
                      "path" => %entry.path().display());
                continue;
            };

            let definition = match std::fs::read_to_string(&config) {
                Ok(d) => d,
                Err(e) => {
                    warn!(log, "failed to read container config: {e}";
                          "container" => &name);
                    continue;
                }
            };

            let control = Arc::new(LxcTools::new(&name, lxc_path));
            let container = Container::new(name.clone(), definition, control);
            info!(log, "found container";
                  "container" => &name,
                  "state" => ?container.state());
            registry.insert(container);
        }

        Ok(registry)
    }

    /// Adds a container, replacing any previous record with the same name.
    pub fn insert(&self, container: Container) {
        let name = container.name().to_owned();
        self.lock().insert(name, Arc::new(Mutex::new(container)));
    }

    pub fn get(&self, name: &str) -> Option<Arc<Mutex<Container>>> {
        self.lock().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Arc<Mutex<Container>>>> {
        // A panic while holding this lock leaves the map itself intact.
        self.containers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Locks a container record, tolerating a poisoned mutex.
pub fn lock_container(
    container: &Mutex<Container>,
) -> MutexGuard<'_, Container> {
    container.lock().unwrap_or_else(|e| e.into_inner())
}
