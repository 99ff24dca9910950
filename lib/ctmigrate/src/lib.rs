// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Live migration of LXC containers between hosts by checkpoint and restore.

pub mod control;
pub mod endpoint;
pub mod lxc;
pub mod migrate;
pub mod params;
pub mod registry;
pub mod save;
pub mod session;
pub mod staging;
pub mod supervisor;

pub use control::{ContainerControl, ControlError};
pub use migrate::{ErrorKind, MigrateError, MigrateRole, MigrationCoordinator};
pub use params::MigrationParams;
pub use registry::{Container, ContainerRegistry, ContainerState};
pub use session::{MigrationSession, SessionTable};
