// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Definitions for types exposed by the ctmigrate-server API

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Deserialize, Serialize, JsonSchema)]
pub struct ContainerPathParams {
    pub name: String,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub enum RunningReason {
    Booted,
    Restored,
    Migrated,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub enum ShutoffReason {
    Shutdown,
    Saved,
    Migrated,
    Unknown,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ContainerState {
    Running { pid: u32, reason: RunningReason },
    Shutoff { reason: ShutoffReason },
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub struct Container {
    pub name: String,
    pub state: ContainerState,

    /// Whether a migration involving this container is in progress on this
    /// host.
    pub migrating: bool,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct ContainerList {
    pub containers: Vec<Container>,
}

/// Parameters accompanying every migration phase.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MigrationParams {
    /// Name the container is known by on the destination host.
    #[serde(default)]
    pub destination_name: Option<String>,

    /// Address the source should stream the checkpoint to.
    #[serde(default)]
    pub migrate_uri: Option<String>,

    /// Reserved; must be zero.
    #[serde(default)]
    pub flags: u32,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, Serialize)]
pub struct MigrateBeginRequest {
    #[serde(default)]
    pub params: MigrationParams,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct MigrateBeginResponse {
    /// The container's definition, passed through to the destination
    /// untouched.
    pub definition: String,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct MigratePrepareRequest {
    /// Name of the container on the source host.
    pub name: String,

    /// Definition returned by the source's begin call.
    #[serde(default)]
    pub definition: Option<String>,

    #[serde(default)]
    pub params: MigrationParams,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct MigratePrepareResponse {
    pub migration_id: Uuid,

    /// Address the source must stream the checkpoint to.
    pub address: String,
    pub checkpoint_port: u16,
    pub copy_port: u16,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, Serialize)]
pub struct MigratePerformRequest {
    #[serde(default)]
    pub params: MigrationParams,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct MigratePerformResponse {
    pub migration_id: Uuid,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct MigrateFinishRequest {
    pub name: String,

    #[serde(default)]
    pub params: MigrationParams,

    /// Set when the source side failed; the incoming image is discarded.
    #[serde(default)]
    pub cancelled: bool,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct MigrateFinishResponse {
    /// Pid of the restored container's init process.
    pub pid: u32,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct MigrateConfirmRequest {
    pub name: String,

    #[serde(default)]
    pub params: MigrationParams,

    /// Set when the destination failed; the source is resumed.
    #[serde(default)]
    pub cancelled: bool,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct ContainerSaveRequest {
    /// Existing directory the checkpoint is written under, as `<to>/<name>`.
    pub to: String,

    /// Keep the container running after the checkpoint.
    #[serde(default)]
    pub running: bool,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct ContainerSaveResponse {
    pub path: String,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct ContainerRestoreRequest {
    /// Checkpoint directory; its last component names the container.
    pub from: String,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct ContainerRestoreResponse {
    pub name: String,
    pub pid: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_state_is_tagged() {
        let state = ContainerState::Running { pid: 4242, reason: RunningReason::Migrated };
        let json = serde_json::to_value(state).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"state": "running", "pid": 4242, "reason": "Migrated"})
        );
    }

    #[test]
    fn params_reject_cookies() {
        let res: Result<MigrationParams, _> = serde_json::from_str(
            r#"{"migrate_uri": "db-7.internal", "cookie": "c2Vzc2lvbg=="}"#,
        );
        assert!(res.is_err());
    }

    #[test]
    fn request_defaults() {
        let req: MigrateFinishRequest =
            serde_json::from_str(r#"{"name": "web1"}"#).unwrap();
        assert!(!req.cancelled);
        assert_eq!(req.params, MigrationParams::default());
    }
}
