// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed parameters accepted by every migration phase.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name the container should have on the destination host.
pub const PARAM_DESTINATION_NAME: &str = "destination_name";

/// Address the source streams the checkpoint to.
pub const PARAM_MIGRATE_URI: &str = "migrate_uri";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParamError {
    #[error("unsupported migration parameter '{0}'")]
    UnknownKey(String),

    #[error("migration parameter '{0}' given more than once")]
    Duplicate(String),

    #[error("unsupported migration flags {0:#x}")]
    UnsupportedFlags(u32),
}

/// Parameters passed along with each phase of a migration.
///
/// No flags are currently defined, so `flags` must be zero.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MigrationParams {
    #[serde(default)]
    pub destination_name: Option<String>,

    #[serde(default)]
    pub migrate_uri: Option<String>,

    #[serde(default)]
    pub flags: u32,
}

impl MigrationParams {
    /// Builds parameters from untyped key/value pairs, rejecting keys outside
    /// the allowed set.
    pub fn from_pairs<'a, I>(pairs: I) -> Result<Self, ParamError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut params = MigrationParams::default();
        for (key, value) in pairs {
            let slot = match key {
                PARAM_DESTINATION_NAME => &mut params.destination_name,
                PARAM_MIGRATE_URI => &mut params.migrate_uri,
                other => return Err(ParamError::UnknownKey(other.to_owned())),
            };
            if slot.replace(value.to_owned()).is_some() {
                return Err(ParamError::Duplicate(key.to_owned()));
            }
        }
        Ok(params)
    }

    pub fn check(&self) -> Result<(), ParamError> {
        if self.flags != 0 {
            return Err(ParamError::UnsupportedFlags(self.flags));
        }
        Ok(())
    }

    /// The destination-side name: the explicit destination name if one was
    /// given, otherwise `name`.
    pub fn destination_name_or<'a>(&'a self, name: &'a str) -> &'a str {
        self.destination_name.as_deref().unwrap_or(name)
    }
}
