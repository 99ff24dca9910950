// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Describes a migration daemon config which may be parsed from a TOML file.

use std::path::{Path, PathBuf};

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

/// Default location of LXC container directories.
pub const DEFAULT_LXC_PATH: &str = "/var/lib/lxc";

/// Default port for the checkpoint page stream.
pub const DEFAULT_CHECKPOINT_PORT: u16 = 1234;

/// Default port for the bulk copy of the remaining image files.
pub const DEFAULT_COPY_PORT: u16 = 1235;

/// Configuration for the migration daemon.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct Config {
    /// Directory holding one subdirectory per container.
    #[serde(default = "default_lxc_path")]
    pub lxc_path: PathBuf,

    /// Name of the checkpoint tool that must be present on `PATH` before a
    /// save or restore is attempted.
    #[serde(default = "default_checkpoint_tool")]
    pub checkpoint_tool: String,

    #[serde(default)]
    pub migration: Migration,

    #[serde(default)]
    pub helpers: Helpers,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            lxc_path: default_lxc_path(),
            checkpoint_tool: default_checkpoint_tool(),
            migration: Migration::default(),
            helpers: Helpers::default(),
        }
    }
}

fn default_lxc_path() -> PathBuf {
    PathBuf::from(DEFAULT_LXC_PATH)
}

fn default_checkpoint_tool() -> String {
    "criu".to_string()
}

/// How the scratch directory used during a migration is backed.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum StagingKind {
    /// Mount a tmpfs on the scratch directory when possible.
    #[default]
    Tmpfs,

    /// Use a plain directory on whatever filesystem holds the container.
    Directory,
}

/// Network and staging parameters shared by every migration this daemon
/// takes part in.
///
/// The ports are fixed for the lifetime of the daemon, so only one incoming
/// migration can be in flight at a time.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct Migration {
    #[serde(default = "default_checkpoint_port")]
    pub checkpoint_port: u16,

    #[serde(default = "default_copy_port")]
    pub copy_port: u16,

    #[serde(default)]
    pub staging: StagingKind,

    /// Size limit passed to the tmpfs mount, in MiB.
    #[serde(default = "default_tmpfs_size_mib")]
    pub tmpfs_size_mib: u64,

    /// Upper bound on how long Finish and Confirm wait for helper processes.
    /// Waits are unbounded when unset.
    #[serde(default)]
    pub wait_timeout_secs: Option<u64>,
}

impl Default for Migration {
    fn default() -> Self {
        Migration {
            checkpoint_port: default_checkpoint_port(),
            copy_port: default_copy_port(),
            staging: StagingKind::default(),
            tmpfs_size_mib: default_tmpfs_size_mib(),
            wait_timeout_secs: None,
        }
    }
}

fn default_checkpoint_port() -> u16 {
    DEFAULT_CHECKPOINT_PORT
}

fn default_copy_port() -> u16 {
    DEFAULT_COPY_PORT
}

fn default_tmpfs_size_mib() -> u64 {
    4096
}

/// One process in a helper pipeline. Each stage's stdout feeds the next
/// stage's stdin.
///
/// Arguments may contain the placeholders `{dir}`, `{port}`, `{address}` and
/// `{pid}`, which are replaced when the helper is launched.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct Stage {
    pub program: String,

    #[serde(default)]
    pub args: Vec<String>,
}

impl Stage {
    pub fn new<P: Into<String>>(program: P, args: &[&str]) -> Self {
        Stage {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// Command lines for the four helper processes that move a checkpoint from
/// one host to the other.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct Helpers {
    /// Destination: receives checkpoint pages into the staging directory.
    #[serde(default = "default_checkpoint_receiver")]
    pub checkpoint_receiver: Vec<Stage>,

    /// Destination: receives the remaining image files.
    #[serde(default = "default_copy_receiver")]
    pub copy_receiver: Vec<Stage>,

    /// Source: dumps the container's process tree, streaming pages to the
    /// destination's checkpoint receiver.
    #[serde(default = "default_checkpoint_dumper")]
    pub checkpoint_dumper: Vec<Stage>,

    /// Source: pushes the staging directory to the destination's copy
    /// receiver once the dump is complete.
    #[serde(default = "default_copy_sender")]
    pub copy_sender: Vec<Stage>,
}

impl Default for Helpers {
    fn default() -> Self {
        Helpers {
            checkpoint_receiver: default_checkpoint_receiver(),
            copy_receiver: default_copy_receiver(),
            checkpoint_dumper: default_checkpoint_dumper(),
            copy_sender: default_copy_sender(),
        }
    }
}

fn default_checkpoint_receiver() -> Vec<Stage> {
    vec![Stage::new(
        "criu",
        &["page-server", "--images-dir", "{dir}", "--port", "{port}"],
    )]
}

fn default_copy_receiver() -> Vec<Stage> {
    vec![
        Stage::new("nc", &["-l", "{port}"]),
        Stage::new("tar", &["-x", "-C", "{dir}", "-f", "-"]),
    ]
}

fn default_checkpoint_dumper() -> Vec<Stage> {
    vec![Stage::new(
        "criu",
        &[
            "dump",
            "--tcp-established",
            "--file-locks",
            "--link-remap",
            "--force-irmap",
            "--manage-cgroups",
            "--ext-mount-map",
            "auto",
            "--enable-external-sharing",
            "--enable-external-masters",
            "--enable-fs",
            "hugetlbfs",
            "--tree",
            "{pid}",
            "--images-dir",
            "{dir}",
            "--leave-stopped",
            "--page-server",
            "--address",
            "{address}",
            "--port",
            "{port}",
        ],
    )]
}

fn default_copy_sender() -> Vec<Stage> {
    vec![
        Stage::new("tar", &["-c", "-C", "{dir}", "-f", "-", "."]),
        Stage::new("nc", &["-N", "{address}", "{port}"]),
    ]
}

/// Errors which may be returned when parsing the daemon configuration.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("helper {0} has no stages")]
    EmptyHelper(&'static str),

    #[error("checkpoint and copy streams cannot share port {0}")]
    PortConflict(u16),
}

impl Config {
    /// Rejects configurations that parse but cannot drive a migration.
    pub fn validate(&self) -> Result<(), ParseError> {
        let helpers = [
            ("checkpoint_receiver", &self.helpers.checkpoint_receiver),
            ("copy_receiver", &self.helpers.copy_receiver),
            ("checkpoint_dumper", &self.helpers.checkpoint_dumper),
            ("copy_sender", &self.helpers.copy_sender),
        ];
        for (name, stages) in helpers {
            if stages.is_empty() {
                return Err(ParseError::EmptyHelper(name));
            }
        }

        if self.migration.checkpoint_port == self.migration.copy_port {
            return Err(ParseError::PortConflict(self.migration.copy_port));
        }

        Ok(())
    }
}

/// Parses a TOML file into a configuration object.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let cfg = toml::from_str::<Config>(&contents)?;
    cfg.validate()?;
    Ok(cfg)
}
