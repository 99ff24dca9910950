// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Test fixtures: an in-memory container and host configurations whose
//! helpers move files between two local directories.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use ctmigrate::control::{ContainerControl, ControlError};
use ctmigrate::{Container, ContainerRegistry};
use ctmigrate_config::{Config, Helpers, StagingKind, Stage};
use slog::Logger;

/// Name of the image file the fake checkpoint writes.
pub const IMAGE_FILE: &str = "pages-1.img";

pub fn test_logger() -> Logger {
    Logger::root(slog::Discard, slog::o!())
}

#[derive(Debug, Default)]
struct FakeState {
    running: bool,
    frozen: bool,
    refuse_resume: bool,
    pid: u32,
    calls: Vec<String>,
}

/// A container that lives entirely in memory. Checkpoints write a marker
/// file and restores demand one, so images must actually arrive.
#[derive(Debug, Clone)]
pub struct FakeContainer {
    config_path: PathBuf,
    state: Arc<Mutex<FakeState>>,
}

impl FakeContainer {
    pub fn new(config_path: &Path, running_pid: Option<u32>) -> Self {
        std::fs::create_dir_all(config_path).unwrap();
        let state = FakeState {
            running: running_pid.is_some(),
            pid: running_pid.unwrap_or(0),
            ..Default::default()
        };
        FakeContainer {
            config_path: config_path.to_owned(),
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn running(&self) -> bool {
        self.state.lock().unwrap().running
    }

    pub fn frozen(&self) -> bool {
        self.state.lock().unwrap().frozen
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Simulates a dump that leaves the container's tasks stopped.
    pub fn freeze(&self) {
        self.state.lock().unwrap().frozen = true;
    }

    /// Makes every later resume fail.
    pub fn refuse_resume(&self) {
        self.state.lock().unwrap().refuse_resume = true;
    }

    fn record(&self, call: &str) -> std::sync::MutexGuard<'_, FakeState> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call.to_owned());
        state
    }
}

impl ContainerControl for FakeContainer {
    fn is_running(&self) -> bool {
        self.running()
    }

    fn may_control(&self) -> bool {
        true
    }

    fn checkpoint(&self, dir: &Path, stop: bool) -> Result<(), ControlError> {
        let mut state = self.record("checkpoint");
        std::fs::write(dir.join(IMAGE_FILE), b"pages")?;
        if stop {
            state.running = false;
        }
        Ok(())
    }

    fn restore(&self, dir: &Path, _detach: bool) -> Result<(), ControlError> {
        let mut state = self.record("restore");
        if !dir.join(IMAGE_FILE).is_file() {
            return Err(ControlError::UnexpectedOutput {
                program: "restore".to_owned(),
                output: format!("no image in {}", dir.display()),
            });
        }
        state.running = true;
        state.pid = 7001;
        Ok(())
    }

    fn stop(&self) -> Result<(), ControlError> {
        let mut state = self.record("stop");
        state.running = false;
        state.frozen = false;
        Ok(())
    }

    fn resume(&self) -> Result<(), ControlError> {
        let mut state = self.record("resume");
        if state.refuse_resume {
            return Err(ControlError::UnexpectedOutput {
                program: "resume".to_owned(),
                output: "tasks did not continue".to_owned(),
            });
        }
        state.frozen = false;
        Ok(())
    }

    fn init_pid(&self) -> Option<u32> {
        let state = self.state.lock().unwrap();
        state.running.then_some(state.pid)
    }

    fn config_item(&self, key: &str) -> Result<String, ControlError> {
        Err(ControlError::MissingConfigItem(key.to_owned()))
    }

    fn config_path(&self) -> PathBuf {
        self.config_path.clone()
    }
}

/// Registers `fake` as `name` in a fresh registry.
pub fn registry_with(name: &str, fake: &FakeContainer) -> Arc<ContainerRegistry> {
    let registry = ContainerRegistry::new();
    registry.insert(Container::new(
        name,
        format!("lxc.uts.name = {name}\n"),
        Arc::new(fake.clone()),
    ));
    Arc::new(registry)
}

fn sh(script: &str, args: &[&str]) -> Vec<Stage> {
    let mut all = vec!["-c", script];
    all.extend_from_slice(args);
    vec![Stage::new("sh", &all)]
}

/// Helpers that stand in for the checkpoint tool and the network copy.
///
/// The "address" handed between hosts is the destination's staging
/// directory: the copy sender copies the source staging area into it and
/// then drops a `done` marker, which the receivers wait for.
pub fn local_helpers(dump_script: &str) -> Helpers {
    let wait_for_done =
        sh("while [ ! -e \"$0/done\" ]; do sleep 0.05; done", &["{dir}"]);
    Helpers {
        checkpoint_receiver: wait_for_done.clone(),
        copy_receiver: wait_for_done,
        checkpoint_dumper: sh(dump_script, &["{dir}", "{pid}"]),
        copy_sender: sh(
            "cp -r \"$0\"/. \"$1\"/ && touch \"$1/done\"",
            &["{dir}", "{address}"],
        ),
    }
}

/// Helpers whose programs do not exist on this host.
pub fn missing_helpers() -> Helpers {
    let missing = vec![Stage::new("/nonexistent/ctmigrate-helper", &[])];
    Helpers {
        checkpoint_receiver: missing.clone(),
        copy_receiver: missing.clone(),
        checkpoint_dumper: missing.clone(),
        copy_sender: missing,
    }
}

/// A host configuration that stages in plain directories.
pub fn local_config(helpers: Helpers, wait_timeout_secs: Option<u64>) -> Config {
    let mut config = Config { helpers, ..Default::default() };
    config.migration.staging = StagingKind::Directory;
    config.migration.wait_timeout_secs = wait_timeout_secs;
    config
}

/// A dump that writes the image file and succeeds.
pub const GOOD_DUMP: &str = "test \"$1\" -gt 0 && echo pages > \"$0/pages-1.img\"";

/// A dump that fails without producing an image.
pub const FAILED_DUMP: &str = "exit 1";
