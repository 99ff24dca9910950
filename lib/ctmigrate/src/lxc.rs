// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`ContainerControl`] backed by the LXC command-line tools.

use std::path::{Path, PathBuf};
use std::process::Command;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{access, AccessFlags, Pid};

use crate::control::{ContainerControl, ControlError};

const LXC_INFO: &str = "lxc-info";
const LXC_CHECKPOINT: &str = "lxc-checkpoint";
const LXC_STOP: &str = "lxc-stop";

/// Controls one container by running `lxc-*` commands against an LXC path.
#[derive(Debug, Clone)]
pub struct LxcTools {
    name: String,
    lxc_path: PathBuf,
}

impl LxcTools {
    pub fn new(name: &str, lxc_path: &Path) -> Self {
        LxcTools { name: name.to_owned(), lxc_path: lxc_path.to_owned() }
    }

    /// Runs an lxc tool against this container and returns its stdout.
    fn run(&self, program: &str, args: &[&str]) -> Result<String, ControlError> {
        let output = Command::new(program)
            .arg("-P")
            .arg(&self.lxc_path)
            .args(["-n", &self.name])
            .args(args)
            .output()
            .map_err(|source| ControlError::Spawn {
                program: program.to_owned(),
                source,
            })?;

        if !output.status.success() {
            return Err(ControlError::CommandFailed {
                program: program.to_owned(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr)
                    .trim()
                    .to_owned(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
    }
}

impl ContainerControl for LxcTools {
    fn is_running(&self) -> bool {
        matches!(self.run(LXC_INFO, &["-s", "-H"]), Ok(s) if s == "RUNNING")
    }

    fn may_control(&self) -> bool {
        access(self.config_path().as_path(), AccessFlags::R_OK | AccessFlags::W_OK)
            .is_ok()
    }

    fn checkpoint(&self, dir: &Path, stop: bool) -> Result<(), ControlError> {
        let dir = dir.to_string_lossy();
        let mut args = vec!["-D", dir.as_ref()];
        if stop {
            args.push("-s");
        }
        self.run(LXC_CHECKPOINT, &args).map(|_| ())
    }

    fn restore(&self, dir: &Path, detach: bool) -> Result<(), ControlError> {
        let dir = dir.to_string_lossy();
        let mode = if detach { "-d" } else { "-F" };
        self.run(LXC_CHECKPOINT, &["-r", "-D", dir.as_ref(), mode]).map(|_| ())
    }

    fn stop(&self) -> Result<(), ControlError> {
        self.run(LXC_STOP, &[]).map(|_| ())
    }

    fn resume(&self) -> Result<(), ControlError> {
        let Some(init) = self.init_pid() else {
            return Err(ControlError::UnexpectedOutput {
                program: LXC_INFO.to_owned(),
                output: "container has no init process".to_owned(),
            });
        };

        continue_tree(init).map_err(|e| std::io::Error::from(e).into())
    }

    fn init_pid(&self) -> Option<u32> {
        let out = self.run(LXC_INFO, &["-p", "-H"]).ok()?;
        out.parse().ok()
    }

    fn config_item(&self, key: &str) -> Result<String, ControlError> {
        let out = self.run(LXC_INFO, &["-c", key])?;
        parse_config_item(key, &out)
    }

    fn config_path(&self) -> PathBuf {
        self.lxc_path.join(&self.name)
    }
}

/// Extracts the value from `lxc-info -c` output of the form `key = value`.
fn parse_config_item(key: &str, output: &str) -> Result<String, ControlError> {
    for line in output.lines() {
        if let Some((k, v)) = line.split_once('=') {
            if k.trim() == key {
                return Ok(v.trim().to_owned());
            }
        }
    }
    Err(ControlError::MissingConfigItem(key.to_owned()))
}

/// Sends `SIGCONT` to `root` and every descendant.
fn continue_tree(root: u32) -> Result<(), Errno> {
    for pid in process_tree(root) {
        match kill(Pid::from_raw(pid as i32), Signal::SIGCONT) {
            // The task may have exited since the tree was walked.
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Returns `root` followed by all of its descendants, found by walking
/// `/proc/<pid>/task/<tid>/children`.
fn process_tree(root: u32) -> Vec<u32> {
    let mut tree = vec![root];
    let mut next = 0;
    while next < tree.len() {
        let pid = tree[next];
        next += 1;

        let Ok(tasks) = std::fs::read_dir(format!("/proc/{pid}/task")) else {
            continue;
        };
        for task in tasks.flatten() {
            let Ok(children) =
                std::fs::read_to_string(task.path().join("children"))
            else {
                continue;
            };
            tree.extend(
                children.split_whitespace().filter_map(|c| c.parse::<u32>().ok()),
            );
        }
    }
    tree
}
