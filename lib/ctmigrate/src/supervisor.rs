// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Launches and tracks the helper processes that move a checkpoint between
//! hosts.
//!
//! Each helper is a pipeline of one or more processes described by a list of
//! [`Stage`]s. The destination runs a checkpoint receiver and a copy
//! receiver; the source runs a checkpoint dumper and, once the dump has
//! completed successfully, a copy sender that ships the rest of the image.
//!
//! Helpers are tracked through [`ProcessHandle`]s. A handle's children are
//! reaped by whoever polls it first, under the handle's lock, so terminating
//! a handle can never signal a recycled pid.

use std::fmt;
use std::io;
use std::path::Path;
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use ctmigrate_config::{Helpers, Stage};
use serde::{Deserialize, Serialize};
use slog::{debug, error, info, warn, Logger};
use thiserror::Error;

/// How often blocked waits re-check their children.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// The role a helper process plays in a migration.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HelperKind {
    CheckpointReceiver,
    CheckpointDumper,
    CopySender,
    CopyReceiver,
}

impl fmt::Display for HelperKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HelperKind::CheckpointReceiver => "checkpoint-receiver",
            HelperKind::CheckpointDumper => "checkpoint-dumper",
            HelperKind::CopySender => "copy-sender",
            HelperKind::CopyReceiver => "copy-receiver",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to start {kind} ({program}): {source}")]
    Spawn {
        kind: HelperKind,
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to start copy-sender sequencing thread: {0}")]
    Thread(#[source] io::Error),

    #[error("{kind} failed: {detail}")]
    ProcessFailure { kind: HelperKind, detail: String },

    #[error("timed out waiting for {}", join_kinds(.0))]
    TimedOut(Vec<HelperKind>),
}

fn join_kinds(kinds: &[HelperKind]) -> String {
    kinds.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

/// The pair of fixed ports a destination listens on.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationPorts {
    pub checkpoint: u16,
    pub copy: u16,
}

impl From<&ctmigrate_config::Migration> for MigrationPorts {
    fn from(cfg: &ctmigrate_config::Migration) -> Self {
        MigrationPorts { checkpoint: cfg.checkpoint_port, copy: cfg.copy_port }
    }
}

/// Values substituted into stage arguments.
struct Placeholders<'a> {
    dir: &'a Path,
    port: u16,
    address: Option<&'a str>,
    pid: Option<u32>,
}

impl Placeholders<'_> {
    fn expand(&self, arg: &str) -> String {
        let mut out = arg
            .replace("{dir}", &self.dir.to_string_lossy())
            .replace("{port}", &self.port.to_string());
        if let Some(address) = self.address {
            out = out.replace("{address}", address);
        }
        if let Some(pid) = self.pid {
            out = out.replace("{pid}", &pid.to_string());
        }
        out
    }
}

/// The lifecycle of one helper.
#[derive(Debug)]
enum Slot {
    /// Waiting for a predecessor before it may start.
    Pending,

    /// Running; one child per pipeline stage, in pipeline order.
    Running(Vec<(String, Child)>),

    /// All stages have been reaped.
    Exited(Result<(), String>),
}

type SharedSlot = Arc<Mutex<Slot>>;

fn lock(slot: &SharedSlot) -> MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
}

impl Slot {
    /// Reaps finished children. Returns the helper's outcome once every
    /// stage has exited.
    fn poll(&mut self) -> Option<Result<(), String>> {
        let children = match self {
            Slot::Pending => return None,
            Slot::Exited(res) => return Some(res.clone()),
            Slot::Running(children) => children,
        };

        let mut statuses: Vec<(String, ExitStatus)> = Vec::new();
        let mut lost = None;
        for (program, child) in children.iter_mut() {
            match child.try_wait() {
                Ok(Some(status)) => statuses.push((program.clone(), status)),
                Ok(None) => return None,
                Err(e) => {
                    lost = Some(format!("failed to wait for {program}: {e}"));
                    break;
                }
            }
        }

        let res = if let Some(msg) = lost {
            // A stage can no longer be observed; stop the rest of the
            // pipeline so nothing is left behind.
            kill_and_reap(children);
            Err(msg)
        } else {
            match statuses.iter().find(|(_, s)| !s.success()) {
                Some((program, status)) => Err(format!("{program} {status}")),
                None => Ok(()),
            }
        };
        *self = Slot::Exited(res.clone());
        Some(res)
    }

    fn terminate(&mut self) -> bool {
        match self {
            Slot::Exited(_) => false,
            Slot::Pending => {
                *self = Slot::Exited(Err("terminated before start".into()));
                true
            }
            Slot::Running(children) => {
                kill_and_reap(children);
                *self = Slot::Exited(Err("terminated".into()));
                true
            }
        }
    }

    fn leader_pid(&self) -> Option<u32> {
        match self {
            Slot::Running(children) => children.first().map(|(_, c)| c.id()),
            _ => None,
        }
    }
}

fn kill_and_reap(children: &mut [(String, Child)]) {
    for (_, child) in children.iter_mut() {
        // Fails only if the child has already been reaped.
        let _ = child.kill();
    }
    for (_, child) in children.iter_mut() {
        let _ = child.wait();
    }
}

/// An owned reference to one running (or yet-to-run) helper.
///
/// Joining consumes the handle. Dropping a handle whose helper is still
/// running terminates it.
pub struct ProcessHandle {
    kind: HelperKind,
    slot: SharedSlot,
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("kind", &self.kind)
            .field("pid", &self.pid())
            .finish()
    }
}

impl ProcessHandle {
    fn new(kind: HelperKind, slot: Slot) -> Self {
        ProcessHandle { kind, slot: Arc::new(Mutex::new(slot)) }
    }

    pub fn kind(&self) -> HelperKind {
        self.kind
    }

    /// The pid of the first process in the helper's pipeline, while it runs.
    pub fn pid(&self) -> Option<u32> {
        lock(&self.slot).leader_pid()
    }

    /// Returns the helper's outcome if it has finished, without blocking.
    pub fn try_join(&self) -> Option<Result<(), SupervisorError>> {
        let res = lock(&self.slot).poll()?;
        Some(res.map_err(|detail| SupervisorError::ProcessFailure {
            kind: self.kind,
            detail,
        }))
    }

    /// Blocks until the helper exits.
    pub fn join(self) -> Result<(), SupervisorError> {
        wait_all(vec![self])
    }

    /// Blocks until the helper exits or `timeout` passes, in which case the
    /// helper is terminated.
    pub fn join_timeout(self, timeout: Duration) -> Result<(), SupervisorError> {
        wait_all_timeout(vec![self], timeout)
    }

    /// Kills every process of the helper. Returns false if it had already
    /// exited.
    pub fn terminate(&self) -> bool {
        lock(&self.slot).terminate()
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Blocks until every helper has exited successfully.
///
/// Fails as soon as any helper fails; the others are terminated rather than
/// waited for, since a receiver whose peer has died would otherwise listen
/// forever.
pub fn wait_all(handles: Vec<ProcessHandle>) -> Result<(), SupervisorError> {
    wait_until(handles, None)
}

/// Like [`wait_all`], but gives up after `timeout`, terminating whatever is
/// still running.
pub fn wait_all_timeout(
    handles: Vec<ProcessHandle>,
    timeout: Duration,
) -> Result<(), SupervisorError> {
    wait_until(handles, Some(Instant::now() + timeout))
}

/// Kills every helper in `handles` that is still running.
pub fn terminate_all(handles: &[ProcessHandle]) {
    for h in handles {
        h.terminate();
    }
}

fn wait_until(
    mut pending: Vec<ProcessHandle>,
    deadline: Option<Instant>,
) -> Result<(), SupervisorError> {
    loop {
        let mut i = 0;
        while i < pending.len() {
            match pending[i].try_join() {
                None => i += 1,
                Some(Ok(())) => {
                    pending.remove(i);
                }
                Some(Err(e)) => {
                    terminate_all(&pending);
                    return Err(e);
                }
            }
        }

        if pending.is_empty() {
            return Ok(());
        }

        if deadline.is_some_and(|d| Instant::now() >= d) {
            terminate_all(&pending);
            return Err(SupervisorError::TimedOut(
                pending.iter().map(ProcessHandle::kind).collect(),
            ));
        }

        thread::sleep(POLL_INTERVAL);
    }
}

/// Starts helper pipelines according to the configured command lines.
pub struct ProcessSupervisor {
    helpers: Helpers,
    log: Logger,
}

impl ProcessSupervisor {
    pub fn new(helpers: Helpers, log: Logger) -> Self {
        ProcessSupervisor { helpers, log }
    }

    /// Starts the destination's checkpoint receiver and copy receiver, both
    /// writing into `staging`.
    pub fn start_receivers(
        &self,
        ports: MigrationPorts,
        staging: &Path,
    ) -> Result<Vec<ProcessHandle>, SupervisorError> {
        let receiver = self.spawn(
            HelperKind::CheckpointReceiver,
            &self.helpers.checkpoint_receiver,
            &Placeholders {
                dir: staging,
                port: ports.checkpoint,
                address: None,
                pid: None,
            },
        )?;

        // If this fails, dropping `receiver` stops the first helper.
        let copy = self.spawn(
            HelperKind::CopyReceiver,
            &self.helpers.copy_receiver,
            &Placeholders { dir: staging, port: ports.copy, address: None, pid: None },
        )?;

        Ok(vec![receiver, copy])
    }

    /// Starts the source's checkpoint dumper against the process tree rooted
    /// at `container_pid`, followed by the copy sender.
    ///
    /// The copy sender starts only after the dumper exits successfully, since
    /// it ships the image files the dump leaves in `staging`. If the dump
    /// fails the sender never starts and its handle reports the failure.
    pub fn start_senders(
        &self,
        ports: MigrationPorts,
        staging: &Path,
        container_pid: u32,
        destination: &str,
    ) -> Result<Vec<ProcessHandle>, SupervisorError> {
        let dumper = self.spawn(
            HelperKind::CheckpointDumper,
            &self.helpers.checkpoint_dumper,
            &Placeholders {
                dir: staging,
                port: ports.checkpoint,
                address: Some(destination),
                pid: Some(container_pid),
            },
        )?;

        let sender = ProcessHandle::new(HelperKind::CopySender, Slot::Pending);

        let dumper_slot = Arc::clone(&dumper.slot);
        let sender_slot = Arc::clone(&sender.slot);
        let stages = self.helpers.copy_sender.clone();
        let staging = staging.to_owned();
        let destination = destination.to_owned();
        let log = self.log.new(slog::o!("helper" => HelperKind::CopySender.to_string()));

        thread::Builder::new()
            .name("copy-sender".to_string())
            .spawn(move || {
                let placeholders = Placeholders {
                    dir: &staging,
                    port: ports.copy,
                    address: Some(&destination),
                    pid: None,
                };
                sequence_after(&dumper_slot, &sender_slot, &stages, &placeholders, &log)
            })
            .map_err(SupervisorError::Thread)?;

        Ok(vec![dumper, sender])
    }

    fn spawn(
        &self,
        kind: HelperKind,
        stages: &[Stage],
        placeholders: &Placeholders<'_>,
    ) -> Result<ProcessHandle, SupervisorError> {
        let children = spawn_pipeline(stages, placeholders).map_err(
            |(program, source)| SupervisorError::Spawn { kind, program, source },
        )?;
        let pids: Vec<u32> = children.iter().map(|(_, c)| c.id()).collect();
        info!(self.log, "started helper"; "kind" => %kind, "pids" => ?pids);
        Ok(ProcessHandle::new(kind, Slot::Running(children)))
    }
}

/// Waits for the helper in `first` to exit, then starts `stages` in `next`
/// if it succeeded.
fn sequence_after(
    first: &SharedSlot,
    next: &SharedSlot,
    stages: &[Stage],
    placeholders: &Placeholders<'_>,
    log: &Logger,
) {
    let outcome = loop {
        if let Some(res) = lock(first).poll() {
            break res;
        }
        if matches!(*lock(next), Slot::Exited(_)) {
            debug!(log, "terminated while waiting for predecessor");
            return;
        }
        thread::sleep(POLL_INTERVAL);
    };

    let mut slot = lock(next);
    if !matches!(*slot, Slot::Pending) {
        return;
    }

    if let Err(e) = outcome {
        warn!(log, "not starting: predecessor failed: {e}");
        *slot = Slot::Exited(Err(format!("not started, checkpoint dump failed: {e}")));
        return;
    }

    match spawn_pipeline(stages, placeholders) {
        Ok(children) => {
            let pids: Vec<u32> = children.iter().map(|(_, c)| c.id()).collect();
            info!(log, "started helper"; "pids" => ?pids);
            *slot = Slot::Running(children);
        }
        Err((program, e)) => {
            error!(log, "failed to start helper: {e}"; "program" => &program);
            *slot = Slot::Exited(Err(format!("failed to start {program}: {e}")));
        }
    }
}

/// Spawns each stage with its stdout connected to the next stage's stdin.
/// On failure, already-started stages are killed and the failing program is
/// returned alongside the error.
fn spawn_pipeline(
    stages: &[Stage],
    placeholders: &Placeholders<'_>,
) -> Result<Vec<(String, Child)>, (String, io::Error)> {
    let mut children: Vec<(String, Child)> = Vec::with_capacity(stages.len());
    let mut upstream: Option<ChildStdout> = None;

    for (i, stage) in stages.iter().enumerate() {
        let last = i + 1 == stages.len();
        let stdin = match upstream.take() {
            Some(out) => Stdio::from(out),
            None => Stdio::null(),
        };

        let spawned = Command::new(&stage.program)
            .args(stage.args.iter().map(|a| placeholders.expand(a)))
            .stdin(stdin)
            .stdout(if last { Stdio::null() } else { Stdio::piped() })
            .spawn();

        match spawned {
            Ok(mut child) => {
                upstream = child.stdout.take();
                children.push((stage.program.clone(), child));
            }
            Err(e) => {
                kill_and_reap(&mut children);
                return Err((stage.program.clone(), e));
            }
        }
    }

    Ok(children)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    const PORTS: MigrationPorts = MigrationPorts { checkpoint: 1234, copy: 1235 };

    fn sh(script: &str) -> Vec<Stage> {
        vec![Stage::new("sh", &["-c", script])]
    }

    fn helpers(
        checkpoint_receiver: Vec<Stage>,
        copy_receiver: Vec<Stage>,
        checkpoint_dumper: Vec<Stage>,
        copy_sender: Vec<Stage>,
    ) -> Helpers {
        Helpers { checkpoint_receiver, copy_receiver, checkpoint_dumper, copy_sender }
    }

    fn supervisor(helpers: Helpers) -> ProcessSupervisor {
        ProcessSupervisor::new(helpers, test_logger())
    }

    #[test]
    fn receivers_succeed_when_all_exit_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(helpers(sh("exit 0"), sh("exit 0"), vec![], vec![]));

        let handles = sup.start_receivers(PORTS, dir.path()).unwrap();
        assert_eq!(handles.len(), 2);
        assert_eq!(handles[0].kind(), HelperKind::CheckpointReceiver);
        assert_eq!(handles[1].kind(), HelperKind::CopyReceiver);
        wait_all(handles).unwrap();
    }

    #[test]
    fn one_failure_fails_the_wait() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(helpers(sh("exit 0"), sh("exit 3"), vec![], vec![]));

        let handles = sup.start_receivers(PORTS, dir.path()).unwrap();
        match wait_all(handles) {
            Err(SupervisorError::ProcessFailure { kind, .. }) => {
                assert_eq!(kind, HelperKind::CopyReceiver)
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn failure_stops_waiting_on_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(helpers(sh("exit 1"), sh("sleep 30"), vec![], vec![]));

        let start = Instant::now();
        let handles = sup.start_receivers(PORTS, dir.path()).unwrap();
        assert!(wait_all(handles).is_err());
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn placeholders_are_substituted() {
        let dir = tempfile::tempdir().unwrap();
        let dir_arg = dir.path().to_string_lossy().into_owned();
        let sup = supervisor(helpers(
            vec![Stage::new("test", &["{port}", "=", "1234"])],
            vec![Stage::new("test", &["{dir}", "=", dir_arg.as_str()])],
            vec![Stage::new(
                "sh",
                &["-c", "test \"$0 $1\" = \"db-7.internal 4242\"", "{address}", "{pid}"],
            )],
            vec![Stage::new("test", &["{port}", "=", "1235"])],
        ));

        wait_all(sup.start_receivers(PORTS, dir.path()).unwrap()).unwrap();
        wait_all(
            sup.start_senders(PORTS, dir.path(), 4242, "db-7.internal").unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn pipeline_stages_are_connected() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(helpers(
            vec![
                Stage::new("sh", &["-c", "echo checkpoint"]),
                Stage::new("sh", &["-c", "read x; test \"$x\" = checkpoint"]),
            ],
            vec![
                Stage::new("sh", &["-c", "echo wrong"]),
                Stage::new("sh", &["-c", "read x; test \"$x\" = checkpoint"]),
            ],
            vec![],
            vec![],
        ));

        let mut handles = sup.start_receivers(PORTS, dir.path()).unwrap();
        let copy = handles.pop().unwrap();
        let receiver = handles.pop().unwrap();
        receiver.join().unwrap();
        assert!(copy.join().is_err());
    }

    #[test]
    fn sender_waits_for_successful_dump() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("dumped");
        let marker_arg = marker.to_string_lossy().into_owned();
        let sup = supervisor(helpers(
            vec![],
            vec![],
            vec![Stage::new("sh", &["-c", "sleep 0.2; touch \"$0\"", marker_arg.as_str()])],
            vec![Stage::new("test", &["-e", marker_arg.as_str()])],
        ));

        let handles =
            sup.start_senders(PORTS, dir.path(), 1, "db-7.internal").unwrap();
        wait_all(handles).unwrap();
    }

    #[test]
    fn sender_never_starts_after_failed_dump() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("sent");
        let marker_arg = marker.to_string_lossy().into_owned();
        let sup = supervisor(helpers(
            vec![],
            vec![],
            sh("exit 1"),
            vec![Stage::new("touch", &[marker_arg.as_str()])],
        ));

        let mut handles =
            sup.start_senders(PORTS, dir.path(), 1, "db-7.internal").unwrap();
        let sender = handles.pop().unwrap();
        let dumper = handles.pop().unwrap();

        assert!(matches!(
            sender.join(),
            Err(SupervisorError::ProcessFailure { kind: HelperKind::CopySender, .. })
        ));
        assert!(dumper.join().is_err());
        assert!(!marker.exists());
    }

    #[test]
    fn timeout_terminates_stragglers() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(helpers(sh("sleep 30"), sh("exit 0"), vec![], vec![]));

        let handles = sup.start_receivers(PORTS, dir.path()).unwrap();
        let pid = handles[0].pid().unwrap();

        let start = Instant::now();
        match wait_all_timeout(handles, Duration::from_millis(200)) {
            Err(SupervisorError::TimedOut(kinds)) => {
                assert_eq!(kinds, vec![HelperKind::CheckpointReceiver])
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(start.elapsed() < Duration::from_secs(10));
        assert!(!Path::new(&format!("/proc/{pid}")).exists());
    }

    #[test]
    fn dropping_a_handle_kills_its_helper() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(helpers(sh("sleep 30"), sh("sleep 30"), vec![], vec![]));

        let handles = sup.start_receivers(PORTS, dir.path()).unwrap();
        let pids: Vec<u32> = handles.iter().filter_map(ProcessHandle::pid).collect();
        assert_eq!(pids.len(), 2);

        drop(handles);
        for pid in pids {
            assert!(!Path::new(&format!("/proc/{pid}")).exists());
        }
    }

    #[test]
    fn terminating_a_pending_sender_keeps_it_from_starting() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("sent");
        let marker_arg = marker.to_string_lossy().into_owned();
        let sup = supervisor(helpers(
            vec![],
            vec![],
            sh("sleep 0.3"),
            vec![Stage::new("touch", &[marker_arg.as_str()])],
        ));

        let handles =
            sup.start_senders(PORTS, dir.path(), 1, "db-7.internal").unwrap();
        assert!(handles[1].terminate());
        drop(handles);

        thread::sleep(Duration::from_millis(600));
        assert!(!marker.exists());
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(helpers(
            vec![Stage::new("/nonexistent/criu", &[])],
            sh("exit 0"),
            vec![],
            vec![],
        ));

        match sup.start_receivers(PORTS, dir.path()) {
            Err(SupervisorError::Spawn { kind, program, .. }) => {
                assert_eq!(kind, HelperKind::CheckpointReceiver);
                assert_eq!(program, "/nonexistent/criu");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
