use std::{collections::BTreeSet, io::Write, path::Path, time::Duration};

use simhost_process::{ProcessHandle, ProcessSpec, ProcessState, ProcessStatus};
use tokio::process::Child;
use tokio_util::sync::CancellationToken;

use crate::config::SupervisorConfig;
use crate::error::SuperviseError;
use crate::launch;
use crate::log_tail::read_log_tail;
use crate::proc_table::{self, ProcEntry};
use crate::readiness::{Readiness, ReadinessProbe};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started { pid: u32 },
    /// An instance matching the signature was already alive; nothing was launched.
    AlreadyRunning { pids: Vec<u32> },
}

/// Keeps at most one instance of a process alive.
///
/// The OS process table is the only source of truth for "running"; the handle held here
/// is informational and never survives the invocation that created it.
pub struct Supervisor {
    config: SupervisorConfig,
    state: ProcessState,
    handle: Option<ProcessHandle>,
    child: Option<Child>,
}

/// Appends a `[simhost]` line to an existing process log. Best effort.
fn append_log_line(path: &Path, line: &str) {
    let res = std::fs::OpenOptions::new()
        .append(true)
        .open(path)
        .and_then(|mut f| writeln!(f, "[simhost] {line}"));
    if let Err(e) = res
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::debug!(path = %path.display(), error = %e, "could not append to process log");
    }
}

#[cfg(unix)]
fn signal_all(entries: &[ProcEntry], sig: libc::c_int) {
    // Negative targets address a whole process group.
    let mut targets = BTreeSet::<i32>::new();
    for e in entries {
        match e.pgid {
            Some(pgid) if e.leads_group() => targets.insert(-pgid),
            _ => targets.insert(e.pid as i32),
        };
    }
    for t in targets {
        let rc = unsafe { libc::kill(t, sig) };
        if rc == -1 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                tracing::warn!(kill_target = t, sig, error = %err, "kill failed");
            }
        }
    }
}

#[cfg(not(unix))]
fn signal_all(_entries: &[ProcEntry], _sig: i32) {}

#[cfg(unix)]
const SIGTERM: i32 = libc::SIGTERM;
#[cfg(unix)]
const SIGKILL: i32 = libc::SIGKILL;
#[cfg(not(unix))]
const SIGTERM: i32 = 15;
#[cfg(not(unix))]
const SIGKILL: i32 = 9;

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            state: ProcessState::Stopped,
            handle: None,
            child: None,
        }
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn handle(&self) -> Option<&ProcessHandle> {
        self.handle.as_ref()
    }

    /// Applies a transition if the state machine allows it; illegal ones are logged and ignored.
    fn set_state(&mut self, next: ProcessState) -> bool {
        if self.state == next {
            return true;
        }
        if !self.state.can_transition_to(next) {
            tracing::warn!(from = %self.state, to = %next, "ignoring illegal state transition");
            return false;
        }
        tracing::debug!(from = %self.state, to = %next, "process state");
        self.state = next;
        if let Some(h) = self.handle.as_mut() {
            h.state = next;
        }
        true
    }

    fn reap_child(&mut self) {
        if let Some(c) = self.child.as_mut()
            && let Ok(Some(status)) = c.try_wait()
        {
            tracing::debug!(%status, "launched child reaped");
            self.child = None;
        }
    }

    pub fn is_running(&self, spec: &ProcessSpec) -> bool {
        !proc_table::find_matching(&spec.signature()).is_empty()
    }

    pub async fn start(
        &mut self,
        spec: &ProcessSpec,
        cancel: &CancellationToken,
    ) -> Result<StartOutcome, SuperviseError> {
        let signature = spec.signature();
        let existing = proc_table::find_matching(&signature);
        if !existing.is_empty() {
            return Ok(self.adopt(spec, &existing));
        }

        self.reap_child();
        if !matches!(self.state, ProcessState::Stopped | ProcessState::Failed) {
            tracing::warn!(state = %self.state, "no matching process found; resetting state");
            self.set_state(ProcessState::Failed);
        }

        launch::check_executable(&spec.executable)?;
        if cancel.is_cancelled() {
            return Err(SuperviseError::Cancelled { stage: "launch" });
        }

        self.set_state(ProcessState::Starting);
        let launched = match launch::launch(spec).await {
            Ok(l) => l,
            Err(e) => {
                self.set_state(ProcessState::Failed);
                return Err(e);
            }
        };
        let pid = launched.pid;
        self.handle = Some(ProcessHandle {
            pid,
            state: ProcessState::Starting,
            started_at_unix_ms: Some(launched.started_at_unix_ms),
            log_path: spec.log_path.clone(),
        });
        let mut child = launched.child;

        let probe = ReadinessProbe {
            signature: &signature,
            port: spec.readiness_port,
            timeout: self.config.ready_timeout,
            interval: self.config.ready_poll_interval,
        };
        let readiness = probe.wait(Some(&mut child), cancel).await;
        self.child = Some(child);

        match readiness {
            Readiness::Ready => {
                self.set_state(ProcessState::Running);
                append_log_line(&spec.log_path, &format!("{} ready (pid {pid})", spec.name));
                tracing::info!(
                    name = %spec.name,
                    pid,
                    port = ?spec.readiness_port,
                    "process ready"
                );
                Ok(StartOutcome::Started { pid })
            }
            Readiness::Timeout => {
                self.set_state(ProcessState::Failed);
                append_log_line(
                    &spec.log_path,
                    &format!(
                        "{} not ready after {}ms; left running for inspection",
                        spec.name,
                        self.config.ready_timeout.as_millis()
                    ),
                );
                Err(SuperviseError::ReadinessTimeout {
                    name: spec.name.clone(),
                    pid,
                    port: spec.readiness_port,
                    timeout: self.config.ready_timeout,
                    log_tail: self.log_tail(spec),
                })
            }
            Readiness::Exited(status) => {
                self.set_state(ProcessState::Failed);
                self.child = None;
                Err(SuperviseError::LaunchExited {
                    name: spec.name.clone(),
                    pid,
                    status,
                    log_tail: self.log_tail(spec),
                })
            }
            Readiness::Cancelled => {
                tracing::warn!(
                    name = %spec.name,
                    pid,
                    "readiness wait cancelled; process left running"
                );
                Err(SuperviseError::Cancelled { stage: "readiness" })
            }
        }
    }

    fn adopt(&mut self, spec: &ProcessSpec, existing: &[ProcEntry]) -> StartOutcome {
        let pids = proc_table::pids(existing);
        let record = launch::read_run_record(&spec.run_record_path())
            .filter(|r| pids.contains(&r.pid));
        let pid = record.as_ref().map(|r| r.pid).unwrap_or(pids[0]);
        if pids.len() > 1 {
            tracing::warn!(name = %spec.name, ?pids, "several processes match the signature");
        }
        tracing::info!(name = %spec.name, pid, "process already running; not launching");

        self.handle = Some(ProcessHandle {
            pid,
            state: self.state,
            started_at_unix_ms: record.map(|r| r.started_at_unix_ms),
            log_path: spec.log_path.clone(),
        });
        if self.state != ProcessState::Running && !self.set_state(ProcessState::Running) {
            // Stopping -> Running is not a transition; go through Failed.
            self.set_state(ProcessState::Failed);
            self.set_state(ProcessState::Running);
        }
        StartOutcome::AlreadyRunning { pids }
    }

    fn log_tail(&self, spec: &ProcessSpec) -> String {
        read_log_tail(
            &spec.log_path,
            self.config.log_tail_bytes,
            self.config.log_tail_lines,
        )
    }

    /// Polls until nothing matches `signature` or `budget` elapses; returns the survivors.
    async fn wait_gone(&mut self, signature: &str, budget: Duration) -> Vec<ProcEntry> {
        let deadline = tokio::time::Instant::now() + budget;
        loop {
            self.reap_child();
            let left = proc_table::find_matching(signature);
            if left.is_empty() || tokio::time::Instant::now() >= deadline {
                return left;
            }
            tokio::time::sleep(self.config.stop_poll_interval).await;
        }
    }

    pub async fn stop(
        &mut self,
        spec: &ProcessSpec,
        grace: Duration,
    ) -> Result<(), SuperviseError> {
        let signature = spec.signature();
        let targets = proc_table::find_matching(&signature);
        if targets.is_empty() {
            self.reap_child();
            if self.state != ProcessState::Stopped {
                self.set_state(ProcessState::Stopping);
                self.set_state(ProcessState::Stopped);
            }
            tracing::info!(name = %spec.name, "process not running; nothing to stop");
            return Ok(());
        }

        self.set_state(ProcessState::Stopping);
        let pids = proc_table::pids(&targets);
        append_log_line(
            &spec.log_path,
            &format!("stop requested (pids {pids:?}, grace_ms={})", grace.as_millis()),
        );
        tracing::info!(
            name = %spec.name,
            ?pids,
            grace_ms = grace.as_millis() as u64,
            "stopping process"
        );

        signal_all(&targets, SIGTERM);
        let mut left = self.wait_gone(&signature, grace).await;

        if !left.is_empty() {
            let survivors = proc_table::pids(&left);
            tracing::warn!(
                name = %spec.name,
                pids = ?survivors,
                "grace period elapsed; sending SIGKILL"
            );
            append_log_line(&spec.log_path, &format!("stop: sent SIGKILL to {survivors:?}"));
            signal_all(&left, SIGKILL);
            left = self.wait_gone(&signature, self.config.kill_wait).await;
        }

        if !left.is_empty() {
            self.set_state(ProcessState::Failed);
            return Err(SuperviseError::StopFailed {
                name: spec.name.clone(),
                pids: proc_table::pids(&left),
                waited: grace + self.config.kill_wait,
            });
        }

        self.set_state(ProcessState::Stopped);
        append_log_line(&spec.log_path, "stopped");
        tracing::info!(name = %spec.name, "process stopped");
        Ok(())
    }

    pub async fn restart(
        &mut self,
        spec: &ProcessSpec,
        grace: Duration,
        cancel: &CancellationToken,
    ) -> Result<StartOutcome, SuperviseError> {
        self.stop(spec, grace).await?;
        self.start(spec, cancel).await
    }

    pub fn status(&self, spec: &ProcessSpec) -> ProcessStatus {
        let signature = spec.signature();
        let pids = proc_table::pids(&proc_table::find_matching(&signature));
        let state = match (self.state, pids.is_empty()) {
            (ProcessState::Stopped, false) => ProcessState::Running,
            (s, false) => s,
            (ProcessState::Failed, true) => ProcessState::Failed,
            (_, true) => ProcessState::Stopped,
        };
        let run = launch::read_run_record(&spec.run_record_path());
        let message = match &run {
            Some(r) if !pids.is_empty() && !pids.contains(&r.pid) => {
                Some(format!("run record pid {} is not among the matching processes", r.pid))
            }
            _ if pids.len() > 1 => Some(format!("{} processes match the signature", pids.len())),
            _ => None,
        };
        ProcessStatus {
            name: spec.name.clone(),
            signature,
            state,
            pids,
            run,
            message,
        }
    }
}
