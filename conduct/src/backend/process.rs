//! Parent side of the process-isolated backend.
//!
//! The worker's stdin is the command queue and its stdout is the response
//! queue; a reader thread drains stdout into a channel so every parent read
//! is a bounded `recv_timeout`. The protocol is strictly serial, which keeps
//! command/response pairing trivial: the next response line always answers
//! the last command written.

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tracing::{debug, info, instrument, warn};
use wait_timeout::ChildExt;

use crate::backend::ExecutionBackend;
use crate::backend::protocol::{ProcessCommand, ProcessResponse};
use crate::core::types::StatusReport;

/// Timeouts for IPC round trips and the termination ladder.
#[derive(Debug, Clone)]
pub struct ProcessTimeouts {
    /// Wait for the worker's readiness report.
    pub startup: Duration,
    /// Per-command round trip.
    pub call: Duration,
    /// Join after the cooperative shutdown command.
    pub shutdown: Duration,
    /// Join after SIGTERM, before SIGKILL.
    pub terminate: Duration,
}

impl Default for ProcessTimeouts {
    fn default() -> Self {
        Self {
            startup: Duration::from_secs(10),
            call: Duration::from_secs(5),
            shutdown: Duration::from_secs(2),
            terminate: Duration::from_secs(1),
        }
    }
}

pub struct ProcessBackend {
    child: Child,
    commands: ChildStdin,
    responses: Receiver<ProcessResponse>,
    reader: Option<JoinHandle<()>>,
    timeouts: ProcessTimeouts,
    stopped: bool,
}

impl ProcessBackend {
    /// Spawn `worker_command` and wait for its readiness report.
    ///
    /// A slow or failed startup is an error; the child is killed before
    /// returning so no orphan survives a failed spawn.
    #[instrument(skip_all)]
    pub fn spawn(worker_command: &[String], timeouts: ProcessTimeouts) -> Result<Self> {
        let (program, args) = worker_command
            .split_first()
            .ok_or_else(|| anyhow!("worker command must not be empty"))?;
        info!(program = %program, "spawning worker process");
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawn worker {program}"))?;
        let commands = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("worker stdin was not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("worker stdout was not piped"))?;
        let (tx, responses) = mpsc::channel();
        let reader = thread::spawn(move || read_responses(stdout, &tx));

        let mut backend = Self {
            child,
            commands,
            responses,
            reader: Some(reader),
            timeouts,
            stopped: false,
        };
        match backend.responses.recv_timeout(backend.timeouts.startup) {
            Ok(ProcessResponse::Success { message }) => {
                debug!(%message, "worker ready");
                Ok(backend)
            }
            Ok(ProcessResponse::Error { message }) => {
                backend.force_terminate().ok();
                Err(anyhow!("worker failed to start: {message}"))
            }
            Ok(other) => {
                backend.force_terminate().ok();
                Err(anyhow!("unexpected startup response: {other:?}"))
            }
            Err(_) => {
                let timeout = backend.timeouts.startup;
                backend.force_terminate().ok();
                Err(anyhow!("worker did not report ready within {timeout:?}"))
            }
        }
    }

    /// Default worker invocation: this binary's own `worker` subcommand.
    pub fn self_worker_command(extra_args: &[&str]) -> Result<Vec<String>> {
        let exe = std::env::current_exe().context("locate current executable")?;
        let mut command = vec![exe.to_string_lossy().into_owned(), "worker".to_string()];
        command.extend(extra_args.iter().map(ToString::to_string));
        Ok(command)
    }

    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// One command, one response, bounded wait. `None` means the outcome is
    /// unknown (timeout or transport failure), not that the command failed.
    fn round_trip(&mut self, command: &ProcessCommand) -> Option<ProcessResponse> {
        if self.stopped {
            warn!("backend already stopped; dropping command");
            return None;
        }
        if self.send_command(command).is_err() {
            return None;
        }
        match self.responses.recv_timeout(self.timeouts.call) {
            Ok(response) => Some(response),
            Err(RecvTimeoutError::Timeout) => {
                warn!(timeout = ?self.timeouts.call, "worker response timed out; outcome unknown");
                None
            }
            Err(RecvTimeoutError::Disconnected) => {
                warn!("worker response stream closed; outcome unknown");
                None
            }
        }
    }

    fn send_command(&mut self, command: &ProcessCommand) -> Result<()> {
        let mut line = serde_json::to_string(command).context("serialize command")?;
        line.push('\n');
        self.commands
            .write_all(line.as_bytes())
            .and_then(|()| self.commands.flush())
            .map_err(|err| {
                warn!(error = %err, "failed to send command to worker");
                err
            })
            .context("send command")
    }

    /// Escalation ladder: shutdown command, then SIGTERM, then SIGKILL.
    /// Idempotent; later steps only run while the child is still alive.
    #[instrument(skip_all)]
    pub fn shutdown(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;

        if let Err(err) = self.send_shutdown_command() {
            debug!(error = %err, "shutdown send failed; worker may already be gone");
        }
        if self
            .child
            .wait_timeout(self.timeouts.shutdown)
            .context("wait after shutdown command")?
            .is_some()
        {
            info!("worker exited after shutdown command");
            self.join_reader();
            return Ok(());
        }

        // The worker's SIGTERM handler only logs; a child blocked in a step
        // will not stop here.
        warn!("worker ignored shutdown; sending SIGTERM");
        let pid = Pid::from_raw(i32::try_from(self.child.id()).context("worker pid out of range")?);
        if let Err(err) = signal::kill(pid, Signal::SIGTERM) {
            debug!(error = %err, "SIGTERM failed; worker may already be gone");
        }
        if self
            .child
            .wait_timeout(self.timeouts.terminate)
            .context("wait after SIGTERM")?
            .is_some()
        {
            info!("worker exited after SIGTERM");
            self.join_reader();
            return Ok(());
        }

        // SIGKILL is the only guaranteed rung.
        warn!("worker survived SIGTERM; sending SIGKILL");
        self.child.kill().context("kill worker")?;
        self.child.wait().context("wait after kill")?;
        self.join_reader();
        Ok(())
    }

    /// Skip the ladder and SIGKILL immediately. Used for the double-interrupt
    /// path and failed startups.
    #[instrument(skip_all)]
    pub fn force_terminate(&mut self) -> Result<()> {
        self.stopped = true;
        if let Err(err) = self.child.kill() {
            debug!(error = %err, "kill failed; worker may already be gone");
        }
        self.child.wait().context("wait after force kill")?;
        self.join_reader();
        Ok(())
    }

    fn send_shutdown_command(&mut self) -> Result<()> {
        let mut line = serde_json::to_string(&ProcessCommand::Shutdown)
            .context("serialize shutdown command")?;
        line.push('\n');
        self.commands
            .write_all(line.as_bytes())
            .and_then(|()| self.commands.flush())
            .context("send shutdown command")
    }

    fn join_reader(&mut self) {
        if let Some(handle) = self.reader.take()
            && handle.join().is_err()
        {
            warn!("response reader thread panicked");
        }
    }
}

impl Drop for ProcessBackend {
    fn drop(&mut self) {
        if !self.stopped && let Err(err) = self.shutdown() {
            warn!(error = %format!("{err:#}"), "shutdown on drop failed");
        }
    }
}

impl ExecutionBackend for ProcessBackend {
    fn process_message(&mut self, message: Option<&str>) -> Result<bool> {
        let command = ProcessCommand::ProcessMessage {
            message: message.map(str::to_string),
        };
        Ok(matches!(
            self.round_trip(&command),
            Some(ProcessResponse::Success { .. })
        ))
    }

    fn pause(&mut self) -> Result<bool> {
        Ok(matches!(
            self.round_trip(&ProcessCommand::Pause),
            Some(ProcessResponse::Success { .. })
        ))
    }

    fn resume(&mut self) -> Result<bool> {
        Ok(matches!(
            self.round_trip(&ProcessCommand::Resume),
            Some(ProcessResponse::Success { .. })
        ))
    }

    fn toggle_confirmation_mode(&mut self) -> Result<bool> {
        Ok(matches!(
            self.round_trip(&ProcessCommand::ToggleConfirmation),
            Some(ProcessResponse::Success { .. })
        ))
    }

    fn get_status(&mut self) -> Result<Option<StatusReport>> {
        match self.round_trip(&ProcessCommand::GetStatus) {
            Some(ProcessResponse::Status {
                agent_status,
                confirmation_mode,
            }) => Ok(Some(StatusReport {
                agent_status,
                confirmation_mode,
            })),
            Some(other) => {
                warn!(response = ?other, "unexpected response to status query");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn stop(&mut self) -> Result<()> {
        ProcessBackend::shutdown(self)
    }
}

fn read_responses(stdout: ChildStdout, tx: &Sender<ProcessResponse>) {
    for line in BufReader::new(stdout).lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                debug!(error = %err, "response read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ProcessResponse>(&line) {
            Ok(response) => {
                if tx.send(response).is_err() {
                    break;
                }
            }
            Err(err) => warn!(error = %err, line = %line, "dropping unparseable response line"),
        }
    }
}
