//! Child-process side of the process backend.
//!
//! Serves the strict request/response loop over stdin/stdout. Errors inside a
//! command handler are caught and answered as `Error` responses, so one bad
//! command cannot take the session down.

use std::io::{BufRead, BufReader, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::backend::protocol::{ProcessCommand, ProcessResponse};
use crate::runner::ConversationRunner;

/// Worker loop tuning.
pub struct WorkerOptions {
    /// How often the loop wakes to check signal flags between commands.
    pub poll_interval: Duration,
    /// Ignore shutdown commands and SIGTERM, simulating an unresponsive
    /// worker. Exists for exercising the parent's escalation ladder.
    pub ignore_shutdown: bool,
    /// Set by the SIGTERM handler; checked at poll boundaries.
    pub term_flag: Arc<AtomicBool>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            ignore_shutdown: false,
            term_flag: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Install the child-side signal handlers.
///
/// SIGTERM only sets a flag; the command loop logs it and exits at the next
/// poll boundary, so a worker blocked inside a step does not stop until that
/// step completes (the parent escalates to SIGKILL when this takes too
/// long). SIGINT is registered and ignored so a Ctrl-C aimed at the parent's
/// terminal never kills the worker directly.
pub fn install_signal_handlers() -> Result<Arc<AtomicBool>> {
    let term_flag = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&term_flag))
        .context("register SIGTERM handler")?;
    let int_flag = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, int_flag)
        .context("register SIGINT handler")?;
    Ok(term_flag)
}

/// Write one response line and flush, keeping the one-command/one-response
/// pairing observable by the parent immediately.
pub fn write_response<W: Write>(output: &mut W, response: &ProcessResponse) -> Result<()> {
    let mut line = serde_json::to_string(response).context("serialize response")?;
    line.push('\n');
    output.write_all(line.as_bytes()).context("write response")?;
    output.flush().context("flush response")
}

/// Serve the command loop until shutdown, SIGTERM, or a closed command
/// stream.
#[instrument(skip_all, fields(ignore_shutdown = options.ignore_shutdown))]
pub fn serve<R, W>(
    mut runner: ConversationRunner,
    input: R,
    mut output: W,
    options: &WorkerOptions,
) -> Result<()>
where
    R: Read + Send + 'static,
    W: Write,
{
    let commands = spawn_command_reader(input);
    let mut term_logged = false;
    loop {
        if options.term_flag.load(Ordering::SeqCst) {
            if options.ignore_shutdown {
                if !term_logged {
                    warn!("SIGTERM received but shutdown is ignored; continuing");
                    term_logged = true;
                }
            } else {
                info!("SIGTERM received; leaving command loop");
                return Ok(());
            }
        }
        let parsed = match commands.recv_timeout(options.poll_interval) {
            Ok(parsed) => parsed,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                debug!("command stream closed; exiting");
                return Ok(());
            }
        };
        let command = match parsed {
            Ok(command) => command,
            Err(message) => {
                // Even garbage gets its one response, preserving the pairing.
                write_response(&mut output, &ProcessResponse::Error { message })?;
                continue;
            }
        };
        let is_shutdown = matches!(command, ProcessCommand::Shutdown);
        let response = handle_command(&mut runner, command);
        write_response(&mut output, &response)?;
        if is_shutdown {
            if options.ignore_shutdown {
                warn!("shutdown command ignored; continuing to serve");
            } else {
                info!("shutdown acknowledged");
                return Ok(());
            }
        }
    }
}

fn spawn_command_reader<R: Read + Send + 'static>(
    input: R,
) -> mpsc::Receiver<Result<ProcessCommand, String>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for line in BufReader::new(input).lines() {
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    warn!(error = %err, "command read failed");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let parsed = serde_json::from_str::<ProcessCommand>(&line)
                .map_err(|err| format!("unparseable command: {err}"));
            if tx.send(parsed).is_err() {
                break;
            }
        }
    });
    rx
}

/// One command, one response. Handler errors become `Error` responses and
/// the loop keeps serving.
fn handle_command(runner: &mut ConversationRunner, command: ProcessCommand) -> ProcessResponse {
    match dispatch(runner, command) {
        Ok(response) => response,
        Err(err) => {
            let message = format!("{err:#}");
            warn!(error = %message, "command handler failed");
            ProcessResponse::Error { message }
        }
    }
}

fn dispatch(runner: &mut ConversationRunner, command: ProcessCommand) -> Result<ProcessResponse> {
    Ok(match command {
        ProcessCommand::ProcessMessage { message } => {
            runner.process_message(message.as_deref())?;
            ProcessResponse::Success {
                message: "message processed".to_string(),
            }
        }
        ProcessCommand::Pause => {
            runner.conversation().pause();
            ProcessResponse::Success {
                message: "pause requested".to_string(),
            }
        }
        ProcessCommand::Resume => {
            runner.process_message(None)?;
            ProcessResponse::Success {
                message: "resumed".to_string(),
            }
        }
        ProcessCommand::ToggleConfirmation => {
            let enabled = runner.toggle_confirmation_mode()?;
            ProcessResponse::Success {
                message: format!(
                    "confirmation mode {}",
                    if enabled { "enabled" } else { "disabled" }
                ),
            }
        }
        ProcessCommand::GetStatus => {
            let report = runner.status_report();
            ProcessResponse::Status {
                agent_status: report.agent_status,
                confirmation_mode: report.confirmation_mode,
            }
        }
        ProcessCommand::Shutdown => ProcessResponse::Success {
            message: "shutting down".to_string(),
        },
    })
}
