//! Operator CLI for the conversation control plane.
//!
//! `chat` hosts a simulated agent conversation behind the chosen backend and
//! scopes a pause listener around every run. `worker` is the process
//! backend's child entry point; it is spawned, not typed.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use conduct::backend::process::ProcessBackend;
use conduct::backend::protocol::ProcessResponse;
use conduct::backend::worker::{self, WorkerOptions};
use conduct::backend::{DirectBackend, ExecutionBackend};
use conduct::conversation::ConversationFactory;
use conduct::io::config::{ControlConfig, load_config};
use conduct::io::keys::TerminalKeys;
use conduct::io::prompt::TerminalPrompter;
use conduct::pause::{PauseCallbacks, PauseListener};
use conduct::runner::{ConversationRunner, NonInteractivePrompter};
use conduct::sim::{SimConfig, SimulatedFactory};
use conduct::logging;

#[derive(Parser)]
#[command(
    name = "conduct",
    version,
    about = "Operator control plane for LLM agent conversations"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Interactive chat against the simulated agent.
    Chat {
        /// Host the conversation in an isolated worker process.
        #[arg(long)]
        process: bool,
        /// Start with the security analyzer attached (confirmation mode on).
        #[arg(long)]
        confirm: bool,
        /// Finish the simulated conversation after N executed steps.
        #[arg(long)]
        finish_on_step: Option<u32>,
        /// Path to the configuration file.
        #[arg(long, default_value = "conduct.toml")]
        config: PathBuf,
    },
    /// Process-backend child entry point (spawned by `chat --process`).
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        conversation_id: String,
        #[arg(long)]
        confirm: bool,
        #[arg(long)]
        start_paused: bool,
        #[arg(long)]
        start_waiting: bool,
        #[arg(long)]
        finish_on_step: Option<u32>,
        #[arg(long, default_value_t = 8)]
        max_iterations_per_run: u32,
        /// Simulated work per step, in milliseconds.
        #[arg(long, default_value_t = 0)]
        step_delay_ms: u64,
        /// Test hook: keep serving after a shutdown command.
        #[arg(long, hide = true)]
        ignore_shutdown: bool,
        /// Test hook: report a construction failure and exit.
        #[arg(long, hide = true)]
        fail_construction: bool,
    },
}

fn main() {
    logging::init();
    if let Err(err) = run() {
        eprintln!("{:#}", err);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Chat {
            process,
            confirm,
            finish_on_step,
            config,
        } => cmd_chat(process, confirm, finish_on_step, &config),
        Command::Worker {
            conversation_id,
            confirm,
            start_paused,
            start_waiting,
            finish_on_step,
            max_iterations_per_run,
            step_delay_ms,
            ignore_shutdown,
            fail_construction,
        } => cmd_worker(&WorkerArgs {
            conversation_id,
            confirm,
            start_paused,
            start_waiting,
            finish_on_step,
            max_iterations_per_run,
            step_delay_ms,
            ignore_shutdown,
            fail_construction,
        }),
    }
}

struct WorkerArgs {
    conversation_id: String,
    confirm: bool,
    start_paused: bool,
    start_waiting: bool,
    finish_on_step: Option<u32>,
    max_iterations_per_run: u32,
    step_delay_ms: u64,
    ignore_shutdown: bool,
    fail_construction: bool,
}

fn cmd_worker(args: &WorkerArgs) -> Result<()> {
    let term_flag = worker::install_signal_handlers()?;
    let mut stdout = std::io::stdout();

    // Construction failures are reported over the response queue, never as a
    // silent crash the parent has to infer from a timeout.
    let runner = match build_worker_runner(args) {
        Ok(runner) => runner,
        Err(err) => {
            worker::write_response(
                &mut stdout,
                &ProcessResponse::Error {
                    message: format!("{err:#}"),
                },
            )?;
            return Ok(());
        }
    };
    worker::write_response(
        &mut stdout,
        &ProcessResponse::Success {
            message: "conversation ready".to_string(),
        },
    )?;

    let options = WorkerOptions {
        poll_interval: Duration::from_secs(1),
        ignore_shutdown: args.ignore_shutdown,
        term_flag,
    };
    worker::serve(runner, std::io::stdin(), stdout, &options)
}

fn build_worker_runner(args: &WorkerArgs) -> Result<ConversationRunner> {
    if args.fail_construction {
        anyhow::bail!("conversation construction failed (forced by --fail-construction)");
    }
    let factory = Arc::new(SimulatedFactory::new(SimConfig {
        finish_on_step: args.finish_on_step,
        max_iterations_per_run: args.max_iterations_per_run,
        start_paused: args.start_paused,
        start_waiting: args.start_waiting,
        risky_steps: vec![],
        step_delay: Duration::from_millis(args.step_delay_ms),
    }));
    let conversation = factory
        .setup_conversation(&args.conversation_id, args.confirm)
        .context("set up worker conversation")?;
    // The worker has no terminal: its stdin is the command queue. Pending
    // actions stay parked until the operator decides through the parent.
    Ok(ConversationRunner::new(
        conversation,
        factory,
        Arc::new(NonInteractivePrompter),
    ))
}

fn cmd_chat(
    process: bool,
    confirm: bool,
    finish_on_step: Option<u32>,
    config_path: &Path,
) -> Result<()> {
    let cfg = load_config(config_path)?;
    let conversation_id = format!("chat-{}", std::process::id());

    if process {
        let mut extra = vec![
            "--conversation-id".to_string(),
            conversation_id,
            "--max-iterations-per-run".to_string(),
            cfg.conversation.max_iterations_per_run.to_string(),
        ];
        if confirm {
            extra.push("--confirm".to_string());
        }
        if let Some(step) = finish_on_step {
            extra.push("--finish-on-step".to_string());
            extra.push(step.to_string());
        }
        let extra_refs: Vec<&str> = extra.iter().map(String::as_str).collect();
        let command = ProcessBackend::self_worker_command(&extra_refs)?;
        let mut backend = ProcessBackend::spawn(&command, cfg.process_timeouts())?;
        // The worker owns the conversation; pause intent reaches it as a
        // command between runs.
        let result = chat_loop(&mut backend, &cfg, &|_| PauseCallbacks::noop());
        backend.stop()?;
        result
    } else {
        let mut sim_config = cfg.sim_config();
        if let Some(step) = finish_on_step {
            sim_config.finish_on_step = Some(step);
        }
        let factory = Arc::new(SimulatedFactory::new(sim_config));
        let conversation = factory
            .setup_conversation(&conversation_id, confirm)
            .context("set up conversation")?;
        let runner = ConversationRunner::new(
            conversation,
            factory as Arc<dyn ConversationFactory>,
            Arc::new(TerminalPrompter),
        );
        let mut backend = DirectBackend::new(runner);
        // Callbacks are rebuilt for every run so they pause whichever
        // conversation the runner currently holds.
        let result = chat_loop(&mut backend, &cfg, &DirectBackend::pause_callbacks);
        backend.stop()?;
        result
    }
}

fn chat_loop<B: ExecutionBackend>(
    backend: &mut B,
    cfg: &ControlConfig,
    make_callbacks: &dyn Fn(&B) -> PauseCallbacks,
) -> Result<()> {
    println!("Commands: /pause /resume /toggle /status /exit. Anything else is a message.");
    println!("While the agent runs: Ctrl-P pauses, double Ctrl-C terminates.");
    let stdin = std::io::stdin();
    loop {
        print!("> ");
        std::io::stdout().flush().context("flush prompt")?;
        let mut line = String::new();
        if stdin.read_line(&mut line).context("read input")? == 0 {
            break;
        }
        let line = line.trim();
        match line {
            "" => {}
            "/exit" => break,
            "/pause" => {
                report_outcome("pause", backend.pause()?);
            }
            "/toggle" => {
                report_outcome("toggle", backend.toggle_confirmation_mode()?);
            }
            "/status" => match backend.get_status()? {
                Some(report) => println!(
                    "status: {} (confirmation mode {})",
                    report.agent_status,
                    if report.confirmation_mode { "on" } else { "off" }
                ),
                None => println!("status unknown (worker did not answer in time)"),
            },
            "/resume" => {
                if !run_with_listener(backend, None, cfg, make_callbacks)? {
                    break;
                }
            }
            message => {
                if !run_with_listener(backend, Some(message), cfg, make_callbacks)? {
                    break;
                }
            }
        }
    }
    Ok(())
}

fn report_outcome(what: &str, acknowledged: bool) {
    if acknowledged {
        println!("{what}: ok");
    } else {
        println!("{what}: outcome unknown (worker did not answer in time)");
    }
}

/// Scope a pause listener around one run. Returns `false` when the operator
/// terminated the session.
fn run_with_listener<B: ExecutionBackend>(
    backend: &mut B,
    message: Option<&str>,
    cfg: &ControlConfig,
    make_callbacks: &dyn Fn(&B) -> PauseCallbacks,
) -> Result<bool> {
    let listener = match TerminalKeys::new() {
        Ok(keys) => Some(PauseListener::start(
            keys,
            make_callbacks(backend),
            cfg.listener_config(),
        )),
        Err(err) => {
            tracing::debug!(error = %err, "no raw terminal; running without pause keys");
            None
        }
    };
    let acknowledged = backend.process_message(message)?;
    let Some(mut listener) = listener else {
        report_outcome("run", acknowledged);
        return Ok(true);
    };
    listener.stop();
    if listener.is_terminated() {
        println!("Terminating session.");
        backend.stop()?;
        return Ok(false);
    }
    if listener.is_paused() {
        // Reaches a worker that is still mid-run as a queued command; the
        // inline backend was already paused through the callback.
        backend.pause()?;
        println!("Paused. Send a message or /resume to continue.");
        return Ok(true);
    }
    report_outcome("run", acknowledged);
    Ok(true)
}
