use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crew::config::Config;
use crew::core::ledger::NewTask;
use crew::job::{JobId, JobManager, JobStatus, RuntimeCommand};
use crew::orchestration::runtime::{cancel_on_signal, JobContext, Runtime, RuntimeInput};
use crew::orchestration::{Supervisor, TeamConfig, TeamLauncher};
use crew::tmux::{sanitize_name, Tmux};
use crew::{agent::AgentKind, clog, clog_debug, Error, Result};

/// crew - run a team of CLI coding agents in tmux panes
#[derive(Parser, Debug)]
#[command(name = "crew")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    CREW_DEBUG=1      Enable debug logging (alternative to --debug)\n    CREW_JOBS_DIR     Where job files are kept (default ~/.crew/team-jobs)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.crew/crew.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Start a team in the background and print its job id
    Start {
        /// Team name
        #[arg(long)]
        team: String,

        /// Worker kind, one per worker (claude, codex, gemini)
        #[arg(long = "agent", required = true)]
        agents: Vec<AgentKind>,

        /// Task as "subject::description"
        #[arg(long = "task", required = true, value_parser = parse_task)]
        tasks: Vec<NewTask>,

        /// Working directory shared by all workers (default: current)
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Number of workers (default: one per --agent)
        #[arg(long)]
        workers: Option<usize>,

        /// Model passed to every worker
        #[arg(long)]
        model: Option<String>,
    },

    /// Print the current state of a job
    Status { job_id: String },

    /// Block until a job finishes or the timeout runs out
    Wait {
        job_id: String,

        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Kill the worker panes of a finished job
    Cleanup {
        job_id: String,

        #[arg(long)]
        grace_ms: Option<u64>,
    },

    /// Run a team in the foreground; reads its config as JSON on stdin
    #[command(hide = true)]
    Runtime,
}

fn parse_task(raw: &str) -> std::result::Result<NewTask, String> {
    let (subject, description) = match raw.split_once("::") {
        Some((s, d)) => (s.trim(), d.trim()),
        None => (raw.trim(), raw.trim()),
    };
    if subject.is_empty() {
        return Err("task subject must not be empty".to_string());
    }
    Ok(NewTask::new(subject, description))
}

fn main() {
    let cli = Cli::parse();
    crew::log::init_with_debug(cli.debug);

    let code = match cli.command {
        Command::Runtime => run_runtime(),
        command => match run_command(command) {
            Ok(code) => code,
            Err(e) => {
                print_json(&serde_json::json!({ "error": e.to_string() }));
                1
            }
        },
    };
    std::process::exit(code);
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{}", s),
        Err(e) => eprintln!("crew: output not serializable: {}", e),
    }
}

fn job_manager(settings: &Config) -> Result<JobManager> {
    let mut manager = JobManager::new(settings.jobs_dir()?, RuntimeCommand::current_exe()?)
        .with_kill_grace(settings.kill_grace());
    match Tmux::new() {
        Ok(tmux) => {
            let supervisor = Supervisor::new(Arc::new(tmux), settings)?;
            manager = manager.with_supervisor(Arc::new(supervisor));
        }
        Err(e) => clog_debug!("job manager without multiplexer: {}", e),
    }
    Ok(manager)
}

fn run_command(command: Command) -> Result<i32> {
    let settings = Config::load()?;
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let manager = job_manager(&settings)?;
        match command {
            Command::Start {
                team,
                agents,
                tasks,
                cwd,
                workers,
                model,
            } => {
                let cwd = match cwd {
                    Some(dir) => dir,
                    None => std::env::current_dir()?,
                };
                let config = TeamConfig {
                    team_name: sanitize_name(&team)?,
                    worker_count: workers.unwrap_or(agents.len()),
                    agent_types: agents,
                    tasks,
                    cwd: std::fs::canonicalize(&cwd).unwrap_or(cwd),
                    model,
                };
                let started = manager.start(&config).await?;
                print_json(&started);
                Ok(if started.pid.is_some() { 0 } else { 1 })
            }
            Command::Status { job_id } => {
                let report = manager.status(&JobId::parse(&job_id)?).await?;
                print_json(&report);
                Ok(0)
            }
            Command::Wait { job_id, timeout_ms } => {
                let id = JobId::parse(&job_id)?;
                let report = manager.wait(&id, timeout_ms.map(Duration::from_millis)).await?;
                print_json(&report);
                Ok(if report.status == JobStatus::Completed { 0 } else { 1 })
            }
            Command::Cleanup { job_id, grace_ms } => {
                let id = JobId::parse(&job_id)?;
                let report = manager.cleanup(&id, grace_ms.map(Duration::from_millis)).await?;
                print_json(&report);
                Ok(0)
            }
            Command::Runtime => Err(Error::Validation("runtime is not a job command".to_string())),
        }
    })
}

/// `crew runtime`: the child side of a job. Logs go to stderr as well so
/// the job keeps them as its trail.
fn run_runtime() -> i32 {
    crew::log::mirror_to_stderr(true);

    let mut raw = String::new();
    if let Err(e) = std::io::stdin().read_to_string(&mut raw) {
        eprintln!("crew runtime: cannot read stdin: {}", e);
        return 1;
    }
    let input: RuntimeInput = match serde_json::from_str(&raw) {
        Ok(input) => input,
        Err(e) => {
            eprintln!("crew runtime: invalid JSON on stdin: {}", e);
            return 1;
        }
    };
    let poll_interval = input.poll_interval();
    let config = match input.into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("crew runtime: {}", e);
            return 1;
        }
    };

    match execute_runtime(config, poll_interval) {
        Ok(report) => {
            clog!("runtime finished: {} in {:.1}s", report.status, report.duration);
            print_json(&report);
            report.exit_code()
        }
        Err(e) => {
            eprintln!("crew runtime: {}", e);
            1
        }
    }
}

fn execute_runtime(
    config: TeamConfig,
    poll_interval: Option<Duration>,
) -> Result<crew::orchestration::RuntimeReport> {
    let settings = Config::load()?;
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let supervisor = Arc::new(Supervisor::new(Arc::new(Tmux::new()?), &settings)?);
        let launcher = TeamLauncher::new(supervisor, settings.clone());
        let mut runtime = Runtime::new(launcher, &settings).with_job(JobContext::from_env());
        if let Some(interval) = poll_interval {
            runtime = runtime.with_poll_interval(interval);
        }

        let cancel = CancellationToken::new();
        cancel_on_signal(cancel.clone());
        runtime.run(config, cancel).await
    })
}
