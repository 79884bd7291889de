use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

use drover::audit::AuditJournal;
use drover::backends::{BackendRegistry, TokenState};
use drover::config::Config;
use drover::continuation::ContinuationStore;
use drover::invoker::{self, InvokeRequest};
use drover::locks::LockRegistry;
use drover::supervisor::{format_instant, Supervisor};
use drover::validation::clap_task_validator;

#[derive(Parser)]
#[command(name = "drover")]
#[command(about = "Markdown-driven LLM task orchestration daemon", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon (watcher + scheduler under supervision)
    Run {
        /// Log every decision but never spawn invokers
        #[arg(long)]
        dry_run: bool,
    },

    /// Show backends, capacity, exhaustion, and outstanding work
    Status,

    /// Sweep locks whose owning process is gone
    Reap,

    /// Backend invoker entry point (spawned by the scheduler)
    #[command(hide = true)]
    Invoke {
        #[arg(long)]
        backend: String,

        #[arg(long, value_parser = clap_task_validator)]
        task: String,

        #[arg(long)]
        task_dir: PathBuf,

        #[arg(long)]
        input: String,

        #[arg(long)]
        output: String,

        #[arg(long)]
        resume: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::from_env();

    match cli.command {
        Commands::Run { dry_run } => {
            if dry_run {
                config.dry_run = true;
            }
            if config.dry_run {
                println!("{}", "Running in DRY-RUN mode: no invokers will spawn".yellow());
            }
            Supervisor::new(config).run()
        }
        Commands::Status => {
            print_status(&config);
            Ok(())
        }
        Commands::Reap => {
            let reaped = LockRegistry::new(config.locks_dir()).reap_stale();
            println!("Reaped {reaped} stale locks");
            Ok(())
        }
        Commands::Invoke {
            backend,
            task,
            task_dir,
            input,
            output,
            resume,
        } => {
            let request = InvokeRequest {
                backend,
                task,
                task_dir,
                input,
                output,
                resume,
            };
            let outcome = invoker::run(&config, &request);
            if let Some(sid) = &outcome.session_id {
                println!("SESSION_ID:{sid}");
            }
            if let Some(turns) = outcome.turns_used {
                println!("TURNS_USED:{turns}");
            }
            if let Some(token) = &outcome.token_exhausted {
                println!("TOKEN_EXHAUSTED:{token}");
            }
            std::process::exit(outcome.exit_code);
        }
    }
}

fn print_status(config: &Config) {
    let registry = BackendRegistry::from_config(config);
    let locks = LockRegistry::new(config.locks_dir());
    let tokens = TokenState::new(config.token_state_file());

    println!("{}", "Backends".bold());
    for name in registry.list() {
        let backend = registry.get(name).unwrap();
        let held = locks.count(name);
        let slots = registry.slots_available(name, &locks);
        let state = if registry.is_exhausted(name, &tokens) {
            let until = tokens
                .reset_at(name)
                .map(format_instant)
                .unwrap_or_else(|| "unknown".to_string());
            format!("exhausted until {until}").red().to_string()
        } else if slots == 0 {
            "busy".yellow().to_string()
        } else {
            "available".green().to_string()
        };
        println!(
            "  {name:<12} {held}/{} in use  {state}",
            backend.max_parallel
        );
        for task in locks.live_tasks(name) {
            let pid = locks.pid_of(name, &task).unwrap_or(0);
            println!("    {} {task} (pid {pid})", "▸".dimmed());
        }
    }

    let continuations = ContinuationStore::new(config.continuations_dir()).pending();
    if !continuations.is_empty() {
        println!("\n{}", "Pending continuations".bold());
        for record in continuations {
            println!(
                "  {:<20} round {}/{} on session {}",
                record.task,
                record.continuation_count,
                drover::continuation::MAX_CONTINUATIONS,
                record.session_id
            );
        }
    }

    let audit = AuditJournal::new(
        config.journal_file(),
        config.audit_dir(),
        config.usage_dir(),
    );
    match audit.check_incomplete() {
        Ok(incomplete) if !incomplete.is_empty() => {
            println!("\n{}", "Incomplete invocations (unmatched START)".bold());
            for task in incomplete {
                println!("  {}", task.red());
            }
        }
        Ok(_) => {}
        Err(e) => eprintln!("Journal check failed: {e:#}"),
    }
}
