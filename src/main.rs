use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use log::info;
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

mod cli;

use cli::Cli;
use cli::commands::{Commands, RunCommands, SourceCommands};
use runsched::RunschedError;
use runsched::capacity::StoreCapacityOracle;
use runsched::config::Config;
use runsched::executor::{PendingRunner, build_executor};
use runsched::lifecycle::{AddSource, Controller, EditSource, RunNow, RunView, SourceView};
use runsched::scheduler::{DispatchOutcome, Scheduler, SkipReason, SweepOptions, SweepReport};
use runsched::server::{self, AppState};
use runsched::store::Database;

fn setup_logging(config: &Config) -> Result<()> {
    // Create log directory
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("runsched")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("runsched.log");

    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    let mut builder = env_logger::Builder::new();
    if let Some(level) = &config.log_level {
        builder.parse_filters(level);
    }
    // RUST_LOG wins over the config file
    builder
        .parse_env(env_logger::Env::default())
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

fn build_scheduler(config: Config) -> Result<Scheduler> {
    let db = Database::open(&config.store).context("Failed to open run store")?;
    let executor = build_executor(&config.executor, db.clone()).context("Failed to build executor")?;
    Ok(Scheduler::new(
        db,
        Arc::new(config),
        executor,
        Arc::new(StoreCapacityOracle),
    ))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("Failed to encode JSON")?);
    Ok(())
}

fn print_source(view: &SourceView) {
    let source = &view.source;
    let status = match source.status.as_str() {
        "active" => source.status.as_str().green(),
        "paused" => source.status.as_str().yellow(),
        _ => source.status.as_str().red(),
    };
    let interval = source
        .interval_seconds
        .map(|s| format!("{}s", s))
        .unwrap_or_else(|| "default".to_string());
    println!(
        "{:>4}  {:<8} {:<8} every {:<8} {}",
        source.id,
        status,
        source.category.as_str(),
        interval,
        source.url
    );
    if let Some(run) = &view.latest_run {
        print_run(run, "      ");
    }
}

fn print_run(view: &RunView, indent: &str) {
    let run = &view.run;
    let status = match view.run_status.as_str() {
        "completed" => view.run_status.as_str().green(),
        "running" | "pending" => view.run_status.as_str().cyan(),
        "paused" | "stale" => view.run_status.as_str().yellow(),
        _ => view.run_status.as_str().red(),
    };
    println!(
        "{}run {} {} {} found={} uploaded={} errors={} skipped={} max={}",
        indent,
        run.id,
        run.kind.as_str(),
        status,
        run.counters.found,
        run.counters.uploaded,
        run.counters.errors,
        run.counters.skipped,
        run.max_items
    );
    if let Some(message) = &run.error_message {
        println!("{}  {}", indent, message.dimmed());
    }
}

fn print_sweep(report: &SweepReport) {
    println!(
        "{} {} started, {} skipped, {} failed",
        "Sweep:".cyan(),
        report.started.len(),
        report.skipped.len(),
        report.failed.len()
    );
    for run in &report.started {
        println!("  {} source {} -> run {} ({})", "+".green(), run.source_id, run.run_id, run.status);
    }
    for skip in &report.skipped {
        println!("  {} source {}: {}", "-".yellow(), skip.source_id, skip.detail);
    }
    for failed in &report.failed {
        println!("  {} source {}: {}", "!".red(), failed.source_id, failed.error);
    }
}

/// Map a run-now skip to the error its exit code reports.
fn skip_error(reason: SkipReason) -> RunschedError {
    match reason {
        SkipReason::OverCapacity { detail } => RunschedError::OverCapacity(detail),
        other => RunschedError::InvalidState(format!("{}: {}", other.code(), other)),
    }
}

async fn run_application(cli: &Cli, config: Config) -> Result<()> {
    info!("Starting application");

    if cli.is_verbose() {
        println!("{}", "Verbose mode enabled".yellow());
    }

    // The runner only needs the store; every other command drives a scheduler
    match &cli.command {
        Commands::Runner => handle_runner(config).await,
        Commands::Sweep { backfill, force } => {
            handle_sweep(cli, build_scheduler(config)?, *backfill, *force).await
        }
        Commands::Daemon => handle_daemon(build_scheduler(config)?).await,
        Commands::Serve { bind, with_daemon } => {
            handle_serve(build_scheduler(config)?, bind.clone(), *with_daemon).await
        }
        Commands::Source { command } => handle_source_command(cli, command, build_scheduler(config)?).await,
        Commands::Run { command } => handle_run_command(cli, command, build_scheduler(config)?).await,
    }
}

async fn handle_runner(config: Config) -> Result<()> {
    let db = Database::open(&config.store).context("Failed to open run store")?;
    let runner = PendingRunner::new(db, config.executor.clone(), config.runner.clone());
    println!("{}", "Runner started, ctrl-c to stop".cyan());
    runner.run(shutdown_signal()).await?;
    Ok(())
}

async fn handle_sweep(cli: &Cli, scheduler: Scheduler, backfill: bool, force: bool) -> Result<()> {
    let report = scheduler
        .sweep(SweepOptions {
            backfill,
            force,
            now: None,
        })
        .await?;
    if cli.json {
        print_json(&report)?;
    } else {
        print_sweep(&report);
    }
    // Inline workers belong to this process
    scheduler.executor.drain().await;
    Ok(())
}

async fn handle_daemon(scheduler: Scheduler) -> Result<()> {
    println!("{}", "Daemon started, ctrl-c to stop".cyan());
    scheduler.run_daemon(shutdown_signal()).await?;
    Ok(())
}

async fn handle_serve(scheduler: Scheduler, bind: Option<String>, with_daemon: bool) -> Result<()> {
    let bind = bind.unwrap_or_else(|| scheduler.config.server.bind.clone());
    let state = Arc::new(AppState::new(Controller::new(scheduler.clone())));
    let (stop_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    let daemon = if with_daemon {
        let scheduler = scheduler.clone();
        let mut stop = stop_tx.subscribe();
        Some(tokio::spawn(async move {
            scheduler
                .run_daemon(async move {
                    let _ = stop.recv().await;
                })
                .await
        }))
    } else {
        None
    };

    println!("{} {}", "Serving on".cyan(), bind);
    let mut stop = stop_tx.subscribe();
    let served = server::serve(state, &bind, async move {
        let _ = stop.recv().await;
    });
    tokio::pin!(served);
    let served = tokio::select! {
        result = &mut served => result,
        _ = shutdown_signal() => {
            let _ = stop_tx.send(());
            served.await
        }
    };
    // Stop the daemon as well when the server failed
    let _ = stop_tx.send(());
    served?;

    if let Some(daemon) = daemon {
        daemon.await.context("Daemon task failed")??;
    } else {
        scheduler.executor.drain().await;
    }
    Ok(())
}

async fn handle_source_command(cli: &Cli, command: &SourceCommands, scheduler: Scheduler) -> Result<()> {
    info!("Handling source command: {:?}", command);
    let controller = Controller::new(scheduler.clone());

    match command {
        SourceCommands::Add {
            url,
            interval,
            disable_backoff,
        } => {
            let (view, created) = controller.add_source(&AddSource {
                url: url.clone(),
                interval_seconds: *interval,
                disable_backoff: *disable_backoff,
            })?;
            if cli.json {
                print_json(&view)?;
            } else {
                let label = if created { "Added:".green() } else { "Exists:".yellow() };
                println!("{}", label);
                print_source(&view);
            }
        }
        SourceCommands::List => {
            let sources = controller.list_sources()?;
            if cli.json {
                print_json(&sources)?;
            } else if sources.is_empty() {
                println!("{}", "No sources".dimmed());
            } else {
                sources.iter().for_each(print_source);
            }
        }
        SourceCommands::Show { id } => {
            let detail = controller.show_source(*id)?;
            if cli.json {
                print_json(&detail)?;
            } else {
                print_source(&detail.view);
                println!("{}", "Runs:".cyan());
                for run in &detail.runs {
                    print_run(run, "  ");
                }
            }
        }
        SourceCommands::Pause { id } => {
            let view = controller.pause(*id)?;
            if cli.json {
                print_json(&view)?;
            } else {
                println!("{} {}", "Paused:".yellow(), id);
            }
        }
        SourceCommands::Resume { id } => {
            let view = controller.resume(*id)?;
            if cli.json {
                print_json(&view)?;
            } else {
                println!("{} {}", "Resumed:".green(), id);
            }
        }
        SourceCommands::Stop { id } => {
            let report = controller.stop(*id)?;
            if cli.json {
                print_json(&report)?;
            } else {
                println!("{} {}", "Stopped:".red(), id);
                if let Some(run_id) = report.stopped_run {
                    println!("  run {} stopped", run_id);
                }
            }
        }
        SourceCommands::Run { id, force, max_items } => {
            let outcome = controller.run_now(
                *id,
                &RunNow {
                    force: *force,
                    max_items: *max_items,
                },
            )?;
            match outcome {
                DispatchOutcome::Started(run) => {
                    if cli.json {
                        print_json(&run)?;
                    } else {
                        println!("{} run {} for source {} ({})", "Started:".green(), run.run_id, id, run.status);
                    }
                    // Wait for an inline worker so its exit gets recorded
                    scheduler.executor.drain().await;
                }
                DispatchOutcome::Skipped(reason) => return Err(skip_error(reason).into()),
            }
        }
        SourceCommands::Edit {
            id,
            url,
            max_items,
            interval,
            clear_interval,
            disable_backoff,
        } => {
            let view = controller.edit(
                *id,
                &EditSource {
                    url: url.clone(),
                    max_items: *max_items,
                    interval_seconds: *interval,
                    clear_interval: *clear_interval,
                    disable_backoff: *disable_backoff,
                },
            )?;
            if cli.json {
                print_json(&view)?;
            } else {
                println!("{}", "Edited:".green());
                print_source(&view);
            }
        }
        SourceCommands::Delete { id, delete_outputs } => {
            controller.delete(*id, *delete_outputs)?;
            if !cli.json {
                println!("{} {}", "Deleted:".red(), id);
            }
        }
    }
    Ok(())
}

async fn handle_run_command(cli: &Cli, command: &RunCommands, scheduler: Scheduler) -> Result<()> {
    info!("Handling run command: {:?}", command);
    let controller = Controller::new(scheduler);

    match command {
        RunCommands::Reconcile { id, force } => {
            let report = controller.reconcile(*id, *force)?;
            if cli.json {
                print_json(&report)?;
            } else if report.changed {
                println!(
                    "{} run {} {} -> {} uploaded={}",
                    "Reconciled:".green(),
                    id,
                    report.previous_status,
                    report.run.status,
                    report.run.counters.uploaded
                );
            } else {
                println!("{} run {} already {}", "Unchanged:".yellow(), id, report.run.status);
            }
        }
        RunCommands::Logs { id, limit } => {
            let logs = controller.job_logs(*id, *limit)?;
            if cli.json {
                print_json(&logs)?;
            } else {
                for entry in &logs {
                    println!(
                        "{} {} {} {} {}",
                        entry.created_at.format("%H:%M:%S"),
                        entry.stage.as_str(),
                        entry.outcome.glyph(),
                        entry.item_url,
                        entry.message.as_deref().unwrap_or("")
                    );
                }
            }
        }
        RunCommands::Pending { limit } => {
            let limit = limit.unwrap_or(controller.scheduler().config.runner.pending_limit);
            let pending = controller.pending_runs(limit)?;
            if cli.json {
                print_json(&pending)?;
            } else {
                for run in &pending {
                    println!("run {} source {} max={} {}", run.run_id, run.source_id, run.max_items, run.url);
                }
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("{} {:#}", "Error:".red(), e);
        let code = e
            .chain()
            .find_map(|cause| cause.downcast_ref::<RunschedError>())
            .map(RunschedError::exit_code)
            .unwrap_or(1);
        std::process::exit(code);
    }
}

async fn run(cli: Cli) -> Result<()> {
    // Load configuration
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    setup_logging(&config).context("Failed to setup logging")?;

    info!("Starting with config from: {:?}", cli.config);

    run_application(&cli, config).await.context("Application failed")
}
