//! CLI command handling
//!
//! Runs commands in-process and formats their output.

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::commands::Commands;
use crate::common::config::Config;
use crate::common::{Error, Result};
use crate::engine::{
    AssertionResult, EventBus, ProcessAdapter, RunEvent, ScenarioResult, ScenarioRunner, StepResult,
};
use crate::orchestrator::{
    job, scheduler, BatchReport, EngineExecutor, HistoryEntry, HistoryStore, JobDescriptor,
    JobEvent, JobOutcome, JobReport, JsonHistory, Orchestrator, Origin, StaticJobs,
};
use crate::scenario::Scenario;

/// Dispatch a CLI command
///
/// Returns whether the command's run succeeded.
pub async fn dispatch(command: Commands, config_path: Option<&Path>) -> Result<bool> {
    let config = match config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match command {
        Commands::Run {
            scenario,
            binary,
            timeout,
            encoding,
            verbose,
            json,
        } => {
            let binary = target_binary(&config, binary)?;
            let timeout = timeout
                .map(Duration::from_millis)
                .unwrap_or_else(|| config.engine.timeout());
            let encoding = encoding.unwrap_or_else(|| config.engine.effective_encoding().to_string());
            let adapter = ProcessAdapter::new(binary)
                .with_timeout(timeout)
                .with_encoding(&encoding);
            run_scenario(adapter, &scenario, verbose, json).await
        }

        Commands::Batch {
            dir,
            binary,
            concurrency,
            excludes,
            json,
        } => {
            let binary = binary.or_else(|| config.engine.binary_path.clone());
            run_batch(config, dir, binary, concurrency, excludes, json).await
        }

        Commands::Job { name, json } => run_job(config, &name, json).await,

        Commands::Schedule => run_schedule(config).await,

        Commands::History { limit, json } => {
            let entries = match history_store(&config) {
                Some(store) => store.recent(limit)?,
                None => Vec::new(),
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                print_history(&entries);
            }
            Ok(true)
        }
    }
}

fn target_binary(config: &Config, binary: Option<PathBuf>) -> Result<PathBuf> {
    let binary = binary
        .or_else(|| config.engine.binary_path.clone())
        .ok_or_else(|| {
            Error::Config("no target executable; pass --binary or set [engine] binary_path".into())
        })?;
    job::resolve_binary(&binary, Path::new("."))
}

fn history_store(config: &Config) -> Option<JsonHistory> {
    config
        .history
        .resolved_path()
        .map(|path| JsonHistory::new(path, config.history.keep))
}

/// Cancel the returned token on Ctrl-C
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling");
            trigger.cancel();
        }
    });
    cancel
}

async fn run_scenario(adapter: ProcessAdapter, path: &Path, verbose: bool, json: bool) -> Result<bool> {
    let scenario = Scenario::load(path)?;
    let events = EventBus::default();
    let printer = (!json).then(|| tokio::spawn(print_run_events(events.subscribe(), verbose)));

    let cancel = cancel_on_ctrl_c();
    let mut runner = ScenarioRunner::new(adapter).with_events(events);
    let result = runner.run(&scenario, &cancel).await;
    drop(runner);

    if let Some(printer) = printer {
        let _ = printer.await;
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_scenario_summary(&result);
    }
    Ok(result.success)
}

async fn run_batch(
    config: Config,
    dir: PathBuf,
    binary: Option<PathBuf>,
    concurrency: Option<usize>,
    excludes: Vec<String>,
    json: bool,
) -> Result<bool> {
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "batch".to_string());
    let jobs = StaticJobs::new(".").with_job(
        &name,
        JobDescriptor {
            binary_path: binary,
            collection: Some(dir),
            exclude_patterns: excludes,
            concurrency,
            ..Default::default()
        },
    );

    let orchestrator = Orchestrator::builder(config).jobs(jobs).build();
    let mut events = orchestrator.subscribe();
    let handle = orchestrator.submit(&name, Origin::Adhoc)?;

    let progress = (!json).then(|| {
        let pb = ProgressBar::new(0);
        if let Ok(style) =
            ProgressStyle::default_bar().template("  [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            pb.set_style(style.progress_chars("=> "));
        }
        pb
    });
    let ticker = progress.clone().map(|pb| {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(JobEvent::BatchProgress {
                        total,
                        file,
                        success,
                        ..
                    }) => {
                        pb.set_length(total as u64);
                        pb.inc(1);
                        let label = file
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_default();
                        let label = if success { label.green() } else { label.red() };
                        pb.set_message(label.to_string());
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    });

    let report = tokio::select! {
        report = handle.wait() => report?,
        _ = tokio::signal::ctrl_c() => {
            orchestrator.shutdown();
            return Err(Error::Cancelled);
        }
    };
    if let Some(ticker) = ticker {
        ticker.abort();
    }
    if let Some(pb) = progress {
        pb.finish_and_clear();
    }
    orchestrator.shutdown();

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_job_report(&report);
    }
    Ok(report.success)
}

async fn run_job(config: Config, name: &str, json: bool) -> Result<bool> {
    let mut builder = Orchestrator::builder(config.clone());
    if let Some(store) = history_store(&config) {
        builder = builder.history(store);
    }
    let orchestrator = builder.build();

    let handle = orchestrator.submit(name, Origin::Adhoc)?;
    if !json {
        println!("{} {} ({})", "Running Job:".blue().bold(), name.white().bold(), handle.run_id());
    }

    let report = tokio::select! {
        report = handle.wait() => report?,
        _ = tokio::signal::ctrl_c() => {
            orchestrator.shutdown();
            return Err(Error::Cancelled);
        }
    };
    orchestrator.shutdown();

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_job_report(&report);
    }
    Ok(report.success)
}

async fn run_schedule(config: Config) -> Result<bool> {
    if config.schedules.is_empty() {
        return Err(Error::Config("no [[schedules]] configured".to_string()));
    }

    let run_events = EventBus::default();
    let mut builder = Orchestrator::builder(config.clone())
        .executor(EngineExecutor::with_events(run_events));
    if let Some(store) = history_store(&config) {
        builder = builder.history(store);
    }
    let orchestrator = builder.build();
    let triggers = scheduler::spawn(&orchestrator, &config.schedules);

    tracing::info!(schedules = triggers.len(), "Scheduler running, Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    let status = orchestrator.get_status();
    tracing::info!(
        running = ?status.running.as_ref().map(|r| r.job_name.as_str()),
        queued = status.queue.length,
        "Stopping scheduler"
    );
    orchestrator.shutdown();
    for trigger in triggers {
        let _ = trigger.await;
    }
    Ok(true)
}

async fn print_run_events(mut rx: broadcast::Receiver<RunEvent>, verbose: bool) {
    loop {
        match rx.recv().await {
            Ok(event) => print_run_event(&event, verbose),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "Output display lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn print_run_event(event: &RunEvent, verbose: bool) {
    match event {
        RunEvent::ScenarioStart { info, steps, .. } => {
            println!(
                "\n{} {}",
                "Running Scenario:".blue().bold(),
                info.name.white().bold()
            );
            if let Some(desc) = &info.description {
                println!("  {}", desc.dimmed());
            }
            println!("  {} step(s)\n", steps);
        }
        RunEvent::StepStart {
            index,
            name,
            command_line,
            ..
        } => {
            if verbose {
                println!("{} {}", format!("[{}]", index + 1).cyan(), name);
                println!("  $ {}", command_line.dimmed());
            }
        }
        RunEvent::StdoutChunk { text, .. } if verbose => {
            for line in text.lines() {
                println!("  {}", line.dimmed());
            }
        }
        RunEvent::StderrChunk { text, .. } if verbose => {
            for line in text.lines() {
                println!("  {}", line.yellow());
            }
        }
        RunEvent::StepComplete { result } => print_step(result),
        RunEvent::StepError { index, name, error } => {
            println!("  {} {} {}", "✗".red(), format!("{}. {}", index + 1, name).red(), error.dimmed());
        }
        _ => {}
    }
}

fn print_step(step: &StepResult) {
    let label = format!("{}. {}", step.index + 1, step.name);
    if step.passed {
        println!(
            "  {} {} {}",
            "✓".green(),
            label,
            format!("({}ms)", step.duration_ms()).dimmed()
        );
    } else {
        println!(
            "  {} {} {}",
            "✗".red(),
            label.red(),
            format!("({}ms)", step.duration_ms()).dimmed()
        );
    }
    for assertion in step.failed_assertions() {
        print_failed_assertion(assertion);
    }
    for warning in step.assertions.iter().filter_map(|a| a.warning.as_deref()) {
        println!("      {} {}", "!".yellow(), warning.yellow());
    }
}

fn print_failed_assertion(assertion: &AssertionResult) {
    println!("      {} {}", "✗".red(), assertion.name);
    println!(
        "        expected {}, got {}",
        assertion.expected.green(),
        assertion.actual.red()
    );
    if let Some(diagnostic) = &assertion.diagnostic {
        println!("        {}", diagnostic.dimmed());
    }
    if let Some(breakdown) = &assertion.breakdown {
        for operand in &breakdown.operands {
            let mark = match operand.result {
                Some(true) => "✓".green(),
                Some(false) => "✗".red(),
                None => "!".yellow(),
            };
            println!("        {} {}", mark, operand.expression.dimmed());
        }
    }
}

fn print_scenario_summary(result: &ScenarioResult) {
    let summary = &result.summary;
    let headline = if result.success {
        "✓ Scenario Passed".green().bold()
    } else {
        "✗ Scenario Failed".red().bold()
    };
    println!(
        "\n{}  {}/{} steps passed, {:.0}%, {}ms\n",
        headline,
        summary.passed,
        summary.total,
        result.success_rate(),
        summary.duration_ms
    );
}

fn print_batch(batch: &BatchReport) {
    for entry in &batch.entries {
        let file = entry.file.display().to_string();
        if entry.success {
            println!("  {} {}", "✓".green(), file);
        } else {
            println!("  {} {}", "✗".red(), file.red());
            if let Some(error) = &entry.error {
                println!("      {}", error.dimmed());
            }
            if let Some(result) = &entry.result {
                for step in result.steps.iter().filter(|s| !s.passed) {
                    println!("      {} {}", "✗".red(), step.name);
                }
            }
        }
    }
}

fn print_job_report(report: &JobReport) {
    match &report.outcome {
        JobOutcome::Plain(response) => {
            for line in response.stdout.lines() {
                println!("  {}", line.dimmed());
            }
        }
        JobOutcome::Scenario(result) => {
            for step in &result.steps {
                print_step(step);
            }
        }
        JobOutcome::Batch(batch) => print_batch(batch),
        JobOutcome::Failed(error) => println!("  {}", error.red()),
    }

    let headline = if report.success {
        format!("✓ {} passed", report.job).green().bold()
    } else {
        format!("✗ {} failed", report.job).red().bold()
    };
    println!(
        "\n{}  {}, {}ms\n",
        headline,
        report.summary(),
        report.duration_ms
    );
}

fn print_history(entries: &[HistoryEntry]) {
    if entries.is_empty() {
        println!("No runs recorded");
        return;
    }
    for entry in entries {
        let mark = if entry.success { "✓".green() } else { "✗".red() };
        println!(
            "  {} {} {} {} {}",
            mark,
            entry.finished_at.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
            entry.job.bold(),
            format!("[{}/{}]", entry.origin, entry.kind).dimmed(),
            entry.summary
        );
    }
}
