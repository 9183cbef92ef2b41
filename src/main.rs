//! taskpool - run component method calls on a worker pool.

mod cli;
mod report;

use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};
use rand::Rng;
use serde_json::json;
use tracing::info;

use cli::{Cli, Commands, RunArgs};
use report::RunSummary;
use taskpool::demo::{self, Calc};
use taskpool::{TaskDispatcher, logging};

fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        owo_colors::set_override(false);
    }
    logging::init(cli.log_config());

    let result = match &cli.command {
        Commands::Run(args) => cmd_run(&cli, args),
        Commands::Worker => taskpool::run_worker_main(demo::registry()),
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        // Print the error chain if there are causes
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

fn cmd_run(cli: &Cli, args: &RunArgs) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create Tokio runtime")?;
    let summary = runtime.block_on(run_pool(cli, args))?;

    if !summary.is_clean() {
        anyhow::bail!(
            "{} of {} tasks did not return the expected result",
            summary.wrong + summary.failed,
            summary.submitted
        );
    }
    Ok(())
}

async fn run_pool(cli: &Cli, args: &RunArgs) -> Result<RunSummary> {
    let strategy = args
        .strategy()
        .context("Failed to locate the taskpool executable")?;
    let dispatcher = TaskDispatcher::new(strategy, demo::registry());
    dispatcher.start().context("Failed to start worker pool")?;
    info!(tasks = args.tasks, "Submitting tasks");

    let started = Instant::now();
    let mut tasks = Vec::with_capacity(args.tasks);
    {
        let mut rng = rand::rng();
        for i in 1..=args.tasks {
            if args.crash_every.is_some_and(|n| n > 0 && i % n == 0) {
                tasks.push((None, dispatcher.run_task::<Calc, _>("crash", ())?));
                continue;
            }
            let a: i64 = rng.random_range(-1_000..=1_000);
            let b: i64 = rng.random_range(-1_000..=1_000);
            tasks.push((Some(a + b), dispatcher.run_task::<Calc, _>("plus", (a, b))?));
        }
    }

    let mut summary = RunSummary {
        submitted: tasks.len(),
        ..Default::default()
    };
    for (expected, task) in tasks {
        match (expected, task.await) {
            (Some(expected), Ok(value)) if value == json!(expected) => summary.correct += 1,
            (_, Ok(_)) => summary.wrong += 1,
            (_, Err(e)) => summary.record_error(&e),
        }
    }
    let elapsed = started.elapsed();

    let stats = dispatcher.stats().await?;
    dispatcher.terminate();

    if !cli.quiet {
        let colors = !cli.no_color;
        println!(
            "{}",
            report::render(&summary, &stats, elapsed, args.ascii, colors)
        );
    }
    Ok(summary)
}
