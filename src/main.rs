//! ioforge CLI entry point

use anyhow::{Context, Result};
use clap::Parser;
use ioforge::config::cli::{Cli, Command, DiskstatsArgs, LayoutArgs, RunArgs};
use ioforge::config::{format_bytes, parse_size, toml::load_run_config};
use ioforge::coordinator::Coordinator;
use ioforge::diskutil::{render_report, DiskUtilRegistry};
use ioforge::output::{json, text};
use ioforge::target::layout::{LayoutManager, LayoutOptions};
use ioforge::target::Target;
use ioforge::util::cancel::CancellationToken;
use std::process::ExitCode;
use std::thread;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let result = match cli.command {
        Command::Run(args) => run(&args),
        Command::Diskstats(args) => diskstats(&args).map(|()| true),
        Command::Layout(args) => layout(&args).map(|()| true),
    };
    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(2)
        }
    }
}

fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Returns whether the run finished without IO or verification failures
fn run(args: &RunArgs) -> Result<bool> {
    let config = load_run_config(args)?;
    debug!(?config, "effective configuration");

    let coordinator = Coordinator::new(config.clone());
    let report = coordinator.run()?;

    if config.output.json {
        println!("{}", json::to_json(&config, &report)?);
    } else {
        text::print_results(&report);
    }
    if let Some(path) = &config.output.json_output {
        json::write_json_output(path, &config, &report)?;
        info!(path = %path.display(), "JSON report written");
    }
    Ok(!report.has_failures())
}

fn diskstats(args: &DiskstatsArgs) -> Result<()> {
    let registry = DiskUtilRegistry::new(&args.sysfs_root);
    let id = registry
        .register(&args.path)
        .with_context(|| format!("Failed to find the device behind {}", args.path.display()))?
        .with_context(|| format!("{} is not backed by a block device", args.path.display()))?;
    info!(%id, devices = registry.len(), "watching");

    let interval = Duration::from_millis(args.interval_ms.max(1));
    for _ in 0..args.count {
        thread::sleep(interval);
        registry.tick_all();
        print!("{}", render_report(&registry.snapshot()));
    }
    registry.drain_and_report();
    Ok(())
}

fn layout(args: &LayoutArgs) -> Result<()> {
    let size = parse_size(&args.size)?;
    let chunk = parse_size(&args.block_size)?;
    let opts = LayoutOptions {
        size: None,
        start_offset: 0,
        file_size_range: None,
        overwrite: false,
        create_fsync: !args.no_fsync,
        preallocate: !args.no_preallocate,
        invalidate_cache: false,
        unlink: false,
        has_reads: true,
        has_writes: false,
        min_block: chunk,
        fill_chunk: usize::try_from(chunk.max(1)).context("block size too large")?,
    };

    let mut target = Target::new(args.path.clone());
    target.requested_size = Some(size);
    let mut targets = [target];
    let mut manager = LayoutManager::new(opts, CancellationToken::new(), 0);
    manager.plan(&mut targets)?;

    let step = (size / 10).max(1);
    let mut next = step;
    manager.extend_with_progress(&mut targets[0], |filled| {
        if filled >= next {
            info!(filled = %format_bytes(filled), total = %format_bytes(size), "layout progress");
            next = filled + step;
        }
    })?;
    println!("{}: {}", args.path.display(), format_bytes(size));
    Ok(())
}
