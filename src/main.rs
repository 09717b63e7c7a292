use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::Value;
use tracing::{error, info, warn};

use json_fanout::config::{Mode, PipelineConfig};
use json_fanout::flattener::{into_collection, Flattener};
use json_fanout::sample::synthetic_collection;
use json_fanout::{Aggregator, WorkerPool, WriterSink};

#[derive(Parser, Debug)]
#[command(name = "json_fanout", version, about = "Flatten JSON collections and fan them out to a bounded queue")]
struct CliArgs {
    /// TOML config file; JSON_FANOUT_* environment variables override it
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Input JSON document (array or single object)
    #[arg(short, long, value_name = "FILE")]
    input: Option<PathBuf>,

    #[arg(short, long, value_enum)]
    mode: Option<Mode>,

    #[arg(short, long, value_name = "NUM")]
    workers: Option<usize>,

    /// Dispatch queue capacity
    #[arg(long, value_name = "NUM")]
    capacity: Option<usize>,

    /// Count values across --workers threads in aggregate mode
    #[arg(long)]
    parallel: bool,

    /// Write records / counts here instead of stdout
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Generate NUM synthetic documents instead of reading input
    #[arg(long, value_name = "NUM", conflicts_with = "input")]
    synthetic: Option<usize>,

    /// Seed for --synthetic
    #[arg(long, default_value = "42")]
    seed: u64,

    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<bool> {
    // Load .env file into std::env
    dotenvy::dotenv().ok();

    let args = CliArgs::parse();
    let cfg = resolve_config(&args)?;
    let _guard = json_fanout::log::init(cfg.log_dir.as_deref(), args.verbose);

    let collection = match args.synthetic {
        Some(count) => {
            info!(count, seed = args.seed, "Generating synthetic documents");
            synthetic_collection(&mut StdRng::seed_from_u64(args.seed), count)
        }
        None => load_collection(&cfg)?,
    };

    let output: Box<dyn Write + Send> = match &cfg.output {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("Failed to create {}", path.display()))?,
        )),
        None => Box::new(BufWriter::new(io::stdout())),
    };

    match cfg.mode {
        Mode::Dispatch => run_dispatch(&cfg, &collection, output),
        Mode::Aggregate => run_aggregate(&cfg, &collection, output),
    }
}

fn resolve_config(args: &CliArgs) -> Result<PipelineConfig> {
    let mut cfg = PipelineConfig::load(args.config.as_deref()).context("Invalid configuration")?;

    if let Some(input) = &args.input {
        cfg.input = Some(input.clone());
    }
    if let Some(mode) = args.mode {
        cfg.mode = mode;
    }
    if let Some(workers) = args.workers {
        cfg.workers = workers;
    }
    if let Some(capacity) = args.capacity {
        cfg.queue_capacity = capacity;
    }
    if let Some(output) = &args.output {
        cfg.output = Some(output.clone());
    }
    if args.parallel {
        cfg.parallel_aggregate = true;
    }

    cfg.validate().context("Invalid configuration")?;
    Ok(cfg)
}

fn load_collection(cfg: &PipelineConfig) -> Result<Vec<Value>> {
    let Some(path) = &cfg.input else {
        bail!("No input given; pass --input, set `input` in the config, or use --synthetic");
    };

    let file = File::open(path).with_context(|| format!("Unable to open file: {}", path.display()))?;
    let root: Value = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("Failed to parse JSON from {}", path.display()))?;

    if !root.is_array() {
        info!("Input JSON is not an array; wrapping into an array of one element");
    }
    Ok(into_collection(root))
}

fn run_dispatch(cfg: &PipelineConfig, collection: &[Value], output: Box<dyn Write + Send>) -> Result<bool> {
    let pool = WorkerPool::new(cfg.workers)?.with_max_depth(cfg.max_depth);
    let outcome = pool.dispatch(collection, &cfg.queue_name, cfg.queue_capacity, WriterSink::new(output))?;
    let summary = &outcome.summary;

    for p in summary.failed_partitions() {
        warn!(
            partition = p.index,
            sent = p.records_sent,
            leaves_dropped = p.leaves_dropped(),
            unfinished = ?p.unfinished_elements(),
            "Partition did not complete"
        );
    }

    eprintln!(
        "🏁 Dispatched {} records ({} delivered, {} elements failed) in {:.2}s ({:.1} recs/sec)",
        summary.records_sent,
        outcome.drain.delivered,
        summary.elements_failed(),
        summary.elapsed.as_secs_f64(),
        summary.records_per_second()
    );

    Ok(outcome.is_success())
}

fn run_aggregate(cfg: &PipelineConfig, collection: &[Value], mut output: Box<dyn Write + Send>) -> Result<bool> {
    let start = Instant::now();
    let aggregator = Aggregator::new(Flattener::new(cfg.max_depth));
    let agg = match cfg.aggregate_workers() {
        Some(workers) => aggregator.aggregate_parallel(collection, workers)?,
        None => aggregator.aggregate(collection),
    };

    for (value, count) in agg.sorted() {
        writeln!(output, "{value}: {count}")?;
    }
    output.flush()?;

    for skipped in &agg.skipped {
        warn!(%skipped, "Element left out of aggregation");
    }

    let elapsed = start.elapsed();
    eprintln!(
        "🏁 Aggregated {} leaves into {} distinct values in {:.2}s",
        agg.total(),
        agg.len(),
        elapsed.as_secs_f64()
    );

    Ok(agg.skipped.is_empty())
}
