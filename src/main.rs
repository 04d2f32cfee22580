use std::io::{self, Write};
use std::process::ExitCode;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use affine_bench::backend::BackendKind;
use affine_bench::bench::{self, BenchConfig, BenchRun, DEFAULT_POINTS};
use affine_bench::input::{ScalarReader, SCALE_NAMES, TRANSLATE_NAMES};
use affine_bench::matrix::TransformParams;

/// Applies a 4x4 scale + translate transform to a random point cloud on
/// each backend and compares the timings
#[derive(Parser, Debug)]
#[command(name = "affine-bench")]
#[command(version)]
struct Cli {
    /// Number of points in the cloud
    #[arg(short = 'n', long, env = "AFFINE_BENCH_POINTS", default_value_t = DEFAULT_POINTS)]
    points: usize,

    /// Seed for the point generator
    ///
    /// Defaults to the wall clock; the value used is logged.
    #[arg(short, long, env = "AFFINE_BENCH_SEED")]
    seed: Option<u64>,

    /// Worker threads for the parallel backend (runtime default if unset)
    #[arg(short, long, env = "AFFINE_BENCH_WORKERS", value_parser = parse_workers)]
    workers: Option<usize>,

    /// Backends to run, in order
    #[arg(
        short,
        long = "backend",
        env = "AFFINE_BENCH_BACKENDS",
        value_enum,
        value_delimiter = ',',
        default_values_t = BackendKind::ALL
    )]
    backends: Vec<BackendKind>,

    /// Transformed points to print per backend
    #[arg(long, env = "AFFINE_BENCH_PREVIEW", default_value_t = 5)]
    preview: usize,

    /// Translation (tx, ty, tz); prompted for on stdin if absent
    #[arg(
        long,
        env = "AFFINE_BENCH_TRANSLATE",
        num_args = 3,
        value_names = ["TX", "TY", "TZ"],
        value_delimiter = ',',
        allow_negative_numbers = true
    )]
    translate: Option<Vec<f32>>,

    /// Scale (sx, sy, sz); prompted for on stdin if absent
    #[arg(
        long,
        env = "AFFINE_BENCH_SCALE",
        num_args = 3,
        value_names = ["SX", "SY", "SZ"],
        value_delimiter = ',',
        allow_negative_numbers = true
    )]
    scale: Option<Vec<f32>>,
}

fn parse_workers(s: &str) -> Result<usize, String> {
    match s.parse::<usize>() {
        Ok(0) => Err("must be at least 1".into()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}

fn triple(values: &[f32], flag: &str) -> Result<[f32; 3]> {
    <[f32; 3]>::try_from(values)
        .with_context(|| format!("--{flag} takes exactly 3 values, got {}", values.len()))
}

/// Takes each triple from the command line, or prompts for it on stdin.
fn read_params(cli: &Cli) -> Result<TransformParams> {
    let stdin = io::stdin();
    let mut reader = ScalarReader::new(stdin.lock());
    let mut prompt = |text: &str, names: [&str; 3]| -> Result<[f32; 3]> {
        print!("{text}");
        io::stdout().flush()?;
        Ok(reader.read_triple(names)?)
    };

    let translate = match &cli.translate {
        Some(v) => triple(v, "translate")?,
        None => prompt("Enter tx, ty, tz (translation): ", TRANSLATE_NAMES)?,
    };
    let scale = match &cli.scale {
        Some(v) => triple(v, "scale")?,
        None => prompt("Enter sx, sy, sz (scale): ", SCALE_NAMES)?,
    };
    Ok(TransformParams { translate, scale })
}

fn wall_clock_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64)
}

fn print_run(run: &BenchRun, preview: usize) {
    for outcome in &run.outcomes {
        let kind = outcome.report.backend;
        println!("\nResults (first {preview} points, {kind}):");
        for (i, p) in outcome.cloud.preview(preview).iter().enumerate() {
            println!("P{i}' = ({:.2}, {:.2}, {:.2})", p.x, p.y, p.z);
        }
    }

    println!();
    for outcome in &run.outcomes {
        let report = &outcome.report;
        let kernel = report
            .kernel_ms()
            .map_or_else(|| "n/a".to_string(), |ms| format!("{ms:.3} ms"));
        println!(
            "{:<10} total {:.3} ms, kernel {kernel}",
            report.backend.to_string(),
            report.elapsed_ms()
        );
    }

    if let Some(s) = run.speedup(BackendKind::Parallel) {
        println!("Speedup (seq/parallel) = {s:.2} x");
    }
    if let Some(s) = run.speedup(BackendKind::Device) {
        println!("Speedup (seq/device) = {s:.2} x");
    }

    if let Some((backend, index)) = run.first_mismatch() {
        eprintln!("warning: {backend} results differ from the first backend at point {index}");
    }
}

fn run(cli: Cli) -> Result<()> {
    let seed = cli.seed.unwrap_or_else(|| {
        let seed = wall_clock_seed();
        info!(seed, "no seed given, using the wall clock");
        seed
    });

    let params = read_params(&cli)?;
    let config = BenchConfig {
        points: cli.points,
        seed,
        workers: cli.workers,
        backends: cli.backends,
        preview: cli.preview,
    };
    info!(?config, ?params, "starting run");

    let run = bench::run(&config, &params)?;
    print_run(&run, config.preview);
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
