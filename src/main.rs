// Offline simulation runner: replays an image as a stream of scan lines through
// the full decision core and a simulated fieldbus, in real time.
//
// Usage: spectral_sorter <config.toml> <lines.png> [lines]

use spectral_sorter::config::{SorterConfig, load_config};
use spectral_sorter::core_modules::actuation::ActuationScheduler;
use spectral_sorter::core_modules::hardware::SimulatedMaster;
use spectral_sorter::core_modules::line_source::ImageLineSource;
use spectral_sorter::core_modules::utils::image_helper;
use spectral_sorter::error::RunError;
use spectral_sorter::live_pipeline::{LiveOptions, LivePipeline};
use spectral_sorter::pipeline::SortingPipeline;
use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tokio::runtime::Builder;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Outputs per simulated digital-output module.
const OUTPUTS_PER_MODULE: usize = 16;
/// Label lines kept for the PNG dump.
const LABEL_HISTORY: usize = 1024;

struct Args {
    config: PathBuf,
    lines: PathBuf,
    max_lines: Option<u64>,
}

fn parse_args() -> Option<Args> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        return None;
    }
    let max_lines = match args.get(3) {
        Some(value) => Some(value.parse().ok()?),
        None => None,
    };
    Some(Args {
        config: PathBuf::from(&args[1]),
        lines: PathBuf::from(&args[2]),
        max_lines,
    })
}

/// Splits the valve bar into modules the way a typical rack is populated.
fn simulated_modules(channel_count: u16) -> Vec<usize> {
    let total = usize::from(channel_count);
    let mut modules = vec![OUTPUTS_PER_MODULE; total / OUTPUTS_PER_MODULE];
    if total % OUTPUTS_PER_MODULE != 0 {
        modules.push(total % OUTPUTS_PER_MODULE);
    }
    modules
}

/// Long enough for the latest possible fire to finish after the last line.
fn drain_time(config: &SorterConfig) -> Duration {
    let correction = config
        .ejection
        .y_corrections
        .iter()
        .map(|rule| rule.correction_ms)
        .fold(0.0, f64::max);
    let ms = config.ejection.base_delay_ms + correction + config.ejection.duration_ms + 50.0;
    Duration::from_secs_f64(ms / 1000.0)
}

async fn run(args: Args) -> Result<(), RunError> {
    let config = load_config(&args.config)?;
    let pipeline = SortingPipeline::from_config(&config)?.with_label_history(LABEL_HISTORY);
    let source = ImageLineSource::open(&args.lines)?;
    let max_lines = args.max_lines.unwrap_or(source.line_count() as u64);

    let (master, _) = SimulatedMaster::new(&simulated_modules(config.ejection.channel_count));
    let scheduler = ActuationScheduler::new(master, config.actuation.clone())?;
    if scheduler.channel_count() != config.ejection.channel_count {
        warn!(
            planner = config.ejection.channel_count,
            hardware = scheduler.channel_count(),
            "planner and hardware disagree on the number of channels"
        );
    }
    scheduler.set_master_on()?;

    let options = LiveOptions {
        max_lines: Some(max_lines),
        line_rate_hz: Some(config.ejection.fps),
        rewind: true,
        drain: drain_time(&config),
    };
    let live = LivePipeline::start(pipeline, Box::new(source), scheduler, options)?;
    let outcome = live.finish().await?;

    let summary = outcome.summary;
    info!(
        lines = summary.lines,
        objects = summary.blobs_closed,
        planned = summary.commands_planned,
        dispatched = summary.commands_dispatched,
        dropped = summary.commands_dropped,
        rejected = summary.commands_rejected,
        "simulation complete"
    );

    let dump = label_dump_path(&args.lines);
    match image_helper::save_labels(&dump, outcome.pipeline.label_history()) {
        Ok(()) => info!(path = %dump.display(), "label window written"),
        Err(error) => warn!(path = %dump.display(), %error, "could not write label window"),
    }
    Ok(())
}

fn label_dump_path(lines: &Path) -> PathBuf {
    lines.with_extension("labels.png")
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();

    let Some(args) = parse_args() else {
        eprintln!("Usage: spectral_sorter <config.toml> <lines.png> [lines]");
        return ExitCode::FAILURE;
    };

    let runtime = match Builder::new_multi_thread()
        .worker_threads(num_cpus::get().max(2))
        .thread_name("spectral-sorter")
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(error) => {
            error!(%error, "could not start async runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(args)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(%error, "simulation failed");
            ExitCode::FAILURE
        }
    }
}
