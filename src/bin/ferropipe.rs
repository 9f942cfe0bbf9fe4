//! ferropipe driver: run the striding-sum pipeline on a group of in-process ranks.
//!
//! ```bash
//! # Every rank works, rank 0 also reads and writes
//! RUST_LOG=info cargo run -- --ranks 4
//!
//! # Dedicated reader (0) and writer (1), workers on 2..5, failing process step at iteration 1
//! RUST_LOG=info cargo run -- --ranks 5 --async-io --trigger-two
//! ```

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ferropipe::{
    Communicator, FaultPlan, Mode, PipelineConfig, PipelineCoordinator, StridedSum, Topology,
    Universe,
};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "ferropipe",
    version = env!("CARGO_PKG_VERSION"),
    about = "Read → process → write pipeline with failure-synchronized collectives"
)]
struct Cli {
    /// Number of ranks to launch [env: FERROPIPE_RANKS, default: 1]
    #[arg(long)]
    ranks: Option<usize>,

    /// Role layout: serial or parallel [env: FERROPIPE_MODE, default: serial]
    #[arg(long)]
    mode: Option<Mode>,

    /// Dedicated reader and writer ranks; same as `--mode parallel`.
    #[arg(long)]
    async_io: bool,

    /// Task iterations to run [env: FERROPIPE_ITERATIONS, default: 3]
    #[arg(long)]
    iterations: Option<usize>,

    /// Numbers loaded per iteration [env: FERROPIPE_CHUNK, default: 10]
    #[arg(long)]
    chunk: Option<usize>,

    /// Fail the load step at iteration 1.
    #[arg(long)]
    trigger_one: bool,

    /// Fail the process step on the last rank at iteration 1.
    #[arg(long)]
    trigger_two: bool,

    /// Fail the write step at iteration 1.
    #[arg(long)]
    trigger_three: bool,
}

impl Cli {
    /// Layer the flags over the environment-derived configuration.
    fn into_config(self) -> ferropipe::Result<PipelineConfig> {
        let mut config = PipelineConfig::from_env()?;
        if let Some(ranks) = self.ranks {
            config.ranks = ranks;
        }
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if self.async_io {
            config.mode = Mode::Parallel;
        }
        if let Some(iterations) = self.iterations {
            config.iterations = iterations;
        }
        if let Some(chunk) = self.chunk {
            config.chunk = chunk;
        }
        config.faults =
            FaultPlan::from_triggers(self.trigger_one, self.trigger_two, self.trigger_three);
        config.validate()?;
        Ok(config)
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    // Default log level: INFO. Override with RUST_LOG=ferropipe=debug etc.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_thread_names(true)
        .init();

    let config = Cli::parse().into_config()?;
    info!(
        ranks = config.ranks,
        mode = %config.mode,
        iterations = config.iterations,
        workers = config.workers(),
        "starting pipeline"
    );

    let written = if config.is_standalone() {
        run_rank(Topology::<Communicator>::standalone(), &config)?
    } else {
        let per_rank = Universe::new(config.ranks)?.run(|world| {
            let topology = Topology::new(world, config.mode)?;
            run_rank(topology, &config)
        })?;
        let mut written = Vec::new();
        for (rank, outcome) in per_rank.into_iter().enumerate() {
            match outcome {
                Ok(totals) => written.extend(totals),
                Err(err) => warn!(rank, error = %err, "rank stopped early"),
            }
        }
        written
    };

    for (index, total) in &written {
        println!("({index}) total = {total}");
    }
    Ok(())
}

// ── Per-rank driver ───────────────────────────────────────────────────────────

/// Hello barrier, the iteration loop, a closing barrier. Returns what this rank wrote.
fn run_rank(
    topology: Topology<Communicator>,
    config: &PipelineConfig,
) -> ferropipe::Result<Vec<(usize, i64)>> {
    let rank = topology.rank();
    let roles = topology.roles();
    let task = StridedSum::new(config.chunk).with_faults(config.faults);
    let mut coordinator = PipelineCoordinator::new(topology, task);

    coordinator.synchronize(|| {
        info!(rank, ?roles, "Hello!");
        Ok(())
    })?;

    let summary = coordinator.run(0..config.iterations);
    if !summary.is_clean() {
        info!(rank, skipped = ?summary.failed_indices(), "finished with skipped iterations");
    }

    coordinator.synchronize(|| Ok(()))?;
    Ok(coordinator.into_body().written().to_vec())
}
