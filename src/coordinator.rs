//! One read → process → write iteration per task index.
//!
//! ```text
//!  Reader ──hop──▶ WorkerRoot ══broadcast══▶ Workers ══gather══▶ WorkerRoot ──hop──▶ Writer
//! ```
//!
//! The Worker phase goes through [`SafeCollective`]; the two hops always
//! carry a [`Hop`] so the receiving rank learns about upstream failures
//! instead of waiting for data that will never come.

use crate::comm::ProcessGroup;
use crate::envelope::{Cause, Hop};
use crate::error::{Error, Result};
use crate::partition::StridePartition;
use crate::safe::SafeCollective;
use crate::topology::{READ_RANK, Topology, WORK_ROOT, WRITE_RANK};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::cell::{Cell, RefCell};
use tracing::{debug, debug_span, info, trace, warn};

/// Tag of the Reader → WorkerRoot hop.
pub const READ_TAG: i32 = 1;
/// Tag of the WorkerRoot → Writer hop.
pub const WRITE_TAG: i32 = 2;

/// Values handed to every task-body call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskContext {
    /// Task iteration index.
    pub index: usize,
    /// Rank of the calling process in the whole group.
    pub rank: usize,
    /// Size of the whole group.
    pub size: usize,
}

/// The user's load / process / write steps. Any of them may fail.
pub trait TaskBody {
    /// Element of the loaded sequence.
    type Item: Serialize + DeserializeOwned + Clone;
    /// Result computed by one worker from its partition.
    type Partial: Serialize + DeserializeOwned;

    /// Produce the input sequence. Runs on the Reader only.
    fn load(&mut self, ctx: TaskContext) -> anyhow::Result<Vec<Self::Item>>;

    /// Compute a partial result from this worker's partition. Runs on every worker.
    fn process(&mut self, ctx: TaskContext, slice: &[Self::Item]) -> anyhow::Result<Self::Partial>;

    /// Consume the partials, in worker-rank order. Runs on the Writer only.
    fn write(&mut self, ctx: TaskContext, partials: Vec<Self::Partial>) -> anyhow::Result<()>;
}

/// Where a rank is within the current iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Stage {
    /// Between iterations.
    #[default]
    Idle,
    /// Running the load step.
    Reading,
    /// Sending or waiting on a hop.
    Forwarding,
    /// Exchanging error envelopes.
    GroupChecking,
    /// Distributing the loaded data over the Worker group.
    Broadcasting,
    /// Running the process step.
    Computing,
    /// Collecting partials on the Worker root.
    Gathering,
    /// Running the write step.
    Writing,
    /// The iteration is being abandoned.
    Failed,
}

/// Outcome of [`PipelineCoordinator::run`].
#[derive(Debug, Default)]
pub struct RunSummary {
    /// Indices this rank completed.
    pub completed: Vec<usize>,
    /// Indices this rank abandoned, with the failure it observed.
    pub failed: Vec<(usize, Error)>,
}

impl RunSummary {
    /// Whether every iteration completed on this rank.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    /// Indices of the abandoned iterations.
    pub fn failed_indices(&self) -> Vec<usize> {
        self.failed.iter().map(|(index, _)| *index).collect()
    }
}

/// Runs pipeline iterations on one rank.
pub struct PipelineCoordinator<C: ProcessGroup, B: TaskBody> {
    topology: Topology<C>,
    body: B,
    stage: StageLog,
}

/// Current stage and every stage entered since the iteration began.
#[derive(Default)]
struct StageLog {
    current: Cell<Stage>,
    trail: RefCell<Vec<Stage>>,
}

fn enter(stage: &StageLog, next: Stage) {
    trace!(from = ?stage.current.get(), to = ?next, "stage");
    stage.current.set(next);
    stage.trail.borrow_mut().push(next);
}

fn task<T>(ctx: TaskContext, outcome: anyhow::Result<T>) -> Result<T> {
    outcome.map_err(|e| Error::Task(Cause::from_task(ctx.rank, &e)))
}

impl<C: ProcessGroup, B: TaskBody> PipelineCoordinator<C, B> {
    /// Coordinate `body` over `topology`.
    pub fn new(topology: Topology<C>, body: B) -> Self {
        PipelineCoordinator {
            topology,
            body,
            stage: StageLog::default(),
        }
    }

    /// The role layout.
    pub fn topology(&self) -> &Topology<C> {
        &self.topology
    }

    /// The task body.
    pub fn body(&self) -> &B {
        &self.body
    }

    /// The task body, mutably.
    pub fn body_mut(&mut self) -> &mut B {
        &mut self.body
    }

    /// Give back the task body.
    pub fn into_body(self) -> B {
        self.body
    }

    /// Current stage of this rank.
    ///
    /// Stages only change inside [`run_iteration`](Self::run_iteration), so
    /// between calls this is always [`Stage::Idle`]. See
    /// [`last_trail`](Self::last_trail) for the path an iteration took.
    pub fn stage(&self) -> Stage {
        self.stage.current.get()
    }

    /// Stages entered by the most recent iteration, in order, ending in
    /// [`Stage::Idle`]. Empty before the first iteration.
    pub fn last_trail(&self) -> Vec<Stage> {
        self.stage.trail.borrow().clone()
    }

    /// Run `step` on every rank, then wait for the whole group.
    ///
    /// A failing step on any rank fails the call on every rank.
    pub fn synchronize<F>(&self, step: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        match self.topology.world() {
            Some(world) => SafeCollective::new(world).barrier(step),
            None => step(),
        }
    }

    /// Run iterations `indices`, logging and skipping failed ones.
    pub fn run<I>(&mut self, indices: I) -> RunSummary
    where
        I: IntoIterator<Item = usize>,
    {
        let mut summary = RunSummary::default();
        for index in indices {
            match self.run_iteration(index) {
                Ok(()) => {
                    info!(rank = self.topology.rank(), index, "iteration complete");
                    summary.completed.push(index);
                }
                Err(err) => {
                    warn!(rank = self.topology.rank(), index, error = %err, "skipping iteration");
                    summary.failed.push((index, err));
                }
            }
        }
        summary
    }

    /// Run the pipeline for task `index` on this rank.
    ///
    /// Returns normally when this rank's part succeeded. A failure anywhere
    /// upstream of, or inside, this rank's part is returned as an error after
    /// the rank has completed every message exchange the iteration requires
    /// of it, so the next iteration starts in step with the group.
    pub fn run_iteration(&mut self, index: usize) -> Result<()> {
        let Self {
            topology,
            body,
            stage,
        } = self;
        let ctx = TaskContext {
            index,
            rank: topology.rank(),
            size: topology.size(),
        };
        let span = debug_span!("iteration", index);
        let _entered = span.enter();
        stage.trail.borrow_mut().clear();

        let outcome = match topology {
            Topology::Standalone => run_standalone(body, stage, ctx),
            Topology::Serial { world } => run_serial(world, body, stage, ctx),
            Topology::Parallel { world, work } => {
                run_parallel(world, work.as_ref(), body, stage, ctx)
            }
        };

        if let Err(err) = &outcome {
            enter(stage, Stage::Failed);
            debug!(rank = ctx.rank, index, error = %err, "iteration failed");
        }
        enter(stage, Stage::Idle);
        outcome
    }
}

fn run_standalone<B: TaskBody>(body: &mut B, stage: &StageLog, ctx: TaskContext) -> Result<()> {
    enter(stage, Stage::Reading);
    let data = task(ctx, body.load(ctx))?;
    enter(stage, Stage::Computing);
    let partial = task(ctx, body.process(ctx, &data))?;
    enter(stage, Stage::Writing);
    task(ctx, body.write(ctx, vec![partial]))
}

fn run_serial<C: ProcessGroup, B: TaskBody>(
    world: &C,
    body: &mut B,
    stage: &StageLog,
    ctx: TaskContext,
) -> Result<()> {
    let safe = SafeCollective::new(world);
    let partials = work_phase(&safe, body, stage, ctx, |body: &mut B| {
        enter(stage, Stage::Reading);
        task(ctx, body.load(ctx))
    })?;

    match partials {
        Some(partials) => {
            enter(stage, Stage::Writing);
            task(ctx, body.write(ctx, partials))
        }
        None => Ok(()),
    }
}

fn run_parallel<C: ProcessGroup, B: TaskBody>(
    world: &C,
    work: Option<&C>,
    body: &mut B,
    stage: &StageLog,
    ctx: TaskContext,
) -> Result<()> {
    match (world.rank(), work) {
        (READ_RANK, _) => {
            enter(stage, Stage::Reading);
            let loaded = task(ctx, body.load(ctx));
            enter(stage, Stage::Forwarding);
            forward(world, ctx, loaded, WORK_ROOT, READ_TAG)
        }
        (WRITE_RANK, _) => {
            enter(stage, Stage::Forwarding);
            let partials = world
                .recv::<Hop<Vec<B::Partial>>>(WORK_ROOT, WRITE_TAG)?
                .into_result(WORK_ROOT)?;
            enter(stage, Stage::Writing);
            task(ctx, body.write(ctx, partials))
        }
        (_, Some(work)) => {
            let safe = SafeCollective::new(work);
            let outcome = work_phase(&safe, body, stage, ctx, |_: &mut B| {
                enter(stage, Stage::Forwarding);
                world
                    .recv::<Hop<Vec<B::Item>>>(READ_RANK, READ_TAG)?
                    .into_result(READ_RANK)
            });

            if work.rank() == 0 {
                let outcome = outcome.and_then(|partials| {
                    partials.ok_or_else(|| Error::Internal("worker root gathered nothing".into()))
                });
                enter(stage, Stage::Forwarding);
                forward(world, ctx, outcome, WRITE_RANK, WRITE_TAG)
            } else {
                outcome.map(|_| ())
            }
        }
        (rank, None) => Err(Error::Internal(format!(
            "rank {rank} holds no pipeline role"
        ))),
    }
}

/// Broadcast, partition, process and gather over the Worker group.
///
/// `source` runs on the group root only and produces the sequence to
/// distribute.
fn work_phase<C, B, F>(
    safe: &SafeCollective<'_, C>,
    body: &mut B,
    stage: &StageLog,
    ctx: TaskContext,
    source: F,
) -> Result<Option<Vec<B::Partial>>>
where
    C: ProcessGroup,
    B: TaskBody,
    F: FnOnce(&mut B) -> Result<Vec<B::Item>>,
{
    let group = safe.group();
    if group.rank() != 0 {
        enter(stage, Stage::GroupChecking);
    }
    let data: Vec<B::Item> = safe.broadcast(0, || {
        let data = source(&mut *body);
        enter(stage, Stage::GroupChecking);
        data
    })?;
    enter(stage, Stage::Broadcasting);

    let slice = StridePartition::new(group.rank(), group.size()).apply(&data);
    trace!(rank = ctx.rank, len = slice.len(), "partition");

    let partials = safe.gather(0, || {
        enter(stage, Stage::Computing);
        let partial = task(ctx, body.process(ctx, &slice));
        enter(stage, Stage::GroupChecking);
        partial
    })?;
    enter(stage, Stage::Gathering);
    Ok(partials)
}

/// Send the outcome of a step downstream as a [`Hop`], then return it.
fn forward<T: Serialize>(
    world: &impl ProcessGroup,
    ctx: TaskContext,
    outcome: Result<T>,
    dest: usize,
    tag: i32,
) -> Result<()> {
    let (hop, result) = match outcome {
        Ok(value) => (Hop::Data(value), Ok(())),
        Err(err) => (Hop::Failed(Cause::capture(ctx.rank, &err)), Err(err)),
    };
    trace!(rank = ctx.rank, dest, tag, failed = hop.is_failed(), "forwarding hop");
    world.send(&hop, dest, tag)?;
    result
}
