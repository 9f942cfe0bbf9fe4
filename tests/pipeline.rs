//! Whole-group pipeline runs.
//!
//! Each test launches a universe of in-process ranks, runs several task
//! iterations through the coordinator on every rank, and checks what each
//! rank observed. A rank that panics comes back as an error from
//! `Universe::run`; a protocol bug shows up as a hung test.

use anyhow::bail;
use ferropipe::{
    Cause, CollectiveOp, Error, FaultPlan, Mode, PipelineCoordinator, ProcessGroup, RunSummary,
    Stage, StridedSum, TaskBody, TaskContext, Topology, Universe,
};

const ITERATIONS: usize = 3;

struct RankOutcome {
    summary: RunSummary,
    written: Vec<(usize, i64)>,
    /// Stages the last iteration went through.
    trail: Vec<Stage>,
}

fn run_strided_sum(ranks: usize, mode: Mode, faults: FaultPlan) -> Vec<RankOutcome> {
    Universe::new(ranks)
        .unwrap()
        .run(|world| {
            let topology = Topology::new(world, mode).unwrap();
            let task = StridedSum::new(10).with_faults(faults);
            let mut coordinator = PipelineCoordinator::new(topology, task);
            let summary = coordinator.run(0..ITERATIONS);
            RankOutcome {
                summary,
                trail: coordinator.last_trail(),
                written: coordinator.into_body().written().to_vec(),
            }
        })
        .unwrap()
}

fn expected(indices: &[usize]) -> Vec<(usize, i64)> {
    let task = StridedSum::new(10);
    indices.iter().map(|&i| (i, task.expected_total(i).unwrap())).collect()
}

fn writer_of(mode: Mode) -> usize {
    match mode {
        Mode::Serial => 0,
        Mode::Parallel => 1,
    }
}

fn ranks_for(mode: Mode, workers: usize) -> usize {
    match mode {
        Mode::Serial => workers,
        Mode::Parallel => workers + 2,
    }
}

fn cause_at(outcome: &RankOutcome, index: usize) -> Option<Cause> {
    outcome
        .summary
        .failed
        .iter()
        .find(|(i, _)| *i == index)
        .and_then(|(_, err)| err.root_cause().cloned())
}

#[test]
fn happy_path_totals_for_every_worker_count() {
    for mode in [Mode::Serial, Mode::Parallel] {
        for workers in 1..=4 {
            let outcomes = run_strided_sum(ranks_for(mode, workers), mode, FaultPlan::none());
            for (rank, outcome) in outcomes.iter().enumerate() {
                assert!(outcome.summary.is_clean(), "{mode} w={workers} rank {rank}");
                assert_eq!(outcome.summary.completed, vec![0, 1, 2]);
                assert_eq!(outcome.trail.last(), Some(&Stage::Idle));
                assert!(!outcome.trail.contains(&Stage::Failed));
                if rank == writer_of(mode) {
                    assert!(outcome.trail.ends_with(&[Stage::Writing, Stage::Idle]));
                    assert_eq!(outcome.written, vec![(0, 45), (1, 145), (2, 245)]);
                } else {
                    assert!(outcome.written.is_empty(), "{mode} w={workers} rank {rank}");
                }
            }
        }
    }
}

#[test]
fn standalone_run_matches_group_runs() {
    let task = StridedSum::new(10);
    let topology: Topology<ferropipe::Communicator> = Topology::standalone();
    let mut coordinator = PipelineCoordinator::new(topology, task);
    let summary = coordinator.run(0..ITERATIONS);
    assert!(summary.is_clean());
    assert_eq!(coordinator.body().written(), expected(&[0, 1, 2]).as_slice());
}

#[test]
fn serial_and_parallel_write_the_same_totals() {
    for workers in 1..=4 {
        let serial = run_strided_sum(ranks_for(Mode::Serial, workers), Mode::Serial, FaultPlan::none());
        let parallel =
            run_strided_sum(ranks_for(Mode::Parallel, workers), Mode::Parallel, FaultPlan::none());
        assert_eq!(
            serial[writer_of(Mode::Serial)].written,
            parallel[writer_of(Mode::Parallel)].written,
            "w={workers}"
        );
    }
}

#[test]
fn load_failure_skips_only_that_iteration_everywhere() {
    let faults = FaultPlan::from_triggers(true, false, false);
    for mode in [Mode::Serial, Mode::Parallel] {
        for workers in 1..=3 {
            let outcomes = run_strided_sum(ranks_for(mode, workers), mode, faults);
            let root = Cause::new(0, "error during load_data");
            for (rank, outcome) in outcomes.iter().enumerate() {
                assert_eq!(outcome.summary.completed, vec![0, 2], "{mode} rank {rank}");
                assert_eq!(outcome.summary.failed_indices(), vec![1]);
                assert_eq!(cause_at(outcome, 1), Some(root.clone()), "{mode} rank {rank}");
            }
            assert_eq!(outcomes[writer_of(mode)].written, expected(&[0, 2]));
        }
    }
}

#[test]
fn parallel_load_failure_kinds_per_role() {
    let outcomes = run_strided_sum(5, Mode::Parallel, FaultPlan::from_triggers(true, false, false));
    let kind = |rank: usize| &outcomes[rank].summary.failed[0].1;
    assert!(matches!(kind(0), Error::Task(_)));
    assert!(matches!(kind(1), Error::Hop { from: 2, .. }));
    for rank in 2..5 {
        assert!(matches!(
            kind(rank),
            Error::Collective {
                op: CollectiveOp::Broadcast,
                ..
            }
        ));
    }
}

#[test]
fn process_failure_is_agreed_by_workers_and_writer() {
    let faults = FaultPlan::from_triggers(false, true, false);

    let ranks = 5;
    let outcomes = run_strided_sum(ranks, Mode::Parallel, faults);
    let root = Cause::new(ranks - 1, "error during process_data");
    // The Reader's part succeeded.
    assert!(outcomes[0].summary.is_clean());
    for (rank, outcome) in outcomes.iter().enumerate().skip(1) {
        assert_eq!(outcome.summary.completed, vec![0, 2], "rank {rank}");
        assert_eq!(cause_at(outcome, 1), Some(root.clone()), "rank {rank}");
    }
    assert!(matches!(
        outcomes[2].summary.failed[0].1,
        Error::Collective {
            op: CollectiveOp::Gather,
            ..
        }
    ));
    assert_eq!(outcomes[1].written, expected(&[0, 2]));

    let ranks = 4;
    let outcomes = run_strided_sum(ranks, Mode::Serial, faults);
    let root = Cause::new(ranks - 1, "error during process_data");
    for outcome in &outcomes {
        assert_eq!(outcome.summary.completed, vec![0, 2]);
        assert_eq!(cause_at(outcome, 1), Some(root.clone()));
        assert!(outcome.summary.failed[0].1.is_synchronized());
    }
    assert_eq!(outcomes[0].written, expected(&[0, 2]));
}

#[test]
fn write_failure_stays_on_the_writer() {
    let faults = FaultPlan::from_triggers(false, false, true);
    for mode in [Mode::Serial, Mode::Parallel] {
        let outcomes = run_strided_sum(ranks_for(mode, 3), mode, faults);
        let writer = writer_of(mode);
        for (rank, outcome) in outcomes.iter().enumerate() {
            if rank == writer {
                assert_eq!(outcome.summary.failed_indices(), vec![1]);
                assert!(matches!(outcome.summary.failed[0].1, Error::Task(_)));
                assert_eq!(outcome.written, expected(&[0, 2]));
            } else {
                assert!(outcome.summary.is_clean(), "{mode} rank {rank}");
            }
        }
    }
}

#[test]
fn every_trigger_together() {
    let faults = FaultPlan::from_triggers(true, true, true);
    let outcomes = run_strided_sum(4, Mode::Parallel, faults);
    // The load failure comes first and hides the others.
    for outcome in &outcomes {
        assert_eq!(outcome.summary.failed_indices(), vec![1]);
        assert_eq!(cause_at(outcome, 1), Some(Cause::new(0, "error during load_data")));
    }
    assert_eq!(outcomes[1].written, expected(&[0, 2]));
}

/// Fails the process step on the world ranks in `mask`, at iteration 1 only.
struct MaskedFailure {
    mask: u32,
    fail_load: bool,
    written: Vec<usize>,
}

impl TaskBody for MaskedFailure {
    type Item = u16;
    type Partial = u16;

    fn load(&mut self, ctx: TaskContext) -> anyhow::Result<Vec<u16>> {
        if self.fail_load && ctx.index == 1 {
            bail!("load failed");
        }
        Ok((0..8).collect())
    }

    fn process(&mut self, ctx: TaskContext, slice: &[u16]) -> anyhow::Result<u16> {
        if ctx.index == 1 && self.mask & (1 << ctx.rank) != 0 {
            bail!("process failed");
        }
        Ok(slice.iter().sum())
    }

    fn write(&mut self, ctx: TaskContext, partials: Vec<u16>) -> anyhow::Result<()> {
        assert_eq!(partials.iter().sum::<u16>(), 28);
        self.written.push(ctx.index);
        Ok(())
    }
}

fn run_masked(ranks: usize, mode: Mode, mask: u32, fail_load: bool) -> Vec<(RunSummary, Vec<usize>)> {
    Universe::new(ranks)
        .unwrap()
        .run(|world| {
            let topology = Topology::new(world, mode).unwrap();
            let body = MaskedFailure {
                mask,
                fail_load,
                written: Vec::new(),
            };
            let mut coordinator = PipelineCoordinator::new(topology, body);
            let summary = coordinator.run(0..ITERATIONS);
            (summary, coordinator.into_body().written)
        })
        .unwrap()
}

#[test]
fn any_subset_of_failing_workers_terminates_and_agrees() {
    for (mode, ranks) in [(Mode::Serial, 4usize), (Mode::Parallel, 5usize)] {
        let first_worker = if mode == Mode::Parallel { 2 } else { 0 };
        let worker_bits: u32 = (first_worker..ranks).map(|r| 1u32 << r).sum();
        for mask in 0..(1u32 << ranks) {
            let outcomes = run_masked(ranks, mode, mask, false);
            let effective = mask & worker_bits;
            let writer = writer_of(mode);

            let workers_cause: Vec<Option<Cause>> = outcomes[first_worker..]
                .iter()
                .map(|(summary, _)| {
                    summary
                        .failed
                        .first()
                        .and_then(|(_, err)| err.root_cause().cloned())
                })
                .collect();
            // Every worker saw the same thing.
            assert!(
                workers_cause.windows(2).all(|w| w[0] == w[1]),
                "{mode} mask {mask:05b}: {workers_cause:?}"
            );

            if effective == 0 {
                for (summary, _) in &outcomes {
                    assert!(summary.is_clean(), "{mode} mask {mask:05b}");
                }
                assert_eq!(outcomes[writer].1, vec![0, 1, 2]);
            } else {
                let origin = effective.trailing_zeros() as usize;
                assert_eq!(workers_cause[0], Some(Cause::new(origin, "process failed")));
                for (summary, _) in &outcomes[first_worker..] {
                    assert_eq!(summary.failed_indices(), vec![1]);
                }
                assert_eq!(outcomes[writer].0.failed_indices(), vec![1]);
                assert_eq!(outcomes[writer].1, vec![0, 2]);
            }
        }
    }
}

#[test]
fn load_failure_with_failing_workers_reports_the_load() {
    let outcomes = run_masked(5, Mode::Parallel, 0b11100, true);
    for (rank, (summary, _)) in outcomes.iter().enumerate() {
        assert_eq!(summary.failed_indices(), vec![1], "rank {rank}");
        let cause = summary.failed[0].1.root_cause().cloned();
        assert_eq!(cause, Some(Cause::new(0, "load failed")), "rank {rank}");
    }
    assert_eq!(outcomes[1].1, vec![0, 2]);
}

#[test]
fn hello_barrier_failure_is_agreed_then_recovers() {
    let outcomes = Universe::new(4)
        .unwrap()
        .run(|world| {
            let rank = world.rank();
            let topology = Topology::new(world, Mode::Parallel).unwrap();
            let mut coordinator = PipelineCoordinator::new(topology, StridedSum::new(10));
            let hello = coordinator.synchronize(|| {
                if rank == 3 {
                    Err(Error::Internal("cannot say hello".into()))
                } else {
                    Ok(())
                }
            });
            let summary = coordinator.run(0..1);
            (
                hello.map_err(|e| (e.is_synchronized(), e.root_cause().map(|c| c.origin))),
                summary.is_clean(),
            )
        })
        .unwrap();
    for (hello, clean) in outcomes {
        assert_eq!(hello, Err((true, Some(3))));
        assert!(clean);
    }
}

/// Panics in the process step on one world rank.
struct Crashes {
    rank: usize,
}

impl TaskBody for Crashes {
    type Item = u8;
    type Partial = u8;

    fn load(&mut self, _ctx: TaskContext) -> anyhow::Result<Vec<u8>> {
        Ok(vec![1, 2, 3])
    }

    fn process(&mut self, ctx: TaskContext, slice: &[u8]) -> anyhow::Result<u8> {
        if ctx.rank == self.rank {
            panic!("worker crashed");
        }
        Ok(slice.iter().sum())
    }

    fn write(&mut self, _ctx: TaskContext, _partials: Vec<u8>) -> anyhow::Result<()> {
        Ok(())
    }
}

#[test]
fn crashed_worker_is_reported_instead_of_hanging_the_group() {
    for mode in [Mode::Serial, Mode::Parallel] {
        let ranks = ranks_for(mode, 3);
        let crashed = ranks - 1;
        let result = Universe::new(ranks).unwrap().run(|world| {
            let topology = Topology::new(world, mode).unwrap();
            let mut coordinator = PipelineCoordinator::new(topology, Crashes { rank: crashed });
            coordinator.run(0..ITERATIONS).completed.len()
        });
        let expected = format!("rank {crashed} panicked");
        assert!(
            matches!(&result, Err(Error::Internal(msg)) if *msg == expected),
            "{mode}: {result:?}"
        );
    }
}
