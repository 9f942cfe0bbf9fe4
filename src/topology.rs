//! Pipeline roles and the Worker subgroup.

use crate::comm::ProcessGroup;
use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Rank that loads input data (every mode).
pub const READ_RANK: usize = 0;
/// Rank that writes results in parallel mode.
pub const WRITE_RANK: usize = 1;
/// World rank of the Worker subgroup's root in parallel mode.
pub const WORK_ROOT: usize = 2;

/// How roles are laid out over the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Rank 0 reads, writes and roots the Worker group; every rank works.
    #[default]
    Serial,
    /// Dedicated Reader (0) and Writer (1); ranks `2..` work. Needs 3 ranks.
    Parallel,
}

impl Mode {
    /// Smallest group this mode can run on.
    pub fn min_ranks(self) -> usize {
        match self {
            Mode::Serial => 1,
            Mode::Parallel => 3,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Serial => f.write_str("serial"),
            Mode::Parallel => f.write_str("parallel"),
        }
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "serial" | "sync" => Ok(Mode::Serial),
            "parallel" | "async" => Ok(Mode::Parallel),
            other => Err(Error::Config(format!(
                "unknown mode {other:?} (expected \"serial\" or \"parallel\")"
            ))),
        }
    }
}

/// A pipeline role. One rank may hold several.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Runs the load step.
    Reader,
    /// Runs the write step.
    Writer,
    /// Roots the Worker group's broadcast and gather.
    WorkerRoot,
    /// Member of the Worker group.
    Worker,
    /// The only rank of a run without a transport; holds every role.
    Standalone,
}

/// Role layout of one run, derived once and never changed.
///
/// The Worker group is built here, at construction, and lives as long as the
/// topology.
pub enum Topology<C: ProcessGroup> {
    /// No transport: every role on the calling process, steps run directly.
    /// The Worker group is this process alone.
    Standalone,
    /// Every rank works; rank 0 also reads, writes and roots the work.
    Serial {
        /// The whole group, which is also the Worker group.
        world: C,
    },
    /// Reader, Writer and Worker group on separate ranks.
    Parallel {
        /// The whole group.
        world: C,
        /// Worker group over ranks `2..size`; `None` on Reader and Writer.
        work: Option<C>,
    },
}

impl<C: ProcessGroup> Topology<C> {
    /// Derive the layout for `mode` over `world`.
    ///
    /// In parallel mode this creates the Worker subgroup, so every rank of
    /// `world` must call it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for parallel mode on fewer than 3 ranks.
    pub fn new(world: C, mode: Mode) -> Result<Self> {
        if world.size() < mode.min_ranks() {
            return Err(Error::Config(format!(
                "{mode} mode needs at least {} ranks, got {}",
                mode.min_ranks(),
                world.size()
            )));
        }
        match mode {
            Mode::Serial => Ok(Topology::Serial { world }),
            Mode::Parallel => {
                let work = world.create_subgroup(&[READ_RANK, WRITE_RANK])?;
                tracing::debug!(
                    rank = world.rank(),
                    worker = work.is_some(),
                    "built parallel topology"
                );
                Ok(Topology::Parallel { world, work })
            }
        }
    }

    /// Layout for a run without any transport.
    pub fn standalone() -> Self {
        Topology::Standalone
    }

    /// The mode this layout was built for; `None` when standalone.
    pub fn mode(&self) -> Option<Mode> {
        match self {
            Topology::Standalone => None,
            Topology::Serial { .. } => Some(Mode::Serial),
            Topology::Parallel { .. } => Some(Mode::Parallel),
        }
    }

    /// The whole group, if there is a transport.
    pub fn world(&self) -> Option<&C> {
        match self {
            Topology::Standalone => None,
            Topology::Serial { world } | Topology::Parallel { world, .. } => Some(world),
        }
    }

    /// Handle of the Worker group this rank belongs to, if any.
    ///
    /// A standalone run's Worker group is the calling process alone. It has
    /// no transport and so no handle: this returns `None` while
    /// [`is_worker`](Self::is_worker) still reports `true`.
    pub fn work_group(&self) -> Option<&C> {
        match self {
            Topology::Standalone => None,
            Topology::Serial { world } => Some(world),
            Topology::Parallel { work, .. } => work.as_ref(),
        }
    }

    /// Rank of the calling process in the whole group.
    pub fn rank(&self) -> usize {
        self.world().map_or(0, ProcessGroup::rank)
    }

    /// Size of the whole group.
    pub fn size(&self) -> usize {
        self.world().map_or(1, ProcessGroup::size)
    }

    /// World rank that loads input.
    pub fn reader(&self) -> usize {
        READ_RANK
    }

    /// World rank that writes results.
    pub fn writer(&self) -> usize {
        match self {
            Topology::Parallel { .. } => WRITE_RANK,
            _ => READ_RANK,
        }
    }

    /// World rank that roots the Worker group.
    pub fn worker_root(&self) -> usize {
        match self {
            Topology::Parallel { .. } => WORK_ROOT,
            _ => READ_RANK,
        }
    }

    /// Whether this rank runs the load step.
    pub fn is_reader(&self) -> bool {
        self.rank() == self.reader()
    }

    /// Whether this rank runs the write step.
    pub fn is_writer(&self) -> bool {
        self.rank() == self.writer()
    }

    /// Whether this rank belongs to the Worker group. Always true when standalone.
    pub fn is_worker(&self) -> bool {
        match self {
            Topology::Standalone => true,
            _ => self.work_group().is_some(),
        }
    }

    /// Whether this rank roots the Worker group.
    pub fn is_worker_root(&self) -> bool {
        self.rank() == self.worker_root()
    }

    /// Every role this rank holds.
    pub fn roles(&self) -> Vec<Role> {
        if let Topology::Standalone = self {
            return vec![Role::Standalone];
        }
        let mut roles = Vec::with_capacity(4);
        if self.is_reader() {
            roles.push(Role::Reader);
        }
        if self.is_writer() {
            roles.push(Role::Writer);
        }
        if self.is_worker_root() {
            roles.push(Role::WorkerRoot);
        }
        if self.is_worker() {
            roles.push(Role::Worker);
        }
        roles
    }

    /// The most specific role this rank holds.
    pub fn role(&self) -> Role {
        self.roles().first().copied().unwrap_or(Role::Worker)
    }
}
