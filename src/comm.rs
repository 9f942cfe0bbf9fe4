//! Process groups and the in-process communicator.

use crate::error::{Error, Result};
use crate::mailbox::{Mailbox, WORLD_CONTEXT};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::rc::Rc;

// Reserved tags. User tags are non-negative.
const TAG_BCAST: i32 = -1;
const TAG_GATHER: i32 = -2;
const TAG_ALLGATHER_UP: i32 = -3;
const TAG_ALLGATHER_DOWN: i32 = -4;
const TAG_BARRIER_UP: i32 = -5;
const TAG_BARRIER_DOWN: i32 = -6;
const TAG_SUBGROUP: i32 = -7;

/// The message-passing operations the coordination layer relies on.
///
/// Every call is blocking. Collectives must be entered by every rank of the
/// group in the same order; point-to-point messages are matched by
/// `(source, tag)` and are never reordered within one `(source, dest, tag)`.
pub trait ProcessGroup: Sized {
    /// Rank of the calling process in this group.
    fn rank(&self) -> usize;

    /// Number of processes in this group.
    fn size(&self) -> usize;

    /// Send `value` to `dest` with a non-negative `tag`.
    fn send<T: Serialize>(&self, value: &T, dest: usize, tag: i32) -> Result<()>;

    /// Receive the next value sent by `source` with `tag`.
    fn recv<T: DeserializeOwned>(&self, source: usize, tag: i32) -> Result<T>;

    /// Broadcast `value` from `root` to all ranks.
    ///
    /// `value` is the input on root and is overwritten everywhere else.
    fn broadcast<T: Serialize + DeserializeOwned>(&self, value: &mut T, root: usize) -> Result<()>;

    /// Gather one value per rank to `root`, in rank order.
    ///
    /// Returns `Some` on root and `None` on every other rank.
    fn gather<T: Serialize + DeserializeOwned>(
        &self,
        value: &T,
        root: usize,
    ) -> Result<Option<Vec<T>>>;

    /// Gather one value per rank to every rank, in rank order.
    fn all_gather<T: Serialize + DeserializeOwned>(&self, value: &T) -> Result<Vec<T>>;

    /// Block until every rank has entered the barrier.
    fn barrier(&self) -> Result<()>;

    /// Derive a group of every member except the ranks in `exclude`.
    ///
    /// Only the remaining members communicate. Excluded ranks get `None`.
    /// Members keep their relative order.
    fn create_subgroup(&self, exclude: &[usize]) -> Result<Option<Self>>;
}

/// An in-process communicator.
///
/// Each rank of a [`Universe`](crate::Universe) runs on its own thread and
/// owns one world communicator. Values crossing ranks are encoded with
/// `bincode`, so only serialized bytes ever leave a rank.
///
/// # Example
///
/// ```
/// use ferropipe::{ProcessGroup, Universe};
///
/// let universe = Universe::new(3).unwrap();
/// let sums = universe
///     .run(|world| {
///         let all = world.all_gather(&world.rank()).unwrap();
///         all.iter().sum::<usize>()
///     })
///     .unwrap();
/// assert_eq!(sums, vec![3, 3, 3]);
/// ```
#[derive(Clone)]
pub struct Communicator {
    mailbox: Rc<Mailbox>,
    context: u64,
    /// World rank of each member, indexed by local rank.
    members: Rc<[usize]>,
    rank: usize,
    /// Marker to prevent Send/Sync (a communicator belongs to its rank's thread)
    _marker: PhantomData<*mut ()>,
}

impl Communicator {
    /// The world communicator of the rank owning `mailbox`.
    pub(crate) fn world(mailbox: Mailbox) -> Self {
        let members: Rc<[usize]> = (0..mailbox.universe_size()).collect();
        let rank = mailbox.rank();
        Communicator {
            mailbox: Rc::new(mailbox),
            context: WORLD_CONTEXT,
            members,
            rank,
            _marker: PhantomData,
        }
    }

    /// Rank of the calling process in the world communicator.
    pub fn world_rank(&self) -> usize {
        self.mailbox.rank()
    }

    /// Context id separating this communicator's traffic from every other's.
    pub fn context(&self) -> u64 {
        self.context
    }

    fn world_rank_of(&self, rank: usize) -> Result<usize> {
        self.members
            .get(rank)
            .copied()
            .ok_or(Error::InvalidRank {
                rank,
                size: self.members.len(),
            })
    }

    fn post<T: Serialize>(&self, value: &T, dest: usize, tag: i32) -> Result<()> {
        let dest = self.world_rank_of(dest)?;
        let payload = bincode::serde::encode_to_vec(value, bincode::config::standard())?;
        self.mailbox.post(dest, self.context, tag, payload)
    }

    fn take<T: DeserializeOwned>(&self, source: usize, tag: i32) -> Result<T> {
        let source = self.world_rank_of(source)?;
        let payload = self.mailbox.take(self.context, source, tag)?;
        let (value, _) = bincode::serde::decode_from_slice(&payload, bincode::config::standard())?;
        Ok(value)
    }

    fn gather_on<T: Serialize + DeserializeOwned>(
        &self,
        value: &T,
        root: usize,
        tag: i32,
    ) -> Result<Option<Vec<T>>> {
        Error::check_rank(root, self.size())?;
        if self.rank != root {
            self.post(value, root, tag)?;
            return Ok(None);
        }

        // Round-trip the root's own value so every entry went through the codec.
        let own: Vec<u8> = bincode::serde::encode_to_vec(value, bincode::config::standard())?;
        let mut out = Vec::with_capacity(self.size());
        for source in 0..self.size() {
            if source == root {
                let (mine, _) =
                    bincode::serde::decode_from_slice(&own, bincode::config::standard())?;
                out.push(mine);
            } else {
                out.push(self.take(source, tag)?);
            }
        }
        Ok(Some(out))
    }

    fn broadcast_on<T: Serialize + DeserializeOwned>(
        &self,
        value: &mut T,
        root: usize,
        tag: i32,
    ) -> Result<()> {
        Error::check_rank(root, self.size())?;
        if self.rank == root {
            for dest in (0..self.size()).filter(|&r| r != root) {
                self.post(value, dest, tag)?;
            }
        } else {
            *value = self.take(root, tag)?;
        }
        Ok(())
    }
}

impl ProcessGroup for Communicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.members.len()
    }

    fn send<T: Serialize>(&self, value: &T, dest: usize, tag: i32) -> Result<()> {
        if tag < 0 {
            return Err(Error::InvalidTag(tag));
        }
        self.post(value, dest, tag)
    }

    fn recv<T: DeserializeOwned>(&self, source: usize, tag: i32) -> Result<T> {
        if tag < 0 {
            return Err(Error::InvalidTag(tag));
        }
        self.take(source, tag)
    }

    fn broadcast<T: Serialize + DeserializeOwned>(&self, value: &mut T, root: usize) -> Result<()> {
        self.broadcast_on(value, root, TAG_BCAST)
    }

    fn gather<T: Serialize + DeserializeOwned>(
        &self,
        value: &T,
        root: usize,
    ) -> Result<Option<Vec<T>>> {
        self.gather_on(value, root, TAG_GATHER)
    }

    fn all_gather<T: Serialize + DeserializeOwned>(&self, value: &T) -> Result<Vec<T>> {
        let mut all = self.gather_on(value, 0, TAG_ALLGATHER_UP)?.unwrap_or_default();
        self.broadcast_on(&mut all, 0, TAG_ALLGATHER_DOWN)?;
        Ok(all)
    }

    fn barrier(&self) -> Result<()> {
        let mut arrived = self.gather_on(&(), 0, TAG_BARRIER_UP)?.is_some();
        self.broadcast_on(&mut arrived, 0, TAG_BARRIER_DOWN)
    }

    fn create_subgroup(&self, exclude: &[usize]) -> Result<Option<Self>> {
        for &rank in exclude {
            Error::check_rank(rank, self.size())?;
        }
        if exclude.contains(&self.rank) {
            return Ok(None);
        }

        let kept: Vec<usize> = (0..self.size()).filter(|r| !exclude.contains(r)).collect();
        let leader = kept[0];
        let context = if self.rank == leader {
            let context = self.mailbox.allocate_context();
            for &member in &kept[1..] {
                self.post(&context, member, TAG_SUBGROUP)?;
            }
            context
        } else {
            self.take(leader, TAG_SUBGROUP)?
        };

        let rank = kept
            .iter()
            .position(|&r| r == self.rank)
            .ok_or_else(|| Error::Internal("calling rank missing from its own subgroup".into()))?;
        let members = kept
            .iter()
            .map(|&r| self.world_rank_of(r))
            .collect::<Result<Rc<[usize]>>>()?;

        tracing::debug!(context, rank, size = members.len(), "created subgroup");
        Ok(Some(Communicator {
            mailbox: Rc::clone(&self.mailbox),
            context,
            members,
            rank,
            _marker: PhantomData,
        }))
    }
}

// Communicators are not Send or Sync: one rank, one thread.
