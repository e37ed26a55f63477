use crate::{Result, RuntimeError};

/// Identity of one participant, fixed for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Context {
    rank: usize,
    size: usize,
}

impl Context {
    /// Create the context of `rank` in a group of `size` participants.
    ///
    /// # Panics
    ///
    /// If `rank` is not below `size`.
    pub fn new(rank: usize, size: usize) -> Self {
        assert!(rank < size, "rank {rank} out of range for {size} participants");
        Self { rank, size }
    }

    /// The rank (0 to `size() - 1`) of this participant.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// The total number of participants.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether this participant does the reporting and timing.
    pub fn is_coordinator(&self) -> bool {
        self.rank == 0
    }
}

/// The collective operations a participant group offers.
///
/// Every method except [`Communicator::context`] and [`Communicator::abort`] is collective:
/// all participants must call it, in the same order, or the group blocks.
pub trait Communicator {
    /// This participant's identity.
    fn context(&self) -> Context;

    /// Block until every participant has entered the barrier.
    fn barrier(&self) -> Result<()>;

    /// Contribute `local` and return the wrapping sum of every participant's contribution.
    ///
    /// All participants receive the same value.
    fn all_reduce_sum(&self, local: u64) -> Result<u64>;

    /// Abort the whole group with `code`.
    ///
    /// Every participant blocked in, or later entering, a collective fails with
    /// [`RuntimeError::Aborted`]. The first code wins. Returns the error for the caller to
    /// propagate.
    fn abort(&self, code: i32) -> RuntimeError;
}
