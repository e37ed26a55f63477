use std::collections::TryReserveError;
use std::fmt;

use clap::ValueEnum;
use log::debug;
use thiserror::Error;

use crate::comm::Context;

/// The local buffer could not be allocated.
#[derive(Error, Debug)]
#[error("Rank {rank}: Memory allocation failed for {len} slots")]
pub struct AllocError {
    pub rank: usize,
    pub len: usize,
    #[source]
    pub source: TryReserveError,
}

/// How a rank writes its value pattern into its buffer.
///
/// Slot values are `rank * buffer.len() + i` for `i` in `0..buffer.len()`; implementations
/// differ in which slot each value lands in.
pub trait FillStrategy {
    fn name(&self) -> &'static str;

    fn fill(&self, buffer: &mut [u64], rank: usize);
}

/// Slot `i` holds `rank * len + i`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sequential;

impl FillStrategy for Sequential {
    fn name(&self) -> &'static str {
        "sequential"
    }

    fn fill(&self, buffer: &mut [u64], rank: usize) {
        let base = rank as u64 * buffer.len() as u64;
        for (i, slot) in buffer.iter_mut().enumerate() {
            *slot = base + i as u64;
        }
    }
}

/// Value `rank * len + i` goes to slot `i * (rank + 1)`.
///
/// Identical to [`Sequential`] on rank 0. On any other rank the index outruns the buffer once
/// `i * (rank + 1) >= len`, and the write panics.
#[derive(Debug, Clone, Copy, Default)]
pub struct StridedDefective;

impl FillStrategy for StridedDefective {
    fn name(&self) -> &'static str {
        "strided-defective"
    }

    fn fill(&self, buffer: &mut [u64], rank: usize) {
        let len = buffer.len();
        let base = rank as u64 * len as u64;
        for i in 0..len {
            buffer[i * (rank + 1)] = base + i as u64;
        }
    }
}

/// Fill strategy chosen at launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Fill {
    /// Slot `i` holds `rank * len + i`
    Sequential,
    /// Slot `i * (rank + 1)` holds `rank * len + i`; overruns past rank 0
    #[default]
    #[value(alias = "defective")]
    StridedDefective,
}

impl FillStrategy for Fill {
    fn name(&self) -> &'static str {
        match self {
            Fill::Sequential => Sequential.name(),
            Fill::StridedDefective => StridedDefective.name(),
        }
    }

    fn fill(&self, buffer: &mut [u64], rank: usize) {
        match self {
            Fill::Sequential => Sequential.fill(buffer, rank),
            Fill::StridedDefective => StridedDefective.fill(buffer, rank),
        }
    }
}

impl fmt::Display for Fill {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Allocate `per_rank` slots, fill them with `strategy` and return their wrapping sum.
///
/// The buffer lives only for the duration of this call. A panic inside `strategy` propagates
/// to the caller after the buffer is dropped.
pub fn local_sum<S>(ctx: &Context, per_rank: usize, strategy: &S) -> Result<u64, AllocError>
where
    S: FillStrategy + ?Sized,
{
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(per_rank)
        .map_err(|source| AllocError {
            rank: ctx.rank(),
            len: per_rank,
            source,
        })?;
    buffer.resize(per_rank, 0u64);

    debug!(
        "Rank {} filling {} slots ({})",
        ctx.rank(),
        per_rank,
        strategy.name()
    );
    strategy.fill(&mut buffer, ctx.rank());

    Ok(buffer.iter().fold(0u64, |acc, &v| acc.wrapping_add(v)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_fill_is_contiguous_per_rank() {
        let mut buffer = vec![0; 4];
        Sequential.fill(&mut buffer, 1);
        assert_eq!(buffer, [4, 5, 6, 7]);
    }

    #[test]
    fn defective_fill_matches_sequential_on_rank_zero() {
        let mut sequential = vec![0; 16];
        let mut strided = vec![0; 16];
        Sequential.fill(&mut sequential, 0);
        StridedDefective.fill(&mut strided, 0);
        assert_eq!(sequential, strided);
    }

    #[test]
    #[should_panic(expected = "index out of bounds")]
    fn defective_fill_overruns_on_rank_one() {
        let mut buffer = vec![0; 4];
        StridedDefective.fill(&mut buffer, 1);
    }

    #[test]
    #[should_panic(expected = "index out of bounds")]
    fn defective_fill_overruns_on_higher_ranks() {
        let mut buffer = vec![0; 4];
        StridedDefective.fill(&mut buffer, 2);
    }

    #[test]
    fn single_slot_never_overruns() {
        let mut buffer = vec![0; 1];
        StridedDefective.fill(&mut buffer, 5);
        assert_eq!(buffer, [5]);
    }

    #[test]
    fn local_sums_for_two_ranks_of_four() {
        let rank0 = local_sum(&Context::new(0, 2), 4, &Sequential).unwrap();
        let rank1 = local_sum(&Context::new(1, 2), 4, &Sequential).unwrap();
        assert_eq!(rank0, 6);
        assert_eq!(rank1, 22);
    }

    #[test]
    fn local_sum_accepts_the_launch_enum() {
        let sum = local_sum(&Context::new(0, 1), 4, &Fill::StridedDefective).unwrap();
        assert_eq!(sum, 6);
    }

    #[test]
    fn impossible_allocation_is_reported() {
        let err = local_sum(&Context::new(3, 4), usize::MAX, &Sequential).unwrap_err();
        assert_eq!(err.rank, 3);
        assert_eq!(err.len, usize::MAX);
        assert!(err.to_string().contains("Memory allocation failed"));
    }

    #[test]
    fn display_names_are_the_command_line_values() {
        for fill in [Fill::Sequential, Fill::StridedDefective] {
            assert_eq!(Fill::from_str(&fill.to_string(), false).unwrap(), fill);
        }
        assert!(Fill::from_str("diagonal", false).is_err());
    }
}
