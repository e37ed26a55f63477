//! A distributed sum check over a small MPI-like runtime.
//!
//! Every participant (rank) fills a local buffer with a known value pattern, sums it, and the
//! per-rank sums are combined with an all-reduce. The coordinator (rank 0) compares the global
//! sum against the closed form of `0 + 1 + ... + (ranks * per_rank - 1)` and reports the
//! outcome.
//!
//! The crate ships the buffer fill in two flavours. [`Sequential`] writes slot `i` of rank `r`
//! with `r * per_rank + i`, which makes the union of all buffers the contiguous range the closed
//! form sums over. [`StridedDefective`] writes the same values to slot `i * (rank + 1)`, which
//! runs off the end of the buffer on every rank past the first. Bounds-checked indexing turns
//! that write into a panic on the faulting rank, and the orchestrator turns the panic into a
//! world-wide abort so no peer is left waiting in a collective.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use rank_sum::{run, Config, World};
//!
//! let config = Config::default();
//! let world = World::init(config.ranks).unwrap();
//!
//! let stdout = std::io::stdout();
//! let report = run(&world, &config, &mut stdout.lock()).unwrap();
//! if let Some(report) = report {
//!     assert!(report.is_match());
//! }
//!
//! world.finalize().unwrap();
//! ```
//!
//! # Architecture
//!
//! - [`World`] spawns one process per rank and connects them through POSIX shared memory.
//! - [`ThreadGroup`] runs the same ranks as threads of one process, which is what the tests use.
//! - Both implement [`Communicator`], the seam every phase of [`run`] is written against.
//!
//! # Error Handling
//!
//! Runtime operations return [`Result`] with [`RuntimeError`]. A world-wide abort surfaces on
//! every rank as [`RuntimeError::Aborted`] carrying the exit code of the rank that aborted.

use thiserror::Error;

mod comm;
mod config;
mod expected;
mod group;
mod local;
mod report;
mod run;
mod world;

pub use comm::{Communicator, Context};
pub use config::{Config, RANKS_ENV};
pub use expected::expected_sum;
pub use group::{Member, ThreadGroup, PANIC_CODE};
pub use local::{local_sum, AllocError, Fill, FillStrategy, Sequential, StridedDefective};
pub use report::Report;
pub use run::{install_fault_hook, run, ALLOC_FAILURE_CODE, FAULT_CODE};
pub use world::{World, MAX_RANKS};

/// Number of `u64` slots each rank allocates unless told otherwise.
pub const PER_RANK_ARRAY_SIZE: usize = 1_000_000;

/// Where the coordinator persists the result record unless told otherwise.
pub const DEFAULT_OUTPUT: &str = "out/result.log";

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Invalid rank: {0}")]
    InvalidRank(usize),
    #[error("Communication error: {0}")]
    CommunicationError(String),
    #[error("Initialization error: {0}")]
    InitError(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Shared memory error: {0}")]
    SharedMemoryError(String),
    #[error("Process error: {0}")]
    ProcessError(String),
    #[error("World aborted with code {0}")]
    Aborted(i32),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
