use std::path::PathBuf;

use clap::builder::RangedU64ValueParser;
use clap::Parser;

use crate::local::Fill;
use crate::{DEFAULT_OUTPUT, PER_RANK_ARRAY_SIZE};

/// Environment variable consulted for the rank count when `--ranks` is absent.
pub const RANKS_ENV: &str = "RANK_SUM_RANKS";

const DEFAULT_RANKS: usize = 4;

/// Launch parameters, identical on every rank.
///
/// Every spawned rank parses the same command line as the launcher. `output` is not settable
/// from the command line; the binary always writes [`DEFAULT_OUTPUT`] relative to its working
/// directory.
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(name = "rank-sum")]
#[command(about = "Sum known per-rank buffers with an all-reduce and check the closed form")]
#[command(version)]
pub struct Config {
    /// Number of participating ranks
    #[arg(
        short = 'n',
        long,
        value_name = "N",
        env = "RANK_SUM_RANKS",
        default_value_t = DEFAULT_RANKS,
        value_parser = RangedU64ValueParser::<usize>::new().range(1..)
    )]
    pub ranks: usize,

    /// Slots in each rank's buffer
    #[arg(
        short = 's',
        long,
        value_name = "LEN",
        default_value_t = PER_RANK_ARRAY_SIZE,
        value_parser = RangedU64ValueParser::<usize>::new().range(1..)
    )]
    pub per_rank: usize,

    /// How each rank fills its buffer
    #[arg(short, long, value_enum, value_name = "STRATEGY", default_value_t = Fill::default())]
    pub fill: Fill,

    #[arg(skip = PathBuf::from(DEFAULT_OUTPUT))]
    pub output: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ranks: DEFAULT_RANKS,
            per_rank: PER_RANK_ARRAY_SIZE,
            fill: Fill::default(),
            output: PathBuf::from(DEFAULT_OUTPUT),
        }
    }
}
