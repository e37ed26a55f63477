use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use backtrace::Backtrace;
use log::{error, info};

use crate::comm::{Communicator, Context};
use crate::config::Config;
use crate::expected::expected_sum;
use crate::local::{local_sum, FillStrategy};
use crate::report::Report;
use crate::Result;

/// Abort code when a rank cannot allocate its buffer.
pub const ALLOC_FAILURE_CODE: i32 = 1;

/// Abort code when a rank faults while filling its buffer (the SIGABRT exit status).
pub const FAULT_CODE: i32 = 134;

/// Log panics through `log` together with a backtrace of the panicking thread.
///
/// The default hook only prints the message; the backtrace is what points at the faulting
/// write.
pub fn install_fault_hook() {
    panic::set_hook(Box::new(|info| {
        let backtrace = Backtrace::new();
        error!("{}\n{:?}", info, backtrace);
    }));
}

/// Run the whole check on one rank of `comm`.
///
/// Every rank must call this with the same `config`. The coordinator prints its summary and
/// timing lines to `out`, persists the record to `config.output` and returns the report;
/// other ranks return `None`.
pub fn run<C: Communicator>(comm: &C, config: &Config, out: &mut dyn Write) -> Result<Option<Report>> {
    let ctx = comm.context();
    comm.barrier()?;

    let start = ctx.is_coordinator().then(Instant::now);
    if ctx.is_coordinator() {
        info!(
            "Summing {} slots on each of {} ranks ({} fill)",
            config.per_rank,
            ctx.size(),
            config.fill
        );
    }

    let expected = expected_sum(ctx.size(), config.per_rank);
    let local = process_rank(comm, &ctx, config.per_rank, &config.fill)?;

    comm.barrier()?;
    let global = comm.all_reduce_sum(local)?;
    info!("Rank {} all-reduce result = {}", ctx.rank(), global);
    comm.barrier()?;

    let Some(start) = start else {
        return Ok(None);
    };

    let report = Report::new(ctx.size(), expected, global);
    report.publish(out, &config.output)?;
    writeln!(
        out,
        "Total elapsed time = {:.6} seconds",
        start.elapsed().as_secs_f64()
    )?;
    Ok(Some(report))
}

/// Local phase: the rank's buffer sum, or a world abort if it cannot be produced.
fn process_rank<C, S>(comm: &C, ctx: &Context, per_rank: usize, strategy: &S) -> Result<u64>
where
    C: Communicator,
    S: FillStrategy + ?Sized,
{
    match panic::catch_unwind(AssertUnwindSafe(|| local_sum(ctx, per_rank, strategy))) {
        Ok(Ok(sum)) => {
            info!("Rank {} local sum = {}", ctx.rank(), sum);
            Ok(sum)
        }
        Ok(Err(e)) => {
            error!("{}", e);
            Err(comm.abort(ALLOC_FAILURE_CODE))
        }
        Err(_) => {
            error!(
                "Rank {}: fault while filling the buffer ({} fill)",
                ctx.rank(),
                strategy.name()
            );
            Err(comm.abort(FAULT_CODE))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::ThreadGroup;
    use crate::local::Fill;
    use crate::RuntimeError;
    use std::path::Path;
    use tempfile::tempdir;

    fn config(per_rank: usize, fill: Fill, dir: &Path) -> Config {
        Config {
            ranks: 0,
            per_rank,
            fill,
            output: dir.join("result.log"),
        }
    }

    #[test]
    fn only_the_coordinator_reports() {
        let dir = tempdir().unwrap();
        let config = config(4, Fill::Sequential, dir.path());
        let results = ThreadGroup::new(2).run(|m| {
            let mut out = Vec::new();
            let report = run(m, &config, &mut out).unwrap();
            (report, out)
        });

        let (report, out) = &results[0];
        assert_eq!(*report, Some(Report::new(2, 28, 28)));
        let out = String::from_utf8_lossy(out);
        assert!(out.starts_with("Sum: Expected = 28, Computed = 28, difference = 0\n"));
        assert!(out.contains("Total elapsed time = "));

        assert_eq!(results[1].0, None);
        assert!(results[1].1.is_empty());
        assert_eq!(std::fs::read_to_string(&config.output).unwrap(), "2,28,28,0\n");
    }

    #[test]
    fn allocation_failure_aborts_every_rank() {
        let dir = tempdir().unwrap();
        let config = config(usize::MAX, Fill::Sequential, dir.path());
        let results = ThreadGroup::new(3).run(|m| run(m, &config, &mut Vec::new()));
        for result in results {
            assert!(matches!(result, Err(RuntimeError::Aborted(ALLOC_FAILURE_CODE))));
        }
    }
}
