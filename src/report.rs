use std::fmt;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

use log::{info, warn};

/// Outcome of one run as seen by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Report {
    pub num_ranks: usize,
    pub expected: u64,
    pub computed: u64,
    /// `expected - computed`, promoted to `i128` so every pair of `u64` operands fits.
    pub difference: i128,
}

impl Report {
    pub fn new(num_ranks: usize, expected: u64, computed: u64) -> Self {
        Self {
            num_ranks,
            expected,
            computed,
            difference: i128::from(expected) - i128::from(computed),
        }
    }

    pub fn is_match(&self) -> bool {
        self.difference == 0
    }

    /// The comma-separated record persisted to the result file, newline included.
    pub fn record(&self) -> String {
        format!(
            "{},{},{},{}\n",
            self.num_ranks, self.expected, self.computed, self.difference
        )
    }

    /// Write the record to `path`, truncating any previous content.
    pub fn persist(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut file = File::create(path)?;
        file.write_all(self.record().as_bytes())
    }

    /// Print the summary line to `out`, then persist the record to `path`.
    ///
    /// Failing to persist is only a warning. Returns whether the record was written; the
    /// error is reserved for failures writing to `out`.
    pub fn publish(&self, out: &mut dyn Write, path: &Path) -> io::Result<bool> {
        writeln!(out, "{self}")?;
        match self.persist(path) {
            Ok(()) => {
                info!("Result written to {}", path.display());
                Ok(true)
            }
            Err(e) => {
                warn!("Warning - Could not open {} for writing: {}", path.display(), e);
                Ok(false)
            }
        }
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Sum: Expected = {}, Computed = {}, difference = {}",
            self.expected, self.computed, self.difference
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn difference_is_signed() {
        assert_eq!(Report::new(2, 28, 28).difference, 0);
        assert_eq!(Report::new(2, 28, 30).difference, -2);
        assert_eq!(Report::new(2, u64::MAX, 0).difference, i128::from(u64::MAX));
        assert_eq!(Report::new(2, 0, u64::MAX).difference, -i128::from(u64::MAX));
    }

    #[test]
    fn summary_and_record_format() {
        let report = Report::new(3, 10, 12);
        assert_eq!(
            report.to_string(),
            "Sum: Expected = 10, Computed = 12, difference = -2"
        );
        assert_eq!(report.record(), "3,10,12,-2\n");
        assert!(!report.is_match());
    }

    #[test]
    fn publish_creates_and_truncates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out").join("result.log");

        let mut out = Vec::new();
        assert!(Report::new(4, 1, 2).publish(&mut out, &path).unwrap());
        assert!(Report::new(2, 28, 28).publish(&mut out, &path).unwrap());

        assert_eq!(fs::read_to_string(&path).unwrap(), "2,28,28,0\n");
        let printed = String::from_utf8(out).unwrap();
        assert_eq!(printed.lines().count(), 2);
    }

    #[test]
    fn unwritable_path_still_prints() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not_a_dir");
        fs::write(&blocker, b"").unwrap();
        let path = blocker.join("result.log");

        let mut out = Vec::new();
        let written = Report::new(2, 28, 28).publish(&mut out, &path).unwrap();

        assert!(!written);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "Sum: Expected = 28, Computed = 28, difference = 0\n"
        );
    }
}
