//! Error taxonomy for the harvester.
//!
//! Construction-time errors (`BadTestSpec`, `BadTopology`, `Allocation`,
//! `TimerStuck`) are unrecoverable: no engine or orchestrator handle is
//! returned. Steady-state errors (`HandOff`, `Validation`) surface from
//! `rng`/`read_words` calls; the orchestrator never auto-restarts a crashed
//! collector.

use thiserror::Error;

/// Which validation pass a statistical failure occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestScope {
    /// One-time startup ("tot") validation.
    Total,
    /// Continuous validation of production fills.
    Continuous,
}

impl std::fmt::Display for TestScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Total => write!(f, "total"),
            Self::Continuous => write!(f, "continuous"),
        }
    }
}

/// Everything that can go wrong in the core library.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed online-test specification string.
    #[error("invalid test specification {0:?}")]
    BadTestSpec(String),

    /// Invalid explicit cache-size override.
    #[error("invalid topology override: {0}")]
    BadTopology(String),

    /// Buffer or walk-table reservation failed.
    #[error("allocation of {what} ({bytes} bytes) failed")]
    Allocation { what: &'static str, bytes: usize },

    /// The hardware tick counter never advanced during warm-up. The host
    /// cannot supply timing jitter, so there is nothing to harvest.
    #[error("hardware tick counter is not advancing")]
    TimerStuck,

    /// Multi-collector hand-off failed (a collector died or the directory
    /// recorded a fatal condition).
    #[error("collector hand-off failed: {0}")]
    HandOff(String),

    /// An AIS-31 procedure failed beyond its single permitted retry.
    #[error("AIS-31 procedure {procedure} failed during {scope} test")]
    Validation {
        procedure: char,
        scope: TestScope,
    },

    /// Zero collectors requested.
    #[error("no collectors requested")]
    NoTask,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Fallible vector reservation, mapped onto [`Error::Allocation`].
///
/// The walk table can be large (2x the data cache plus alignment slack) and
/// the collection buffer is caller-sized, so both go through this instead of
/// the infallible growth path.
pub(crate) fn try_alloc_u32(what: &'static str, words: usize) -> Result<Vec<u32>> {
    let mut v: Vec<u32> = Vec::new();
    v.try_reserve_exact(words).map_err(|_| Error::Allocation {
        what,
        bytes: words * std::mem::size_of::<u32>(),
    })?;
    v.resize(words, 0);
    Ok(v)
}
