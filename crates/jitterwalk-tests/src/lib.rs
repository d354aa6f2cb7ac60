//! Offline AIS-31 validation battery.
//!
//! Runs the startup test procedures over a captured buffer of collector
//! output, the same way the online harness runs them at startup. Useful for
//! auditing recorded samples without a live collector.

use serde::Serialize;

use jitterwalk_core::ais::Verdict;
use jitterwalk_core::{Error, Harness, Meters, TestPlan};

/// Overall outcome of a battery run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Outcome {
    /// Every configured procedure completed and passed.
    Passed,
    /// A procedure completed with failures.
    Failed { procedure: char },
    /// The buffer ran out before the procedures finished.
    NeedMoreData,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatteryReport {
    pub outcome: Outcome,
    /// Procedures that were configured, in execution order.
    pub procedures: String,
    pub meters: Meters,
    pub words_supplied: usize,
}

impl BatteryReport {
    pub fn passed(&self) -> bool {
        self.outcome == Outcome::Passed
    }
}

/// Run the startup procedures of `spec` over `words`.
///
/// Only the startup (total) section of the test configuration participates;
/// continuous procedures need a live collector to retest against. A spec
/// without a startup section passes vacuously.
pub fn check_buffer(words: &[u32], spec: &str) -> Result<BatteryReport, Error> {
    let plan = TestPlan::parse(spec)?;
    let (procedures, _) = plan.describe();
    let mut harness = Harness::new(&plan);

    log::debug!("battery [{procedures}] over {} words", words.len());
    let outcome = match harness.run_total(words) {
        Ok(Verdict::Pass) => Outcome::Passed,
        Ok(Verdict::NeedInput) => Outcome::NeedMoreData,
        Err(Error::Validation { procedure, .. }) => {
            log::warn!("battery procedure {procedure} failed");
            Outcome::Failed { procedure }
        }
        Err(e) => return Err(e),
    };
    Ok(BatteryReport {
        outcome,
        procedures,
        meters: harness.meters().clone(),
        words_supplied: words.len(),
    })
}
