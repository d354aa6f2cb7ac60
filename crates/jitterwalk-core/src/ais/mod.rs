//! AIS-31 statistical validation of the collection output.
//!
//! Two procedures are implemented. Procedure A is the disjointness test plus
//! the four FIPS 140-1 tests and an autocorrelation test, repeated over 257
//! samples. Procedure B is the uniform-distribution and transition
//! probability tests plus Coron's entropy estimator.
//!
//! Tests run directly against collection fills, and a fill has no particular
//! relationship to the amount of data a test wants, so every test is a state
//! machine over segmented input. A procedure that completes with exactly one
//! failing sub-test is retried once on fresh input; an ideal source
//! essentially never fails the retry.
//!
//! Which procedures run at startup ("tot") and against production fills
//! ("continuous") is chosen by a compact option string, see
//! [`TestPlan::parse`].

mod proc_a;
mod proc_b;

use std::sync::Arc;

use serde::Serialize;

use crate::error::{Error, Result, TestScope};

pub(crate) use proc_a::ProcA;
pub(crate) use proc_b::ProcB;

/// Option string applied when the caller does not supply one: procedure A
/// with the autocorrelation test every 256th repetition, then procedure B,
/// at startup only.
pub const DEFAULT_SPEC: &str = "ta8b";

// ---------------------------------------------------------------------------
// Shared pieces
// ---------------------------------------------------------------------------

/// Per-test and per-procedure state machine phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Init,
    Input,
    Eval,
    Retry,
    Done,
}

/// Outcome of one sub-test.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SubResult {
    pub id: u8,
    pub fail: bool,
    pub value: f64,
}

/// Result of feeding one buffer to a procedure.
pub(crate) enum Feed {
    /// Buffer exhausted (or retry scheduled); feed the next fill.
    More,
    /// Procedure complete; `offs_bytes` is where it stopped in this buffer.
    Done { failures: usize, offs_bytes: usize },
}

/// Byte `i` of the buffer, little-endian within each word.
#[inline(always)]
pub(crate) fn byte_at(buf: &[u32], i: usize) -> u8 {
    (buf[i / 4] >> (8 * (i % 4))) as u8
}

/// Bit `n` of the buffer, LSB-first within each word.
#[inline(always)]
pub(crate) fn bit_at(buf: &[u32], n: usize) -> u32 {
    (buf[n / 32] >> (n % 32)) & 1
}

// ---------------------------------------------------------------------------
// Test plan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcKind {
    A,
    B,
}

impl ProcKind {
    fn letter(self) -> char {
        match self {
            Self::A => 'A',
            Self::B => 'B',
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Slot {
    pub kind: ProcKind,
    pub warn: bool,
    /// For procedure A: run the autocorrelation test only every `cycle`-th
    /// repetition (power of two), 0 = every repetition.
    pub cycle: u32,
}

#[derive(Debug, Default, Clone, Copy)]
struct SectionOpts {
    a: Option<(u32, bool)>,
    b: Option<bool>,
}

impl SectionOpts {
    /// Procedure B runs before procedure A when both are configured.
    fn slots(&self) -> Vec<Slot> {
        let mut v = Vec::new();
        if let Some(warn) = self.b {
            v.push(Slot {
                kind: ProcKind::B,
                warn,
                cycle: 0,
            });
        }
        if let Some((cycle, warn)) = self.a {
            v.push(Slot {
                kind: ProcKind::A,
                warn,
                cycle,
            });
        }
        v
    }
}

/// Parsed online-test configuration, shareable across collectors.
#[derive(Debug, Clone, Default)]
pub struct TestPlan {
    tot: Vec<Slot>,
    run: Vec<Slot>,
    /// Scaled harmonic numbers for the Coron estimator; built once when any
    /// procedure B is configured.
    g: Option<Arc<Vec<f64>>>,
}

impl TestPlan {
    /// Parse an option string of terms `[t|c][a[1-8][w]|b[w]]`, case
    /// insensitive. `t` and `c` open (and reset) the startup and continuous
    /// sections; each `a`/`b` term adds a procedure to the open section. An
    /// empty string configures no tests.
    pub fn parse(spec: &str) -> Result<Self> {
        #[derive(Clone, Copy, PartialEq)]
        enum Section {
            None,
            Tot,
            Run,
        }
        let bad = || Error::BadTestSpec(spec.to_string());

        let mut tot = SectionOpts::default();
        let mut run = SectionOpts::default();
        let mut section = Section::None;
        let mut chars = spec.chars().peekable();

        while let Some(c) = chars.next() {
            match c.to_ascii_lowercase() {
                't' => {
                    section = Section::Tot;
                    tot = SectionOpts::default();
                }
                'c' => {
                    section = Section::Run;
                    run = SectionOpts::default();
                }
                'a' => {
                    if section == Section::None {
                        return Err(bad());
                    }
                    let mut cycle = 0;
                    if let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
                        if (1..9).contains(&d) {
                            cycle = 1 << d;
                            chars.next();
                        }
                    }
                    let warn = matches!(chars.peek(), Some('w' | 'W'));
                    if warn {
                        chars.next();
                    }
                    let opts = if section == Section::Tot { &mut tot } else { &mut run };
                    let (c0, w0) = opts.a.unwrap_or((0, false));
                    opts.a = Some((c0 | cycle, w0 | warn));
                }
                'b' => {
                    if section == Section::None {
                        return Err(bad());
                    }
                    let warn = matches!(chars.peek(), Some('w' | 'W'));
                    if warn {
                        chars.next();
                    }
                    let opts = if section == Section::Tot { &mut tot } else { &mut run };
                    opts.b = Some(opts.b.unwrap_or(false) | warn);
                }
                _ => return Err(bad()),
            }
        }

        let tot = tot.slots();
        let run = run.slots();
        let uses_b = tot
            .iter()
            .chain(run.iter())
            .any(|s| s.kind == ProcKind::B);
        let g = uses_b.then(|| Arc::new(proc_b::coron_table()));
        Ok(Self { tot, run, g })
    }

    /// `(startup, continuous)` summaries in `[B][A[n]]` form.
    pub fn describe(&self) -> (String, String) {
        let fmt = |slots: &[Slot]| {
            let mut s = String::new();
            for slot in slots {
                s.push(slot.kind.letter());
                if slot.cycle != 0 {
                    s.push(char::from_digit(slot.cycle.trailing_zeros(), 10).unwrap_or('?'));
                }
            }
            s
        };
        (fmt(&self.tot), fmt(&self.run))
    }

    pub fn has_total(&self) -> bool {
        !self.tot.is_empty()
    }

    pub fn has_continuous(&self) -> bool {
        !self.run.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.tot.is_empty() && self.run.is_empty()
    }

    fn uses(&self, kind: ProcKind) -> bool {
        self.tot
            .iter()
            .chain(self.run.iter())
            .any(|s| s.kind == kind)
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// Result of feeding a fill to the startup tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Startup testing needs more fills.
    NeedInput,
    /// All startup procedures completed.
    Pass,
}

/// What to do with a production fill after continuous testing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillVerdict {
    Keep,
    /// The fill contributed to a failed sub-test or a pending retry and must
    /// not be handed to consumers.
    Discard,
}

/// Pass/fail completion counters, per procedure and scope.
#[derive(Debug, Default, Clone, Serialize)]
pub struct Meters {
    pub tot_a_pass: u32,
    pub tot_a_fail: u32,
    pub tot_b_pass: u32,
    pub tot_b_fail: u32,
    pub prod_a_pass: u32,
    pub prod_a_fail: u32,
    pub prod_b_pass: u32,
    pub prod_b_fail: u32,
}

/// Per-collector test driver. Holds the procedure state machines and chains
/// them over successive fills according to the plan.
pub struct Harness {
    plan: TestPlan,
    proc_a: Option<ProcA>,
    proc_b: Option<ProcB>,
    tot_idx: usize,
    run_idx: usize,
    total_done: bool,
    continuous_started: bool,
    fatal: Option<(char, TestScope)>,
    meters: Meters,
}

impl Harness {
    pub fn new(plan: &TestPlan) -> Self {
        Self {
            proc_a: plan.uses(ProcKind::A).then(ProcA::new),
            proc_b: plan.uses(ProcKind::B).then(ProcB::new),
            plan: plan.clone(),
            tot_idx: 0,
            run_idx: 0,
            total_done: false,
            continuous_started: false,
            fatal: None,
            meters: Meters::default(),
        }
    }

    pub fn meters(&self) -> &Meters {
        &self.meters
    }

    /// Feed one fill to the startup procedures. Returns `Pass` once every
    /// configured procedure has completed; a hard failure is fatal.
    pub fn run_total(&mut self, buf: &[u32]) -> Result<Verdict> {
        self.check_fatal()?;
        if self.total_done || self.plan.tot.is_empty() {
            self.total_done = true;
            return Ok(Verdict::Pass);
        }
        let mut words = buf;
        loop {
            let slot = self.plan.tot[self.tot_idx];
            match self.feed_slot(slot, words) {
                Feed::More => return Ok(Verdict::NeedInput),
                Feed::Done { failures, offs_bytes } => {
                    self.settle(slot, failures, TestScope::Total)?;
                    if self.tot_idx + 1 >= self.plan.tot.len() {
                        self.total_done = true;
                        return Ok(Verdict::Pass);
                    }
                    self.tot_idx += 1;
                    self.reset_slot(self.plan.tot[self.tot_idx]);
                    let w = offs_bytes / 4;
                    if w >= words.len() {
                        return Ok(Verdict::NeedInput);
                    }
                    words = &words[w..];
                }
            }
        }
    }

    /// Feed one production fill to the continuous procedures and decide
    /// whether the fill may be released. A hard failure is fatal.
    pub fn run_continuous(&mut self, buf: &[u32]) -> Result<FillVerdict> {
        self.check_fatal()?;
        if self.plan.run.is_empty() {
            return Ok(FillVerdict::Keep);
        }
        if !self.continuous_started {
            self.continuous_started = true;
            self.reset_slot(self.plan.run[self.run_idx]);
        }
        let mut words = buf;
        loop {
            let slot = self.plan.run[self.run_idx];
            match self.feed_slot(slot, words) {
                Feed::More => break,
                Feed::Done { failures, offs_bytes } => {
                    self.settle(slot, failures, TestScope::Continuous)?;
                    if self.plan.run.len() > 1 {
                        self.run_idx ^= 1;
                    }
                    self.reset_slot(self.plan.run[self.run_idx]);
                    let w = offs_bytes / 4;
                    if w >= words.len() {
                        break;
                    }
                    words = &words[w..];
                }
            }
        }
        Ok(if self.pending_failure() {
            FillVerdict::Discard
        } else {
            FillVerdict::Keep
        })
    }

    fn check_fatal(&self) -> Result<()> {
        match self.fatal {
            Some((procedure, scope)) => Err(Error::Validation { procedure, scope }),
            None => Ok(()),
        }
    }

    fn feed_slot(&mut self, slot: Slot, words: &[u32]) -> Feed {
        match slot.kind {
            ProcKind::A => {
                let p = self.proc_a.as_mut().expect("plan configured procedure A");
                p.set_cycle(slot.cycle);
                p.feed(words)
            }
            ProcKind::B => {
                let g = self.plan.g.as_deref().expect("plan configured procedure B");
                self.proc_b
                    .as_mut()
                    .expect("plan configured procedure B")
                    .feed(g, words)
            }
        }
    }

    fn reset_slot(&mut self, slot: Slot) {
        match slot.kind {
            ProcKind::A => {
                if let Some(p) = self.proc_a.as_mut() {
                    p.restart();
                }
            }
            ProcKind::B => {
                if let Some(p) = self.proc_b.as_mut() {
                    p.restart();
                }
            }
        }
    }

    /// Book a completed procedure: meters, warn-or-fatal handling.
    fn settle(&mut self, slot: Slot, failures: usize, scope: TestScope) -> Result<()> {
        let counter = match (slot.kind, scope, failures > 0) {
            (ProcKind::A, TestScope::Total, false) => &mut self.meters.tot_a_pass,
            (ProcKind::A, TestScope::Total, true) => &mut self.meters.tot_a_fail,
            (ProcKind::A, TestScope::Continuous, false) => &mut self.meters.prod_a_pass,
            (ProcKind::A, TestScope::Continuous, true) => &mut self.meters.prod_a_fail,
            (ProcKind::B, TestScope::Total, false) => &mut self.meters.tot_b_pass,
            (ProcKind::B, TestScope::Total, true) => &mut self.meters.tot_b_fail,
            (ProcKind::B, TestScope::Continuous, false) => &mut self.meters.prod_b_pass,
            (ProcKind::B, TestScope::Continuous, true) => &mut self.meters.prod_b_fail,
        };
        *counter += 1;

        if failures == 0 {
            log::debug!(
                "AIS-31 procedure {} completed during {scope} test",
                slot.kind.letter()
            );
            return Ok(());
        }

        let detail = match slot.kind {
            ProcKind::A => self
                .proc_a
                .as_ref()
                .map(ProcA::report)
                .unwrap_or_default(),
            ProcKind::B => self
                .proc_b
                .as_ref()
                .map(ProcB::report)
                .unwrap_or_default(),
        };
        log::warn!(
            "AIS-31 procedure {} failed during {scope} test: {detail}",
            slot.kind.letter()
        );
        if slot.warn {
            return Ok(());
        }
        let procedure = slot.kind.letter();
        self.fatal = Some((procedure, scope));
        Err(Error::Validation { procedure, scope })
    }

    /// A fill must be discarded while the in-progress continuous procedure
    /// carries a failed sub-test or an unfinished retry.
    fn pending_failure(&self) -> bool {
        let slot = self.plan.run[self.run_idx];
        match slot.kind {
            ProcKind::A => self
                .proc_a
                .as_ref()
                .is_some_and(|p| p.retry_pending() || p.has_failed_results()),
            ProcKind::B => self
                .proc_b
                .as_ref()
                .is_some_and(|p| p.retry_pending() || p.has_failed_results()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_parsing_accepts_valid_specs() {
        let p = TestPlan::parse("ta8b").unwrap();
        assert_eq!(p.tot.len(), 2);
        assert_eq!(p.tot[0].kind, ProcKind::B);
        assert_eq!(p.tot[1].kind, ProcKind::A);
        assert_eq!(p.tot[1].cycle, 256);
        assert!(p.run.is_empty());
        assert_eq!(p.describe(), ("BA8".to_string(), String::new()));

        let p = TestPlan::parse("tabwcb").unwrap();
        assert_eq!(p.tot.len(), 2);
        assert!(p.tot[0].warn, "b carried the w flag");
        assert_eq!(p.tot[1].cycle, 0);
        assert!(!p.tot[1].warn);
        assert_eq!(p.run.len(), 1);
        assert_eq!(p.run[0].kind, ProcKind::B);

        // Case insensitive, warn on A.
        let p = TestPlan::parse("TA1W").unwrap();
        assert_eq!(p.tot[0].cycle, 2);
        assert!(p.tot[0].warn);

        // Section letter alone resets and leaves the section empty.
        let p = TestPlan::parse("t").unwrap();
        assert!(p.is_empty());
        assert!(TestPlan::parse("").unwrap().is_empty());
    }

    #[test]
    fn plan_parsing_rejects_malformed_specs() {
        for bad in ["a", "b", "x", "t9", "ta9b", "tq", "ca0"] {
            assert!(TestPlan::parse(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn later_section_letter_resets_earlier_terms() {
        let p = TestPlan::parse("tabtb").unwrap();
        // Second t wipes the first section's A and B.
        assert_eq!(p.tot.len(), 1);
        assert_eq!(p.tot[0].kind, ProcKind::B);
    }

    #[test]
    fn empty_plan_passes_everything() {
        let plan = TestPlan::parse("").unwrap();
        let mut h = Harness::new(&plan);
        let buf = vec![0u32; 64];
        assert_eq!(h.run_total(&buf).unwrap(), Verdict::Pass);
        assert_eq!(h.run_continuous(&buf).unwrap(), FillVerdict::Keep);
    }

    #[test]
    fn zero_input_fails_procedure_a_hard() {
        let plan = TestPlan::parse("ta8").unwrap();
        let mut h = Harness::new(&plan);
        let buf = vec![0u32; 4096];
        let mut outcome = None;
        for _ in 0..80 {
            match h.run_total(&buf) {
                Ok(Verdict::NeedInput) => continue,
                other => {
                    outcome = Some(other);
                    break;
                }
            }
        }
        match outcome {
            Some(Err(Error::Validation { procedure: 'A', scope })) => {
                assert_eq!(scope, TestScope::Total);
            }
            other => panic!("expected fatal procedure A failure, got {other:?}"),
        }
        assert_eq!(h.meters().tot_a_fail, 1);
        // Fatal state is sticky.
        assert!(h.run_total(&buf).is_err());
        assert!(h.run_continuous(&buf).is_err());
    }

    #[test]
    fn warn_flag_downgrades_total_failure() {
        let plan = TestPlan::parse("ta8w").unwrap();
        let mut h = Harness::new(&plan);
        let buf = vec![0u32; 4096];
        let mut passed = false;
        for _ in 0..80 {
            match h.run_total(&buf).unwrap() {
                Verdict::NeedInput => continue,
                Verdict::Pass => {
                    passed = true;
                    break;
                }
            }
        }
        assert!(passed, "warn-only plan must complete");
        assert_eq!(h.meters().tot_a_fail, 1);
        assert_eq!(h.meters().tot_a_pass, 0);
        // Once total testing completed, further fills pass through.
        assert_eq!(h.run_total(&buf).unwrap(), Verdict::Pass);
    }

    #[test]
    fn continuous_failure_discards_fills() {
        let plan = TestPlan::parse("cbw").unwrap();
        let mut h = Harness::new(&plan);
        // All-zero input: the uniform-distribution test completes inside the
        // first fill with proportion 0.0 and must flag the fill.
        let buf = vec![0u32; 4096];
        assert_eq!(h.run_continuous(&buf).unwrap(), FillVerdict::Discard);
    }

    #[test]
    fn byte_and_bit_views_are_little_endian() {
        let buf = [0x04030201u32, 0x08070605];
        for (i, want) in (1u8..=8).enumerate() {
            assert_eq!(byte_at(&buf, i), want);
        }
        assert_eq!(bit_at(&buf, 0), 1);
        assert_eq!(bit_at(&buf, 1), 0);
        assert_eq!(bit_at(&buf, 9), 1); // 0x02 is bit 1 of byte 1
        assert_eq!(bit_at(&buf, 34), 1); // 0x05 low bits
    }
}
