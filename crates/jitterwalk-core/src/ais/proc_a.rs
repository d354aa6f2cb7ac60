//! AIS-31 procedure A.
//!
//! One disjointness test over 65536 48-bit strings, then 257 repetitions of
//! the four FIPS 140-1 tests and the autocorrelation test, each repetition on
//! a fresh 2500-byte sample. The whole procedure consumes 1,035,716 bytes.
//! An ideal source passes with probability about 0.9987; a single failing
//! sub-test earns one retry on fresh input.

use super::{byte_at, Feed, State, SubResult};

/// FIPS repetitions after the disjointness test.
const AIS_A_REPS: usize = 257;
/// Sub-test results produced by a complete run: the disjointness test plus
/// five results per repetition.
pub(crate) const PROC_A_REPS: usize = 1 + 5 * AIS_A_REPS;

const FIPS_LENGTH: usize = 2500;
const FIPS_ONES_LOW: u32 = 9654;
const FIPS_ONES_HIGH: u32 = 10346;
const FIPS_POKER_LOW: u64 = 1_523_181;
const FIPS_POKER_HIGH: u64 = 1_576_929;
const FIPS_RUNS_LOW: [u32; 6] = [2267, 1079, 502, 223, 90, 90];
const FIPS_RUNS_HIGH: [u32; 6] = [2733, 1421, 748, 402, 223, 223];
const FIPS_MAX_RUN: u32 = 34;

/// 48-bit strings examined by the disjointness test.
const TEST0_LENGTH: usize = 65536;
const TEST0_USED: usize = TEST0_LENGTH * 6;

/// Autocorrelation sample size in bits.
const TEST5_LENGTH: usize = 5000;

/// Sub-test id recorded for a skipped autocorrelation repetition.
const SKIPPED: u8 = 0xff;

pub(crate) struct ProcA {
    state: State,
    test_state: State,
    /// Completed sub-test results this run; `len() == test_run`.
    results: Vec<SubResult>,
    bytes_used: u64,
    retried: bool,
    /// Bytes buffered toward the current sub-test's sample.
    bridge: usize,
    /// Staging for the disjointness sample.
    aux: Vec<u8>,
    /// The current 2500-byte FIPS sample; the autocorrelation test reuses it.
    block: [u8; FIPS_LENGTH],
    cycle: u32,
}

impl ProcA {
    pub fn new() -> Self {
        Self {
            state: State::Init,
            test_state: State::Init,
            results: Vec::with_capacity(PROC_A_REPS),
            bytes_used: 0,
            retried: false,
            bridge: 0,
            aux: vec![0; TEST0_USED],
            block: [0; FIPS_LENGTH],
            cycle: 0,
        }
    }

    pub fn restart(&mut self) {
        self.state = State::Init;
    }

    pub fn set_cycle(&mut self, cycle: u32) {
        self.cycle = cycle;
    }

    pub fn retry_pending(&self) -> bool {
        self.retried && self.state != State::Done
    }

    pub fn has_failed_results(&self) -> bool {
        self.results.iter().any(|r| r.fail)
    }

    /// Pass/total per sub-test id, `test0:1/1, test1:257/257, ...` form.
    pub fn report(&self) -> String {
        let mut ran = [0u32; 6];
        let mut bad = [0u32; 6];
        for r in &self.results {
            let id = r.id as usize;
            if id > 5 {
                continue;
            }
            ran[id] += 1;
            bad[id] += u32::from(r.fail);
        }
        let mut out = String::new();
        for i in 0..6 {
            if i > 0 {
                out.push_str(", ");
            }
            out.push_str(&format!("test{i}:{}/{}", ran[i] - bad[i], ran[i]));
        }
        out
    }

    /// Feed one buffer. Sub-tests are sequenced as: disjointness once, then
    /// FIPS 1-4 and autocorrelation per repetition.
    pub fn feed(&mut self, buf: &[u32]) -> Feed {
        match self.state {
            State::Init => {
                self.bytes_used = 0;
                self.retried = false;
                self.restart_tests();
            }
            State::Retry => self.restart_tests(),
            _ => {}
        }

        let mut offs = 0usize;
        while self.results.len() < PROC_A_REPS {
            let run = self.results.len();
            let id = if run < 6 { run } else { 1 + (run - 6) % 5 };
            offs = match id {
                0 => self.test0(buf, offs),
                1..=4 => self.fips140(buf, offs),
                _ => self.test5(offs),
            };
            match self.test_state {
                State::Done => self.test_state = State::Init,
                State::Input => return Feed::More,
                _ => unreachable!("procedure A sub-tests end in Done or Input"),
            }
        }

        let failures = self.results.iter().filter(|r| r.fail).count();
        if failures == 1 && !self.retried {
            self.retried = true;
            self.state = State::Retry;
            return Feed::More;
        }
        self.state = State::Done;
        Feed::Done {
            failures,
            offs_bytes: offs,
        }
    }

    fn restart_tests(&mut self) {
        self.results.clear();
        self.test_state = State::Init;
        self.bridge = 0;
        self.state = State::Input;
    }

    // -----------------------------------------------------------------------
    // Sub-tests
    // -----------------------------------------------------------------------

    /// Disjointness of 65536 consecutive 6-byte strings: sort and look for
    /// an adjacent duplicate. Any duplicate fails.
    fn test0(&mut self, buf: &[u32], mut offs: usize) -> usize {
        if self.test_state == State::Init {
            self.test_state = State::Input;
            self.bridge = 0;
        }
        let range = buf.len() * 4;
        let take = (TEST0_USED - self.bridge).min(range - offs);
        for k in 0..take {
            self.aux[self.bridge + k] = byte_at(buf, offs + k);
        }
        offs += take;
        self.bridge += take;
        if self.bridge < TEST0_USED {
            return offs;
        }
        self.bytes_used += TEST0_USED as u64;
        self.bridge = 0;

        let mut strings: Vec<[u8; 6]> = self
            .aux
            .chunks_exact(6)
            .map(|c| [c[0], c[1], c[2], c[3], c[4], c[5]])
            .collect();
        strings.sort_unstable();
        let dups = strings.windows(2).filter(|w| w[0] == w[1]).count();
        self.results.push(SubResult {
            id: 0,
            fail: dups > 0,
            value: dups as f64,
        });
        self.test_state = State::Done;
        offs
    }

    /// The four FIPS 140-1 tests over one 2500-byte sample, evaluated in a
    /// single pass: monobit, poker, runs, and longest-run.
    fn fips140(&mut self, buf: &[u32], mut offs: usize) -> usize {
        if self.test_state == State::Init {
            self.test_state = State::Input;
            self.bridge = 0;
        }
        let range = buf.len() * 4;
        let take = (FIPS_LENGTH - self.bridge).min(range - offs);
        for k in 0..take {
            self.block[self.bridge + k] = byte_at(buf, offs + k);
        }
        offs += take;
        self.bridge += take;
        if self.bridge < FIPS_LENGTH {
            return offs;
        }
        self.bytes_used += FIPS_LENGTH as u64;
        self.bridge = 0;

        let mut poker = [0u64; 16];
        let mut runs = [0u32; 12];
        let mut ones = 0u32;
        let mut run_length = 0u32;
        let mut cur_len = 0u32;
        let mut max_run = 0u32;
        let mut last = 2u32;

        // Run buckets follow the transition accounting the thresholds were
        // calibrated against: the ending run's length is booked under the
        // incoming bit's value, and a length-1 phantom is booked for the
        // first bit.
        let mut book = |runs: &mut [u32; 12], len: u32, bit: u32| {
            runs[len.min(5) as usize + 6 * bit as usize] += 1;
        };

        for j in 0..FIPS_LENGTH {
            let c = self.block[j];
            poker[(c >> 4) as usize] += 1;
            poker[(c & 15) as usize] += 1;
            for k in 0..8 {
                let current = u32::from((c >> (7 - k)) & 1);
                ones += current;
                if current != last {
                    book(&mut runs, run_length, current);
                    run_length = 0;
                    cur_len = 1;
                    last = current;
                } else {
                    run_length += 1;
                    cur_len += 1;
                }
                max_run = max_run.max(cur_len);
            }
        }
        book(&mut runs, run_length, last);

        self.results.push(SubResult {
            id: 1,
            fail: !(FIPS_ONES_LOW + 1..FIPS_ONES_HIGH).contains(&ones),
            value: f64::from(ones),
        });
        let poker_sum: u64 = poker.iter().map(|&p| p * p).sum();
        self.results.push(SubResult {
            id: 2,
            fail: poker_sum <= FIPS_POKER_LOW || poker_sum >= FIPS_POKER_HIGH,
            value: poker_sum as f64,
        });
        let runs_fail = (0..12)
            .any(|j| runs[j] < FIPS_RUNS_LOW[j % 6] || runs[j] > FIPS_RUNS_HIGH[j % 6]);
        self.results.push(SubResult {
            id: 3,
            fail: runs_fail,
            value: 0.0,
        });
        self.results.push(SubResult {
            id: 4,
            fail: max_run >= FIPS_MAX_RUN,
            value: f64::from(max_run),
        });
        self.test_state = State::Done;
        offs
    }

    /// Autocorrelation over the FIPS sample just consumed: search the first
    /// 5000 bits for the shift of maximum bias, then judge that shift on the
    /// following 5000 bits. Consumes no new input. Repetitions not on the
    /// configured cycle are skipped outright.
    fn test5(&mut self, offs: usize) -> usize {
        if self.cycle != 0 {
            let rep = (self.results.len() - 1) / 5;
            if rep as u32 % self.cycle != 0 {
                self.results.push(SubResult {
                    id: SKIPPED,
                    fail: false,
                    value: 0.0,
                });
                self.test_state = State::Done;
                return offs;
            }
        }

        let mut max = 0u32;
        let mut best = 0usize;
        for tau in 1..=TEST5_LENGTH {
            let z = autocorr(&self.block, tau).abs_diff(2500);
            if z > max {
                max = z;
                best = tau - 1;
            }
        }
        let z = autocorr(&self.block[TEST5_LENGTH / 8..], best + 1);
        self.results.push(SubResult {
            id: 5,
            fail: !(2327..2674).contains(&z),
            value: f64::from(z),
        });
        self.test_state = State::Done;
        offs
    }
}

/// Count differing bit pairs between the sample and its copy shifted by
/// `shift` bits, over [`TEST5_LENGTH`] bits.
fn autocorr(src: &[u8], shift: usize) -> u32 {
    let mut rv = 0;
    for i in 0..TEST5_LENGTH {
        let j = i + shift;
        let a = (src[i >> 3] >> (i & 7)) & 1;
        let b = (src[j >> 3] >> (j & 7)) & 1;
        rv += u32::from(a ^ b);
    }
    rv
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
