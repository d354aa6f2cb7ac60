//! Multi-collector orchestration.
//!
//! Each collector owns a private engine and its own validation harness; no
//! permutation state is ever shared. Output is assembled through a
//! round-robin token chain: a request wakes the collector after the last one
//! to finish, each woken collector contributes what remains of its current
//! fill without blocking, and either completes the request or passes the
//! remainder on. A collector only refills after handing the token off, so
//! the slow part of collection overlaps with the rest of the chain.
//!
//! One collector degenerates to direct reads with none of the hand-off
//! machinery.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

use crate::ais::{FillVerdict, Harness, TestPlan, Verdict};
use crate::engine::{Engine, EngineOptions, EngineStatus, TickSource};
use crate::error::{Error, Result};
use crate::topology::HostConfig;

/// Sizing knobs shared by every collector.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub fill_words: usize,
    pub raw_capture: bool,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            fill_words: crate::engine::DEFAULT_FILL_WORDS,
            raw_capture: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Collector
// ---------------------------------------------------------------------------

/// One engine plus its validation harness.
///
/// Construction runs the configured startup procedures to completion over as
/// many fills as they ask for; a hard statistical failure aborts
/// construction. Production fills are checked by the continuous procedures
/// and discarded wholesale when flagged.
pub(crate) struct Collector {
    engine: Engine,
    harness: Option<Harness>,
}

impl Collector {
    pub(crate) fn new(
        host: &HostConfig,
        plan: &TestPlan,
        cfg: &CollectorConfig,
        tick: TickSource,
    ) -> Result<Self> {
        let mut engine = Engine::new(
            host,
            EngineOptions {
                fill_words: cfg.fill_words,
                raw_capture: cfg.raw_capture,
                tick,
            },
        )?;
        let mut harness = (!plan.is_empty()).then(|| Harness::new(plan));
        if let Some(h) = harness.as_mut() {
            loop {
                match h.run_total(engine.pending())? {
                    Verdict::Pass => break,
                    Verdict::NeedInput => engine.fill(),
                }
            }
            // Data consumed by startup testing is never released.
            engine.discard_fill();
        }
        Ok(Self { engine, harness })
    }

    /// Make sure the current fill has unread, validated words.
    fn replenish(&mut self) -> Result<()> {
        while self.engine.remaining() == 0 {
            self.engine.fill();
            if let Some(h) = self.harness.as_mut() {
                if h.run_continuous(self.engine.pending())? == FillVerdict::Discard {
                    self.engine.discard_fill();
                }
            }
        }
        Ok(())
    }

    fn read_words(&mut self, out: &mut [u32]) -> Result<()> {
        let mut done = 0;
        while done < out.len() {
            self.replenish()?;
            let take = self.engine.remaining().min(out.len() - done);
            out[done..done + take].copy_from_slice(&self.engine.pending()[..take]);
            self.engine.consume(take);
            done += take;
        }
        Ok(())
    }

    fn status(&self) -> EngineStatus {
        self.engine.status()
    }
}

// ---------------------------------------------------------------------------
// Hand-off plumbing
// ---------------------------------------------------------------------------

struct Semaphore {
    count: Mutex<u32>,
    cv: Condvar,
}

impl Semaphore {
    fn new() -> Self {
        Self {
            count: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    fn post(&self) {
        *lock(&self.count) += 1;
        self.cv.notify_one();
    }

    fn wait(&self) {
        let mut c = lock(&self.count);
        while *c == 0 {
            c = match self.cv.wait(c) {
                Ok(g) => g,
                Err(e) => e.into_inner(),
            };
        }
        *c -= 1;
    }
}

/// Poison-tolerant lock; a panicked collector must not take the others down.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// State shared between the reader and the collector chain.
struct Staging {
    buf: Vec<u32>,
    needed: usize,
    /// Collector that completed the previous request; its successor is woken
    /// first for the next one.
    last: usize,
    alive: Vec<bool>,
    fatal: Option<Error>,
    failed: bool,
}

struct Directory {
    staging: Mutex<Staging>,
    slots: Vec<Semaphore>,
    done: Semaphore,
    shutdown: AtomicBool,
}

impl Directory {
    /// Wake the first live collector at or after `start`; with none left,
    /// wake the reader so it can observe the failure.
    fn kick(&self, start: usize) {
        let n = self.slots.len();
        {
            let st = lock(&self.staging);
            for k in 0..n {
                let idx = (start + k) % n;
                if st.alive[idx] {
                    drop(st);
                    self.slots[idx].post();
                    return;
                }
            }
        }
        self.done.post();
    }
}

fn collector_loop(dir: Arc<Directory>, me: usize, mut collector: Collector, cpu: Option<usize>) {
    if let Some(cpu) = cpu {
        pin_to_cpu(cpu);
    }
    loop {
        dir.slots[me].wait();
        if dir.shutdown.load(Ordering::Acquire) {
            break;
        }
        let finished = {
            let mut st = lock(&dir.staging);
            let want = st.needed - st.buf.len();
            let take = collector.engine.remaining().min(want);
            let slice = &collector.engine.pending()[..take];
            st.buf.extend_from_slice(slice);
            collector.engine.consume(take);
            let finished = st.buf.len() == st.needed;
            if finished {
                st.last = me;
            }
            finished
        };
        if finished {
            dir.done.post();
        } else {
            dir.kick(me + 1);
        }
        // Refill only after the token moved on.
        if let Err(e) = collector.replenish() {
            let mut st = lock(&dir.staging);
            st.alive[me] = false;
            st.failed = true;
            if st.fatal.is_none() {
                st.fatal = Some(e);
            }
            drop(st);
            dir.done.post();
            break;
        }
    }
}

#[cfg(target_os = "linux")]
fn pin_to_cpu(cpu: usize) {
    // Best effort; collection works unpinned, just with more migration noise.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu % libc::CPU_SETSIZE as usize, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            log::debug!("could not pin collector to cpu {cpu}");
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_to_cpu(_cpu: usize) {}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

enum Mode {
    Direct(Box<Collector>),
    Pool(Pool),
}

struct Pool {
    dir: Arc<Directory>,
    threads: Vec<JoinHandle<()>>,
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.dir.shutdown.store(true, Ordering::Release);
        for slot in &self.dir.slots {
            slot.post();
        }
        for t in self.threads.drain(..) {
            let _ = t.join();
        }
    }
}

/// Owns the collectors and serves reads from their combined output.
pub struct Orchestrator {
    mode: Mode,
    statuses: Vec<EngineStatus>,
}

impl Orchestrator {
    /// Build `n` collectors against hardware tick sources and start serving.
    pub fn start(
        host: &HostConfig,
        plan: &TestPlan,
        cfg: &CollectorConfig,
        n: usize,
    ) -> Result<Self> {
        let ticks = (0..n).map(|_| TickSource::Hardware).collect();
        Self::start_with_ticks(host, plan, cfg, ticks)
    }

    /// As [`Orchestrator::start`], with one caller-supplied tick source per
    /// collector. The collector count is the number of sources.
    pub fn start_with_ticks(
        host: &HostConfig,
        plan: &TestPlan,
        cfg: &CollectorConfig,
        ticks: Vec<TickSource>,
    ) -> Result<Self> {
        let n = ticks.len();
        if n == 0 {
            return Err(Error::NoTask);
        }

        let mut collectors = Vec::with_capacity(n);
        for tick in ticks {
            collectors.push(Collector::new(host, plan, cfg, tick)?);
        }
        let statuses: Vec<EngineStatus> = collectors.iter().map(Collector::status).collect();

        if n == 1 {
            let c = collectors
                .pop()
                .ok_or_else(|| Error::HandOff("collector construction lost".into()))?;
            return Ok(Self {
                mode: Mode::Direct(Box::new(c)),
                statuses,
            });
        }

        let dir = Arc::new(Directory {
            staging: Mutex::new(Staging {
                buf: Vec::new(),
                needed: 0,
                last: n - 1,
                alive: vec![true; n],
                fatal: None,
                failed: false,
            }),
            slots: (0..n).map(|_| Semaphore::new()).collect(),
            done: Semaphore::new(),
            shutdown: AtomicBool::new(false),
        });

        let cpus = assign_cpus(host, n);
        let mut threads = Vec::with_capacity(n);
        for (me, (collector, cpu)) in collectors.into_iter().zip(cpus).enumerate() {
            let dir = Arc::clone(&dir);
            threads.push(std::thread::spawn(move || {
                collector_loop(dir, me, collector, cpu);
            }));
        }
        Ok(Self {
            mode: Mode::Pool(Pool { dir, threads }),
            statuses,
        })
    }

    pub fn collectors(&self) -> usize {
        self.statuses.len()
    }

    /// Engine diagnostics captured at startup (live for a single collector).
    pub fn statuses(&self) -> Vec<EngineStatus> {
        if let Mode::Direct(c) = &self.mode {
            return vec![c.status()];
        }
        self.statuses.clone()
    }

    /// Fill `out` with validated output words.
    pub fn read_words(&mut self, out: &mut [u32]) -> Result<()> {
        if out.is_empty() {
            return Ok(());
        }
        match &mut self.mode {
            Mode::Direct(c) => c.read_words(out),
            Mode::Pool(pool) => {
                let start = {
                    let mut st = lock(&pool.dir.staging);
                    if let Some(e) = st.fatal.take() {
                        return Err(e);
                    }
                    if st.failed {
                        return Err(Error::HandOff("a collector has failed".into()));
                    }
                    st.buf.clear();
                    st.needed = out.len();
                    (st.last + 1) % pool.dir.slots.len()
                };
                pool.dir.kick(start);
                pool.dir.done.wait();
                let mut st = lock(&pool.dir.staging);
                if let Some(e) = st.fatal.take() {
                    return Err(e);
                }
                if st.failed || st.buf.len() != out.len() {
                    return Err(Error::HandOff("request completed short".into()));
                }
                out.copy_from_slice(&st.buf);
                Ok(())
            }
        }
    }

    /// Shut the collector pool down and join its threads.
    pub fn stop(self) {
        drop(self);
    }

    /// Byte-oriented read; words are serialized little-endian.
    pub fn read_bytes(&mut self, out: &mut [u8]) -> Result<()> {
        let words = out.len().div_ceil(4);
        let mut tmp = vec![0u32; words];
        self.read_words(&mut tmp)?;
        for (chunk, w) in out.chunks_mut(4).zip(tmp) {
            let bytes = w.to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
        Ok(())
    }
}

/// Spread collectors over the online CPUs (falling back to the allowed set).
fn assign_cpus(host: &HostConfig, n: usize) -> Vec<Option<usize>> {
    let cpus: Vec<usize> = if host.online.count() > 0 {
        host.online.iter().collect()
    } else {
        host.allowed.iter().collect()
    };
    (0..n)
        .map(|i| cpus.get(i % cpus.len().max(1)).copied())
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::Tuner;

    fn host() -> HostConfig {
        Tuner::default().tune(Some(16), Some(16))
    }

    fn cfg() -> CollectorConfig {
        CollectorConfig {
            fill_words: 2048,
            raw_capture: false,
        }
    }

    fn ticks(n: usize) -> Vec<TickSource> {
        (0..n)
            .map(|i| TickSource::counter(11 + i as u32, 13 + 2 * i as u32))
            .collect()
    }

    #[test]
    fn zero_collectors_is_an_error() {
        let plan = TestPlan::default();
        match Orchestrator::start_with_ticks(&host(), &plan, &cfg(), Vec::new()) {
            Err(Error::NoTask) => {}
            other => panic!("expected NoTask, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn single_collector_serves_exact_counts() {
        let plan = TestPlan::default();
        let mut o = Orchestrator::start_with_ticks(&host(), &plan, &cfg(), ticks(1)).unwrap();
        assert_eq!(o.collectors(), 1);
        for n in [1usize, 16, 2048, 2049, 5000] {
            let mut out = vec![0u32; n];
            o.read_words(&mut out).unwrap();
        }
        let st = o.statuses();
        assert_eq!(st.len(), 1);
        assert!(st[0].fills > 0);
    }

    #[test]
    fn pool_serves_requests_spanning_fills() {
        let plan = TestPlan::default();
        let mut o = Orchestrator::start_with_ticks(&host(), &plan, &cfg(), ticks(3)).unwrap();
        assert_eq!(o.collectors(), 3);
        // Smaller than, equal to, and larger than one fill.
        for n in [100usize, 2048, 7000] {
            let mut out = vec![0u32; n];
            o.read_words(&mut out).unwrap();
        }
    }

    #[test]
    fn pool_output_is_deterministic_for_fixed_ticks() {
        let plan = TestPlan::default();
        let read = || {
            let mut o =
                Orchestrator::start_with_ticks(&host(), &plan, &cfg(), ticks(2)).unwrap();
            let mut out = vec![0u32; 6000];
            o.read_words(&mut out).unwrap();
            out
        };
        assert_eq!(read(), read());
    }

    #[test]
    fn byte_reads_cover_unaligned_lengths() {
        let plan = TestPlan::default();
        let mut o = Orchestrator::start_with_ticks(&host(), &plan, &cfg(), ticks(1)).unwrap();
        let mut a = [0u8; 10];
        o.read_bytes(&mut a).unwrap();
        let mut b = [0u8; 4096];
        o.read_bytes(&mut b).unwrap();
    }

    #[test]
    fn construction_fails_closed_on_stuck_timer() {
        let plan = TestPlan::default();
        let ticks = vec![TickSource::counter(1, 1), TickSource::stuck(7)];
        match Orchestrator::start_with_ticks(&host(), &plan, &cfg(), ticks) {
            Err(Error::TimerStuck) => {}
            other => panic!("expected TimerStuck, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn fatal_validation_at_startup_aborts_construction() {
        // Raw capture of a square-wave tick yields long runs of identical
        // bits, which the startup procedures must reject before any output
        // is served.
        let plan = TestPlan::parse("tb").unwrap();
        let cfg = CollectorConfig {
            fill_words: 4096,
            raw_capture: true,
        };
        let mut flip = false;
        let square = move || {
            flip = !flip;
            if flip {
                u32::MAX
            } else {
                0
            }
        };
        let ticks = vec![TickSource::Injected(Box::new(square))];
        match Orchestrator::start_with_ticks(&host(), &plan, &cfg, ticks) {
            Err(Error::Validation { procedure: 'B', .. }) => {}
            other => panic!("expected a validation failure, got {:?}", other.map(|_| ())),
        }
    }
}
