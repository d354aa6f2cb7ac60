//! # jitterwalk-core
//!
//! **Your CPU's timing jitter is an entropy source.**
//!
//! `jitterwalk-core` harvests unpredictable bits from the flutter of hardware
//! tick counters observed across deliberately cache- and branch-hostile code.
//! The collection engine walks a data cache sized table under a chain of
//! data-dependent branches, so every pass soaks up the accumulated state of
//! the branch predictors, TLBs and cache hierarchy. The resulting 32-bit
//! words are validated online with the AIS-31 statistical procedures before
//! they are released.
//!
//! ## Quick Start
//!
//! ```no_run
//! use jitterwalk_core::{CollectorConfig, Orchestrator, TestPlan, Tuner};
//!
//! # fn main() -> jitterwalk_core::Result<()> {
//! // Probe the host cache topology and start one collector per request.
//! let host = Tuner::default().tune(None, None);
//! let plan = TestPlan::parse(jitterwalk_core::DEFAULT_SPEC)?;
//! let mut rng = Orchestrator::start(&host, &plan, &CollectorConfig::default(), 1)?;
//!
//! let mut seed = [0u8; 64];
//! rng.read_bytes(&mut seed)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! Topology probe → collection engine(s) → AIS-31 harness → output
//!
//! - [`topology`] sizes the engine to the host's L1 instruction and data
//!   caches (CPUID on x86, sysfs/procfs elsewhere, conservative defaults as
//!   a last resort).
//! - [`engine`] is the collection loop itself, tuned so its active code just
//!   overflows the instruction cache.
//! - [`ais`] implements the AIS-31 Procedure A and Procedure B test batteries
//!   with the retry and discard semantics the procedures prescribe.
//! - [`orchestrator`] runs one engine per core and assembles their output
//!   through a round-robin hand-off chain.

pub mod ais;
pub mod engine;
pub mod error;
pub mod orchestrator;
pub mod topology;

pub use ais::{Harness, Meters, TestPlan, DEFAULT_SPEC};
pub use engine::{Engine, EngineOptions, EngineStatus, TickSource};
pub use error::{Error, Result, TestScope};
pub use orchestrator::{CollectorConfig, Orchestrator};
pub use topology::{CacheDesc, CacheKind, CpuSet, HostConfig, Tuner};

/// Crate version, as reported by the command line tools.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
