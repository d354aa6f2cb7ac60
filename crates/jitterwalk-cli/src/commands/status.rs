use serde::Serialize;

use jitterwalk_core::{Engine, EngineOptions, EngineStatus, HostConfig, TickSource};

use super::CmdResult;

#[derive(Serialize)]
struct StatusDump<'a> {
    host: &'a HostConfig,
    engine: EngineStatus,
}

/// Probe, warm an engine up, and report what the tuner and the collection
/// loop settled on.
pub fn run(host: &HostConfig, json: bool) -> CmdResult {
    // A small fill is enough to exercise tuning and timing.
    let engine = Engine::new(
        host,
        EngineOptions {
            fill_words: 0x4000,
            raw_capture: false,
            tick: TickSource::Hardware,
        },
    )?;
    let status = engine.status();

    if json {
        let dump = StatusDump {
            host,
            engine: status,
        };
        println!("{}", serde_json::to_string_pretty(&dump)?);
        return Ok(());
    }

    println!("vendor: {}", host.vendor());
    println!(
        "cores: {} usable, {} online",
        host.usable_cores(),
        host.online.count()
    );
    for c in &host.caches {
        println!(
            "cache: L{} {} {} KB (sources {:#06x})",
            c.level, c.kind, c.size_kb, c.sources
        );
    }
    if host.generic() {
        println!("cache sizes are defaults; pass --icache/--dcache to correct them");
    }
    println!("{status}");
    Ok(())
}
