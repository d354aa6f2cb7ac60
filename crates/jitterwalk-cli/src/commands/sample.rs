use std::fs::File;
use std::io::{self, Write};

use jitterwalk_core::{CollectorConfig, HostConfig, Orchestrator, TestPlan};

use super::CmdResult;

const CHUNK_BYTES: usize = 64 * 1024;

/// Collect `size` bytes of validated output into a file or onto stdout.
pub fn run(
    host: &HostConfig,
    size: &str,
    output: &str,
    tests: &str,
    cores: usize,
    raw: bool,
) -> CmdResult {
    let total = super::parse_runsize(size)?;
    if total == 0 && output != "-" {
        return Err("an unlimited run (--size 0) can only stream to stdout".into());
    }
    let plan = TestPlan::parse(tests)?;
    let cfg = CollectorConfig {
        raw_capture: raw,
        ..CollectorConfig::default()
    };

    let (tot, run) = plan.describe();
    log::info!(
        "collecting {} on {cores} core(s), startup tests [{tot}], continuous tests [{run}]",
        if total == 0 {
            "until interrupted".to_string()
        } else {
            format!("{total} bytes")
        }
    );
    let mut rng = Orchestrator::start(host, &plan, &cfg, cores)?;

    let stdout = io::stdout();
    let mut sink: Box<dyn Write> = if output == "-" {
        Box::new(stdout.lock())
    } else {
        Box::new(File::create(output)?)
    };

    let mut chunk = vec![0u8; CHUNK_BYTES];
    let mut written = 0u64;
    while total == 0 || written < total {
        let want = if total == 0 {
            CHUNK_BYTES
        } else {
            CHUNK_BYTES.min((total - written) as usize)
        };
        rng.read_bytes(&mut chunk[..want])?;
        if sink.write_all(&chunk[..want]).is_err() {
            // Reader went away; an unlimited run ends here.
            break;
        }
        written += want as u64;
    }
    let _ = sink.flush();

    if output != "-" {
        log::info!("wrote {written} bytes to {output}");
    }
    Ok(())
}
