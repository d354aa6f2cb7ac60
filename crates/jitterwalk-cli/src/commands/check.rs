use std::fs;

use jitterwalk_tests::{check_buffer, Outcome};

use super::CmdResult;

/// Run the startup test battery over a previously captured sample file.
pub fn run(input: &str, tests: &str, json: bool) -> CmdResult {
    let bytes = fs::read(input)?;
    let words: Vec<u32> = bytes
        .chunks(4)
        .map(|c| {
            let mut w = [0u8; 4];
            w[..c.len()].copy_from_slice(c);
            u32::from_le_bytes(w)
        })
        .collect();

    let report = check_buffer(&words, tests)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("procedures: {}", report.procedures);
        println!("words: {}", report.words_supplied);
        match &report.outcome {
            Outcome::Passed => println!("result: pass"),
            Outcome::Failed { procedure } => println!("result: procedure {procedure} failed"),
            Outcome::NeedMoreData => println!("result: inconclusive, sample too small"),
        }
    }
    match report.outcome {
        Outcome::Passed => Ok(()),
        Outcome::Failed { procedure } => Err(format!("procedure {procedure} failed").into()),
        Outcome::NeedMoreData => Err("sample too small for the configured procedures".into()),
    }
}
