pub mod check;
pub mod feed;
pub mod sample;
pub mod status;

use jitterwalk_core::topology::{parse_cache_override, Tuner};
use jitterwalk_core::HostConfig;

pub type CmdResult = Result<(), Box<dyn std::error::Error>>;

/// Probe the host, honoring command line cache overrides.
pub fn resolve_host(
    icache: Option<&str>,
    dcache: Option<&str>,
) -> Result<HostConfig, jitterwalk_core::Error> {
    let icache_kb = icache.map(parse_cache_override).transpose()?;
    let dcache_kb = dcache.map(parse_cache_override).transpose()?;
    Ok(Tuner::default().tune(icache_kb, dcache_kb))
}

/// Parse a byte count with an optional k/m/g/t binary suffix. Zero means
/// "unlimited" and is only meaningful when streaming to stdout.
pub fn parse_runsize(input: &str) -> Result<u64, String> {
    let s = input.trim();
    let (digits, mult) = match s.chars().next_back() {
        Some(c) if c.is_ascii_alphabetic() => {
            let mult = match c.to_ascii_lowercase() {
                'k' => 1u64 << 10,
                'm' => 1u64 << 20,
                'g' => 1u64 << 30,
                't' => 1u64 << 40,
                _ => return Err(format!("unknown size suffix '{c}' in \"{input}\"")),
            };
            (&s[..s.len() - 1], mult)
        }
        _ => (s, 1),
    };
    let n: u64 = digits
        .parse()
        .map_err(|_| format!("invalid size \"{input}\""))?;
    let bytes = n
        .checked_mul(mult)
        .ok_or_else(|| format!("size \"{input}\" overflows"))?;
    if bytes > 16 << 40 {
        return Err(format!("size \"{input}\" is out of range (at most 16t)"));
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::parse_runsize;

    #[test]
    fn runsize_accepts_suffixes() {
        assert_eq!(parse_runsize("1024").unwrap(), 1024);
        assert_eq!(parse_runsize("4k").unwrap(), 4096);
        assert_eq!(parse_runsize("2M").unwrap(), 2 << 20);
        assert_eq!(parse_runsize("1g").unwrap(), 1 << 30);
        assert_eq!(parse_runsize("16t").unwrap(), 16 << 40);
        assert_eq!(parse_runsize(" 8k ").unwrap(), 8192);
    }

    #[test]
    fn runsize_treats_zero_as_unlimited() {
        assert_eq!(parse_runsize("0").unwrap(), 0);
    }

    #[test]
    fn runsize_rejects_nonsense() {
        assert!(parse_runsize("17t").is_err());
        assert!(parse_runsize("12q").is_err());
        assert!(parse_runsize("k").is_err());
        assert!(parse_runsize("-3").is_err());
        assert!(parse_runsize("").is_err());
    }
}
