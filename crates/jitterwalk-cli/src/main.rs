//! CLI for jitterwalk - harvest entropy from CPU timing jitter.

mod commands;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "jitterwalk")]
#[command(about = "jitterwalk — harvest entropy from CPU timing jitter")]
#[command(version = jitterwalk_core::VERSION)]
struct Cli {
    /// Override the detected L1 instruction cache size, in KB
    #[arg(long, global = true)]
    icache: Option<String>,

    /// Override the detected L1 data cache size, in KB
    #[arg(long, global = true)]
    dcache: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the detected topology and collection loop tuning
    Status {
        /// Machine-readable JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Collect validated entropy into a file or to stdout
    Sample {
        /// Amount to collect, with an optional k/m/g/t suffix
        #[arg(long, default_value = "1m")]
        size: String,

        /// Output path; "-" streams to stdout
        #[arg(long, default_value = "-")]
        output: String,

        /// Online test configuration, e.g. "ta8b" or "tabwcb"
        #[arg(long, default_value = jitterwalk_core::DEFAULT_SPEC)]
        tests: String,

        /// Number of collection threads
        #[arg(long, default_value = "1")]
        cores: usize,

        /// Emit raw tick captures instead of mixed output
        #[arg(long)]
        raw: bool,
    },

    /// Run the startup test battery over a captured sample file
    Check {
        /// Sample file to audit
        input: String,

        /// Test configuration; only the startup section participates
        #[arg(long, default_value = jitterwalk_core::DEFAULT_SPEC)]
        tests: String,

        /// Machine-readable JSON report
        #[arg(long)]
        json: bool,
    },

    /// Keep the kernel entropy pool topped up (Linux only)
    Feed {
        /// Online test configuration
        #[arg(long, default_value = jitterwalk_core::DEFAULT_SPEC)]
        tests: String,

        /// Number of collection threads
        #[arg(long, default_value = "1")]
        cores: usize,

        /// Set the kernel's write wakeup threshold (bits) before feeding
        #[arg(long)]
        write_wakeup: Option<u32>,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let host = match commands::resolve_host(cli.icache.as_deref(), cli.dcache.as_deref()) {
        Ok(host) => host,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(2);
        }
    };

    let result = match cli.command {
        Commands::Status { json } => commands::status::run(&host, json),
        Commands::Sample {
            size,
            output,
            tests,
            cores,
            raw,
        } => commands::sample::run(&host, &size, &output, &tests, cores, raw),
        Commands::Check { input, tests, json } => commands::check::run(&input, &tests, json),
        Commands::Feed {
            tests,
            cores,
            write_wakeup,
        } => commands::feed::run(&host, &tests, cores, write_wakeup),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
