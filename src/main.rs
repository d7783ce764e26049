use env_logger::{Env, TimestampPrecision};
use opscan::config::{Config, ProbeConfig, ProbeMode};
use opscan::sandbox::DEFAULT_TIMEOUT_US;
use std::num::ParseIntError;
use std::path::PathBuf;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(about = "Hidden instruction scanner.")]
enum Settings {
    /// Scan opcode ranges and record per-range result bitmaps.
    Scan {
        /// Range file, one `[start, end)` interval per line.
        #[structopt(long, short = "r")]
        ranges: PathBuf,
        /// Directory to write the bitmap files.
        #[structopt(long, short = "o", default_value = "output")]
        out_dir: PathBuf,
        /// Watchdog timeout per opcode, in microseconds.
        #[structopt(long, short = "t")]
        timeout_us: Option<u64>,
        /// CPU to pin the scanning thread to.
        #[structopt(long, short = "c")]
        cpu: Option<usize>,
    },
    /// Execute a single opcode and report its outcome.
    Probe {
        /// Opcode to execute, decimal or 0x-hex.
        #[structopt(parse(try_from_str = parse_opcode))]
        opcode: u32,
        /// Dump the register diff of a clean execution.
        #[structopt(long)]
        regs: bool,
        /// Count retired loads and stores with the PMU.
        #[structopt(long, conflicts_with = "regs")]
        pmu: bool,
        /// Watchdog timeout, in microseconds.
        #[structopt(long, short = "t")]
        timeout_us: Option<u64>,
    },
}

fn parse_opcode(s: &str) -> Result<u32, ParseIntError> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        s.parse()
    }
}

fn main() -> anyhow::Result<()> {
    let settings = Settings::from_args();

    let log_env = Env::new()
        .filter_or("OPSCAN_LOG", "info")
        .default_write_style_or("auto");
    env_logger::Builder::from_env(log_env)
        .format_timestamp(Some(TimestampPrecision::Seconds))
        .init();

    match settings {
        Settings::Scan {
            ranges,
            out_dir,
            timeout_us,
            cpu,
        } => opscan::start(Config {
            ranges,
            out_dir,
            timeout_us: timeout_us.unwrap_or(DEFAULT_TIMEOUT_US),
            cpu,
        }),
        Settings::Probe {
            opcode,
            regs,
            pmu,
            timeout_us,
        } => opscan::probe(ProbeConfig {
            opcode,
            timeout_us: timeout_us.unwrap_or(DEFAULT_TIMEOUT_US),
            mode: if regs {
                ProbeMode::Regs
            } else if pmu {
                ProbeMode::Pmu
            } else {
                ProbeMode::Plain
            },
        }),
    }
}
