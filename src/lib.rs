//! Hidden instruction scanning.
//!
//! Executes raw 32-bit opcodes in-process inside a self-healing sandbox and
//! records which ones complete, fault or hang, one result bitmap per
//! requested opcode range.

#[macro_use]
extern crate lazy_static;

pub mod bitmap;
pub mod config;
pub mod instrument;
pub mod ranges;
pub mod sandbox;
pub mod scan;
pub mod util;

use crate::{
    bitmap::RangeBitmap,
    config::{Config, ProbeConfig, ProbeMode},
    instrument::{
        pmu::{init_memory_monitor, CounterHook},
        regs::RegDiffHook,
    },
    sandbox::{ExecOutcome, NopHook, Sandbox},
    scan::ScanStats,
    util::stop_req,
};
use anyhow::Context;
use std::{
    fs::{create_dir_all, OpenOptions},
    io::{BufWriter, Write},
    os::raw::c_int,
    time::{Duration, Instant},
};

/// Scan every range in the config's range file and write the result
/// bitmaps.
pub fn start(mut config: Config) -> anyhow::Result<()> {
    config.check().context("config error")?;

    if let Some(core) = config.cpu {
        scan::pin_to_cpu(core)
            .with_context(|| format!("failed to pin scan thread to cpu {}", core))?;
        log::info!("pinned to cpu {}, address space locked", core);
    }
    setup_signal_handler();

    let ranges = ranges::load(&config.ranges)
        .with_context(|| format!("failed to load range file '{}'", config.ranges.display()))?;
    if ranges.is_empty() {
        anyhow::bail!("range file '{}' contains no usable ranges", config.ranges.display());
    }
    log::info!("{} ranges loaded, timeout {}us", ranges.len(), config.timeout_us);

    if !config.out_dir.exists() {
        create_dir_all(&config.out_dir).context("failed to create output directory")?;
    }
    let mut exec_out = BufWriter::new(
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(config.exec_path())
            .context("failed to open exec bitmap file")?,
    );
    let mut timeout_out = BufWriter::new(
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(config.timeout_path())
            .context("failed to open timeout bitmap file")?,
    );

    let mut sandbox = Sandbox::new(config.timeout()).context("failed to set up sandbox")?;
    let stats = ScanStats::new();
    let start = Instant::now();
    let mut timeout_records = 0u64;

    for &(lo, hi) in &ranges {
        let mut bitmap = match RangeBitmap::new(lo, hi) {
            Ok(bm) => bm,
            Err(e) => {
                log::warn!("skipping range: {}", e);
                continue;
            }
        };
        let completed = scan_one_range(&mut sandbox, &mut bitmap, &stats)?;
        if bitmap
            .flush(&mut exec_out, &mut timeout_out)
            .context("failed to flush range bitmap")?
        {
            timeout_records += 1;
        }
        log::info!("[{:#010x}, {:#010x}) done", lo, hi);
        stats.report();
        if !completed {
            log::warn!("stop requested, scan aborted mid-range");
            break;
        }
    }

    exec_out.flush().context("failed to flush exec bitmap file")?;
    timeout_out
        .flush()
        .context("failed to flush timeout bitmap file")?;
    log::info!(
        "all done in {:?}: {} opcodes tested, {} ranges with timeouts",
        start.elapsed(),
        stats.tested(),
        timeout_records
    );
    Ok(())
}

fn scan_one_range(
    sandbox: &mut Sandbox,
    bitmap: &mut RangeBitmap,
    stats: &ScanStats,
) -> anyhow::Result<bool> {
    scan::scan_range(sandbox, bitmap, stats).with_context(|| {
        format!(
            "sandbox failure in range [{:#x}, {:#x})",
            bitmap.start(),
            bitmap.end()
        )
    })
}

/// Execute a single opcode with the selected instrumentation and print
/// what happened.
pub fn probe(config: ProbeConfig) -> anyhow::Result<()> {
    let mut sandbox =
        Sandbox::new(Duration::from_micros(config.timeout_us)).context("failed to set up sandbox")?;

    let outcome = match config.mode {
        ProbeMode::Plain => sandbox.run(config.opcode, &mut NopHook)?,
        ProbeMode::Regs => {
            let mut hook = RegDiffHook::new();
            let outcome = sandbox.run(config.opcode, &mut hook)?;
            if outcome.is_clean() {
                let diff = hook.before.diff(&hook.after);
                if diff.is_empty() {
                    println!("no register changes");
                }
                for (name, before, after) in diff {
                    println!("{:>6}: {:#x} -> {:#x}", name, before, after);
                }
            }
            outcome
        }
        ProbeMode::Pmu => {
            let mut counters = init_memory_monitor();
            if !counters.available() {
                log::warn!("no PMU counter available, counts will read zero");
            }
            let mut hook = CounterHook::new(&mut counters);
            let outcome = sandbox.run(config.opcode, &mut hook)?;
            println!("{}", hook.result);
            outcome
        }
    };

    match outcome {
        ExecOutcome::Clean => println!("{:#010x}: executed", config.opcode),
        ExecOutcome::TimedOut => println!("{:#010x}: timed out", config.opcode),
        ExecOutcome::Faulted(_) => println!(
            "{:#010x}: faulted with {}",
            config.opcode,
            outcome.signal_name().unwrap_or("<unknown>"),
        ),
    }
    Ok(())
}

fn setup_signal_handler() {
    use signal_hook::consts::TERM_SIGNALS;
    use signal_hook::iterator::exfiltrator::WithOrigin;
    use signal_hook::iterator::SignalsInfo;

    fn named_signal(sig: c_int) -> String {
        signal_hook::low_level::signal_name(sig)
            .map(|n| format!("{}({})", n, sig))
            .unwrap_or_else(|| sig.to_string())
    }

    std::thread::spawn(move || {
        let mut signals = SignalsInfo::<WithOrigin>::new(TERM_SIGNALS).unwrap();

        let info = signals.into_iter().next().unwrap();
        let from = if let Some(p) = info.process {
            format!("(pid: {}, uid: {})", p.pid, p.uid)
        } else {
            "unknown".to_string()
        };
        log::info!(
            "{} recved, from: {}, cause: {:?}",
            named_signal(info.signal),
            from,
            info.cause
        );
        println!("finishing current range before exit...");

        stop_req();
    });
}
