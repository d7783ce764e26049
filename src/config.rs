use crate::sandbox::DEFAULT_TIMEOUT_US;
use anyhow::Context;
use std::path::PathBuf;
use std::time::Duration;

/// Scan run configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Range file, one `[start, end)` interval per line.
    pub ranges: PathBuf,
    /// Output directory for the bitmap files.
    pub out_dir: PathBuf,
    /// Watchdog timeout per attempt, in microseconds.
    pub timeout_us: u64,
    /// CPU to pin the scanning thread to.
    pub cpu: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ranges: PathBuf::from("ranges.txt"),
            out_dir: PathBuf::from("output"),
            timeout_us: DEFAULT_TIMEOUT_US,
            cpu: None,
        }
    }
}

impl Config {
    pub fn check(&mut self) -> anyhow::Result<()> {
        let ranges = self
            .ranges
            .canonicalize()
            .context("failed to canonicalize path of range file")?;
        if !ranges.is_file() {
            anyhow::bail!("range file '{}' does not exist", self.ranges.display());
        }
        self.ranges = ranges;
        if self.timeout_us == 0 {
            anyhow::bail!("watchdog timeout must be nonzero");
        }
        if let Some(cpu) = self.cpu {
            let n = num_cpus();
            if cpu >= n {
                anyhow::bail!("cpu {} out of range, {} cpus online", cpu, n);
            }
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_micros(self.timeout_us)
    }

    pub fn exec_path(&self) -> PathBuf {
        self.out_dir.join("exec_bitmap.bin")
    }

    pub fn timeout_path(&self) -> PathBuf {
        self.out_dir.join("timeout_bitmap.bin")
    }
}

fn num_cpus() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n > 0 {
        n as usize
    } else {
        1
    }
}

/// Instrumentation selection for a single-opcode probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeMode {
    Plain,
    Regs,
    Pmu,
}

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub opcode: u32,
    pub timeout_us: u64,
    pub mode: ProbeMode,
}
