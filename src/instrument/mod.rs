//! Optional instrumentation hooks for single-opcode probes.

pub mod pmu;
pub mod regs;
