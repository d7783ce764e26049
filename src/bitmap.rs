//! Per-range result bitmaps.
//!
//! Every scanned range gets two bit arrays over its opcodes: one marking
//! opcodes that completed without a fault, one marking opcodes the watchdog
//! had to interrupt. An opcode marked in neither array faulted (or was never
//! reached before an abort, which the on-disk format does not distinguish).

use std::io::{self, Write};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BitmapError {
    #[error("empty opcode range [{0:#x}, {1:#x})")]
    EmptyRange(u32, u32),
}

/// Result bitmap for one half-open opcode range `[start, end)`.
#[derive(Debug, Clone)]
pub struct RangeBitmap {
    start: u32,
    end: u32,
    exec: Vec<u8>,
    timeout: Vec<u8>,
    timeouts: u64,
}

impl RangeBitmap {
    pub fn new(start: u32, end: u32) -> Result<Self, BitmapError> {
        if end <= start {
            return Err(BitmapError::EmptyRange(start, end));
        }
        let bits = end - start;
        let bytes = (bits as usize + 7) / 8;
        Ok(Self {
            start,
            end,
            exec: vec![0; bytes],
            timeout: vec![0; bytes],
            timeouts: 0,
        })
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    /// Number of opcodes covered, `end - start`.
    pub fn bits(&self) -> u32 {
        self.end - self.start
    }

    /// Mark `opcode` as having executed cleanly. Out-of-range marks are
    /// ignored so hook code can report speculatively.
    pub fn mark_exec(&mut self, opcode: u32) {
        if let Some((byte, bit)) = self.index(opcode) {
            self.exec[byte] |= 1 << bit;
        }
    }

    /// Mark `opcode` as interrupted by the watchdog.
    pub fn mark_timeout(&mut self, opcode: u32) {
        if let Some((byte, bit)) = self.index(opcode) {
            if self.timeout[byte] & (1 << bit) == 0 {
                self.timeout[byte] |= 1 << bit;
                self.timeouts += 1;
            }
        }
    }

    pub fn executed(&self, opcode: u32) -> bool {
        self.index(opcode)
            .map(|(byte, bit)| self.exec[byte] & (1 << bit) != 0)
            .unwrap_or(false)
    }

    pub fn timed_out(&self, opcode: u32) -> bool {
        self.index(opcode)
            .map(|(byte, bit)| self.timeout[byte] & (1 << bit) != 0)
            .unwrap_or(false)
    }

    /// True if at least one opcode in the range timed out.
    pub fn has_timeout_data(&self) -> bool {
        self.timeouts != 0
    }

    fn index(&self, opcode: u32) -> Option<(usize, u32)> {
        if opcode < self.start || opcode >= self.end {
            return None;
        }
        let off = opcode - self.start;
        Some(((off / 8) as usize, off % 8))
    }

    /// Append this range's records to the two output streams.
    ///
    /// Each record is a 12-byte header (`start`, `end`, `byte_size` as
    /// little-endian `u32`) followed by `byte_size` packed bytes. The exec
    /// record is always written; the timeout record only when the range
    /// saw at least one timeout. Returns whether a timeout record was
    /// written.
    pub fn flush<W: Write, T: Write>(&self, exec_out: &mut W, timeout_out: &mut T) -> io::Result<bool> {
        write_record(exec_out, self.start, self.end, &self.exec)?;
        if self.has_timeout_data() {
            write_record(timeout_out, self.start, self.end, &self.timeout)?;
            return Ok(true);
        }
        Ok(false)
    }
}

fn write_record<W: Write>(out: &mut W, start: u32, end: u32, bits: &[u8]) -> io::Result<()> {
    out.write_all(&start.to_le_bytes())?;
    out.write_all(&end.to_le_bytes())?;
    out.write_all(&(bits.len() as u32).to_le_bytes())?;
    out.write_all(bits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reject_empty_range() {
        assert_eq!(RangeBitmap::new(8, 8).unwrap_err(), BitmapError::EmptyRange(8, 8));
        assert_eq!(RangeBitmap::new(8, 4).unwrap_err(), BitmapError::EmptyRange(8, 4));
    }

    #[test]
    fn mark_and_query() {
        let mut bm = RangeBitmap::new(0x100, 0x110).unwrap();
        bm.mark_exec(0x100);
        bm.mark_exec(0x10f);
        bm.mark_timeout(0x105);
        assert!(bm.executed(0x100));
        assert!(bm.executed(0x10f));
        assert!(!bm.executed(0x101));
        assert!(bm.timed_out(0x105));
        assert!(!bm.executed(0x105));
        assert!(bm.has_timeout_data());
    }

    #[test]
    fn out_of_range_marks_ignored() {
        let mut bm = RangeBitmap::new(0x100, 0x110).unwrap();
        bm.mark_exec(0xff);
        bm.mark_exec(0x110);
        bm.mark_timeout(0x1000);
        assert!(!bm.has_timeout_data());
        assert!(bm.exec.iter().all(|&b| b == 0));
    }

    #[test]
    fn flush_record_layout() {
        let mut bm = RangeBitmap::new(0, 16).unwrap();
        bm.mark_exec(0);
        bm.mark_exec(9);
        let (mut exec, mut timeout) = (Vec::new(), Vec::new());
        let wrote_timeout = bm.flush(&mut exec, &mut timeout).unwrap();
        assert!(!wrote_timeout);
        assert!(timeout.is_empty());
        // 12-byte header then two packed bytes. The third header field is
        // the byte count of the bit array, not the opcode count.
        assert_eq!(exec.len(), 14);
        assert_eq!(&exec[0..4], &0u32.to_le_bytes());
        assert_eq!(&exec[4..8], &16u32.to_le_bytes());
        assert_eq!(&exec[8..12], &2u32.to_le_bytes());
        assert_eq!(exec[12], 0b0000_0001);
        assert_eq!(exec[13], 0b0000_0010);
    }

    #[test]
    fn timeout_record_only_when_marked() {
        let mut bm = RangeBitmap::new(0, 8).unwrap();
        bm.mark_timeout(3);
        let (mut exec, mut timeout) = (Vec::new(), Vec::new());
        assert!(bm.flush(&mut exec, &mut timeout).unwrap());
        assert_eq!(timeout.len(), 13);
        assert_eq!(&timeout[8..12], &1u32.to_le_bytes());
        assert_eq!(timeout[12], 1 << 3);
    }

    #[test]
    fn byte_size_rounds_up() {
        let bm = RangeBitmap::new(0, 13).unwrap();
        let (mut exec, mut timeout) = (Vec::new(), Vec::new());
        bm.flush(&mut exec, &mut timeout).unwrap();
        // 13 opcodes pack into 2 bytes; the header says so.
        assert_eq!(exec.len(), 12 + 2);
        assert_eq!(&exec[8..12], &2u32.to_le_bytes());
    }
}
