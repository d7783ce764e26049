//! Opcode range input parsing.
//!
//! Range files contain one half-open interval per line, `[<start>, <end>)`,
//! with decimal or `0x` hex bounds. Unparsable lines are skipped, matching
//! the tolerant line loop of the original screening worker.

use std::fs::read_to_string;
use std::io;
use std::path::Path;

/// Parse one range line. Returns `None` for blank lines, comments and
/// anything that does not look like `[start, end)`.
pub fn parse_line(line: &str) -> Option<(u32, u32)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let inner = line
        .strip_prefix('[')?
        .strip_suffix(')')
        .or_else(|| line.strip_prefix('[')?.strip_suffix(']'))?;
    let mut parts = inner.splitn(2, ',');
    let start = parse_u32(parts.next()?)?;
    let end = parse_u32(parts.next()?)?;
    Some((start, end))
}

fn parse_u32(s: &str) -> Option<u32> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

/// Load all ranges from `path`, warning about lines that parse but are
/// empty or inverted. The caller gets them in file order.
pub fn load(path: &Path) -> io::Result<Vec<(u32, u32)>> {
    let content = read_to_string(path)?;
    let mut ranges = Vec::new();
    for (no, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        match parse_line(line) {
            Some((start, end)) if end > start => ranges.push((start, end)),
            Some((start, end)) => {
                log::warn!("{}:{}: empty range [{}, {}), skipped", path.display(), no + 1, start, end);
            }
            None => {
                log::warn!("{}:{}: unparsable range line, skipped", path.display(), no + 1);
            }
        }
    }
    Ok(ranges)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_decimal() {
        assert_eq!(parse_line("[0, 4096)"), Some((0, 4096)));
        assert_eq!(parse_line("  [17, 42)  "), Some((17, 42)));
    }

    #[test]
    fn parse_hex() {
        assert_eq!(parse_line("[0x1000, 0x1010)"), Some((0x1000, 0x1010)));
        assert_eq!(parse_line("[0XE5900000, 0xE5900010)"), Some((0xE590_0000, 0xE590_0010)));
    }

    #[test]
    fn parse_bracket_close() {
        // The original worker wrote `[a, b]`; both suffixes are accepted.
        assert_eq!(parse_line("[1, 2]"), Some((1, 2)));
    }

    #[test]
    fn reject_garbage() {
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("# comment"), None);
        assert_eq!(parse_line("1, 2"), None);
        assert_eq!(parse_line("[1 2)"), None);
        assert_eq!(parse_line("[x, y)"), None);
    }
}
