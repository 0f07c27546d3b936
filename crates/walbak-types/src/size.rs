use crate::error::{Result, WalbakError};
use crate::LOGICAL_BLOCK_SIZE;

/// Parse a size string with an optional binary suffix (k/m/g/t/p/e,
/// meaning 2^10 .. 2^60) into bytes.
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(WalbakError::BadRequest("empty size string".into()));
    }

    let (num_str, shift) = match s.as_bytes().last() {
        Some(b'K' | b'k') => (&s[..s.len() - 1], 10),
        Some(b'M' | b'm') => (&s[..s.len() - 1], 20),
        Some(b'G' | b'g') => (&s[..s.len() - 1], 30),
        Some(b'T' | b't') => (&s[..s.len() - 1], 40),
        Some(b'P' | b'p') => (&s[..s.len() - 1], 50),
        Some(b'E' | b'e') => (&s[..s.len() - 1], 60),
        _ => (s, 0),
    };

    let num: u64 = num_str
        .parse()
        .map_err(|_| WalbakError::BadRequest(format!("invalid size: '{s}'")))?;
    num.checked_shl(shift)
        .filter(|v| v >> shift == num)
        .ok_or_else(|| WalbakError::BadRequest(format!("size overflows: '{s}'")))
}

/// Parse a size string and convert from bytes to logical blocks,
/// enforcing inclusive bounds given in bytes.
pub fn parse_size_lb(s: &str, min_b: u64, max_b: u64) -> Result<u64> {
    let size_lb = parse_size(s)? / LOGICAL_BLOCK_SIZE as u64;
    let min_lb = min_b / LOGICAL_BLOCK_SIZE as u64;
    let max_lb = max_b / LOGICAL_BLOCK_SIZE as u64;
    if size_lb < min_lb {
        return Err(WalbakError::BadRequest(format!(
            "size too small: '{s}' (min {min_b} bytes)"
        )));
    }
    if size_lb > max_lb {
        return Err(WalbakError::BadRequest(format!(
            "size too large: '{s}' (max {max_b} bytes)"
        )));
    }
    Ok(size_lb)
}

/// Bulk sizes are bounded by what one data frame can carry.
pub fn parse_bulk_lb(s: &str) -> Result<u64> {
    parse_size_lb(
        s,
        LOGICAL_BLOCK_SIZE as u64,
        crate::MAX_BULK_LB * LOGICAL_BLOCK_SIZE as u64,
    )
}

pub fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1 << 10;
    const MIB: u64 = 1 << 20;
    const GIB: u64 = 1 << 30;

    if bytes >= GIB {
        format!("{:.2} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.2} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.2} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}
