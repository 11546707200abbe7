#![forbid(unsafe_code)]
//! Core types shared across the vramfs workspace.
//!
//! Block-offset arithmetic, the device buffer identifier, and parsing of
//! the mount-time pool size argument.

use std::fmt;
use thiserror::Error;

/// Size of one device buffer in bytes.
///
/// Nicely fits FUSE read/write transfer sizes; file content is split into
/// buffers of exactly this size, keyed by block-aligned file offset.
pub const BLOCK_SIZE: usize = 128 * 1024;

/// `BLOCK_SIZE` as a `u64` for offset math.
pub const BLOCK_SIZE_U64: u64 = BLOCK_SIZE as u64;

/// Identifier of a single device buffer.
///
/// Handed out by the device backend at allocation time and used as the
/// ticket that travels between the pool free list and live blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferId(pub u64);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Round a byte offset down to the start of its block.
#[must_use]
pub fn block_start(offset: u64) -> u64 {
    (offset / BLOCK_SIZE_U64) * BLOCK_SIZE_U64
}

/// Number of whole blocks needed to hold `bytes`.
#[must_use]
pub fn blocks_spanning(bytes: u64) -> u64 {
    bytes.div_ceil(BLOCK_SIZE_U64)
}

/// Round a byte count up to a whole number of blocks.
///
/// Returns `None` on overflow.
#[must_use]
pub fn round_up_to_block(bytes: u64) -> Option<u64> {
    blocks_spanning(bytes).checked_mul(BLOCK_SIZE_U64)
}

/// Error returned by [`parse_byte_size`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SizeParseError {
    #[error("empty size")]
    Empty,
    #[error("invalid number in size: {0:?}")]
    InvalidNumber(String),
    #[error("unknown size suffix: {0:?}")]
    UnknownSuffix(String),
    #[error("size overflows u64")]
    Overflow,
}

/// Parse a byte count with an optional unit suffix.
///
/// Single-letter suffixes (`K`, `M`, `G`) are powers of two; two-letter
/// suffixes (`KB`, `MB`, `GB`) are powers of ten. Suffixes are matched
/// case-insensitively; a bare number is taken as bytes.
pub fn parse_byte_size(input: &str) -> Result<u64, SizeParseError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(SizeParseError::Empty);
    }

    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let (digits, suffix) = input.split_at(split);

    let value: u64 = digits
        .parse()
        .map_err(|_| SizeParseError::InvalidNumber(input.to_owned()))?;

    let multiplier: u64 = match suffix.to_ascii_uppercase().as_str() {
        "" => 1,
        "K" => 1 << 10,
        "KB" => 1_000,
        "M" => 1 << 20,
        "MB" => 1_000_000,
        "G" => 1 << 30,
        "GB" => 1_000_000_000,
        other => return Err(SizeParseError::UnknownSuffix(other.to_owned())),
    };

    value
        .checked_mul(multiplier)
        .ok_or(SizeParseError::Overflow)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_start_rounds_down() {
        assert_eq!(block_start(0), 0);
        assert_eq!(block_start(1), 0);
        assert_eq!(block_start(BLOCK_SIZE_U64 - 1), 0);
        assert_eq!(block_start(BLOCK_SIZE_U64), BLOCK_SIZE_U64);
        assert_eq!(block_start(BLOCK_SIZE_U64 + 1), BLOCK_SIZE_U64);
        assert_eq!(block_start(3 * BLOCK_SIZE_U64 + 77), 3 * BLOCK_SIZE_U64);
    }

    #[test]
    fn blocks_spanning_is_ceiling() {
        assert_eq!(blocks_spanning(0), 0);
        assert_eq!(blocks_spanning(1), 1);
        assert_eq!(blocks_spanning(BLOCK_SIZE_U64), 1);
        assert_eq!(blocks_spanning(BLOCK_SIZE_U64 + 1), 2);
        assert_eq!(blocks_spanning(8 * BLOCK_SIZE_U64), 8);
    }

    #[test]
    fn round_up_to_block_boundaries() {
        assert_eq!(round_up_to_block(0), Some(0));
        assert_eq!(round_up_to_block(100), Some(BLOCK_SIZE_U64));
        assert_eq!(round_up_to_block(BLOCK_SIZE_U64), Some(BLOCK_SIZE_U64));
        assert_eq!(
            round_up_to_block(BLOCK_SIZE_U64 + 1),
            Some(2 * BLOCK_SIZE_U64)
        );
        assert_eq!(round_up_to_block(u64::MAX), None);
    }

    #[test]
    fn parse_plain_bytes() {
        assert_eq!(parse_byte_size("0"), Ok(0));
        assert_eq!(parse_byte_size("4096"), Ok(4096));
    }

    #[test]
    fn parse_binary_suffixes() {
        assert_eq!(parse_byte_size("1K"), Ok(1024));
        assert_eq!(parse_byte_size("2M"), Ok(2 * 1024 * 1024));
        assert_eq!(parse_byte_size("4G"), Ok(4 * 1024 * 1024 * 1024));
        assert_eq!(parse_byte_size("1k"), Ok(1024));
    }

    #[test]
    fn parse_decimal_suffixes() {
        assert_eq!(parse_byte_size("1KB"), Ok(1000));
        assert_eq!(parse_byte_size("2MB"), Ok(2_000_000));
        assert_eq!(parse_byte_size("3GB"), Ok(3_000_000_000));
        assert_eq!(parse_byte_size("3gb"), Ok(3_000_000_000));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!(parse_byte_size(""), Err(SizeParseError::Empty));
        assert!(matches!(
            parse_byte_size("12T"),
            Err(SizeParseError::UnknownSuffix(_))
        ));
        assert!(matches!(
            parse_byte_size("M"),
            Err(SizeParseError::InvalidNumber(_))
        ));
        assert!(matches!(
            parse_byte_size("1.5G"),
            Err(SizeParseError::UnknownSuffix(_))
        ));
    }

    #[test]
    fn parse_overflow() {
        assert_eq!(
            parse_byte_size("18446744073709551615G"),
            Err(SizeParseError::Overflow)
        );
    }
}
