use serde::{Deserialize, Serialize};
use std::fmt;

/// Contiguous byte range `[offset, offset + length)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Extent {
    pub offset: u64,
    pub length: u64,
}

impl Extent {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}~{:#x}", self.offset, self.length)
    }
}

pub fn isp2(value: u64) -> bool {
    value != 0 && value & (value - 1) == 0
}

/// Rounds down to a multiple of `align`, which must be a power of two.
pub fn p2align(value: u64, align: u64) -> u64 {
    value & align.wrapping_neg()
}

/// Rounds up to a multiple of `align`, which must be a power of two.
pub fn p2roundup(value: u64, align: u64) -> u64 {
    (value.wrapping_neg() & align.wrapping_neg()).wrapping_neg()
}

/// Number of significant bits; `cbits(1) == 1`, `cbits(0) == 0`.
pub fn cbits(value: u64) -> u32 {
    u64::BITS - value.leading_zeros()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_of_two_helpers() {
        assert!(isp2(4096));
        assert!(!isp2(0));
        assert!(!isp2(12));
        assert_eq!(p2align(0x1fff, 0x1000), 0x1000);
        assert_eq!(p2roundup(0x1001, 0x1000), 0x2000);
        assert_eq!(p2roundup(0x1000, 0x1000), 0x1000);
        assert_eq!(p2roundup(0, 8), 0);
        assert_eq!(cbits(1), 1);
        assert_eq!(cbits(4), 3);
        assert_eq!(cbits(0), 0);
    }

    #[test]
    fn extent_display_is_hex() {
        assert_eq!(Extent::new(0x1000, 0x200).to_string(), "0x1000~0x200");
        assert_eq!(Extent::new(16, 4).end(), 20);
    }
}
