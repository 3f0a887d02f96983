//! MAC prefix range codec.
//!
//! Operators describe a MAC range as an OUI-style prefix such as
//! `AA:BB:CC/24` or `AA-BB-CC`. The allocator works on the integer bounds
//! `[first_address, last_address)` derived from it.

use crate::mac::MAC_MAX;
use crate::{MacAddress, ParseError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of hex digits in a full 48-bit MAC address.
const MAC_HEX_DIGITS: usize = 12;

/// Shortest accepted prefix (3 octets).
const MIN_PREFIX_DIGITS: usize = 6;

/// Longest accepted prefix without an explicit mask (5 octets).
const MAX_PREFIX_DIGITS: usize = 10;

/// A parsed MAC address range.
///
/// `last_address` is exclusive: the range holds
/// `last_address - first_address` addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MacRange {
    /// Canonical text form, e.g. `AA:BB:CC:00:00:00/24`.
    pub cidr: String,
    /// First address in the range.
    pub first_address: u64,
    /// One past the last address in the range.
    pub last_address: u64,
}

impl MacRange {
    /// Number of addresses in the range.
    pub fn capacity(&self) -> u64 {
        self.last_address - self.first_address
    }

    /// Returns true if the integer address falls inside the range.
    pub fn contains(&self, address: u64) -> bool {
        address >= self.first_address && address < self.last_address
    }
}

impl fmt::Display for MacRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.cidr)
    }
}

/// Parses MAC range text into its canonical form and integer bounds.
///
/// Accepted inputs are colon- or hyphen-delimited octets with an optional
/// `/<prefix-bits>` suffix. Without an explicit mask, the mask covers exactly
/// the supplied digits. A full 12-digit address is only accepted together
/// with a mask, which is what the canonical output looks like.
///
/// # Examples
///
/// ```
/// use netalloc_types::parse_mac_range;
///
/// let range = parse_mac_range("AA-BB-CC").unwrap();
/// assert_eq!(range.cidr, "AA:BB:CC:00:00:00/24");
/// assert_eq!(range.first_address, 0xAABBCC000000);
/// assert_eq!(range.last_address, 0xAABBCD000000);
///
/// // The canonical form parses back to itself.
/// assert_eq!(parse_mac_range(&range.cidr).unwrap(), range);
/// ```
pub fn parse_mac_range(text: &str) -> Result<MacRange, ParseError> {
    let invalid = || ParseError::InvalidMacRange(text.to_string());

    let (prefix, mask) = match text.split_once('/') {
        Some((prefix, mask)) => {
            let mask: u32 = mask.trim().parse().map_err(|_| invalid())?;
            (prefix, Some(mask))
        }
        None => (text, None),
    };

    let digits: String = prefix
        .trim()
        .chars()
        .filter(|c| *c != ':' && *c != '-')
        .collect();

    let length_ok = (MIN_PREFIX_DIGITS..=MAX_PREFIX_DIGITS).contains(&digits.len())
        || (digits.len() == MAC_HEX_DIGITS && mask.is_some());
    if !length_ok || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(invalid());
    }

    let pad = MAC_HEX_DIGITS - digits.len();
    // usize -> u32 is lossless here: pad is at most 6
    let mask = mask.unwrap_or(48 - 4 * pad as u32);
    if mask > 48 {
        return Err(invalid());
    }

    let padded = format!("{}{}", digits, "0".repeat(pad));
    let first = u64::from_str_radix(&padded, 16).map_err(|_| invalid())?;
    let size = 1u64 << (48 - mask);
    let last = first.checked_add(size).ok_or_else(invalid)?;
    if last > MAC_MAX + 1 {
        return Err(invalid());
    }

    let mac = MacAddress::from_u64(first).ok_or_else(invalid)?;
    Ok(MacRange {
        cidr: format!("{}/{}", mac.to_upper_string(), mask),
        first_address: first,
        last_address: last,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn expected_aabbcc() -> MacRange {
        MacRange {
            cidr: "AA:BB:CC:00:00:00/24".to_string(),
            first_address: 0xAABBCC000000,
            last_address: 0xAABBCD000000,
        }
    }

    #[test]
    fn test_cidr_format() {
        assert_eq!(parse_mac_range("AA:BB:CC/24").unwrap(), expected_aabbcc());
    }

    #[test]
    fn test_just_prefix() {
        assert_eq!(parse_mac_range("AA:BB:CC").unwrap(), expected_aabbcc());
    }

    #[test]
    fn test_hyphen_format() {
        assert_eq!(parse_mac_range("AA-BB-CC").unwrap(), expected_aabbcc());
        assert_eq!(parse_mac_range("AA-BB-CC/24").unwrap(), expected_aabbcc());
    }

    #[test]
    fn test_lower_case_input_is_canonicalised() {
        assert_eq!(parse_mac_range("aa:bb:cc").unwrap(), expected_aabbcc());
    }

    #[test]
    fn test_canonical_round_trip() {
        for text in ["AA:BB:CC", "02-00-00-10/32", "de:ad:be:ef:01", "AA:BB:CC/20"] {
            let parsed = parse_mac_range(text).unwrap();
            assert_eq!(parse_mac_range(&parsed.cidr).unwrap(), parsed, "{}", text);
        }
    }

    #[test]
    fn test_implicit_mask_tracks_prefix_length() {
        let range = parse_mac_range("02:00:00:00:01").unwrap();
        assert_eq!(range.cidr, "02:00:00:00:01:00/40");
        assert_eq!(range.capacity(), 256);
        assert!(range.contains(0x020000000100));
        assert!(range.contains(0x0200000001ff));
        assert!(!range.contains(0x020000000200));
    }

    #[test]
    fn test_explicit_mask_overrides_prefix_length() {
        let range = parse_mac_range("AA:BB:CC/28").unwrap();
        assert_eq!(range.cidr, "AA:BB:CC:00:00:00/28");
        assert_eq!(range.capacity(), 1 << 20);
    }

    #[test]
    fn test_prefix_too_short_fails() {
        assert!(matches!(
            parse_mac_range("AA-BB"),
            Err(ParseError::InvalidMacRange(_))
        ));
    }

    #[test]
    fn test_prefix_too_long_fails() {
        assert!(parse_mac_range("AA-BB-CC-DD-EE-F0").is_err());
    }

    #[test]
    fn test_garbage_fails() {
        assert!(parse_mac_range("F0-0-BAR").is_err());
        assert!(parse_mac_range("AA:BB:CC/abc").is_err());
        assert!(parse_mac_range("AA:BB:CC/49").is_err());
        assert!(parse_mac_range("").is_err());
    }

    #[test]
    fn test_range_past_48_bits_fails() {
        assert!(parse_mac_range("FF:FF:FF/8").is_err());
    }
}
