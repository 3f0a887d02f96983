//! 48-bit MAC address backed by its integer value.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Largest value a 48-bit MAC address can hold.
pub(crate) const MAC_MAX: u64 = (1 << 48) - 1;

/// A 48-bit Ethernet MAC address.
///
/// Allocation works on the integer value; the text form is only used at the
/// boundary (requests, logs and event payloads).
///
/// # Examples
///
/// ```
/// use netalloc_types::MacAddress;
///
/// let mac: MacAddress = "aa:bb:cc:00:00:01".parse().unwrap();
/// assert_eq!(mac.to_u64(), 0xaabbcc000001);
/// assert_eq!(MacAddress::from_u64(0xaabbcc000001), Some(mac));
///
/// // Hyphens work too
/// assert_eq!("AA-BB-CC-00-00-01".parse::<MacAddress>().unwrap(), mac);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress(u64);

impl MacAddress {
    /// Builds a MAC address from its integer value.
    ///
    /// Returns `None` if the value does not fit in 48 bits.
    pub fn from_u64(value: u64) -> Option<Self> {
        (value <= MAC_MAX).then_some(MacAddress(value))
    }

    pub fn to_u64(&self) -> u64 {
        self.0
    }

    /// The six octets, most significant first.
    pub fn octets(&self) -> [u8; 6] {
        let be = self.0.to_be_bytes();
        [be[2], be[3], be[4], be[5], be[6], be[7]]
    }

    /// Formats the address as upper-case colon-separated octets.
    pub fn to_upper_string(&self) -> String {
        self.to_string().to_uppercase()
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let octets = self.octets();
        for (i, octet) in octets.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02x}", octet)?;
        }
        Ok(())
    }
}

impl FromStr for MacAddress {
    type Err = ParseError;

    /// Accepts six one- or two-digit hex octets separated by `:` or `-`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseError::InvalidMacAddress(s.to_string());
        let separator = if s.contains(':') { ':' } else { '-' };

        let mut value = 0u64;
        let mut count = 0;
        for part in s.split(separator) {
            if part.is_empty() || part.len() > 2 {
                return Err(invalid());
            }
            let octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
            value = (value << 8) | u64::from(octet);
            count += 1;
        }
        if count != 6 {
            return Err(invalid());
        }
        Ok(MacAddress(value))
    }
}

impl TryFrom<String> for MacAddress {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> String {
        mac.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_both_separators() {
        let colon: MacAddress = "00:11:22:33:44:55".parse().unwrap();
        let hyphen: MacAddress = "00-11-22-33-44-55".parse().unwrap();
        assert_eq!(colon, hyphen);
        assert_eq!(colon.octets(), [0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
    }

    #[test]
    fn test_integer_bounds() {
        assert_eq!(MacAddress::from_u64(0).unwrap().to_string(), "00:00:00:00:00:00");
        assert_eq!(
            MacAddress::from_u64(MAC_MAX).unwrap().to_string(),
            "ff:ff:ff:ff:ff:ff"
        );
        assert_eq!(MacAddress::from_u64(1 << 48), None);
    }

    #[test]
    fn test_display_case() {
        let mac = MacAddress::from_u64(0xaabb_ccdd_eeff).unwrap();
        assert_eq!(mac.to_string(), "aa:bb:cc:dd:ee:ff");
        assert_eq!(mac.to_upper_string(), "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn test_short_octets_accepted() {
        let mac: MacAddress = "2:0:0:0:0:a".parse().unwrap();
        assert_eq!(mac.to_u64(), 0x0200_0000_000a);
    }

    #[test]
    fn test_invalid_format() {
        for text in [
            "invalid",
            "00:11:22:33:44",
            "00:11:22:33:44:55:66",
            "gg:11:22:33:44:55",
            "000:11:22:33:44:5",
            "00:11::33:44:55",
        ] {
            assert!(text.parse::<MacAddress>().is_err(), "{}", text);
        }
    }

    #[test]
    fn test_ordering_follows_integer_value() {
        let low = MacAddress::from_u64(0x0200_0000_0001).unwrap();
        let high = MacAddress::from_u64(0x0200_0000_0100).unwrap();
        assert!(low < high);
    }

    #[test]
    fn test_serde_as_string() {
        let mac: MacAddress = "aa:bb:cc:00:00:01".parse().unwrap();
        let s: String = mac.into();
        assert_eq!(s, "aa:bb:cc:00:00:01");
        assert_eq!(MacAddress::try_from(s).unwrap(), mac);
    }
}
