//! Minimal IPv4 CIDR parsing and host iteration for the network scanner.
//! No crate in the example pack covers this narrow a need, so it is
//! implemented directly against `std::net::Ipv4Addr`.

use std::net::Ipv4Addr;

use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr4 {
    base: u32,
    prefix_len: u8,
}

impl Cidr4 {
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let (addr_part, prefix_part) = s
            .split_once('/')
            .ok_or_else(|| CoreError::InvalidInput(format!("missing prefix length in '{s}'")))?;
        let addr: Ipv4Addr = addr_part
            .parse()
            .map_err(|_| CoreError::InvalidInput(format!("invalid IPv4 address '{addr_part}'")))?;
        let prefix_len: u8 = prefix_part
            .parse()
            .map_err(|_| CoreError::InvalidInput(format!("invalid prefix length '{prefix_part}'")))?;
        if prefix_len > 32 {
            return Err(CoreError::InvalidInput(format!("prefix length out of range: {prefix_len}")));
        }
        Ok(Cidr4 {
            base: u32::from(addr),
            prefix_len,
        })
    }

    fn mask(&self) -> u32 {
        if self.prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix_len)
        }
    }

    pub fn network(&self) -> u32 {
        self.base & self.mask()
    }

    /// Number of addresses covered by this range. Returned as `u64`
    /// because `/0` covers 2^32 addresses, one past `u32::MAX`.
    pub fn host_count(&self) -> u64 {
        if self.prefix_len == 0 {
            1u64 << 32
        } else {
            1u64 << (32 - self.prefix_len)
        }
    }

    /// Iterate every address in the range, including network/broadcast
    /// addresses for small prefixes — the scanner treats each as a
    /// candidate host to probe regardless.
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        let network = self.network();
        let count = self.host_count();
        (0..count).map(move |i| Ipv4Addr::from(network.wrapping_add(i as u32)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_slash_24() {
        let c = Cidr4::parse("192.168.1.0/24").unwrap();
        assert_eq!(c.host_count(), 256);
        let hosts: Vec<_> = c.hosts().collect();
        assert_eq!(hosts.first().unwrap().to_string(), "192.168.1.0");
        assert_eq!(hosts.last().unwrap().to_string(), "192.168.1.255");
    }

    #[test]
    fn rejects_missing_prefix() {
        assert!(Cidr4::parse("192.168.1.0").is_err());
    }

    #[test]
    fn rejects_bad_prefix() {
        assert!(Cidr4::parse("192.168.1.0/99").is_err());
    }

    #[test]
    fn slash_zero_does_not_overflow_shift() {
        let c = Cidr4::parse("0.0.0.0/0").unwrap();
        assert_eq!(c.host_count(), 1u64 << 32);
        assert_eq!(c.hosts().next().unwrap().to_string(), "0.0.0.0");
    }
}
