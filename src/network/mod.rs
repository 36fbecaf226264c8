//! Network module for packet crafting, raw sockets and the probe transport

pub mod packet;
pub mod protocol;
pub mod socket;
pub mod transport;

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

pub use transport::{PacketTransport, RawTransport, RawTransportFactory, TransportFactory};

/// Address family of a target
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => AddressFamily::V4,
            IpAddr::V6(_) => AddressFamily::V6,
        }
    }

    /// Number of bytes in an address of this family
    pub fn address_len(&self) -> usize {
        match self {
            AddressFamily::V4 => 4,
            AddressFamily::V6 => 16,
        }
    }

    /// Largest address of this family as an integer
    pub fn max_value(&self) -> u128 {
        match self {
            AddressFamily::V4 => u32::MAX as u128,
            AddressFamily::V6 => u128::MAX,
        }
    }

    /// Number of bits in an address of this family
    pub fn bits(&self) -> u8 {
        match self {
            AddressFamily::V4 => 32,
            AddressFamily::V6 => 128,
        }
    }

    /// Convert an integer back into an address of this family
    pub fn addr_from_u128(&self, value: u128) -> IpAddr {
        match self {
            AddressFamily::V4 => IpAddr::V4(Ipv4Addr::from(value as u32)),
            AddressFamily::V6 => IpAddr::V6(Ipv6Addr::from(value)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AddressFamily::V4 => "IPv4",
            AddressFamily::V6 => "IPv6",
        }
    }
}

impl std::fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Integer form of an address, used for range arithmetic
pub fn addr_to_u128(addr: &IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => u32::from(*v4) as u128,
        IpAddr::V6(v6) => u128::from(*v6),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_integer_round_trip() {
        let v4: IpAddr = "10.0.0.255".parse().unwrap();
        let v6: IpAddr = "2001:db8::ff".parse().unwrap();

        assert_eq!(AddressFamily::V4.addr_from_u128(addr_to_u128(&v4)), v4);
        assert_eq!(AddressFamily::V6.addr_from_u128(addr_to_u128(&v6)), v6);
        assert_eq!(AddressFamily::of(&v6).address_len(), 16);
    }
}
