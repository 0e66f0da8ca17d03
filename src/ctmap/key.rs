//! Connection-tracking keys.
//!
//! The dataplane keeps separate tables per address family, so a key read from a
//! table is either a [`CtKey4`] or a [`CtKey6`]. Both expose the same [`FlowKey`]
//! view so that matching logic is written once.

use super::kind::Family;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// IANA protocol number for TCP.
pub const IPPROTO_TCP: u8 = 6;
/// IANA protocol number for UDP.
pub const IPPROTO_UDP: u8 = 17;

/// Direction/zone discriminator stored in the key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TupleFlags(u8);

impl TupleFlags {
    /// Egress tuple.
    pub const OUT: Self = Self(0);
    /// Ingress tuple.
    pub const IN: Self = Self(1);
    /// Related flow (e.g. ICMP error for an existing flow).
    pub const RELATED: Self = Self(2);
    /// Service (load-balancer) tuple.
    pub const SERVICE: Self = Self(4);

    /// Wraps raw bits as read from the map.
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Returns the raw bits.
    pub const fn bits(self) -> u8 {
        self.0
    }
}

/// Family-neutral 5-tuple of a flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowTuple {
    /// Source address.
    pub source_addr: IpAddr,
    /// Destination address.
    pub dest_addr: IpAddr,
    /// Source port (zero for port-less protocols).
    pub source_port: u16,
    /// Destination port (zero for port-less protocols).
    pub dest_port: u16,
    /// IP protocol number.
    pub protocol: u8,
}

impl FlowTuple {
    /// Returns the address family of the tuple, or `None` if source and destination
    /// belong to different families.
    pub fn family(&self) -> Option<Family> {
        match (self.source_addr, self.dest_addr) {
            (IpAddr::V4(_), IpAddr::V4(_)) => Some(Family::Ipv4),
            (IpAddr::V6(_), IpAddr::V6(_)) => Some(Family::Ipv6),
            _ => None,
        }
    }
}

impl fmt::Display for FlowTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}:{} -> {}:{}",
            self.protocol, self.source_addr, self.source_port, self.dest_addr, self.dest_port
        )
    }
}

/// Read-only flow identity shared by all key variants.
pub trait FlowKey {
    /// Address family of the table the key belongs to.
    const FAMILY: Family;

    /// Returns the 5-tuple stored in the key.
    fn tuple(&self) -> FlowTuple;

    /// Returns the direction/zone discriminator.
    fn tuple_flags(&self) -> TupleFlags;
}

/// Key of an IPv4 connection-tracking table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CtKey4 {
    /// Destination address.
    pub dest_addr: Ipv4Addr,
    /// Source address.
    pub source_addr: Ipv4Addr,
    /// Destination port.
    pub dest_port: u16,
    /// Source port.
    pub source_port: u16,
    /// IP protocol number.
    pub next_header: u8,
    /// Direction/zone discriminator.
    pub flags: u8,
}

/// Key of an IPv6 connection-tracking table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CtKey6 {
    /// Destination address.
    pub dest_addr: Ipv6Addr,
    /// Source address.
    pub source_addr: Ipv6Addr,
    /// Destination port.
    pub dest_port: u16,
    /// Source port.
    pub source_port: u16,
    /// IP protocol number.
    pub next_header: u8,
    /// Direction/zone discriminator.
    pub flags: u8,
}

impl FlowKey for CtKey4 {
    const FAMILY: Family = Family::Ipv4;

    fn tuple(&self) -> FlowTuple {
        FlowTuple {
            source_addr: IpAddr::V4(self.source_addr),
            dest_addr: IpAddr::V4(self.dest_addr),
            source_port: self.source_port,
            dest_port: self.dest_port,
            protocol: self.next_header,
        }
    }

    fn tuple_flags(&self) -> TupleFlags {
        TupleFlags::from_bits(self.flags)
    }
}

impl FlowKey for CtKey6 {
    const FAMILY: Family = Family::Ipv6;

    fn tuple(&self) -> FlowTuple {
        FlowTuple {
            source_addr: IpAddr::V6(self.source_addr),
            dest_addr: IpAddr::V6(self.dest_addr),
            source_port: self.source_port,
            dest_port: self.dest_port,
            protocol: self.next_header,
        }
    }

    fn tuple_flags(&self) -> TupleFlags {
        TupleFlags::from_bits(self.flags)
    }
}

/// A key read from any connection-tracking table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CtKey {
    /// Key from an IPv4 table.
    V4(CtKey4),
    /// Key from an IPv6 table.
    V6(CtKey6),
}

impl CtKey {
    /// Address family of the key.
    pub fn family(&self) -> Family {
        match self {
            Self::V4(_) => CtKey4::FAMILY,
            Self::V6(_) => CtKey6::FAMILY,
        }
    }

    /// Returns the 5-tuple stored in the key.
    pub fn tuple(&self) -> FlowTuple {
        match self {
            Self::V4(k) => k.tuple(),
            Self::V6(k) => k.tuple(),
        }
    }

    /// Returns the direction/zone discriminator.
    pub fn tuple_flags(&self) -> TupleFlags {
        match self {
            Self::V4(k) => k.tuple_flags(),
            Self::V6(k) => k.tuple_flags(),
        }
    }

    /// Builds the key that stores `tuple` with the given direction.
    ///
    /// Returns `None` if the tuple mixes address families.
    pub fn from_tuple(tuple: &FlowTuple, flags: TupleFlags) -> Option<Self> {
        match (tuple.source_addr, tuple.dest_addr) {
            (IpAddr::V4(source_addr), IpAddr::V4(dest_addr)) => Some(Self::V4(CtKey4 {
                dest_addr,
                source_addr,
                dest_port: tuple.dest_port,
                source_port: tuple.source_port,
                next_header: tuple.protocol,
                flags: flags.bits(),
            })),
            (IpAddr::V6(source_addr), IpAddr::V6(dest_addr)) => Some(Self::V6(CtKey6 {
                dest_addr,
                source_addr,
                dest_port: tuple.dest_port,
                source_port: tuple.source_port,
                next_header: tuple.protocol,
                flags: flags.bits(),
            })),
            _ => None,
        }
    }
}

impl fmt::Display for CtKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} flags={}", self.tuple(), self.tuple_flags().bits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp_tuple() -> FlowTuple {
        FlowTuple {
            source_addr: "10.0.0.1".parse().unwrap(),
            dest_addr: "10.0.0.2".parse().unwrap(),
            source_port: 40000,
            dest_port: 443,
            protocol: IPPROTO_TCP,
        }
    }

    #[test]
    fn from_tuple_preserves_identity() {
        let tuple = tcp_tuple();
        let key = CtKey::from_tuple(&tuple, TupleFlags::IN).unwrap();
        assert_eq!(key.family(), Family::Ipv4);
        assert_eq!(key.tuple(), tuple);
        assert_eq!(key.tuple_flags(), TupleFlags::IN);
    }

    #[test]
    fn from_tuple_rejects_mixed_families() {
        let mut tuple = tcp_tuple();
        tuple.dest_addr = "fd00::2".parse().unwrap();
        assert_eq!(tuple.family(), None);
        assert!(CtKey::from_tuple(&tuple, TupleFlags::OUT).is_none());
    }

    #[test]
    fn display_includes_ports_and_direction() {
        let key = CtKey::from_tuple(&tcp_tuple(), TupleFlags::OUT).unwrap();
        assert_eq!(key.to_string(), "6 10.0.0.1:40000 -> 10.0.0.2:443 flags=0");
    }
}
