//! Table families and naming.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix of every connection-tracking table pinned by the dataplane.
pub const MAP_NAME_PREFIX: &str = "cilium_ct";

/// Suffix of the node-wide (non per-endpoint) tables.
pub const GLOBAL_SUFFIX: &str = "global";

/// IP address family of a table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    /// IPv4 table.
    Ipv4,
    /// IPv6 table.
    Ipv6,
}

impl Family {
    /// Returns a stable string representation of the family.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ipv4 => "ipv4",
            Self::Ipv6 => "ipv6",
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol sharding of a table: TCP flows and everything else are kept apart.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MapProtocol {
    /// TCP flows.
    Tcp,
    /// Non-TCP flows.
    Any,
}

/// Which family/protocol shard a table holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MapKind {
    /// Address family.
    pub family: Family,
    /// Protocol shard.
    pub protocol: MapProtocol,
}

impl MapKind {
    /// IPv4 TCP table.
    pub const IPV4_TCP: Self = Self::new(Family::Ipv4, MapProtocol::Tcp);
    /// IPv4 non-TCP table.
    pub const IPV4_ANY: Self = Self::new(Family::Ipv4, MapProtocol::Any);
    /// IPv6 TCP table.
    pub const IPV6_TCP: Self = Self::new(Family::Ipv6, MapProtocol::Tcp);
    /// IPv6 non-TCP table.
    pub const IPV6_ANY: Self = Self::new(Family::Ipv6, MapProtocol::Any);

    /// All kinds, in scan order.
    pub const ALL: [Self; 4] = [Self::IPV4_TCP, Self::IPV4_ANY, Self::IPV6_TCP, Self::IPV6_ANY];

    /// Creates a new `MapKind`.
    pub const fn new(family: Family, protocol: MapProtocol) -> Self {
        Self { family, protocol }
    }

    /// Name of the table of this kind for `scope` (`global` or an endpoint id).
    ///
    /// ```rust
    /// use conntrack_auth::ctmap::MapKind;
    ///
    /// assert_eq!(MapKind::IPV4_TCP.map_name("global"), "cilium_ct4_global");
    /// assert_eq!(MapKind::IPV6_ANY.map_name("1234"), "cilium_ct_any6_1234");
    /// ```
    pub fn map_name(self, scope: &str) -> String {
        let family = match self.family {
            Family::Ipv4 => "4",
            Family::Ipv6 => "6",
        };
        match self.protocol {
            MapProtocol::Tcp => format!("{MAP_NAME_PREFIX}{family}_{scope}"),
            MapProtocol::Any => format!("{MAP_NAME_PREFIX}_any{family}_{scope}"),
        }
    }

    /// Name of the node-wide table of this kind.
    pub fn global_name(self) -> String {
        self.map_name(GLOBAL_SUFFIX)
    }

    /// Parses a table name back into its kind and scope.
    ///
    /// Returns `None` for names that are not connection-tracking tables.
    pub fn parse_name(name: &str) -> Option<(Self, &str)> {
        let rest = name.strip_prefix(MAP_NAME_PREFIX)?;
        let (protocol, rest) = match rest.strip_prefix("_any") {
            Some(rest) => (MapProtocol::Any, rest),
            None => (MapProtocol::Tcp, rest),
        };
        let (family, rest) = if let Some(rest) = rest.strip_prefix("4_") {
            (Family::Ipv4, rest)
        } else if let Some(rest) = rest.strip_prefix("6_") {
            (Family::Ipv6, rest)
        } else {
            return None;
        };
        if rest.is_empty() {
            return None;
        }
        Some((Self::new(family, protocol), rest))
    }
}

impl fmt::Display for MapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proto = match self.protocol {
            MapProtocol::Tcp => "tcp",
            MapProtocol::Any => "any",
        };
        write!(f, "{}/{}", self.family, proto)
    }
}
