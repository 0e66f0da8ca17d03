//! Connection-tracking entry flags.

use bitflags::bitflags;
use std::fmt;

bitflags! {
    /// Bit set stored in [`CtEntry::flags`](super::CtEntry).
    ///
    /// All bits except [`CtFlags::AUTH_OK`] are owned by the dataplane. This crate only
    /// ever sets `AUTH_OK`, and only on records that carry [`CtFlags::AUTH_REQUIRED`].
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct CtFlags: u16 {
        /// Receive side is closing.
        const RX_CLOSING = 1 << 0;
        /// Transmit side is closing.
        const TX_CLOSING = 1 << 1;
        /// Flow is translated between IPv4 and IPv6.
        const NAT64 = 1 << 2;
        /// Load-balanced flow looping back to the same endpoint.
        const LB_LOOPBACK = 1 << 3;
        /// A non-SYN packet was seen.
        const SEEN_NON_SYN = 1 << 4;
        /// Flow entered through a NodePort service.
        const NODE_PORT = 1 << 5;
        /// Flow is redirected to a proxy.
        const PROXY_REDIRECT = 1 << 6;
        /// Direct server return.
        const DSR = 1 << 7;
        /// Flow originated from an L7 load balancer.
        const FROM_L7LB = 1 << 8;
        /// Flow arrived through a tunnel.
        const FROM_TUNNEL = 1 << 10;
        /// The flow must complete mutual authentication before it is admitted.
        const AUTH_REQUIRED = 1 << 11;
        /// Mutual authentication for the flow has completed.
        const AUTH_OK = 1 << 12;

        // Bits this crate does not name still belong to the dataplane.
        const _ = !0;
    }
}

impl fmt::Display for CtFlags {
    /// Named bits joined by `|`, followed by any unnamed bits in hex.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("0");
        }
        let mut named = Self::empty();
        for (i, (name, flag)) in self.iter_names().enumerate() {
            if i > 0 {
                f.write_str("|")?;
            }
            f.write_str(name)?;
            named |= flag;
        }
        let rest = self.bits() & !named.bits();
        if rest != 0 {
            if !named.is_empty() {
                f.write_str("|")?;
            }
            write!(f, "{rest:#x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_lists_named_and_unknown_bits() {
        let flags =
            CtFlags::AUTH_REQUIRED | CtFlags::SEEN_NON_SYN | CtFlags::from_bits_retain(1 << 15);
        assert_eq!(flags.to_string(), "SEEN_NON_SYN|AUTH_REQUIRED|0x8000");
        assert_eq!(CtFlags::empty().to_string(), "0");
        assert_eq!(CtFlags::from_bits_retain(1 << 9).to_string(), "0x200");
    }

    #[test]
    fn contains_requires_all_bits() {
        let flags = CtFlags::AUTH_REQUIRED | CtFlags::DSR;
        assert!(flags.contains(CtFlags::AUTH_REQUIRED));
        assert!(!flags.contains(CtFlags::AUTH_REQUIRED | CtFlags::AUTH_OK));
    }

    #[test]
    fn auth_bits_match_dataplane_layout() {
        assert_eq!(CtFlags::AUTH_REQUIRED.bits(), 0x0800);
        assert_eq!(CtFlags::AUTH_OK.bits(), 0x1000);
    }

    #[test]
    fn unknown_bits_survive_union() {
        let raw = CtFlags::from_bits_retain(0x8000 | 0x0800);
        assert_eq!((raw | CtFlags::AUTH_OK).bits(), 0x9800);
    }
}
