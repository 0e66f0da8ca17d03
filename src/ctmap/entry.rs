//! Connection-tracking values.

use super::flags::CtFlags;

/// Mutable per-flow state kept by the dataplane.
///
/// Only [`CtEntry::flags`] is ever modified by this crate, and only through an
/// [`EntryPatch`]. Counters and the remaining flags belong to the dataplane and are
/// carried through updates untouched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CtEntry {
    /// Packets received.
    pub rx_packets: u64,
    /// Bytes received.
    pub rx_bytes: u64,
    /// Packets transmitted.
    pub tx_packets: u64,
    /// Bytes transmitted.
    pub tx_bytes: u64,
    /// Expiry time, in seconds since boot.
    pub lifetime: u32,
    /// Entry flags.
    pub flags: CtFlags,
    /// Reverse NAT index.
    pub rev_nat_index: u16,
    /// Interface index the flow is bound to.
    pub ifindex: u16,
    /// TCP flags seen on transmit.
    pub tx_flags_seen: u8,
    /// TCP flags seen on receive.
    pub rx_flags_seen: u8,
    /// Security identity of the source.
    pub src_sec_id: u32,
    /// Last transmit report time.
    pub last_tx_report: u32,
    /// Last receive report time.
    pub last_rx_report: u32,
}

impl CtEntry {
    /// Returns `true` if the flow requires authentication and has not completed it.
    pub const fn needs_auth(&self) -> bool {
        self.flags.contains(CtFlags::AUTH_REQUIRED) && !self.flags.contains(CtFlags::AUTH_OK)
    }

    /// Returns `true` if authentication has completed for the flow.
    pub const fn is_authenticated(&self) -> bool {
        self.flags.contains(CtFlags::AUTH_OK)
    }
}

/// A targeted change to a [`CtEntry`]: a set of flag bits to add, guarded by a set of
/// bits the record must still carry.
///
/// Patches are applied to the freshest value of a record rather than to the value
/// observed while dumping, so concurrent dataplane updates are never rolled back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryPatch {
    set: CtFlags,
    require: CtFlags,
}

impl EntryPatch {
    /// Patch that marks a flow as authenticated. Only applies while the record still
    /// requires authentication.
    pub const MARK_AUTH_OK: Self = Self::set(CtFlags::AUTH_OK).requiring(CtFlags::AUTH_REQUIRED);

    /// Creates a patch adding `flags`.
    pub const fn set(flags: CtFlags) -> Self {
        Self {
            set: flags,
            require: CtFlags::empty(),
        }
    }

    /// Restricts the patch to records whose current value carries all of `flags`.
    #[must_use]
    pub const fn requiring(mut self, flags: CtFlags) -> Self {
        self.require = flags;
        self
    }

    /// Bits added by this patch.
    pub const fn flags(&self) -> CtFlags {
        self.set
    }

    /// Bits the record must carry for the patch to apply.
    pub const fn required(&self) -> CtFlags {
        self.require
    }

    /// Returns `true` if `current` still carries the required bits.
    pub const fn applies_to(&self, current: &CtEntry) -> bool {
        current.flags.contains(self.require)
    }

    /// Returns `current` with the patch applied, or `None` if the patch does not apply
    /// or would not change it.
    pub fn apply(&self, current: &CtEntry) -> Option<CtEntry> {
        if !self.applies_to(current) || current.flags.contains(self.set) {
            return None;
        }
        let mut next = *current;
        next.flags |= self.set;
        Some(next)
    }
}
