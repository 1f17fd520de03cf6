bitflags::bitflags! {
    /// Distribution capability flags exchanged during the handshake.
    ///
    /// The version-5 handshake carries these as a 32-bit big-endian word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DistributionFlags: u32 {
        /// The node is to be published and part of the global namespace.
        const PUBLISHED = 0x01;

        /// The node implements an atom cache (obsolete).
        const ATOM_CACHE = 0x02;

        /// The node implements extended (3 × 32 bits) references.
        ///
        /// [NOTE] This flag is mandatory. If not present, the connection is refused.
        const EXTENDED_REFERENCES = 0x04;

        /// The node implements distributed process monitoring.
        const DIST_MONITOR = 0x08;

        /// The node uses a separate tag for funs (lambdas) in the distribution protocol.
        const FUN_TAGS = 0x10;

        /// The node implements distributed named process monitoring.
        const DIST_MONITOR_NAME = 0x20;

        /// The (hidden) node implements atom cache (obsolete).
        const HIDDEN_ATOM_CACHE = 0x40;

        /// The node understands new fun tags.
        const NEW_FUN_TAGS = 0x80;

        /// The node can handle extended pids and ports.
        ///
        /// [NOTE] This flag is mandatory. If not present, the connection is refused.
        const EXTENDED_PIDS_PORTS = 0x100;

        /// The node understands the `EXPORT_EXT` tag.
        const EXPORT_PTR_TAG = 0x200;

        /// The node understands bit binaries.
        const BIT_BINARIES = 0x400;

        /// The node understands the new float format.
        const NEW_FLOATS = 0x800;

        /// The node allows unicode characters in I/O operations.
        const UNICODE_IO = 0x1000;
    }
}

impl Default for DistributionFlags {
    fn default() -> Self {
        Self::new()
    }
}

impl DistributionFlags {
    /// Makes a new [`DistributionFlags`] with the capabilities this node
    /// declares: the mandatory set plus the term-format extensions the
    /// codec implements.
    pub fn new() -> Self {
        Self::mandatory()
            | Self::FUN_TAGS
            | Self::NEW_FUN_TAGS
            | Self::EXPORT_PTR_TAG
            | Self::BIT_BINARIES
            | Self::NEW_FLOATS
    }

    /// Gets the flags a peer must present for a connection to be accepted.
    pub fn mandatory() -> Self {
        Self::EXTENDED_REFERENCES | Self::EXTENDED_PIDS_PORTS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_contains_mandatory() {
        assert!(DistributionFlags::default().contains(DistributionFlags::mandatory()));
    }

    #[test]
    fn mandatory_check_rejects_bare_flags() {
        let bare = DistributionFlags::PUBLISHED;
        assert!(!bare.contains(DistributionFlags::mandatory()));
    }
}
