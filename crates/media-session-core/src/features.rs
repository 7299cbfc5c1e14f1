//! Feature bitsets for session items and remote proxies.

use bitflags::bitflags;

bitflags! {
    /// Features and lifecycle flags of a session item.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ItemFeatures: u32 {
        /// The item is active; its remote artifacts exist.
        const ACTIVE = 1 << 0;
        /// The item is exported to the remote graph.
        const EXPORTED = 1 << 1;
        /// The item holds a validated configuration.
        const CONFIGURED = 1 << 4;
        /// An activation transition is in flight.
        const ACTIVATING = 1 << 5;
        /// An export transition is in flight.
        const EXPORTING = 1 << 6;

        const _ = !0;
    }
}

impl ItemFeatures {
    /// Features that a transition can be asked to reach.
    pub const REQUESTABLE: Self = Self::ACTIVE.union(Self::EXPORTED);

    /// Flags that make the configuration immutable.
    pub const BUSY: Self = Self::ACTIVATING.union(Self::ACTIVE);

    /// First bit available to item-specific features.
    pub const CUSTOM_START: u32 = 1 << 16;

    /// Item-specific feature bit `n`, counted from `CUSTOM_START`.
    #[must_use]
    pub const fn custom(n: u32) -> Self {
        Self::from_bits_retain(Self::CUSTOM_START << n)
    }
}

bitflags! {
    /// Features a remote proxy can be augmented with.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ProxyFeatures: u32 {
        const PW_PROXY = 1 << 0;
        const INFO = 1 << 1;
        const BOUND = 1 << 2;
        const PROPS = 1 << 3;
        const PORTS = 1 << 4;

        const MINIMAL = Self::PW_PROXY.bits() | Self::BOUND.bits();
        const STANDARD = Self::PW_PROXY.bits() | Self::INFO.bits() | Self::BOUND.bits();
    }
}
