//! # Address-Space Resources
//!
//! A [`Resource`] is one discovered or fixed address-space request: a BAR, a
//! bridge window, an expansion-ROM window, or a synthetic record for memory
//! that is not relocatable at all (RAM, subtractive domain windows).

use std::fmt;

use bitflags::bitflags;

bitflags! {
    /// Semantic flags of a [`Resource`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ResourceFlags: u32 {
        /// The window lives in I/O space.
        const IO = 1 << 0;
        /// The window lives in memory space.
        const MEM = 1 << 1;
        /// The memory window is safe for read-ahead and write combining.
        const PREFETCH = 1 << 2;
        /// The window may be placed above 4 GiB.
        const PCI64 = 1 << 3;
        /// The window is decoded by read-only hardware (expansion ROM).
        const READONLY = 1 << 4;
        /// The memory behind the window may be cached (RAM).
        const CACHEABLE = 1 << 5;
        /// The window forwards to a downstream bus.
        const BRIDGE = 1 << 6;
        /// The window claims whatever no sibling claims; it is always on
        /// and never explicitly programmed.
        const SUBTRACTIVE = 1 << 7;
        /// The base address is not relocatable.
        const FIXED = 1 << 8;
        /// A base address has been decided.
        const ASSIGNED = 1 << 9;
        /// The base address has been written back to hardware.
        const STORED = 1 << 10;
    }
}

impl ResourceFlags {
    /// A short name for the space class, for diagnostics.
    #[must_use]
    pub fn space_name(self) -> &'static str {
        match (
            self.contains(Self::IO),
            self.contains(Self::MEM),
            self.contains(Self::PREFETCH),
        ) {
            (true, _, _) => "io",
            (false, true, true) => "prefmem",
            (false, true, false) => "mem",
            _ => "none",
        }
    }
}

/// Synthetic resource indices start here; everything below is a
/// configuration-space register offset.
pub const SYNTHETIC_INDEX_BASE: u32 = 0x1000_0000;

/// Index of a synthetic, subtractive domain window.
#[must_use]
pub const fn subtractive_index(n: u32) -> u32 {
    SYNTHETIC_INDEX_BASE | n
}

/// Index of a synthetic, fixed RAM record.
#[must_use]
pub const fn ram_index(n: u32) -> u32 {
    SYNTHETIC_INDEX_BASE | 0x100 | n
}

/// One address-space request of a device.
///
/// Resources are created empty by discovery, sized by the probing code,
/// given a base by the allocator and finally written back by the commit
/// phase. The invariants `size.is_power_of_two() || size == 0`,
/// `base % size == 0` (once assigned) and `base + size - 1 <= limit` hold
/// throughout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    /// The register (pair) this request came from, or a synthetic index.
    pub index: u32,

    /// Space class and lifecycle state.
    pub flags: ResourceFlags,

    /// Size of the window in bytes. Zero for an empty or dead window.
    pub size: u64,

    /// Required alignment of `base`, as a power-of-two shift.
    pub align: u32,

    /// Granularity the window can be sized in, as a power-of-two shift.
    pub gran: u32,

    /// The maximum address the window's decoder can represent.
    pub limit: u64,

    /// The decided base address. Only meaningful once `ASSIGNED` is set.
    pub base: u64,
}

impl Resource {
    /// Create an empty resource for a register or synthetic index.
    #[must_use]
    pub const fn new(index: u32) -> Self {
        Self {
            index,
            flags: ResourceFlags::empty(),
            size: 0,
            align: 0,
            gran: 0,
            limit: 0,
            base: 0,
        }
    }

    /// The last address covered by the window.
    ///
    /// For a zero-size window this wraps to `base - 1`, which is exactly
    /// the degenerate limit-below-base pair that closes a bridge window.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.wrapping_add(self.size).wrapping_sub(1)
    }

    /// Whether a base address has been decided.
    #[must_use]
    pub const fn assigned(&self) -> bool {
        self.flags.contains(ResourceFlags::ASSIGNED)
    }

    /// Whether the base address has been written back to hardware.
    #[must_use]
    pub const fn stored(&self) -> bool {
        self.flags.contains(ResourceFlags::STORED)
    }

    /// Find the record for `index` in a list, creating it if missing.
    ///
    /// This is the free-standing form of
    /// [`Device::new_resource`](crate::device::tree::Device::new_resource)
    /// for callers that hold a device's fields apart.
    pub fn find_or_create(resources: &mut Vec<Self>, index: u32) -> &mut Self {
        if let Some(pos) = resources.iter().position(|res| res.index == index) {
            &mut resources[pos]
        } else {
            resources.push(Self::new(index));
            resources.last_mut().unwrap()
        }
    }

    /// Derive size, alignment and limit from a movable-bits mask.
    ///
    /// The size is the lowest set bit of the mask; the limit is the mask
    /// plus all lower bits (PCI Spec 6.2.5.1). A mask of zero leaves the
    /// resource untouched.
    pub fn size_from_moving_bits(&mut self, moving: u64) {
        if moving == 0 {
            return;
        }

        let shift = moving.trailing_zeros();
        self.size = 1 << shift;
        self.align = shift;
        self.gran = shift;
        self.limit = moving | (self.size - 1);
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x} {} base 0x{:x} size 0x{:x} limit 0x{:x}",
            self.index,
            self.flags.space_name(),
            self.base,
            self.size,
            self.limit
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn sizing_from_moving_bits() {
        let mut res = Resource::new(0x10);
        res.size_from_moving_bits(0xFFFF_F000);

        assert_eq!(res.size, 0x1000);
        assert_eq!(res.align, 12);
        assert_eq!(res.gran, 12);
        assert_eq!(res.limit, 0xFFFF_FFFF);
    }

    #[test]
    fn zero_mask_leaves_resource_empty() {
        let mut res = Resource::new(0x10);
        res.size_from_moving_bits(0);

        assert_eq!(res.size, 0);
        assert_eq!(res.limit, 0);
    }

    proptest! {
        #[test]
        fn derived_size_is_power_of_two(moving in 1u64..) {
            let mut res = Resource::new(0x10);
            res.size_from_moving_bits(moving);

            prop_assert!(res.size.is_power_of_two());
            prop_assert_eq!(res.size, 1u64 << res.align);
            prop_assert!(res.limit >= res.size - 1);
        }
    }
}
