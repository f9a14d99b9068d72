//! # Address Allocation
//!
//! The enumerator discovers *requests*; something else decides final base
//! addresses. That something is the [`Allocator`]: bridge-window discovery
//! hands it a window plus the downstream bus so it can aggregate the
//! subtree's demand, and the commit phase hands it the same pair again once
//! a base is known so it can place the children.
//!
//! [`TreeAllocator`] is the crate's straightforward implementation: children
//! are placed in tree order at their natural alignment. Boards with harder
//! packing constraints supply their own.

use tracing::debug;

use crate::device::resource::{Resource, ResourceFlags};
use crate::device::tree::{BusLink, Device};

/// Round `value` up to a `1 << shift` boundary.
#[must_use]
const fn align_up(value: u64, shift: u32) -> u64 {
    let mask = (1u64 << shift) - 1;
    (value + mask) & !mask
}

/// Decides final base addresses for discovered requests.
pub trait Allocator {
    /// Size `window` from the requests on the bus behind it, and place them
    /// once the window itself has a base.
    ///
    /// A child request takes part when `request.flags & mask == kind`.
    /// Before a global pass has decided the window's base, only the
    /// aggregate size/alignment is computed; afterwards (the window is
    /// assigned) each participating request also receives its base.
    fn allocate_subtree(
        &mut self,
        link: &mut BusLink,
        window: &mut Resource,
        mask: ResourceFlags,
        kind: ResourceFlags,
    );

    /// Normalize a device's resource list after discovery, dropping records
    /// whose flags were cleared (read-only, unimplemented or invalid
    /// registers).
    fn compact(&mut self, dev: &mut Device);
}

/// In-order placement at natural alignment.
#[derive(Debug, Clone, Copy, Default)]
pub struct TreeAllocator;

impl Allocator for TreeAllocator {
    fn allocate_subtree(
        &mut self,
        link: &mut BusLink,
        window: &mut Resource,
        mask: ResourceFlags,
        kind: ResourceFlags,
    ) {
        let place = window.assigned();
        let mut align = window.gran;
        let mut offset = 0u64;

        for child in link.children.iter_mut().filter(|child| child.enabled) {
            for res in &mut child.resources {
                if res.flags.is_empty()
                    || res
                        .flags
                        .intersects(ResourceFlags::FIXED | ResourceFlags::SUBTRACTIVE)
                    || res.size == 0
                    || res.flags.intersection(mask) != kind
                {
                    continue;
                }

                align = align.max(res.align);
                offset = align_up(offset, res.align);
                if place {
                    res.base = window.base + offset;
                    res.flags |= ResourceFlags::ASSIGNED;
                }
                offset += res.size;
            }
        }

        window.size = align_up(offset, window.gran);
        window.align = align;

        debug!(
            "allocate {} window: size 0x{:x} align {}{}",
            window.flags.space_name(),
            window.size,
            window.align,
            if place { " (placed)" } else { "" }
        );
    }

    fn compact(&mut self, dev: &mut Device) {
        let before = dev.resources.len();
        dev.resources.retain(|res| !res.flags.is_empty());

        let dropped = before - dev.resources.len();
        if dropped > 0 {
            debug!("{}: compacted {} dead resource(s)", dev.address, dropped);
        }
    }
}

/// Run the allocator over the domain root's own windows.
///
/// The domain's subtractive I/O and memory resources act as the top-level
/// windows every request on bus 0 is placed into. The caller decides their
/// bases; this pass distributes them downwards.
pub fn allocate_domain(root: &mut Device, alloc: &mut dyn Allocator) {
    let Device {
        resources, link, ..
    } = root;
    let Some(link) = link else {
        return;
    };

    for res in resources.iter_mut() {
        if !res.flags.contains(ResourceFlags::SUBTRACTIVE) {
            continue;
        }

        // At the domain level prefetchable requests share the one memory
        // window, so the match is on the space class alone.
        let (mask, kind) = if res.flags.contains(ResourceFlags::IO) {
            (ResourceFlags::IO, ResourceFlags::IO)
        } else {
            (ResourceFlags::MEM, ResourceFlags::MEM)
        };
        alloc.allocate_subtree(link, res, mask, kind);
    }
}
