//! # Capability List Walk
//!
//! Configuration space advertises optional features through a linked list of
//! `(id, next)` entries. The list is hardware-provided data and may be
//! corrupt or cyclic, so traversal is bounded by a hop cap and ends early at
//! the `0xFF` sentinel id. Running off the list is "capability not found",
//! never an error.

use tracing::trace;

use crate::pci::access::{BusDevFn, ConfigAccess};
use crate::pci::constants::config_space::{capability_list, header_type, offset, status};

/// Find the first instance of capability `cap`.
///
/// Returns the configuration-space offset of the capability header, or
/// `None` if the device has no capability list or the capability is not
/// present.
pub fn find_capability(
    access: &mut dyn ConfigAccess,
    addr: BusDevFn,
    hdr_type: u8,
    cap: u8,
) -> Option<u16> {
    find_next_capability(access, addr, hdr_type, cap, None)
}

/// Find the next instance of capability `cap` after a previous match.
///
/// Passing `last = None` starts a fresh search. Passing the offset of a
/// previous match resumes behind it, which lets callers enumerate multiple
/// instances of the same capability id.
pub fn find_next_capability(
    access: &mut dyn ConfigAccess,
    addr: BusDevFn,
    hdr_type: u8,
    cap: u8,
    last: Option<u16>,
) -> Option<u16> {
    let status = access.read16(addr, offset::STATUS);
    if status & status::CAPABILITIES == 0 {
        return None;
    }

    // The list head is fixed by header type. Normal devices and bridges
    // share the same pointer location.
    let head = match hdr_type & header_type::TYPE_MASK {
        header_type::NORMAL | header_type::BRIDGE => offset::CAPABILITIES_POINTER,
        _ => return None,
    };

    let mut skip_until = last;
    let mut pos = u16::from(access.read8(addr, head));

    for _ in 0..capability_list::MAX_HOPS {
        if pos < u16::from(capability_list::FIRST_VALID_OFFSET) {
            break;
        }
        pos &= u16::from(capability_list::POINTER_MASK);

        let id = access.read8(addr, pos);
        trace!("{}: capability 0x{:02x} @ 0x{:02x}", addr, id, pos);

        if id == capability_list::CORRUPT_ID {
            break;
        }
        if skip_until.is_none() && id == cap {
            return Some(pos);
        }
        if skip_until == Some(pos) {
            skip_until = None;
        }

        pos = u16::from(access.read8(addr, pos + capability_list::NEXT_POINTER));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::config_space::SimDeviceBuilder;
    use crate::sim::host::SimHost;

    const ADDR: BusDevFn = BusDevFn::new(0, 2, 0);

    fn host_with(builder: SimDeviceBuilder) -> SimHost {
        let mut host = SimHost::new();
        host.plug(ADDR.devfn, builder.device());
        host
    }

    #[test]
    fn device_without_list_has_no_capabilities() {
        let mut host = host_with(SimDeviceBuilder::new(0x8086, 0x1237));

        assert_eq!(find_capability(&mut host, ADDR, 0, 0x05), None);
    }

    #[test]
    fn finds_capability_in_chain() {
        let mut host = host_with(
            SimDeviceBuilder::new(0x8086, 0x1237)
                .capability(0x01, &[0, 0])
                .capability(0x05, &[0, 0, 0, 0]),
        );

        let pos = find_capability(&mut host, ADDR, 0, 0x05).unwrap();
        assert_eq!(host.read8(ADDR, pos), 0x05);

        assert_eq!(find_capability(&mut host, ADDR, 0, 0x10), None);
    }

    #[test]
    fn resume_skips_earlier_instances() {
        let mut host = host_with(
            SimDeviceBuilder::new(0x8086, 0x1237)
                .capability(0x09, &[0xAA])
                .capability(0x09, &[0xBB]),
        );

        let first = find_capability(&mut host, ADDR, 0, 0x09).unwrap();
        let second = find_next_capability(&mut host, ADDR, 0, 0x09, Some(first)).unwrap();

        assert_ne!(first, second);
        assert_eq!(host.read8(ADDR, second + 2), 0xBB);
        assert_eq!(
            find_next_capability(&mut host, ADDR, 0, 0x09, Some(second)),
            None
        );
    }

    #[test]
    fn corrupt_sentinel_ends_the_walk() {
        // A next pointer into the all-ones region beyond the device's
        // registers reads as id 0xFF.
        let mut host = host_with(
            SimDeviceBuilder::new(0x8086, 0x1237).broken_capability_chain(0x01, 0xF8),
        );

        assert_eq!(find_capability(&mut host, ADDR, 0, 0x05), None);
    }

    #[test]
    fn cyclic_list_terminates() {
        // Capability pointing at itself; only the hop cap stops the walk.
        let mut host =
            host_with(SimDeviceBuilder::new(0x8086, 0x1237).broken_capability_chain(0x01, 0x40));

        assert_eq!(find_capability(&mut host, ADDR, 0, 0x05), None);
    }
}
