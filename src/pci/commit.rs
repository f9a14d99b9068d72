//! # Resource Commit
//!
//! The commit phase writes addresses that the allocator decided back into
//! configuration-space registers, accumulates the matching decode-enable
//! bits, and finally — in a separate enable pass so no device ever decodes
//! with a half-programmed window — turns decoding on.
//!
//! Committing is idempotent: a resource is stored at most once, and a
//! second pass over an already-stored tree performs no register writes.

use tracing::{debug, error};

use crate::device::allocator::Allocator;
use crate::device::resource::{Resource, ResourceFlags};
use crate::device::tree::{BusLink, Device};
use crate::pci::access::{BusDevFn, ConfigAccess};
use crate::pci::constants::config_space::{
    bar, bridge_control, command, header_type, offset,
};
use crate::pci::constants::defaults;

/// Write one decided resource back to hardware.
///
/// Takes the device apart (address, command accumulator, downstream link)
/// instead of the device itself so the caller can hold the resource and the
/// link mutably at the same time.
pub(crate) fn store_resource(
    access: &mut dyn ConfigAccess,
    addr: BusDevFn,
    dev_command: &mut u16,
    link: Option<&mut BusLink>,
    res: &mut Resource,
    alloc: &mut dyn Allocator,
) {
    // Never write an address that was never decided.
    if !res.assigned() {
        error!(
            "{} resource {:02x} ({}) size 0x{:x} not assigned, skipping",
            addr,
            res.index,
            res.flags.space_name(),
            res.size
        );
        return;
    }

    // Already stored, subtractive (always on, never programmed) and
    // non-address resources are silently left alone.
    if res.stored()
        || res.flags.contains(ResourceFlags::SUBTRACTIVE)
        || !res.flags.intersects(ResourceFlags::MEM | ResourceFlags::IO)
    {
        return;
    }

    // Accumulate decode enables; the command register itself is written in
    // one pass during the enable phase.
    if res.size != 0 {
        if res.flags.contains(ResourceFlags::MEM) {
            *dev_command |= command::MEMORY;
        }
        if res.flags.contains(ResourceFlags::IO) {
            *dev_command |= command::IO;
        }
        if res.flags.contains(ResourceFlags::BRIDGE) {
            *dev_command |= command::MASTER;
        }
    }

    let base = res.base;
    let end = res.end();

    res.flags |= ResourceFlags::STORED;

    if !res.flags.contains(ResourceFlags::BRIDGE) {
        // A plain BAR. Some chipsets let us clear the I/O space bit, so
        // reapply it to be safe.
        let mut base_lo = base as u32;
        if res.flags.contains(ResourceFlags::IO) {
            base_lo |= bar::SPACE_IO;
        }
        let index = res.index as u16;
        access.write32(addr, index, base_lo);
        if res.flags.contains(ResourceFlags::PCI64) {
            access.write32(addr, index + 4, (base >> 32) as u32);
        }
    } else if res.index == u32::from(offset::type1::IO_BASE) {
        if let Some(link) = link {
            alloc.allocate_subtree(link, res, ResourceFlags::IO, ResourceFlags::IO);
        }
        access.write8(addr, offset::type1::IO_BASE, (base >> 8) as u8);
        access.write16(addr, offset::type1::IO_BASE_UPPER16, (base >> 16) as u16);
        access.write8(addr, offset::type1::IO_LIMIT, (end >> 8) as u8);
        access.write16(addr, offset::type1::IO_LIMIT_UPPER16, (end >> 16) as u16);
    } else if res.index == u32::from(offset::type1::MEMORY_BASE) {
        if let Some(link) = link {
            alloc.allocate_subtree(
                link,
                res,
                ResourceFlags::MEM | ResourceFlags::PREFETCH,
                ResourceFlags::MEM,
            );
        }
        access.write16(addr, offset::type1::MEMORY_BASE, (base >> 16) as u16);
        access.write16(addr, offset::type1::MEMORY_LIMIT, (end >> 16) as u16);
    } else if res.index == u32::from(offset::type1::PREF_MEMORY_BASE) {
        if let Some(link) = link {
            alloc.allocate_subtree(
                link,
                res,
                ResourceFlags::MEM | ResourceFlags::PREFETCH,
                ResourceFlags::MEM | ResourceFlags::PREFETCH,
            );
        }
        access.write16(addr, offset::type1::PREF_MEMORY_BASE, (base >> 16) as u16);
        access.write32(addr, offset::type1::PREF_BASE_UPPER32, (base >> 32) as u32);
        access.write16(addr, offset::type1::PREF_MEMORY_LIMIT, (end >> 16) as u16);
        access.write32(addr, offset::type1::PREF_LIMIT_UPPER32, (end >> 32) as u32);
    } else {
        // Don't let anyone think we stored the resource.
        res.flags -= ResourceFlags::STORED;
        error!("{} invalid resource index {:02x}", addr, res.index);
        return;
    }

    debug!(
        "{} {:02x} <- [0x{:012x} - 0x{:012x}] {}",
        addr,
        res.index,
        base,
        end,
        res.flags.space_name()
    );
}

/// Commit all resources of one device, then normalize its header.
///
/// After the resources are stored, any populated downstream bus is
/// committed as well, and the device leaves with a fixed latency timer, a
/// zeroed interrupt line (when a pin is wired) and the platform cache line
/// size — regardless of how the resource writes went, so every scanned
/// device ends up in a known state.
pub fn assign_device_resources(
    access: &mut dyn ConfigAccess,
    dev: &mut Device,
    alloc: &mut dyn Allocator,
) {
    let Device {
        address,
        command,
        resources,
        link,
        hdr_type,
        ..
    } = dev;
    let addr = *address;

    for res in resources.iter_mut() {
        store_resource(access, addr, command, link.as_deref_mut(), res, alloc);
    }

    if let Some(link) = link.as_deref_mut() {
        if !link.children.is_empty() {
            assign_bus_resources(access, link, alloc);
        }
    }

    access.write8(addr, offset::LATENCY_TIMER, defaults::LATENCY_TIMER);
    if *hdr_type & header_type::TYPE_MASK == header_type::BRIDGE {
        access.write8(
            addr,
            offset::type1::SEC_LATENCY_TIMER,
            defaults::LATENCY_TIMER,
        );
    }

    if access.read8(addr, offset::IRQ_PIN) != 0 {
        access.write8(addr, offset::IRQ_LINE, 0);
    }

    access.write8(addr, offset::CACHE_LINE_SIZE, defaults::CACHE_LINE_SIZE);
}

/// Commit every enabled, bound device on a bus.
pub fn assign_bus_resources(
    access: &mut dyn ConfigAccess,
    link: &mut BusLink,
    alloc: &mut dyn Allocator,
) {
    for child in &mut link.children {
        if child.enabled && child.ops.is_some() {
            assign_device_resources(access, child, alloc);
        }
    }
}

fn program_device_enable(
    access: &mut dyn ConfigAccess,
    addr: BusDevFn,
    command_bits: u16,
    subsystem: Option<(u16, u16)>,
    hdr_type: u8,
) {
    if let Some((vendor, device)) = subsystem {
        // Leave the IDs alone unless the board supplied both halves.
        if vendor != 0 && device != 0 && hdr_type & header_type::TYPE_MASK == header_type::NORMAL {
            debug!("{addr}: subsystem <- {vendor:04x}:{device:04x}");
            access.write32(
                addr,
                offset::type0::SUBSYSTEM_VENDOR_ID,
                u32::from(device) << 16 | u32::from(vendor),
            );
        }
    }

    let cmd = access.read16(addr, offset::COMMAND) | command_bits | command::PARITY | command::SERR;
    debug!("{addr}: cmd <- {cmd:04x}");
    access.write16(addr, offset::COMMAND, cmd);
}

fn enable_children(access: &mut dyn ConfigAccess, link: &mut BusLink) {
    for child in &mut link.children {
        let Some(ops) = child.ops else { continue };
        if !child.enabled {
            continue;
        }

        let Device {
            address,
            command,
            link,
            hdr_type,
            subsystem_override,
            ..
        } = child;

        if ops.scans_bus() {
            if let Some(link) = link.as_deref_mut() {
                // A VGA card behind the bridge claims legacy I/O ranges no
                // BAR describes.
                if link.bridge_ctrl & bridge_control::VGA != 0 {
                    *command |= command::IO;
                }
                let ctrl = access.read16(*address, offset::type1::BRIDGE_CONTROL)
                    | link.bridge_ctrl
                    | bridge_control::PARITY
                    | bridge_control::SERR;
                debug!("{} bridge ctrl <- {:04x}", address, ctrl);
                access.write16(*address, offset::type1::BRIDGE_CONTROL, ctrl);
            }
        }

        program_device_enable(access, *address, *command, *subsystem_override, *hdr_type);

        if let Some(link) = link.as_deref_mut() {
            enable_children(access, link);
        }
    }
}

/// Turn decoding on for the whole committed tree.
pub fn enable_tree(access: &mut dyn ConfigAccess, root: &mut Device) {
    if let Some(link) = root.link.as_deref_mut() {
        enable_children(access, link);
    }
}
