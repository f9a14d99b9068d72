//! # Bus Enumeration
//!
//! The scan walks device/function space depth-first. Each bus pass sets the
//! statically declared children aside, rebuilds the child list in probe
//! order — re-linking declared devices where hardware confirms them,
//! allocating new records where it does not — and finally recurses behind
//! every bridge, threading the highest bus number assigned so far through
//! the recursion.

use tracing::{debug, info, trace, warn};

use crate::device::ops::{resolve_device_ops, DriverRegistry};
use crate::device::tree::{BusLink, Device, DevicePath};
use crate::pci::access::{BusDevFn, ConfigAccess};
use crate::pci::constants::config_space::{class, command, offset};

/// ID-register patterns that mean "nothing answered". Some broken boards
/// return 0 or half-ones instead of all-ones for empty slots.
const ABSENT_IDS: [u32; 4] = [0xFFFF_FFFF, 0x0000_0000, 0x0000_FFFF, 0xFFFF_0000];

fn reads_absent(id: u32) -> bool {
    ABSENT_IDS.contains(&id)
}

/// Determine the existence of one function.
///
/// `candidate` is the statically declared record for this position, if the
/// board has one. Returns the (re-)linked device record, `None` when
/// nothing is there and nothing was declared. A declared device that
/// hardware does not confirm is returned disabled, never dropped.
pub fn probe_function(
    access: &mut dyn ConfigAccess,
    bus_number: u8,
    devfn: u8,
    candidate: Option<Device>,
    registry: &dyn DriverRegistry,
) -> Option<Device> {
    let addr = BusDevFn::from_devfn(bus_number, devfn);

    let mut dev = match candidate {
        None => {
            let id = access.read32(addr, offset::VENDOR);
            if reads_absent(id) {
                trace!("{addr}: bad id {id:08x}");
                return None;
            }
            Device::probed(addr)
        }
        Some(mut dev) => {
            // The parent bridge may have been renumbered since the record
            // was created.
            dev.address = addr;

            // Run the magic enable sequence for the device; some functions
            // do not show up without it.
            if let Some(hook) = dev.ops.and_then(|ops| ops.enable_scan) {
                hook(&mut dev, access);
            }

            let id = access.read32(addr, offset::VENDOR);
            if reads_absent(id) {
                // Optional devices may simply be absent; keep the record
                // so later stages can still report it.
                if dev.enabled {
                    info!("disabling static device {addr}");
                    dev.enabled = false;
                }
                return Some(dev);
            }
            dev
        }
    };

    let id = access.read32(addr, offset::VENDOR);
    dev.vendor = id as u16;
    dev.device = (id >> 16) as u16;
    dev.hdr_type = access.read8(addr, offset::HEADER_TYPE);
    // Class code: the upper 3 bytes of the class/revision dword.
    dev.class = access.read32(addr, offset::REVISION) >> 8;
    dev.status = access.read16(addr, offset::STATUS);
    dev.revision = access.read8(addr, offset::REVISION);
    dev.cache_line = access.read8(addr, offset::CACHE_LINE_SIZE);
    dev.irq_line = access.read8(addr, offset::IRQ_LINE);
    dev.irq_pin = access.read8(addr, offset::IRQ_PIN);
    dev.min_gnt = access.read8(addr, offset::type0::MIN_GNT);
    dev.max_lat = access.read8(addr, offset::type0::MAX_LAT);
    dev.subsystem_vendor = access.read16(addr, offset::type0::SUBSYSTEM_VENDOR_ID);
    dev.subsystem_device = access.read16(addr, offset::type0::SUBSYSTEM_ID);

    // Architectural/system devices always need to be bus masters.
    if dev.base_class() == class::SYSTEM {
        dev.command |= command::MASTER;
    }

    resolve_device_ops(access, &mut dev, registry);

    // Now run the magic enable/disable sequence for the device.
    if let Some(hook) = dev.ops.and_then(|ops| ops.enable_disable) {
        hook(&mut dev, access);
    }

    debug!(
        "{dev}{}",
        if dev.ops.is_none() {
            " no operations"
        } else {
            ""
        }
    );

    Some(dev)
}

/// Scan one bus over a devfn range.
///
/// `max` is the highest bus number assigned so far; the updated counter is
/// returned once every bridge behind this bus has been numbered.
pub fn scan_bus(
    access: &mut dyn ConfigAccess,
    bus_number: u8,
    link: &mut BusLink,
    min_devfn: u8,
    max_devfn: u8,
    mut max: u8,
    registry: &dyn DriverRegistry,
) -> u8 {
    debug!("scanning bus {bus_number:02x}, devfn {min_devfn:02x}..{max_devfn:02x}");

    // Set the declared children aside; the live list is rebuilt in probe
    // order and is empty — invisible — for the duration of the pass.
    let mut leftover = std::mem::take(&mut link.children);

    let mut devfn = u16::from(min_devfn);
    while devfn <= u16::from(max_devfn) {
        let fun = devfn as u8;

        let candidate = BusLink::detach_child(&mut leftover, DevicePath::Pci { devfn: fun });
        let probed = probe_function(access, bus_number, fun, candidate, registry);

        // If this is not a multi-function device, or nothing is present,
        // don't waste time probing the slot's other functions.
        let skip_slot = match &probed {
            None => true,
            Some(dev) => dev.enabled && !dev.multifunction(),
        };

        if let Some(dev) = probed {
            link.children.push(dev);
        }

        devfn += if fun & 0x07 == 0 && skip_slot { 8 } else { 1 };
    }

    // Anything still set aside was declared but never reached: almost
    // certainly a board-configuration error, but not fatal.
    if !leftover.is_empty() {
        warn!("left over static devices on bus {bus_number:02x}:");
        for dev in &leftover {
            warn!("  {}", dev.path);
        }
    }

    // For all children that own a downstream bus, scan the bus behind
    // them.
    for child in &mut link.children {
        if child.enabled && child.ops.is_some_and(|ops| ops.scans_bus()) {
            max = scan_bridge(access, child, max, registry);
        }
    }

    trace!("scan of bus {bus_number:02x} done, max {max:02x}");
    max
}

/// Number a bridge and scan the bus behind it.
///
/// The subordinate bus number is unknown until the subtree has been
/// scanned, so the widest possible value is programmed first and narrowed
/// afterwards. Decode stays off for the duration; the saved command
/// register is restored at the end.
pub fn scan_bridge(
    access: &mut dyn ConfigAccess,
    dev: &mut Device,
    mut max: u8,
    registry: &dyn DriverRegistry,
) -> u8 {
    let addr = dev.address;
    trace!("scanning bridge {addr}");

    if dev.link.is_none() {
        dev.link = Some(Box::new(BusLink::new()));
    }

    max += 1;
    let secondary = max;
    {
        let link = dev.link.as_deref_mut().unwrap();
        link.secondary = secondary;
        link.subordinate = 0xFF;
    }

    // Turn off memory, I/O and master decode while the bridge is
    // reconfigured, and clear stale error bits.
    let saved_command = access.read16(addr, offset::COMMAND);
    access.write16(addr, offset::COMMAND, 0x0000);
    access.write16(addr, offset::STATUS, 0xFFFF);

    // The bridge forwards no configuration transactions until its bus
    // numbers are programmed; write all three in one transaction.
    let mut buses = access.read32(addr, offset::type1::PRIMARY_BUS);
    buses &= 0xFF00_0000;
    buses |= u32::from(addr.bus) | (u32::from(secondary) << 8) | 0x00FF_0000;
    access.write32(addr, offset::type1::PRIMARY_BUS, buses);

    max = scan_bus(
        access,
        secondary,
        dev.link.as_deref_mut().unwrap(),
        0x00,
        0xFF,
        max,
        registry,
    );

    // Now we know how many buses are behind this bridge; narrow the
    // subordinate number to its real value.
    dev.link.as_deref_mut().unwrap().subordinate = max;
    buses = (buses & 0xFF00_FFFF) | (u32::from(max) << 16);
    access.write32(addr, offset::type1::PRIMARY_BUS, buses);
    access.write16(addr, offset::COMMAND, saved_command);

    trace!("bridge {addr} scanned, max {max:02x}");
    max
}

/// Scan a whole domain, starting at its root bus.
pub fn scan_domain(
    access: &mut dyn ConfigAccess,
    root: &mut Device,
    max: u8,
    registry: &dyn DriverRegistry,
) -> u8 {
    let Some(link) = root.link.as_deref_mut() else {
        warn!("domain root without a root bus");
        return max;
    };
    scan_bus(access, 0, link, 0x00, 0xFF, max, registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ops::{DeviceOps, EmptyRegistry};
    use crate::sim::config_space::SimDeviceBuilder;
    use crate::sim::host::{SimBus, SimHost};

    fn devfns(link: &BusLink) -> Vec<u8> {
        link.children
            .iter()
            .map(|dev| match dev.path {
                DevicePath::Pci { devfn } => devfn,
                DevicePath::Domain { .. } => panic!("domain in child list"),
            })
            .collect()
    }

    #[test]
    fn multifunction_device_is_fully_probed() {
        let mut host = SimHost::new();
        host.plug(
            0,
            SimDeviceBuilder::new(0x8086, 0x100E)
                .multifunction()
                .device(),
        );
        host.plug(1, SimDeviceBuilder::new(0x8086, 0x100F).device());
        // Slot 1 stays empty; slot 2 has a single-function device.
        host.plug(2 << 3, SimDeviceBuilder::new(0x8086, 0x1010).device());

        let mut link = BusLink::new();
        scan_bus(&mut host, 0, &mut link, 0, 0xFF, 0, &EmptyRegistry);

        // Functions 0 and 1 of slot 0, then straight to slot 2.
        assert_eq!(devfns(&link), vec![0, 1, 2 << 3]);
    }

    #[test]
    fn single_function_device_hides_its_other_functions() {
        let mut host = SimHost::new();
        // Function 0 does not set the multifunction bit, so the device at
        // function 1 must never be visited.
        host.plug(0, SimDeviceBuilder::new(0x8086, 0x100E).device());
        host.plug(1, SimDeviceBuilder::new(0x8086, 0x100F).device());

        let mut link = BusLink::new();
        scan_bus(&mut host, 0, &mut link, 0, 0xFF, 0, &EmptyRegistry);

        assert_eq!(devfns(&link), vec![0]);
    }

    #[test]
    fn absent_id_patterns_never_allocate_a_device() {
        for ids in [(0xFFFF, 0xFFFF), (0, 0), (0xFFFF, 0), (0, 0xFFFF)] {
            let mut host = SimHost::new();
            host.plug(0, SimDeviceBuilder::new(ids.0, ids.1).device());

            let mut link = BusLink::new();
            scan_bus(&mut host, 0, &mut link, 0, 0xFF, 0, &EmptyRegistry);

            assert!(link.children.is_empty(), "id pattern {ids:04x?}");
        }
    }

    #[test]
    fn missing_static_device_is_disabled_not_removed() {
        let mut host = SimHost::new();

        let mut link = BusLink::new();
        link.children.push(Device::declared(3 << 3));

        scan_bus(&mut host, 0, &mut link, 0, 0xFF, 0, &EmptyRegistry);

        assert_eq!(link.children.len(), 1);
        let dev = &link.children[0];
        assert!(!dev.enabled);
        assert!(dev.on_board);
    }

    #[test]
    fn static_and_probed_devices_interleave_in_scan_order() {
        let mut host = SimHost::new();
        host.plug(2 << 3, SimDeviceBuilder::new(0x8086, 0x100E).device());
        host.plug(3 << 3, SimDeviceBuilder::new(0x8086, 0x100F).device());
        host.plug(4 << 3, SimDeviceBuilder::new(0x8086, 0x1010).device());

        let mut link = BusLink::new();
        link.children.push(Device::declared(3 << 3));

        scan_bus(&mut host, 0, &mut link, 0, 0xFF, 0, &EmptyRegistry);

        assert_eq!(devfns(&link), vec![2 << 3, 3 << 3, 4 << 3]);
        assert!(link.children[1].on_board);
        assert_eq!(link.children[1].vendor, 0x8086);
    }

    #[test]
    fn leftover_static_devices_are_reported_not_fatal() {
        let mut host = SimHost::new();

        let mut link = BusLink::new();
        // Declared outside the scanned devfn range.
        link.children.push(Device::declared(0x48));

        let max = scan_bus(&mut host, 0, &mut link, 0, 0x3F, 0, &EmptyRegistry);

        assert_eq!(max, 0);
        assert!(link.children.is_empty());
    }

    #[test]
    fn enable_scan_hook_runs_before_the_presence_probe() {
        fn mark(dev: &mut Device, _access: &mut dyn ConfigAccess) {
            dev.rom_address = 0x1234;
        }

        let mut host = SimHost::new();
        host.plug(0, SimDeviceBuilder::new(0x8086, 0x100E).device());

        let mut declared = Device::declared(0);
        declared.ops = Some(DeviceOps {
            enable_scan: Some(mark),
            ..DeviceOps::generic_device()
        });

        let mut link = BusLink::new();
        link.children.push(declared);

        scan_bus(&mut host, 0, &mut link, 0, 0xFF, 0, &EmptyRegistry);

        assert_eq!(link.children[0].rom_address, 0x1234);
    }

    #[test]
    fn system_class_devices_require_bus_mastering() {
        let mut host = SimHost::new();
        host.plug(
            0,
            SimDeviceBuilder::new(0x8086, 0x100E)
                .class(0x08, 0x00, 0x00)
                .device(),
        );

        let mut link = BusLink::new();
        scan_bus(&mut host, 0, &mut link, 0, 0xFF, 0, &EmptyRegistry);

        assert_eq!(link.children[0].command & command::MASTER, command::MASTER);
    }

    #[test]
    fn bridge_numbering_assigns_and_narrows() {
        let mut host = SimHost::new();

        // Nested topology: a bridge at 00:04.0, behind it another bridge
        // at slot 0, behind that a leaf device.
        let mut inner = SimBus::new();
        inner.plug(0, SimDeviceBuilder::new(0x8086, 0x100E).device());

        let mut outer = SimBus::new();
        outer.plug_bridge(0, SimDeviceBuilder::bridge(0x8086, 0x244E), inner);

        host.root_mut()
            .plug_bridge(4 << 3, SimDeviceBuilder::bridge(0x8086, 0x244E), outer);

        let mut root = Device::domain(0);
        let max = scan_domain(&mut host, &mut root, 4, &EmptyRegistry);

        let bus0 = root.link.as_ref().unwrap();
        let bridge = &bus0.children[0];
        let outer_link = bridge.link.as_ref().unwrap();

        assert_eq!(outer_link.secondary, 5);
        assert_eq!(max, 6);

        let nested = &outer_link.children[0];
        let inner_link = nested.link.as_ref().unwrap();
        assert_eq!(inner_link.secondary, 6);
        assert_eq!(inner_link.subordinate, 6);

        // The outer bridge spans every bus behind it.
        assert_eq!(outer_link.subordinate, inner_link.subordinate);
        assert!(outer_link.secondary <= inner_link.secondary);

        // The leaf device was reachable through two bridges.
        assert_eq!(inner_link.children[0].vendor, 0x8086);
        assert_eq!(inner_link.children[0].address.bus, 6);

        // Hardware saw the narrowed subordinate value.
        let addr = BusDevFn::new(0, 4, 0);
        assert_eq!(host.read8(addr, offset::type1::SECONDARY_BUS), 5);
        assert_eq!(host.read8(addr, offset::type1::SUBORDINATE_BUS), 6);
    }

    #[test]
    fn sibling_bridges_get_disjoint_ranges() {
        let mut host = SimHost::new();

        let mut first = SimBus::new();
        first.plug(0, SimDeviceBuilder::new(0x8086, 0x100E).device());

        host.root_mut()
            .plug_bridge(2 << 3, SimDeviceBuilder::bridge(0x8086, 0x244E), first);
        host.root_mut().plug_bridge(
            3 << 3,
            SimDeviceBuilder::bridge(0x8086, 0x244E),
            SimBus::new(),
        );

        let mut root = Device::domain(0);
        scan_domain(&mut host, &mut root, 0, &EmptyRegistry);

        let bus0 = root.link.as_ref().unwrap();
        let ranges: Vec<(u8, u8)> = bus0
            .children
            .iter()
            .filter_map(|dev| dev.link.as_ref())
            .map(|link| (link.secondary, link.subordinate))
            .collect();

        assert_eq!(ranges, vec![(1, 1), (2, 2)]);
        for pair in ranges.windows(2) {
            assert!(pair[0].1 < pair[1].0);
        }
    }

    #[test]
    fn bridge_command_register_is_restored_after_scan() {
        let mut host = SimHost::new();
        host.root_mut().plug_bridge(
            4 << 3,
            SimDeviceBuilder::bridge(0x8086, 0x244E),
            SimBus::new(),
        );

        let addr = BusDevFn::new(0, 4, 0);
        host.write16(addr, offset::COMMAND, 0x0007);

        let mut root = Device::domain(0);
        scan_domain(&mut host, &mut root, 0, &EmptyRegistry);

        assert_eq!(host.read16(addr, offset::COMMAND), 0x0007);
    }
}
