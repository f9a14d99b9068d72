//! # Resource Discovery
//!
//! Populates every device's resource list by sizing its Base Address
//! Registers, its expansion-ROM window and — for bridges — its three
//! forwarding windows, all via the moving-bits probe. Nothing here decides
//! addresses; discovery only records what the hardware can decode.

use tracing::{debug, warn};

use crate::device::allocator::Allocator;
use crate::device::resource::{subtractive_index, Resource, ResourceFlags};
use crate::device::tree::{BusLink, Device};
use crate::pci::access::ConfigAccess;
use crate::pci::commit::store_resource;
use crate::pci::constants::config_space::{bar, offset};
use crate::pci::probe::{moving_bits16, moving_bits32, moving_bits8};

/// Size one Base Address Register into a resource record.
///
/// Returns the resulting flags so the caller can tell whether the register
/// consumed its upper neighbour as the high half of a 64-bit decode.
pub fn read_bar_resource(
    access: &mut dyn ConfigAccess,
    dev: &mut Device,
    index: u16,
) -> ResourceFlags {
    let addr = dev.address;

    let value = access.read32(addr, index);
    let mut moving = u64::from(moving_bits32(access, addr, index));

    // The bits that do not move are the attribute bits.
    let mut attr = value & !(moving as u32);

    // A 64-bit memory decode continues into the next register.
    if attr & bar::SPACE_IO == 0 && attr & bar::MEM_LIMIT_MASK == bar::MEM_LIMIT_64 {
        moving |= u64::from(moving_bits32(access, addr, index + 4)) << 32;
    }

    let res = dev.new_resource(u32::from(index));
    res.flags = ResourceFlags::empty();
    res.size_from_moving_bits(moving);
    let moving_limit = res.limit;

    if moving == 0 {
        // Some broken hardware has read-only registers that do not size.
        // Observing which bits move catches that, as well as the common
        // case of unimplemented registers that read back as 0.
        if value != 0 {
            debug!("{addr} register {index:02x} ({value:08x}) is read-only, ignoring it");
        }
        res.flags = ResourceFlags::empty();
    } else if attr & bar::SPACE_IO != 0 {
        res.flags |= ResourceFlags::IO;
        // No 32-bit I/O support; windows stay within the 16-bit space.
        res.limit = 0xFFFF;
    } else {
        res.flags |= ResourceFlags::MEM;
        if attr & bar::MEM_PREFETCH != 0 {
            res.flags |= ResourceFlags::PREFETCH;
        }
        attr &= bar::MEM_LIMIT_MASK;
        if attr == bar::MEM_LIMIT_32 {
            res.limit = 0xFFFF_FFFF;
        } else if attr == bar::MEM_LIMIT_1M {
            res.limit = 0x000F_FFFF;
        } else if attr == bar::MEM_LIMIT_64 {
            res.limit = u64::MAX;
            res.flags |= ResourceFlags::PCI64;
        } else {
            // Invalid limit-class encoding.
            res.flags = ResourceFlags::empty();
        }
    }

    // Don't let the limit exceed what the movable bits can decode.
    if res.limit > moving_limit {
        res.limit = moving_limit;
    }

    res.flags
}

/// Size all functional BARs of a device: 6 for a normal header, 2 for a
/// bridge.
fn read_bases(access: &mut dyn ConfigAccess, dev: &mut Device, howmany: u16) {
    let mut index = offset::BAR_0;
    let end = offset::BAR_0 + howmany * 4;

    while index < end {
        let flags = read_bar_resource(access, dev, index);
        index += if flags.contains(ResourceFlags::PCI64) {
            8
        } else {
            4
        };
    }
}

/// Size the expansion-ROM window.
///
/// The register follows the usual sizing procedure except that its
/// decode-enable bit never counts as movable, and the window is read-only.
/// A fixed ROM address from the board configuration short-circuits the
/// probe entirely.
fn read_rom_resource(access: &mut dyn ConfigAccess, dev: &mut Device, index: u16) {
    if dev.on_board && dev.rom_address == 0 {
        // On-board device without a declared ROM image.
        return;
    }

    if dev.on_board {
        let rom_address = dev.rom_address;
        let res = dev.new_resource(u32::from(index));
        res.base = rom_address;
        res.flags = ResourceFlags::MEM
            | ResourceFlags::READONLY
            | ResourceFlags::ASSIGNED
            | ResourceFlags::FIXED;
        return;
    }

    let addr = dev.address;
    let value = access.read32(addr, index);
    let moving = u64::from(moving_bits32(access, addr, index) & !bar::ROM_ENABLE);

    let res = dev.new_resource(u32::from(index));
    res.flags = ResourceFlags::empty();
    res.size_from_moving_bits(moving);

    if moving == 0 {
        if value != 0 {
            debug!("{addr} register {index:02x} ({value:08x}) is read-only, ignoring it");
        }
        res.flags = ResourceFlags::empty();
    } else {
        res.flags = ResourceFlags::MEM | ResourceFlags::READONLY;
    }
}

/// Record one bridge forwarding window from its movable-bits intersection.
///
/// Only bits movable in both the base and the limit register set reflect a
/// real, enabled window. The window's contents are sized by the allocator
/// from the downstream bus; a window with nothing behind it is dead and is
/// closed immediately so it cannot claim address space later.
fn record_bridge_window(
    access: &mut dyn ConfigAccess,
    dev: &mut Device,
    moving: u64,
    index: u16,
    mask: ResourceFlags,
    kind: ResourceFlags,
    alloc: &mut dyn Allocator,
) {
    if moving == 0 {
        return;
    }

    let Device {
        address,
        command,
        resources,
        link,
        ..
    } = dev;
    let addr = *address;
    let Some(link) = link.as_deref_mut() else {
        warn!("{addr}: bridge window probe without a downstream bus");
        return;
    };

    let res = Resource::find_or_create(resources, u32::from(index));
    res.size_from_moving_bits(moving);
    // The probe only constrains the window; its size comes from the
    // aggregate demand behind the bridge.
    res.size = 0;
    res.flags = kind | ResourceFlags::BRIDGE;

    alloc.allocate_subtree(link, res, mask, kind);

    // If there is nothing behind the window, clear it and forget it.
    if res.size == 0 {
        res.base = moving;
        res.flags |= ResourceFlags::ASSIGNED;
        res.flags -= ResourceFlags::STORED;
        store_resource(access, addr, command, Some(link), res, alloc);
        res.flags = ResourceFlags::empty();
    }
}

/// Probe the three window classes of a bridge: I/O, prefetchable memory,
/// and plain memory.
fn read_bridge_windows(access: &mut dyn ConfigAccess, dev: &mut Device, alloc: &mut dyn Allocator) {
    let addr = dev.address;

    // The I/O window registers are 8-bit with 4 KiB significance, plus
    // 16-bit upper halves.
    let mut moving_base = u64::from(moving_bits8(access, addr, offset::type1::IO_BASE)) << 8;
    moving_base |= u64::from(moving_bits16(access, addr, offset::type1::IO_BASE_UPPER16)) << 16;

    let mut moving_limit = u64::from(moving_bits8(access, addr, offset::type1::IO_LIMIT)) << 8;
    moving_limit |= u64::from(moving_bits16(access, addr, offset::type1::IO_LIMIT_UPPER16)) << 16;

    record_bridge_window(
        access,
        dev,
        moving_base & moving_limit,
        offset::type1::IO_BASE,
        ResourceFlags::IO,
        ResourceFlags::IO,
        alloc,
    );

    // The prefetchable window is 16-bit with 1 MiB significance and may
    // extend to 64 bits through separate upper-32 registers.
    let mut moving_base =
        u64::from(moving_bits16(access, addr, offset::type1::PREF_MEMORY_BASE)) << 16;
    moving_base |= u64::from(moving_bits32(access, addr, offset::type1::PREF_BASE_UPPER32)) << 32;

    let mut moving_limit =
        u64::from(moving_bits16(access, addr, offset::type1::PREF_MEMORY_LIMIT)) << 16;
    moving_limit |= u64::from(moving_bits32(access, addr, offset::type1::PREF_LIMIT_UPPER32)) << 32;

    record_bridge_window(
        access,
        dev,
        moving_base & moving_limit,
        offset::type1::PREF_MEMORY_BASE,
        ResourceFlags::MEM | ResourceFlags::PREFETCH,
        ResourceFlags::MEM | ResourceFlags::PREFETCH,
        alloc,
    );

    // The plain memory window is 16-bit with 1 MiB significance.
    let moving_base = u64::from(moving_bits16(access, addr, offset::type1::MEMORY_BASE)) << 16;
    let moving_limit = u64::from(moving_bits16(access, addr, offset::type1::MEMORY_LIMIT)) << 16;

    record_bridge_window(
        access,
        dev,
        moving_base & moving_limit,
        offset::type1::MEMORY_BASE,
        ResourceFlags::MEM | ResourceFlags::PREFETCH,
        ResourceFlags::MEM,
        alloc,
    );
}

/// Discover all resources of a normal device.
pub fn read_device_resources(
    access: &mut dyn ConfigAccess,
    dev: &mut Device,
    alloc: &mut dyn Allocator,
) {
    read_bases(access, dev, 6);
    read_rom_resource(access, dev, offset::type0::ROM_BAR);
    alloc.compact(dev);
}

/// Discover all resources of a bridge: its three windows plus its two own
/// BARs and ROM.
pub fn read_bridge_resources(
    access: &mut dyn ConfigAccess,
    dev: &mut Device,
    alloc: &mut dyn Allocator,
) {
    read_bridge_windows(access, dev, alloc);
    read_bases(access, dev, 2);
    read_rom_resource(access, dev, offset::type1::ROM_BAR);
    alloc.compact(dev);
}

/// Discover resources for every enabled, bound device on a bus.
///
/// Buses behind bridges are read first: a bridge window can only be sized
/// once the demand behind it is known.
pub fn read_bus_resources(
    access: &mut dyn ConfigAccess,
    link: &mut BusLink,
    alloc: &mut dyn Allocator,
) {
    for child in &mut link.children {
        let Some(ops) = child.ops else { continue };
        if !child.enabled {
            continue;
        }

        if ops.scans_bus() {
            if let Some(downstream) = child.link.as_deref_mut() {
                read_bus_resources(access, downstream, alloc);
            }
            read_bridge_resources(access, child, alloc);
        } else {
            read_device_resources(access, child, alloc);
        }
    }
}

/// Record the domain root's own windows: the system-wide I/O and memory
/// spaces, decoded subtractively.
pub fn read_domain_resources(dev: &mut Device) {
    let res = dev.new_resource(subtractive_index(0));
    res.limit = 0xFFFF;
    res.flags = ResourceFlags::IO | ResourceFlags::SUBTRACTIVE | ResourceFlags::ASSIGNED;

    let res = dev.new_resource(subtractive_index(1));
    res.limit = 0xFFFF_FFFF;
    res.flags = ResourceFlags::MEM | ResourceFlags::SUBTRACTIVE | ResourceFlags::ASSIGNED;
}

/// Record a fixed RAM range on a device.
///
/// RAM is not relocatable and never committed; the record only exists so
/// the allocator and later boot stages see the occupied range.
pub fn add_ram_resource(dev: &mut Device, index: u32, basek: u64, sizek: u64) {
    if sizek == 0 {
        return;
    }

    let res = dev.new_resource(index);
    res.base = basek << 10;
    res.size = sizek << 10;
    res.flags = ResourceFlags::MEM
        | ResourceFlags::CACHEABLE
        | ResourceFlags::FIXED
        | ResourceFlags::STORED
        | ResourceFlags::ASSIGNED;

    debug!("adding RAM resource ({} bytes)", res.size);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::allocator::TreeAllocator;
    use crate::device::ops::DeviceOps;
    use crate::pci::access::BusDevFn;
    use crate::sim::config_space::SimDeviceBuilder;
    use crate::sim::host::SimHost;

    const ADDR: BusDevFn = BusDevFn::new(0, 2, 0);

    fn probed_device(host: &mut SimHost, builder: SimDeviceBuilder) -> Device {
        host.plug(ADDR.devfn, builder.device());
        Device::probed(ADDR)
    }

    #[test]
    fn sizes_a_plain_memory_bar() {
        let mut host = SimHost::new();
        let mut dev = probed_device(
            &mut host,
            SimDeviceBuilder::new(0x8086, 0x100E).mem32_bar(0, 0x4000),
        );

        read_device_resources(&mut host, &mut dev, &mut TreeAllocator);

        let res = dev.resource(0x10).unwrap();
        assert_eq!(res.flags, ResourceFlags::MEM);
        assert_eq!(res.size, 0x4000);
        assert_eq!(res.align, 14);
        assert_eq!(res.limit, 0xFFFF_FFFF);
    }

    #[test]
    fn io_bars_are_capped_to_16_bit_space() {
        let mut host = SimHost::new();
        let mut dev = probed_device(
            &mut host,
            // An I/O decoder that implements all 32 address bits; we still
            // refuse to place it above 64 KiB.
            SimDeviceBuilder::new(0x8086, 0x100E).io_bar_wide(0, 0x100),
        );

        read_device_resources(&mut host, &mut dev, &mut TreeAllocator);

        let res = dev.resource(0x10).unwrap();
        assert_eq!(res.flags, ResourceFlags::IO);
        assert_eq!(res.size, 0x100);
        assert_eq!(res.limit, 0xFFFF);
    }

    #[test]
    fn sizes_a_64_bit_prefetchable_bar() {
        let mut host = SimHost::new();
        let mut dev = probed_device(
            &mut host,
            SimDeviceBuilder::new(0x8086, 0x100E).mem64_prefetchable_bar(2, 0x10000),
        );

        read_device_resources(&mut host, &mut dev, &mut TreeAllocator);

        let res = dev.resource(0x18).unwrap();
        assert!(res.flags.contains(ResourceFlags::PCI64));
        assert!(res.flags.contains(ResourceFlags::PREFETCH));
        assert_eq!(res.size, 0x10000);
        assert_eq!(res.limit, u64::MAX);

        // The upper half is consumed; no separate record exists for it.
        assert!(dev.resource(0x1C).is_none());
    }

    #[test]
    fn a_32_bit_bar_never_carries_the_64_bit_flag() {
        let mut host = SimHost::new();
        let mut dev = probed_device(
            &mut host,
            SimDeviceBuilder::new(0x8086, 0x100E).mem32_bar(0, 0x1000),
        );

        read_device_resources(&mut host, &mut dev, &mut TreeAllocator);

        assert!(!dev
            .resource(0x10)
            .unwrap()
            .flags
            .contains(ResourceFlags::PCI64));
    }

    #[test]
    fn legacy_1m_bar_gets_the_low_limit() {
        let mut host = SimHost::new();
        let mut dev = probed_device(
            &mut host,
            SimDeviceBuilder::new(0x8086, 0x100E).mem_1m_bar(0, 0x8000),
        );

        read_device_resources(&mut host, &mut dev, &mut TreeAllocator);

        assert_eq!(dev.resource(0x10).unwrap().limit, 0x000F_FFFF);
    }

    #[test]
    fn read_only_nonzero_bar_is_discarded() {
        // Modelled on the Acer M7229, whose BAR1 reads 0x1F1 and does not
        // size.
        let mut host = SimHost::new();
        let mut dev = probed_device(
            &mut host,
            SimDeviceBuilder::new(0x8086, 0x100E).raw_bar(1, 0x1F1, 0),
        );

        read_device_resources(&mut host, &mut dev, &mut TreeAllocator);

        assert!(dev.resource(0x14).is_none());
    }

    #[test]
    fn invalid_limit_encoding_is_discarded() {
        let mut host = SimHost::new();
        let mut dev = probed_device(
            &mut host,
            // Limit-class bits 0b110 are reserved.
            SimDeviceBuilder::new(0x8086, 0x100E).raw_bar(0, 0x6, 0xFFFF_F000),
        );

        read_device_resources(&mut host, &mut dev, &mut TreeAllocator);

        assert!(dev.resource(0x10).is_none());
    }

    #[test]
    fn rom_window_is_read_only_memory() {
        let mut host = SimHost::new();
        let mut dev = probed_device(
            &mut host,
            SimDeviceBuilder::new(0x8086, 0x100E).rom_bar(0x2_0000),
        );

        read_device_resources(&mut host, &mut dev, &mut TreeAllocator);

        let res = dev.resource(0x30).unwrap();
        assert_eq!(res.flags, ResourceFlags::MEM | ResourceFlags::READONLY);
        assert_eq!(res.size, 0x2_0000);
    }

    #[test]
    fn declared_rom_address_short_circuits_the_probe() {
        let mut host = SimHost::new();
        let mut dev = probed_device(
            &mut host,
            SimDeviceBuilder::new(0x8086, 0x100E).rom_bar(0x2_0000),
        );
        dev.on_board = true;
        dev.rom_address = 0xFFFE_0000;

        read_device_resources(&mut host, &mut dev, &mut TreeAllocator);

        let res = dev.resource(0x30).unwrap();
        assert!(res.flags.contains(ResourceFlags::FIXED));
        assert!(res.assigned());
        assert_eq!(res.base, 0xFFFE_0000);

        // The ROM register itself was never probed.
        assert_eq!(host.writes_to(ADDR, 0x30), 0);
    }

    fn bridge_with_child(host: &mut SimHost, child: Option<SimDeviceBuilder>) -> Device {
        let has_child = child.is_some();

        host.plug_bridge(
            4 << 3,
            SimDeviceBuilder::bridge(0x8086, 0x244E)
                .io_window()
                .mem_window()
                .pref_window(),
        );
        if let Some(builder) = child {
            host.plug_behind(4 << 3, 0, builder.device());
        }

        let mut dev = Device::probed(BusDevFn::new(0, 4, 0));
        dev.hdr_type = 1;
        dev.ops = Some(DeviceOps::bridge(crate::device::ops::OpsKind::PciBridge));

        let mut link = BusLink::new();
        link.secondary = 1;
        link.subordinate = 1;
        if has_child {
            let mut grandchild = Device::probed(BusDevFn::new(1, 0, 0));
            grandchild.ops = Some(DeviceOps::generic_device());
            link.children.push(grandchild);
        }
        dev.link = Some(Box::new(link));
        dev
    }

    #[test]
    fn bridge_window_size_tracks_downstream_demand() {
        let mut host = SimHost::new();
        let child = SimDeviceBuilder::new(0x8086, 0x100E).mem32_bar(0, 0x1000);
        let mut bridge = bridge_with_child(&mut host, Some(child));

        // Wire up the bridge so config cycles reach bus 1.
        host.write32(BusDevFn::new(0, 4, 0), 0x18, 0x00FF_0100);

        read_bus_resources(
            &mut host,
            bridge.link.as_deref_mut().unwrap(),
            &mut TreeAllocator,
        );
        read_bridge_resources(&mut host, &mut bridge, &mut TreeAllocator);

        let window = bridge.resource(0x20).unwrap();
        assert!(window.flags.contains(ResourceFlags::BRIDGE));
        // Demand rounds up to the window's 1 MiB grain.
        assert_eq!(window.size, 0x10_0000);
    }

    #[test]
    fn empty_bridge_window_is_collapsed() {
        let mut host = SimHost::new();
        let mut bridge = bridge_with_child(&mut host, None);

        read_bridge_resources(&mut host, &mut bridge, &mut TreeAllocator);

        // All three windows had nothing behind them: records cleared, and
        // the degenerate base (the raw moving mask) written back closes
        // the window (limit below base).
        assert!(bridge.resources.is_empty());

        let addr = BusDevFn::new(0, 4, 0);
        let mem_base = host.read16(addr, offset::type1::MEMORY_BASE);
        let mem_limit = host.read16(addr, offset::type1::MEMORY_LIMIT);
        assert!(mem_limit < mem_base);
    }

    #[test]
    fn half_wired_window_is_not_a_window() {
        let mut host = SimHost::new();
        // Base register moves, limit register is hardwired: the
        // intersection is empty, so no memory window may be recorded.
        host.plug(
            4 << 3,
            SimDeviceBuilder::bridge(0x8086, 0x244E)
                .raw16(offset::type1::MEMORY_BASE, 0, 0xFFF0)
                .device(),
        );

        let mut dev = Device::probed(BusDevFn::new(0, 4, 0));
        dev.hdr_type = 1;
        dev.link = Some(Box::new(BusLink::new()));

        read_bridge_resources(&mut host, &mut dev, &mut TreeAllocator);

        assert!(dev.resource(u32::from(offset::type1::MEMORY_BASE)).is_none());
    }

    #[test]
    fn domain_resources_are_subtractive_and_preassigned() {
        let mut root = Device::domain(0);
        read_domain_resources(&mut root);

        assert_eq!(root.resources.len(), 2);
        for res in &root.resources {
            assert!(res.flags.contains(ResourceFlags::SUBTRACTIVE));
            assert!(res.assigned());
        }
        assert_eq!(root.resources[0].limit, 0xFFFF);
        assert_eq!(root.resources[1].limit, 0xFFFF_FFFF);
    }
}
