//! # Device Operations Binding
//!
//! Every device gets a capability set — its "driver" — bound exactly once
//! during enumeration. The binding decides how later phases treat the
//! device: whether its resources are read as plain BARs or bridge windows,
//! and whether the scan recurses behind it.
//!
//! Resolution prefers a board/driver registry match over the generic
//! defaults, and distinguishes bridge flavors by inspecting the capability
//! list, the only reliable way to tell a plain PCI-to-PCI bridge from a
//! PCI Express, PCI-X or HyperTransport downstream bridge.

use tracing::{debug, error, trace};

use crate::device::tree::Device;
use crate::pci::access::ConfigAccess;
use crate::pci::capability::{find_capability, find_next_capability};
use crate::pci::constants::config_space::{
    capability_id, class, header_type, hypertransport, pcie,
};

/// A board-specific hook run on a device during enumeration.
pub type DeviceHook = fn(&mut Device, &mut dyn ConfigAccess);

/// What flavor of node a capability set drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpsKind {
    /// A leaf function with up to six BARs.
    Generic,
    /// A plain PCI-to-PCI bridge.
    PciBridge,
    /// A PCI Express root/downstream port.
    PcieBridge,
    /// A PCI-X bridge.
    PcixBridge,
    /// A HyperTransport secondary interface.
    HyperTransportBridge,
}

impl OpsKind {
    /// Whether devices of this kind own a downstream bus.
    #[must_use]
    pub const fn is_bridge(self) -> bool {
        !matches!(self, Self::Generic)
    }
}

/// The capability set bound to a device.
///
/// This is a late-bound, read-only association: chosen once per device
/// during enumeration and never reassigned.
#[derive(Debug, Clone, Copy)]
pub struct DeviceOps {
    /// The flavor this set drives.
    pub kind: OpsKind,

    /// Board-specific sequence required for the device to appear at all,
    /// run before the presence probe.
    pub enable_scan: Option<DeviceHook>,

    /// Board-specific enable/disable sequence, run after operations are
    /// bound.
    pub enable_disable: Option<DeviceHook>,
}

impl DeviceOps {
    /// The default capability set for a leaf function.
    #[must_use]
    pub const fn generic_device() -> Self {
        Self {
            kind: OpsKind::Generic,
            enable_scan: None,
            enable_disable: None,
        }
    }

    /// A bridge capability set of the given flavor.
    #[must_use]
    pub const fn bridge(kind: OpsKind) -> Self {
        Self {
            kind,
            enable_scan: None,
            enable_disable: None,
        }
    }

    /// Whether the scan should recurse behind this device.
    #[must_use]
    pub const fn scans_bus(&self) -> bool {
        self.kind.is_bridge()
    }
}

/// A registry of board/driver-supplied capability sets, keyed by device
/// identity.
pub trait DriverRegistry {
    /// Look up a capability set for a device identity.
    fn lookup(&self, vendor: u16, device: u16, class: u32) -> Option<DeviceOps>;
}

/// A registry without any entries; every device gets the defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyRegistry;

impl DriverRegistry for EmptyRegistry {
    fn lookup(&self, _vendor: u16, _device: u16, _class: u32) -> Option<DeviceOps> {
        None
    }
}

/// Pick the bridge flavor by walking the capability list.
///
/// PCI-X, PCI Express and HyperTransport downstream bridges all advertise a
/// distinguishing capability. When none is found, the device is treated as
/// a plain PCI-to-PCI bridge.
fn bridge_ops(access: &mut dyn ConfigAccess, dev: &Device) -> DeviceOps {
    let addr = dev.address;
    let hdr = dev.hdr_type;

    if find_capability(access, addr, hdr, capability_id::PCIX).is_some() {
        debug!("{}: subordinate bus is PCI-X", addr);
        return DeviceOps::bridge(OpsKind::PcixBridge);
    }

    let mut pos = find_capability(access, addr, hdr, capability_id::HYPERTRANSPORT);
    while let Some(cap) = pos {
        let flags = access.read16(addr, cap + hypertransport::FLAGS);
        if flags >> 13 == hypertransport::TYPE_HOST_SECONDARY {
            debug!("{}: subordinate bus is HyperTransport", addr);
            return DeviceOps::bridge(OpsKind::HyperTransportBridge);
        }
        pos = find_next_capability(access, addr, hdr, capability_id::HYPERTRANSPORT, Some(cap));
    }

    if let Some(cap) = find_capability(access, addr, hdr, capability_id::PCI_EXPRESS) {
        let flags = access.read16(addr, cap + pcie::FLAGS);
        match (flags & pcie::FLAGS_TYPE) >> 4 {
            pcie::port_type::ROOT_PORT | pcie::port_type::UPSTREAM | pcie::port_type::DOWNSTREAM => {
                debug!("{}: subordinate bus is PCI Express", addr);
                return DeviceOps::bridge(OpsKind::PcieBridge);
            }
            pcie::port_type::PCI_BRIDGE => {
                debug!("{}: subordinate bus is PCI behind a PCIe bridge", addr);
                return DeviceOps::bridge(OpsKind::PciBridge);
            }
            _ => {}
        }
    }

    DeviceOps::bridge(OpsKind::PciBridge)
}

/// Bind a capability set to a freshly probed device.
///
/// Order: an existing binding wins; then a registry match by identity; then
/// the header-type defaults. A header/class mismatch leaves the device
/// unbound — reported at error level when the configuration expected the
/// device enabled, since later phases will not recurse behind it or touch
/// its resources.
pub fn resolve_device_ops(
    access: &mut dyn ConfigAccess,
    dev: &mut Device,
    registry: &dyn DriverRegistry,
) {
    if dev.ops.is_some() {
        trace!("{}: already has operations bound", dev.address);
        return;
    }

    if let Some(ops) = registry.lookup(dev.vendor, dev.device, dev.class) {
        trace!(
            "{}: registry supplied {}operations",
            dev.address,
            if ops.scans_bus() { "bus " } else { "" }
        );
        dev.ops = Some(ops);
        return;
    }

    let bound = match dev.hdr_type & header_type::TYPE_MASK {
        header_type::NORMAL if dev.class_device() != class::BRIDGE_PCI => {
            Some(DeviceOps::generic_device())
        }
        header_type::BRIDGE if dev.class_device() == class::BRIDGE_PCI => {
            Some(bridge_ops(access, dev))
        }
        _ => None,
    };

    match bound {
        Some(ops) => dev.ops = Some(ops),
        None if dev.enabled => {
            error!(
                "{} [{:04x}:{:04x}] class {:06x} has unknown header type {:02x}, ignoring",
                dev.address, dev.vendor, dev.device, dev.class, dev.hdr_type
            );
        }
        None => {
            debug!(
                "{}: unknown header type {:02x} on disabled device",
                dev.address, dev.hdr_type
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pci::access::BusDevFn;
    use crate::sim::config_space::SimDeviceBuilder;
    use crate::sim::host::SimHost;

    const ADDR: BusDevFn = BusDevFn::new(0, 4, 0);

    fn probed(host: &mut SimHost, builder: SimDeviceBuilder) -> Device {
        host.plug(ADDR.devfn, builder.device());

        let mut dev = Device::probed(ADDR);
        dev.vendor = host.read16(ADDR, 0);
        dev.device = host.read16(ADDR, 2);
        dev.hdr_type = host.read8(ADDR, 0xE);
        dev.class = host.read32(ADDR, 0x8) >> 8;
        dev
    }

    #[test]
    fn normal_header_binds_generic_device_ops() {
        let mut host = SimHost::new();
        let mut dev = probed(&mut host, SimDeviceBuilder::new(0x8086, 0x100E));

        resolve_device_ops(&mut host, &mut dev, &EmptyRegistry);

        assert_eq!(dev.ops.unwrap().kind, OpsKind::Generic);
    }

    #[test]
    fn plain_bridge_binds_pci_bridge_ops() {
        let mut host = SimHost::new();
        let mut dev = probed(&mut host, SimDeviceBuilder::bridge(0x8086, 0x244E));

        resolve_device_ops(&mut host, &mut dev, &EmptyRegistry);

        let ops = dev.ops.unwrap();
        assert_eq!(ops.kind, OpsKind::PciBridge);
        assert!(ops.scans_bus());
    }

    #[test]
    fn pcie_root_port_is_distinguished_by_capability() {
        let mut host = SimHost::new();
        let builder = SimDeviceBuilder::bridge(0x8086, 0x3C0A)
            .capability(capability_id::PCI_EXPRESS, &[0x42, 0x00]);
        let mut dev = probed(&mut host, builder);

        resolve_device_ops(&mut host, &mut dev, &EmptyRegistry);

        assert_eq!(dev.ops.unwrap().kind, OpsKind::PcieBridge);
    }

    #[test]
    fn bridge_header_with_wrong_class_stays_unbound() {
        let mut host = SimHost::new();
        let mut dev = probed(
            &mut host,
            SimDeviceBuilder::bridge_with_class(0x8086, 0x244E, 0x06, 0x80),
        );

        resolve_device_ops(&mut host, &mut dev, &EmptyRegistry);

        assert!(dev.ops.is_none());
    }

    #[test]
    fn registry_match_wins_over_defaults() {
        #[derive(Debug)]
        struct OneEntry;

        impl DriverRegistry for OneEntry {
            fn lookup(&self, vendor: u16, device: u16, _class: u32) -> Option<DeviceOps> {
                (vendor == 0x8086 && device == 0x100E).then(DeviceOps::generic_device)
            }
        }

        let mut host = SimHost::new();
        let mut dev = probed(&mut host, SimDeviceBuilder::new(0x8086, 0x100E));

        resolve_device_ops(&mut host, &mut dev, &OneEntry);
        assert!(dev.ops.is_some());
    }

    #[test]
    fn existing_binding_is_never_replaced() {
        let mut host = SimHost::new();
        let mut dev = probed(&mut host, SimDeviceBuilder::bridge(0x8086, 0x244E));
        dev.ops = Some(DeviceOps::generic_device());

        resolve_device_ops(&mut host, &mut dev, &EmptyRegistry);

        assert_eq!(dev.ops.unwrap().kind, OpsKind::Generic);
    }
}
