//! # The Simulated Host
//!
//! [`SimHost`] glues simulated devices into a machine: a root bus of
//! functions, bridges with downstream buses behind them, and a
//! [`ConfigAccess`] implementation that routes configuration cycles the way
//! hardware does — through each bridge's *live* secondary/subordinate
//! registers, so a bus only becomes reachable once the enumerator has
//! numbered the bridge in front of it.
//!
//! Unclaimed cycles read all-ones and drop writes, which is what a master
//! abort looks like to firmware.

use std::collections::{BTreeMap, HashMap};

use crate::pci::access::{BusDevFn, ConfigAccess};
use crate::pci::constants::config_space::{offset, SIZE};
use crate::sim::register_set::RegisterSet;

/// One simulated PCI function, optionally bridging to a downstream bus.
#[derive(Debug, Clone)]
pub struct SimDevice {
    config: RegisterSet<SIZE>,
    downstream: Option<SimBus>,
}

impl SimDevice {
    pub(crate) fn new(config: RegisterSet<SIZE>) -> Self {
        Self {
            config,
            downstream: None,
        }
    }
}

/// A set of simulated functions, keyed by devfn.
#[derive(Debug, Clone, Default)]
pub struct SimBus {
    devices: BTreeMap<u8, SimDevice>,
}

impl SimBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a function at the given devfn.
    pub fn plug(&mut self, devfn: u8, device: SimDevice) {
        self.devices.insert(devfn, device);
    }

    /// Attach a bridge at the given devfn with `downstream` behind it.
    pub fn plug_bridge(
        &mut self,
        devfn: u8,
        builder: crate::sim::config_space::SimDeviceBuilder,
        downstream: Self,
    ) {
        let mut device = builder.device();
        device.downstream = Some(downstream);
        self.devices.insert(devfn, device);
    }

    /// Route a configuration cycle towards `target` bus number.
    ///
    /// `current` is the bus number this bus responds to; a mismatch walks
    /// into whichever bridge claims the target through its live
    /// secondary/subordinate registers.
    fn route(&mut self, current: u8, target: u8, devfn: u8) -> Option<&mut RegisterSet<SIZE>> {
        if current == target {
            return self.devices.get_mut(&devfn).map(|dev| &mut dev.config);
        }

        let claiming_devfn = self.devices.iter().find_map(|(dfn, dev)| {
            dev.downstream.as_ref()?;
            let secondary = dev.config.read8(offset::type1::SECONDARY_BUS);
            let subordinate = dev.config.read8(offset::type1::SUBORDINATE_BUS);
            (secondary != 0 && secondary <= target && target <= subordinate).then_some(*dfn)
        })?;

        let bridge = self.devices.get_mut(&claiming_devfn).unwrap();
        let secondary = bridge.config.read8(offset::type1::SECONDARY_BUS);
        bridge
            .downstream
            .as_mut()
            .unwrap()
            .route(secondary, target, devfn)
    }
}

/// A simulated machine: the domain's root bus plus access bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct SimHost {
    root: SimBus,
    writes: u64,
    writes_per_register: HashMap<(u8, u8, u16), u64>,
}

impl SimHost {
    /// Create a machine with an empty root bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The root bus, for building nested topologies.
    pub fn root_mut(&mut self) -> &mut SimBus {
        &mut self.root
    }

    /// Attach a function on the root bus.
    pub fn plug(&mut self, devfn: u8, device: SimDevice) {
        self.root.plug(devfn, device);
    }

    /// Attach a bridge with an empty downstream bus on the root bus.
    pub fn plug_bridge(
        &mut self,
        devfn: u8,
        builder: crate::sim::config_space::SimDeviceBuilder,
    ) {
        self.root.plug_bridge(devfn, builder, SimBus::new());
    }

    /// Attach a function behind a root-bus bridge previously added with
    /// [`plug_bridge`](Self::plug_bridge).
    pub fn plug_behind(&mut self, bridge_devfn: u8, devfn: u8, device: SimDevice) {
        self.root
            .devices
            .get_mut(&bridge_devfn)
            .and_then(|bridge| bridge.downstream.as_mut())
            .expect("no bridge at that devfn")
            .plug(devfn, device);
    }

    /// Total number of write cycles issued, claimed or not.
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.writes
    }

    /// Number of write cycles issued to one specific register.
    #[must_use]
    pub fn writes_to(&self, addr: BusDevFn, reg: u16) -> u64 {
        *self
            .writes_per_register
            .get(&(addr.bus, addr.devfn, reg))
            .unwrap_or(&0)
    }

    fn count_write(&mut self, addr: BusDevFn, reg: u16) {
        self.writes += 1;
        *self
            .writes_per_register
            .entry((addr.bus, addr.devfn, reg))
            .or_insert(0) += 1;
    }

    fn target(&mut self, addr: BusDevFn) -> Option<&mut RegisterSet<SIZE>> {
        self.root.route(0, addr.bus, addr.devfn)
    }
}

impl ConfigAccess for SimHost {
    fn read8(&mut self, addr: BusDevFn, reg: u16) -> u8 {
        self.target(addr).map_or(0xFF, |cfg| cfg.read8(reg))
    }

    fn read16(&mut self, addr: BusDevFn, reg: u16) -> u16 {
        self.target(addr).map_or(0xFFFF, |cfg| cfg.read16(reg))
    }

    fn read32(&mut self, addr: BusDevFn, reg: u16) -> u32 {
        self.target(addr).map_or(0xFFFF_FFFF, |cfg| cfg.read32(reg))
    }

    fn write8(&mut self, addr: BusDevFn, reg: u16, value: u8) {
        self.count_write(addr, reg);
        if let Some(cfg) = self.target(addr) {
            cfg.write8(reg, value);
        }
    }

    fn write16(&mut self, addr: BusDevFn, reg: u16, value: u16) {
        self.count_write(addr, reg);
        if let Some(cfg) = self.target(addr) {
            cfg.write16(reg, value);
        }
    }

    fn write32(&mut self, addr: BusDevFn, reg: u16, value: u32) {
        self.count_write(addr, reg);
        if let Some(cfg) = self.target(addr) {
            cfg.write32(reg, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::config_space::SimDeviceBuilder;

    #[test]
    fn empty_slots_read_all_ones() {
        let mut host = SimHost::new();

        assert_eq!(host.read32(BusDevFn::new(0, 1, 0), 0), 0xFFFF_FFFF);
        assert_eq!(host.read16(BusDevFn::new(3, 0, 0), 0), 0xFFFF);
    }

    #[test]
    fn writes_to_empty_slots_are_dropped_but_counted() {
        let mut host = SimHost::new();

        host.write32(BusDevFn::new(0, 1, 0), 0x10, 0x1234);
        assert_eq!(host.write_count(), 1);
        assert_eq!(host.writes_to(BusDevFn::new(0, 1, 0), 0x10), 1);
    }

    #[test]
    fn downstream_bus_is_unreachable_until_numbered() {
        let mut host = SimHost::new();
        host.plug_bridge(4 << 3, SimDeviceBuilder::bridge(0x8086, 0x244E));
        host.plug_behind(4 << 3, 0, SimDeviceBuilder::new(0x8086, 0x100E).device());

        let behind = BusDevFn::new(1, 0, 0);
        assert_eq!(host.read32(behind, 0), 0xFFFF_FFFF);

        // Program primary/secondary/subordinate; now the cycle routes.
        host.write32(BusDevFn::new(0, 4, 0), offset::type1::PRIMARY_BUS, 0x00FF_0100);
        assert_eq!(host.read32(behind, 0), 0x100E_8086);
    }
}
