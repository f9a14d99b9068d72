//! # Static Board Configuration
//!
//! Boards declare devices they know about up front: soldered-down
//! controllers, devices with fixed option-ROM mappings, or functions that
//! only appear after a board-specific enable sequence. The declarations
//! pre-populate the device tree before enumeration runs; probing then
//! re-links the declared records with what hardware reports.

use thiserror::Error;

use crate::device::ops::DeviceOps;
use crate::device::tree::{BusLink, Device, DevicePath};

/// A declaration of one expected device.
#[derive(Debug, Clone, Default)]
pub struct StaticDevice {
    /// Encoded device/function pair on the declared bus.
    pub devfn: u8,

    /// Whether the board expects the device to be usable. A declared but
    /// disabled device is scanned (its functions may hide others) without
    /// being treated as an error when absent.
    pub disabled: bool,

    /// Fixed expansion-ROM address for on-board ROM images.
    pub rom_address: Option<u64>,

    /// Subsystem IDs to program into the device at enable time.
    pub subsystem: Option<(u16, u16)>,

    /// Board-supplied capability set, typically carrying enable hooks.
    pub ops: Option<DeviceOps>,

    /// Devices declared behind this one, when it is a bridge.
    pub children: Vec<StaticDevice>,
}

impl StaticDevice {
    /// Declare a device at a slot/function position.
    #[must_use]
    pub fn at(slot: u8, func: u8) -> Self {
        Self {
            devfn: (slot << 3) | (func & 0x7),
            ..Self::default()
        }
    }

    /// Attach a fixed expansion-ROM address.
    #[must_use]
    pub fn rom_at(mut self, address: u64) -> Self {
        self.rom_address = Some(address);
        self
    }

    /// Attach subsystem IDs to program at enable time.
    #[must_use]
    pub fn subsystem(mut self, vendor: u16, device: u16) -> Self {
        self.subsystem = Some((vendor, device));
        self
    }

    /// Attach a board-supplied capability set.
    #[must_use]
    pub fn ops(mut self, ops: DeviceOps) -> Self {
        self.ops = Some(ops);
        self
    }

    /// Declare a child device behind this (bridge) device.
    #[must_use]
    pub fn child(mut self, child: Self) -> Self {
        self.children.push(child);
        self
    }
}

/// The static device tree of a board.
#[derive(Debug, Clone, Default)]
pub struct BoardConfig {
    /// The PCI domain the declarations apply to.
    pub domain: u16,

    /// Devices declared on the domain's root bus.
    pub devices: Vec<StaticDevice>,
}

/// A board configuration that cannot describe real hardware.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BoardConfigError {
    /// Two declarations claim the same slot and function.
    #[error("duplicate static device at {slot:02x}.{func} on bus depth {depth}")]
    DuplicatePath {
        /// Slot of the colliding declaration.
        slot: u8,
        /// Function of the colliding declaration.
        func: u8,
        /// Nesting depth of the bus the collision is on.
        depth: usize,
    },
}

fn build_children(
    entries: &[StaticDevice],
    depth: usize,
) -> Result<Vec<Device>, BoardConfigError> {
    let mut children: Vec<Device> = Vec::with_capacity(entries.len());

    for entry in entries {
        let path = DevicePath::Pci { devfn: entry.devfn };
        if children.iter().any(|dev| dev.path == path) {
            return Err(BoardConfigError::DuplicatePath {
                slot: entry.devfn >> 3,
                func: entry.devfn & 7,
                depth,
            });
        }

        let mut dev = Device::declared(entry.devfn);
        dev.enabled = !entry.disabled;
        dev.rom_address = entry.rom_address.unwrap_or(0);
        dev.subsystem_override = entry.subsystem;
        dev.ops = entry.ops;

        if !entry.children.is_empty() {
            let mut link = BusLink::new();
            link.children = build_children(&entry.children, depth + 1)?;
            dev.link = Some(Box::new(link));
        }

        children.push(dev);
    }

    Ok(children)
}

impl BoardConfig {
    /// Build the initial device tree: a domain root whose bus 0 carries the
    /// declared devices.
    pub fn build_tree(&self) -> Result<Device, BoardConfigError> {
        let mut root = Device::domain(self.domain);
        root.link.as_mut().unwrap().children = build_children(&self.devices, 0)?;
        Ok(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_nested_declarations() {
        let config = BoardConfig {
            domain: 0,
            devices: vec![
                StaticDevice::at(2, 0).rom_at(0xFFFE_0000),
                StaticDevice::at(4, 0).child(StaticDevice::at(0, 0)),
            ],
        };

        let root = config.build_tree().unwrap();
        let bus0 = root.link.as_ref().unwrap();

        assert_eq!(bus0.children.len(), 2);
        assert_eq!(bus0.children[0].rom_address, 0xFFFE_0000);
        assert!(bus0.children[0].on_board);

        let bridge = &bus0.children[1];
        assert_eq!(bridge.path, DevicePath::Pci { devfn: 4 << 3 });
        assert_eq!(bridge.link.as_ref().unwrap().children.len(), 1);
    }

    #[test]
    fn duplicate_declarations_are_rejected() {
        let config = BoardConfig {
            domain: 0,
            devices: vec![StaticDevice::at(2, 0), StaticDevice::at(2, 0)],
        };

        assert_eq!(
            config.build_tree().unwrap_err(),
            BoardConfigError::DuplicatePath {
                slot: 2,
                func: 0,
                depth: 0
            }
        );
    }
}
