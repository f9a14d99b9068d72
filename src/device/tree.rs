//! # The Device Tree
//!
//! One owned tree describes everything the platform knows about: each
//! [`BusLink`] owns an ordered list of child [`Device`]s, and each bridge
//! device owns zero or one downstream `BusLink`. There are no back-pointers;
//! traversals thread whatever context they need through the call.
//!
//! Statically declared devices pre-exist enumeration and are re-linked, not
//! recreated, when probing rediscovers them. A device that is absent in
//! hardware is marked disabled but never removed, so later boot stages can
//! still report it.

use std::fmt;

use tracing::info;

use crate::device::ops::DeviceOps;
use crate::device::resource::Resource;
use crate::pci::access::BusDevFn;
use crate::pci::constants::config_space::header_type;

/// What kind of node a [`Device`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevicePath {
    /// A plain PCI function, addressed by its encoded device/function pair.
    Pci {
        /// The encoded device/function pair on the upstream bus.
        devfn: u8,
    },

    /// The root of a PCI domain. Owns bus 0 of the domain.
    Domain {
        /// The domain (segment) number.
        domain: u16,
    },
}

impl fmt::Display for DevicePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pci { devfn } => write!(f, "pci {:02x}.{}", devfn >> 3, devfn & 7),
            Self::Domain { domain } => write!(f, "domain {domain:04x}"),
        }
    }
}

/// The downstream link of a bridge: the bus behind it.
#[derive(Debug, Default)]
pub struct BusLink {
    /// First bus number reachable behind the bridge (the bus directly
    /// behind it).
    pub secondary: u8,

    /// Last bus number reachable behind the bridge. Provisionally `0xFF`
    /// while the subtree scan runs, narrowed afterwards. Every descendant
    /// link's range nests inside `(secondary, subordinate]`.
    pub subordinate: u8,

    /// Bridge-control bits accumulated for the enable phase.
    pub bridge_ctrl: u16,

    /// The devices on this bus, in enumeration order.
    pub children: Vec<Device>,
}

impl BusLink {
    /// Create an empty link with no bus numbers assigned yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Detach the child with the given path, if present.
    ///
    /// Matching is by path equality, not identity: a statically declared
    /// device matches the hardware found at its declared slot whatever IDs
    /// that hardware reports.
    pub fn detach_child(children: &mut Vec<Device>, path: DevicePath) -> Option<Device> {
        let pos = children.iter().position(|child| child.path == path)?;
        Some(children.remove(pos))
    }
}

/// One PCI function (or the domain root), discovered or declared.
#[derive(Debug)]
pub struct Device {
    /// What this node is and where it sits on its parent bus.
    pub path: DevicePath,

    /// The address used for configuration cycles. Kept current by the scan
    /// pass; for statically declared devices it becomes meaningful once the
    /// parent bus is numbered.
    pub address: BusDevFn,

    /// Vendor ID.
    pub vendor: u16,
    /// Device ID.
    pub device: u16,
    /// Subsystem vendor ID as read from hardware.
    pub subsystem_vendor: u16,
    /// Subsystem device ID as read from hardware.
    pub subsystem_device: u16,

    /// Class code: base, sub-class and programming interface.
    pub class: u32,
    /// Raw header type, including the multifunction bit.
    pub hdr_type: u8,
    /// Revision ID.
    pub revision: u8,
    /// Status register snapshot from probe time.
    pub status: u16,
    /// Cache line size register snapshot.
    pub cache_line: u8,
    /// Interrupt line register snapshot.
    pub irq_line: u8,
    /// Interrupt pin register snapshot. Zero means no pin wired.
    pub irq_pin: u8,
    /// Minimum grant register snapshot.
    pub min_gnt: u8,
    /// Maximum latency register snapshot.
    pub max_lat: u8,

    /// Whether the device should be (and was found) usable. Statically
    /// declared devices that hardware does not report are disabled here,
    /// never removed from the tree.
    pub enabled: bool,

    /// Whether this device was statically declared by the board
    /// configuration rather than discovered by probing.
    pub on_board: bool,

    /// Fixed expansion-ROM address from the board configuration. Zero means
    /// none; a non-zero value short-circuits ROM probing.
    pub rom_address: u64,

    /// Board-supplied subsystem IDs to program at enable time.
    pub subsystem_override: Option<(u16, u16)>,

    /// Decode-enable bits accumulated during commit and written to the
    /// command register in one pass at enable time.
    pub command: u16,

    /// The capability set bound by operations resolution. Bound at most
    /// once, never reassigned.
    pub ops: Option<DeviceOps>,

    /// The device's address-space requests, in discovery order.
    pub resources: Vec<Resource>,

    /// The downstream bus, for bridges.
    pub link: Option<Box<BusLink>>,
}

impl Device {
    fn empty(path: DevicePath) -> Self {
        Self {
            path,
            address: BusDevFn::from_devfn(0, 0),
            vendor: 0,
            device: 0,
            subsystem_vendor: 0,
            subsystem_device: 0,
            class: 0,
            hdr_type: 0,
            revision: 0,
            status: 0,
            cache_line: 0,
            irq_line: 0,
            irq_pin: 0,
            min_gnt: 0,
            max_lat: 0,
            enabled: true,
            on_board: false,
            rom_address: 0,
            subsystem_override: None,
            command: 0,
            ops: None,
            resources: Vec::new(),
            link: None,
        }
    }

    /// Create a device record for hardware found by probing.
    #[must_use]
    pub fn probed(address: BusDevFn) -> Self {
        let mut dev = Self::empty(DevicePath::Pci {
            devfn: address.devfn,
        });
        dev.address = address;
        dev
    }

    /// Create a statically declared device.
    #[must_use]
    pub fn declared(devfn: u8) -> Self {
        let mut dev = Self::empty(DevicePath::Pci { devfn });
        dev.on_board = true;
        dev
    }

    /// Create the root device of a PCI domain, owning an empty bus 0.
    #[must_use]
    pub fn domain(domain: u16) -> Self {
        let mut dev = Self::empty(DevicePath::Domain { domain });
        dev.link = Some(Box::new(BusLink::new()));
        dev
    }

    /// The base class byte of the class code.
    #[must_use]
    pub const fn base_class(&self) -> u8 {
        (self.class >> 16) as u8
    }

    /// Base class and sub-class combined, as used for bridge matching.
    #[must_use]
    pub const fn class_device(&self) -> u16 {
        (self.class >> 8) as u16
    }

    /// Whether the header declares further functions in the same slot.
    #[must_use]
    pub const fn multifunction(&self) -> bool {
        self.hdr_type & header_type::MULTIFUNCTION != 0
    }

    /// Get or create the resource record for a register or synthetic index.
    ///
    /// Reusing an existing record keeps rediscovery idempotent: probing the
    /// same register twice mutates one record instead of growing the list.
    pub fn new_resource(&mut self, index: u32) -> &mut Resource {
        Resource::find_or_create(&mut self.resources, index)
    }

    /// Look up a resource by index.
    #[must_use]
    pub fn resource(&self, index: u32) -> Option<&Resource> {
        self.resources.iter().find(|res| res.index == index)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{:04x}:{:04x}] ({})",
            self.address,
            self.vendor,
            self.device,
            if self.enabled { "enabled" } else { "disabled" }
        )
    }
}

fn log_device(dev: &Device, depth: usize) {
    let indent = "  ".repeat(depth);
    info!("{indent}{dev}");

    for res in &dev.resources {
        if !res.flags.is_empty() {
            info!("{indent}  {res}");
        }
    }

    if let Some(link) = &dev.link {
        info!(
            "{indent}  bus [{:02x}..{:02x}]",
            link.secondary, link.subordinate
        );
        for child in &link.children {
            log_device(child, depth + 1);
        }
    }
}

/// Log the final tree, one line per device and live resource.
pub fn log_tree(root: &Device) {
    log_device(root, 0);
}
