//! # PCI Constants
//!
//! This module collects PCI related constants. All definitions are derived
//! from the PCI Spec, either the "PCI Local Bus Specification" or newer
//! "PCI Express Base Specification" documents.

// Allow missing docs to avoid duplicating the PCI spec for all constants.
#![allow(missing_docs)]

/// The maximum number of busses on a PCI segment.
pub const MAX_BUSES: usize = 256;

/// The maximum number of devices on a PCI bus.
pub const MAX_BUS_DEVICES: usize = 32;

/// The maximum number of functions in a PCI device.
pub const MAX_DEVICE_FUNCTIONS: usize = 8;

/// Constants related to the configuration space.
pub mod config_space {

    /// The config space size of a single PCI device in bytes.
    pub const SIZE: usize = 256;

    /// The number of Base Address Registers of a type-0 header.
    pub const MAX_BARS: usize = 6;

    /// The number of Base Address Registers of a type-1 (bridge) header.
    pub const MAX_BRIDGE_BARS: usize = 2;

    /// The offsets of various fields in the configuration space.
    ///
    /// Offsets up to `0x3F` that are not shared between header types are
    /// grouped in the [`type0`] and [`type1`] submodules.
    pub mod offset {
        pub const VENDOR: u16 = 0x0;
        pub const DEVICE: u16 = 0x2;
        pub const COMMAND: u16 = 0x4;
        pub const STATUS: u16 = 0x6;
        pub const REVISION: u16 = 0x8;
        pub const PROG_IF: u16 = 0x9;
        pub const SUBCLASS: u16 = 0xA;
        pub const CLASS: u16 = 0xB;
        pub const CACHE_LINE_SIZE: u16 = 0xC;
        pub const LATENCY_TIMER: u16 = 0xD;
        pub const HEADER_TYPE: u16 = 0xE;
        pub const BIST: u16 = 0xF;

        pub const BAR_0: u16 = 0x10;

        pub const CAPABILITIES_POINTER: u16 = 0x34;
        pub const IRQ_LINE: u16 = 0x3C;
        pub const IRQ_PIN: u16 = 0x3D;

        /// Fields specific to the type-0 (normal device) header.
        pub mod type0 {
            pub const SUBSYSTEM_VENDOR_ID: u16 = 0x2C;
            pub const SUBSYSTEM_ID: u16 = 0x2E;
            pub const ROM_BAR: u16 = 0x30;
            pub const MIN_GNT: u16 = 0x3E;
            pub const MAX_LAT: u16 = 0x3F;
        }

        /// Fields specific to the type-1 (PCI-to-PCI bridge) header.
        pub mod type1 {
            /// Primary, secondary and subordinate bus number plus the
            /// secondary latency timer, accessed as one 32-bit register.
            pub const PRIMARY_BUS: u16 = 0x18;
            pub const SECONDARY_BUS: u16 = 0x19;
            pub const SUBORDINATE_BUS: u16 = 0x1A;
            pub const SEC_LATENCY_TIMER: u16 = 0x1B;

            pub const IO_BASE: u16 = 0x1C;
            pub const IO_LIMIT: u16 = 0x1D;
            pub const SEC_STATUS: u16 = 0x1E;
            pub const MEMORY_BASE: u16 = 0x20;
            pub const MEMORY_LIMIT: u16 = 0x22;
            pub const PREF_MEMORY_BASE: u16 = 0x24;
            pub const PREF_MEMORY_LIMIT: u16 = 0x26;
            pub const PREF_BASE_UPPER32: u16 = 0x28;
            pub const PREF_LIMIT_UPPER32: u16 = 0x2C;
            pub const IO_BASE_UPPER16: u16 = 0x30;
            pub const IO_LIMIT_UPPER16: u16 = 0x32;
            pub const ROM_BAR: u16 = 0x38;
            pub const BRIDGE_CONTROL: u16 = 0x3E;
        }
    }

    /// Attribute bits of a Base Address Register.
    ///
    /// The low bits of a BAR do not take part in address decoding. They
    /// describe what kind of window the register requests.
    pub mod bar {
        /// Bit 0 distinguishes I/O (set) from memory (clear) windows.
        pub const SPACE_IO: u32 = 0x1;

        /// All attribute bits of an I/O BAR.
        pub const IO_ATTR_MASK: u32 = 0x3;

        /// All attribute bits of a memory BAR.
        pub const MEM_ATTR_MASK: u32 = 0xF;

        /// The limit-class field of a memory BAR.
        pub const MEM_LIMIT_MASK: u32 = 0x6;
        pub const MEM_LIMIT_32: u32 = 0x0;
        pub const MEM_LIMIT_1M: u32 = 0x2;
        pub const MEM_LIMIT_64: u32 = 0x4;

        /// Memory window is safe for prefetching.
        pub const MEM_PREFETCH: u32 = 0x8;

        /// Decode-enable bit of the expansion ROM register.
        pub const ROM_ENABLE: u32 = 0x1;
    }

    /// Command Register Constants.
    pub mod command {
        pub const IO: u16 = 1 << 0;
        pub const MEMORY: u16 = 1 << 1;
        pub const MASTER: u16 = 1 << 2;
        pub const PARITY: u16 = 1 << 6;
        pub const SERR: u16 = 1 << 8;

        pub const WRITABLE_BITS: u16 = 0x077F;
    }

    /// Status Register Constants.
    pub mod status {
        /// The device has a list of capabilities starting at
        /// [`CAPABILITIES_POINTER`](super::offset::CAPABILITIES_POINTER).
        pub const CAPABILITIES: u16 = 1 << 4;
    }

    /// Bridge Control Register Constants.
    pub mod bridge_control {
        pub const PARITY: u16 = 1 << 0;
        pub const SERR: u16 = 1 << 1;
        pub const VGA: u16 = 1 << 3;
        pub const BUS_RESET: u16 = 1 << 6;
    }

    /// PCI base class constants.
    pub mod class {
        pub const BRIDGE: u8 = 0x6;
        pub const SYSTEM: u8 = 0x8;

        /// Combined (base << 8 | sub) class code of a PCI-to-PCI bridge.
        pub const BRIDGE_PCI: u16 = 0x0604;
    }

    /// PCI sub-class constants.
    pub mod subclass {
        pub const HOST_BRIDGE: u8 = 0x0;
        pub const PCI_TO_PCI_BRIDGE: u8 = 0x4;
    }

    /// PCI header type.
    pub mod header_type {
        pub const NORMAL: u8 = 0;
        pub const BRIDGE: u8 = 1;

        /// Mask for the type field without the multifunction bit.
        pub const TYPE_MASK: u8 = 0x7F;
        pub const MULTIFUNCTION: u8 = 1 << 7;
    }

    /// The device vendor.
    pub mod vendor {
        pub const INVALID: u16 = 0xFFFF;
        pub const INTEL: u16 = 0x8086;
        pub const REDHAT: u16 = 0x1b36;
    }

    /// IDs for PCI Capabilities.
    pub mod capability_id {
        pub const POWER_MANAGEMENT: u8 = 0x01;
        pub const MSI: u8 = 0x05;
        pub const PCIX: u8 = 0x07;
        pub const HYPERTRANSPORT: u8 = 0x08;
        pub const VENDOR_SPECIFIC: u8 = 0x09;
        pub const PCI_EXPRESS: u8 = 0x10;
        pub const MSI_X: u8 = 0x11;
    }

    /// Layout of the capability list.
    pub mod capability_list {
        /// Offset of the next pointer within a capability header.
        pub const NEXT_POINTER: u16 = 1;

        /// The low two bits of a next pointer are reserved.
        pub const POINTER_MASK: u8 = 0xFC;

        /// Capabilities live in the device-dependent region.
        pub const FIRST_VALID_OFFSET: u8 = 0x40;

        /// Hop cap that bounds traversal of corrupt or cyclic lists.
        pub const MAX_HOPS: usize = 48;

        /// Known corrupt-hardware sentinel that ends a walk early.
        pub const CORRUPT_ID: u8 = 0xFF;
    }

    /// Fields of the PCI Express capability.
    pub mod pcie {
        /// Offset of the flags register within the capability.
        pub const FLAGS: u16 = 2;

        /// The device/port type field of the flags register.
        pub const FLAGS_TYPE: u16 = 0x00F0;

        pub mod port_type {
            pub const ROOT_PORT: u16 = 0x4;
            pub const UPSTREAM: u16 = 0x5;
            pub const DOWNSTREAM: u16 = 0x6;
            pub const PCI_BRIDGE: u16 = 0x7;
        }
    }

    /// Fields of the HyperTransport capability.
    pub mod hypertransport {
        /// Offset of the command/flags register within the capability.
        pub const FLAGS: u16 = 2;

        /// Value of the capability-type field (flags bits 15:13) for a
        /// Host/Secondary interface block.
        pub const TYPE_HOST_SECONDARY: u16 = 1;
    }
}

/// Values every scanned device is normalized to at commit time.
pub mod defaults {
    /// Latency timer in PCI clocks.
    pub const LATENCY_TIMER: u8 = 0x40;

    /// Cache line size register value (64 bytes, in 32-bit words).
    pub const CACHE_LINE_SIZE: u8 = 64 >> 2;
}
