//! # Simulated PCI Devices
//!
//! [`SimDeviceBuilder`] constructs configuration spaces that behave like
//! real hardware under the enumerator: BARs size through their write masks,
//! bridge windows split across their base/limit sub-registers, capability
//! chains link up, and broken hardware (read-only BARs, half-wired windows,
//! corrupt capability lists) can be modelled deliberately.

use crate::pci::constants::config_space::{
    bar, capability_list, command, header_type, offset, status, SIZE,
};
use crate::sim::host::SimDevice;
use crate::sim::register_set::RegisterSetBuilder;

/// The offset at which capabilities are allocated.
const INITIAL_CAPABILITY_OFFSET: u8 = capability_list::FIRST_VALID_OFFSET;

/// A builder for simulated PCI functions.
#[derive(Debug, Clone)]
pub struct SimDeviceBuilder {
    regs: RegisterSetBuilder<SIZE>,
    header: u8,
    multifunction: bool,
    interrupt_pin: u8,

    /// The offset where the next capability is placed. Must stay 4-byte
    /// aligned as mandated by the PCI specification.
    next_capability_offset: u8,

    /// The offset of the pointer to patch when another capability is
    /// appended.
    last_capability_pointer: u8,

    /// Whether a capability list exists at all.
    has_capability_list: bool,

    /// Set when a deliberately broken chain was laid down by hand; the
    /// finalizer must not terminate it.
    chain_sealed: bool,
}

impl SimDeviceBuilder {
    fn base(vendor: u16, device: u16, header: u8) -> Self {
        let mut regs = RegisterSetBuilder::<SIZE>::new();

        regs.u16_le_ro_at(offset::VENDOR, vendor)
            .u16_le_ro_at(offset::DEVICE, device)
            .u16_le_at(offset::COMMAND, 0, command::WRITABLE_BITS)
            .u8_ro_at(offset::REVISION, 0)
            .u8_rw_at(offset::CACHE_LINE_SIZE, 0)
            .u8_rw_at(offset::LATENCY_TIMER, 0)
            .u8_ro_at(offset::BIST, 0)
            .u8_ro_at(offset::CAPABILITIES_POINTER, 0);

        Self {
            regs,
            header,
            multifunction: false,
            interrupt_pin: 0,
            next_capability_offset: INITIAL_CAPABILITY_OFFSET,
            last_capability_pointer: offset::CAPABILITIES_POINTER as u8,
            has_capability_list: false,
            chain_sealed: false,
        }
    }

    /// Create a builder for a normal (type-0) function.
    ///
    /// All BARs and the expansion ROM start out unimplemented (hardwired
    /// to zero).
    #[must_use]
    pub fn new(vendor: u16, device: u16) -> Self {
        let mut builder = Self::base(vendor, device, header_type::NORMAL);

        for index in 0..6u16 {
            builder.regs.u32_le_ro_at(offset::BAR_0 + index * 4, 0);
        }
        builder
            .regs
            .u16_le_ro_at(offset::type0::SUBSYSTEM_VENDOR_ID, 0)
            .u16_le_ro_at(offset::type0::SUBSYSTEM_ID, 0)
            .u32_le_ro_at(offset::type0::ROM_BAR, 0)
            .u8_ro_at(offset::type0::MIN_GNT, 0)
            .u8_ro_at(offset::type0::MAX_LAT, 0);

        builder
    }

    /// Create a builder for a PCI-to-PCI bridge (type-1) function.
    ///
    /// The bus-number registers are writable; all forwarding windows start
    /// out unimplemented and are added with [`io_window`](Self::io_window),
    /// [`mem_window`](Self::mem_window) and
    /// [`pref_window`](Self::pref_window).
    #[must_use]
    pub fn bridge(vendor: u16, device: u16) -> Self {
        Self::bridge_with_class(vendor, device, 0x06, 0x04)
    }

    /// Create a bridge-header function with an arbitrary class code, for
    /// modelling hardware that is not a PCI-to-PCI bridge.
    #[must_use]
    pub fn bridge_with_class(vendor: u16, device: u16, class: u8, subclass: u8) -> Self {
        let mut builder = Self::base(vendor, device, header_type::BRIDGE).class(class, subclass, 0);

        for index in 0..2u16 {
            builder.regs.u32_le_ro_at(offset::BAR_0 + index * 4, 0);
        }
        builder
            .regs
            .u8_rw_at(offset::type1::PRIMARY_BUS, 0)
            .u8_rw_at(offset::type1::SECONDARY_BUS, 0)
            .u8_rw_at(offset::type1::SUBORDINATE_BUS, 0)
            .u8_rw_at(offset::type1::SEC_LATENCY_TIMER, 0)
            .u8_ro_at(offset::type1::IO_BASE, 0)
            .u8_ro_at(offset::type1::IO_LIMIT, 0)
            .u16_le_w1c_at(offset::type1::SEC_STATUS, 0)
            .u16_le_ro_at(offset::type1::MEMORY_BASE, 0)
            .u16_le_ro_at(offset::type1::MEMORY_LIMIT, 0)
            .u16_le_ro_at(offset::type1::PREF_MEMORY_BASE, 0)
            .u16_le_ro_at(offset::type1::PREF_MEMORY_LIMIT, 0)
            .u32_le_ro_at(offset::type1::PREF_BASE_UPPER32, 0)
            .u32_le_ro_at(offset::type1::PREF_LIMIT_UPPER32, 0)
            .u16_le_ro_at(offset::type1::IO_BASE_UPPER16, 0)
            .u16_le_ro_at(offset::type1::IO_LIMIT_UPPER16, 0)
            .u32_le_ro_at(offset::type1::ROM_BAR, 0)
            .u16_le_at(offset::type1::BRIDGE_CONTROL, 0, 0x0FFF);

        builder
    }

    /// Configure the class, subclass and programming interface.
    #[must_use]
    pub fn class(mut self, class: u8, subclass: u8, prog_if: u8) -> Self {
        self.regs
            .u8_ro_at(offset::CLASS, class)
            .u8_ro_at(offset::SUBCLASS, subclass)
            .u8_ro_at(offset::PROG_IF, prog_if);
        self
    }

    /// Mark the device as a multifunction device.
    #[must_use]
    pub fn multifunction(mut self) -> Self {
        self.multifunction = true;
        self
    }

    /// Wire the given PCI interrupt pin. Zero (the default) means not
    /// connected.
    #[must_use]
    pub fn interrupt_pin(mut self, pin: u8) -> Self {
        self.interrupt_pin = pin;
        self
    }

    fn bar_at(&mut self, index: u8, value: u32, write_mask: u32) {
        assert!(index < if self.header == header_type::BRIDGE { 2 } else { 6 });
        self.regs
            .u32_le_at(offset::BAR_0 + u16::from(index) * 4, value, write_mask);
    }

    /// Add a non-prefetchable 32-bit memory BAR.
    ///
    /// `size` must be a power of two and at least 16 bytes. The enumerator
    /// sizes the region by checking which low bits refuse to toggle.
    #[must_use]
    pub fn mem32_bar(mut self, index: u8, size: u32) -> Self {
        assert!(size.is_power_of_two() && size >= 16);
        self.bar_at(index, bar::MEM_LIMIT_32, !(size - 1));
        self
    }

    /// Add a legacy below-1-MiB memory BAR.
    #[must_use]
    pub fn mem_1m_bar(mut self, index: u8, size: u32) -> Self {
        assert!(size.is_power_of_two() && size >= 16);
        self.bar_at(index, bar::MEM_LIMIT_1M, !(size - 1));
        self
    }

    /// Add a 64-bit prefetchable memory BAR. Occupies `index` and
    /// `index + 1`.
    #[must_use]
    pub fn mem64_prefetchable_bar(mut self, index: u8, size: u64) -> Self {
        assert!(size.is_power_of_two() && size >= 16);

        let mask = !(size - 1);
        self.bar_at(index, bar::MEM_LIMIT_64 | bar::MEM_PREFETCH, mask as u32);
        self.bar_at(index + 1, 0, (mask >> 32) as u32);
        self
    }

    /// Add an I/O BAR with a 16-bit decoder, the common case.
    #[must_use]
    pub fn io_bar(mut self, index: u8, size: u32) -> Self {
        assert!(size.is_power_of_two() && size >= 4);
        self.bar_at(index, bar::SPACE_IO, !(size - 1) & 0xFFFC);
        self
    }

    /// Add an I/O BAR whose decoder implements all 32 address bits.
    #[must_use]
    pub fn io_bar_wide(mut self, index: u8, size: u32) -> Self {
        assert!(size.is_power_of_two() && size >= 4);
        self.bar_at(index, bar::SPACE_IO, !(size - 1) & 0xFFFF_FFFC);
        self
    }

    /// Add a BAR with arbitrary read-only bits and write mask, for
    /// modelling non-compliant hardware.
    #[must_use]
    pub fn raw_bar(mut self, index: u8, value: u32, write_mask: u32) -> Self {
        self.bar_at(index, value, write_mask);
        self
    }

    /// Add an expansion-ROM window of the given size.
    #[must_use]
    pub fn rom_bar(mut self, size: u32) -> Self {
        assert!(size.is_power_of_two() && size >= 0x800);

        let reg = if self.header == header_type::BRIDGE {
            offset::type1::ROM_BAR
        } else {
            offset::type0::ROM_BAR
        };
        self.regs.u32_le_at(reg, 0, !(size - 1) | bar::ROM_ENABLE);
        self
    }

    /// Implement the bridge's I/O forwarding window (16-bit, 4 KiB
    /// granularity).
    #[must_use]
    pub fn io_window(mut self) -> Self {
        // The low nibbles report the addressing capability and are
        // read-only.
        self.regs
            .u8_at(offset::type1::IO_BASE, 0, 0xF0)
            .u8_at(offset::type1::IO_LIMIT, 0, 0xF0);
        self
    }

    /// Implement the bridge's memory forwarding window (1 MiB
    /// granularity).
    #[must_use]
    pub fn mem_window(mut self) -> Self {
        self.regs
            .u16_le_at(offset::type1::MEMORY_BASE, 0, 0xFFF0)
            .u16_le_at(offset::type1::MEMORY_LIMIT, 0, 0xFFF0);
        self
    }

    /// Implement the bridge's prefetchable window, 64-bit capable.
    #[must_use]
    pub fn pref_window(mut self) -> Self {
        self.regs
            .u16_le_at(offset::type1::PREF_MEMORY_BASE, 1, 0xFFF0)
            .u16_le_at(offset::type1::PREF_MEMORY_LIMIT, 1, 0xFFF0)
            .u32_le_rw_at(offset::type1::PREF_BASE_UPPER32, 0)
            .u32_le_rw_at(offset::type1::PREF_LIMIT_UPPER32, 0);
        self
    }

    /// Place an arbitrary 16-bit register, for modelling partially wired
    /// hardware.
    #[must_use]
    pub fn raw16(mut self, pos: u16, value: u16, write_mask: u16) -> Self {
        self.regs.u16_le_at(pos, value, write_mask);
        self
    }

    /// Append a PCI capability with the given id and body.
    ///
    /// The generic header (id and next pointer) is added automatically and
    /// the previous chain element is patched to point here.
    #[must_use]
    pub fn capability(mut self, capability_id: u8, body: &[u8]) -> Self {
        let pos = self.next_capability_offset;
        assert_eq!(pos & !capability_list::POINTER_MASK, 0);

        let header_size = 2;
        let next = usize::from(pos) + header_size + body.len();
        assert!(next <= usize::from(u8::MAX));

        // The next capability must start at an aligned address.
        self.next_capability_offset = ((next + 3) & !3) as u8;

        self.regs.u8_ro_at(u16::from(self.last_capability_pointer), pos);
        self.regs.u8_ro_at(u16::from(pos), capability_id);
        for (i, byte) in body.iter().enumerate() {
            self.regs
                .u8_ro_at(u16::from(pos) + header_size as u16 + i as u16, *byte);
        }

        self.last_capability_pointer = pos + 1;
        self.has_capability_list = true;
        self
    }

    /// Lay down a deliberately broken capability chain: one entry at the
    /// first valid offset whose next pointer is `next`, verbatim.
    ///
    /// Pointing `next` back at the entry models a cyclic list; pointing it
    /// into unimplemented space models a chain that runs into all-ones.
    #[must_use]
    pub fn broken_capability_chain(mut self, capability_id: u8, next: u8) -> Self {
        self.regs
            .u8_ro_at(offset::CAPABILITIES_POINTER, INITIAL_CAPABILITY_OFFSET)
            .u8_ro_at(u16::from(INITIAL_CAPABILITY_OFFSET), capability_id)
            .u8_ro_at(u16::from(INITIAL_CAPABILITY_OFFSET) + 1, next);
        self.has_capability_list = true;
        self.chain_sealed = true;
        self
    }

    /// Create the finalized simulated function.
    #[must_use]
    pub fn device(mut self) -> SimDevice {
        self.regs
            .u8_ro_at(
                offset::HEADER_TYPE,
                self.header
                    | if self.multifunction {
                        header_type::MULTIFUNCTION
                    } else {
                        0
                    },
            )
            .u8_rw_at(offset::IRQ_LINE, 0xFF)
            .u8_ro_at(offset::IRQ_PIN, self.interrupt_pin)
            // The error bits of the status register can only be cleared,
            // never set, so hardcoding them to zero gives the correct
            // semantics.
            .u16_le_ro_at(
                offset::STATUS,
                if self.has_capability_list {
                    status::CAPABILITIES
                } else {
                    0
                },
            );

        // Terminate the pointer chain.
        if !self.chain_sealed {
            self.regs.u8_ro_at(u16::from(self.last_capability_pointer), 0);
        }

        SimDevice::new(self.regs.into())
    }
}
