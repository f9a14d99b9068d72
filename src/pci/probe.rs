//! # Moving-Bits Register Probe
//!
//! Sizing a configuration-space window works without prior knowledge of the
//! window: write all-ones, read back, write all-zeros, read back. Bits that
//! toggle between the two reads are implemented by the address decoder;
//! everything else is a hardwired attribute bit or unimplemented.
//!
//! Every probe restores the register to the value it had before the probe,
//! so hardware is never left decoding the all-ones or all-zeros address. A
//! single pass is definitive; the protocol has no retries.

use crate::pci::access::{BusDevFn, ConfigAccess};

/// Determine the movable bits of a byte-wide register.
pub fn moving_bits8(access: &mut dyn ConfigAccess, addr: BusDevFn, reg: u16) -> u8 {
    let value = access.read8(addr, reg);

    access.write8(addr, reg, 0xFF);
    let ones = access.read8(addr, reg);

    access.write8(addr, reg, 0x00);
    let zeroes = access.read8(addr, reg);

    access.write8(addr, reg, value);

    ones ^ zeroes
}

/// Determine the movable bits of a 16-bit register.
pub fn moving_bits16(access: &mut dyn ConfigAccess, addr: BusDevFn, reg: u16) -> u16 {
    let value = access.read16(addr, reg);

    access.write16(addr, reg, 0xFFFF);
    let ones = access.read16(addr, reg);

    access.write16(addr, reg, 0x0000);
    let zeroes = access.read16(addr, reg);

    access.write16(addr, reg, value);

    ones ^ zeroes
}

/// Determine the movable bits of a 32-bit register.
pub fn moving_bits32(access: &mut dyn ConfigAccess, addr: BusDevFn, reg: u16) -> u32 {
    let value = access.read32(addr, reg);

    access.write32(addr, reg, 0xFFFF_FFFF);
    let ones = access.read32(addr, reg);

    access.write32(addr, reg, 0x0000_0000);
    let zeroes = access.read32(addr, reg);

    access.write32(addr, reg, value);

    ones ^ zeroes
}
