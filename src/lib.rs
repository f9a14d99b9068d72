//! # pcitree
//!
//! A firmware-time PCI bus enumerator and address-space resource allocator.
//!
//! The crate discovers PCI devices and PCI-to-PCI bridges by probing
//! configuration space, sizes every relocatable address-space window a device
//! requests, merges the probed hardware with a statically declared board
//! configuration into one owned device tree, numbers all buses behind
//! bridges, and finally commits the decided addresses back into hardware
//! registers.
//!
//! The crate never touches hardware directly. All register traffic goes
//! through the [`pci::access::ConfigAccess`] trait, so the same enumerator
//! runs against real configuration-space primitives in firmware and against
//! the simulated machines in [`sim`] during tests.
//!
//! ## Phases
//!
//! A platform runs the phases in order, each a full pass over the tree:
//!
//! 1. [`pci::scan`] — find devices, bind operations, number buses.
//! 2. [`pci::discover`] — size BARs and bridge windows into [`device::resource`]
//!    records.
//! 3. An [`device::allocator::Allocator`] decides base addresses.
//! 4. [`pci::commit`] — write the decided addresses back and enable decode.

#![deny(missing_docs)]
#![deny(rustdoc::all)]
#![deny(clippy::must_use_candidate)]
#![deny(missing_debug_implementations)]

pub mod device;
pub mod pci;
pub mod sim;
