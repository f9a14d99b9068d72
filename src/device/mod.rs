//! # The Device Model
//!
//! This module owns the entities every phase of enumeration mutates: the
//! device/bus tree, the address-space resources hanging off each device, the
//! late-bound device operations, the static board configuration that seeds
//! the tree, and the allocator seam that decides final addresses.

pub mod allocator;
pub mod board;
pub mod ops;
pub mod resource;
pub mod tree;
