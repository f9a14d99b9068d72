//! # PCI Bus Support
//!
//! The mechanics of talking to PCI configuration space: the access trait
//! firmware implements, the moving-bits probe, the capability-list walk,
//! and the three passes — scan, discover, commit — that turn raw hardware
//! into a fully numbered, fully placed device tree.

pub mod access;
pub mod capability;
pub mod commit;
pub mod constants;
pub mod discover;
pub mod probe;
pub mod scan;
