//! Fault-injecting hammerer for testing.
//!
//! This crate provides a hammerer implementation that flips a bit at a chosen
//! address whenever a chosen aggressor pair is hammered together, without
//! performing actual Rowhammer attacks. Useful for testing the narrowing
//! pipeline end to end on any machine.
//!
//! Implements the [`hammerscan_core::hammerer::Hammering`] trait.
//!
//! # Use Cases
//!
//! - Integration testing of the narrowing protocol
//! - Simulating bit flips without hardware access

#![warn(missing_docs)]

mod injector;

pub use injector::{FaultInjector, FlipAddr, Never};
