//! # hammerscan
//!
//! Row-hammer fault induction, narrowing and detection.
//!
//! This crate re-exports [`hammerscan_core`], which holds the engine, and
//! optionally the fault-injecting hammerer of `hammerscan-dummy` (feature
//! `dummy`). The command line tool lives in the `hammerscan-bin` package.

pub use hammerscan_core::*;

#[cfg(feature = "dummy")]
pub use hammerscan_dummy as dummy;
