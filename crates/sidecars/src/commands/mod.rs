//! Command implementations
//!
//! This module contains implementations for all CLI subcommands.

pub mod launch;
pub mod setup;
pub mod sha1;
pub mod shared;
pub mod vendor;
