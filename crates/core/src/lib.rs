//! Core library for the sidecar process supervisor
//!
//! This crate holds the configuration model, environment templating, the
//! artifact cache index and fetcher, process supervision with group shutdown,
//! platform starters, logging and error handling.

pub mod config;
pub mod errors;
pub mod factory;
pub mod fetcher;
pub mod index;
pub mod launcher;
pub mod logging;
pub mod output;
pub mod process;
pub mod profile;
pub mod retry;
pub mod starter;
pub mod variable;

// Re-export IndexMap for use by dependent crates (preserves insertion order for ordered maps)
pub use indexmap::IndexMap;

/// Get the version of the core library
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}
