//! The editable world: records, instance batches, visibility scheduling,
//! selection proxies, and population from a manifest.

pub mod batches;
pub mod core;
pub mod loader;
pub mod manifest;
pub mod plugin;
pub mod proxy;
pub mod registry;
pub mod scheduler;

pub use plugin::WorldPlugin;
