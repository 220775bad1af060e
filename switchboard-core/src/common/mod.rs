//! Small shared helpers used across the adapter, registry, and config layers.

pub mod duration_serde;
