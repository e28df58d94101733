//! Shared types for Courier.
//!
//! This crate contains:
//! - **Identifiers** — `BundleId`, endpoint addressing helpers
//! - **Error taxonomy** — the `CourierError` kinds surfaced across the workspace
//! - **Configuration** — the YAML-backed `CourierConfig` and its defaults

pub mod config;
pub mod error;
pub mod ids;
