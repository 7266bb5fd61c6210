//! Multi-strategy yield vault engine
//!
//! Exposes the vault modules and engine configuration for the binary and
//! integration tests.

pub mod config;
pub mod vault;
