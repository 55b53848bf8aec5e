//! Configuration management module
//!
//! TOML-based configuration with typed defaults, environment overrides,
//! and validation at load time.

mod config;

pub use config::*;
