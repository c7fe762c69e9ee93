//! Configuration management module
//!
//! Loads the control plane's TOML configuration file.

mod config;

pub use config::*;
