//! Anvil Core - configuration and errors shared by the Anvil crates
//!
//! This crate loads and validates `anvil.toml` / `anvil.yaml` and defines the
//! error types used above the execution engine.

pub mod config;
pub mod error;

pub use config::{load_config, load_config_from_dir, load_config_or_default, Config};
pub use error::{AnvilError, ConfigError, Result};
