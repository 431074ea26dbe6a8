//! vulnsync Common - Shared utilities: configuration, logging, checksums
//!
//! This crate provides common functionality used across all vulnsync crates.

pub mod checksum;
pub mod config;
pub mod logging;

pub use config::{
    Config, ConfigBuilder, DatabaseConfig, FetchConfig, LoggingConfig, NvdFeedConfig,
    OsvFeedConfig,
};
pub use logging::init_logging;
