//! Shared configuration loading and the crate-wide error type.

pub mod config;
pub mod error;

pub use config::{ConfigError, PgCoreConfig};
pub use error::PgCoreError;
