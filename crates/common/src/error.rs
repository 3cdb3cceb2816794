//! Startup errors
//!
//! Everything that can go wrong before the first identifier is dispatched:
//! reading the config file, parsing it, and validating what it says.

use thiserror::Error;

/// Setup-time error shared by the config loader and the credential checks.
///
/// Every variant is fatal: the binary reports it and exits non-zero.
#[derive(Error, Debug)]
pub enum Error {
    /// A value parsed but is not usable (bad URL, unknown aggregation mode,
    /// blank credential...).
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The config file could not be read.
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The config file is not valid TOML or does not match the schema.
    #[error("malformed config file: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
