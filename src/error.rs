use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::telegram::Field;

/// Failure to read or write the persisted baseline snapshot.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("state file {} not found", path.display())]
    Missing { path: PathBuf },
    #[error("failed to read state file {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("state file {} is not a valid snapshot: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to serialize snapshot: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write state file {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },
}

/// A reading category that the incoming telegram did not carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("telegram has no value for {0}")]
pub struct MissingFieldError(pub Field);

/// Raw P1 telegram that could not be turned into a [`crate::telegram::Telegram`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TelegramError {
    #[error("telegram is not valid ASCII/UTF-8")]
    Encoding,
    #[error("telegram has no '!' footer")]
    MissingFooter,
    #[error("telegram checksum '{0}' is not hexadecimal")]
    MalformedChecksum(String),
    #[error("checksum mismatch: telegram says {expected:04X}, computed {computed:04X}")]
    ChecksumMismatch { expected: u16, computed: u16 },
    #[error("cannot parse value '{value}' of {obis}")]
    InvalidValue { obis: String, value: String },
}

/// Invalid process configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{name} must be a number, got '{value}'")]
    NotANumber { name: &'static str, value: String },
    #[error("{name} must be greater than zero")]
    Zero { name: &'static str },
    #[error("unsupported DSMR_VERSION '{0}' (expected 2.2, 4 or 5)")]
    DsmrVersion(String),
    #[error("unsupported STATE_SAVE_POLICY '{0}' (expected hourly or daily)")]
    SavePolicy(String),
}
