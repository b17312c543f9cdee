//! Error taxonomy for the cube link.
//!
//! Connection setup failures surface to the caller as [`CubeError`]. Steady
//! state decode failures are [`ProtocolError`]s that the session logs and
//! drops without ending the connection.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CubeError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
    #[error("session is not running")]
    SessionClosed,
    #[error("operation cancelled by disconnect request")]
    Cancelled,
}

/// Scan, connect, discover and write failures reported by the platform.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peripheral not found: {0}")]
    NotFound(String),
    #[error("connect to {address} timed out after {timeout:?}")]
    ConnectTimeout { address: String, timeout: Duration },
    #[error("connect to {address} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        address: String,
        attempts: u32,
        last: String,
    },
    #[error("scan failed: {0}")]
    Scan(String),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("service discovery failed: {0}")]
    Discovery(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("write failed: {0}")]
    Write(String),
    #[error("not connected")]
    NotConnected,
    #[error("already connected to {0}")]
    AlreadyConnected(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid key material: {what} must be {expected} bytes, got {actual}")]
    InvalidKeyMaterial {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("payload too short: {len} bytes, need at least {min}")]
    PayloadTooShort { len: usize, min: usize },
    #[error("unsupported bit word width: {0}")]
    UnsupportedBitWidth(usize),
    #[error("bit field at offset {offset} (+{len}) is outside a {available}-bit payload")]
    FieldOutOfBounds {
        offset: usize,
        len: usize,
        available: usize,
    },
    #[error("malformed {field}: {reason}")]
    MalformedField { field: &'static str, reason: String },
    #[error("inconsistent cube state: {0}")]
    InconsistentState(String),
    #[error("unknown generation: no known cube service among discovered services")]
    UnknownGeneration,
    #[error("characteristic {0} missing from cube service")]
    MissingCharacteristic(Uuid),
}

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("no usable encryption key")]
    NoUsableKey,
    #[error("malformed address: {0}")]
    MalformedAddress(String),
    #[error("malformed key material {name}: {reason}")]
    MalformedKey { name: String, reason: String },
}

pub type Result<T> = std::result::Result<T, CubeError>;
