//! Bluetooth Module
//!
//! BLE communication with GAN smart cubes.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                 CubeSession (service)                    │
//! │   (actor task - public API through SessionHandle)        │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼──────────────┐
//!         │             │              │
//!         ▼             ▼              ▼
//! ┌───────────┐  ┌────────────┐  ┌────────────┐
//! │  Scanner  │  │ Connection │  │   Driver   │
//! │           │  │            │  │            │
//! │ - cube    │  │ - retries  │  │ - Gen2/3/4 │
//! │   matching│  │ - GATT     │  │ - decode   │
//! │           │  │ - keying   │  │ - encode   │
//! └───────────┘  └────────────┘  └────────────┘
//!         │             │              │
//!         └──────┬──────┘       ┌──────┴──────┐
//!                ▼              ▼             ▼
//!         ┌────────────┐  ┌──────────┐  ┌──────────┐
//!         │  Platform  │  │  Cipher  │  │ Bitfield │
//!         └────────────┘  └──────────┘  └──────────┘
//! ```
//!
//! ## Modules
//!
//! - [`platform`] - BLE stack seam implemented by the host adapter
//! - [`protocol`] - UUIDs, generation profiles, key table
//! - [`bitfield`] - Bit-level field reads over decrypted payloads
//! - [`cipher`] - Salted AES payload encryption
//! - [`driver`] - Per-generation decoders and command encoders
//! - [`scanner`] - Cube discovery
//! - [`connection`] - Connect, discover, key and subscribe
//! - [`service`] - Session actor coordinating everything

pub mod bitfield;
pub mod cipher;
pub mod connection;
pub mod driver;
pub mod platform;
pub mod protocol;
pub mod scanner;
pub mod service;

pub use connection::ConnectTarget;
pub use platform::BlePlatform;
pub use service::{spawn_session, SessionHandle};
