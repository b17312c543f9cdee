//! GAN smart cube link.
//!
//! Discovers GAN (and MoYu AI) smart cubes over Bluetooth LE, decrypts and
//! decodes their Gen2/Gen3/Gen4 notification protocols, and republishes
//! moves, facelet state, orientation, battery and hardware info as typed
//! events. The BLE radio itself is supplied by the host through
//! [`BlePlatform`].
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use gan_cube_link::{spawn_session, BlePlatform, ConnectTarget, Settings};
//! # async fn demo<P: BlePlatform>(platform: P) -> gan_cube_link::Result<()> {
//! let (session, mut events, _task) = spawn_session(Arc::new(platform), Settings::default());
//! session.connect(ConnectTarget::FirstMatch).await?;
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use domain::models::{
    ConnectionInfo, CubeCommand, CubeEvent, LifecycleEvent, SessionEvent, SessionState,
};
pub use domain::settings::{Settings, SettingsService};
pub use error::{CubeError, Result};
pub use infrastructure::bluetooth::{spawn_session, BlePlatform, ConnectTarget, SessionHandle};
pub use infrastructure::logging::init_logger;
