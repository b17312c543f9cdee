//! BLE Connection Module
//!
//! Takes a connect target from "which cube" to a live, keyed, subscribed
//! link: resolve, connect with retries, discover, key, subscribe.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use tracing::{debug, error, info, warn};

use crate::domain::models::{
    MacAddress, MessageSeverity, PeripheralAddress, PeripheralIdentity, SessionState,
};
use crate::domain::settings::{KeyConfig, Settings};
use crate::error::{ConfigurationError, CubeError, ProtocolError, Result, TransportError};
use crate::infrastructure::bluetooth::cipher::CubeCipher;
use crate::infrastructure::bluetooth::driver::{create_driver, CubeDriver, DriverOptions};
use crate::infrastructure::bluetooth::platform::BlePlatform;
use crate::infrastructure::bluetooth::protocol::{
    detect_generation, key_candidates, GenerationProfile,
};
use crate::infrastructure::bluetooth::scanner::{find_candidate, CandidateMatcher};
use crate::infrastructure::bluetooth::service::StatusReporter;

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Connect attempts before giving up
    pub max_retries: u32,
    /// Delay before the second attempt, doubled for each one after
    pub retry_backoff: Duration,
    /// Per-attempt connect deadline
    pub connect_timeout: Duration,
    /// Deadline for locating the peripheral by scanning
    pub find_timeout: Duration,
    pub name_prefixes: Vec<String>,
    pub mac_override: Option<String>,
    pub extra_keys: Vec<KeyConfig>,
    pub driver_options: DriverOptions,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for ConnectionConfig {
    fn from(s: &Settings) -> Self {
        Self {
            max_retries: s.max_connect_retries.max(1),
            retry_backoff: Duration::from_millis(s.retry_backoff_ms),
            connect_timeout: Duration::from_millis(s.connect_timeout_ms),
            find_timeout: Duration::from_millis(s.find_timeout_ms),
            name_prefixes: s.name_prefixes.clone(),
            mac_override: s.mac_override.clone(),
            extra_keys: s.extra_keys.clone(),
            driver_options: DriverOptions::from(s),
        }
    }
}

/// Which peripheral to connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectTarget {
    /// Scan until this address advertises.
    Address(PeripheralAddress),
    /// First name- or service-matched cube. Manufacturer-data-only matches
    /// are never picked automatically.
    FirstMatch,
    /// A candidate from an earlier scan; no scan needed.
    Peripheral(PeripheralIdentity),
}

/// Everything owned for the lifetime of one connection. Dropped on
/// disconnect; a reconnect builds a fresh one.
pub struct ActiveLink {
    pub identity: PeripheralIdentity,
    pub profile: &'static GenerationProfile,
    pub cipher: CubeCipher,
    pub driver: Box<dyn CubeDriver>,
    pub notifications: BoxStream<'static, Vec<u8>>,
}

/// BLE Connection handler
pub struct BleConnection<P: BlePlatform> {
    platform: Arc<P>,
    config: ConnectionConfig,
    status: StatusReporter,
}

impl<P: BlePlatform> BleConnection<P> {
    pub(crate) fn new(platform: Arc<P>, config: ConnectionConfig, status: StatusReporter) -> Self {
        Self {
            platform,
            config,
            status,
        }
    }

    pub async fn establish(&self, target: ConnectTarget) -> Result<ActiveLink> {
        let mac_override = self
            .config
            .mac_override
            .as_deref()
            .map(|mac| mac.parse::<MacAddress>())
            .transpose()?;

        let mut identity = self.resolve(target, mac_override).await?;
        if mac_override.is_some() {
            identity.mac = mac_override;
        }
        self.status.set_target(&identity);

        info!("Connecting to cube {}", identity.address);
        self.status
            .log("Connecting to cube...", MessageSeverity::Info);
        self.status.set_state(SessionState::Connecting);
        self.connect_with_retries(&identity.address).await?;

        match self.configure(identity.clone()).await {
            Ok(link) => Ok(link),
            Err(e) => {
                error!("Connection setup failed: {}", e);
                if let Err(de) = self.platform.disconnect(&identity.address).await {
                    warn!("Disconnect after failed setup also failed: {}", de);
                }
                Err(e)
            }
        }
    }

    async fn resolve(
        &self,
        target: ConnectTarget,
        mac_override: Option<MacAddress>,
    ) -> Result<PeripheralIdentity> {
        let matcher = CandidateMatcher::new(self.config.name_prefixes.clone(), mac_override);
        let candidate = match target {
            ConnectTarget::Peripheral(identity) => return Ok(identity),
            ConnectTarget::Address(address) => {
                self.status.set_state(SessionState::Scanning);
                let description = format!("cube at {}", address);
                find_candidate(
                    self.platform.as_ref(),
                    &matcher,
                    self.config.find_timeout,
                    &description,
                    move |c| c.identity.address.same_peripheral(&address),
                )
                .await?
            }
            ConnectTarget::FirstMatch => {
                self.status.set_state(SessionState::Scanning);
                find_candidate(
                    self.platform.as_ref(),
                    &matcher,
                    self.config.find_timeout,
                    "any cube",
                    |c| c.is_strong(),
                )
                .await?
            }
        };
        Ok(candidate.identity)
    }

    /// Bounded attempts with exponential backoff. A timed out attempt counts
    /// as one attempt.
    async fn connect_with_retries(&self, address: &PeripheralAddress) -> Result<()> {
        let attempts = self.config.max_retries;
        let mut last_error = None;

        for attempt in 1..=attempts {
            let outcome =
                tokio::time::timeout(self.config.connect_timeout, self.platform.connect(address))
                    .await
                    .unwrap_or_else(|_| {
                        Err(TransportError::ConnectTimeout {
                            address: address.to_string(),
                            timeout: self.config.connect_timeout,
                        })
                    });

            match outcome {
                Ok(()) => {
                    info!("Connected to {} on attempt {}", address, attempt);
                    return Ok(());
                }
                Err(e) => {
                    warn!("Connect attempt {}/{} failed: {}", attempt, attempts, e);
                    last_error = Some(e);
                }
            }

            if attempt < attempts {
                let delay = self
                    .config
                    .retry_backoff
                    .saturating_mul(1u32 << (attempt - 1).min(16));
                self.status.log(
                    format!("Connect failed, retrying in {:.1}s", delay.as_secs_f32()),
                    MessageSeverity::Warning,
                );
                tokio::time::sleep(delay).await;
            }
        }

        Err(TransportError::RetriesExhausted {
            address: address.to_string(),
            attempts,
            last: last_error.map(|e| e.to_string()).unwrap_or_default(),
        }
        .into())
    }

    async fn configure(&self, identity: PeripheralIdentity) -> Result<ActiveLink> {
        let address = &identity.address;

        self.status.set_state(SessionState::DiscoveringServices);
        let services = self.platform.discover_services(address).await?;
        debug!("Discovered {} services", services.len());

        let profile = detect_generation(services.iter().map(|s| &s.uuid))
            .ok_or(ProtocolError::UnknownGeneration)?;
        let service = services
            .iter()
            .find(|s| s.uuid == profile.service)
            .ok_or(ProtocolError::UnknownGeneration)?;
        for characteristic in [profile.command_char, profile.state_char] {
            if !service.characteristics.contains(&characteristic) {
                return Err(ProtocolError::MissingCharacteristic(characteristic).into());
            }
        }
        info!("Detected {} protocol", profile.generation);
        self.status.set_generation(profile.generation);

        self.status.set_state(SessionState::ConfiguringCipher);
        let cipher = self.build_cipher(&identity)?;

        self.status.set_state(SessionState::Subscribing);
        let notifications = self
            .platform
            .subscribe(address, profile.state_char)
            .await?;
        info!("Subscribed to cube state notifications");

        let identity = PeripheralIdentity {
            generation: Some(profile.generation),
            ..identity
        };
        Ok(ActiveLink {
            identity,
            profile,
            cipher,
            driver: create_driver(profile.generation, self.config.driver_options),
            notifications,
        })
    }

    /// First key from the table that passes construction. Construction only
    /// checks lengths, so a wrong key surfaces later as implausible frames.
    fn build_cipher(&self, identity: &PeripheralIdentity) -> Result<CubeCipher> {
        let mac = identity.hardware_address().ok_or_else(|| {
            ConfigurationError::MalformedAddress(format!(
                "{} (no hardware address; set mac_override)",
                identity.address
            ))
        })?;
        let salt = mac.salt();

        for key in key_candidates(identity.name.as_deref(), &self.config.extra_keys) {
            match CubeCipher::new(&key.key, &key.iv, &salt) {
                Ok(cipher) => {
                    info!("Using {} key for {}", key.name, mac);
                    return Ok(cipher);
                }
                Err(e) => debug!("Key {} unusable: {}", key.name, e),
            }
        }
        Err(CubeError::Configuration(ConfigurationError::NoUsableKey))
    }
}
