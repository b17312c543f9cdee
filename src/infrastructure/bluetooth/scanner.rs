//! BLE Scanner Module
//!
//! Recognises cubes in advertisement reports and publishes them as
//! candidates. Scanning never connects on its own.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::domain::models::{
    Candidate, LifecycleEvent, MacAddress, MessageSeverity, PeripheralAddress, PeripheralIdentity,
    SessionEvent, StatusMessage,
};
use crate::domain::settings::Settings;
use crate::error::TransportError;
use crate::infrastructure::bluetooth::platform::{Advertisement, BlePlatform, ScanFilter};
use crate::infrastructure::bluetooth::protocol::{
    detect_generation, is_cube_company_id, mac_from_manufacturer_data, PROFILES,
};

/// Decides whether an advertisement looks like a cube.
#[derive(Debug, Clone)]
pub struct CandidateMatcher {
    name_prefixes: Vec<String>,
    mac_override: Option<MacAddress>,
}

impl CandidateMatcher {
    pub fn new(name_prefixes: Vec<String>, mac_override: Option<MacAddress>) -> Self {
        Self {
            name_prefixes,
            mac_override,
        }
    }

    /// A malformed `mac_override` is ignored here; connecting reports it.
    pub fn from_settings(settings: &Settings) -> Self {
        let mac_override = settings
            .mac_override
            .as_deref()
            .and_then(|mac| mac.parse().ok());
        Self::new(settings.name_prefixes.clone(), mac_override)
    }

    /// Platform-side filter covering everything [`CandidateMatcher::classify`]
    /// accepts.
    pub fn scan_filter(&self) -> ScanFilter {
        ScanFilter {
            services: PROFILES.iter().map(|p| p.service).collect(),
            name_prefixes: self.name_prefixes.clone(),
            cube_manufacturer_data: true,
        }
    }

    pub fn classify(&self, adv: &Advertisement) -> Option<Candidate> {
        let address = adv.address.clone()?;

        let matched_by_name = adv.name.as_deref().is_some_and(|name| {
            self.name_prefixes
                .iter()
                .any(|prefix| name.starts_with(prefix.as_str()))
        });
        let matched_by_service = adv
            .service_uuids
            .iter()
            .any(|uuid| PROFILES.iter().any(|p| p.service == *uuid));
        let matched_by_manufacturer = adv
            .manufacturer_data
            .keys()
            .any(|id| is_cube_company_id(*id));

        if !(matched_by_name || matched_by_service || matched_by_manufacturer) {
            return None;
        }

        let identity = PeripheralIdentity {
            address,
            name: adv.name.clone(),
            mac: self
                .mac_override
                .or_else(|| mac_from_manufacturer_data(&adv.manufacturer_data)),
            generation: detect_generation(&adv.service_uuids).map(|p| p.generation),
        };

        Some(Candidate {
            identity,
            rssi: adv.rssi,
            matched_by_name,
            matched_by_service,
            matched_by_manufacturer,
        })
    }
}


/// Scans until a candidate satisfying `accept` shows up or `deadline`
/// passes. The platform scan is stopped either way.
pub async fn find_candidate<P, F>(
    platform: &P,
    matcher: &CandidateMatcher,
    deadline: Duration,
    description: &str,
    accept: F,
) -> Result<Candidate, TransportError>
where
    P: BlePlatform + ?Sized,
    F: Fn(&Candidate) -> bool + Send + Sync,
{
    info!("Looking for {} (up to {:?})", description, deadline);
    let mut reports = platform.scan(matcher.scan_filter()).await?;

    let search = async {
        while let Some(adv) = reports.next().await {
            if let Some(candidate) = matcher.classify(&adv) {
                if accept(&candidate) {
                    return Some(candidate);
                }
                debug!("Skipping candidate {}", candidate.identity.address);
            }
        }
        None
    };
    let found = tokio::time::timeout(deadline, search).await;

    if let Err(e) = platform.stop_scan().await {
        warn!("Failed to stop scan: {}", e);
    }

    match found {
        Ok(Some(candidate)) => Ok(candidate),
        Ok(None) | Err(_) => Err(TransportError::NotFound(description.to_string())),
    }
}

/// Background scan publishing [`LifecycleEvent::CandidateFound`].
pub struct BleScanner<P: BlePlatform> {
    platform: Arc<P>,
    matcher: CandidateMatcher,
    event_sender: mpsc::UnboundedSender<SessionEvent>,
    task: Option<JoinHandle<()>>,
}

impl<P: BlePlatform> BleScanner<P> {
    pub fn new(
        platform: Arc<P>,
        matcher: CandidateMatcher,
        event_sender: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            platform,
            matcher,
            event_sender,
            task: None,
        }
    }

    pub async fn start(&mut self) -> Result<(), TransportError> {
        self.stop().await?;

        info!("Starting BLE scan for cubes");
        self.send_log("Scanning for cubes...", MessageSeverity::Info);

        let mut reports = self.platform.scan(self.matcher.scan_filter()).await?;
        let matcher = self.matcher.clone();
        let sender = self.event_sender.clone();

        self.task = Some(tokio::spawn(async move {
            let mut seen: HashSet<PeripheralAddress> = HashSet::new();
            while let Some(adv) = reports.next().await {
                let Some(candidate) = matcher.classify(&adv) else {
                    continue;
                };
                if !seen.insert(candidate.identity.address.clone()) {
                    continue;
                }
                if !candidate.is_strong() {
                    debug!(
                        "Weak candidate {} (manufacturer data only)",
                        candidate.identity.address
                    );
                }
                info!(
                    "Found candidate {} ({})",
                    candidate.identity.address,
                    candidate.identity.name.as_deref().unwrap_or("unnamed")
                );
                if sender
                    .send(SessionEvent::Lifecycle(LifecycleEvent::CandidateFound(
                        candidate,
                    )))
                    .is_err()
                {
                    break;
                }
            }
            debug!("Scan report stream ended");
        }));

        Ok(())
    }

    pub async fn stop(&mut self) -> Result<(), TransportError> {
        if let Some(task) = self.task.take() {
            info!("Stopping BLE scan...");
            task.abort();
            self.send_log("Scan stopped.", MessageSeverity::Info);
            self.platform.stop_scan().await?;
        }
        Ok(())
    }

    pub fn is_scanning(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self.event_sender.send(SessionEvent::Log(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}

impl<P: BlePlatform> Drop for BleScanner<P> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
