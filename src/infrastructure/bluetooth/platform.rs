//! BLE Platform Seam
//!
//! The radio and GATT stack live outside this crate. An adapter for the host
//! stack (btleplug, WinRT, CoreBluetooth, a test double) implements
//! [`BlePlatform`] and the session drives it.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::domain::models::PeripheralAddress;
use crate::error::TransportError;
use crate::infrastructure::bluetooth::protocol::is_cube_company_id;

/// One advertisement report seen during a scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Advertisement {
    pub address: Option<PeripheralAddress>,
    pub name: Option<String>,
    pub service_uuids: Vec<Uuid>,
    /// Company identifier to payload.
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    pub rssi: Option<i16>,
}

/// Hint passed to the platform scanner. The criteria are alternatives: an
/// advertisement matching any one of them must be reported. Platforms that
/// cannot express that may report everything; the session filters again.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    pub services: Vec<Uuid>,
    /// Advertised local name prefixes.
    pub name_prefixes: Vec<String>,
    /// Manufacturer data under a cube company identifier.
    pub cube_manufacturer_data: bool,
}

impl ScanFilter {
    /// An empty filter matches everything.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty() && self.name_prefixes.is_empty() && !self.cube_manufacturer_data
    }

    pub fn matches(&self, adv: &Advertisement) -> bool {
        if self.is_empty() {
            return true;
        }
        let by_service = adv
            .service_uuids
            .iter()
            .any(|uuid| self.services.contains(uuid));
        let by_name = adv.name.as_deref().is_some_and(|name| {
            self.name_prefixes
                .iter()
                .any(|prefix| name.starts_with(prefix.as_str()))
        });
        let by_manufacturer = self.cube_manufacturer_data
            && adv
                .manufacturer_data
                .keys()
                .any(|id| is_cube_company_id(*id));
        by_service || by_name || by_manufacturer
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}

#[async_trait]
pub trait BlePlatform: Send + Sync + 'static {
    /// Starts scanning. The stream ends when the scan is stopped.
    async fn scan(
        &self,
        filter: ScanFilter,
    ) -> Result<BoxStream<'static, Advertisement>, TransportError>;

    async fn stop_scan(&self) -> Result<(), TransportError>;

    /// Establishes the link. The session applies its own timeout around it.
    async fn connect(&self, address: &PeripheralAddress) -> Result<(), TransportError>;

    async fn discover_services(
        &self,
        address: &PeripheralAddress,
    ) -> Result<Vec<GattService>, TransportError>;

    /// Enables notifications. The stream ends when the link drops.
    async fn subscribe(
        &self,
        address: &PeripheralAddress,
        characteristic: Uuid,
    ) -> Result<BoxStream<'static, Vec<u8>>, TransportError>;

    async fn write(
        &self,
        address: &PeripheralAddress,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), TransportError>;

    async fn disconnect(&self, address: &PeripheralAddress) -> Result<(), TransportError>;
}
