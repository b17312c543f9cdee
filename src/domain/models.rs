use std::fmt;
use std::str::FromStr;

use nalgebra::{Quaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::domain::facelets::CornerEdgeState;
use crate::error::ConfigurationError;

/// Host wall-clock time in Unix milliseconds.
pub type HostMillis = u64;

/// Hardware generation of the cube protocol, picked once per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Generation {
    Gen2,
    Gen3,
    Gen4,
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Gen2 => "GEN2",
            Self::Gen3 => "GEN3",
            Self::Gen4 => "GEN4",
        };
        f.write_str(name)
    }
}

/// Cube face in URFDLB order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Face {
    U,
    R,
    F,
    D,
    L,
    B,
}

impl Face {
    pub const ORDER: [Face; 6] = [Face::U, Face::R, Face::F, Face::D, Face::L, Face::B];

    pub fn from_index(index: u32) -> Option<Self> {
        Self::ORDER.get(index as usize).copied()
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_char(self) -> char {
        match self {
            Self::U => 'U',
            Self::R => 'R',
            Self::F => 'F',
            Self::D => 'D',
            Self::L => 'L',
            Self::B => 'B',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Clockwise,
    CounterClockwise,
}

impl Direction {
    pub fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            0 => Some(Self::Clockwise),
            1 => Some(Self::CounterClockwise),
            _ => None,
        }
    }
}

/// Standard move notation, e.g. `R` or `U'`.
pub fn move_notation(face: Face, direction: Direction) -> String {
    match direction {
        Direction::Clockwise => face.as_char().to_string(),
        Direction::CounterClockwise => format!("{}'", face.as_char()),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MoveEvent {
    pub timestamp: HostMillis,
    /// Move counter as reported by the cube (8-bit on Gen2, 16-bit on Gen3/4).
    pub serial: u16,
    pub face: Face,
    pub direction: Direction,
    pub notation: String,
    /// Host time the move was observed. `None` for moves recovered from a
    /// later notification; those were inferred, never timed.
    pub local_timestamp: Option<HostMillis>,
    /// Cube clock in milliseconds.
    pub cube_timestamp: u64,
    /// Host time predicted from the cube clock once clock sync is calibrated.
    pub estimated_host_timestamp: Option<HostMillis>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FaceletStateEvent {
    pub timestamp: HostMillis,
    pub serial: u16,
    pub state: CornerEdgeState,
    /// 54-character Kociemba facelet string.
    pub facelets: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrientationEvent {
    pub timestamp: HostMillis,
    pub quaternion: Quaternion<f64>,
    /// Derived from the two most recent samples, in rad/s.
    pub angular_velocity: Option<Vector3<f64>>,
    /// Coarse velocity reported by the cube itself, when the frame carries it.
    pub sensor_velocity: Option<Vector3<f64>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatteryEvent {
    pub timestamp: HostMillis,
    pub percent: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareEvent {
    pub timestamp: HostMillis,
    pub name: String,
    pub hardware_version: String,
    pub software_version: String,
    pub product_date: Option<String>,
    pub gyro_supported: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CubeEvent {
    Move(MoveEvent),
    FaceletState(FaceletStateEvent),
    Orientation(OrientationEvent),
    Battery(BatteryEvent),
    Hardware(HardwareEvent),
    /// The cube announced it is going away. A normal lifecycle transition.
    Disconnect { timestamp: HostMillis },
}

impl CubeEvent {
    pub fn timestamp(&self) -> HostMillis {
        match self {
            Self::Move(e) => e.timestamp,
            Self::FaceletState(e) => e.timestamp,
            Self::Orientation(e) => e.timestamp,
            Self::Battery(e) => e.timestamp,
            Self::Hardware(e) => e.timestamp,
            Self::Disconnect { timestamp } => *timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CubeCommand {
    RequestFacelets,
    RequestHardware,
    RequestBattery,
    /// Resets the cube's internal state to solved.
    RequestReset,
}

/// Platform identifier of a peripheral. On most stacks this is the MAC
/// address, on some it is an opaque per-host UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeripheralAddress(pub String);

impl PeripheralAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Compares as hardware addresses when both sides parse as one, so case
    /// and separator style do not matter. Opaque identifiers compare
    /// case-insensitively.
    pub fn same_peripheral(&self, other: &PeripheralAddress) -> bool {
        match (self.0.parse::<MacAddress>(), other.0.parse::<MacAddress>()) {
            (Ok(a), Ok(b)) => a == b,
            _ => self.0.eq_ignore_ascii_case(&other.0),
        }
    }
}

impl fmt::Display for PeripheralAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 6-byte hardware address, most significant byte first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// Key salt: the address bytes in reverse order.
    pub fn salt(&self) -> [u8; 6] {
        let mut salt = self.0;
        salt.reverse();
        salt
    }
}

impl FromStr for MacAddress {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s
            .split(|c: char| c == ':' || c == '-' || c.is_whitespace())
            .filter(|p| !p.is_empty())
            .collect();
        if parts.len() != 6 {
            return Err(ConfigurationError::MalformedAddress(s.to_string()));
        }

        let mut bytes = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            bytes[i] = u8::from_str_radix(part, 16)
                .map_err(|_| ConfigurationError::MalformedAddress(s.to_string()))?;
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralIdentity {
    pub address: PeripheralAddress,
    pub name: Option<String>,
    /// Hardware address recovered from advertisement data, when the platform
    /// address is not the MAC.
    pub mac: Option<MacAddress>,
    pub generation: Option<Generation>,
}

impl PeripheralIdentity {
    pub fn new(address: PeripheralAddress) -> Self {
        Self {
            address,
            name: None,
            mac: None,
            generation: None,
        }
    }

    /// The hardware address used for keying: the advertised MAC if known,
    /// otherwise the platform address parsed as a MAC.
    pub fn hardware_address(&self) -> Option<MacAddress> {
        self.mac.or_else(|| self.address.as_str().parse().ok())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub connected: bool,
    pub device_name: Option<String>,
    pub address: Option<PeripheralAddress>,
    pub generation: Option<Generation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Scanning,
    Connecting,
    DiscoveringServices,
    ConfiguringCipher,
    Subscribing,
    Connected,
    Disconnecting,
}

/// A peripheral that looks like a cube. Manufacturer-data matches alone are
/// advisory and do not make a candidate eligible for automatic connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub identity: PeripheralIdentity,
    pub rssi: Option<i16>,
    pub matched_by_name: bool,
    pub matched_by_service: bool,
    pub matched_by_manufacturer: bool,
}

impl Candidate {
    pub fn is_strong(&self) -> bool {
        self.matched_by_name || self.matched_by_service
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Requested,
    CubeInitiated,
    Transport,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    StateChanged(SessionState),
    CandidateFound(Candidate),
    Connected(ConnectionInfo),
    Disconnected {
        address: Option<PeripheralAddress>,
        reason: DisconnectReason,
    },
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Cube(CubeEvent),
    Lifecycle(LifecycleEvent),
    /// Diagnostic channel for anomalies the session recovered from.
    Log(StatusMessage),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_parse_and_salt() {
        let mac: MacAddress = "AB:12:CD:34:EF:56".parse().unwrap();
        assert_eq!(mac.0, [0xAB, 0x12, 0xCD, 0x34, 0xEF, 0x56]);
        assert_eq!(mac.salt(), [0x56, 0xEF, 0x34, 0xCD, 0x12, 0xAB]);
        assert_eq!(mac.to_string(), "AB:12:CD:34:EF:56");
    }

    #[test]
    fn test_mac_parse_rejects_short() {
        assert!("AB:12:CD:34:EF".parse::<MacAddress>().is_err());
        assert!("zz:12:CD:34:EF:56".parse::<MacAddress>().is_err());
    }

    #[test]
    fn test_same_peripheral_ignores_case_and_separators() {
        let advertised = PeripheralAddress::new("AB:12:CD:34:EF:56");
        assert!(advertised.same_peripheral(&PeripheralAddress::new("ab:12:cd:34:ef:56")));
        assert!(advertised.same_peripheral(&PeripheralAddress::new("ab-12-cd-34-ef-56")));
        assert!(!advertised.same_peripheral(&PeripheralAddress::new("AB:12:CD:34:EF:57")));

        let opaque = PeripheralAddress::new("5A1C3E0B-7F64-4F0E-9C2D-11B1F6C8A001");
        assert!(opaque.same_peripheral(&PeripheralAddress::new(
            "5a1c3e0b-7f64-4f0e-9c2d-11b1f6c8a001"
        )));
        assert!(!opaque.same_peripheral(&advertised));
    }

    #[test]
    fn test_hardware_address_prefers_advertised_mac() {
        let mut identity = PeripheralIdentity::new(PeripheralAddress::new("11:22:33:44:55:66"));
        assert_eq!(
            identity.hardware_address(),
            Some(MacAddress([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]))
        );

        identity.mac = Some(MacAddress([1, 2, 3, 4, 5, 6]));
        assert_eq!(identity.hardware_address(), Some(MacAddress([1, 2, 3, 4, 5, 6])));

        let opaque = PeripheralIdentity::new(PeripheralAddress::new(
            "5A1C3E0B-7F64-4F0E-9C2D-11B1F6C8A001",
        ));
        assert_eq!(opaque.hardware_address(), None);
    }

    #[test]
    fn test_move_notation() {
        assert_eq!(move_notation(Face::R, Direction::Clockwise), "R");
        assert_eq!(move_notation(Face::U, Direction::CounterClockwise), "U'");
    }
}
