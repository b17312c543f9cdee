//! Gen4 protocol: GAN12 ui Maglev, GAN14 ui FreePlay.
//!
//! Frames start with an event type byte and a length byte. Hardware identity
//! is spread over four separate frames and reported once all have arrived.

use tracing::{debug, trace};

use super::{
    battery_event, direction, ensure_len, face_from_mask, read_ascii_name,
    read_corner_edge_state, read_quaternion, read_sensor_velocity, CubeDriver, DriverOptions,
    DriverState, FaceletLayout,
};
use crate::domain::models::{CubeCommand, CubeEvent, Generation, HardwareEvent, HostMillis};
use crate::error::ProtocolError;
use crate::infrastructure::bluetooth::bitfield::BitfieldView;
use crate::infrastructure::bluetooth::protocol::{is_gyro_model, GEN4_PROFILE, RESET_SEQUENCE};

const EVENT_MOVE: u32 = 0x01;
const EVENT_MOVE_HISTORY: u32 = 0xD1;
const EVENT_DISCONNECT: u32 = 0xEA;
const EVENT_GYRO: u32 = 0xEC;
const EVENT_FACELETS: u32 = 0xED;
const EVENT_BATTERY: u32 = 0xEF;
const EVENT_PRODUCT_DATE: u32 = 0xFA;
const EVENT_HARDWARE_NAME: u32 = 0xFC;
const EVENT_SOFTWARE_VERSION: u32 = 0xFD;
const EVENT_HARDWARE_VERSION: u32 = 0xFE;

const FACELETS: FaceletLayout = FaceletLayout {
    cp: 32,
    co: 53,
    ep: 69,
    eo: 113,
};

#[derive(Debug, Default)]
struct PendingHardware {
    product_date: Option<String>,
    name: Option<String>,
    software_version: Option<String>,
    hardware_version: Option<String>,
}

impl PendingHardware {
    /// Takes the collected parts once all four are present.
    fn complete(&mut self, host_now: HostMillis) -> Option<CubeEvent> {
        if self.product_date.is_none()
            || self.name.is_none()
            || self.software_version.is_none()
            || self.hardware_version.is_none()
        {
            return None;
        }
        let parts = std::mem::take(self);
        let name = parts.name.unwrap_or_default();
        Some(CubeEvent::Hardware(HardwareEvent {
            timestamp: host_now,
            gyro_supported: is_gyro_model(&name),
            name,
            hardware_version: parts.hardware_version.unwrap_or_default(),
            software_version: parts.software_version.unwrap_or_default(),
            product_date: parts.product_date,
        }))
    }
}

pub struct Gen4Driver {
    state: DriverState,
    hardware: PendingHardware,
}

impl Gen4Driver {
    pub fn new(options: DriverOptions) -> Self {
        Self {
            state: DriverState::new(options),
            hardware: PendingHardware::default(),
        }
    }

    fn decode_move(
        &mut self,
        view: &BitfieldView<'_>,
        host_now: HostMillis,
    ) -> Result<Vec<CubeEvent>, ProtocolError> {
        let cube_ts = view.u32_le(16)? as u64;
        let serial = view.u16_le(48)?;
        let direction = direction(view.bits(64, 2)?)?;
        let face = face_from_mask(view.bits(66, 6)?)?;

        if !self.state.track_single_move(serial, Generation::Gen4) {
            return Ok(Vec::new());
        }
        self.state.cube_ts = cube_ts;
        self.state.last_move_ts = host_now;
        Ok(vec![self
            .state
            .move_event(serial, face, direction, cube_ts, host_now, true)])
    }

    fn decode_hardware_part(
        &mut self,
        event: u32,
        length: usize,
        view: &BitfieldView<'_>,
        host_now: HostMillis,
    ) -> Result<Vec<CubeEvent>, ProtocolError> {
        match event {
            EVENT_PRODUCT_DATE => {
                let year = view.u16_le(24)?;
                let month = view.bits(40, 8)?;
                let day = view.bits(48, 8)?;
                self.hardware.product_date = Some(format!("{year:04}-{month:02}-{day:02}"));
            }
            EVENT_HARDWARE_NAME => {
                let chars = length.saturating_sub(1);
                self.hardware.name = Some(read_ascii_name(view, 24, chars)?);
            }
            EVENT_SOFTWARE_VERSION => {
                let version = format!("{}.{}", view.bits(24, 4)?, view.bits(28, 4)?);
                self.hardware.software_version = Some(version);
            }
            EVENT_HARDWARE_VERSION => {
                let version = format!("{}.{}", view.bits(24, 4)?, view.bits(28, 4)?);
                self.hardware.hardware_version = Some(version);
            }
            _ => {}
        }
        debug!("GEN4: hardware part {:#x} received", event);
        Ok(self.hardware.complete(host_now).into_iter().collect())
    }
}

impl CubeDriver for Gen4Driver {
    fn generation(&self) -> Generation {
        Generation::Gen4
    }

    fn frame_len(&self) -> usize {
        GEN4_PROFILE.frame_len
    }

    fn decode(
        &mut self,
        payload: &[u8],
        host_now: HostMillis,
    ) -> Result<Vec<CubeEvent>, ProtocolError> {
        ensure_len(payload, self.frame_len())?;
        let view = BitfieldView::new(payload);
        let event = view.bits(0, 8)?;
        let length = view.bits(8, 8)? as usize;

        match event {
            EVENT_MOVE => self.decode_move(&view, host_now),
            EVENT_FACELETS => {
                let serial = view.u16_le(16)?;
                let state = read_corner_edge_state(&view, &FACELETS)?;
                Ok(vec![self.state.facelet_event(serial, state, host_now)])
            }
            EVENT_MOVE_HISTORY => {
                trace!("GEN4: move history frame acknowledged");
                Ok(Vec::new())
            }
            EVENT_GYRO => {
                let quaternion = read_quaternion(&view, [16, 32, 48, 64])?;
                let velocity = read_sensor_velocity(&view, [80, 84, 88])?;
                Ok(self
                    .state
                    .orientation_event(quaternion, Some(velocity), host_now)
                    .into_iter()
                    .collect())
            }
            EVENT_PRODUCT_DATE
            | EVENT_HARDWARE_NAME
            | EVENT_SOFTWARE_VERSION
            | EVENT_HARDWARE_VERSION => self.decode_hardware_part(event, length, &view, host_now),
            EVENT_BATTERY => {
                let level = view.bits(8 + length * 8, 8)?;
                Ok(vec![battery_event(level, host_now)])
            }
            EVENT_DISCONNECT => Ok(vec![CubeEvent::Disconnect {
                timestamp: host_now,
            }]),
            other => {
                trace!("GEN4: ignoring event type {:#x}", other);
                Ok(Vec::new())
            }
        }
    }

    fn encode(&self, command: CubeCommand) -> Option<Vec<u8>> {
        let mut frame = vec![0u8; GEN4_PROFILE.frame_len];
        let header: &[u8] = match command {
            CubeCommand::RequestFacelets => &[0xDD, 0x04, 0x00, 0xED, 0x00, 0x00],
            CubeCommand::RequestHardware => &[0xDF, 0x03, 0x00, 0x00, 0x00],
            CubeCommand::RequestBattery => &[0xDD, 0x04, 0x00, 0xEF, 0x00, 0x00],
            CubeCommand::RequestReset => &[0xD2, 0x0D],
        };
        frame[..header.len()].copy_from_slice(header);
        if command == CubeCommand::RequestReset {
            frame[2..2 + RESET_SEQUENCE.len()].copy_from_slice(&RESET_SEQUENCE);
        }
        Some(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::Face;
    use crate::infrastructure::bluetooth::bitfield::BitWriter;

    fn frame(event: u32, length: u32) -> BitWriter {
        let mut w = BitWriter::new(20);
        w.put(0, 8, event).put(8, 8, length);
        w
    }

    fn facelets_frame(serial: u16) -> Vec<u8> {
        let mut w = frame(EVENT_FACELETS, 16);
        w.put_u16_le(16, serial);
        for i in 0..7 {
            w.put(32 + 3 * i, 3, i as u32);
        }
        for i in 0..11 {
            w.put(69 + 4 * i, 4, i as u32);
        }
        w.bytes.clone()
    }

    #[test]
    fn test_facelets_then_move() {
        let mut d = Gen4Driver::new(DriverOptions::default());
        let events = d.decode(&facelets_frame(7), 0).unwrap();
        let CubeEvent::FaceletState(f) = &events[0] else {
            panic!()
        };
        assert_eq!(f.state.cp[7], 7);
        assert_eq!(f.state.ep[11], 11);

        let mut w = frame(EVENT_MOVE, 9);
        w.put_u32_le(16, 123_456).put_u16_le(48, 8).put(64, 2, 0).put(66, 6, 1);
        let events = d.decode(&w.bytes, 50).unwrap();
        let CubeEvent::Move(m) = &events[0] else {
            panic!()
        };
        assert_eq!(m.face, Face::D);
        assert_eq!(m.notation, "D");
        assert_eq!(m.serial, 8);
        assert_eq!(m.cube_timestamp, 123_456);
    }

    #[test]
    fn test_hardware_emitted_once_all_parts_arrive() {
        let mut d = Gen4Driver::new(DriverOptions::default());

        let mut w = frame(EVENT_HARDWARE_NAME, 14);
        for (i, b) in b"GAN12uiMaglev".iter().enumerate() {
            w.put(24 + 8 * i, 8, *b as u32);
        }
        assert!(d.decode(&w.bytes, 0).unwrap().is_empty());

        let mut w = frame(EVENT_SOFTWARE_VERSION, 2);
        w.put(24, 4, 3).put(28, 4, 7);
        assert!(d.decode(&w.bytes, 0).unwrap().is_empty());

        let mut w = frame(EVENT_HARDWARE_VERSION, 2);
        w.put(24, 4, 1).put(28, 4, 0);
        assert!(d.decode(&w.bytes, 0).unwrap().is_empty());

        let mut w = frame(EVENT_PRODUCT_DATE, 5);
        w.put_u16_le(24, 2023).put(40, 8, 6).put(48, 8, 9);
        let events = d.decode(&w.bytes, 99).unwrap();
        let CubeEvent::Hardware(hw) = &events[0] else {
            panic!("expected hardware, got {events:?}")
        };
        assert_eq!(hw.name, "GAN12uiMaglev");
        assert_eq!(hw.software_version, "3.7");
        assert_eq!(hw.hardware_version, "1.0");
        assert_eq!(hw.product_date.as_deref(), Some("2023-06-09"));
        assert!(hw.gyro_supported);
        assert_eq!(hw.timestamp, 99);
    }

    #[test]
    fn test_battery_follows_length() {
        let mut d = Gen4Driver::new(DriverOptions::default());
        let mut w = frame(EVENT_BATTERY, 3);
        w.put(8 + 3 * 8, 8, 64);
        assert!(matches!(
            d.decode(&w.bytes, 0).unwrap().as_slice(),
            [CubeEvent::Battery(b)] if b.percent == 64
        ));
    }

    #[test]
    fn test_gyro_frame() {
        let mut d = Gen4Driver::new(DriverOptions::default());
        let mut w = frame(EVENT_GYRO, 12);
        w.put(16, 16, 0x7FFF).put(80, 4, 0b1001);
        let events = d.decode(&w.bytes, 0).unwrap();
        let CubeEvent::Orientation(o) = &events[0] else {
            panic!()
        };
        assert!((o.quaternion.w - 1.0).abs() < 1e-9);
        assert_eq!(o.sensor_velocity.map(|v| v.x), Some(-1.0));
    }

    #[test]
    fn test_encode_commands() {
        let d = Gen4Driver::new(DriverOptions::default());
        let facelets = d.encode(CubeCommand::RequestFacelets).unwrap();
        assert_eq!(&facelets[..4], &[0xDD, 0x04, 0x00, 0xED]);
        assert_eq!(facelets.len(), 20);
        let reset = d.encode(CubeCommand::RequestReset).unwrap();
        assert_eq!(
            &reset[..13],
            &[0xD2, 0x0D, 0x05, 0x39, 0x77, 0x00, 0x00, 0x01, 0x23, 0x45, 0x67, 0x89, 0xAB]
        );
    }
}
