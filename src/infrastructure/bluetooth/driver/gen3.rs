//! Gen3 protocol: GAN356 i Carry 2.
//!
//! Every frame starts with a `0x55` magic byte, an event type byte and a
//! length byte. Moves arrive one per notification.

use tracing::trace;

use super::{
    battery_event, direction, ensure_len, face_from_mask, read_ascii_name,
    read_corner_edge_state, CubeDriver, DriverOptions, DriverState, FaceletLayout,
};
use crate::domain::models::{CubeCommand, CubeEvent, Generation, HardwareEvent, HostMillis};
use crate::error::ProtocolError;
use crate::infrastructure::bluetooth::bitfield::BitfieldView;
use crate::infrastructure::bluetooth::protocol::{GEN3_PROFILE, RESET_SEQUENCE};

const MAGIC: u32 = 0x55;

const EVENT_MOVE: u32 = 0x01;
const EVENT_FACELETS: u32 = 0x02;
const EVENT_MOVE_HISTORY: u32 = 0x06;
const EVENT_HARDWARE: u32 = 0x07;
const EVENT_BATTERY: u32 = 0x10;
const EVENT_DISCONNECT: u32 = 0x11;

const FACELETS: FaceletLayout = FaceletLayout {
    cp: 40,
    co: 61,
    ep: 77,
    eo: 121,
};

pub struct Gen3Driver {
    state: DriverState,
}

impl Gen3Driver {
    pub fn new(options: DriverOptions) -> Self {
        Self {
            state: DriverState::new(options),
        }
    }

    fn decode_move(
        &mut self,
        view: &BitfieldView<'_>,
        host_now: HostMillis,
    ) -> Result<Vec<CubeEvent>, ProtocolError> {
        let cube_ts = view.u32_le(24)? as u64;
        let serial = view.u16_le(56)?;
        let direction = direction(view.bits(72, 2)?)?;
        let face = face_from_mask(view.bits(74, 6)?)?;

        if !self.state.track_single_move(serial, Generation::Gen3) {
            return Ok(Vec::new());
        }
        self.state.cube_ts = cube_ts;
        self.state.last_move_ts = host_now;
        Ok(vec![self
            .state
            .move_event(serial, face, direction, cube_ts, host_now, true)])
    }
}

impl CubeDriver for Gen3Driver {
    fn generation(&self) -> Generation {
        Generation::Gen3
    }

    fn frame_len(&self) -> usize {
        GEN3_PROFILE.frame_len
    }

    fn decode(
        &mut self,
        payload: &[u8],
        host_now: HostMillis,
    ) -> Result<Vec<CubeEvent>, ProtocolError> {
        ensure_len(payload, self.frame_len())?;
        let view = BitfieldView::new(payload);

        let magic = view.bits(0, 8)?;
        if magic != MAGIC {
            return Err(ProtocolError::MalformedField {
                field: "frame magic",
                reason: format!("expected {MAGIC:#04x}, got {magic:#04x}"),
            });
        }
        if view.bits(16, 8)? == 0 {
            trace!("GEN3: empty frame");
            return Ok(Vec::new());
        }

        match view.bits(8, 8)? {
            EVENT_MOVE => self.decode_move(&view, host_now),
            EVENT_FACELETS => {
                let serial = view.u16_le(24)?;
                let state = read_corner_edge_state(&view, &FACELETS)?;
                Ok(vec![self.state.facelet_event(serial, state, host_now)])
            }
            EVENT_MOVE_HISTORY => {
                trace!("GEN3: move history frame acknowledged");
                Ok(Vec::new())
            }
            EVENT_HARDWARE => {
                let sw = (view.bits(72, 4)?, view.bits(76, 4)?);
                let hw = (view.bits(80, 4)?, view.bits(84, 4)?);
                let name = read_ascii_name(&view, 32, 5)?;
                Ok(vec![CubeEvent::Hardware(HardwareEvent {
                    timestamp: host_now,
                    name,
                    hardware_version: format!("{}.{}", hw.0, hw.1),
                    software_version: format!("{}.{}", sw.0, sw.1),
                    product_date: None,
                    gyro_supported: false,
                })])
            }
            EVENT_BATTERY => Ok(vec![battery_event(view.bits(24, 8)?, host_now)]),
            EVENT_DISCONNECT => Ok(vec![CubeEvent::Disconnect {
                timestamp: host_now,
            }]),
            other => {
                trace!("GEN3: ignoring event type {:#x}", other);
                Ok(Vec::new())
            }
        }
    }

    fn encode(&self, command: CubeCommand) -> Option<Vec<u8>> {
        let mut frame = vec![0u8; GEN3_PROFILE.frame_len];
        frame[0] = 0x68;
        match command {
            CubeCommand::RequestFacelets => frame[1] = 0x01,
            CubeCommand::RequestHardware => frame[1] = 0x04,
            CubeCommand::RequestBattery => frame[1] = 0x07,
            CubeCommand::RequestReset => {
                frame[1] = 0x05;
                frame[2..2 + RESET_SEQUENCE.len()].copy_from_slice(&RESET_SEQUENCE);
            }
        }
        Some(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{Direction, Face};
    use crate::infrastructure::bluetooth::bitfield::BitWriter;

    fn header(len: usize, event: u32) -> BitWriter {
        let mut w = BitWriter::new(len);
        w.put(0, 8, MAGIC).put(8, 8, event).put(16, 8, 1);
        w
    }

    fn facelets_frame(serial: u16) -> Vec<u8> {
        // Carries 132 bits of state, so the frame is longer than the minimum.
        let mut w = header(20, EVENT_FACELETS);
        w.put_u16_le(24, serial);
        for i in 0..7 {
            w.put(40 + 3 * i, 3, i as u32);
        }
        for i in 0..11 {
            w.put(77 + 4 * i, 4, i as u32);
        }
        w.bytes.clone()
    }

    fn move_frame(serial: u16, cube_ts: u32, dir: u32, mask: u32) -> Vec<u8> {
        let mut w = header(16, EVENT_MOVE);
        w.put_u32_le(24, cube_ts)
            .put_u16_le(56, serial)
            .put(72, 2, dir)
            .put(74, 6, mask);
        w.bytes.clone()
    }

    #[test]
    fn test_move_requires_facelets_first() {
        let mut d = Gen3Driver::new(DriverOptions::default());
        assert!(d.decode(&move_frame(1, 500, 0, 32), 10).unwrap().is_empty());

        let events = d.decode(&facelets_frame(300), 20).unwrap();
        assert!(matches!(&events[0], CubeEvent::FaceletState(f) if f.serial == 300));

        let events = d.decode(&move_frame(301, 70_000, 1, 32), 30).unwrap();
        let CubeEvent::Move(m) = &events[0] else {
            panic!("expected move, got {events:?}")
        };
        assert_eq!(m.face, Face::R);
        assert_eq!(m.direction, Direction::CounterClockwise);
        assert_eq!(m.notation, "R'");
        assert_eq!(m.serial, 301);
        assert_eq!(m.cube_timestamp, 70_000);
        assert_eq!(m.local_timestamp, Some(30));
    }

    #[test]
    fn test_serial_gap_still_emits_single_move() {
        let mut d = Gen3Driver::new(DriverOptions::default());
        d.decode(&facelets_frame(10), 0).unwrap();
        let events = d.decode(&move_frame(14, 100, 0, 2), 5).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(d.state.last_serial, Some(14));
    }

    #[test]
    fn test_clock_sync_estimates_after_two_moves() {
        let mut d = Gen3Driver::new(DriverOptions::default());
        d.decode(&facelets_frame(0), 0).unwrap();
        d.decode(&move_frame(1, 1000, 0, 2), 11_000).unwrap();
        let events = d.decode(&move_frame(2, 2000, 0, 2), 12_000).unwrap();
        let CubeEvent::Move(m) = &events[0] else {
            panic!()
        };
        assert_eq!(m.estimated_host_timestamp, Some(12_000));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut d = Gen3Driver::new(DriverOptions::default());
        let mut frame = move_frame(1, 0, 0, 2);
        frame[0] = 0x54;
        assert!(matches!(
            d.decode(&frame, 0),
            Err(ProtocolError::MalformedField { field: "frame magic", .. })
        ));
    }

    #[test]
    fn test_hardware_and_battery() {
        let mut d = Gen3Driver::new(DriverOptions::default());
        let mut w = header(16, EVENT_HARDWARE);
        w.put(72, 4, 2).put(76, 4, 1).put(80, 4, 1).put(84, 4, 3);
        for (i, b) in b"GAN35".iter().enumerate() {
            w.put(32 + 8 * i, 8, *b as u32);
        }
        let events = d.decode(&w.bytes, 0).unwrap();
        let CubeEvent::Hardware(hw) = &events[0] else {
            panic!()
        };
        assert_eq!(hw.name, "GAN35");
        assert_eq!(hw.software_version, "2.1");
        assert_eq!(hw.hardware_version, "1.3");
        assert!(!hw.gyro_supported);

        let mut w = header(16, EVENT_BATTERY);
        w.put(24, 8, 87);
        assert!(matches!(
            d.decode(&w.bytes, 0).unwrap().as_slice(),
            [CubeEvent::Battery(b)] if b.percent == 87
        ));
    }

    #[test]
    fn test_short_facelets_frame_is_out_of_bounds() {
        let mut d = Gen3Driver::new(DriverOptions::default());
        let frame = facelets_frame(1);
        assert!(matches!(
            d.decode(&frame[..16], 0),
            Err(ProtocolError::FieldOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_encode_commands() {
        let d = Gen3Driver::new(DriverOptions::default());
        assert_eq!(d.encode(CubeCommand::RequestBattery).unwrap()[..2], [0x68, 0x07]);
        let reset = d.encode(CubeCommand::RequestReset).unwrap();
        assert_eq!(reset.len(), 16);
        assert_eq!(
            &reset[..13],
            &[0x68, 0x05, 0x05, 0x39, 0x77, 0x00, 0x00, 0x01, 0x23, 0x45, 0x67, 0x89, 0xAB]
        );
    }
}
