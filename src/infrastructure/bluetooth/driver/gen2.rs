//! Gen2 protocol: GAN356 i/i2/i Carry S, GAN12 ui, Monster Go 3Ai,
//! MoYu AI 2023.
//!
//! ```text
//! bits 0..4   event type
//! GYRO      qw,qx,qy,qz 16 bit at 4,20,36,52; velocity nibbles at 68,72,76
//! MOVE      serial 8 bit at 4; up to 7 moves, newest first:
//!           face 4 bit at 12+5i, direction 1 bit at 16+5i,
//!           elapsed ms 16 bit at 47+16i
//! FACELETS  serial at 4; CP 12+3i, CO 33+2i, EP 47+4i, EO 91+i
//! HARDWARE  hw 8.8 at 8, sw 8.8 at 24, name 8 chars at 40, gyro bit at 104
//! BATTERY   level at 8
//! ```

use tracing::{debug, trace};

use super::{
    battery_event, direction, ensure_len, read_ascii_name, read_corner_edge_state,
    read_quaternion, read_sensor_velocity, CubeDriver, DriverOptions, DriverState, FaceletLayout,
};
use crate::domain::models::{
    CubeCommand, CubeEvent, Face, Generation, HardwareEvent, HostMillis,
};
use crate::error::ProtocolError;
use crate::infrastructure::bluetooth::bitfield::BitfieldView;
use crate::infrastructure::bluetooth::protocol::{GEN2_PROFILE, RESET_SEQUENCE};

const EVENT_GYRO: u32 = 0x01;
const EVENT_MOVE: u32 = 0x02;
const EVENT_FACELETS: u32 = 0x04;
const EVENT_HARDWARE: u32 = 0x05;
const EVENT_BATTERY: u32 = 0x09;
const EVENT_DISCONNECT: u32 = 0x0D;

/// Most moves a single MOVE notification can carry.
const MAX_RECOVERED_MOVES: u8 = 7;

const FACELETS: FaceletLayout = FaceletLayout {
    cp: 12,
    co: 33,
    ep: 47,
    eo: 91,
};

pub struct Gen2Driver {
    state: DriverState,
}

impl Gen2Driver {
    pub fn new(options: DriverOptions) -> Self {
        Self {
            state: DriverState::new(options),
        }
    }

    fn decode_gyro(
        &mut self,
        view: &BitfieldView<'_>,
        host_now: HostMillis,
    ) -> Result<Vec<CubeEvent>, ProtocolError> {
        let quaternion = read_quaternion(view, [4, 20, 36, 52])?;
        let velocity = read_sensor_velocity(view, [68, 72, 76])?;
        Ok(self
            .state
            .orientation_event(quaternion, Some(velocity), host_now)
            .into_iter()
            .collect())
    }

    /// Recovers every move since the last seen serial, oldest first.
    fn decode_moves(
        &mut self,
        view: &BitfieldView<'_>,
        host_now: HostMillis,
    ) -> Result<Vec<CubeEvent>, ProtocolError> {
        let Some(last_serial) = self.state.last_serial else {
            debug!("GEN2: move before first facelets snapshot dropped");
            return Ok(Vec::new());
        };

        let serial = view.bits(4, 8)? as u8;
        let diff = serial.wrapping_sub(last_serial as u8).min(MAX_RECOVERED_MOVES);

        // Parse everything before touching state so a malformed frame
        // leaves the tracker where it was.
        let mut moves = Vec::with_capacity(diff as usize);
        for i in (0..diff as usize).rev() {
            let face_index = view.bits(12 + 5 * i, 4)?;
            let face = Face::from_index(face_index).ok_or_else(|| ProtocolError::MalformedField {
                field: "face",
                reason: format!("face index {face_index} out of range"),
            })?;
            let direction = direction(view.bits(16 + 5 * i, 1)?)?;
            let elapsed = view.bits(47 + 16 * i, 16)?;
            moves.push((i, face, direction, elapsed));
        }

        self.state.last_serial = Some(serial as u16);
        let mut events = Vec::with_capacity(moves.len());
        for (i, face, direction, elapsed) in moves {
            // A zero elapsed value means the cube's timer register wrapped.
            let elapsed = if elapsed == 0 {
                host_now.saturating_sub(self.state.last_move_ts)
            } else {
                elapsed as u64
            };
            self.state.cube_ts += elapsed;

            let move_serial = serial.wrapping_sub(i as u8) as u16;
            let cube_ts = self.state.cube_ts;
            events.push(
                self.state
                    .move_event(move_serial, face, direction, cube_ts, host_now, i == 0),
            );
        }
        if diff > 0 {
            self.state.last_move_ts = host_now;
        }
        Ok(events)
    }

    fn decode_hardware(
        &self,
        view: &BitfieldView<'_>,
        host_now: HostMillis,
    ) -> Result<Vec<CubeEvent>, ProtocolError> {
        let hw_major = view.bits(8, 8)?;
        let hw_minor = view.bits(16, 8)?;
        let sw_major = view.bits(24, 8)?;
        let sw_minor = view.bits(32, 8)?;
        let name = read_ascii_name(view, 40, 8)?;
        let gyro_supported = view.bits(104, 1)? == 1;

        Ok(vec![CubeEvent::Hardware(HardwareEvent {
            timestamp: host_now,
            name,
            hardware_version: format!("{hw_major}.{hw_minor}"),
            software_version: format!("{sw_major}.{sw_minor}"),
            product_date: None,
            gyro_supported,
        })])
    }
}

impl CubeDriver for Gen2Driver {
    fn generation(&self) -> Generation {
        Generation::Gen2
    }

    fn frame_len(&self) -> usize {
        GEN2_PROFILE.frame_len
    }

    fn decode(
        &mut self,
        payload: &[u8],
        host_now: HostMillis,
    ) -> Result<Vec<CubeEvent>, ProtocolError> {
        ensure_len(payload, self.frame_len())?;
        let view = BitfieldView::new(payload);

        match view.bits(0, 4)? {
            EVENT_GYRO => self.decode_gyro(&view, host_now),
            EVENT_MOVE => self.decode_moves(&view, host_now),
            EVENT_FACELETS => {
                let serial = view.bits(4, 8)? as u16;
                let state = read_corner_edge_state(&view, &FACELETS)?;
                Ok(vec![self.state.facelet_event(serial, state, host_now)])
            }
            EVENT_HARDWARE => self.decode_hardware(&view, host_now),
            EVENT_BATTERY => Ok(vec![battery_event(view.bits(8, 8)?, host_now)]),
            EVENT_DISCONNECT => Ok(vec![CubeEvent::Disconnect {
                timestamp: host_now,
            }]),
            other => {
                trace!("GEN2: ignoring event type {:#x}", other);
                Ok(Vec::new())
            }
        }
    }

    fn encode(&self, command: CubeCommand) -> Option<Vec<u8>> {
        let mut frame = vec![0u8; GEN2_PROFILE.frame_len];
        match command {
            CubeCommand::RequestFacelets => frame[0] = 0x04,
            CubeCommand::RequestHardware => frame[0] = 0x05,
            CubeCommand::RequestBattery => frame[0] = 0x09,
            CubeCommand::RequestReset => {
                frame[0] = 0x0A;
                frame[1..1 + RESET_SEQUENCE.len()].copy_from_slice(&RESET_SEQUENCE);
            }
        }
        Some(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::facelets::SOLVED_FACELETS;
    use crate::domain::models::Direction;
    use crate::infrastructure::bluetooth::bitfield::BitWriter;

    fn driver() -> Gen2Driver {
        Gen2Driver::new(DriverOptions::default())
    }

    fn solved_facelets_frame(serial: u32) -> Vec<u8> {
        let mut w = BitWriter::new(20);
        w.put(0, 4, EVENT_FACELETS).put(4, 8, serial);
        for i in 0..7 {
            w.put(12 + 3 * i, 3, i as u32);
        }
        for i in 0..11 {
            w.put(47 + 4 * i, 4, i as u32);
        }
        w.bytes.clone()
    }

    /// `moves` newest first: (face index, direction bit, elapsed).
    fn move_frame(serial: u32, moves: &[(u32, u32, u32)]) -> Vec<u8> {
        let mut w = BitWriter::new(20);
        w.put(0, 4, EVENT_MOVE).put(4, 8, serial);
        for (i, &(face, dir, elapsed)) in moves.iter().enumerate() {
            w.put(12 + 5 * i, 4, face)
                .put(16 + 5 * i, 1, dir)
                .put(47 + 16 * i, 16, elapsed);
        }
        w.bytes.clone()
    }

    #[test]
    fn test_move_before_facelets_is_dropped() {
        let mut d = driver();
        let events = d.decode(&move_frame(1, &[(1, 0, 100)]), 1000).unwrap();
        assert!(events.is_empty());
        assert_eq!(d.state.last_serial, None);
    }

    #[test]
    fn test_facelets_arm_tracker_and_render() {
        let mut d = driver();
        let events = d.decode(&solved_facelets_frame(17), 1000).unwrap();
        let CubeEvent::FaceletState(event) = &events[0] else {
            panic!("expected facelets, got {events:?}");
        };
        assert_eq!(event.serial, 17);
        assert_eq!(event.facelets, SOLVED_FACELETS);
        assert_eq!(event.state.cp.iter().map(|&v| v as u32).sum::<u32>(), 28);
        assert_eq!(event.state.ep.iter().map(|&v| v as u32).sum::<u32>(), 66);
        assert_eq!(d.state.last_serial, Some(17));
    }

    #[test]
    fn test_wrapped_timer_on_first_move_counts_from_arming() {
        let mut d = driver();
        d.decode(&solved_facelets_frame(4), 1_700_000_000_000).unwrap();

        let events = d
            .decode(&move_frame(5, &[(0, 0, 0)]), 1_700_000_000_250)
            .unwrap();
        let CubeEvent::Move(m) = &events[0] else {
            panic!("expected move, got {events:?}");
        };
        assert_eq!(m.cube_timestamp, 250);
    }

    #[test]
    fn test_serial_jump_of_three_recovers_three_moves() {
        let mut d = driver();
        d.decode(&solved_facelets_frame(10), 1000).unwrap();

        // Newest first: R at serial 13, U' at 12, F at 11.
        let frame = move_frame(13, &[(1, 0, 50), (0, 1, 40), (2, 0, 30)]);
        let events = d.decode(&frame, 2000).unwrap();
        assert_eq!(events.len(), 3);

        let moves: Vec<_> = events
            .iter()
            .map(|e| match e {
                CubeEvent::Move(m) => m.clone(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(
            moves.iter().map(|m| m.serial).collect::<Vec<_>>(),
            vec![11, 12, 13]
        );
        assert_eq!(
            moves.iter().map(|m| m.notation.as_str()).collect::<Vec<_>>(),
            vec!["F", "U'", "R"]
        );
        assert_eq!(moves[1].direction, Direction::CounterClockwise);
        assert_eq!(moves[0].local_timestamp, None);
        assert_eq!(moves[1].local_timestamp, None);
        assert_eq!(moves[2].local_timestamp, Some(2000));
        assert_eq!(
            moves.iter().map(|m| m.cube_timestamp).collect::<Vec<_>>(),
            vec![30, 70, 120]
        );
        assert_eq!(d.state.last_serial, Some(13));
    }

    #[test]
    fn test_recovery_capped_at_seven() {
        let mut d = driver();
        d.decode(&solved_facelets_frame(250), 0).unwrap();
        // 250 -> 10 wraps to a gap of 16.
        let moves: Vec<_> = (0..7).map(|_| (3, 0, 10)).collect();
        let events = d.decode(&move_frame(10, &moves), 500).unwrap();
        assert_eq!(events.len(), 7);
        let CubeEvent::Move(first) = &events[0] else {
            panic!()
        };
        assert_eq!(first.serial, 4);
    }

    #[test]
    fn test_zero_elapsed_uses_host_gap() {
        let mut d = driver();
        d.decode(&solved_facelets_frame(0), 0).unwrap();
        d.decode(&move_frame(1, &[(0, 0, 100)]), 1000).unwrap();
        let events = d.decode(&move_frame(2, &[(0, 0, 0)]), 1750).unwrap();
        let CubeEvent::Move(m) = &events[0] else {
            panic!()
        };
        assert_eq!(m.cube_timestamp, 100 + 750);
    }

    #[test]
    fn test_battery_clamped_to_100() {
        let mut d = driver();
        let mut w = BitWriter::new(20);
        w.put(0, 4, EVENT_BATTERY).put(8, 8, 150);
        let events = d.decode(&w.bytes, 5).unwrap();
        assert!(matches!(
            events.as_slice(),
            [CubeEvent::Battery(b)] if b.percent == 100
        ));
    }

    #[test]
    fn test_hardware_decodes_name_and_versions() {
        let mut d = driver();
        let mut w = BitWriter::new(20);
        w.put(0, 4, EVENT_HARDWARE)
            .put(8, 8, 1)
            .put(16, 8, 2)
            .put(24, 8, 3)
            .put(32, 8, 4)
            .put(104, 1, 1);
        for (i, b) in b"GAN356i".iter().enumerate() {
            w.put(40 + 8 * i, 8, *b as u32);
        }
        let events = d.decode(&w.bytes, 5).unwrap();
        let CubeEvent::Hardware(hw) = &events[0] else {
            panic!()
        };
        assert_eq!(hw.name, "GAN356i");
        assert_eq!(hw.hardware_version, "1.2");
        assert_eq!(hw.software_version, "3.4");
        assert!(hw.gyro_supported);
    }

    #[test]
    fn test_malformed_hardware_name_is_error() {
        let mut d = driver();
        let mut w = BitWriter::new(20);
        w.put(0, 4, EVENT_HARDWARE).put(40, 8, 0xC3);
        assert!(matches!(
            d.decode(&w.bytes, 5),
            Err(ProtocolError::MalformedField { .. })
        ));
    }

    #[test]
    fn test_gyro_rate_limited() {
        let mut d = driver();
        let mut w = BitWriter::new(20);
        w.put(0, 4, EVENT_GYRO).put(4, 16, 0x7FFF);
        assert_eq!(d.decode(&w.bytes, 1000).unwrap().len(), 1);
        assert!(d.decode(&w.bytes, 1004).unwrap().is_empty());
        let events = d.decode(&w.bytes, 1020).unwrap();
        let CubeEvent::Orientation(o) = &events[0] else {
            panic!()
        };
        assert!((o.quaternion.w - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_short_and_unknown_frames() {
        let mut d = driver();
        assert!(matches!(
            d.decode(&[0u8; 19], 0),
            Err(ProtocolError::PayloadTooShort { len: 19, min: 20 })
        ));
        let mut w = BitWriter::new(20);
        w.put(0, 4, 0x0E);
        assert!(d.decode(&w.bytes, 0).unwrap().is_empty());
    }

    #[test]
    fn test_disconnect_event() {
        let mut d = driver();
        let mut w = BitWriter::new(20);
        w.put(0, 4, EVENT_DISCONNECT);
        assert_eq!(
            d.decode(&w.bytes, 42).unwrap(),
            vec![CubeEvent::Disconnect { timestamp: 42 }]
        );
    }

    #[test]
    fn test_encode_commands() {
        let d = driver();
        let facelets = d.encode(CubeCommand::RequestFacelets).unwrap();
        assert_eq!(facelets.len(), 20);
        assert_eq!(facelets[0], 0x04);
        assert!(facelets[1..].iter().all(|&b| b == 0));

        let reset = d.encode(CubeCommand::RequestReset).unwrap();
        assert_eq!(
            &reset[..12],
            &[0x0A, 0x05, 0x39, 0x77, 0x00, 0x00, 0x01, 0x23, 0x45, 0x67, 0x89, 0xAB]
        );
    }
}
