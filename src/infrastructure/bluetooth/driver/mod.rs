//! Protocol Drivers
//!
//! One decoder/encoder per cube generation behind [`CubeDriver`]. A driver
//! is picked once per connection from the discovered service and owns all
//! per-connection decode state: the move serial tracker, the cube clock,
//! the orientation smoother and clock sync.
//!
//! Drivers see plaintext only. Decryption happens in the session before
//! [`CubeDriver::decode`] and encryption after [`CubeDriver::encode`].

mod gen2;
mod gen3;
mod gen4;

pub use gen2::Gen2Driver;
pub use gen3::Gen3Driver;
pub use gen4::Gen4Driver;

use nalgebra::{Quaternion, Vector3};
use tracing::{debug, warn};

use crate::domain::clock_sync::ClockSync;
use crate::domain::facelets::CornerEdgeState;
use crate::domain::models::{
    move_notation, BatteryEvent, CubeCommand, CubeEvent, Direction, Face, FaceletStateEvent,
    Generation, HostMillis, MoveEvent, OrientationEvent,
};
use crate::domain::orientation::OrientationSmoother;
use crate::domain::settings::Settings;
use crate::error::ProtocolError;
use crate::infrastructure::bluetooth::bitfield::BitfieldView;

pub trait CubeDriver: Send {
    fn generation(&self) -> Generation;

    /// Minimum accepted notification length in bytes.
    fn frame_len(&self) -> usize;

    /// Decodes one decrypted notification. Unknown event types decode to an
    /// empty list; malformed fields are errors the caller logs and drops.
    fn decode(
        &mut self,
        payload: &[u8],
        host_now: HostMillis,
    ) -> Result<Vec<CubeEvent>, ProtocolError>;

    /// Plaintext command frame, or `None` if this generation has no
    /// encoding for the command.
    fn encode(&self, command: CubeCommand) -> Option<Vec<u8>>;
}

/// Tuning shared by all drivers, taken from [`Settings`].
#[derive(Debug, Clone, Copy)]
pub struct DriverOptions {
    pub buffer_size: usize,
    pub smoothing_window: usize,
    pub min_emit_interval_ms: u64,
    pub clock_sync_history: usize,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for DriverOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            buffer_size: settings.buffer_size,
            smoothing_window: settings.smoothing_window,
            min_emit_interval_ms: settings.min_emit_interval_ms,
            clock_sync_history: settings.clock_sync_history,
        }
    }
}

pub fn create_driver(generation: Generation, options: DriverOptions) -> Box<dyn CubeDriver> {
    match generation {
        Generation::Gen2 => Box::new(Gen2Driver::new(options)),
        Generation::Gen3 => Box::new(Gen3Driver::new(options)),
        Generation::Gen4 => Box::new(Gen4Driver::new(options)),
    }
}

/// Decode state common to every generation.
#[derive(Debug)]
pub(crate) struct DriverState {
    /// `None` until the first FACELETS snapshot arms the tracker.
    pub last_serial: Option<u16>,
    pub last_move_ts: HostMillis,
    /// Cube clock in milliseconds.
    pub cube_ts: u64,
    pub smoother: OrientationSmoother,
    pub clock: ClockSync,
}

impl DriverState {
    pub fn new(options: DriverOptions) -> Self {
        Self {
            last_serial: None,
            last_move_ts: 0,
            cube_ts: 0,
            smoother: OrientationSmoother::new(
                options.buffer_size,
                options.smoothing_window,
                options.min_emit_interval_ms,
            ),
            clock: ClockSync::new(options.clock_sync_history),
        }
    }

    /// Builds a move event. `observed` marks a move whose host time is a
    /// genuine observation; only those feed clock sync.
    pub fn move_event(
        &mut self,
        serial: u16,
        face: Face,
        direction: Direction,
        cube_ts: u64,
        host_now: HostMillis,
        observed: bool,
    ) -> CubeEvent {
        if observed {
            self.clock.observe(cube_ts as f64, host_now as f64);
        }
        let estimated_host_timestamp = self
            .clock
            .is_calibrated()
            .then(|| self.clock.predict(cube_ts as f64).round().max(0.0) as HostMillis);

        CubeEvent::Move(MoveEvent {
            timestamp: host_now,
            serial,
            face,
            direction,
            notation: move_notation(face, direction),
            local_timestamp: observed.then_some(host_now),
            cube_timestamp: cube_ts,
            estimated_host_timestamp,
        })
    }

    /// Arms the serial tracker on the first snapshot and wraps the state.
    /// Arming also starts the elapsed-time baseline for wrapped move timers.
    pub fn facelet_event(
        &mut self,
        serial: u16,
        state: CornerEdgeState,
        host_now: HostMillis,
    ) -> CubeEvent {
        if self.last_serial.is_none() {
            debug!("Move tracking armed at serial {}", serial);
            self.last_serial = Some(serial);
            self.last_move_ts = host_now;
        }
        CubeEvent::FaceletState(FaceletStateEvent {
            timestamp: host_now,
            serial,
            facelets: state.to_facelets(),
            state,
        })
    }

    /// Runs a gyro sample through the smoother. `None` while rate limited.
    pub fn orientation_event(
        &mut self,
        quaternion: Quaternion<f64>,
        sensor_velocity: Option<Vector3<f64>>,
        host_now: HostMillis,
    ) -> Option<CubeEvent> {
        let smoothed = self.smoother.push(quaternion, host_now)?;
        Some(CubeEvent::Orientation(OrientationEvent {
            timestamp: host_now,
            quaternion: smoothed.quaternion,
            angular_velocity: smoothed.angular_velocity,
            sensor_velocity,
        }))
    }

    /// Single-move serial tracking for Gen3/Gen4. Gaps are reported, not
    /// recovered. Returns `false` if moves are not being tracked yet.
    pub fn track_single_move(&mut self, serial: u16, generation: Generation) -> bool {
        let Some(last) = self.last_serial else {
            debug!("{}: move before first facelets snapshot dropped", generation);
            return false;
        };
        let gap = serial.wrapping_sub(last);
        if gap > 1 {
            warn!(
                "{}: {} move(s) missed between serial {} and {}",
                generation,
                gap - 1,
                last,
                serial
            );
        }
        self.last_serial = Some(serial);
        true
    }
}

pub(crate) fn ensure_len(payload: &[u8], min: usize) -> Result<(), ProtocolError> {
    if payload.len() < min {
        return Err(ProtocolError::PayloadTooShort {
            len: payload.len(),
            min,
        });
    }
    Ok(())
}

/// 16-bit sign-magnitude component scaled to [-1, 1].
pub(crate) fn quaternion_component(raw: u32) -> f64 {
    let sign = 1.0 - ((raw >> 15) & 1) as f64 * 2.0;
    sign * (raw & 0x7FFF) as f64 / 0x7FFF as f64
}

/// Reads `w, x, y, z` components at the given bit offsets.
pub(crate) fn read_quaternion(
    view: &BitfieldView<'_>,
    offsets: [usize; 4],
) -> Result<Quaternion<f64>, ProtocolError> {
    let [w, x, y, z] = offsets;
    Ok(Quaternion::new(
        quaternion_component(view.bits(w, 16)?),
        quaternion_component(view.bits(x, 16)?),
        quaternion_component(view.bits(y, 16)?),
        quaternion_component(view.bits(z, 16)?),
    ))
}

/// Coarse angular velocity: three 4-bit sign-magnitude nibbles.
pub(crate) fn read_sensor_velocity(
    view: &BitfieldView<'_>,
    offsets: [usize; 3],
) -> Result<Vector3<f64>, ProtocolError> {
    let nibble = |offset: usize| -> Result<f64, ProtocolError> {
        let v = view.bits(offset, 4)?;
        Ok((1.0 - ((v >> 3) & 1) as f64 * 2.0) * (v & 0x7) as f64)
    };
    Ok(Vector3::new(
        nibble(offsets[0])?,
        nibble(offsets[1])?,
        nibble(offsets[2])?,
    ))
}

/// Bit offsets of the packed corner/edge fields in a FACELETS frame.
pub(crate) struct FaceletLayout {
    pub cp: usize,
    pub co: usize,
    pub ep: usize,
    pub eo: usize,
}

pub(crate) fn read_corner_edge_state(
    view: &BitfieldView<'_>,
    layout: &FaceletLayout,
) -> Result<CornerEdgeState, ProtocolError> {
    let mut cp = [0u8; 7];
    let mut co = [0u8; 7];
    for i in 0..7 {
        cp[i] = view.bits(layout.cp + i * 3, 3)? as u8;
        co[i] = view.bits(layout.co + i * 2, 2)? as u8;
    }
    let mut ep = [0u8; 11];
    let mut eo = [0u8; 11];
    for i in 0..11 {
        ep[i] = view.bits(layout.ep + i * 4, 4)? as u8;
        eo[i] = view.bits(layout.eo + i, 1)? as u8;
    }
    CornerEdgeState::from_partial(cp, co, ep, eo)
}

/// Fixed-width device name: NUL padding is dropped, anything else outside
/// printable ASCII is rejected.
pub(crate) fn read_ascii_name(
    view: &BitfieldView<'_>,
    offset: usize,
    count: usize,
) -> Result<String, ProtocolError> {
    let mut name = String::with_capacity(count);
    for i in 0..count {
        let byte = view.bits(offset + i * 8, 8)? as u8;
        match byte {
            0 => continue,
            0x20..=0x7E => name.push(byte as char),
            _ => {
                return Err(ProtocolError::MalformedField {
                    field: "hardware name",
                    reason: format!("byte {byte:#04x} at position {i} is not printable ASCII"),
                })
            }
        }
    }
    Ok(name.trim().to_string())
}

pub(crate) fn battery_event(level: u32, host_now: HostMillis) -> CubeEvent {
    CubeEvent::Battery(BatteryEvent {
        timestamp: host_now,
        percent: level.min(100) as u8,
    })
}

/// Gen3/Gen4 encode the turned face as a one-hot mask.
pub(crate) fn face_from_mask(mask: u32) -> Result<Face, ProtocolError> {
    const MASKS: [u32; 6] = [2, 32, 8, 1, 16, 4];
    MASKS
        .iter()
        .position(|&m| m == mask)
        .and_then(|index| Face::from_index(index as u32))
        .ok_or_else(|| ProtocolError::MalformedField {
            field: "face mask",
            reason: format!("{mask:#04x} does not name a face"),
        })
}

pub(crate) fn direction(bits: u32) -> Result<Direction, ProtocolError> {
    Direction::from_bits(bits).ok_or_else(|| ProtocolError::MalformedField {
        field: "direction",
        reason: format!("unknown turn direction {bits}"),
    })
}
