//! Orientation Smoother
//!
//! Turns the cube's noisy gyro quaternion feed into a rate-limited, smoothed
//! orientation stream with a derived angular velocity.

use std::collections::VecDeque;

use nalgebra::{Quaternion, Vector3};

use crate::domain::models::HostMillis;

pub const DEFAULT_BUFFER_SIZE: usize = 5;
pub const DEFAULT_SMOOTHING_WINDOW: usize = 3;
/// Roughly one emission per 60 Hz frame.
pub const DEFAULT_MIN_EMIT_INTERVAL_MS: u64 = 16;

const LINEAR_THRESHOLD: f64 = 0.9995;

pub fn identity() -> Quaternion<f64> {
    Quaternion::new(1.0, 0.0, 0.0, 0.0)
}

/// Unit-length copy of `q`; the zero quaternion maps to identity.
pub fn normalized(q: &Quaternion<f64>) -> Quaternion<f64> {
    let norm = q.norm();
    if norm == 0.0 {
        identity()
    } else {
        q / norm
    }
}

/// Spherical linear interpolation between unit quaternions.
///
/// Takes the shortest path (negating `q2` when the dot product is negative)
/// and falls back to normalized linear interpolation when the inputs are
/// nearly parallel.
pub fn slerp(q1: &Quaternion<f64>, q2: &Quaternion<f64>, t: f64) -> Quaternion<f64> {
    let t = t.clamp(0.0, 1.0);
    let mut q2 = *q2;
    let mut dot = q1.dot(&q2);

    if dot < 0.0 {
        q2 = -q2;
        dot = -dot;
    }

    if dot > LINEAR_THRESHOLD {
        return normalized(&q1.lerp(&q2, t));
    }

    let theta_0 = dot.acos();
    let sin_theta_0 = theta_0.sin();
    let theta = theta_0 * t;

    let s0 = theta.cos() - dot * theta.sin() / sin_theta_0;
    let s1 = theta.sin() / sin_theta_0;
    q1 * s0 + q2 * s1
}

/// Angle in radians of the rotation taking `q1` to `q2`.
pub fn angular_distance(q1: &Quaternion<f64>, q2: &Quaternion<f64>) -> f64 {
    let dot = q1.dot(q2).abs().min(1.0);
    2.0 * dot.acos()
}

/// Roll, pitch, yaw in degrees.
pub fn to_euler_degrees(q: &Quaternion<f64>) -> (f64, f64, f64) {
    let q = normalized(q);
    let (x, y, z, w) = (q.i, q.j, q.k, q.w);

    let roll = (2.0 * (w * x + y * z)).atan2(1.0 - 2.0 * (x * x + y * y));
    let sin_pitch = 2.0 * (w * y - z * x);
    let pitch = if sin_pitch.abs() >= 1.0 {
        std::f64::consts::FRAC_PI_2.copysign(sin_pitch)
    } else {
        sin_pitch.asin()
    };
    let yaw = (2.0 * (w * z + x * y)).atan2(1.0 - 2.0 * (y * y + z * z));

    (roll.to_degrees(), pitch.to_degrees(), yaw.to_degrees())
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Sample {
    quaternion: Quaternion<f64>,
    timestamp: HostMillis,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SmoothedOrientation {
    pub quaternion: Quaternion<f64>,
    /// rad/s, `None` until two samples with distinct timestamps exist.
    pub angular_velocity: Option<Vector3<f64>>,
}

#[derive(Debug, Clone)]
pub struct OrientationSmoother {
    samples: VecDeque<Sample>,
    capacity: usize,
    window: usize,
    min_emit_interval_ms: u64,
    last_emit: Option<HostMillis>,
}

impl Default for OrientationSmoother {
    fn default() -> Self {
        Self::new(
            DEFAULT_BUFFER_SIZE,
            DEFAULT_SMOOTHING_WINDOW,
            DEFAULT_MIN_EMIT_INTERVAL_MS,
        )
    }
}

impl OrientationSmoother {
    pub fn new(capacity: usize, window: usize, min_emit_interval_ms: u64) -> Self {
        let capacity = capacity.max(2);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            window: window.clamp(1, capacity),
            min_emit_interval_ms,
            last_emit: None,
        }
    }

    /// Buffers a sample and returns a smoothed orientation unless the
    /// previous emission was less than the minimum interval ago. `None`
    /// means "unchanged", not an error.
    pub fn push(
        &mut self,
        quaternion: Quaternion<f64>,
        timestamp: HostMillis,
    ) -> Option<SmoothedOrientation> {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(Sample {
            quaternion: normalized(&quaternion),
            timestamp,
        });

        // A host clock that stepped backwards re-bases the limiter.
        if let Some(last) = self.last_emit {
            if timestamp >= last && timestamp - last < self.min_emit_interval_ms {
                return None;
            }
        }

        let quaternion = self.smoothed()?;
        self.last_emit = Some(timestamp);
        Some(SmoothedOrientation {
            quaternion,
            angular_velocity: self.angular_velocity(),
        })
    }

    /// Successive SLERP over the newest samples. Step `i` blends with weight
    /// `2 / (i + 2)`, which gives sample `k` of the window a share
    /// proportional to `k + 1`.
    fn smoothed(&self) -> Option<Quaternion<f64>> {
        let window = self.window.min(self.samples.len());
        let mut recent = self.samples.iter().skip(self.samples.len() - window);

        let mut result = recent.next()?.quaternion;
        for (i, sample) in recent.enumerate() {
            let step = (i + 1) as f64;
            result = slerp(&result, &sample.quaternion, 2.0 / (step + 2.0));
        }
        Some(normalized(&result))
    }

    /// Rotation between the two newest samples divided by their spacing.
    pub fn angular_velocity(&self) -> Option<Vector3<f64>> {
        let len = self.samples.len();
        if len < 2 {
            return None;
        }
        let previous = &self.samples[len - 2];
        let latest = &self.samples[len - 1];

        let elapsed_ms = latest.timestamp.checked_sub(previous.timestamp)?;
        if elapsed_ms == 0 {
            return None;
        }
        let elapsed = elapsed_ms as f64 / 1000.0;

        let mut delta = previous.quaternion.conjugate() * latest.quaternion;
        if delta.w < 0.0 {
            delta = -delta;
        }
        let w = delta.w.clamp(-1.0, 1.0);
        let angle = 2.0 * w.acos();
        let sin_half = (1.0 - w * w).sqrt();
        if sin_half < 1e-9 {
            return Some(Vector3::zeros());
        }

        let axis = delta.vector() / sin_half;
        Some(axis * (angle / elapsed))
    }

    pub fn reset(&mut self) {
        self.samples.clear();
        self.last_emit = None;
    }
}
