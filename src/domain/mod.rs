//! Transport-independent cube model: events, cube state, clock and
//! orientation post-processing, settings.

pub mod clock_sync;
pub mod facelets;
pub mod models;
pub mod orientation;
pub mod settings;
