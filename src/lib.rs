//! `gpsd_core`: a GPS/AIS/NMEA2000 location-service daemon core.
//!
//! See SPEC_FULL.md for the full module map. Roughly: [`packet`] frames
//! raw bytes, [`driver`]/[`n2k`] decode a frame into a [`fix::Fix`],
//! [`device`] owns one device's decode pipeline and error model,
//! [`session`] is the client command protocol, [`engine`] wires all of
//! it into a runnable daemon, and [`pps`]/[`ntp_shm`] are the time
//! discipline side channel.

pub mod bits;
pub mod config;
pub mod context;
pub mod control;
pub mod device;
pub mod driver;
pub mod engine;
pub mod error;
pub mod fix;
pub mod n2k;
pub mod ntp_shm;
pub mod packet;
pub mod pps;
pub mod pseudonmea;
pub mod session;

pub use error::{GpsdError, Result};
