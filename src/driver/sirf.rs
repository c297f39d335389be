//! SiRF binary driver.
//!
//! SiRF messages are big-endian (the leader/trailer framing SiRF uses is
//! documented in `original_source/packet.c`; the payload layout below
//! follows the published SiRF Binary Protocol ICD's Message ID 41
//! "Geodetic Navigation Data", the message every SiRF-II receiver
//! reports its fix in). Follows the uniform binary-decoder shape from
//! §4.2: check payload length, read a validity/flag field, extract
//! scalars, convert status through a small lookup table.

use super::{Driver, DriverKind, ParseOutput};
use crate::bits::{getbesw, getbeul, getbeuw};
use crate::context::Context;
use crate::fix::{ChangeSet, Mode, Status};

const MSG_GEODETIC_NAVIGATION: u8 = 41;

#[derive(Debug, Default)]
pub struct SirfDriver;

impl Driver for SirfDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Sirf
    }

    fn parse_packet(&mut self, payload: &[u8], _ctx: &Context) -> ParseOutput {
        let mut out = ParseOutput::default();
        // payload here is the whole framed packet: A0 A2 len-hi len-lo <body> cksum-hi cksum-lo B0 B3
        if payload.len() < 8 {
            return out;
        }
        let body = &payload[4..payload.len() - 4];
        if body.is_empty() {
            return out;
        }
        let msg_id = body[0];
        out.tag = format!("SiRF-{msg_id}");
        if msg_id != MSG_GEODETIC_NAVIGATION {
            return out;
        }
        if body.len() != 91 {
            return out;
        }
        let nav_valid = getbeuw(body, 1);
        if nav_valid != 0 {
            // bit 0 clear means a valid fix, per the ICD
            return out;
        }
        let nav_type = getbeuw(body, 3);

        out.fix.latitude = Some(getbeul(body, 23) as i32 as f64 * 1e-7);
        out.fix.longitude = Some(getbeul(body, 27) as i32 as f64 * 1e-7);
        out.fix.altitude = Some(getbeul(body, 35) as i32 as f64 * 1e-2);
        out.changes.insert(ChangeSet::LATLON | ChangeSet::ALTITUDE);

        out.fix.speed = Some(getbeuw(body, 40) as f64 * 1e-2);
        out.fix.track = Some(getbeuw(body, 42) as f64 * 1e-2);
        out.fix.climb = Some(getbesw(body, 46) as f64 * 1e-2);
        out.changes.insert(ChangeSet::SPEED | ChangeSet::TRACK | ChangeSet::CLIMB);

        out.hdop = Some(body[91 - 3] as f64 * 0.2);
        out.changes.insert(ChangeSet::DOP);

        out.fix.mode = match nav_type & 0x07 {
            0 => Mode::NoFix,
            4 | 6 => Mode::Fix2D,
            _ => Mode::Fix3D,
        };
        out.status = Some(if nav_type & 0x80 != 0 {
            Status::DgpsFix
        } else {
            Status::Fix2D
        });
        out.changes.insert(ChangeSet::MODE | ChangeSet::STATUS | ChangeSet::ONLINE);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_frame(nav_valid: u16, nav_type: u16, lat_e7: i32, lon_e7: i32) -> Vec<u8> {
        let mut body = vec![0u8; 91];
        body[0] = MSG_GEODETIC_NAVIGATION;
        body[1..3].copy_from_slice(&nav_valid.to_be_bytes());
        body[3..5].copy_from_slice(&nav_type.to_be_bytes());
        body[23..27].copy_from_slice(&lat_e7.to_be_bytes());
        body[27..31].copy_from_slice(&lon_e7.to_be_bytes());
        let mut frame = vec![0xA0, 0xA2, 0, 0];
        frame.extend_from_slice(&body);
        frame.extend_from_slice(&[0, 0, 0xB0, 0xB3]);
        frame
    }

    #[test]
    fn valid_fix_reports_latlon() {
        let frame = build_frame(0, 2, 423_000_000, -731_000_000);
        let mut d = SirfDriver;
        let out = d.parse_packet(&frame, &Context::new());
        assert!(out.changes.contains(ChangeSet::LATLON));
        assert!((out.fix.latitude.unwrap() - 42.3).abs() < 1e-9);
    }

    #[test]
    fn invalid_nav_flag_reports_nothing() {
        let frame = build_frame(1, 2, 0, 0);
        let mut d = SirfDriver;
        let out = d.parse_packet(&frame, &Context::new());
        assert!(!out.changes.contains(ChangeSet::LATLON));
    }
}
