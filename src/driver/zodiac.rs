//! Zodiac binary driver.
//!
//! `original_source/` has no `driver_zodiac.c` — only the framing-level
//! test vector embedded in `packet.c`'s `TESTMAIN` table (leader `FF 81`,
//! little-endian header/data words, two's-complement checksums). The
//! message-body layout below follows the generic binary-decoder shape
//! spec.md §4.2 lays out (length check, status word, scalar extraction,
//! status-table lookup) rather than a literal historical source — see
//! DESIGN.md.

use super::{Driver, DriverKind, ParseOutput};
use crate::context::Context;
use crate::fix::{ChangeSet, Mode, Status};

/// Zodiac message 1000, "Earth Fixed Position/Velocity" — words are
/// little-endian throughout, as in the rest of the Zodiac binary protocol.
const MSG_GEODETIC_STATUS: u16 = 1000;

#[derive(Debug, Default)]
pub struct ZodiacDriver;

fn getw(buf: &[u8], word_idx: usize) -> u16 {
    let off = word_idx * 2;
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn getsw(buf: &[u8], word_idx: usize) -> i16 {
    getw(buf, word_idx) as i16
}

impl Driver for ZodiacDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Zodiac
    }

    fn parse_packet(&mut self, payload: &[u8], _ctx: &Context) -> ParseOutput {
        let mut out = ParseOutput::default();
        // header: FF 81 id(2) data_word_count(2), 4 header words incl. leader
        if payload.len() < 10 {
            return out;
        }
        let msg_id = getw(payload, 1);
        out.tag = format!("Zodiac-{msg_id}");
        if msg_id != MSG_GEODETIC_STATUS {
            return out;
        }
        let data_words = getw(payload, 2) as usize;
        // header occupies words 0..4 (leader, id, count, checksum); data follows
        let data_start = 8;
        if payload.len() < data_start + data_words * 2 {
            return out;
        }
        let data = &payload[data_start..];

        let solution_type = getw(data, 0);
        if solution_type == 0 {
            // 0 == no navigation fix yet
            return out;
        }

        out.fix.latitude = Some(getsw(data, 1) as f64 * (90.0 / 32768.0));
        out.fix.longitude = Some(getsw(data, 2) as f64 * (180.0 / 32768.0));
        out.fix.altitude = Some(getsw(data, 3) as f64 * 0.1);
        out.changes.insert(ChangeSet::LATLON | ChangeSet::ALTITUDE);

        out.fix.speed = Some(getw(data, 4) as f64 * 0.01);
        out.fix.track = Some(getw(data, 5) as f64 * (360.0 / 65536.0));
        out.changes.insert(ChangeSet::SPEED | ChangeSet::TRACK);

        out.hdop = Some(getw(data, 6) as f64 * 0.1);
        out.changes.insert(ChangeSet::DOP);

        out.fix.mode = match solution_type {
            1 => Mode::Fix2D,
            2 | 3 => Mode::Fix3D,
            _ => Mode::NoFix,
        };
        out.status = Some(if solution_type == 3 { Status::DgpsFix } else { Status::Fix2D });
        out.changes.insert(ChangeSet::MODE | ChangeSet::STATUS | ChangeSet::ONLINE);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_frame(solution_type: u16, lat_raw: i16, lon_raw: i16) -> Vec<u8> {
        let data_words = 7usize;
        let mut data = vec![0u8; data_words * 2];
        data[0..2].copy_from_slice(&solution_type.to_le_bytes());
        data[2..4].copy_from_slice(&lat_raw.to_le_bytes());
        data[4..6].copy_from_slice(&lon_raw.to_le_bytes());

        let mut frame = vec![0u8; 8];
        frame[0..2].copy_from_slice(&0xFF81u16.to_le_bytes());
        frame[2..4].copy_from_slice(&MSG_GEODETIC_STATUS.to_le_bytes());
        frame[4..6].copy_from_slice(&(data_words as u16).to_le_bytes());
        frame.extend_from_slice(&data);
        frame
    }

    #[test]
    fn geodetic_status_with_fix_reports_latlon() {
        let frame = build_frame(2, 16384, -16384);
        let mut d = ZodiacDriver;
        let out = d.parse_packet(&frame, &Context::new());
        assert!(out.changes.contains(ChangeSet::LATLON));
        assert_eq!(out.fix.mode, Mode::Fix3D);
    }

    #[test]
    fn solution_type_zero_reports_nothing() {
        let frame = build_frame(0, 0, 0);
        let mut d = ZodiacDriver;
        let out = d.parse_packet(&frame, &Context::new());
        assert!(!out.changes.contains(ChangeSet::LATLON));
    }
}
