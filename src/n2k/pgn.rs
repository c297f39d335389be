//! PGN (Parameter Group Number) decode table.
//!
//! The arrays of `{pgn, fast, type, handler, name}` are pure data (§9);
//! loaded here as a static slice and looked up by linear scan, exactly
//! as `search_pgnlist` does in `original_source/driver_nmea2000.c` —
//! at most ~14 entries per list, so an O(n) scan beats a hash table.

use crate::bits::{getlesw, getleul, getleuw};
use crate::fix::ChangeSet;

/// One decoded PGN's result: which fields moved, plus the scalar values
/// a handler extracted (the session/engine layer merges these into the
/// device snapshot — handlers here are pure functions of bytes).
#[derive(Debug, Clone, Default)]
pub struct PgnOutput {
    pub changes: ChangeSet,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
    pub speed: Option<f64>,
    pub track: Option<f64>,
    pub time: Option<f64>,
    pub hdop: Option<f64>,
    pub vdop: Option<f64>,
    pub pdop: Option<f64>,
    pub tdop: Option<f64>,
    pub mode_raw: Option<u8>,
    pub status_raw: Option<u8>,
    pub satellites: Vec<crate::fix::Satellite>,
    pub tag: &'static str,
}

pub type PgnHandler = fn(&[u8]) -> PgnOutput;

#[derive(Clone, Copy)]
pub struct PgnEntry {
    pub pgn: u32,
    /// Whether this PGN's payload needs fast-packet reassembly (>8 bytes).
    pub fast: bool,
    /// 0 = ISO housekeeping, 1 = GPS, 2 = AIS — used only to pick which
    /// sticky table a freshly-seen PGN should bind future lookups to.
    pub class: u8,
    pub handler: PgnHandler,
    pub name: &'static str,
}

fn getles32(buf: &[u8], off: usize) -> i64 {
    getleul(buf, off) as i32 as i64
}

fn getles64(buf: &[u8], off: usize) -> i64 {
    let lo = getleul(buf, off) as u64;
    let hi = getleul(buf, off + 4) as u64;
    ((hi << 32) | lo) as i64
}

/// Degrees, GNSS Position Rapid Update (no fast-packet reassembly).
fn hnd_129025(bu: &[u8]) -> PgnOutput {
    let mut out = PgnOutput {
        tag: "129025",
        ..Default::default()
    };
    if bu.len() < 8 {
        return out;
    }
    out.latitude = Some(getles32(bu, 0) as f64 * 1e-7);
    out.longitude = Some(getles32(bu, 4) as f64 * 1e-7);
    out.changes.insert(ChangeSet::LATLON);
    out
}

/// GNSS COG and SOG Rapid Update.
fn hnd_129026(bu: &[u8]) -> PgnOutput {
    let mut out = PgnOutput {
        tag: "129026",
        ..Default::default()
    };
    if bu.len() < 6 {
        return out;
    }
    // raw value is radians * 1e4
    out.track = Some(getleuw(bu, 2) as f64 * 1e-4 * (180.0 / std::f64::consts::PI));
    out.speed = Some(getleuw(bu, 4) as f64 * 1e-2);
    out.changes.insert(ChangeSet::SPEED | ChangeSet::TRACK);
    out
}

/// GNSS System Time.
fn hnd_126992(bu: &[u8]) -> PgnOutput {
    let mut out = PgnOutput {
        tag: "126992",
        ..Default::default()
    };
    if bu.len() < 8 {
        return out;
    }
    let days = getleuw(bu, 2) as f64;
    let secs_of_day = getleul(bu, 4) as f64 / 1e4;
    out.time = Some(days * 86400.0 + secs_of_day);
    out.changes.insert(ChangeSet::TIME);
    out
}

const MODE_TAB: [u8; 8] = [1, 2, 3, 1, 1, 1, 1, 1]; // no-fix,2D,3D,no-fix...

/// GNSS DOPs.
fn hnd_129539(bu: &[u8]) -> PgnOutput {
    let mut out = PgnOutput {
        tag: "129539",
        ..Default::default()
    };
    if bu.len() < 8 {
        return out;
    }
    out.mode_raw = Some(MODE_TAB[((bu[1] >> 3) & 0x07) as usize]);
    out.hdop = Some(getleuw(bu, 2) as f64 * 1e-2);
    out.vdop = Some(getleuw(bu, 4) as f64 * 1e-2);
    out.tdop = Some(getleuw(bu, 6) as f64 * 1e-2);
    out.changes.insert(ChangeSet::DOP | ChangeSet::MODE);
    out
}

/// GNSS Satellites in View — fast-packet. Per the spec's Open Question,
/// the buffer must be at least `3 + 12*satellites_visible + 11` bytes;
/// verified before indexing rather than trusting the declared count.
fn hnd_129540(bu: &[u8]) -> PgnOutput {
    let mut out = PgnOutput {
        tag: "129540",
        ..Default::default()
    };
    if bu.len() < 3 {
        return out;
    }
    let visible = bu[2] as usize;
    let needed = 3 + 12 * visible + 11;
    if bu.len() < needed {
        // Truncated/garbled fast-packet reassembly: report nothing rather
        // than index past the verified length.
        return out;
    }
    let mut sats = Vec::with_capacity(visible);
    for i in 0..visible {
        let base = 3 + 12 * i;
        let elev = getlesw(bu, base + 1) as f64 * 1e-4 * (180.0 / std::f64::consts::PI);
        let azi = getleuw(bu, base + 3) as f64 * 1e-4 * (180.0 / std::f64::consts::PI);
        let snr = getlesw(bu, base + 5) as f64 * 1e-2;
        let svt = bu[base + 11] & 0x0f;
        sats.push(crate::fix::Satellite {
            prn: bu[base] as u16,
            elevation: elev.round() as i16,
            azimuth: azi.round() as u16,
            signal_strength: snr as f32,
            used: svt == 2 || svt == 5,
        });
    }
    out.satellites = sats;
    out.changes.insert(ChangeSet::SATELLITE | ChangeSet::USED);
    out
}

/// GNSS Position Data — fast-packet, the richest single PGN.
fn hnd_129029(bu: &[u8]) -> PgnOutput {
    let mut out = PgnOutput {
        tag: "129029",
        ..Default::default()
    };
    if bu.len() < 43 {
        return out;
    }
    let days = getleuw(bu, 1) as f64;
    let secs_of_day = getleul(bu, 3) as f64 / 1e4;
    out.time = Some(days * 86400.0 + secs_of_day);
    out.changes.insert(ChangeSet::TIME);

    out.latitude = Some(getles64(bu, 7) as f64 * 1e-16);
    out.longitude = Some(getles64(bu, 15) as f64 * 1e-16);
    out.changes.insert(ChangeSet::LATLON);

    let mut altitude = getles64(bu, 23) as f64 * 1e-6;
    let separation = getles32(bu, 38) as f64 / 100.0;
    altitude -= separation;
    out.altitude = Some(altitude);
    out.changes.insert(ChangeSet::ALTITUDE);

    // status derived from (bu[31]>>4)&0x0f: 0 no-fix,1 fix,2 dgps,3..5 fix.
    let status = match (bu[31] >> 4) & 0x0f {
        0 => 0u8,
        1 => 1,
        2 => 2,
        3..=5 => 1,
        _ => 0,
    };
    out.status_raw = Some(status);
    out.changes.insert(ChangeSet::STATUS);

    out.hdop = Some(getleuw(bu, 34) as f64 * 0.01);
    out.pdop = Some(getleuw(bu, 36) as f64 * 0.01);
    out.changes.insert(ChangeSet::DOP);

    out
}

fn hnd_stub(name: &'static str) -> PgnHandler {
    match name {
        "059392" => |_| PgnOutput { tag: "059392", ..Default::default() },
        "060928" => |_| PgnOutput { tag: "060928", ..Default::default() },
        "126208" => |_| PgnOutput { tag: "126208", ..Default::default() },
        "126464" => |_| PgnOutput { tag: "126464", ..Default::default() },
        "126996" => |_| PgnOutput { tag: "126996", ..Default::default() },
        "129038" => |_| PgnOutput { tag: "129038", ..Default::default() },
        "129039" => |_| PgnOutput { tag: "129039", ..Default::default() },
        "129040" => |_| PgnOutput { tag: "129040", ..Default::default() },
        "129794" => |_| PgnOutput { tag: "129794", ..Default::default() },
        "129798" => |_| PgnOutput { tag: "129798", ..Default::default() },
        "129802" => |_| PgnOutput { tag: "129802", ..Default::default() },
        "129809" => |_| PgnOutput { tag: "129809", ..Default::default() },
        "129810" => |_| PgnOutput { tag: "129810", ..Default::default() },
        _ => |_| PgnOutput::default(),
    }
}

/// GPS-family PGN list: ISO housekeeping plus the five GNSS PGNs a
/// position/DOP/satellite receiver actually emits.
pub static GPS_PGN: &[PgnEntry] = &[
    PgnEntry { pgn: 59392, fast: false, class: 0, handler: hnd_059392, name: "ISO Acknowledgment" },
    PgnEntry { pgn: 60928, fast: false, class: 0, handler: hnd_060928, name: "ISO Address Claim" },
    PgnEntry { pgn: 126208, fast: false, class: 0, handler: hnd_126208, name: "NMEA Command/Request/Acknowledge" },
    PgnEntry { pgn: 126464, fast: true, class: 0, handler: hnd_126464, name: "ISO Transmit/Receive PGN List" },
    PgnEntry { pgn: 126992, fast: false, class: 1, handler: hnd_126992, name: "GNSS System Time" },
    PgnEntry { pgn: 126996, fast: true, class: 0, handler: hnd_126996, name: "ISO Product Information" },
    PgnEntry { pgn: 129025, fast: false, class: 1, handler: hnd_129025, name: "GNSS Position Rapid Update" },
    PgnEntry { pgn: 129026, fast: false, class: 1, handler: hnd_129026, name: "GNSS COG and SOG Rapid Update" },
    PgnEntry { pgn: 129029, fast: true, class: 1, handler: hnd_129029, name: "GNSS Position Data" },
    PgnEntry { pgn: 129539, fast: false, class: 1, handler: hnd_129539, name: "GNSS DOPs" },
    PgnEntry { pgn: 129540, fast: true, class: 1, handler: hnd_129540, name: "GNSS Satellites in View" },
];

/// AIS-family PGN list — sticky-selected instead of [`GPS_PGN`] when the
/// first recognized PGN on a unit is an AIS PGN (129038 and up). The
/// handlers are housekeeping-only stubs here: AIS message decoding is
/// out of this daemon's scope (the spec covers GNSS PVT, not AIS targets).
pub static AIS_PGN: &[PgnEntry] = &[
    PgnEntry { pgn: 59392, fast: false, class: 0, handler: hnd_059392, name: "ISO Acknowledgment" },
    PgnEntry { pgn: 60928, fast: false, class: 0, handler: hnd_060928, name: "ISO Address Claim" },
    PgnEntry { pgn: 126208, fast: false, class: 0, handler: hnd_126208, name: "NMEA Command/Request/Acknowledge" },
    PgnEntry { pgn: 126464, fast: true, class: 0, handler: hnd_126464, name: "ISO Transmit/Receive PGN List" },
    PgnEntry { pgn: 126996, fast: true, class: 0, handler: hnd_126996, name: "ISO Product Information" },
    PgnEntry { pgn: 129038, fast: true, class: 2, handler: hnd_stub("129038"), name: "AIS Class A Position Report" },
    PgnEntry { pgn: 129039, fast: true, class: 2, handler: hnd_stub("129039"), name: "AIS Class B Position Report" },
    PgnEntry { pgn: 129040, fast: true, class: 2, handler: hnd_stub("129040"), name: "AIS Class B Extended Position Report" },
    PgnEntry { pgn: 129794, fast: true, class: 2, handler: hnd_stub("129794"), name: "AIS Class A Static and Voyage Related Data" },
    PgnEntry { pgn: 129798, fast: true, class: 2, handler: hnd_stub("129798"), name: "AIS SAR Aircraft Position Report" },
    PgnEntry { pgn: 129802, fast: true, class: 2, handler: hnd_stub("129802"), name: "AIS Safety Related Broadcast Message" },
    PgnEntry { pgn: 129809, fast: true, class: 2, handler: hnd_stub("129809"), name: "AIS Class B CS Static Data Report, Part A" },
    PgnEntry { pgn: 129810, fast: true, class: 2, handler: hnd_stub("129810"), name: "AIS Class B CS Static Data Report, Part B" },
];

fn hnd_059392(_: &[u8]) -> PgnOutput { PgnOutput { tag: "059392", ..Default::default() } }
fn hnd_060928(_: &[u8]) -> PgnOutput { PgnOutput { tag: "060928", ..Default::default() } }
fn hnd_126208(_: &[u8]) -> PgnOutput { PgnOutput { tag: "126208", ..Default::default() } }
fn hnd_126464(_: &[u8]) -> PgnOutput { PgnOutput { tag: "126464", ..Default::default() } }
fn hnd_126996(_: &[u8]) -> PgnOutput { PgnOutput { tag: "126996", ..Default::default() } }

/// Linear scan by PGN number, exactly as `search_pgnlist` does — at most
/// ~14 entries, so the O(n) scan never shows up in a profile.
pub fn search_pgnlist(pgn: u32, list: &[PgnEntry]) -> Option<&PgnEntry> {
    list.iter().find(|e| e.pgn == pgn)
}

/// Maps a handler's raw status code (0 no-fix, 1 fix, 2 dgps-fix) onto
/// the shared `Status` enum.
pub fn status_from_raw(raw: u8) -> crate::fix::Status {
    match raw {
        1 => crate::fix::Status::Fix2D,
        2 => crate::fix::Status::DgpsFix,
        _ => crate::fix::Status::NoFix,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_rapid_update_decodes_latlon() {
        let mut bu = [0u8; 8];
        bu[0..4].copy_from_slice(&(423_000_000i32).to_le_bytes());
        bu[4..8].copy_from_slice(&(-731_000_000i32).to_le_bytes());
        let out = hnd_129025(&bu);
        assert!(out.changes.contains(ChangeSet::LATLON));
        assert!((out.latitude.unwrap() - 42.3).abs() < 1e-9);
        assert!((out.longitude.unwrap() + 73.1).abs() < 1e-9);
    }

    #[test]
    fn satellites_in_view_rejects_short_buffer() {
        let bu = [0u8, 0, 3]; // claims 3 satellites but no payload
        let out = hnd_129540(&bu);
        assert!(out.satellites.is_empty());
        assert!(!out.changes.contains(ChangeSet::SATELLITE));
    }

    #[test]
    fn search_pgnlist_finds_known_entry() {
        let e = search_pgnlist(129029, GPS_PGN).expect("129029 present");
        assert_eq!(e.name, "GNSS Position Data");
    }

    #[test]
    fn search_pgnlist_misses_unknown_pgn() {
        assert!(search_pgnlist(1, GPS_PGN).is_none());
    }
}
