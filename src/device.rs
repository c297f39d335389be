//! Per-device decode pipeline: sniffer → driver auto-selection →
//! `DeviceSnapshot` mutation, plus the error model of §4.4.
//!
//! A [`DeviceState`] owns everything the spec says is "written only by
//! the main loop": its `Sniffer`, its auto-selected `Driver`, and its
//! `DeviceSnapshot`. The engine hands it raw bytes (or, for NMEA2000,
//! raw CAN frames) and gets back the `ChangeSet` that fired, which it
//! then fans out to subscribers (§4.4's merge step is the caller's
//! responsibility, same as §4.2 point 6 for a single driver decode).

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;

use crate::context::Context;
use crate::driver::nmea::NmeaDriver;
use crate::driver::nmea2000::Nmea2000Driver;
use crate::driver::sirf::SirfDriver;
use crate::driver::superstar2::SuperStar2Driver;
use crate::driver::zodiac::ZodiacDriver;
use crate::driver::{Driver, ParseOutput};
use crate::fix::{ChangeSet, DeviceSnapshot, PacketType, Status};
use crate::n2k::CanFrame;
use crate::packet::{FrameKind, Sniffer};
use crate::pps::DriftStore;

/// Per-driver UERE (user equivalent range error, meters) used to turn a
/// DOP into a 1-sigma position uncertainty when the driver itself
/// didn't supply one (§4.4's error model).
fn uere_for(packet_type: Option<PacketType>, dgps: bool) -> f64 {
    let base = match packet_type {
        Some(PacketType::Sirf) => 6.5,
        Some(PacketType::Zodiac) => 7.5,
        Some(PacketType::SuperStar2) => 4.0,
        Some(PacketType::Nmea2000) => 3.0,
        _ => 8.0, // plain NMEA gives no error model fields of its own
    };
    if dgps {
        base / 3.0
    } else {
        base
    }
}

pub struct DeviceState {
    pub snapshot: DeviceSnapshot,
    sniffer: Sniffer,
    driver: Option<Box<dyn Driver + Send>>,
    n2k: Nmea2000Driver,
    last_reported_second: Option<i64>,
    /// Published to the PPS thread for this device so it can tie an
    /// edge to "one second after the last NMEA/driver-reported second"
    /// (§4.6 point 4). `None` until the first TIME change-set arrives.
    pub last_fixtime: Arc<Mutex<Option<f64>>>,
    pub pps: Option<Arc<DriftStore>>,
}

impl DeviceState {
    pub fn new(path: impl Into<String>) -> Self {
        DeviceState {
            snapshot: DeviceSnapshot::new(path),
            sniffer: Sniffer::new(),
            driver: None,
            n2k: Nmea2000Driver::new(),
            last_reported_second: None,
            last_fixtime: Arc::new(Mutex::new(None)),
            pps: None,
        }
    }

    /// Force the NMEA2000 driver and bypass the byte sniffer — NMEA2000
    /// "may call sniffer or bypass it" per §4.2's `get-packet` contract,
    /// and in practice always bypasses it since its framing comes from
    /// the CAN transport, not from a byte stream.
    pub fn as_nmea2000(mut self) -> Self {
        self.snapshot.packet_type = Some(PacketType::Nmea2000);
        self.driver = Some(Box::new(Nmea2000Driver::new()));
        self
    }

    /// Force a SuperStarII driver. Unlike NMEA/SiRF/Zodiac, SuperStarII
    /// isn't one of the byte-sniffer's five recognized formats (§4.1) —
    /// real gpsd selects it via `probe-detect`'s trigger string once the
    /// device is opened at a candidate baud rate. This crate doesn't
    /// implement device probing (out of scope, §1's "concrete byte I/O"),
    /// so a SuperStarII device must be named explicitly by the caller.
    pub fn as_superstar2(mut self) -> Self {
        self.snapshot.packet_type = Some(PacketType::SuperStar2);
        self.driver = Some(Box::new(SuperStar2Driver));
        self
    }

    /// Feed freshly-read bytes through the sniffer, decoding every frame
    /// recognized along the way. Returns the OR of every change-set
    /// produced (the caller merges each affected subscriber once per
    /// batch, not once per frame — matching §5's "DeviceSnapshot
    /// mutations are totally ordered" without over-notifying watchers).
    pub fn ingest_bytes(&mut self, bytes: &[u8], ctx: &Context) -> ChangeSet {
        let frames = self.sniffer.feed(bytes);
        let mut total = ChangeSet::NONE;
        for frame in frames {
            // Vendor wakeup strings (ASTRAL/EARTHA) carry no PVT payload
            // of their own — recognized and framed by the sniffer, but
            // never handed to a decoder and never a basis for driver
            // auto-selection (§4.1's table gives them no decode column).
            if matches!(frame.kind, FrameKind::Astral | FrameKind::Eartha) {
                debug!("{}: vendor wakeup string recognized ({:?})", self.snapshot.path, frame.kind);
                continue;
            }
            if self.driver.is_none() {
                self.driver = Some(match frame.kind {
                    FrameKind::Nmea => Box::new(NmeaDriver) as Box<dyn Driver + Send>,
                    FrameKind::Sirf => Box::new(SirfDriver),
                    FrameKind::Zodiac => Box::new(ZodiacDriver),
                    FrameKind::Astral | FrameKind::Eartha => unreachable!("handled above"),
                });
                self.snapshot.packet_type = Some(match frame.kind {
                    FrameKind::Nmea => PacketType::Nmea,
                    FrameKind::Sirf => PacketType::Sirf,
                    FrameKind::Zodiac => PacketType::Zodiac,
                    FrameKind::Astral | FrameKind::Eartha => unreachable!("handled above"),
                });
                debug!("{}: driver auto-selected as {:?}", self.snapshot.path, self.snapshot.packet_type);
            }
            let Some(driver) = self.driver.as_mut() else { continue };
            let out = driver.parse_packet(&frame.bytes, ctx);
            total |= self.apply(out, ctx);
        }
        total
    }

    /// Feed one raw NMEA2000 CAN frame (bypasses the byte sniffer).
    pub fn ingest_can_frame(&mut self, frame: &CanFrame, ctx: &Context) -> ChangeSet {
        match self.n2k.feed_frame(frame) {
            Some(out) => self.apply(out, ctx),
            None => ChangeSet::NONE,
        }
    }

    fn apply(&mut self, out: ParseOutput, ctx: &Context) -> ChangeSet {
        let mut changes = out.changes;

        if changes.contains(ChangeSet::TIME) {
            if let Some(t) = out.fix.time {
                let new_second = t as i64;
                if self.last_reported_second.is_some_and(|prev| prev != new_second) {
                    changes.insert(ChangeSet::CYCLE_START);
                }
                self.last_reported_second = Some(new_second);
                *self.last_fixtime.lock().unwrap() = Some(t);
                self.snapshot.sentence_time = Some(t);
            }
        }

        let previous = self.snapshot.fix;
        self.snapshot.fix.merge(&out.fix, changes);

        if changes.contains(ChangeSet::DOP) {
            if let Some(v) = out.hdop {
                self.snapshot.dops.hdop = Some(v);
            }
            if let Some(v) = out.vdop {
                self.snapshot.dops.vdop = Some(v);
            }
            if let Some(v) = out.pdop {
                self.snapshot.dops.pdop = Some(v);
            }
            if let Some(v) = out.tdop {
                self.snapshot.dops.tdop = Some(v);
            }
        }
        if changes.contains(ChangeSet::SATELLITE) && !out.satellites.is_empty() {
            if out.satellites.len() > crate::fix::SatelliteTable::DEFAULT_CHANNELS {
                debug!(
                    "{}: satellite table grew past the {}-channel design default ({})",
                    self.snapshot.path,
                    crate::fix::SatelliteTable::DEFAULT_CHANNELS,
                    out.satellites.len()
                );
            }
            self.snapshot.satellites.0 = out.satellites;
        }
        if let Some(status) = out.status {
            self.snapshot.status = status;
            self.snapshot.fix.mode = match (self.snapshot.fix.mode, status) {
                (crate::fix::Mode::Unseen, Status::NoFix) => crate::fix::Mode::NoFix,
                (m, _) => m,
            };
            changes.insert(ChangeSet::STATUS);
        }
        if !out.tag.is_empty() {
            self.snapshot.tag = out.tag;
        }
        self.snapshot.online = true;
        self.snapshot.receive_time = Some(now_unix());
        self.snapshot.decode_time = Some(now_unix());

        if matches!(self.snapshot.status, Status::Fix2D | Status::DgpsFix) {
            ctx.note_fix();
        }

        self.run_error_model(&previous, changes);
        changes
    }

    /// Derive missing 1-sigma uncertainties from DOP×UERE and from a
    /// position-delta/time-delta speed estimate, exactly as §4.4
    /// describes. Never overwrites a value a driver already supplied.
    fn run_error_model(&mut self, previous: &crate::fix::Fix, changes: ChangeSet) {
        let dgps = matches!(self.snapshot.status, Status::DgpsFix);
        let uere = uere_for(self.snapshot.packet_type, dgps);

        if self.snapshot.fix.eph.is_none() {
            if let Some(hdop) = self.snapshot.dops.hdop {
                self.snapshot.fix.eph = Some(hdop * uere);
            }
        }
        if self.snapshot.fix.epv.is_none() {
            if let Some(vdop) = self.snapshot.dops.vdop {
                self.snapshot.fix.epv = Some(vdop * uere);
            }
        }

        if self.snapshot.fix.eps.is_none() && changes.contains(ChangeSet::LATLON) {
            if let (Some(lat0), Some(lon0), Some(t0), Some(lat1), Some(lon1), Some(t1)) = (
                previous.latitude,
                previous.longitude,
                previous.time,
                self.snapshot.fix.latitude,
                self.snapshot.fix.longitude,
                self.snapshot.fix.time,
            ) {
                let dt = t1 - t0;
                if dt > 0.0 {
                    let meters_per_deg_lat = 111_320.0;
                    let meters_per_deg_lon = 111_320.0 * lat1.to_radians().cos();
                    let dy = (lat1 - lat0) * meters_per_deg_lat;
                    let dx = (lon1 - lon0) * meters_per_deg_lon;
                    let dist = (dx * dx + dy * dy).sqrt();
                    self.snapshot.fix.eps = Some(dist / dt);
                }
            }
        }
    }
}

fn now_unix() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_selects_nmea_driver_on_first_frame() {
        let mut dev = DeviceState::new("/dev/ttyUSB0");
        let ctx = Context::new();
        let changes = dev.ingest_bytes(b"$GPVTG,308.74,T,,M,0.00,N,0.0,K*68\r\n", &ctx);
        assert!(changes.contains(ChangeSet::TRACK));
        assert_eq!(dev.snapshot.packet_type, Some(PacketType::Nmea));
        assert_eq!(dev.snapshot.fix.track, Some(308.74));
    }

    #[test]
    fn cycle_start_fires_when_reported_second_changes() {
        let mut dev = DeviceState::new("/dev/ttyUSB0");
        let ctx = Context::new();
        let rmc1 = "$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A\r\n";
        let rmc2 = "$GPRMC,123520,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*69\r\n";
        let c1 = dev.ingest_bytes(rmc1.as_bytes(), &ctx);
        assert!(!c1.contains(ChangeSet::CYCLE_START), "first sentence has nothing to compare against");
        let c2 = dev.ingest_bytes(rmc2.as_bytes(), &ctx);
        assert!(c2.contains(ChangeSet::CYCLE_START));
    }

    #[test]
    fn eph_derived_from_hdop_when_driver_omits_it() {
        let mut dev = DeviceState::new("/dev/ttyUSB0");
        let ctx = Context::new();
        let gga = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,2.0,545.4,M,46.9,M,,*4B\r\n";
        dev.ingest_bytes(gga.as_bytes(), &ctx);
        assert!(dev.snapshot.fix.eph.is_some());
    }

    #[test]
    fn satellite_table_growth_does_not_truncate() {
        let mut dev = DeviceState::new("/dev/ttyUSB0");
        let ctx = Context::new();
        // 14 satellites > the 12-channel design default.
        let mut gsv = String::from("$GPGSV,4,1,14");
        for prn in 1..=14u16 {
            gsv.push_str(&format!(",{prn},45,090,40"));
        }
        gsv.push_str("\r\n");
        dev.ingest_bytes(gsv.as_bytes(), &ctx);
        assert_eq!(dev.snapshot.satellites.0.len(), 14);
    }

    /// End to end: a PGN 129029 fast-packet split across seven CAN
    /// frames reassembles into a fix, and a subscriber merging that fix
    /// sees it in an `O` phrase reply.
    #[test]
    fn nmea2000_129029_fast_packet_reaches_an_o_phrase() {
        let can_id = (3u32 << 26) | (0x1F805u32 << 8) | 5u32;

        let mut payload = [0u8; 43];
        payload[1..3].copy_from_slice(&20_000u16.to_le_bytes()); // days
        payload[3..7].copy_from_slice(&432_000_000u32.to_le_bytes()); // secs-of-day * 1e4
        payload[7..15].copy_from_slice(&370_000_000_000_000_000i64.to_le_bytes()); // 37.0 deg
        payload[15..23].copy_from_slice(&(-1_220_000_000_000_000_000i64).to_le_bytes()); // -122.0 deg
        payload[23..31].copy_from_slice(&50_000_000i64.to_le_bytes()); // 50.0 m altitude
        payload[31] = 0x20; // status nibble 2 -> dgps fix
        payload[34..36].copy_from_slice(&120u16.to_le_bytes()); // hdop 1.20
        payload[36..38].copy_from_slice(&150u16.to_le_bytes()); // pdop 1.50

        let frames = fast_packet_frames(can_id, &payload);

        let mut dev = DeviceState::new("can0").as_nmea2000();
        let ctx = Context::new();
        let mut changes = ChangeSet::NONE;
        for frame in &frames {
            changes |= dev.ingest_can_frame(frame, &ctx);
        }
        assert!(changes.contains(ChangeSet::LATLON | ChangeSet::ALTITUDE | ChangeSet::STATUS | ChangeSet::DOP));
        assert_eq!(dev.snapshot.fix.latitude, Some(37.0));
        assert_eq!(dev.snapshot.fix.longitude, Some(-122.0));
        assert_eq!(dev.snapshot.fix.altitude, Some(50.0));
        assert_eq!(dev.snapshot.status, Status::DgpsFix);

        let mut sub = crate::session::Subscriber::new(1);
        sub.apply_change(&dev.snapshot.fix, changes);
        let reply = crate::session::command::handle_request("O", &mut sub, Some(&dev.snapshot), &ctx, true);
        assert!(reply.starts_with("GPSD,O="));
        assert!(reply.contains("37.000000000"));
        assert!(reply.contains("-122.000000000"));
    }

    /// Builds the fast-packet CAN frame sequence the reassembler expects:
    /// fragment 0 carries the sequence/length header and 6 payload
    /// bytes, every later fragment carries its index and up to 7 bytes.
    fn fast_packet_frames(can_id: u32, payload: &[u8]) -> Vec<crate::n2k::CanFrame> {
        let mut frames = Vec::new();
        let mut data0 = [0u8; 8];
        data0[0] = 0x00;
        data0[1] = payload.len() as u8;
        let first = &payload[..6.min(payload.len())];
        data0[2..2 + first.len()].copy_from_slice(first);
        frames.push(crate::n2k::CanFrame { can_id, dlc: 8, data: data0 });

        let mut offset = first.len();
        let mut idx = 1u8;
        while offset < payload.len() {
            let mut data = [0u8; 8];
            data[0] = idx;
            let chunk_len = 7.min(payload.len() - offset);
            data[1..1 + chunk_len].copy_from_slice(&payload[offset..offset + chunk_len]);
            frames.push(crate::n2k::CanFrame { can_id, dlc: (1 + chunk_len) as u8, data });
            offset += chunk_len;
            idx = idx.wrapping_add(1);
        }
        frames
    }
}
