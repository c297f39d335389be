//! The normalized PVT model: `Fix`, `DeviceSnapshot`, and the change-set
//! bitmask drivers use to report which fields moved.
//!
//! Every optional scalar is `Option<f64>`, never NaN-as-sentinel — see
//! DESIGN.md's resolution of the spec's "missing values" design note.

use std::ops::{BitOr, BitOrAssign};

/// Which `DeviceSnapshot`/`Fix` fields a driver's `parse_packet` touched.
///
/// Mirrors the source's `gps_mask_t`: a bounded set of named bits.
/// Consumers must not assume a field absent from the set holds a fresh
/// value — it retains whatever it held before the merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChangeSet(u32);

impl ChangeSet {
    pub const NONE: ChangeSet = ChangeSet(0);
    pub const TIME: ChangeSet = ChangeSet(1 << 0);
    pub const LATLON: ChangeSet = ChangeSet(1 << 1);
    pub const ALTITUDE: ChangeSet = ChangeSet(1 << 2);
    pub const SPEED: ChangeSet = ChangeSet(1 << 3);
    pub const TRACK: ChangeSet = ChangeSet(1 << 4);
    pub const CLIMB: ChangeSet = ChangeSet(1 << 5);
    pub const MODE: ChangeSet = ChangeSet(1 << 6);
    pub const STATUS: ChangeSet = ChangeSet(1 << 7);
    pub const DOP: ChangeSet = ChangeSet(1 << 8);
    pub const SATELLITE: ChangeSet = ChangeSet(1 << 9);
    pub const USED: ChangeSet = ChangeSet(1 << 10);
    pub const ONLINE: ChangeSet = ChangeSet(1 << 11);
    pub const RAW: ChangeSet = ChangeSet(1 << 12);
    pub const RTCM: ChangeSet = ChangeSet(1 << 13);
    pub const CYCLE_START: ChangeSet = ChangeSet(1 << 14);
    pub const DEVICEID: ChangeSet = ChangeSet(1 << 15);
    pub const ERROR: ChangeSet = ChangeSet(1 << 16);

    pub fn contains(self, other: ChangeSet) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether any bit of `other` is set in `self` — used by the engine
    /// to decide whether a batch of changes is "position-shaped" (push
    /// an `o` phrase) versus "satellite-shaped" (push a `y` phrase).
    pub fn intersects(self, other: ChangeSet) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: ChangeSet) {
        self.0 |= other.0;
    }
}

impl BitOr for ChangeSet {
    type Output = ChangeSet;
    fn bitor(self, rhs: ChangeSet) -> ChangeSet {
        ChangeSet(self.0 | rhs.0)
    }
}

impl BitOrAssign for ChangeSet {
    fn bitor_assign(&mut self, rhs: ChangeSet) {
        self.0 |= rhs.0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Unseen,
    NoFix,
    Fix2D,
    Fix3D,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    #[default]
    NoFix,
    Fix2D,
    DgpsFix,
}

/// A position/velocity/time sample. Any scalar may be missing; missing
/// is `None`, distinguishable from a reported `0.0`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Fix {
    pub time: Option<f64>,
    pub mode: Mode,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
    pub speed: Option<f64>,
    pub track: Option<f64>,
    pub climb: Option<f64>,
    /// 1-sigma uncertainties, meters/seconds/degrees as appropriate.
    pub ept: Option<f64>,
    pub eph: Option<f64>,
    pub epv: Option<f64>,
    pub epd: Option<f64>,
    pub eps: Option<f64>,
    pub epc: Option<f64>,
}

impl Fix {
    /// Clear every field to missing — used at cycle boundaries for
    /// cycle-associate subscribers (§4.4).
    pub fn clear(&mut self) {
        *self = Fix::default();
    }

    /// Merge `other` into `self`, copying only the fields named by `changes`.
    pub fn merge(&mut self, other: &Fix, changes: ChangeSet) {
        if changes.contains(ChangeSet::TIME) {
            self.time = other.time;
        }
        if changes.contains(ChangeSet::LATLON) {
            self.latitude = other.latitude;
            self.longitude = other.longitude;
        }
        if changes.contains(ChangeSet::ALTITUDE) {
            self.altitude = other.altitude;
        }
        if changes.contains(ChangeSet::SPEED) {
            self.speed = other.speed;
        }
        if changes.contains(ChangeSet::TRACK) {
            self.track = other.track;
        }
        if changes.contains(ChangeSet::CLIMB) {
            self.climb = other.climb;
        }
        if changes.contains(ChangeSet::MODE) {
            self.mode = other.mode;
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Dops {
    pub pdop: Option<f64>,
    pub hdop: Option<f64>,
    pub vdop: Option<f64>,
    pub tdop: Option<f64>,
    pub gdop: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Satellite {
    pub prn: u16,
    pub elevation: i16,
    pub azimuth: u16,
    pub signal_strength: f32,
    pub used: bool,
}

/// Bounded satellite table. 12 channels is the design default (§3); the
/// table grows past that without silently truncating — growth logs a
/// debug line from the driver, not here.
#[derive(Debug, Clone, Default)]
pub struct SatelliteTable(pub Vec<Satellite>);

impl SatelliteTable {
    pub const DEFAULT_CHANNELS: usize = 12;

    pub fn used_prns(&self) -> impl Iterator<Item = u16> + '_ {
        self.0.iter().filter(|s| s.used).map(|s| s.prn)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Nmea,
    Sirf,
    Zodiac,
    SuperStar2,
    Nmea2000,
    Rtcm,
}

/// A current-device view: last fix, DOPs, satellite table, status, and
/// profiling timestamps.
#[derive(Debug, Clone)]
pub struct DeviceSnapshot {
    pub path: String,
    pub fix: Fix,
    pub dops: Dops,
    pub satellites: SatelliteTable,
    pub status: Status,
    pub packet_type: Option<PacketType>,
    pub baudrate: u32,
    pub parity: char,
    pub stopbits: u8,
    pub tag: String,
    /// Profiling timestamps: transmit, daemon-receive, daemon-decode, per-client-poll.
    pub sentence_time: Option<f64>,
    pub receive_time: Option<f64>,
    pub decode_time: Option<f64>,
    pub poll_time: Option<f64>,
    pub online: bool,
}

impl DeviceSnapshot {
    pub fn new(path: impl Into<String>) -> Self {
        DeviceSnapshot {
            path: path.into(),
            fix: Fix::default(),
            dops: Dops::default(),
            satellites: SatelliteTable::default(),
            status: Status::NoFix,
            packet_type: None,
            baudrate: 4800,
            parity: 'N',
            stopbits: 1,
            tag: String::new(),
            sentence_time: None,
            receive_time: None,
            decode_time: None,
            poll_time: None,
            online: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_set_contains_is_subset_test() {
        let mut cs = ChangeSet::NONE;
        cs.insert(ChangeSet::TIME);
        cs.insert(ChangeSet::LATLON);
        assert!(cs.contains(ChangeSet::TIME));
        assert!(!cs.contains(ChangeSet::ALTITUDE));
        assert!(cs.contains(ChangeSet::TIME | ChangeSet::LATLON));
    }

    #[test]
    fn merge_only_touches_named_fields() {
        let mut buf = Fix {
            altitude: Some(10.0),
            ..Default::default()
        };
        let incoming = Fix {
            latitude: Some(1.0),
            longitude: Some(2.0),
            altitude: Some(999.0),
            ..Default::default()
        };
        buf.merge(&incoming, ChangeSet::LATLON);
        assert_eq!(buf.latitude, Some(1.0));
        assert_eq!(buf.altitude, Some(10.0), "altitude not in change-set, must be untouched");
    }

    #[test]
    fn clear_resets_all_fields_to_missing() {
        let mut f = Fix {
            latitude: Some(1.0),
            ..Default::default()
        };
        f.clear();
        assert!(f.latitude.is_none());
    }
}
