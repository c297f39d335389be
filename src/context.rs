//! Process-wide state shared by every device and driver: leap seconds,
//! the century base used to expand two-digit years, the DGPS relay
//! socket, and the fix counter that gates auto-DGPS peer selection.
//!
//! Grounded on `original_source/send_nmea.c`'s HELO-handshake /
//! `fixcnt`-triggered auto-dgps pattern and `gps.h`'s `gps_context_t`.

use std::sync::Mutex;

/// GPS epoch offset, used when a driver only gives week+time-of-week.
pub const GPS_EPOCH_UNIX: i64 = 315_964_800;

#[derive(Debug, Default)]
pub struct DgpsRelay {
    /// Pending RTCM byte buffer awaiting forward to the receiver.
    pub pending: Vec<u8>,
    /// Set once the HELO handshake with the DGPS/NTRIP peer completes.
    pub connected: bool,
}

/// Process-wide context: lives for the life of the daemon, built once
/// in `main` and shared (read-mostly) with every device and driver.
pub struct Context {
    pub leap_seconds: Mutex<i32>,
    pub century_base: Mutex<i32>,
    pub dgps: Mutex<DgpsRelay>,
    /// Counts fixes produced since the last DGPS peer switch; used to
    /// decide when a stale correction source should be dropped in favor
    /// of a fresh one (mirrors `send_nmea.c`'s auto-dgps trigger).
    pub fix_count: Mutex<u64>,
}

impl Default for Context {
    fn default() -> Self {
        Context {
            leap_seconds: Mutex::new(15), // 2026-era default; refreshed from subframe data
            century_base: Mutex::new(2000),
            dgps: Mutex::new(DgpsRelay::default()),
            fix_count: Mutex::new(0),
        }
    }
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn leap_seconds(&self) -> i32 {
        *self.leap_seconds.lock().unwrap()
    }

    pub fn set_leap_seconds(&self, value: i32) {
        *self.leap_seconds.lock().unwrap() = value;
    }

    /// Expand a driver's raw two-digit year using the current century base.
    pub fn expand_year(&self, two_digit: i32) -> i32 {
        *self.century_base.lock().unwrap() + two_digit
    }

    pub fn note_fix(&self) {
        *self.fix_count.lock().unwrap() += 1;
    }

    pub fn fix_count(&self) -> u64 {
        *self.fix_count.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_year_uses_century_base() {
        let ctx = Context::new();
        assert_eq!(ctx.expand_year(26), 2026);
    }

    #[test]
    fn fix_count_increments() {
        let ctx = Context::new();
        ctx.note_fix();
        ctx.note_fix();
        assert_eq!(ctx.fix_count(), 2);
    }
}
