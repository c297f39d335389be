//! Subscriber state and the client command protocol (§3, §4.4, §4.5).

pub mod command;

use std::time::Instant;

use crate::fix::Fix;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferingPolicy {
    /// Clear the private fix buffer to all-missing at the start of every
    /// reporting cycle, before merging (§4.4).
    #[default]
    CycleAssociate,
    /// Never clear; each field keeps the last value received for it.
    Independent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataKindFilter {
    #[default]
    Any,
    Gps,
    Rtcm104,
}

/// Raw-mode level requested with the `R` verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RawMode {
    #[default]
    Off,
    Raw,
    SuperRaw,
}

/// One connected client of the line-oriented command protocol.
pub struct Subscriber {
    pub id: u64,
    /// Last time this subscriber sent a command or was pushed data to.
    pub active: Instant,
    pub watcher: bool,
    pub raw_mode: RawMode,
    pub buffering: BufferingPolicy,
    /// Device path this subscriber is pinned to, if any (`F` verb).
    pub device_affinity: Option<String>,
    pub kind_filter: DataKindFilter,
    /// Private fix buffer, built by merging device change-sets per §4.4.
    pub fix: Fix,
    /// Previous fix, kept only to derive `eps` from a position delta
    /// when the driver itself didn't report a speed uncertainty.
    pub old_fix: Fix,
    pub profiling: bool,
}

impl Subscriber {
    pub fn new(id: u64) -> Self {
        Subscriber {
            id,
            active: Instant::now(),
            watcher: false,
            raw_mode: RawMode::Off,
            buffering: BufferingPolicy::CycleAssociate,
            device_affinity: None,
            kind_filter: DataKindFilter::Any,
            fix: Fix::default(),
            old_fix: Fix::default(),
            profiling: false,
        }
    }

    /// Null out this subscriber's device affinity — required whenever
    /// the device it pointed to is deactivated (§3 invariant: no
    /// dangling affinity survives a device close).
    pub fn clear_affinity(&mut self) {
        self.device_affinity = None;
    }

    pub fn touch(&mut self) {
        self.active = Instant::now();
    }

    /// Merge an incoming change into this subscriber's fix buffer,
    /// clearing to all-missing first if a new cycle started and this
    /// subscriber buffers cycle-associate (§4.4).
    pub fn apply_change(&mut self, incoming: &Fix, changes: crate::fix::ChangeSet) {
        if changes.contains(crate::fix::ChangeSet::CYCLE_START)
            && self.buffering == BufferingPolicy::CycleAssociate
        {
            self.old_fix = self.fix;
            self.fix.clear();
        }
        self.fix.merge(incoming, changes);
    }
}

/// Unassigned clients are dropped after this many seconds of inactivity.
pub const UNASSIGNED_TIMEOUT_SECS: u64 = 60;
/// Assigned, non-watching, non-raw clients idle this long before drop.
pub const ASSIGNED_SILENT_TIMEOUT_SECS: u64 = 15 * 60;
/// A watcher/raw client whose writes would block this long is dropped.
pub const BLOCKED_WRITE_TIMEOUT_SECS: u64 = 3 * 60;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_start_with_cycle_associate_clears_buffer_first() {
        let mut sub = Subscriber::new(1);
        sub.fix.altitude = Some(10.0);
        let incoming = Fix {
            latitude: Some(1.0),
            ..Default::default()
        };
        sub.apply_change(&incoming, crate::fix::ChangeSet::CYCLE_START | crate::fix::ChangeSet::LATLON);
        assert!(sub.fix.altitude.is_none(), "old altitude must not survive a cycle boundary");
        assert_eq!(sub.fix.latitude, Some(1.0));
    }

    #[test]
    fn independent_buffering_never_clears() {
        let mut sub = Subscriber::new(1);
        sub.buffering = BufferingPolicy::Independent;
        sub.fix.altitude = Some(10.0);
        let incoming = Fix::default();
        sub.apply_change(&incoming, crate::fix::ChangeSet::CYCLE_START);
        assert_eq!(sub.fix.altitude, Some(10.0));
    }

    #[test]
    fn deactivate_clears_affinity() {
        let mut sub = Subscriber::new(1);
        sub.device_affinity = Some("/dev/ttyS0".into());
        sub.clear_affinity();
        assert!(sub.device_affinity.is_none());
    }
}
