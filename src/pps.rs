//! PPS (pulse-per-second) monitor thread and drift store (§4.6).
//!
//! Grounded on `original_source/ppsthread.c`'s `gpsd_ppsmonitor`: the
//! cycle/duration classification thresholds below are transcribed
//! verbatim from its microsecond comparisons. This runs as a real OS
//! thread, not a tokio task — `TIOCMIWAIT` blocks in the kernel and
//! there's at most one of these per device, so a thread pool would buy
//! nothing (§5: "additional threads only for PPS, at most one per device").

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Real/clock timestamp pair for one accepted PPS edge, seconds + nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DriftSample {
    pub real_sec: i64,
    pub real_nsec: i64,
    pub clock_sec: i64,
    pub clock_nsec: i64,
}

/// Microseconds the PPS edge can pull the clock before being rejected as
/// out of range (`PPS_MAX_OFFSET`/`PUT_MAX_OFFSET` in the source, used
/// here as a single sanity bound on the real-vs-clock offset).
const MAX_OFFSET_SECS: i64 = 1_000_000;

/// One modem-control-line read: asserted/cleared state plus the instant
/// it was observed.
#[derive(Debug, Clone, Copy)]
pub struct PpsEdge {
    pub state: bool,
    pub sec: i64,
    pub nsec: i64,
}

/// Abstracts over how an edge is obtained: blocking on `TIOCMIWAIT`
/// (plain PPS, works unprivileged) versus a no-op source used in tests
/// and on platforms/builds with no real tty to wait on.
pub trait PpsSource: Send {
    fn wait_for_edge(&mut self) -> std::io::Result<PpsEdge>;
}

/// Plain PPS via `TIOCMIWAIT` on a serial line's modem-control pins
/// (`TIOCM_CD|TIOCM_CAR|TIOCM_RI|TIOCM_CTS`), as in `ppsthread.c`. Does
/// not require root — unlike kernel PPS (`time_pps_fetch`), which this
/// module does not implement: KPPS needs RFC2783 `/dev/pps*` devices
/// this environment has no driver surface for, and the source's own
/// comment notes it only shaves ~20us of latency over plain PPS.
pub struct TiocmiwaitSource {
    fd: std::os::unix::io::RawFd,
}

impl TiocmiwaitSource {
    pub fn new(fd: std::os::unix::io::RawFd) -> Self {
        TiocmiwaitSource { fd }
    }
}

impl PpsSource for TiocmiwaitSource {
    fn wait_for_edge(&mut self) -> std::io::Result<PpsEdge> {
        const PPS_LINE_TIOC: libc::c_int =
            libc::TIOCM_CD | libc::TIOCM_CAR | libc::TIOCM_RI | libc::TIOCM_CTS;
        let rc = unsafe { libc::ioctl(self.fd, libc::TIOCMIWAIT as _, PPS_LINE_TIOC) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        let mut state: libc::c_int = 0;
        let rc = unsafe { libc::ioctl(self.fd, libc::TIOCMGET as _, &mut state) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(PpsEdge {
            state: state & PPS_LINE_TIOC != 0,
            sec: now.as_secs() as i64,
            nsec: now.subsec_nanos() as i64,
        })
    }
}

/// Used for devices with no working PPS source, or in tests: never
/// produces an edge. The monitor thread built on it simply never calls
/// its report hook.
#[derive(Default)]
pub struct NullPpsSource;

impl PpsSource for NullPpsSource {
    fn wait_for_edge(&mut self) -> std::io::Result<PpsEdge> {
        std::thread::sleep(Duration::from_secs(3600));
        Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "no pps source"))
    }
}

/// Classify one edge transition by cycle/duration (microseconds) into an
/// accept/reject decision, exactly mirroring `ppsthread.c`'s ladder of
/// `cycle`/`duration` comparisons. `state` is the newly observed line
/// state (true = asserted).
pub fn classify_edge(cycle_us: i64, duration_us: i64, state: bool) -> (bool, &'static str) {
    if cycle_us < 199_000 {
        (false, "too short for 5Hz")
    } else if cycle_us < 201_000 {
        if duration_us < 100_000 {
            (true, "5Hz PPS pulse")
        } else {
            (false, "5Hz duration out of range")
        }
    } else if cycle_us < 999_000 {
        (false, "too long for 5Hz, too short for 1Hz")
    } else if cycle_us < 1_001_000 {
        if duration_us == 0 {
            (true, "invisible pulse")
        } else if duration_us < 499_000 {
            (false, "1Hz trailing edge")
        } else if duration_us < 501_000 {
            (state, "square")
        } else {
            (true, "1Hz leading edge")
        }
    } else if cycle_us < 1_999_000 {
        (false, "too long for 1Hz, too short for 2Hz")
    } else if cycle_us < 2_001_000 {
        if duration_us < 999_000 {
            (false, "0.5Hz square too short duration")
        } else if duration_us < 1_001_000 {
            (true, "0.5Hz square wave")
        } else {
            (false, "0.5Hz square too long duration")
        }
    } else {
        (false, "too long for 0.5Hz")
    }
}

/// Shared drift store: the single mutex-guarded last-PPS sample plus a
/// monotone count, read by `pps_thread_lastpps`-equivalent callers under
/// the same lock the monitor thread writes through (§5).
#[derive(Default)]
pub struct DriftStore {
    last: Mutex<DriftSample>,
    count: AtomicU64,
}

impl DriftStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn last(&self) -> DriftSample {
        *self.last.lock().unwrap()
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    fn publish(&self, sample: DriftSample) {
        *self.last.lock().unwrap() = sample;
        self.count.fetch_add(1, Ordering::AcqRel);
    }
}

/// The "time-sync hook" of §4.6 point 5 — called with each accepted
/// drift sample alongside the `DriftStore` publish, so a time-sync peer
/// (the NTP SHM export, `crate::ntp_shm`) can be driven from the same
/// edge without the monitor thread depending on that module directly.
pub type TimeSyncHook = Arc<dyn Fn(DriftSample) + Send + Sync>;

/// Spawns the PPS monitor thread for one device. `last_fixtime` yields
/// the most recent NMEA/driver-reported fix second (as unix time); the
/// pulse is assumed to mark the top of the second *after* that report
/// (§4.6 point 4 — "add exactly 1 second").
pub fn spawn<S: PpsSource + 'static>(
    mut source: S,
    store: Arc<DriftStore>,
    last_fixtime: Arc<Mutex<Option<f64>>>,
    active: Arc<std::sync::atomic::AtomicBool>,
    time_sync_hook: Option<TimeSyncHook>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let mut pulse = [(0i64, 0i64); 2]; // indexed by state: false=0, true=1
        let mut laststate: Option<bool> = None;
        let mut unchanged = 0u32;
        let mut last_second_used: i64 = 0;

        while active.load(Ordering::Acquire) {
            let edge = match source.wait_for_edge() {
                Ok(e) => e,
                Err(_) => break,
            };
            let idx = edge.state as usize;
            let other = 1 - idx;
            let cycle_us = diff_us(edge.sec, edge.nsec, pulse[idx].0, pulse[idx].1);
            let duration_us = diff_us(edge.sec, edge.nsec, pulse[other].0, pulse[other].1);

            if Some(edge.state) == laststate {
                if cycle_us > 999_000 && cycle_us < 1_001_000 {
                    unchanged = 0;
                } else {
                    unchanged += 1;
                    if unchanged == 10 {
                        unchanged = 1;
                        std::thread::sleep(Duration::from_secs(10));
                    }
                }
            } else {
                laststate = Some(edge.state);
                unchanged = 0;
            }
            pulse[idx] = (edge.sec, edge.nsec);
            if unchanged > 0 {
                continue;
            }

            let (ok, _log) = classify_edge(cycle_us, duration_us, edge.state);
            if !ok {
                continue;
            }

            let fixtime = match *last_fixtime.lock().unwrap() {
                Some(t) => t,
                None => continue,
            };
            if (last_second_used as f64) >= fixtime {
                continue; // already handled this second
            }

            let real_sec = fixtime as i64 + 1;
            let offset = (real_sec - edge.sec) as f64 + ((0 - edge.nsec) as f64 / 1e9);
            if !(0.0..=MAX_OFFSET_SECS as f64).contains(&offset) {
                continue;
            }

            last_second_used = fixtime as i64;
            let sample = DriftSample {
                real_sec,
                real_nsec: 0,
                clock_sec: edge.sec,
                clock_nsec: edge.nsec,
            };
            store.publish(sample);
            if let Some(hook) = &time_sync_hook {
                hook(sample);
            }
        }
    })
}

fn diff_us(a_sec: i64, a_nsec: i64, b_sec: i64, b_nsec: i64) -> i64 {
    (a_sec - b_sec) * 1_000_000 + (a_nsec - b_nsec) / 1_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_hz_leading_edge_is_accepted() {
        let (ok, _) = classify_edge(1_000_000, 600_000, true);
        assert!(ok);
    }

    #[test]
    fn one_hz_trailing_edge_is_rejected() {
        let (ok, _) = classify_edge(1_000_000, 300_000, true);
        assert!(!ok);
    }

    #[test]
    fn five_hz_pulse_is_accepted() {
        let (ok, _) = classify_edge(200_000, 50_000, true);
        assert!(ok);
    }

    #[test]
    fn half_hz_square_wave_is_accepted() {
        let (ok, _) = classify_edge(2_000_000, 1_000_000, true);
        assert!(ok);
    }

    #[test]
    fn too_short_for_anything_is_rejected() {
        let (ok, _) = classify_edge(50_000, 0, true);
        assert!(!ok);
    }

    #[test]
    fn duplicate_second_is_suppressed_end_to_end() {
        let store = DriftStore::new();
        assert_eq!(store.count(), 0);
        store.publish(DriftSample {
            real_sec: 1000,
            real_nsec: 0,
            clock_sec: 999,
            clock_nsec: 0,
        });
        assert_eq!(store.count(), 1);
    }

    /// A canned edge sequence, fed to the real monitor loop via
    /// [`spawn`], standing in for `TIOCMIWAIT`.
    struct ScriptedSource {
        edges: std::collections::VecDeque<PpsEdge>,
    }

    impl PpsSource for ScriptedSource {
        fn wait_for_edge(&mut self) -> std::io::Result<PpsEdge> {
            self.edges
                .pop_front()
                .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "script exhausted"))
        }
    }

    /// §4.6 point 4, end to end through the real monitor loop: two 1Hz
    /// leading edges arrive a second apart while the device's reported
    /// fix second never advances, so only the first is published.
    #[test]
    fn monitor_thread_suppresses_a_second_edge_against_the_same_fixtime() {
        let edges = std::collections::VecDeque::from(vec![
            PpsEdge { state: false, sec: 0, nsec: 0 },
            PpsEdge { state: true, sec: 1, nsec: 0 },
            PpsEdge { state: false, sec: 1, nsec: 500_000_000 },
            PpsEdge { state: true, sec: 2, nsec: 0 },
        ]);
        let source = ScriptedSource { edges };
        let store = DriftStore::new();
        let last_fixtime = Arc::new(Mutex::new(Some(100.0)));
        let active = Arc::new(std::sync::atomic::AtomicBool::new(true));

        let handle = spawn(source, Arc::clone(&store), last_fixtime, active, None);
        handle.join().expect("monitor thread must not panic");

        assert_eq!(store.count(), 1, "two edges against one unchanged fixtime must publish exactly once");
        assert_eq!(store.last().real_sec, 101);
    }

    /// The time-sync hook fires exactly once alongside the one accepted
    /// publish in the scenario above — the bridge §4.7's SHM export
    /// relies on to see every drift sample the monitor thread produces.
    #[test]
    fn time_sync_hook_fires_once_per_published_sample() {
        let edges = std::collections::VecDeque::from(vec![
            PpsEdge { state: false, sec: 0, nsec: 0 },
            PpsEdge { state: true, sec: 1, nsec: 0 },
            PpsEdge { state: false, sec: 1, nsec: 500_000_000 },
            PpsEdge { state: true, sec: 2, nsec: 0 },
        ]);
        let source = ScriptedSource { edges };
        let store = DriftStore::new();
        let last_fixtime = Arc::new(Mutex::new(Some(100.0)));
        let active = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let hook_calls = Arc::new(AtomicU64::new(0));
        let hook_calls2 = Arc::clone(&hook_calls);
        let hook: TimeSyncHook = Arc::new(move |_sample| {
            hook_calls2.fetch_add(1, Ordering::AcqRel);
        });

        let handle = spawn(source, store, last_fixtime, active, Some(hook));
        handle.join().expect("monitor thread must not panic");

        assert_eq!(hook_calls.load(Ordering::Acquire), 1);
    }
}
