//! Change monitoring for tracked spaces
//!
//! [`ChangeMonitor`] watches each space through the platform's native
//! notification service (via `notify`) and turns qualifying changes into
//! captures. Native payloads are treated as untrusted: every event passes
//! through [`validate_event`] first, and any anomaly permanently switches the
//! session to a polling scanner.
//!
//! ```text
//! Idle ──start──► Native ──anomaly──► Fallback
//!                   │                    │
//!                   └──────stop──────────┴──► Stopped
//! ```
//!
//! ## Threads per session
//!
//! - the `notify` callback thread, which validates and routes native events
//! - a capture worker fed by an unbounded channel; it also performs the
//!   switch to fallback so the watcher is never dropped from its own callback
//! - the fallback scanner, once degraded
//!
//! ## Throttling
//!
//! Captures of one path are suppressed for `throttle_window` after the last
//! accepted capture. The throttle map is pruned of entries older than
//! `throttle_expiry` every `prune_every` inserts, or whenever it grows past
//! `prune_ceiling` entries.

use crate::error::Result;
use crate::space::Space;
use crate::store::VersionStore;
use crate::types::{ChangeKind, EventHandler, MonitorConfig, MonitorEvent, MonitorState};
use dashmap::DashMap;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Weak};
use std::thread;
use std::time::{Instant, SystemTime};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Events carrying more paths than this are rejected
pub const MAX_PATHS_PER_EVENT: usize = 64;

/// Paths longer than this many bytes are rejected
pub const MAX_PATH_BYTES: usize = 4096;

/// Why a native event was rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventAnomaly {
    /// The notification service reported an error
    Error(String),
    /// The service dropped events and asked for a rescan
    Rescan,
    /// Event without any path
    NoPaths,
    /// Path count does not fit the event kind
    PathCount(usize),
    /// Path outside the watched space
    OutsideSpace(PathBuf),
    /// Path longer than [`MAX_PATH_BYTES`]
    PathTooLong(usize),
    /// Path containing a NUL byte
    NulByte,
}

impl fmt::Display for EventAnomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventAnomaly::Error(e) => write!(f, "notification error: {}", e),
            EventAnomaly::Rescan => write!(f, "notification queue overflowed"),
            EventAnomaly::NoPaths => write!(f, "event without paths"),
            EventAnomaly::PathCount(n) => write!(f, "event with {} paths", n),
            EventAnomaly::OutsideSpace(p) => write!(f, "event path {:?} outside space", p),
            EventAnomaly::PathTooLong(n) => write!(f, "event path of {} bytes", n),
            EventAnomaly::NulByte => write!(f, "event path containing NUL"),
        }
    }
}

fn classify(kind: &EventKind) -> Option<ChangeKind> {
    match kind {
        EventKind::Access(_) => None,
        EventKind::Create(_) => Some(ChangeKind::Created),
        EventKind::Modify(ModifyKind::Name(_)) => Some(ChangeKind::Renamed),
        EventKind::Modify(ModifyKind::Metadata(_)) => Some(ChangeKind::Unknown),
        EventKind::Modify(_) => Some(ChangeKind::Modified),
        EventKind::Remove(_) => Some(ChangeKind::Deleted),
        EventKind::Any | EventKind::Other => Some(ChangeKind::Unknown),
    }
}

/// Check a native event and extract its changes
///
/// Returns the accepted `(path, kind)` pairs, or the first anomaly found.
/// Access events are accepted with no changes.
pub fn validate_event(
    root: &Path,
    event: notify::Result<Event>,
) -> std::result::Result<Vec<(PathBuf, ChangeKind)>, EventAnomaly> {
    let event = event.map_err(|e| EventAnomaly::Error(e.to_string()))?;

    if event.need_rescan() {
        return Err(EventAnomaly::Rescan);
    }
    let count = event.paths.len();
    if count == 0 {
        return Err(EventAnomaly::NoPaths);
    }
    if count > MAX_PATHS_PER_EVENT {
        return Err(EventAnomaly::PathCount(count));
    }
    if matches!(event.kind, EventKind::Modify(ModifyKind::Name(RenameMode::Both))) && count != 2 {
        return Err(EventAnomaly::PathCount(count));
    }

    for path in &event.paths {
        let raw = path.as_os_str().as_encoded_bytes();
        if raw.len() > MAX_PATH_BYTES {
            return Err(EventAnomaly::PathTooLong(raw.len()));
        }
        if raw.contains(&0) {
            return Err(EventAnomaly::NulByte);
        }
        if !path.starts_with(root) {
            return Err(EventAnomaly::OutsideSpace(path.clone()));
        }
    }

    let Some(kind) = classify(&event.kind) else {
        return Ok(Vec::new());
    };
    Ok(event.paths.into_iter().map(|p| (p, kind)).collect())
}

/// Per-path capture throttle
#[derive(Debug)]
pub struct Throttle {
    window: std::time::Duration,
    expiry: std::time::Duration,
    prune_every: usize,
    prune_ceiling: usize,
    entries: RwLock<HashMap<PathBuf, Instant>>,
    inserts: AtomicUsize,
}

impl Throttle {
    /// Create a throttle with the given timing
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            window: config.throttle_window,
            expiry: config.throttle_expiry,
            prune_every: config.prune_every.max(1),
            prune_ceiling: config.prune_ceiling,
            entries: RwLock::new(HashMap::new()),
            inserts: AtomicUsize::new(0),
        }
    }

    /// Record a capture of `path` now unless one happened within the window
    pub fn should_capture(&self, path: &Path) -> bool {
        self.should_capture_at(path, Instant::now())
    }

    fn should_capture_at(&self, path: &Path, now: Instant) -> bool {
        if let Some(last) = self.entries.read().get(path) {
            if now.saturating_duration_since(*last) < self.window {
                return false;
            }
        }

        let mut entries = self.entries.write();
        // Another thread may have inserted between the two locks
        if let Some(last) = entries.get(path) {
            if now.saturating_duration_since(*last) < self.window {
                return false;
            }
        }
        entries.insert(path.to_path_buf(), now);

        let inserted = self.inserts.fetch_add(1, Ordering::Relaxed) + 1;
        if inserted % self.prune_every == 0 || entries.len() > self.prune_ceiling {
            Self::prune_locked(&mut entries, now, self.expiry);
        }
        true
    }

    fn prune_locked(entries: &mut HashMap<PathBuf, Instant>, now: Instant, expiry: std::time::Duration) -> usize {
        let before = entries.len();
        entries.retain(|_, last| now.saturating_duration_since(*last) < expiry);
        let removed = before - entries.len();
        if removed > 0 {
            trace!("Pruned {} throttle entries", removed);
        }
        removed
    }

    /// Drop expired entries, returning how many were removed
    pub fn prune(&self) -> usize {
        Self::prune_locked(&mut self.entries.write(), Instant::now(), self.expiry)
    }

    /// Number of tracked paths
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether no path is tracked
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Counters for one monitoring session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MonitorStats {
    /// Changes seen, native or synthetic
    pub events_received: u64,
    /// Changes ignored because of name, location or type
    pub events_filtered: u64,
    /// Captures suppressed by the throttle
    pub events_throttled: u64,
    /// Captures handed to the worker
    pub captures_enqueued: u64,
    /// Captures that produced a version
    pub captures_completed: u64,
    /// Captures that failed
    pub captures_failed: u64,
    /// Rejected native events
    pub anomalies: u64,
}

#[derive(Debug, Default)]
struct Counters {
    events_received: AtomicU64,
    events_filtered: AtomicU64,
    events_throttled: AtomicU64,
    captures_enqueued: AtomicU64,
    captures_completed: AtomicU64,
    captures_failed: AtomicU64,
    anomalies: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> MonitorStats {
        MonitorStats {
            events_received: self.events_received.load(Ordering::Relaxed),
            events_filtered: self.events_filtered.load(Ordering::Relaxed),
            events_throttled: self.events_throttled.load(Ordering::Relaxed),
            captures_enqueued: self.captures_enqueued.load(Ordering::Relaxed),
            captures_completed: self.captures_completed.load(Ordering::Relaxed),
            captures_failed: self.captures_failed.load(Ordering::Relaxed),
            anomalies: self.anomalies.load(Ordering::Relaxed),
        }
    }
}

enum Job {
    Capture(PathBuf),
    Degrade(EventAnomaly),
    Shutdown,
}

struct Scanner {
    stop_tx: std_mpsc::Sender<()>,
    handle: thread::JoinHandle<()>,
}

impl Scanner {
    fn stop(self) {
        let _ = self.stop_tx.send(());
        if self.handle.join().is_err() {
            warn!("Fallback scanner thread panicked");
        }
    }
}

struct SessionShared {
    space: Space,
    store: VersionStore,
    config: MonitorConfig,
    throttle: Throttle,
    on_event: EventHandler,
    jobs: mpsc::UnboundedSender<Job>,
    state: Mutex<MonitorState>,
    stopping: AtomicBool,
    degraded: AtomicBool,
    counters: Counters,
    watcher: Mutex<Option<RecommendedWatcher>>,
    scanner: Mutex<Option<Scanner>>,
}

impl SessionShared {
    fn root(&self) -> &Path {
        self.space.root()
    }

    fn handle_native(&self, event: notify::Result<Event>) {
        if self.stopping.load(Ordering::Acquire) || self.degraded.load(Ordering::Acquire) {
            return;
        }
        match validate_event(self.root(), event) {
            Ok(changes) => {
                for (path, kind) in changes {
                    self.route(path, kind, false);
                }
            }
            Err(anomaly) => {
                Counters::bump(&self.counters.anomalies);
                if !self.degraded.swap(true, Ordering::AcqRel) {
                    warn!(
                        "Rejected native event for {:?} ({}); switching to fallback scanning",
                        self.root(),
                        anomaly
                    );
                    let _ = self.jobs.send(Job::Degrade(anomaly));
                }
            }
        }
    }

    fn route(&self, path: PathBuf, kind: ChangeKind, synthetic: bool) {
        if self.stopping.load(Ordering::Acquire) {
            return;
        }
        Counters::bump(&self.counters.events_received);

        if !self.space.is_tracked_path(&path) {
            Counters::bump(&self.counters.events_filtered);
            return;
        }
        let is_file = std::fs::symlink_metadata(&path)
            .map(|m| m.is_file())
            .unwrap_or(false);
        if kind.triggers_capture() && !is_file {
            Counters::bump(&self.counters.events_filtered);
            return;
        }

        (self.on_event)(MonitorEvent {
            space: self.root().to_path_buf(),
            path: path.clone(),
            kind,
            synthetic,
        });

        // The destination side of a rename holds the file now
        let wants_capture = kind.triggers_capture() || (kind == ChangeKind::Renamed && is_file);
        if !wants_capture {
            return;
        }

        if self.throttle.should_capture(&path) {
            trace!("Queueing capture of {:?}", path);
            if self.jobs.send(Job::Capture(path)).is_ok() {
                Counters::bump(&self.counters.captures_enqueued);
            }
        } else {
            Counters::bump(&self.counters.events_throttled);
        }
    }

    fn degrade(self: &Arc<Self>, anomaly: EventAnomaly) {
        if self.stopping.load(Ordering::Acquire) {
            return;
        }
        drop(self.watcher.lock().take());
        *self.state.lock() = MonitorState::Fallback;
        info!("Monitoring {:?} in fallback mode after {}", self.root(), anomaly);
        self.start_scanner();
    }

    fn start_scanner(self: &Arc<Self>) {
        let mut slot = self.scanner.lock();
        if slot.is_some() {
            return;
        }
        let (stop_tx, stop_rx) = std_mpsc::channel();
        let shared = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("verspace-scanner".to_string())
            .spawn(move || shared.scan_loop(stop_rx));
        match spawned {
            Ok(handle) => *slot = Some(Scanner { stop_tx, handle }),
            Err(e) => warn!("Could not start fallback scanner for {:?}: {}", self.root(), e),
        }
    }

    fn scan_loop(&self, stop_rx: std_mpsc::Receiver<()>) {
        let mut reported: HashMap<PathBuf, SystemTime> = HashMap::new();
        loop {
            match stop_rx.recv_timeout(self.config.scan_interval) {
                Err(std_mpsc::RecvTimeoutError::Timeout) => self.scan_once(&mut reported),
                _ => break,
            }
        }
        debug!("Fallback scanner for {:?} stopped", self.root());
    }

    /// Report top-level files modified within the recent window
    ///
    /// Each distinct modification time is reported once.
    fn scan_once(&self, reported: &mut HashMap<PathBuf, SystemTime>) {
        let entries = match std::fs::read_dir(self.root()) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Fallback scan of {:?} failed: {}", self.root(), e);
                return;
            }
        };
        let now = SystemTime::now();

        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name();
            if !self.space.is_tracked_name(&name.to_string_lossy()) {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            if !meta.is_file() {
                continue;
            }
            let Ok(modified) = meta.modified() else { continue };
            let recent = now
                .duration_since(modified)
                .map(|age| age <= self.config.recent_window)
                .unwrap_or(true);
            if !recent {
                continue;
            }

            let path = entry.path();
            if reported.get(&path) == Some(&modified) {
                continue;
            }
            reported.insert(path.clone(), modified);
            self.route(path, ChangeKind::Modified, true);
        }

        reported.retain(|path, _| path.exists());
    }
}

fn worker_loop(shared: Arc<SessionShared>, mut jobs: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = jobs.blocking_recv() {
        match job {
            Job::Capture(path) => match shared.store.capture(&shared.space, &path, None) {
                Ok(version) => {
                    Counters::bump(&shared.counters.captures_completed);
                    debug!("Auto-captured {:?} as {}", path, version.short_id());
                }
                Err(e) => {
                    Counters::bump(&shared.counters.captures_failed);
                    warn!("Automatic capture of {:?} failed: {}", path, e);
                }
            },
            Job::Degrade(anomaly) => shared.degrade(anomaly),
            Job::Shutdown => break,
        }
    }
}

struct Session {
    shared: Arc<SessionShared>,
    worker: Option<thread::JoinHandle<()>>,
}

impl Session {
    fn shutdown(mut self) -> MonitorStats {
        let shared = &self.shared;
        shared.stopping.store(true, Ordering::Release);
        let _ = shared.jobs.send(Job::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Capture worker for {:?} panicked", shared.root());
            }
        }
        drop(shared.watcher.lock().take());
        if let Some(scanner) = shared.scanner.lock().take() {
            scanner.stop();
        }
        *shared.state.lock() = MonitorState::Stopped;
        shared.counters.snapshot()
    }
}

/// Watches spaces and captures changed files
pub struct ChangeMonitor {
    store: VersionStore,
    sessions: DashMap<PathBuf, Session>,
    finished: DashMap<PathBuf, MonitorStats>,
}

impl fmt::Debug for ChangeMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeMonitor")
            .field("sessions", &self.sessions.len())
            .field("finished", &self.finished.len())
            .finish()
    }
}

impl ChangeMonitor {
    /// Create a monitor capturing through `store`
    pub fn new(store: VersionStore) -> Self {
        Self {
            store,
            sessions: DashMap::new(),
            finished: DashMap::new(),
        }
    }

    /// Start watching `space`
    ///
    /// Returns `Ok(false)` if the space is already being watched. If native
    /// notification cannot be set up the session starts in fallback mode.
    pub fn start(&self, space: &Space, on_event: EventHandler) -> Result<bool> {
        let root = space.root().to_path_buf();
        let entry = match self.sessions.entry(root.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                debug!("Already monitoring {:?}", root);
                return Ok(false);
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => entry,
        };

        let config = space.config().monitor;
        let (jobs, jobs_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(SessionShared {
            space: space.clone(),
            store: self.store.clone(),
            config,
            throttle: Throttle::new(&config),
            on_event,
            jobs,
            state: Mutex::new(MonitorState::Idle),
            stopping: AtomicBool::new(false),
            degraded: AtomicBool::new(false),
            counters: Counters::default(),
            watcher: Mutex::new(None),
            scanner: Mutex::new(None),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("verspace-capture".to_string())
            .spawn(move || worker_loop(worker_shared, jobs_rx))?;

        let weak: Weak<SessionShared> = Arc::downgrade(&shared);
        let native = notify::recommended_watcher(move |res: notify::Result<Event>| {
            if let Some(shared) = weak.upgrade() {
                shared.handle_native(res);
            }
        })
        .and_then(|mut watcher| {
            watcher.watch(&root, RecursiveMode::Recursive)?;
            Ok(watcher)
        });

        match native {
            Ok(watcher) => {
                *shared.watcher.lock() = Some(watcher);
                *shared.state.lock() = MonitorState::Native;
                info!("Monitoring {:?} with native notifications", root);
            }
            Err(e) => {
                warn!("Native notifications unavailable for {:?} ({}); using fallback scanning", root, e);
                shared.degraded.store(true, Ordering::Release);
                *shared.state.lock() = MonitorState::Fallback;
                shared.start_scanner();
            }
        }

        self.finished.remove(&root);
        entry.insert(Session {
            shared,
            worker: Some(worker),
        });
        Ok(true)
    }

    /// Stop watching the space rooted at `root`
    ///
    /// Releases the watcher and joins every session thread before
    /// returning. Returns false if the space was not being watched.
    pub fn stop(&self, root: &Path) -> bool {
        let Some((root, session)) = self.sessions.remove(root) else {
            return false;
        };
        let stats = session.shutdown();
        info!("Stopped monitoring {:?}", root);
        self.finished.insert(root, stats);
        true
    }

    /// Stop every session
    pub fn stop_all(&self) {
        let roots: Vec<PathBuf> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for root in roots {
            self.stop(&root);
        }
    }

    /// Current state of the space rooted at `root`
    pub fn state(&self, root: &Path) -> MonitorState {
        if let Some(session) = self.sessions.get(root) {
            return *session.shared.state.lock();
        }
        if self.finished.contains_key(root) {
            MonitorState::Stopped
        } else {
            MonitorState::Idle
        }
    }

    /// Counters of the live or last session for `root`
    pub fn stats(&self, root: &Path) -> Option<MonitorStats> {
        if let Some(session) = self.sessions.get(root) {
            return Some(session.shared.counters.snapshot());
        }
        self.finished.get(root).map(|s| *s)
    }

    /// Feed a native event through the same path as the watcher callback
    ///
    /// Returns false if `root` is not being watched.
    pub fn deliver(&self, root: &Path, event: notify::Result<Event>) -> bool {
        let shared = match self.sessions.get(root) {
            Some(session) => Arc::clone(&session.shared),
            None => return false,
        };
        shared.handle_native(event);
        true
    }

    /// Spaces currently watched
    pub fn watched(&self) -> Vec<PathBuf> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }
}

impl Drop for ChangeMonitor {
    fn drop(&mut self) {
        self.stop_all();
    }
}
