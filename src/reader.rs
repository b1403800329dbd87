use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::ReaderError;

/// Two raw reads of the same badge closer than this are one presentation.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_secs(2);
/// Backoff after an unexpected read error before the loop retries.
pub const ERROR_BACKOFF: Duration = Duration::from_secs(1);
/// How long `stop_reading` waits for the poll thread before giving up.
pub const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Callback invoked from the poll thread with a debounced badge identifier.
pub type CardCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Badge reader contract shared by the serial and PC/SC variants.
pub trait BadgeReader: Send {
    /// Locate and open the device. Returns false when no device is present;
    /// the caller decides whether to fall back to another variant.
    fn connect(&mut self) -> bool;

    fn disconnect(&mut self);

    /// Spawn the poll thread. Calling while already reading is a logged no-op.
    fn start_reading(&mut self, on_card: CardCallback);

    /// Signal the poll thread to stop and wait for it, bounded by
    /// [`STOP_JOIN_TIMEOUT`]. Idempotent.
    fn stop_reading(&mut self);

    fn is_reading(&self) -> bool;

    fn is_connected(&self) -> bool;

    /// State shared with the poll thread; the session tracker watches
    /// `last_read` through this handle.
    fn shared(&self) -> Arc<ReaderShared>;

    fn last_read(&self) -> Option<Instant> {
        self.shared().last_read()
    }

    fn name(&self) -> &'static str;
}

/// The only state crossing the poll-thread boundary.
#[derive(Debug, Default)]
pub struct ReaderShared {
    running: AtomicBool,
    connected: AtomicBool,
    last_read: Mutex<Option<Instant>>,
}

impl ReaderShared {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_running(&self, value: bool) {
        self.running.store(value, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn set_connected(&self, value: bool) {
        self.connected.store(value, Ordering::SeqCst);
    }

    pub fn last_read(&self) -> Option<Instant> {
        *self.last_read.lock()
    }

    /// Record that the badge was physically seen, deduplicated or not.
    pub fn touch_last_read(&self) {
        *self.last_read.lock() = Some(Instant::now());
    }

    pub fn set_last_read(&self, value: Option<Instant>) {
        *self.last_read.lock() = value;
    }
}

/// Deduplication state machine for raw reads.
///
/// A read is emitted when the identifier differs from the last emitted one,
/// or when at least [`DEBOUNCE_WINDOW`] has elapsed since the last emission.
#[derive(Debug, Default)]
pub struct Debouncer {
    last_uid: Option<String>,
    last_emit: Option<Instant>,
}

impl Debouncer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, uid: &str, now: Instant) -> bool {
        let emit = match (&self.last_uid, self.last_emit) {
            (Some(last_uid), Some(last_emit)) => {
                last_uid != uid || now.duration_since(last_emit) >= DEBOUNCE_WINDOW
            }
            _ => true,
        };

        if emit {
            self.last_uid = Some(uid.to_string());
            self.last_emit = Some(now);
        }
        emit
    }
}

/// Shared poll-loop body for both reader variants.
///
/// `poll` performs one read attempt: `Ok(Some(uid))` for a successful read,
/// `Ok(None)` when no badge was seen this tick, `Err` for an unexpected
/// failure (logged, then the loop backs off and retries). The loop exits
/// only when the shared `running` flag clears.
pub fn run_poll_loop<F>(
    name: &str,
    shared: Arc<ReaderShared>,
    interval: Duration,
    mut poll: F,
    on_card: CardCallback,
) where
    F: FnMut() -> Result<Option<String>, ReaderError>,
{
    debug!("{} poll loop started", name);
    let mut debouncer = Debouncer::new();

    while shared.is_running() {
        match poll() {
            Ok(Some(uid)) => {
                // Presence is tracked on every raw read so the removal
                // watchdog keeps seeing a held badge even when the read
                // is deduplicated.
                shared.touch_last_read();
                if debouncer.observe(&uid, Instant::now()) {
                    debug!("{} read badge {}", name, uid);
                    on_card(uid);
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!("{} read error: {}", name, e);
                std::thread::sleep(ERROR_BACKOFF);
                continue;
            }
        }
        std::thread::sleep(interval);
    }

    debug!("{} poll loop stopped", name);
}

/// Cooperative stop: clear `running`, wait for the thread within
/// [`STOP_JOIN_TIMEOUT`], warn if it outlives the bound.
pub fn stop_poll_thread(name: &str, shared: &ReaderShared, handle: Option<JoinHandle<()>>) {
    shared.set_running(false);

    let Some(handle) = handle else {
        return;
    };

    let deadline = Instant::now() + STOP_JOIN_TIMEOUT;
    while !handle.is_finished() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }

    if handle.is_finished() {
        if handle.join().is_err() {
            warn!("{} poll thread panicked", name);
        } else {
            info!("{} poll thread stopped", name);
        }
    } else {
        warn!(
            "{} poll thread did not stop within {:?}, detaching",
            name, STOP_JOIN_TIMEOUT
        );
    }
}

/// Scriptable in-memory reader for tests and hardware-less development.
pub struct MockBadgeReader {
    shared: Arc<ReaderShared>,
    callback: Arc<Mutex<Option<CardCallback>>>,
}

/// Remote control for a [`MockBadgeReader`] that has been boxed away behind
/// the trait.
#[derive(Clone)]
pub struct MockController {
    shared: Arc<ReaderShared>,
    callback: Arc<Mutex<Option<CardCallback>>>,
}

impl MockController {
    /// Simulate one debounced badge presentation.
    pub fn present(&self, uid: &str) {
        self.shared.touch_last_read();
        let callback = self.callback.lock().clone();
        if let Some(callback) = callback {
            callback(uid.to_string());
        }
    }

    /// Simulate a deduplicated raw read: presence refreshed, nothing emitted.
    pub fn touch(&self) {
        self.shared.touch_last_read();
    }
}

impl MockBadgeReader {
    pub fn new() -> Self {
        Self {
            shared: ReaderShared::new(),
            callback: Arc::new(Mutex::new(None)),
        }
    }

    pub fn controller(&self) -> MockController {
        MockController {
            shared: self.shared.clone(),
            callback: self.callback.clone(),
        }
    }

    /// Simulate one debounced badge presentation.
    pub fn present(&self, uid: &str) {
        self.controller().present(uid);
    }

    /// Simulate a deduplicated raw read: presence refreshed, nothing emitted.
    pub fn touch(&self) {
        self.shared.touch_last_read();
    }
}

impl Default for MockBadgeReader {
    fn default() -> Self {
        Self::new()
    }
}

impl BadgeReader for MockBadgeReader {
    fn connect(&mut self) -> bool {
        self.shared.set_connected(true);
        true
    }

    fn disconnect(&mut self) {
        self.stop_reading();
        self.shared.set_connected(false);
    }

    fn start_reading(&mut self, on_card: CardCallback) {
        if self.shared.is_running() {
            warn!("Mock reader already reading");
            return;
        }
        *self.callback.lock() = Some(on_card);
        self.shared.set_running(true);
    }

    fn stop_reading(&mut self) {
        self.shared.set_running(false);
        *self.callback.lock() = None;
    }

    fn is_reading(&self) -> bool {
        self.shared.is_running()
    }

    fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    fn shared(&self) -> Arc<ReaderShared> {
        self.shared.clone()
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
