use crate::api::RemoteGateway;
use crate::config::SessionConfig;
use crate::employee::{Employee, EmployeeDirectory};
use crate::events::{EventBus, TerminalEvent};
use crate::reader::ReaderShared;
use crate::recorder::AttendanceRecorder;
use chrono::Local;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

/// Session state machine timings. Production values come from
/// [`SessionConfig`]; tests use millisecond-scale ones.
#[derive(Debug, Clone, Copy)]
pub struct SessionTiming {
    /// Badge held this long without removal switches to consultation mode.
    pub consultation_hold: Duration,
    /// Read silence longer than this means the badge left the field.
    pub removal_silence: Duration,
    /// Period of the presence watchdog.
    pub presence_check: Duration,
    /// Window during which stray reads of another badge are dropped.
    pub processing_guard: Duration,
}

impl From<&SessionConfig> for SessionTiming {
    fn from(config: &SessionConfig) -> Self {
        Self {
            consultation_hold: config.consultation_hold(),
            removal_silence: config.removal_silence(),
            presence_check: config.presence_check(),
            processing_guard: config.processing_guard(),
        }
    }
}

/// One badge presentation, from detection to inferred removal.
struct ActiveSession {
    uid: String,
    employee: Employee,
    consultation_deadline: tokio::time::Instant,
    consultation_mode: bool,
    attendance_committed: bool,
}

/// Single consumer of debounced badge detections.
///
/// All session and attendance logic lives on this one task; the poll thread
/// only pushes identifiers into the channel and refreshes `last_read`.
pub struct SessionTracker {
    timing: SessionTiming,
    directory: Arc<RwLock<EmployeeDirectory>>,
    reader: Arc<ReaderShared>,
    recorder: Arc<AttendanceRecorder>,
    gateway: Arc<dyn RemoteGateway>,
    events: EventBus,
    session: Option<ActiveSession>,
    guard: Option<(Instant, String)>,
}

impl SessionTracker {
    pub fn new(
        timing: SessionTiming,
        directory: Arc<RwLock<EmployeeDirectory>>,
        reader: Arc<ReaderShared>,
        recorder: Arc<AttendanceRecorder>,
        gateway: Arc<dyn RemoteGateway>,
        events: EventBus,
    ) -> Self {
        Self {
            timing,
            directory,
            reader,
            recorder,
            gateway,
            events,
            session: None,
            guard: None,
        }
    }

    /// Drain the detection channel until it closes.
    pub async fn run(mut self, mut detections: UnboundedReceiver<String>) {
        let mut watchdog = tokio::time::interval(self.timing.presence_check);
        watchdog.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let consultation_armed = self
                .session
                .as_ref()
                .is_some_and(|s| !s.consultation_mode);
            let deadline = self
                .session
                .as_ref()
                .map(|s| s.consultation_deadline)
                .unwrap_or_else(tokio::time::Instant::now);

            tokio::select! {
                detection = detections.recv() => match detection {
                    Some(uid) => self.on_detection(uid).await,
                    None => break,
                },
                _ = watchdog.tick() => self.on_watchdog().await,
                _ = tokio::time::sleep_until(deadline), if consultation_armed => {
                    self.on_consultation_deadline().await;
                }
            }
        }

        // Channel closed: the reader stopped. Close any session that is
        // still open so a held badge is not silently dropped.
        if self.session.is_some() {
            self.close_session().await;
        }
        debug!("Session tracker stopped");
    }

    async fn on_detection(&mut self, uid: String) {
        if let Some(session) = &self.session {
            if session.uid == uid {
                // Repeat emission of the held badge (debounce window expired).
                debug!("Badge {} still present", uid);
            } else {
                // At most one session at a time; the watchdog must close the
                // current one before another badge can start.
                info!(
                    "Ignoring badge {} while a session for {} is active",
                    uid, session.uid
                );
            }
            return;
        }

        if let Some((until, guard_uid)) = &self.guard {
            if Instant::now() < *until && *guard_uid != uid {
                info!("Ignoring badge {} during processing guard", uid);
                return;
            }
        }

        let employee = self.directory.read().lookup(&uid).cloned();
        let Some(employee) = employee else {
            self.publish(TerminalEvent::UnknownBadge {
                uid,
                timestamp: SystemTime::now(),
            })
            .await;
            return;
        };

        if employee.is_admin() {
            info!("Admin badge presented by {}", employee.employee_id);
            self.publish(TerminalEvent::AdminBadge {
                employee_id: employee.employee_id,
                timestamp: SystemTime::now(),
            })
            .await;
            return;
        }

        info!("Session opened for {} ({})", employee.employee_id, employee.name);
        self.guard = Some((Instant::now() + self.timing.processing_guard, uid.clone()));
        self.session = Some(ActiveSession {
            uid,
            consultation_deadline: tokio::time::Instant::now() + self.timing.consultation_hold,
            consultation_mode: false,
            attendance_committed: false,
            employee: employee.clone(),
        });

        self.publish(TerminalEvent::BadgeDetected {
            employee_id: employee.employee_id,
            employee_name: employee.name,
            timestamp: SystemTime::now(),
        })
        .await;
    }

    async fn on_watchdog(&mut self) {
        if self.session.is_none() {
            return;
        }

        let removed = match self.reader.last_read() {
            Some(last) => last.elapsed() > self.timing.removal_silence,
            None => true,
        };
        if removed {
            self.close_session().await;
        }
    }

    /// Badge removal, detected exactly once per session.
    async fn close_session(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let employee = session.employee;
        debug!("Badge removed for {}", employee.employee_id);

        if !session.attendance_committed {
            match self.recorder.record(&employee).await {
                Ok(direction) => {
                    self.publish(TerminalEvent::AttendanceRecorded {
                        employee_id: employee.employee_id.clone(),
                        direction,
                        timestamp: SystemTime::now(),
                    })
                    .await;
                }
                Err(e) => {
                    self.publish(TerminalEvent::AttendanceFailed {
                        employee_id: employee.employee_id.clone(),
                        error: e.user_message(),
                        timestamp: SystemTime::now(),
                    })
                    .await;
                }
            }
        }

        self.publish(TerminalEvent::BadgeRemoved {
            employee_id: employee.employee_id,
            timestamp: SystemTime::now(),
        })
        .await;
    }

    /// The badge is still in the field past the hold threshold: the employee
    /// wants to consult, not to clock. No attendance will be written for
    /// this session.
    async fn on_consultation_deadline(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.consultation_mode = true;
        session.attendance_committed = true;
        let employee = session.employee.clone();

        info!("Consultation mode for {}", employee.employee_id);
        self.publish(TerminalEvent::ConsultationStarted {
            employee_id: employee.employee_id.clone(),
            timestamp: SystemTime::now(),
        })
        .await;

        let numeric_id = match employee.numeric_id() {
            Ok(id) => id,
            Err(e) => {
                warn!("Cannot fetch dashboard: {}", e);
                return;
            }
        };
        let today = Local::now().format("%Y-%m-%d").to_string();

        match self.gateway.fetch_dashboard(numeric_id, &today).await {
            Ok(_data) => {
                self.publish(TerminalEvent::DashboardReady {
                    employee_id: employee.employee_id,
                    timestamp: SystemTime::now(),
                })
                .await;
            }
            Err(e) => {
                warn!("Dashboard fetch failed for {}: {}", employee.employee_id, e);
                self.publish(TerminalEvent::SystemError {
                    component: "dashboard".to_string(),
                    error: e.to_string(),
                })
                .await;
            }
        }
    }

    async fn publish(&self, event: TerminalEvent) {
        // No subscribers is not an error for the tracker.
        let _ = self.events.publish(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::DashboardData;
    use crate::error::RecordError;
    use crate::store::{AttendanceStore, Direction};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::io::Write;
    use tokio::sync::broadcast;
    use tokio::sync::mpsc;

    struct FakeGateway {
        fail_saves: Mutex<bool>,
        saves: Mutex<Vec<i64>>,
        dashboards: Mutex<Vec<i64>>,
    }

    impl FakeGateway {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                fail_saves: Mutex::new(false),
                saves: Mutex::new(Vec::new()),
                dashboards: Mutex::new(Vec::new()),
            })
        }

        fn timing_out() -> Arc<Self> {
            let gateway = Self::new();
            *gateway.fail_saves.lock() = true;
            gateway
        }
    }

    #[async_trait]
    impl RemoteGateway for FakeGateway {
        async fn save_attendance(
            &self,
            employee_numeric_id: i64,
            _date: &str,
            _time: &str,
        ) -> Result<(), RecordError> {
            if *self.fail_saves.lock() {
                return Err(RecordError::Timeout);
            }
            self.saves.lock().push(employee_numeric_id);
            Ok(())
        }

        async fn fetch_dashboard(
            &self,
            employee_numeric_id: i64,
            _date: &str,
        ) -> Result<DashboardData, RecordError> {
            self.dashboards.lock().push(employee_numeric_id);
            Ok(DashboardData::default())
        }
    }

    fn test_timing() -> SessionTiming {
        SessionTiming {
            consultation_hold: Duration::from_millis(200),
            removal_silence: Duration::from_millis(100),
            presence_check: Duration::from_millis(40),
            processing_guard: Duration::from_millis(400),
        }
    }

    fn test_directory() -> Arc<RwLock<EmployeeDirectory>> {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(
            br#"[
                {"employee_id": "EMP001", "name": "Alice Martin", "rfid": "A1B2C3", "rank": 2},
                {"employee_id": "EMP002", "name": "Bob Durand", "rfid": "D4E5F6", "rank": 2},
                {"employee_id": "EMP009", "name": "Admin", "rfid": "AD0001", "rank": 1}
            ]"#,
        )
        .unwrap();
        let directory = EmployeeDirectory::load(file.path()).unwrap();
        // Keep the temp file alive long enough to load, then drop it.
        drop(file);
        Arc::new(RwLock::new(directory))
    }

    struct Harness {
        tx: mpsc::UnboundedSender<String>,
        reader: Arc<ReaderShared>,
        gateway: Arc<FakeGateway>,
        store: AttendanceStore,
        events: broadcast::Receiver<TerminalEvent>,
        task: tokio::task::JoinHandle<()>,
    }

    async fn start_tracker() -> Harness {
        start_tracker_with(FakeGateway::new()).await
    }

    async fn start_tracker_with(gateway: Arc<FakeGateway>) -> Harness {
        let store = AttendanceStore::open_in_memory().await.unwrap();
        let reader = ReaderShared::new();
        let bus = EventBus::new(32);
        let events = bus.subscribe();
        let recorder = Arc::new(AttendanceRecorder::new(gateway.clone(), store.clone()));

        let tracker = SessionTracker::new(
            test_timing(),
            test_directory(),
            reader.clone(),
            recorder,
            gateway.clone(),
            bus,
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(tracker.run(rx));

        Harness {
            tx,
            reader,
            gateway,
            store,
            events,
            task,
        }
    }

    impl Harness {
        fn detect(&self, uid: &str) {
            self.reader.touch_last_read();
            self.tx.send(uid.to_string()).unwrap();
        }

        async fn next_event(&mut self) -> TerminalEvent {
            tokio::time::timeout(Duration::from_secs(2), self.events.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event channel closed")
        }

        async fn shutdown(self) -> AttendanceStore {
            drop(self.tx);
            let _ = tokio::time::timeout(Duration::from_secs(2), self.task).await;
            self.store
        }
    }

    #[tokio::test]
    async fn test_tap_and_remove_commits_once() {
        let mut h = start_tracker().await;

        h.detect("A1B2C3");
        assert!(matches!(
            h.next_event().await,
            TerminalEvent::BadgeDetected { .. }
        ));

        // No further reads: the watchdog infers removal and commits once.
        match h.next_event().await {
            TerminalEvent::AttendanceRecorded {
                employee_id,
                direction,
                ..
            } => {
                assert_eq!(employee_id, "EMP001");
                assert_eq!(direction, Direction::Entree);
            }
            other => panic!("expected AttendanceRecorded, got {:?}", other),
        }
        assert!(matches!(
            h.next_event().await,
            TerminalEvent::BadgeRemoved { .. }
        ));

        assert_eq!(h.gateway.saves.lock().as_slice(), &[1]);
        let store = h.shutdown().await;
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_held_badge_enters_consultation_without_commit() {
        let mut h = start_tracker().await;

        h.detect("A1B2C3");
        assert!(matches!(
            h.next_event().await,
            TerminalEvent::BadgeDetected { .. }
        ));

        // Keep the badge in the field past the consultation threshold.
        let reader = h.reader.clone();
        let holder = tokio::spawn(async move {
            for _ in 0..10 {
                reader.touch_last_read();
                tokio::time::sleep(Duration::from_millis(30)).await;
            }
        });

        assert!(matches!(
            h.next_event().await,
            TerminalEvent::ConsultationStarted { .. }
        ));
        assert!(matches!(
            h.next_event().await,
            TerminalEvent::DashboardReady { .. }
        ));

        holder.await.unwrap();
        // Removal after consultation closes the session with no commit.
        assert!(matches!(
            h.next_event().await,
            TerminalEvent::BadgeRemoved { .. }
        ));

        assert!(h.gateway.saves.lock().is_empty());
        assert_eq!(h.gateway.dashboards.lock().as_slice(), &[1]);
        let store = h.shutdown().await;
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unknown_badge_only_emits_event() {
        let mut h = start_tracker().await;

        h.detect("FFFFFF");
        match h.next_event().await {
            TerminalEvent::UnknownBadge { uid, .. } => assert_eq!(uid, "FFFFFF"),
            other => panic!("expected UnknownBadge, got {:?}", other),
        }

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(h.gateway.saves.lock().is_empty());
        let store = h.shutdown().await;
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_admin_badge_never_records() {
        let mut h = start_tracker().await;

        h.detect("AD0001");
        match h.next_event().await {
            TerminalEvent::AdminBadge { employee_id, .. } => {
                assert_eq!(employee_id, "EMP009");
            }
            other => panic!("expected AdminBadge, got {:?}", other),
        }

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(h.gateway.saves.lock().is_empty());
        let store = h.shutdown().await;
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_remote_timeout_still_closes_session() {
        let mut h = start_tracker_with(FakeGateway::timing_out()).await;

        h.detect("A1B2C3");
        assert!(matches!(
            h.next_event().await,
            TerminalEvent::BadgeDetected { .. }
        ));

        // The remote write fails; the session still closes normally with a
        // user-facing failure message and an untouched mirror.
        match h.next_event().await {
            TerminalEvent::AttendanceFailed {
                employee_id, error, ..
            } => {
                assert_eq!(employee_id, "EMP001");
                assert!(!error.is_empty());
            }
            other => panic!("expected AttendanceFailed, got {:?}", other),
        }
        assert!(matches!(
            h.next_event().await,
            TerminalEvent::BadgeRemoved { .. }
        ));

        assert!(h.gateway.saves.lock().is_empty());
        let store = h.shutdown().await;
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_other_badge_ignored_while_session_active() {
        let mut h = start_tracker().await;

        h.detect("A1B2C3");
        assert!(matches!(
            h.next_event().await,
            TerminalEvent::BadgeDetected { .. }
        ));

        // Stray read of another badge while the first session is open.
        h.tx.send("D4E5F6".to_string()).unwrap();

        // No event for the stray badge; the open session runs to its
        // normal close and commits for the first badge only.
        match h.next_event().await {
            TerminalEvent::AttendanceRecorded { employee_id, .. } => {
                assert_eq!(employee_id, "EMP001");
            }
            other => panic!("expected AttendanceRecorded for EMP001, got {:?}", other),
        }
        assert!(matches!(
            h.next_event().await,
            TerminalEvent::BadgeRemoved { .. }
        ));

        assert_eq!(h.gateway.saves.lock().as_slice(), &[1]);
        let store = h.shutdown().await;
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_processing_guard_drops_other_badge() {
        let mut h = start_tracker().await;

        h.detect("A1B2C3");
        assert!(matches!(
            h.next_event().await,
            TerminalEvent::BadgeDetected { .. }
        ));

        // Let the first session close (removal commit), then present another
        // badge while still inside the guard window.
        assert!(matches!(
            h.next_event().await,
            TerminalEvent::AttendanceRecorded { .. }
        ));
        assert!(matches!(
            h.next_event().await,
            TerminalEvent::BadgeRemoved { .. }
        ));

        h.detect("D4E5F6");
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Guard released by time alone; the same badge is accepted now.
        tokio::time::sleep(Duration::from_millis(350)).await;
        h.detect("D4E5F6");
        match h.next_event().await {
            TerminalEvent::BadgeDetected { employee_id, .. } => {
                assert_eq!(employee_id, "EMP002");
            }
            other => panic!("expected BadgeDetected, got {:?}", other),
        }

        assert_eq!(h.gateway.saves.lock().as_slice(), &[1]);
        h.shutdown().await;
    }
}
