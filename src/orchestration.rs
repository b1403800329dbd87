use crate::api::{ApiClient, RemoteGateway};
use crate::config::{PointeuseConfig, ReaderConfig};
use crate::employee::EmployeeDirectory;
use crate::error::{PointeuseError, Result};
use crate::events::{EventBus, TerminalEvent};
use crate::pcsc_reader::PcscBadgeReader;
use crate::reader::{BadgeReader, CardCallback};
use crate::recorder::AttendanceRecorder;
use crate::serial_reader::SerialBadgeReader;
use crate::session::{SessionTracker, SessionTiming};
use crate::store::AttendanceStore;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Build the reader for the configured backend. "auto" probes PC/SC first
/// (the contactless reader also enumerates as a serial device on some
/// platforms, the reverse never happens), then falls back to serial.
fn build_reader(config: &ReaderConfig) -> Box<dyn BadgeReader> {
    match config.backend.as_str() {
        "serial" => Box::new(SerialBadgeReader::new(config)),
        "pcsc" => Box::new(PcscBadgeReader::new(config)),
        _ => {
            let mut pcsc = PcscBadgeReader::new(config);
            if pcsc.connect() {
                info!("Auto-detected PC/SC badge reader");
                return Box::new(pcsc);
            }
            info!("No PC/SC reader, trying serial");
            Box::new(SerialBadgeReader::new(config))
        }
    }
}

/// Wires the reader, session tracker, recorder and stores together and
/// owns their lifecycle.
pub struct Terminal {
    config: PointeuseConfig,
    events: EventBus,
    directory: Arc<RwLock<EmployeeDirectory>>,
    store: AttendanceStore,
    gateway: Arc<dyn RemoteGateway>,
    reader: Box<dyn BadgeReader>,
    detections_tx: Option<mpsc::UnboundedSender<String>>,
    tracker: Option<tokio::task::JoinHandle<()>>,
}

impl Terminal {
    pub async fn new(config: PointeuseConfig) -> Result<Self> {
        let store = AttendanceStore::open(&config.storage.database_path).await?;
        let gateway: Arc<dyn RemoteGateway> = Arc::new(ApiClient::new(&config.api)?);
        let reader = build_reader(&config.reader);
        Self::assemble(config, reader, gateway, store)
    }

    /// Assembly with injected collaborators; tests use this with the mock
    /// reader and a fake gateway.
    pub fn assemble(
        config: PointeuseConfig,
        reader: Box<dyn BadgeReader>,
        gateway: Arc<dyn RemoteGateway>,
        store: AttendanceStore,
    ) -> Result<Self> {
        let directory = EmployeeDirectory::load(&config.storage.employees_file)?;
        if !directory.has_admin() {
            // The UI falls back to PIN-based admin entry in this case.
            warn!("No admin badge in the employee directory");
        }
        let events = EventBus::new(config.system.event_bus_capacity);

        Ok(Self {
            config,
            events,
            directory: Arc::new(RwLock::new(directory)),
            store,
            gateway,
            reader,
            detections_tx: None,
            tracker: None,
        })
    }

    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    pub fn store(&self) -> AttendanceStore {
        self.store.clone()
    }

    /// Connect the reader, start polling and spawn the session tracker.
    pub async fn start(&mut self) -> Result<()> {
        if !self.reader.connect() {
            let _ = self
                .events
                .publish(TerminalEvent::ReaderStatusChanged {
                    connected: false,
                    timestamp: SystemTime::now(),
                })
                .await;
            return Err(PointeuseError::component(
                "reader",
                "no badge reader available",
            ));
        }

        info!("Badge reader ready: {}", self.reader.name());
        let _ = self
            .events
            .publish(TerminalEvent::ReaderStatusChanged {
                connected: true,
                timestamp: SystemTime::now(),
            })
            .await;

        let (tx, rx) = mpsc::unbounded_channel();
        self.reader.start_reading(forwarding_callback(tx.clone()));
        self.detections_tx = Some(tx);

        let recorder = Arc::new(AttendanceRecorder::new(
            self.gateway.clone(),
            self.store.clone(),
        ));
        let tracker = SessionTracker::new(
            SessionTiming::from(&self.config.session),
            self.directory.clone(),
            self.reader.shared(),
            recorder,
            self.gateway.clone(),
            self.events.clone(),
        );
        self.tracker = Some(tokio::spawn(tracker.run(rx)));
        Ok(())
    }

    /// Block until ctrl-c, then shut down cleanly.
    pub async fn run(&mut self) -> Result<()> {
        tokio::signal::ctrl_c()
            .await
            .map_err(|e| PointeuseError::system(format!("signal handling failed: {e}")))?;
        info!("Interrupt received");
        self.shutdown("interrupt").await;
        Ok(())
    }

    /// Hand the reader to an exclusive consumer (admin badge enrolment):
    /// the main poll loop stops; nothing else touches the device until
    /// [`Terminal::resume_reading`].
    pub fn suspend_reading(&mut self) {
        info!("Suspending badge reading");
        self.reader.stop_reading();
    }

    /// Restart the main poll loop after an exclusive consumer released the
    /// device. The directory is reloaded first; the admin may have changed
    /// it.
    pub fn resume_reading(&mut self) -> Result<()> {
        if let Err(e) = self.directory.write().reload() {
            error!("Directory reload failed: {}", e);
            return Err(e);
        }
        let Some(tx) = &self.detections_tx else {
            return Err(PointeuseError::system("terminal was never started"));
        };
        info!("Resuming badge reading");
        self.reader.start_reading(forwarding_callback(tx.clone()));
        Ok(())
    }

    pub async fn shutdown(&mut self, reason: &str) {
        let _ = self
            .events
            .publish(TerminalEvent::ShutdownRequested {
                reason: reason.to_string(),
                timestamp: SystemTime::now(),
            })
            .await;

        self.reader.stop_reading();
        self.reader.disconnect();

        // Closing the channel lets the tracker drain and exit.
        self.detections_tx = None;
        if let Some(tracker) = self.tracker.take() {
            if tokio::time::timeout(std::time::Duration::from_secs(5), tracker)
                .await
                .is_err()
            {
                warn!("Session tracker did not stop in time");
            }
        }

        self.store.close().await;
        info!("Terminal stopped");
    }
}

fn forwarding_callback(tx: mpsc::UnboundedSender<String>) -> CardCallback {
    Arc::new(move |uid| {
        // A closed channel only happens during shutdown; the read is moot.
        let _ = tx.send(uid);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::DashboardData;
    use crate::error::RecordError;
    use crate::reader::MockBadgeReader;
    use crate::store::Direction;
    use async_trait::async_trait;
    use std::io::Write;
    use std::time::Duration;

    struct FakeGateway;

    #[async_trait]
    impl RemoteGateway for FakeGateway {
        async fn save_attendance(
            &self,
            _employee_numeric_id: i64,
            _date: &str,
            _time: &str,
        ) -> std::result::Result<(), RecordError> {
            Ok(())
        }

        async fn fetch_dashboard(
            &self,
            _employee_numeric_id: i64,
            _date: &str,
        ) -> std::result::Result<DashboardData, RecordError> {
            Ok(DashboardData::default())
        }
    }

    fn test_config(employees_file: &std::path::Path) -> PointeuseConfig {
        let mut config = PointeuseConfig::default();
        config.api.url = "https://pointage.example.com".to_string();
        config.api.account_id = 1;
        config.storage.employees_file = employees_file.to_string_lossy().into_owned();
        config.session.consultation_hold_seconds = 10;
        config.session.removal_silence_seconds = 1;
        config.session.presence_check_seconds = 1;
        config.session.processing_guard_seconds = 1;
        config
    }

    fn employees_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(
            br#"[{"employee_id": "EMP001", "name": "Alice Martin", "rfid": "A1B2C3", "rank": 2}]"#,
        )
        .unwrap();
        file
    }

    #[tokio::test]
    async fn test_terminal_end_to_end_tap() {
        let employees = employees_file();
        let config = test_config(employees.path());

        let reader = MockBadgeReader::new();
        let controller = reader.controller();
        let store = AttendanceStore::open_in_memory().await.unwrap();

        let mut terminal = Terminal::assemble(
            config,
            Box::new(reader),
            Arc::new(FakeGateway),
            store.clone(),
        )
        .unwrap();
        let mut events = terminal.events().subscribe();

        terminal.start().await.unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            TerminalEvent::ReaderStatusChanged { connected: true, .. }
        ));

        controller.present("A1B2C3");
        assert!(matches!(
            tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .unwrap()
                .unwrap(),
            TerminalEvent::BadgeDetected { .. }
        ));

        // Badge left the field: watchdog commits and closes the session.
        match tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap()
        {
            TerminalEvent::AttendanceRecorded { direction, .. } => {
                assert_eq!(direction, Direction::Entree);
            }
            other => panic!("expected AttendanceRecorded, got {:?}", other),
        }

        assert_eq!(store.count().await.unwrap(), 1);
        terminal.shutdown("test done").await;
    }

    #[tokio::test]
    async fn test_suspend_and_resume_reading() {
        let employees = employees_file();
        let config = test_config(employees.path());

        let reader = MockBadgeReader::new();
        let controller = reader.controller();
        let store = AttendanceStore::open_in_memory().await.unwrap();

        let mut terminal =
            Terminal::assemble(config, Box::new(reader), Arc::new(FakeGateway), store).unwrap();
        let mut events = terminal.events().subscribe();
        terminal.start().await.unwrap();
        let _ = events.recv().await.unwrap(); // ReaderStatusChanged

        terminal.suspend_reading();
        controller.present("A1B2C3");
        // Suspended: the presentation goes nowhere.
        assert!(
            tokio::time::timeout(Duration::from_millis(300), events.recv())
                .await
                .is_err()
        );

        terminal.resume_reading().unwrap();
        controller.present("A1B2C3");
        assert!(matches!(
            tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .unwrap()
                .unwrap(),
            TerminalEvent::BadgeDetected { .. }
        ));

        terminal.shutdown("test done").await;
    }
}
