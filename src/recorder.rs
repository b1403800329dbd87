use crate::api::RemoteGateway;
use crate::employee::Employee;
use crate::error::RecordError;
use crate::store::{AttendanceStore, Direction};
use chrono::Local;
use std::sync::Arc;
use tracing::{error, info};

/// Two-phase attendance commit: remote first, local mirror second.
///
/// The remote store is authoritative. A remote failure aborts the commit
/// with the local mirror untouched; a local failure after a remote success
/// is logged but does not turn the commit into a failure.
pub struct AttendanceRecorder {
    gateway: Arc<dyn RemoteGateway>,
    store: AttendanceStore,
}

impl AttendanceRecorder {
    pub fn new(gateway: Arc<dyn RemoteGateway>, store: AttendanceStore) -> Self {
        Self { gateway, store }
    }

    /// Commit one attendance event for `employee`.
    ///
    /// Returns the direction derived from the local mirror's last record
    /// (none or SORTIE becomes ENTREE, ENTREE becomes SORTIE), for the
    /// terminal's feedback display.
    pub async fn record(&self, employee: &Employee) -> Result<Direction, RecordError> {
        let numeric_id = employee.numeric_id()?;

        let now = Local::now();
        let date = now.format("%Y-%m-%d").to_string();
        let time = now.format("%H:%M:%S").to_string();

        self.gateway.save_attendance(numeric_id, &date, &time).await?;

        // Direction is derived locally; the server keeps its own ledger and
        // an unreadable mirror must not fail a committed remote write.
        let direction = match self.store.last_for_employee(&employee.employee_id).await {
            Ok(Some(last)) => last.direction.toggled(),
            Ok(None) => Direction::Entree,
            Err(e) => {
                error!(
                    "Cannot read last record for {}: {}, assuming ENTREE",
                    employee.employee_id, e
                );
                Direction::Entree
            }
        };

        if let Err(e) = self
            .store
            .append(
                &employee.employee_id,
                &employee.name,
                &employee.rfid,
                now,
                direction,
            )
            .await
        {
            error!(
                "Local mirror write failed for {}: {} (remote commit stands)",
                employee.employee_id, e
            );
        }

        info!(
            "Attendance committed: {} {} at {} {}",
            employee.employee_id,
            direction.as_str(),
            date,
            time
        );
        Ok(direction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use crate::api::DashboardData;

    struct FakeGateway {
        fail_with: Mutex<Option<RecordError>>,
        saves: Mutex<Vec<(i64, String, String)>>,
    }

    impl FakeGateway {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                fail_with: Mutex::new(None),
                saves: Mutex::new(Vec::new()),
            })
        }

        fn failing(error: RecordError) -> Arc<Self> {
            Arc::new(Self {
                fail_with: Mutex::new(Some(error)),
                saves: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl RemoteGateway for FakeGateway {
        async fn save_attendance(
            &self,
            employee_numeric_id: i64,
            date: &str,
            time: &str,
        ) -> Result<(), RecordError> {
            if let Some(error) = self.fail_with.lock().take() {
                return Err(error);
            }
            self.saves
                .lock()
                .push((employee_numeric_id, date.to_string(), time.to_string()));
            Ok(())
        }

        async fn fetch_dashboard(
            &self,
            _employee_numeric_id: i64,
            _date: &str,
        ) -> Result<DashboardData, RecordError> {
            Ok(DashboardData::default())
        }
    }

    fn alice() -> Employee {
        Employee {
            employee_id: "EMP001".to_string(),
            name: "Alice Martin".to_string(),
            rfid: "A1B2C3".to_string(),
            rank: 2,
        }
    }

    #[tokio::test]
    async fn test_direction_toggles_from_empty_store() {
        let store = AttendanceStore::open_in_memory().await.unwrap();
        let gateway = FakeGateway::ok();
        let recorder = AttendanceRecorder::new(gateway.clone(), store.clone());

        assert_eq!(recorder.record(&alice()).await.unwrap(), Direction::Entree);
        assert_eq!(recorder.record(&alice()).await.unwrap(), Direction::Sortie);
        assert_eq!(recorder.record(&alice()).await.unwrap(), Direction::Entree);

        assert_eq!(store.count().await.unwrap(), 3);
        assert_eq!(gateway.saves.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_remote_failure_leaves_mirror_untouched() {
        let store = AttendanceStore::open_in_memory().await.unwrap();
        let gateway = FakeGateway::failing(RecordError::Timeout);
        let recorder = AttendanceRecorder::new(gateway, store.clone());

        let result = recorder.record(&alice()).await;
        assert!(matches!(result, Err(RecordError::Timeout)));
        assert!(!result.unwrap_err().user_message().is_empty());
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_local_failure_after_remote_success_still_succeeds() {
        let store = AttendanceStore::open_in_memory().await.unwrap();
        store.close().await;

        let recorder = AttendanceRecorder::new(FakeGateway::ok(), store);
        assert_eq!(recorder.record(&alice()).await.unwrap(), Direction::Entree);
    }

    #[tokio::test]
    async fn test_invalid_employee_id_never_reaches_remote() {
        let store = AttendanceStore::open_in_memory().await.unwrap();
        let gateway = FakeGateway::ok();
        let recorder = AttendanceRecorder::new(gateway.clone(), store);

        let bad = Employee {
            employee_id: "EMP".to_string(),
            name: "Nobody".to_string(),
            rfid: "FF".to_string(),
            rank: 2,
        };

        assert!(matches!(
            recorder.record(&bad).await,
            Err(RecordError::InvalidEmployeeId { .. })
        ));
        assert!(gateway.saves.lock().is_empty());
    }
}
