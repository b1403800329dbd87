use crate::store::Direction;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum EventBusError {
    #[error("Failed to publish event: {details}")]
    PublishFailed { details: String },
}

/// Events emitted by the terminal core for the presentation layer and tests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TerminalEvent {
    /// A known, non-admin badge was presented
    BadgeDetected {
        employee_id: String,
        employee_name: String,
        timestamp: SystemTime,
    },
    /// A badge with no directory entry was presented
    UnknownBadge { uid: String, timestamp: SystemTime },
    /// A rank-1 badge was presented; the admin surface should open
    AdminBadge {
        employee_id: String,
        timestamp: SystemTime,
    },
    /// The badge was held past the consultation threshold
    ConsultationStarted {
        employee_id: String,
        timestamp: SystemTime,
    },
    /// Dashboard data for the consulted employee is available
    DashboardReady {
        employee_id: String,
        timestamp: SystemTime,
    },
    /// The presence watchdog inferred physical badge removal
    BadgeRemoved {
        employee_id: String,
        timestamp: SystemTime,
    },
    /// An attendance record was committed remotely and mirrored locally
    AttendanceRecorded {
        employee_id: String,
        direction: Direction,
        timestamp: SystemTime,
    },
    /// The remote store rejected or never received the submission
    AttendanceFailed {
        employee_id: String,
        error: String,
        timestamp: SystemTime,
    },
    /// Reader connection status changed
    ReaderStatusChanged {
        connected: bool,
        timestamp: SystemTime,
    },
    /// A system error occurred in a component
    SystemError { component: String, error: String },
    /// System shutdown requested
    ShutdownRequested {
        timestamp: SystemTime,
        reason: String,
    },
}

impl TerminalEvent {
    /// Get the timestamp of the event
    pub fn timestamp(&self) -> SystemTime {
        match self {
            TerminalEvent::BadgeDetected { timestamp, .. } => *timestamp,
            TerminalEvent::UnknownBadge { timestamp, .. } => *timestamp,
            TerminalEvent::AdminBadge { timestamp, .. } => *timestamp,
            TerminalEvent::ConsultationStarted { timestamp, .. } => *timestamp,
            TerminalEvent::DashboardReady { timestamp, .. } => *timestamp,
            TerminalEvent::BadgeRemoved { timestamp, .. } => *timestamp,
            TerminalEvent::AttendanceRecorded { timestamp, .. } => *timestamp,
            TerminalEvent::AttendanceFailed { timestamp, .. } => *timestamp,
            TerminalEvent::ReaderStatusChanged { timestamp, .. } => *timestamp,
            TerminalEvent::SystemError { .. } => SystemTime::now(),
            TerminalEvent::ShutdownRequested { timestamp, .. } => *timestamp,
        }
    }

    /// Get a human-readable description of the event
    pub fn description(&self) -> String {
        match self {
            TerminalEvent::BadgeDetected { employee_name, .. } => {
                format!("Badge detected: {}", employee_name)
            }
            TerminalEvent::UnknownBadge { uid, .. } => {
                format!("Unknown badge: {}", uid)
            }
            TerminalEvent::AdminBadge { employee_id, .. } => {
                format!("Admin badge: {}", employee_id)
            }
            TerminalEvent::ConsultationStarted { employee_id, .. } => {
                format!("Consultation started for {}", employee_id)
            }
            TerminalEvent::DashboardReady { employee_id, .. } => {
                format!("Dashboard ready for {}", employee_id)
            }
            TerminalEvent::BadgeRemoved { employee_id, .. } => {
                format!("Badge removed ({})", employee_id)
            }
            TerminalEvent::AttendanceRecorded {
                employee_id,
                direction,
                ..
            } => {
                format!("{} recorded for {}", direction.as_str(), employee_id)
            }
            TerminalEvent::AttendanceFailed {
                employee_id, error, ..
            } => {
                format!("Attendance failed for {}: {}", employee_id, error)
            }
            TerminalEvent::ReaderStatusChanged { connected, .. } => {
                format!(
                    "Reader {}",
                    if *connected {
                        "connected"
                    } else {
                        "disconnected"
                    }
                )
            }
            TerminalEvent::SystemError { component, error } => {
                format!("Error in {}: {}", component, error)
            }
            TerminalEvent::ShutdownRequested { reason, .. } => {
                format!("Shutdown requested: {}", reason)
            }
        }
    }

    /// Get the event type as a string for filtering
    pub fn event_type(&self) -> &'static str {
        match self {
            TerminalEvent::BadgeDetected { .. } => "badge_detected",
            TerminalEvent::UnknownBadge { .. } => "unknown_badge",
            TerminalEvent::AdminBadge { .. } => "admin_badge",
            TerminalEvent::ConsultationStarted { .. } => "consultation_started",
            TerminalEvent::DashboardReady { .. } => "dashboard_ready",
            TerminalEvent::BadgeRemoved { .. } => "badge_removed",
            TerminalEvent::AttendanceRecorded { .. } => "attendance_recorded",
            TerminalEvent::AttendanceFailed { .. } => "attendance_failed",
            TerminalEvent::ReaderStatusChanged { .. } => "reader_status_changed",
            TerminalEvent::SystemError { .. } => "system_error",
            TerminalEvent::ShutdownRequested { .. } => "shutdown_requested",
        }
    }
}

/// Async event bus for component coordination using broadcast channels
pub struct EventBus {
    sender: broadcast::Sender<TerminalEvent>,
}

impl EventBus {
    /// Create a new event bus with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events and get a receiver
    pub fn subscribe(&self) -> broadcast::Receiver<TerminalEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all subscribers
    pub async fn publish(&self, event: TerminalEvent) -> Result<usize, EventBusError> {
        // Log important events at appropriate levels
        match &event {
            TerminalEvent::UnknownBadge { uid, .. } => {
                warn!("Unknown badge presented: {}", uid);
            }
            TerminalEvent::AttendanceRecorded {
                employee_id,
                direction,
                ..
            } => {
                info!("{} recorded for employee {}", direction.as_str(), employee_id);
            }
            TerminalEvent::AttendanceFailed {
                employee_id, error, ..
            } => {
                error!("Attendance failed for employee {}: {}", employee_id, error);
            }
            TerminalEvent::SystemError { component, error } => {
                error!("System error in {}: {}", component, error);
            }
            TerminalEvent::ReaderStatusChanged { connected, .. } => {
                if *connected {
                    info!("Reader connected");
                } else {
                    warn!("Reader disconnected");
                }
            }
            TerminalEvent::ShutdownRequested { reason, .. } => {
                info!("Shutdown requested: {}", reason);
            }
            _ => {
                debug!("Event: {}", event.description());
            }
        }

        self.sender
            .send(event)
            .map_err(|e| EventBusError::PublishFailed {
                details: e.to_string(),
            })
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Check if there are any active subscribers
    pub fn has_subscribers(&self) -> bool {
        self.sender.receiver_count() > 0
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_event_bus_basic_operations() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe();

        let event = TerminalEvent::BadgeDetected {
            employee_id: "1".to_string(),
            employee_name: "Alice Martin".to_string(),
            timestamp: SystemTime::now(),
        };

        let subscriber_count = event_bus.publish(event).await.unwrap();
        assert_eq!(subscriber_count, 1);

        let received = receiver.recv().await.unwrap();
        match received {
            TerminalEvent::BadgeDetected { employee_name, .. } => {
                assert_eq!(employee_name, "Alice Martin");
            }
            _ => panic!("Unexpected event type"),
        }
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let event_bus = EventBus::new(10);
        let mut receiver1 = event_bus.subscribe();
        let mut receiver2 = event_bus.subscribe();

        assert_eq!(event_bus.subscriber_count(), 2);

        let event = TerminalEvent::UnknownBadge {
            uid: "DEADBEEF".to_string(),
            timestamp: SystemTime::now(),
        };

        event_bus.publish(event).await.unwrap();

        let _ = timeout(Duration::from_millis(100), receiver1.recv())
            .await
            .unwrap()
            .unwrap();
        let _ = timeout(Duration::from_millis(100), receiver2.recv())
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_event_properties() {
        let event = TerminalEvent::AttendanceRecorded {
            employee_id: "7".to_string(),
            direction: Direction::Entree,
            timestamp: SystemTime::now(),
        };

        assert_eq!(event.event_type(), "attendance_recorded");
        assert!(event.description().contains("ENTREE"));
    }
}
