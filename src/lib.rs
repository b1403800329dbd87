pub mod api;
pub mod config;
pub mod employee;
pub mod error;
pub mod events;
pub mod orchestration;
pub mod pcsc_reader;
pub mod reader;
pub mod recorder;
pub mod serial_reader;
pub mod session;
pub mod store;

pub use api::{ApiClient, DashboardData, RemoteGateway};
pub use config::PointeuseConfig;
pub use employee::{Employee, EmployeeDirectory};
pub use error::{PointeuseError, ReaderError, RecordError, Result, StoreError};
pub use events::{EventBus, TerminalEvent};
pub use orchestration::Terminal;
pub use reader::{BadgeReader, Debouncer, MockBadgeReader};
pub use recorder::AttendanceRecorder;
pub use session::{SessionTracker, SessionTiming};
pub use store::{AttendanceRecord, AttendanceStore, Direction};
