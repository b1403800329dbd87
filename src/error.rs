use thiserror::Error;

#[derive(Error, Debug)]
pub enum PointeuseError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Directory error: {0}")]
    Directory(#[from] serde_json::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("System error: {message}")]
    System { message: String },

    #[error("Component error in {component}: {message}")]
    Component { component: String, message: String },
}

impl PointeuseError {
    pub fn system<S: Into<String>>(message: S) -> Self {
        Self::System {
            message: message.into(),
        }
    }

    pub fn component<S: Into<String>>(component: S, message: S) -> Self {
        Self::Component {
            component: component.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PointeuseError>;

/// Errors raised by reader backends. Failures inside the poll loop never
/// cross the thread boundary; they are logged and the loop retries.
#[derive(Error, Debug)]
pub enum ReaderError {
    #[error("No reader device found")]
    NoDevice,

    #[error("Failed to open reader {device}: {details}")]
    Open { device: String, details: String },

    #[error("Read failed: {details}")]
    Read { details: String },

    #[error("Reader backend not available: {0}")]
    Unavailable(&'static str),
}

/// Classified remote-write failures for the attendance recorder.
///
/// The recorder returns these as a structured result; they never propagate
/// as panics across component boundaries.
#[derive(Error, Debug)]
pub enum RecordError {
    #[error("Remote submission timed out")]
    Timeout,

    #[error("Cannot reach the attendance server: {details}")]
    Connection { details: String },

    #[error("Attendance server rejected the submission: {message}")]
    Api { message: String },

    #[error("Attendance server returned HTTP {status}")]
    Http { status: u16 },

    #[error("Employee id {id:?} has no numeric part")]
    InvalidEmployeeId { id: String },
}

impl RecordError {
    /// Short message suitable for the terminal's status display.
    pub fn user_message(&self) -> String {
        match self {
            Self::Timeout => "Délai d'attente dépassé (serveur trop lent)".to_string(),
            Self::Connection { .. } => "Impossible de se connecter au serveur".to_string(),
            Self::Api { message } => format!("API: {message}"),
            Self::Http { status } => format!("Erreur serveur (HTTP {status})"),
            Self::InvalidEmployeeId { id } => format!("Identifiant employé invalide: {id}"),
        }
    }
}

/// Local mirror store errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        Self::Query(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_error_user_messages_non_empty() {
        let errors = [
            RecordError::Timeout,
            RecordError::Connection {
                details: "refused".to_string(),
            },
            RecordError::Api {
                message: "duplicate".to_string(),
            },
            RecordError::Http { status: 500 },
            RecordError::InvalidEmployeeId {
                id: "EMP".to_string(),
            },
        ];

        for error in errors {
            assert!(!error.user_message().is_empty());
        }
    }

    #[test]
    fn test_component_error_display() {
        let error = PointeuseError::component("reader", "open failed");
        assert!(error.to_string().contains("reader"));
        assert!(error.to_string().contains("open failed"));
    }

    #[test]
    fn test_reader_error_display() {
        let open = ReaderError::Open {
            device: "/dev/ttyUSB0".to_string(),
            details: "busy".to_string(),
        };
        assert!(open.to_string().contains("/dev/ttyUSB0"));
        assert!(ReaderError::NoDevice.to_string().contains("No reader"));
        assert!(ReaderError::Unavailable("serial").to_string().contains("serial"));
    }
}
