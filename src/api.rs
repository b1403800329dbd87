use crate::config::ApiConfig;
use crate::error::{PointeuseError, RecordError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Remote attendance store, as seen by the recorder and the session tracker.
///
/// The production implementation is [`ApiClient`]; tests substitute fakes.
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    /// Submit one attendance event. The server derives the direction itself;
    /// the terminal only reports who and when.
    async fn save_attendance(
        &self,
        employee_numeric_id: i64,
        date: &str,
        time: &str,
    ) -> Result<(), RecordError>;

    /// Fetch the per-employee day dashboard shown in consultation mode.
    async fn fetch_dashboard(
        &self,
        employee_numeric_id: i64,
        date: &str,
    ) -> Result<DashboardData, RecordError>;
}

#[derive(Debug, Serialize)]
struct SavePayload<'a> {
    id_emp: i64,
    id_compte: i64,
    date: &'a str,
    heure: &'a str,
}

#[derive(Debug, Deserialize)]
struct SaveResponse {
    success: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DashboardResponse {
    success: bool,
    #[serde(default)]
    data: Option<DashboardData>,
    #[serde(default)]
    error: Option<String>,
}

/// Day dashboard payload, field names as the PHP API emits them.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DashboardData {
    #[serde(default)]
    pub temps_travaille: WorkedTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkedTime {
    #[serde(default)]
    pub heures_realisees: String,
    #[serde(default)]
    pub heures_restantes: String,
    #[serde(default)]
    pub pointages_paires: Vec<PointagePair>,
}

/// One matched ENTREE/SORTIE pair of the day; `sortie` is absent while the
/// employee is still clocked in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointagePair {
    pub entree: String,
    #[serde(default)]
    pub sortie: Option<String>,
    #[serde(default)]
    pub duree: Option<String>,
}

/// HTTP client for the remote attendance API.
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    account_id: i64,
    api_key: String,
    save_timeout: Duration,
    dashboard_timeout: Duration,
}

impl ApiClient {
    pub fn new(config: &ApiConfig) -> Result<Self, PointeuseError> {
        let client = reqwest::Client::builder()
            // On-premise servers commonly run self-signed certificates.
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|e| PointeuseError::system(format!("HTTP client init failed: {e}")))?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            account_id: config.account_id,
            api_key: config.api_key.clone(),
            save_timeout: Duration::from_secs(config.timeout_seconds),
            dashboard_timeout: Duration::from_secs(config.dashboard_timeout_seconds),
        })
    }

    fn endpoint(&self, name: &str) -> String {
        format!("{}/{}", self.base_url, name)
    }
}

fn classify(e: reqwest::Error) -> RecordError {
    if e.is_timeout() {
        RecordError::Timeout
    } else {
        RecordError::Connection {
            details: e.to_string(),
        }
    }
}

#[async_trait]
impl RemoteGateway for ApiClient {
    async fn save_attendance(
        &self,
        employee_numeric_id: i64,
        date: &str,
        time: &str,
    ) -> Result<(), RecordError> {
        let payload = SavePayload {
            id_emp: employee_numeric_id,
            id_compte: self.account_id,
            date,
            heure: time,
        };
        debug!("Submitting attendance: {:?}", payload);

        let response = self
            .client
            .post(self.endpoint("api_save_pointage.php"))
            .header("X-API-Key", &self.api_key)
            .header("X-Account-ID", self.account_id.to_string())
            .timeout(self.save_timeout)
            .json(&payload)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            return Err(RecordError::Http {
                status: status.as_u16(),
            });
        }

        let body: SaveResponse = response.json().await.map_err(classify)?;
        if body.success {
            Ok(())
        } else {
            Err(RecordError::Api {
                message: body.error.unwrap_or_else(|| "unspecified error".to_string()),
            })
        }
    }

    async fn fetch_dashboard(
        &self,
        employee_numeric_id: i64,
        date: &str,
    ) -> Result<DashboardData, RecordError> {
        let response = self
            .client
            .get(self.endpoint("api_get_employee_dashboard.php"))
            .header("X-API-Key", &self.api_key)
            .header("X-Account-ID", self.account_id.to_string())
            .timeout(self.dashboard_timeout)
            .query(&[
                ("id_emp", employee_numeric_id.to_string()),
                ("date", date.to_string()),
            ])
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            return Err(RecordError::Http {
                status: status.as_u16(),
            });
        }

        let body: DashboardResponse = response.json().await.map_err(classify)?;
        if !body.success {
            return Err(RecordError::Api {
                message: body.error.unwrap_or_else(|| "unspecified error".to_string()),
            });
        }
        Ok(body.data.unwrap_or_default())
    }
}
