use crate::auth::Credential;
use crate::errors::{Error, Result};
use crate::model::{Alert, ConfigUpdate, DailyStat, DeviceTelemetry, HourlyStat, PumpCommand, PumpUsage};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, error};

/// Backend request channel: commands and read-only queries.
#[async_trait]
pub trait DeviceApi: Send + Sync {
    async fn set_pump(&self, command: &PumpCommand) -> Result<()>;
    async fn update_config(&self, update: &ConfigUpdate) -> Result<()>;

    async fn latest_telemetry(&self) -> Result<DeviceTelemetry>;
    /// Most recent first.
    async fn recent_alerts(&self) -> Result<Vec<Alert>>;
    async fn hourly_stats(&self) -> Result<Vec<HourlyStat>>;
    async fn daily_stats(&self) -> Result<Vec<DailyStat>>;
    async fn daily_pump_usage(&self) -> Result<Vec<PumpUsage>>;
}

/// [`DeviceApi`] over HTTP with a bearer credential.
pub struct HttpApi {
    client: Client,
    base_url: String,
    credential: Credential,
}

impl HttpApi {
    pub fn new(base_url: &str, credential: Credential, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credential,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.bearer_auth(self.credential.token())
    }

    async fn command<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<()> {
        debug!("POST {}", path);
        let response = self
            .authorized(self.client.post(self.url(path)))
            .json(body)
            .send()
            .await
            .map_err(|e| Error::CommandFailure(describe(path, &e)))?;

        check_status(path, response, Error::CommandFailure).await?;
        Ok(())
    }

    async fn query<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        debug!("GET {}", path);
        let response = self
            .authorized(self.client.get(self.url(path)))
            .send()
            .await
            .map_err(|e| Error::Query(describe(path, &e)))?;

        let response = check_status(path, response, Error::Query).await?;
        response.json::<T>().await.map_err(|e| {
            error!("Invalid response body from {}: {}", path, e);
            Error::Query(format!("{} returned an invalid body: {}", path, e))
        })
    }
}

#[async_trait]
impl DeviceApi for HttpApi {
    async fn set_pump(&self, command: &PumpCommand) -> Result<()> {
        self.command("/control/pump", command).await
    }

    async fn update_config(&self, update: &ConfigUpdate) -> Result<()> {
        self.command("/control/config", update).await
    }

    async fn latest_telemetry(&self) -> Result<DeviceTelemetry> {
        self.query("/telemetry/latest").await
    }

    async fn recent_alerts(&self) -> Result<Vec<Alert>> {
        self.query("/telemetry/alerts").await
    }

    async fn hourly_stats(&self) -> Result<Vec<HourlyStat>> {
        self.query("/telemetry/hourly").await
    }

    async fn daily_stats(&self) -> Result<Vec<DailyStat>> {
        self.query("/telemetry/daily").await
    }

    async fn daily_pump_usage(&self) -> Result<Vec<PumpUsage>> {
        self.query("/telemetry/pump/daily").await
    }
}

fn describe(path: &str, err: &reqwest::Error) -> String {
    if err.is_timeout() {
        format!("{} timed out", path)
    } else if err.is_connect() {
        format!("{} is unreachable: {}", path, err)
    } else {
        format!("{} failed: {}", path, err)
    }
}

async fn check_status(
    path: &str,
    response: Response,
    failure: fn(String) -> Error,
) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(classify_status(path, status, body.trim(), failure))
}

fn classify_status(path: &str, status: StatusCode, body: &str, failure: fn(String) -> Error) -> Error {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Error::Auth(format!("{} answered {}", path, status))
        }
        _ if body.is_empty() => failure(format!("{} answered {}", path, status)),
        _ => failure(format!("{} answered {}: {}", path, status, body)),
    }
}
