//! Pump controller access. The reconciler talks to the pump only through
//! the [`Actuator`] trait; [`HttpActuator`] is the real implementation for a
//! relay board that serves a small JSON API:
//!
//! | call     | request                                  | reply               |
//! |----------|------------------------------------------|---------------------|
//! | start    | `POST pump/start {"duration","type"}`    | `{"success": bool}` |
//! | stop     | `POST pump/stop`                         | `{"success": bool}` |
//! | status   | `GET pump/status`                        | `{"running": bool}` |

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use url::Url;

use crate::error::{DeviceError, ValidationError};
use crate::irrigation::Origin;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PumpStatus {
    pub running: bool,
}

#[async_trait]
pub trait Actuator: Send + Sync {
    async fn start(&self, duration_minutes: u32, origin: Origin) -> Result<(), DeviceError>;
    async fn stop(&self) -> Result<(), DeviceError>;
    async fn status(&self) -> Result<PumpStatus, DeviceError>;
}

// ---------------------------------------------------------------------------
// Device registry
// ---------------------------------------------------------------------------

/// Where the pump controller lives. Empty until configured or until the
/// device registers itself.
#[derive(Clone, Default)]
pub struct DeviceRegistry {
    endpoint: Arc<RwLock<Option<Url>>>,
}

impl DeviceRegistry {
    pub async fn register(&self, raw: &str) -> Result<Url, ValidationError> {
        let url = parse_endpoint(raw)?;
        *self.endpoint.write().await = Some(url.clone());
        tracing::info!(endpoint = %url, "pump controller registered");
        Ok(url)
    }

    pub async fn endpoint(&self) -> Option<Url> {
        self.endpoint.read().await.clone()
    }
}

/// Accept `http(s)://host[:port][/prefix]`; the path always ends in `/` so
/// relative joins stay under the prefix.
pub(crate) fn parse_endpoint(raw: &str) -> Result<Url, ValidationError> {
    let mut url =
        Url::parse(raw.trim()).map_err(|e| ValidationError::InvalidUrl(format!("{raw}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(ValidationError::InvalidUrl(format!(
            "{raw}: expected http(s)://host"
        )));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct StartBody {
    duration: u32,
    #[serde(rename = "type")]
    origin: Origin,
}

#[derive(Deserialize, Default)]
struct CommandAck {
    success: Option<bool>,
}

pub struct HttpActuator {
    client: Client,
    registry: DeviceRegistry,
    timeout: Duration,
}

impl HttpActuator {
    pub fn new(registry: DeviceRegistry, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to create pump controller HTTP client")?;
        Ok(Self {
            client,
            registry,
            timeout,
        })
    }

    async fn url(&self, path: &str) -> Result<Url, DeviceError> {
        let base = self.registry.endpoint().await.ok_or(DeviceError::Unavailable)?;
        base.join(path)
            .map_err(|e| DeviceError::Connection(format!("bad device url: {e}")))
    }

    fn classify(&self, e: reqwest::Error) -> DeviceError {
        if e.is_timeout() {
            DeviceError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            }
        } else {
            DeviceError::Connection(e.to_string())
        }
    }

    /// Non-2xx, or a 2xx carrying `"success": false`, is a rejection.
    async fn expect_ack(&self, response: Response) -> Result<(), DeviceError> {
        let status = response.status();
        if !status.is_success() {
            return Err(DeviceError::Rejected {
                status: status.as_u16(),
            });
        }
        let body = response.text().await.map_err(|e| self.classify(e))?;
        let ack: CommandAck = serde_json::from_str(&body).unwrap_or_default();
        if ack.success == Some(false) {
            return Err(DeviceError::Rejected {
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Actuator for HttpActuator {
    async fn start(&self, duration_minutes: u32, origin: Origin) -> Result<(), DeviceError> {
        let url = self.url("pump/start").await?;
        let response = self
            .client
            .post(url)
            .json(&StartBody {
                duration: duration_minutes,
                origin,
            })
            .send()
            .await
            .map_err(|e| self.classify(e))?;
        self.expect_ack(response).await
    }

    async fn stop(&self) -> Result<(), DeviceError> {
        let url = self.url("pump/stop").await?;
        let response = self
            .client
            .post(url)
            .send()
            .await
            .map_err(|e| self.classify(e))?;
        self.expect_ack(response).await
    }

    async fn status(&self) -> Result<PumpStatus, DeviceError> {
        let url = self.url("pump/status").await?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.classify(e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(DeviceError::Rejected {
                status: status.as_u16(),
            });
        }
        response
            .json::<PumpStatus>()
            .await
            .map_err(|e| DeviceError::InvalidResponse(e.to_string()))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
