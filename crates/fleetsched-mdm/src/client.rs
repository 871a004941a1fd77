use std::time::Duration;

use async_trait::async_trait;
use fleetsched_core::config::MdmConfig;
use reqwest::Url;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{MdmError, Result};
use crate::types::Device;

/// The two operations this engine consumes from the remote device-management API.
///
/// Implementations must be safe to call concurrently; the engine issues many
/// `apply_profile` calls at once for a single job.
#[async_trait]
pub trait DeviceManagement: Send + Sync {
    /// Name for logging and error messages.
    fn name(&self) -> &str;

    /// Fetch the full device directory (optionally scoped by the client's configuration).
    async fn list_devices(&self) -> Result<Vec<Device>>;

    /// Apply configuration profile `profile_id` to device `device_id`.
    async fn apply_profile(&self, profile_id: &str, device_id: &str) -> Result<()>;
}

/// REST client authenticated with a static bearer token.
pub struct HttpDeviceManagement {
    client: reqwest::Client,
    base_url: String,
    api_token: String,
    directory_id: Option<String>,
}

impl HttpDeviceManagement {
    pub fn new(
        base_url: String,
        api_token: String,
        directory_id: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url,
            api_token,
            directory_id,
        })
    }

    pub fn from_config(cfg: &MdmConfig) -> Result<Self> {
        Self::new(
            cfg.base_url.clone(),
            cfg.api_token.clone(),
            cfg.directory_id.clone(),
            Duration::from_secs(cfg.request_timeout_secs),
        )
    }

    /// Append percent-encoded path segments to the configured base URL.
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| MdmError::Parse(format!("invalid base url {}: {e}", self.base_url)))?;
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| MdmError::Parse(format!("base url {} cannot carry a path", self.base_url)))?;
            path.pop_if_empty().extend(segments);
        }
        Ok(url)
    }
}

/// The directory endpoint returns either a bare array or `{ "devices": [...] }`.
#[derive(Deserialize)]
#[serde(untagged)]
enum DeviceListResponse {
    Bare(Vec<Device>),
    Wrapped { devices: Vec<Device> },
}

impl DeviceListResponse {
    fn into_devices(self) -> Vec<Device> {
        match self {
            DeviceListResponse::Bare(devices) => devices,
            DeviceListResponse::Wrapped { devices } => devices,
        }
    }
}

#[async_trait]
impl DeviceManagement for HttpDeviceManagement {
    fn name(&self) -> &str {
        "http"
    }

    async fn list_devices(&self) -> Result<Vec<Device>> {
        let url = self.endpoint(&["devices"])?;
        debug!(%url, directory = ?self.directory_id, "listing devices");

        let mut req = self.client.get(url).bearer_auth(&self.api_token);
        if let Some(ref dir) = self.directory_id {
            req = req.query(&[("directory_id", dir)]);
        }
        let resp = req.send().await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "device directory API error");
            return Err(MdmError::Api {
                status,
                message: text,
            });
        }

        let body: DeviceListResponse = resp
            .json()
            .await
            .map_err(|e| MdmError::Parse(e.to_string()))?;
        Ok(body.into_devices())
    }

    async fn apply_profile(&self, profile_id: &str, device_id: &str) -> Result<()> {
        let url = self.endpoint(&["devices", device_id, "profiles"])?;
        debug!(%url, profile_id, device_id, "applying profile");

        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.api_token)
            .json(&serde_json::json!({ "profile_id": profile_id }))
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(MdmError::Api {
                status,
                message: text,
            });
        }
        Ok(())
    }
}
