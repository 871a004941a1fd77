use serde::{Deserialize, Serialize};

/// A managed device as reported by the directory. Resolved per run, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

impl Device {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Result of pushing one profile to one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceOutcome {
    pub device_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeviceOutcome {
    pub fn ok(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            success: true,
            error: None,
        }
    }

    pub fn failed(device_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            success: false,
            error: Some(reason.into()),
        }
    }
}
