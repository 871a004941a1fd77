use std::time::Duration;

use tracing::{debug, warn};

use crate::client::DeviceManagement;
use crate::error::MdmError;
use crate::filter::DeviceFilter;
use crate::types::Device;

/// Target set for one job. `degraded` carries the reason when resolution
/// failed and the set was forced empty.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub devices: Vec<Device>,
    pub degraded: Option<String>,
}

impl Resolution {
    fn empty_because(reason: String) -> Self {
        Self {
            devices: Vec::new(),
            degraded: Some(reason),
        }
    }
}

/// Resolve a job's stored filter to concrete devices.
///
/// Never fails: a malformed filter, a directory error or a timeout all yield
/// an empty target set, so a broken filter applies to nobody rather than to
/// the whole fleet. An absent filter targets the full directory.
pub async fn resolve_devices(
    api: &dyn DeviceManagement,
    filter: Option<&str>,
    call_timeout: Duration,
) -> Resolution {
    let filter = match filter.map(DeviceFilter::parse).transpose() {
        Ok(f) => f.unwrap_or_default(),
        Err(e) => {
            warn!(error = %e, "malformed device filter, targeting no devices");
            return Resolution::empty_because(format!("malformed device filter: {e}"));
        }
    };

    for ignored in filter.ignored() {
        debug!(predicate = ?ignored, "device filter predicate has no evaluation logic");
    }

    let listed = match tokio::time::timeout(call_timeout, api.list_devices()).await {
        Ok(result) => result,
        Err(_) => Err(MdmError::Timeout {
            ms: call_timeout.as_millis() as u64,
        }),
    };

    match listed {
        Ok(all) => {
            let total = all.len();
            let devices = filter.apply(all);
            debug!(
                provider = api.name(),
                total,
                targeted = devices.len(),
                "device directory resolved"
            );
            Resolution {
                devices,
                degraded: None,
            }
        }
        Err(e) => {
            warn!(provider = api.name(), error = %e, "device directory fetch failed, targeting no devices");
            Resolution::empty_because(format!("device directory unavailable: {e}"))
        }
    }
}
