use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use tracing::{debug, warn};

use crate::client::DeviceManagement;
use crate::error::{MdmError, Result};
use crate::types::{Device, DeviceOutcome};

/// Issue one apply-profile call, bounded by `call_timeout`.
pub async fn push_profile(
    api: &dyn DeviceManagement,
    profile_id: &str,
    device_id: &str,
    call_timeout: Duration,
) -> Result<()> {
    match tokio::time::timeout(call_timeout, api.apply_profile(profile_id, device_id)).await {
        Ok(result) => result,
        Err(_) => Err(MdmError::Timeout {
            ms: call_timeout.as_millis() as u64,
        }),
    }
}

/// Push `profile_id` to every device with at most `max_in_flight` calls outstanding.
///
/// Each device's outcome is captured independently; outcomes are returned in
/// the same order as `devices`.
pub async fn push_to_devices(
    api: &dyn DeviceManagement,
    profile_id: &str,
    devices: &[Device],
    max_in_flight: usize,
    call_timeout: Duration,
) -> Vec<DeviceOutcome> {
    // Built eagerly; mapping the stream over `&Device` makes callers `!Send`.
    let pushes: Vec<_> = devices
        .iter()
        .map(|device| async move {
            match push_profile(api, profile_id, &device.id, call_timeout).await {
                Ok(()) => {
                    debug!(profile_id, device_id = %device.id, "profile applied");
                    DeviceOutcome::ok(&device.id)
                }
                Err(e) => {
                    warn!(profile_id, device_id = %device.id, error = %e, "profile push failed");
                    DeviceOutcome::failed(&device.id, e.to_string())
                }
            }
        })
        .collect();

    stream::iter(pushes)
        .buffered(max_in_flight.max(1))
        .collect()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails pushes to device ids starting with "bad"; tracks peak concurrency.
    struct Recorder {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    impl Recorder {
        fn new() -> Self {
            Self {
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl DeviceManagement for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }
        async fn list_devices(&self) -> crate::Result<Vec<Device>> {
            Ok(Vec::new())
        }
        async fn apply_profile(&self, _profile_id: &str, device_id: &str) -> crate::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if device_id.starts_with("bad") {
                Err(MdmError::Api {
                    status: 409,
                    message: "profile conflict".to_string(),
                })
            } else {
                Ok(())
            }
        }
    }

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn fan_out_future_is_send() {
        let api = Recorder::new();
        let targets = devices(&["a"]);
        let fut = push_to_devices(&api, "vpn", &targets, 1, Duration::from_secs(1));
        assert_send(&fut);
    }

    fn devices(ids: &[&str]) -> Vec<Device> {
        ids.iter().map(|id| Device::new(*id, *id)).collect()
    }

    #[tokio::test]
    async fn outcomes_are_captured_per_device_in_order() {
        let api = Recorder::new();
        let outcomes = push_to_devices(
            &api,
            "vpn",
            &devices(&["a", "bad-1", "b"]),
            4,
            Duration::from_secs(5),
        )
        .await;

        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0], DeviceOutcome::ok("a"));
        assert!(!outcomes[1].success);
        assert_eq!(
            outcomes[1].error.as_deref(),
            Some("API error (409): profile conflict")
        );
        assert_eq!(outcomes[2], DeviceOutcome::ok("b"));
    }

    #[tokio::test]
    async fn fan_out_respects_in_flight_limit() {
        let api = Recorder::new();
        let ids: Vec<String> = (0..12).map(|i| format!("dev-{i}")).collect();
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let outcomes = push_to_devices(&api, "vpn", &devices(&refs), 3, Duration::from_secs(5)).await;

        assert!(outcomes.iter().all(|o| o.success));
        assert_eq!(api.calls.load(Ordering::SeqCst), 12);
        assert!(api.peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn empty_target_set_issues_no_calls() {
        let api = Recorder::new();
        let outcomes = push_to_devices(&api, "vpn", &[], 4, Duration::from_secs(5)).await;
        assert!(outcomes.is_empty());
        assert_eq!(api.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_device_times_out() {
        let api = Recorder::new();
        let err = push_profile(&api, "vpn", "a", Duration::from_millis(1))
            .await
            .unwrap_err();
        assert!(matches!(err, MdmError::Timeout { ms: 1 }));
    }
}
