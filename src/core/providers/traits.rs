use std::{future::Future, time::Duration};

use super::error::{DeviceError, ProviderError};
use crate::core::homeassistant::{self, DeviceInformation, EntityConfigurationSet};

/// State published after a successful poll, serialized as the state topic's JSON body.
pub type Observations = serde_json::Value;

/// Upper bound of a single `health` call.
pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(3);

/// The contract every device integration implements.
///
/// A provider is constructed with its settings, configured exactly once at
/// startup, polled by its own executor task until shutdown, and closed once
/// after that task has stopped. It keeps no poll results itself: the last
/// observed state belongs to the executor that polls it.
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    /// Configuration key and startup-table label, e.g. `zever_solar_tlc5000`.
    fn id(&self) -> &'static str;

    /// Stable unique name. Used as the readiness key and in every topic.
    fn name(&self) -> &str;

    /// Validates settings and builds the device client.
    ///
    /// A disabled provider is a valid outcome, not an error: it returns `Ok`
    /// and afterwards reports `None` from [`Provider::entity_configuration_set`].
    fn configure(&mut self) -> Result<(), ProviderError>;

    fn is_enabled(&self) -> bool;

    fn state_topic(&self) -> String {
        homeassistant::state_topic(self.name())
    }

    fn availability_topic(&self) -> String {
        homeassistant::availability_topic(self.name())
    }

    /// Poll cadence, or `None` while disabled.
    fn interval(&self) -> Option<Duration>;

    fn device_metadata(&self) -> DeviceInformation;

    /// Discovery schema, or `None` while disabled. The manager skips providers returning `None`.
    fn entity_configuration_set(&self) -> Option<EntityConfigurationSet>;

    /// Interrogates the device once, within the provider's request timeout.
    ///
    /// - `Ok(Some(state))`: publish `state`, then `online`
    /// - `Ok(None)`: the device is temporarily unreachable; `offline`, no error log
    /// - `Err(_)`: unexpected failure; `offline` and an error log
    async fn poll(&self) -> Result<Option<Observations>, ProviderError>;

    /// Short independent check for the readiness endpoint.
    async fn health(&self) -> Result<serde_json::Value, ProviderError>;

    /// Releases device resources. Called once, after polling has stopped.
    async fn close(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}

/// Runs a device request with a deadline; running out of time counts as unreachable.
pub async fn bounded<T, F>(limit: Duration, request: F) -> Result<T, DeviceError>
where
    F: Future<Output = Result<T, DeviceError>>,
{
    tokio::time::timeout(limit, request)
        .await
        .map_err(|_| DeviceError::Unreachable(format!("no answer within {limit:?}")))?
}

/// Maps a device outcome to the poll contract: transient failures become `Ok(None)`.
pub fn poll_outcome<T>(
    result: Result<T, DeviceError>,
    into_state: impl FnOnce(T) -> Result<Observations, ProviderError>,
) -> Result<Option<Observations>, ProviderError> {
    match result {
        Ok(reading) => into_state(reading).map(Some),
        Err(e) if e.is_transient() => {
            tracing::debug!(error = %e, "Device temporarily unavailable");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bounded_turns_slow_request_into_unreachable() {
        let result: Result<(), _> = bounded(Duration::from_millis(20), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(DeviceError::Unreachable(_))));
    }

    #[test]
    fn test_poll_outcome_mapping() {
        let ok = poll_outcome(Ok(7), |v| Ok(serde_json::json!({ "v": v }))).unwrap();
        assert_eq!(ok, Some(serde_json::json!({"v": 7})));

        let transient =
            poll_outcome::<u8>(Err(DeviceError::Unreachable("down".into())), |_| unreachable!());
        assert!(matches!(transient, Ok(None)));

        let failed = poll_outcome::<u8>(Err(DeviceError::Status(500)), |_| unreachable!());
        assert!(matches!(
            failed,
            Err(ProviderError::Device(DeviceError::Status(500)))
        ));
    }
}
