// Fanout configuration

use serde::{Deserialize, Serialize};

use crate::delivery::DelinquencyPolicy;
use crate::error::{EventlineError, Result};
use crate::fanout::FanoutKind;
use crate::retry::RetryPolicy;
use crate::webhook::{WebhookDispatcher, PERMITTED_ACTIONS};

/// Retry budgets, delinquency policy and the webhook allow-list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FanoutConfig {
    pub notify_retry: RetryPolicy,
    pub dispatch_retry: RetryPolicy,
    /// Delivery tasks only retry storage failures; HTTP failures are final
    pub delivery_retry: RetryPolicy,
    pub delinquency: DelinquencyPolicy,
    pub permitted_actions: Vec<String>,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            notify_retry: RetryPolicy::exponential(),
            dispatch_retry: RetryPolicy::exponential(),
            delivery_retry: RetryPolicy::exponential().with_max_attempts(3),
            delinquency: DelinquencyPolicy::default(),
            permitted_actions: PERMITTED_ACTIONS.iter().map(|a| a.to_string()).collect(),
        }
    }
}

impl FanoutConfig {
    pub fn retry_policy(&self, kind: FanoutKind) -> &RetryPolicy {
        match kind {
            FanoutKind::Notify => &self.notify_retry,
            FanoutKind::DispatchWebhooks => &self.dispatch_retry,
            FanoutKind::DeliverWebhook => &self.delivery_retry,
        }
    }

    /// The allow-list can only be narrowed, never widened
    pub fn validate(&self) -> Result<()> {
        if let Some(action) = self
            .permitted_actions
            .iter()
            .find(|a| !PERMITTED_ACTIONS.contains(&a.as_str()))
        {
            return Err(EventlineError::config(format!(
                "action {action} can't be permitted for webhooks"
            )));
        }
        if self.delinquency.threshold == 0 {
            return Err(EventlineError::config(
                "delinquency threshold must be at least 1",
            ));
        }
        Ok(())
    }

    pub fn dispatcher(&self) -> WebhookDispatcher {
        WebhookDispatcher::new(self.permitted_actions.iter().cloned())
            .with_delivery_max_attempts(self.delivery_retry.max_attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        FanoutConfig::default().validate().unwrap();
    }

    #[test]
    fn test_rejects_widened_allow_list() {
        let config = FanoutConfig {
            permitted_actions: vec!["card_internal".into()],
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(EventlineError::Configuration(_))
        ));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: FanoutConfig =
            serde_json::from_str(r#"{"delinquency": {"threshold": 3, "window": 60000}}"#).unwrap();

        assert_eq!(config.delinquency.threshold, 3);
        assert_eq!(config.notify_retry, RetryPolicy::exponential());
    }
}
