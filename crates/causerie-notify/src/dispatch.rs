use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use causerie_shared::constants::{PUSH_BACKOFF_START_SECS, PUSH_MAX_ATTEMPTS};
use causerie_shared::push::NotificationPayload;
use causerie_shared::{Alias, DeviceId};
use futures::future::join_all;

use crate::devices::DeviceRegistry;
use crate::error::{NotifyError, PushError};
use crate::gateway::PushGateway;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, the first try included.
    pub max_attempts: u32,
    /// Backoff before the second attempt; doubles per further attempt.
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: PUSH_MAX_ATTEMPTS,
            initial_backoff: Duration::from_secs(PUSH_BACKOFF_START_SECS),
        }
    }
}

impl RetryPolicy {
    /// Pause before `attempt` (1-based; attempt 1 never waits).
    pub fn delay_before(&self, attempt: u32) -> Duration {
        self.initial_backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(2)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The recipient has no registered devices.  Not an error: users who
    /// never granted push permission simply do not get pushes.
    NoDevices,
    Sent { delivered: usize, pruned: usize },
}

/// Pushes one payload to every device of a recipient, with bounded
/// retries for transient failures and immediate pruning of dead
/// subscriptions.
pub struct Dispatcher {
    registry: DeviceRegistry,
    gateway: Arc<dyn PushGateway>,
    policy: RetryPolicy,
}

impl Dispatcher {
    pub fn new(registry: DeviceRegistry, gateway: Arc<dyn PushGateway>, policy: RetryPolicy) -> Self {
        Self {
            registry,
            gateway,
            policy,
        }
    }

    /// Deliver `payload` to `recipient`.  Each device gets the push at
    /// most once; devices are re-resolved per attempt so registrations
    /// added or pruned mid-delivery are honored.
    pub async fn deliver(
        &self,
        recipient: &Alias,
        payload: &NotificationPayload,
    ) -> Result<DeliveryOutcome, NotifyError> {
        let mut delivered: HashSet<DeviceId> = HashSet::new();
        let mut pruned = 0usize;
        let mut last_failure = String::from("no attempt made");

        for attempt in 1..=self.policy.max_attempts {
            if attempt > 1 {
                tokio::time::sleep(self.policy.delay_before(attempt)).await;
            }

            let devices = self.registry.devices_for(recipient).await?;
            if attempt == 1 && devices.is_empty() {
                tracing::debug!(user = %recipient, "no registered devices, skipping push");
                return Ok(DeliveryOutcome::NoDevices);
            }

            let targets: Vec<_> = devices
                .into_iter()
                .filter(|device| !delivered.contains(&device.device_id))
                .collect();
            if targets.is_empty() {
                break;
            }

            let results = join_all(targets.iter().map(|device| async move {
                self.gateway.push(&device.subscription, payload).await
            }))
            .await;

            let mut transient = 0usize;
            for (device, result) in targets.iter().zip(results) {
                match result {
                    Ok(()) => {
                        delivered.insert(device.device_id.clone());
                    }
                    Err(PushError::Gone) => {
                        tracing::warn!(
                            user = %recipient,
                            device = %device.device_id,
                            "subscription gone, pruning device"
                        );
                        self.registry.remove(recipient, &device.device_id).await?;
                        pruned += 1;
                    }
                    Err(PushError::Transient(reason)) => {
                        tracing::debug!(
                            user = %recipient,
                            device = %device.device_id,
                            attempt,
                            %reason,
                            "push attempt failed"
                        );
                        last_failure = reason;
                        transient += 1;
                    }
                }
            }

            if transient == 0 {
                break;
            }
            if attempt == self.policy.max_attempts {
                if delivered.is_empty() {
                    return Err(NotifyError::AttemptsExhausted {
                        attempts: attempt,
                        last: last_failure,
                    });
                }
                tracing::warn!(
                    user = %recipient,
                    unreached = transient,
                    "giving up on devices still failing after final attempt"
                );
            }
        }

        Ok(DeliveryOutcome::Sent {
            delivered: delivered.len(),
            pruned,
        })
    }
}
