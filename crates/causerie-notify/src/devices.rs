use std::sync::Arc;

use causerie_shared::constants::STORE_META_KEY;
use causerie_shared::records::{DeviceRecord, PushSubscription};
use causerie_shared::{Alias, DeviceId};
use causerie_store::{KeyPath, ReplicatedStore, StoreError};

/// A deliverable device: the registry child key plus its subscription.
#[derive(Debug, Clone)]
pub struct Device {
    pub device_id: DeviceId,
    pub subscription: PushSubscription,
}

/// View over `users/{alias}/devices`.  Listing resolves the store fresh
/// every time so pruned devices disappear immediately; only the
/// dispatcher removes entries, the router merely reads.
#[derive(Clone)]
pub struct DeviceRegistry {
    store: Arc<dyn ReplicatedStore>,
}

impl DeviceRegistry {
    pub fn new(store: Arc<dyn ReplicatedStore>) -> Self {
        Self { store }
    }

    /// Current deliverable devices of `alias`.  Registrations without a
    /// subscription, and records that fail to parse, are skipped.
    pub async fn devices_for(&self, alias: &Alias) -> Result<Vec<Device>, StoreError> {
        let listed = self.store.children(&KeyPath::user_devices(alias)).await?;
        let mut devices = Vec::with_capacity(listed.len());
        for (key, value) in listed {
            if key == STORE_META_KEY || value.is_null() {
                continue;
            }
            let record: DeviceRecord = match serde_json::from_value(value) {
                Ok(record) => record,
                Err(error) => {
                    tracing::debug!(user = %alias, device = %key, %error, "skipping malformed device record");
                    continue;
                }
            };
            let subscription = match record.subscription {
                Some(subscription) => subscription,
                None => {
                    tracing::debug!(user = %alias, device = %key, "device has no push subscription");
                    continue;
                }
            };
            devices.push(Device {
                device_id: DeviceId(key),
                subscription,
            });
        }
        Ok(devices)
    }

    pub async fn register(
        &self,
        alias: &Alias,
        device_id: &DeviceId,
        record: &DeviceRecord,
    ) -> Result<(), StoreError> {
        let value =
            serde_json::to_value(record).map_err(|e| StoreError::Backend(e.to_string()))?;
        self.store
            .put(&KeyPath::user_device(alias, device_id), value)
            .await
    }

    /// Drop a device whose subscription the provider reported gone.  The
    /// entry never comes back without a fresh registration.
    pub async fn remove(&self, alias: &Alias, device_id: &DeviceId) -> Result<(), StoreError> {
        tracing::info!(user = %alias, device = %device_id, "removing invalidated device");
        self.store
            .remove(&KeyPath::user_device(alias, device_id))
            .await
    }
}
