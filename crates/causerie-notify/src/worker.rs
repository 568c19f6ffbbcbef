use std::sync::Arc;

use causerie_shared::push::NotificationPayload;
use causerie_shared::Alias;
use causerie_store::{KeyPath, ReplicatedStore};
use serde_json::json;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

use crate::dispatch::{DeliveryOutcome, Dispatcher};

/// One queued notification: who gets it, what they see, and which
/// records get their notified flag flipped once it lands.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub recipient: Alias,
    pub payload: NotificationPayload,
    pub mark: Vec<KeyPath>,
}

/// Drain the delivery queue, running up to `max_in_flight` deliveries
/// concurrently.  A delivery that exhausts its retries is logged and
/// dropped; the queue never backs up behind one unreachable recipient.
/// The task exits after the queue closes and every in-flight delivery
/// has finished.
pub fn spawn_dispatch_worker(
    mut queue: mpsc::Receiver<Delivery>,
    dispatcher: Arc<Dispatcher>,
    store: Arc<dyn ReplicatedStore>,
    max_in_flight: usize,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let limiter = Arc::new(Semaphore::new(max_in_flight));
        while let Some(delivery) = queue.recv().await {
            let permit = match Arc::clone(&limiter).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let dispatcher = Arc::clone(&dispatcher);
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                run_delivery(dispatcher, store, delivery).await;
                drop(permit);
            });
        }
        // Queue closed; wait for in-flight deliveries to land.
        let _ = limiter.acquire_many(max_in_flight as u32).await;
        tracing::debug!("delivery queue closed, dispatch worker exiting");
    })
}

async fn run_delivery(
    dispatcher: Arc<Dispatcher>,
    store: Arc<dyn ReplicatedStore>,
    delivery: Delivery,
) {
    match dispatcher.deliver(&delivery.recipient, &delivery.payload).await {
        Ok(DeliveryOutcome::Sent { delivered, pruned }) if delivered > 0 => {
            tracing::info!(
                user = %delivery.recipient,
                kind = ?delivery.payload.kind,
                delivered,
                pruned,
                "push delivered"
            );
            for path in &delivery.mark {
                if let Err(error) = store.put(&path.child("notified"), json!(true)).await {
                    tracing::warn!(%path, %error, "failed to write notified flag");
                }
            }
        }
        Ok(outcome) => {
            tracing::debug!(user = %delivery.recipient, ?outcome, "nothing delivered");
        }
        Err(error) => {
            tracing::warn!(user = %delivery.recipient, %error, "delivery abandoned");
        }
    }
}
