use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use causerie_shared::push::{NotificationKind, NotificationPayload};
use causerie_shared::Alias;
use causerie_store::KeyPath;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::worker::Delivery;

type DebounceKey = (Alias, NotificationKind);

struct Pending {
    payload: NotificationPayload,
    mark: Vec<KeyPath>,
    timer: JoinHandle<()>,
}

/// Collapses a burst of notifications into one push per recipient and
/// kind.  Every schedule within the window replaces the payload (the
/// newest message wins) and restarts the timer; the mark paths of the
/// replaced entries are kept so every coalesced record still gets its
/// notified flag once the push goes out.
pub struct DebounceCoalescer {
    pending: Arc<Mutex<HashMap<DebounceKey, Pending>>>,
    out: mpsc::Sender<Delivery>,
    window: Duration,
}

impl DebounceCoalescer {
    pub fn new(out: mpsc::Sender<Delivery>, window: Duration) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            out,
            window,
        }
    }

    /// Queue `payload` for `recipient`, starting or restarting the
    /// coalescing window for its kind.
    pub async fn schedule(
        &self,
        recipient: Alias,
        payload: NotificationPayload,
        mark: Vec<KeyPath>,
    ) {
        let key = (recipient, payload.kind);
        let mut pending = self.pending.lock().await;

        let mark = match pending.remove(&key) {
            Some(prev) => {
                prev.timer.abort();
                let mut merged = prev.mark;
                for path in mark {
                    if !merged.contains(&path) {
                        merged.push(path);
                    }
                }
                merged
            }
            None => mark,
        };

        let timer = tokio::spawn(fire_after(
            self.window,
            key.clone(),
            Arc::clone(&self.pending),
            self.out.clone(),
        ));
        pending.insert(key, Pending { payload, mark, timer });
    }
}

/// Timer body.  Removing the entry under the same lock `schedule` uses
/// means a concurrent reschedule either aborts us before the removal or
/// sees an already-fired window; we never deliver a payload that was
/// superseded.
async fn fire_after(
    window: Duration,
    key: DebounceKey,
    pending: Arc<Mutex<HashMap<DebounceKey, Pending>>>,
    out: mpsc::Sender<Delivery>,
) {
    tokio::time::sleep(window).await;
    let fired = pending.lock().await.remove(&key);
    if let Some(entry) = fired {
        let delivery = Delivery {
            recipient: key.0,
            payload: entry.payload,
            mark: entry.mark,
        };
        if out.send(delivery).await.is_err() {
            tracing::warn!("dispatch queue closed, dropping coalesced notification");
        }
    }
}
