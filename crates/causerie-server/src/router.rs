//! Event router: one sequential loop behind every graph subscription.
//!
//! Watcher tasks per namespace forward raw child events into a single
//! funnel channel; the router consumes them in order, parses, consults the
//! idempotency cache, and hands off.  Handlers never await push delivery:
//! notifications go to the bounded dispatch queue and call signaling goes
//! to the engine, so a slow push provider or a busy call cannot stall
//! ingestion.

use std::collections::HashSet;
use std::sync::Arc;

use causerie_notify::{DebounceCoalescer, Delivery, EventClass, IdempotencyCache};
use causerie_shared::constants::{CHANNEL_CAPACITY, STORE_META_KEY};
use causerie_shared::push::NotificationPayload;
use causerie_shared::records::{
    CallRecord, ContactAcceptanceRecord, ContactRequestRecord, GroupInvitationRecord, GroupRecord,
    MessageRecord,
};
use causerie_shared::{Alias, CallId, ChatId, GroupId};
use causerie_signal::SignalCommand;
use causerie_store::{KeyPath, ReplicatedStore};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

enum RouterEvent {
    Call {
        call_id: String,
        value: Value,
    },
    ChatMessage {
        chat_id: String,
        message_id: String,
        value: Value,
    },
    GroupMessage {
        group_id: String,
        message_id: String,
        value: Value,
    },
    InboxItem {
        alias: String,
        kind: InboxKind,
        item_id: String,
        value: Value,
    },
}

/// The three per-user one-shot namespaces.
#[derive(Clone, Copy, PartialEq, Eq)]
enum InboxKind {
    ContactRequest,
    ContactAcceptance,
    GroupInvitation,
}

impl InboxKind {
    fn namespace(self) -> &'static str {
        match self {
            InboxKind::ContactRequest => "contactRequests",
            InboxKind::ContactAcceptance => "contactAcceptances",
            InboxKind::GroupInvitation => "groupInvitations",
        }
    }

    fn path(self, alias: &Alias) -> KeyPath {
        match self {
            InboxKind::ContactRequest => KeyPath::contact_requests(alias),
            InboxKind::ContactAcceptance => KeyPath::contact_acceptances(alias),
            InboxKind::GroupInvitation => KeyPath::group_invitations(alias),
        }
    }
}

/// Start the event router in a background tokio task.
///
/// Every top-level watcher is registered before this function returns, so
/// a graph write done afterwards is guaranteed to be observed.  Nested
/// watchers (per chat thread, per group, per user inbox) are registered
/// on first discovery; subscription replay covers whatever arrived before
/// that.
pub async fn spawn_router(
    store: Arc<dyn ReplicatedStore>,
    cache: Arc<Mutex<IdempotencyCache>>,
    coalescer: DebounceCoalescer,
    deliveries: mpsc::Sender<Delivery>,
    local_alias: Option<Alias>,
    engine: Option<mpsc::Sender<SignalCommand>>,
) -> JoinHandle<()> {
    let (event_tx, mut event_rx) = mpsc::channel::<RouterEvent>(CHANNEL_CAPACITY);

    spawn_call_watcher(Arc::clone(&store), event_tx.clone()).await;
    spawn_two_level_watcher(
        Arc::clone(&store),
        event_tx.clone(),
        KeyPath::chats(),
        |chat_id, message_id, value| RouterEvent::ChatMessage {
            chat_id,
            message_id,
            value,
        },
    )
    .await;
    spawn_two_level_watcher(
        Arc::clone(&store),
        event_tx.clone(),
        KeyPath::group_chats(),
        |group_id, message_id, value| RouterEvent::GroupMessage {
            group_id,
            message_id,
            value,
        },
    )
    .await;
    spawn_user_discovery(Arc::clone(&store), event_tx).await;

    let router = Router {
        store,
        cache,
        coalescer,
        deliveries,
        local_alias,
        engine,
    };
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                RouterEvent::Call { call_id, value } => {
                    router.on_call(call_id, value).await;
                }
                RouterEvent::ChatMessage {
                    chat_id,
                    message_id,
                    value,
                } => {
                    router.on_chat_message(chat_id, message_id, value).await;
                }
                RouterEvent::GroupMessage {
                    group_id,
                    message_id,
                    value,
                } => {
                    router.on_group_message(group_id, message_id, value).await;
                }
                RouterEvent::InboxItem {
                    alias,
                    kind,
                    item_id,
                    value,
                } => {
                    router.on_inbox_item(alias, kind, item_id, value).await;
                }
            }
        }
        info!("Event router terminated");
    })
}

async fn spawn_call_watcher(store: Arc<dyn ReplicatedStore>, events: mpsc::Sender<RouterEvent>) {
    let mut calls = store.watch_children(&KeyPath::calls()).await;
    tokio::spawn(async move {
        while let Some(event) = calls.recv().await {
            if event.value.is_null() {
                continue;
            }
            let forwarded = RouterEvent::Call {
                call_id: event.key,
                value: event.value,
            };
            if events.send(forwarded).await.is_err() {
                break;
            }
        }
    });
}

/// Watch a `{namespace}/{thread}/{message}` tree: the top watcher
/// discovers threads, a nested watcher per thread forwards its messages.
async fn spawn_two_level_watcher<F>(
    store: Arc<dyn ReplicatedStore>,
    events: mpsc::Sender<RouterEvent>,
    top: KeyPath,
    make: F,
) where
    F: Fn(String, String, Value) -> RouterEvent + Clone + Send + 'static,
{
    let mut threads = store.watch_children(&top).await;
    tokio::spawn(async move {
        let mut known = HashSet::new();
        while let Some(event) = threads.recv().await {
            if event.value.is_null() {
                continue;
            }
            if !known.insert(event.key.clone()) {
                continue;
            }
            let store = Arc::clone(&store);
            let events = events.clone();
            let make = make.clone();
            let thread_path = top.child(event.key.clone());
            let thread_id = event.key;
            tokio::spawn(async move {
                let mut messages = store.watch_children(&thread_path).await;
                while let Some(message) = messages.recv().await {
                    if message.value.is_null() {
                        continue;
                    }
                    let forwarded = make(thread_id.clone(), message.key, message.value);
                    if events.send(forwarded).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
}

async fn spawn_user_discovery(store: Arc<dyn ReplicatedStore>, events: mpsc::Sender<RouterEvent>) {
    let mut users = store.watch_children(&KeyPath::users()).await;
    tokio::spawn(async move {
        let mut known = HashSet::new();
        while let Some(event) = users.recv().await {
            if event.value.is_null() {
                continue;
            }
            if !known.insert(event.key.clone()) {
                continue;
            }
            for kind in [
                InboxKind::ContactRequest,
                InboxKind::ContactAcceptance,
                InboxKind::GroupInvitation,
            ] {
                let store = Arc::clone(&store);
                let events = events.clone();
                let alias = event.key.clone();
                tokio::spawn(async move {
                    let path = kind.path(&Alias::new(alias.clone()));
                    let mut items = store.watch_children(&path).await;
                    while let Some(item) = items.recv().await {
                        if item.value.is_null() {
                            continue;
                        }
                        let forwarded = RouterEvent::InboxItem {
                            alias: alias.clone(),
                            kind,
                            item_id: item.key,
                            value: item.value,
                        };
                        if events.send(forwarded).await.is_err() {
                            break;
                        }
                    }
                });
            }
        }
    });
}

struct Router {
    store: Arc<dyn ReplicatedStore>,
    cache: Arc<Mutex<IdempotencyCache>>,
    coalescer: DebounceCoalescer,
    deliveries: mpsc::Sender<Delivery>,
    local_alias: Option<Alias>,
    engine: Option<mpsc::Sender<SignalCommand>>,
}

impl Router {
    async fn on_call(&self, call_id: String, value: Value) {
        let record: CallRecord = match serde_json::from_value(value) {
            Ok(record) => record,
            Err(error) => {
                debug!(call = %call_id, %error, "skipping malformed call record");
                return;
            }
        };

        // Signaling for the locally hosted alias goes to the engine;
        // duplicates and echoes are its problem to absorb.
        if let (Some(engine), Some(local)) = (&self.engine, &self.local_alias) {
            if record.to == *local {
                let cmd = SignalCommand::Remote {
                    call_id: CallId(call_id.clone()),
                    record: record.clone(),
                };
                if engine.send(cmd).await.is_err() {
                    warn!("Call engine is gone, dropping signaling record");
                }
            }
        }

        // Only a standing, un-notified offer wakes the callee's devices.
        if !record.is_connecting_offer() || record.was_notified() {
            return;
        }
        if !self.first_time(EventClass::Call, &call_id).await {
            return;
        }

        let id = CallId(call_id);
        info!(call = %id, from = %record.from, to = %record.to, "notifying incoming call");
        let delivery = Delivery {
            recipient: record.to.clone(),
            payload: NotificationPayload::call(&id, &record),
            mark: vec![KeyPath::call(&id)],
        };
        self.enqueue(delivery).await;
    }

    async fn on_chat_message(&self, chat_id: String, message_id: String, value: Value) {
        if message_id == STORE_META_KEY {
            return;
        }
        let record: MessageRecord = match serde_json::from_value(value) {
            Ok(record) => record,
            Err(error) => {
                debug!(chat = %chat_id, message = %message_id, %error, "skipping malformed message");
                return;
            }
        };
        if record.notified {
            return;
        }

        let chat = ChatId(chat_id);
        let Some(recipient) = chat.other_party(&record.sender) else {
            debug!(chat = %chat, sender = %record.sender, "sender is not part of this thread");
            return;
        };
        let Some(preview) = record.preview() else {
            debug!(chat = %chat, message = %message_id, "message with nothing to preview");
            return;
        };

        let dedupe_id = format!("{chat}/{message_id}");
        if !self.first_time(EventClass::DirectMessage, &dedupe_id).await {
            return;
        }

        debug!(chat = %chat, message = %message_id, to = %recipient, "scheduling chat notification");
        let payload = NotificationPayload::chat(&record.sender, preview);
        let mark = vec![KeyPath::chat_message(&chat, &message_id)];
        self.coalescer.schedule(recipient, payload, mark).await;
    }

    async fn on_group_message(&self, group_id: String, message_id: String, value: Value) {
        if message_id == STORE_META_KEY {
            return;
        }
        let record: MessageRecord = match serde_json::from_value(value) {
            Ok(record) => record,
            Err(error) => {
                debug!(group = %group_id, message = %message_id, %error, "skipping malformed message");
                return;
            }
        };
        if record.notified {
            return;
        }
        let Some(preview) = record.preview() else {
            debug!(group = %group_id, message = %message_id, "message with nothing to preview");
            return;
        };

        let dedupe_id = format!("{group_id}/{message_id}");
        if !self.first_time(EventClass::GroupMessage, &dedupe_id).await {
            return;
        }

        // Membership is resolved once per message; the group record is
        // the authority on who is in the room right now.
        let group = GroupId(group_id);
        let meta = match self.store.snapshot(&KeyPath::group(&group)).await {
            Ok(Some(value)) => value,
            Ok(None) => {
                debug!(group = %group, "group message without group metadata");
                return;
            }
            Err(error) => {
                warn!(group = %group, %error, "failed to resolve group metadata");
                return;
            }
        };
        let meta: GroupRecord = match serde_json::from_value(meta) {
            Ok(meta) => meta,
            Err(error) => {
                debug!(group = %group, %error, "skipping malformed group record");
                return;
            }
        };

        let recipients = meta.recipients(&record.sender);
        if recipients.is_empty() {
            return;
        }
        debug!(
            group = %group,
            message = %message_id,
            fan_out = recipients.len(),
            "scheduling group notifications"
        );
        let mark = vec![KeyPath::group_message(&group, &message_id)];
        for recipient in recipients {
            let payload = NotificationPayload::group(&group, &meta.name, &record, preview.clone());
            self.coalescer.schedule(recipient, payload, mark.clone()).await;
        }
    }

    async fn on_inbox_item(&self, alias: String, kind: InboxKind, item_id: String, value: Value) {
        if item_id == STORE_META_KEY {
            return;
        }
        let recipient = Alias::new(alias);
        let payload = match kind {
            InboxKind::ContactRequest => {
                match serde_json::from_value::<ContactRequestRecord>(value) {
                    Ok(record) if !record.handled && !record.notified => {
                        NotificationPayload::contact_request(&record.from, &item_id)
                    }
                    Ok(_) => return,
                    Err(error) => {
                        debug!(user = %recipient, item = %item_id, %error, "skipping malformed contact request");
                        return;
                    }
                }
            }
            InboxKind::ContactAcceptance => {
                match serde_json::from_value::<ContactAcceptanceRecord>(value) {
                    Ok(record) if !record.handled && !record.notified => {
                        NotificationPayload::contact_acceptance(&record.from)
                    }
                    Ok(_) => return,
                    Err(error) => {
                        debug!(user = %recipient, item = %item_id, %error, "skipping malformed contact acceptance");
                        return;
                    }
                }
            }
            InboxKind::GroupInvitation => {
                match serde_json::from_value::<GroupInvitationRecord>(value) {
                    Ok(record) if !record.handled && !record.notified => {
                        NotificationPayload::group_invitation(&record)
                    }
                    Ok(_) => return,
                    Err(error) => {
                        debug!(user = %recipient, item = %item_id, %error, "skipping malformed group invitation");
                        return;
                    }
                }
            }
        };

        let dedupe_id = format!("{}/{}/{item_id}", recipient, kind.namespace());
        if !self.first_time(EventClass::Inbox, &dedupe_id).await {
            return;
        }

        info!(user = %recipient, kind = kind.namespace(), item = %item_id, "one-shot notification");
        let mark = vec![kind.path(&recipient).child(item_id)];
        self.enqueue(Delivery {
            recipient,
            payload,
            mark,
        })
        .await;
    }

    /// True the first time this id is offered under `class`; replays get
    /// false until the cache entry expires.
    async fn first_time(&self, class: EventClass, id: &str) -> bool {
        let mut cache = self.cache.lock().await;
        if cache.seen(class, id) {
            return false;
        }
        cache.mark_seen(class, id.to_string());
        true
    }

    async fn enqueue(&self, delivery: Delivery) {
        if self.deliveries.send(delivery).await.is_err() {
            warn!("Delivery queue closed, dropping notification");
        }
    }
}
