//! Outbound sends with local echo, and the inbound poll loop.
//!
//! The backend offers no idempotent read: every poll drains the inbox. So
//! there is at most one loop per identity, and a replacement loop waits for
//! its predecessor to finish before its first poll.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, ConfigError};
use crate::error::SendError;
use crate::events::{CoordinatorEvent, EventSink};
use crate::transport::{Backend, InboundMessage};
use crate::types::{Ack, ChatMessage, Identity, PeerSession};

const RECENT_KEYS: usize = 512;

/// `id` when the backend supplied one, otherwise a digest of sender, text
/// and the arrival bucket.
pub fn dedup_key(
    id: Option<&str>,
    sender_id: &str,
    text: &str,
    received_at: DateTime<Utc>,
    bucket_ms: u64,
) -> String {
    if let Some(id) = id.filter(|id| !id.is_empty()) {
        return id.to_owned();
    }
    let bucket = received_at.timestamp_millis().max(0) as u64 / bucket_ms.max(1);
    let mut hasher = Sha256::new();
    hasher.update(sender_id.as_bytes());
    hasher.update([0x1f]);
    hasher.update(text.as_bytes());
    hasher.update([0x1f]);
    hasher.update(bucket.to_be_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Default)]
struct RecentKeys {
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl RecentKeys {
    /// Records `key`; false if it was already in the window.
    fn insert(&mut self, key: &str) -> bool {
        if self.seen.contains(key) {
            return false;
        }
        if self.order.len() == RECENT_KEYS {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        self.order.push_back(key.to_owned());
        self.seen.insert(key.to_owned());
        true
    }
}

struct Inner {
    backend: Arc<dyn Backend>,
    events: EventSink,
    sequence: AtomicU64,
    bucket_ms: u64,
    recent: Option<Mutex<RecentKeys>>,
}

impl Inner {
    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn to_chat(&self, raw: InboundMessage) -> ChatMessage {
        let received_at = Utc::now();
        let key = dedup_key(
            raw.id.as_deref(),
            &raw.from,
            &raw.text,
            received_at,
            self.bucket_ms,
        );
        let sender_name = raw
            .from_name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| raw.from.clone());
        ChatMessage {
            sender_id: raw.from,
            sender_name,
            text: raw.text,
            sequence_hint: 0,
            id: raw.id,
            received_at,
            dedup_key: key,
        }
    }

    async fn poll_once(&self, user_id: &str) -> Vec<ChatMessage> {
        let batch = match self.backend.poll(user_id).await {
            Ok(batch) => batch,
            Err(e) => {
                warn!(user_id, error = %e, "poll failed");
                self.events.emit(CoordinatorEvent::PollFailed(e.to_string()));
                return Vec::new();
            }
        };
        let received = batch.len();
        let mut out = Vec::with_capacity(received);
        for raw in batch {
            let mut msg = self.to_chat(raw);
            if let Some(recent) = &self.recent {
                if !recent.lock().insert(&msg.dedup_key) {
                    debug!(sender = %msg.sender_id, "duplicate suppressed");
                    continue;
                }
            }
            msg.sequence_hint = self.next_sequence();
            out.push(msg);
        }
        if !out.is_empty() {
            debug!(user_id, received, delivered = out.len(), "poll batch");
            self.events
                .emit(CoordinatorEvent::MessagesReceived { count: out.len() });
        }
        out
    }
}

/// A poll loop. `stop` is taken once the loop has been told to stop; the
/// entry stays until a new loop for the identity has awaited `handle`.
struct Poller {
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl Poller {
    fn signal_stop(&mut self) -> bool {
        match self.stop.take() {
            Some(stop) => {
                let _ = stop.send(());
                true
            }
            None => false,
        }
    }

    fn is_running(&self) -> bool {
        self.stop.is_some() && !self.handle.is_finished()
    }
}

pub struct MessagePipeline {
    inner: Arc<Inner>,
    pollers: Mutex<HashMap<String, Poller>>,
}

impl MessagePipeline {
    pub fn new(backend: Arc<dyn Backend>, events: EventSink, config: &ClientConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                events,
                sequence: AtomicU64::new(0),
                bucket_ms: config.dedup_bucket_ms,
                recent: config
                    .suppress_duplicates
                    .then(|| Mutex::new(RecentKeys::default())),
            }),
            pollers: Mutex::new(HashMap::new()),
        }
    }

    /// Posts `text` over an established session. Not retried: the backend
    /// has no idempotency key, so a retry may deliver twice.
    pub async fn send(
        &self,
        local: &Identity,
        session: &PeerSession,
        text: &str,
    ) -> Result<Ack, SendError> {
        if text.trim().is_empty() {
            return Err(SendError::EmptyMessage);
        }
        if !session.established || session.local_id != local.id {
            return Err(SendError::NoSession);
        }
        self.inner
            .backend
            .send_message(&local.id, &session.remote_id, text)
            .await
            .inspect_err(|e| warn!(to = %session.remote_id, error = %e, "send failed"))?;

        let sent_at = Utc::now();
        let message = ChatMessage {
            sender_id: local.id.clone(),
            sender_name: local.display_name.clone(),
            text: text.to_owned(),
            sequence_hint: self.inner.next_sequence(),
            id: None,
            received_at: sent_at,
            dedup_key: dedup_key(None, &local.id, text, sent_at, self.inner.bucket_ms),
        };
        debug!(to = %session.remote_id, len = text.len(), "message sent");
        Ok(Ack { message, sent_at })
    }

    /// One poll. Never fails: a transport error yields an empty batch and a
    /// `PollFailed` event.
    pub async fn poll_once(&self, identity: &Identity) -> Vec<ChatMessage> {
        if identity.id.is_empty() {
            warn!("poll without an identity id");
            return Vec::new();
        }
        self.inner.poll_once(&identity.id).await
    }

    /// Starts the repeating poll for `identity`, replacing any loop already
    /// running for it. Only non-empty batches reach `on_batch`. The new loop
    /// polls only after the previous one, stopped or replaced, has finished.
    pub fn start_polling<F>(
        &self,
        identity: &Identity,
        interval: Duration,
        on_batch: F,
    ) -> Result<(), ConfigError>
    where
        F: Fn(Vec<ChatMessage>) + Send + Sync + 'static,
    {
        if interval.is_zero() {
            return Err(ConfigError::Invalid {
                field: "poll_interval",
                reason: "must be greater than zero".into(),
            });
        }
        let user_id = identity.id.clone();
        let mut pollers = self.pollers.lock();
        let previous = pollers.remove(&user_id).map(|mut old| {
            old.signal_stop();
            old.handle
        });

        let (stop_tx, mut stop_rx) = oneshot::channel();
        let inner = self.inner.clone();
        let id = user_id.clone();
        let handle = tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            info!(user_id = %id, interval_ms = interval.as_millis() as u64, "polling started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {}
                }
                let batch = inner.poll_once(&id).await;
                if !batch.is_empty() {
                    on_batch(batch);
                }
            }
            debug!(user_id = %id, "polling stopped");
        });
        pollers.insert(
            user_id,
            Poller {
                stop: Some(stop_tx),
                handle,
            },
        );
        Ok(())
    }

    /// Stops the loop for `user_id`. A poll already in flight still
    /// completes, and a later `start_polling` waits for it.
    pub fn stop_polling(&self, user_id: &str) -> bool {
        let mut pollers = self.pollers.lock();
        pollers.retain(|_, p| p.stop.is_some() || !p.handle.is_finished());
        pollers
            .get_mut(user_id)
            .is_some_and(Poller::signal_stop)
    }

    pub fn stop_all(&self) {
        for poller in self.pollers.lock().values_mut() {
            poller.signal_stop();
        }
    }

    pub fn is_polling(&self, user_id: &str) -> bool {
        self.pollers
            .lock()
            .get(user_id)
            .is_some_and(Poller::is_running)
    }
}

impl Drop for MessagePipeline {
    fn drop(&mut self) {
        self.stop_all();
    }
}
