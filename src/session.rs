//! Secure-messaging sessions between the local identity and its peers.
//!
//! Establishment itself is the backend's business; this module only makes
//! sure it happens once per pair and that messaging waits for it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::transport::Backend;
use crate::types::{PairKey, PeerSession};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    NoSession,
    Establishing,
    Established,
    /// Last attempt failed; the next `ensure_session` retries.
    Failed(String),
}

#[derive(Debug, Clone)]
enum Slot {
    Establishing(u64),
    Established(PeerSession),
    Failed(String),
}

pub struct SessionManager {
    backend: Arc<dyn Backend>,
    slots: Mutex<HashMap<PairKey, Slot>>,
    // serialises establishment per pair
    pair_locks: Mutex<HashMap<PairKey, Arc<tokio::sync::Mutex<()>>>>,
    attempts: AtomicU64,
}

impl SessionManager {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            slots: Mutex::new(HashMap::new()),
            pair_locks: Mutex::new(HashMap::new()),
            attempts: AtomicU64::new(0),
        }
    }

    fn established(&self, key: &PairKey) -> Option<PeerSession> {
        match self.slots.lock().get(key) {
            Some(Slot::Established(s)) => Some(s.clone()),
            _ => None,
        }
    }

    fn pair_lock(&self, key: &PairKey) -> Arc<tokio::sync::Mutex<()>> {
        self.pair_locks.lock().entry(key.clone()).or_default().clone()
    }

    /// Returns the established session for the pair, establishing it first
    /// if needed. An established pair never reaches the backend again.
    pub async fn ensure_session(
        &self,
        local_id: &str,
        remote_id: &str,
    ) -> Result<PeerSession, SessionError> {
        if local_id.is_empty() {
            return Err(SessionError::NotRegistered);
        }
        if remote_id.is_empty() {
            return Err(SessionError::Rejected("empty peer id".into()));
        }
        if local_id == remote_id {
            return Err(SessionError::SelfSession);
        }
        let key = PairKey::new(local_id, remote_id);
        if let Some(session) = self.established(&key) {
            return Ok(session);
        }

        let lock = self.pair_lock(&key);
        let _guard = lock.lock().await;
        // a concurrent caller may have finished while we waited
        if let Some(session) = self.established(&key) {
            return Ok(session);
        }

        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        self.slots
            .lock()
            .insert(key.clone(), Slot::Establishing(attempt));
        debug!(local_id, remote_id, "establishing session");

        let result = self.backend.init_session(local_id, remote_id).await;

        let mut slots = self.slots.lock();
        let still_ours = matches!(slots.get(&key), Some(Slot::Establishing(a)) if *a == attempt);
        match result {
            Ok(()) if still_ours => {
                let session = PeerSession {
                    local_id: local_id.to_owned(),
                    remote_id: remote_id.to_owned(),
                    established: true,
                    established_at: Utc::now(),
                };
                slots.insert(key, Slot::Established(session.clone()));
                info!(local_id, remote_id, "session established");
                Ok(session)
            }
            Ok(()) => {
                warn!(local_id, remote_id, "session dropped while establishing");
                Err(SessionError::Rejected(
                    "session torn down while establishing".into(),
                ))
            }
            Err(err) => {
                if still_ours {
                    slots.insert(key, Slot::Failed(err.to_string()));
                }
                warn!(local_id, remote_id, error = %err, "session establishment failed");
                Err(err)
            }
        }
    }

    pub fn session_state(&self, local_id: &str, remote_id: &str) -> SessionState {
        match self.slots.lock().get(&PairKey::new(local_id, remote_id)) {
            None => SessionState::NoSession,
            Some(Slot::Establishing(_)) => SessionState::Establishing,
            Some(Slot::Established(_)) => SessionState::Established,
            Some(Slot::Failed(reason)) => SessionState::Failed(reason.clone()),
        }
    }

    pub fn get(&self, local_id: &str, remote_id: &str) -> Option<PeerSession> {
        self.established(&PairKey::new(local_id, remote_id))
    }

    /// Forgets the pair's session. Returns whether one was established.
    pub fn teardown(&self, local_id: &str, remote_id: &str) -> bool {
        let key = PairKey::new(local_id, remote_id);
        let removed = self.slots.lock().remove(&key);
        {
            // an establishment still holding the lock keeps it
            let mut locks = self.pair_locks.lock();
            if locks.get(&key).is_some_and(|l| Arc::strong_count(l) == 1) {
                locks.remove(&key);
            }
        }
        let was_established = matches!(removed, Some(Slot::Established(_)));
        if was_established {
            debug!(local_id, remote_id, "session torn down");
        }
        was_established
    }

    /// Drops every session, as on identity change.
    pub fn reset(&self) {
        let count = {
            let mut slots = self.slots.lock();
            let n = slots.len();
            slots.clear();
            n
        };
        self.pair_locks.lock().clear();
        if count > 0 {
            info!(count, "sessions reset");
        }
    }
}
