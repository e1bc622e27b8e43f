//! In-process stand-ins for the backend and the signaling relay.
//!
//! They mirror the observable behaviour of the real collaborators: sessions
//! are directional `(sender, receiver)` entries, a poll drains the whole
//! inbox and silently skips messages whose session is missing, and the
//! relay forwards envelopes by `to` while dropping unknown targets.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::wire::{InboundMessage, SignalEnvelope};
use super::{Backend, SignalInbound, SignalingConnector, SignalingLink};
use crate::error::{NetworkError, RegisterError, SendError, SessionError, SignalingError};
use crate::types::Identity;
use crate::utils::random_id;

#[derive(Default)]
struct BackendState {
    users: HashMap<String, String>,
    sessions: HashSet<(String, String)>,
    inbox: HashMap<String, Vec<InboundMessage>>,
    offline: bool,
    reject_sessions: Option<String>,
    session_delay: Option<Duration>,
}

#[derive(Default)]
struct Counters {
    init_session: AtomicU64,
    send: AtomicU64,
    poll: AtomicU64,
}

#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<BackendState>>,
    counters: Arc<Counters>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every call fails with `NetworkError::Unreachable`.
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Refuse session establishment with `reason` until cleared.
    pub fn reject_sessions(&self, reason: Option<&str>) {
        self.state.lock().reject_sessions = reason.map(str::to_owned);
    }

    /// Hold every session-init for `delay` before answering.
    pub fn set_session_delay(&self, delay: Option<Duration>) {
        self.state.lock().session_delay = delay;
    }

    /// Queue a message for `user_id` as if the backend had received it.
    pub fn inject(&self, user_id: &str, msg: InboundMessage) {
        self.state
            .lock()
            .inbox
            .entry(user_id.to_owned())
            .or_default()
            .push(msg);
    }

    pub fn has_session(&self, sender_id: &str, receiver_id: &str) -> bool {
        self.state
            .lock()
            .sessions
            .contains(&(sender_id.to_owned(), receiver_id.to_owned()))
    }

    pub fn username(&self, user_id: &str) -> Option<String> {
        self.state.lock().users.get(user_id).cloned()
    }

    pub fn init_session_calls(&self) -> u64 {
        self.counters.init_session.load(Ordering::SeqCst)
    }

    pub fn send_calls(&self) -> u64 {
        self.counters.send.load(Ordering::SeqCst)
    }

    pub fn poll_calls(&self) -> u64 {
        self.counters.poll.load(Ordering::SeqCst)
    }

    fn check_online(&self) -> Result<(), NetworkError> {
        if self.state.lock().offline {
            return Err(NetworkError::Unreachable("memory backend offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn health(&self) -> Result<(), NetworkError> {
        self.check_online()
    }

    async fn register(&self, username: &str) -> Result<String, RegisterError> {
        self.check_online()?;
        if username.trim().is_empty() {
            return Err(RegisterError::Rejected("username is empty".into()));
        }
        let id = random_id();
        self.state.lock().users.insert(id.clone(), username.to_owned());
        Ok(id)
    }

    async fn init_session(&self, sender_id: &str, receiver_id: &str) -> Result<(), SessionError> {
        self.counters.init_session.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        let delay = self.state.lock().session_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut st = self.state.lock();
        if let Some(reason) = &st.reject_sessions {
            return Err(SessionError::Rejected(reason.clone()));
        }
        if !st.users.contains_key(sender_id) || !st.users.contains_key(receiver_id) {
            return Err(SessionError::Rejected("invalid sender/receiver".into()));
        }
        st.sessions
            .insert((sender_id.to_owned(), receiver_id.to_owned()));
        Ok(())
    }

    async fn send_message(
        &self,
        sender_id: &str,
        receiver_id: &str,
        text: &str,
    ) -> Result<(), SendError> {
        self.counters.send.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        let mut st = self.state.lock();
        if !st
            .sessions
            .contains(&(sender_id.to_owned(), receiver_id.to_owned()))
        {
            return Err(SendError::Rejected("session not initialized".into()));
        }
        st.inbox
            .entry(receiver_id.to_owned())
            .or_default()
            .push(InboundMessage::new(sender_id, text));
        Ok(())
    }

    async fn poll(&self, user_id: &str) -> Result<Vec<InboundMessage>, NetworkError> {
        self.counters.poll.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        let mut st = self.state.lock();
        let queued = st.inbox.remove(user_id).unwrap_or_default();
        let delivered = queued
            .into_iter()
            .filter(|m| {
                st.sessions
                    .contains(&(m.from.clone(), user_id.to_owned()))
            })
            .collect();
        Ok(delivered)
    }
}

// ── Relay ───────────────────────────────────────────────────────────────────

struct Route {
    conn: u64,
    tx: mpsc::UnboundedSender<SignalInbound>,
}

#[derive(Default)]
struct RelayState {
    routes: HashMap<String, Route>,
    log: Vec<SignalEnvelope>,
    refuse: bool,
}

#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
    next_conn: Arc<AtomicU64>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `connect` calls fail.
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.lock().refuse = refuse;
    }

    /// Drop `user_id`'s socket as the server would on disconnect.
    pub fn close(&self, user_id: &str) {
        if let Some(route) = self.state.lock().routes.remove(user_id) {
            let _ = route.tx.send(SignalInbound::Closed);
        }
    }

    /// Deliver a raw item to `user_id`, bypassing routing.
    pub fn inject(&self, user_id: &str, item: SignalInbound) -> bool {
        match self.state.lock().routes.get(user_id) {
            Some(route) => route.tx.send(item).is_ok(),
            None => false,
        }
    }

    pub fn is_connected(&self, user_id: &str) -> bool {
        self.state.lock().routes.contains_key(user_id)
    }

    /// Every envelope the relay has seen, in arrival order.
    pub fn routed(&self) -> Vec<SignalEnvelope> {
        self.state.lock().log.clone()
    }

    fn route(&self, env: SignalEnvelope) {
        let mut st = self.state.lock();
        st.log.push(env.clone());
        match st.routes.get(&env.to) {
            Some(route) => {
                let _ = route.tx.send(SignalInbound::Envelope(env));
            }
            None => debug!(to = %env.to, kind = %env.kind, "relay: unknown target, dropped"),
        }
    }
}

#[async_trait]
impl SignalingConnector for MemoryRelay {
    async fn connect(&self, identity: &Identity) -> Result<SignalingLink, SignalingError> {
        if self.state.lock().refuse {
            return Err(SignalingError::Connect("relay refused connection".into()));
        }
        let conn = self.next_conn.fetch_add(1, Ordering::SeqCst);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<SignalEnvelope>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        self.state
            .lock()
            .routes
            .insert(identity.id.clone(), Route { conn, tx: in_tx });

        let relay = self.clone();
        let user_id = identity.id.clone();
        tokio::spawn(async move {
            while let Some(env) = out_rx.recv().await {
                relay.route(env);
            }
            let mut st = relay.state.lock();
            if st.routes.get(&user_id).map(|r| r.conn) == Some(conn) {
                st.routes.remove(&user_id);
            }
        });

        Ok(SignalingLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
