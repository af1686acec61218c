use super::LiveEvent;
use crate::model::RunCounts;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::sync::watch;

pub type ClientId = u64;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientInfo {
    pub client_id: ClientId,
    pub connected_at: DateTime<Utc>,
    pub last_ack: Option<DateTime<Utc>>,
    pub gaps: u64,
}

#[derive(Debug, Clone)]
struct SessionSnapshot {
    run_id: String,
    started_at: DateTime<Utc>,
    summary: RunCounts,
}

#[derive(Debug, Default)]
struct ClientShared {
    last_ack_ms: AtomicI64,
    gaps: AtomicU64,
}

struct ClientEntry {
    connected_at: DateTime<Utc>,
    shared: Arc<ClientShared>,
    close: watch::Sender<bool>,
}

struct Inner {
    tx: broadcast::Sender<LiveEvent>,
    session: Mutex<Option<SessionSnapshot>>,
    clients: Mutex<HashMap<ClientId, ClientEntry>>,
    next_id: AtomicU64,
}

/// Fan-out of lifecycle events to any number of observers. `publish` never
/// blocks on a client; each client reads from its own bounded position in a
/// shared ring and sees a `gap` marker when it falls behind.
#[derive(Clone)]
pub struct Broadcaster {
    inner: Arc<Inner>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Broadcaster {
    pub fn new(client_queue_capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(client_queue_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                tx,
                session: Mutex::new(None),
                clients: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Fire-and-forget. The snapshot update and the send happen under one lock
    /// so a concurrent `register_client` sees either both or neither.
    pub fn publish(&self, event: LiveEvent) {
        let mut session = lock(&self.inner.session);
        match &event {
            LiveEvent::SessionStart {
                run_id,
                started_at,
                summary,
            } => {
                *session = Some(SessionSnapshot {
                    run_id: run_id.clone(),
                    started_at: *started_at,
                    summary: *summary,
                });
            }
            LiveEvent::TestResult { run_id, outcome, .. } => {
                if let Some(s) = session.as_mut().filter(|s| &s.run_id == run_id) {
                    s.summary.record(*outcome);
                }
            }
            LiveEvent::SessionFinish { run_id, .. } => {
                if session.as_ref().is_some_and(|s| &s.run_id == run_id) {
                    *session = None;
                }
            }
            LiveEvent::Gap { .. } => return,
        }
        // Err only means nobody is listening.
        let _ = self.inner.tx.send(event);
    }

    pub fn register_client(&self) -> ClientHandle {
        let (rx, pending) = {
            let session = lock(&self.inner.session);
            let rx = self.inner.tx.subscribe();
            let pending: VecDeque<LiveEvent> = session
                .as_ref()
                .map(|s| LiveEvent::SessionStart {
                    run_id: s.run_id.clone(),
                    started_at: s.started_at,
                    summary: s.summary,
                })
                .into_iter()
                .collect();
            (rx, pending)
        };

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let connected_at = Utc::now();
        let shared = Arc::new(ClientShared::default());
        let (close, closed) = watch::channel(false);
        lock(&self.inner.clients).insert(
            id,
            ClientEntry {
                connected_at,
                shared: shared.clone(),
                close,
            },
        );
        tracing::debug!(event = "client_registered", client_id = id);

        ClientHandle {
            id,
            rx,
            pending,
            closed,
            shared,
            owner: Arc::downgrade(&self.inner),
        }
    }

    /// Moves the client to DISCONNECTED. Its handle yields `None` from then on.
    pub fn unregister_client(&self, client_id: ClientId) -> bool {
        let removed = lock(&self.inner.clients).remove(&client_id);
        match removed {
            Some(entry) => {
                let _ = entry.close.send(true);
                tracing::debug!(event = "client_unregistered", client_id);
                true
            }
            None => false,
        }
    }

    pub fn close_all(&self) {
        let drained: Vec<_> = lock(&self.inner.clients).drain().collect();
        for (_, entry) in &drained {
            let _ = entry.close.send(true);
        }
        if !drained.is_empty() {
            tracing::info!(event = "clients_closed", count = drained.len());
        }
    }

    pub fn client_count(&self) -> usize {
        lock(&self.inner.clients).len()
    }

    pub fn clients(&self) -> Vec<ClientInfo> {
        let mut out: Vec<ClientInfo> = lock(&self.inner.clients)
            .iter()
            .map(|(id, e)| {
                let ack = e.shared.last_ack_ms.load(Ordering::Relaxed);
                ClientInfo {
                    client_id: *id,
                    connected_at: e.connected_at,
                    last_ack: (ack > 0)
                        .then(|| DateTime::from_timestamp_millis(ack))
                        .flatten(),
                    gaps: e.shared.gaps.load(Ordering::Relaxed),
                }
            })
            .collect();
        out.sort_by_key(|c| c.client_id);
        out
    }
}

/// A registered observer's receiving end. Dropping it unregisters the client.
pub struct ClientHandle {
    id: ClientId,
    rx: broadcast::Receiver<LiveEvent>,
    pending: VecDeque<LiveEvent>,
    closed: watch::Receiver<bool>,
    shared: Arc<ClientShared>,
    owner: Weak<Inner>,
}

impl ClientHandle {
    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub fn ack(&self) {
        self.shared
            .last_ack_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn gap(&self, missed: u64) -> LiveEvent {
        self.shared.gaps.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(event = "client_lagged", client_id = self.id, missed);
        LiveEvent::Gap { missed }
    }

    /// Next event in FIFO order, or `None` once the client is disconnected.
    pub async fn recv(&mut self) -> Option<LiveEvent> {
        if self.is_closed() {
            return None;
        }
        if let Some(ev) = self.pending.pop_front() {
            return Some(ev);
        }
        tokio::select! {
            biased;
            _ = self.closed.changed() => None,
            res = self.rx.recv() => match res {
                Ok(ev) => Some(ev),
                Err(RecvError::Lagged(n)) => Some(self.gap(n)),
                Err(RecvError::Closed) => None,
            },
        }
    }

    /// Non-blocking variant for synchronous callers.
    pub fn try_recv(&mut self) -> Option<LiveEvent> {
        if self.is_closed() {
            return None;
        }
        if let Some(ev) = self.pending.pop_front() {
            return Some(ev);
        }
        match self.rx.try_recv() {
            Ok(ev) => Some(ev),
            Err(TryRecvError::Lagged(n)) => Some(self.gap(n)),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => None,
        }
    }
}

impl Drop for ClientHandle {
    fn drop(&mut self) {
        if let Some(inner) = self.owner.upgrade() {
            lock(&inner.clients).remove(&self.id);
        }
    }
}
