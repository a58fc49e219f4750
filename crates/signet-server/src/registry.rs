//! Live connection registry keyed by entity id.
//!
//! Each connection owns a bounded outbound queue drained by its own writer
//! task, so delivery here is a non-blocking enqueue. A connection whose queue
//! is full or closed is closed and deregistered without affecting any other
//! connection. The map is sharded (`DashMap`), so lookups for one entity never
//! contend with registrations for another.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use axum::extract::ws::close_code;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use uuid::Uuid;

use crate::auth::Identity;

/// Lifecycle of a live connection.
///
/// `Connecting → Authenticating → Subscribed → Closing → Closed`. A connection
/// that fails authentication goes straight from `Authenticating` to `Closing`
/// and is never registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Authenticating = 1,
    Subscribed = 2,
    Closing = 3,
    Closed = 4,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Connecting,
            1 => Self::Authenticating,
            2 => Self::Subscribed,
            3 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Why a connection is being closed; becomes the close frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: &'static str,
}

impl CloseReason {
    pub const CLIENT_GONE: Self = Self {
        code: close_code::NORMAL,
        reason: "client disconnected",
    };
    pub const IDLE: Self = Self {
        code: close_code::AWAY,
        reason: "idle timeout",
    };
    pub const SLOW_CONSUMER: Self = Self {
        code: close_code::AGAIN,
        reason: "outbound queue overflow",
    };
    pub const SEND_FAILED: Self = Self {
        code: close_code::ERROR,
        reason: "send failed",
    };
    pub const SHUTDOWN: Self = Self {
        code: close_code::AWAY,
        reason: "server shutting down",
    };
}

/// Failure to enqueue a message on one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("outbound queue full")]
    Full,
    #[error("connection closed")]
    Closed,
}

/// Shared handle to one live connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: Uuid,
    entity_id: Uuid,
    identity: OnceLock<Identity>,
    tx: mpsc::Sender<String>,
    state: AtomicU8,
    close_reason: OnceLock<CloseReason>,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    /// Creates a handle in `Connecting` for a client asking for `entity_id`.
    pub fn new(entity_id: Uuid, tx: mpsc::Sender<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_id,
            identity: OnceLock::new(),
            tx,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            close_reason: OnceLock::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn entity_id(&self) -> Uuid {
        self.entity_id
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.get()
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// `Connecting → Authenticating`.
    pub fn begin_authentication(&self) -> bool {
        self.transition(ConnectionState::Connecting, ConnectionState::Authenticating)
    }

    /// Moves any live state to `Closing` and wakes the connection's tasks.
    /// The first reason recorded wins. Returns `false` if already closing.
    pub fn begin_close(&self, reason: CloseReason) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current >= ConnectionState::Closing as u8 {
                return false;
            }
            match self.state.compare_exchange(
                current,
                ConnectionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        let _ = self.close_reason.set(reason);
        self.cancel.cancel();
        true
    }

    /// The reason recorded by [`begin_close`](Self::begin_close), if any.
    pub fn close_reason(&self) -> CloseReason {
        self.close_reason
            .get()
            .cloned()
            .unwrap_or(CloseReason::CLIENT_GONE)
    }

    fn mark_closed(&self) {
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
    }

    /// Resolves once the connection starts closing.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Non-blocking enqueue onto the connection's outbound queue.
    pub fn try_send(&self, message: String) -> Result<(), DeliveryError> {
        self.tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

/// Outcome of fanning one message out to an entity's subscribers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub dropped: usize,
}

#[derive(Debug, Default)]
struct RegistryInner {
    entities: DashMap<Uuid, HashMap<Uuid, Arc<ConnectionHandle>>>,
    total: AtomicUsize,
}

/// Sharded map from entity id to that entity's live connections.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

/// Returned when a connection cannot be subscribed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("connection {id} is {state:?}, not authenticating")]
pub struct SubscribeError {
    pub id: Uuid,
    pub state: ConnectionState,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Authenticating → Subscribed`: records the authenticated identity and
    /// makes the connection visible to deliveries for its entity.
    pub fn subscribe(
        &self,
        handle: Arc<ConnectionHandle>,
        identity: Identity,
    ) -> Result<(), SubscribeError> {
        let mut set = self.inner.entities.entry(handle.entity_id).or_default();
        if !handle.transition(ConnectionState::Authenticating, ConnectionState::Subscribed) {
            let state = handle.state();
            drop(set);
            self.inner
                .entities
                .remove_if(&handle.entity_id, |_, set| set.is_empty());
            return Err(SubscribeError {
                id: handle.id,
                state,
            });
        }
        let _ = handle.identity.set(identity);
        set.insert(handle.id, Arc::clone(&handle));
        self.inner.total.fetch_add(1, Ordering::Relaxed);
        drop(set);

        tracing::info!(
            connection_id = %handle.id,
            entity_id = %handle.entity_id,
            user_id = handle.identity().map(|i| i.user_id.as_str()).unwrap_or(""),
            "connection subscribed"
        );
        Ok(())
    }

    /// `Closing → Closed`: removes the connection. The removal happens under
    /// the entity's shard lock, so a concurrent delivery either sees the
    /// connection or does not, never a half-removed entry. Returns `true`
    /// if the connection was registered.
    pub fn deregister(&self, handle: &ConnectionHandle) -> bool {
        handle.begin_close(CloseReason::CLIENT_GONE);

        let removed = match self.inner.entities.get_mut(&handle.entity_id) {
            Some(mut set) => set.remove(&handle.id).is_some(),
            None => false,
        };
        if removed {
            self.inner.total.fetch_sub(1, Ordering::Relaxed);
            self.inner
                .entities
                .remove_if(&handle.entity_id, |_, set| set.is_empty());
            tracing::info!(
                connection_id = %handle.id,
                entity_id = %handle.entity_id,
                "connection deregistered"
            );
        }
        handle.mark_closed();
        removed
    }

    /// Enqueues `message` on every connection subscribed to `entity_id`.
    /// Connections whose queue is full or closed are closed and removed.
    ///
    /// Enqueueing happens under the entity's shard read lock. `deregister`
    /// needs the write lock before it can mark a handle `Closed`, so a
    /// message never lands on a closed connection. Connections already
    /// closing are skipped.
    pub fn deliver(&self, entity_id: Uuid, message: &str) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        let mut evicted = Vec::new();
        {
            let Some(set) = self.inner.entities.get(&entity_id) else {
                return report;
            };
            for handle in set.values() {
                if handle.state() != ConnectionState::Subscribed {
                    continue;
                }
                match handle.try_send(message.to_string()) {
                    Ok(()) => report.delivered += 1,
                    Err(e) => {
                        tracing::warn!(
                            connection_id = %handle.id,
                            entity_id = %entity_id,
                            "dropping slow or closed connection: {}",
                            e
                        );
                        evicted.push(Arc::clone(handle));
                    }
                }
            }
        }

        for handle in evicted {
            handle.begin_close(CloseReason::SLOW_CONSUMER);
            self.deregister(&handle);
            report.dropped += 1;
        }
        report
    }

    /// Starts closing every live connection.
    pub fn close_all(&self, reason: CloseReason) -> usize {
        let handles: Vec<Arc<ConnectionHandle>> = self
            .inner
            .entities
            .iter()
            .flat_map(|entry| entry.value().values().cloned().collect::<Vec<_>>())
            .collect();
        let count = handles.len();
        for handle in handles {
            handle.begin_close(reason.clone());
        }
        if count > 0 {
            tracing::info!(count, "closing all live connections");
        }
        count
    }

    /// Number of connections subscribed to `entity_id`.
    pub fn connection_count(&self, entity_id: Uuid) -> usize {
        self.inner
            .entities
            .get(&entity_id)
            .map(|set| set.len())
            .unwrap_or(0)
    }

    pub fn total_connections(&self) -> usize {
        self.inner.total.load(Ordering::Relaxed)
    }

    /// Number of entities with at least one subscriber.
    pub fn entity_count(&self) -> usize {
        self.inner.entities.len()
    }
}
