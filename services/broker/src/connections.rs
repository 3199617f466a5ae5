//! Live-connection index shared by the listener and other subsystems.
//!
//! One entry per authenticated client, keyed by connection id. The entry is
//! added after a successful handshake and removed when the connection task
//! exits, whichever way it exits.
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Notify;
use warden_auth::Identity;
use warden_registry::Registry;

pub type ConnectionIndex = Registry<ConnectionHandle>;

#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub conn_id: String,
    pub peer: SocketAddr,
    pub identity: Identity,
    pub connected_at: DateTime<Utc>,
    close: Arc<Notify>,
}

impl ConnectionHandle {
    pub fn new(conn_id: impl Into<String>, peer: SocketAddr, identity: Identity) -> Self {
        Self {
            conn_id: conn_id.into(),
            peer,
            identity,
            connected_at: Utc::now(),
            close: Arc::new(Notify::new()),
        }
    }

    /// Ask the owning connection task to hang up.
    pub fn close(&self) {
        self.close.notify_one();
    }

    pub(crate) async fn closed(&self) {
        self.close.notified().await;
    }
}

/// Removes the index entry when the connection task ends.
pub(crate) struct Registration {
    index: Arc<ConnectionIndex>,
    conn_id: String,
}

impl Registration {
    /// Returns `None` if `handle.conn_id` is already registered.
    pub(crate) fn register(index: Arc<ConnectionIndex>, handle: ConnectionHandle) -> Option<Self> {
        let conn_id = handle.conn_id.clone();
        if !index.add(conn_id.clone(), handle) {
            return None;
        }
        Some(Self { index, conn_id })
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.index.delete(&self.conn_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(id: &str) -> ConnectionHandle {
        ConnectionHandle::new(id, "127.0.0.1:9".parse().expect("addr"), Identity::anonymous())
    }

    #[test]
    fn registration_removes_entry_on_drop() {
        let index = Arc::new(ConnectionIndex::new());
        let registration = Registration::register(index.clone(), handle("c1")).expect("first");
        assert!(index.contains("c1"));
        assert!(Registration::register(index.clone(), handle("c1")).is_none());
        drop(registration);
        assert!(!index.contains("c1"));
    }

    #[tokio::test]
    async fn close_wakes_the_owner_even_if_sent_first() {
        let handle = handle("c1");
        let copy = handle.clone();
        copy.close();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle.closed())
            .await
            .expect("notified");
    }
}
