//! Tunnel management for PkTunnel Relay
//!
//! A tunnel is one authenticated backend connection. It carries any number
//! of streams, each the relay side of a public visitor connection, and is
//! reachable under every kite name it was admitted for.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use dashmap::DashMap;
use pktunnel_shared::kite::kite_name;
use pktunnel_shared::EofFlags;
use tokio::sync::mpsc;

pub type SessionId = String;

const STREAM_QUEUE: usize = 64;

/// What the tunnel reader hands to a public connection.
#[derive(Debug)]
pub enum StreamEvent {
    Data(Bytes),
    Eof(EofFlags),
}

/// Represents an active tunnel connection
pub struct Tunnel {
    pub session_id: SessionId,
    pub remote: SocketAddr,
    /// Kite names this tunnel was admitted for
    pub kites: Vec<String>,
    /// Channel to the tunnel's writer task
    tx: mpsc::Sender<Bytes>,
    streams: DashMap<String, mpsc::Sender<StreamEvent>>,
    next_sid: AtomicU64,
    pub created_at: Instant,
}

impl Tunnel {
    pub fn new(
        session_id: SessionId,
        remote: SocketAddr,
        kites: Vec<String>,
        tx: mpsc::Sender<Bytes>,
    ) -> Self {
        Self {
            session_id,
            remote,
            kites,
            tx,
            streams: DashMap::new(),
            next_sid: AtomicU64::new(1),
            created_at: Instant::now(),
        }
    }

    /// Queue a frame for the backend
    pub async fn send(&self, frame: Bytes) -> Result<(), mpsc::error::SendError<Bytes>> {
        self.tx.send(frame).await
    }

    /// False once the writer task has gone away.
    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Allocates a stream id and the channel that feeds it.
    pub fn open_stream(&self) -> (String, mpsc::Receiver<StreamEvent>) {
        let sid = self.next_sid.fetch_add(1, Ordering::Relaxed).to_string();
        let (tx, rx) = mpsc::channel(STREAM_QUEUE);
        self.streams.insert(sid.clone(), tx);
        (sid, rx)
    }

    pub fn stream(&self, sid: &str) -> Option<mpsc::Sender<StreamEvent>> {
        self.streams.get(sid).map(|tx| tx.clone())
    }

    pub fn close_stream(&self, sid: &str) {
        self.streams.remove(sid);
    }

    /// Drops every stream sender; the public sides see their channel close.
    pub fn close_all_streams(&self) {
        self.streams.clear();
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }
}

/// Kite name to tunnel routing table
#[derive(Default)]
pub struct TunnelRegistry {
    routes: DashMap<String, Arc<Tunnel>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes every kite of `tunnel` to it, replacing earlier owners.
    pub fn register(&self, tunnel: Arc<Tunnel>) {
        for name in &tunnel.kites {
            self.routes.insert(name.clone(), tunnel.clone());
        }
    }

    /// Removes the routes that still point at `tunnel`.
    pub fn unregister(&self, tunnel: &Arc<Tunnel>) {
        for name in &tunnel.kites {
            self.routes.remove_if(name, |_, owner| Arc::ptr_eq(owner, tunnel));
        }
    }

    /// Removes every route owned by `session_id`. Returns how many went.
    pub fn remove_session(&self, session_id: &str) -> usize {
        let before = self.routes.len();
        self.routes.retain(|_, tunnel| tunnel.session_id != session_id);
        before - self.routes.len()
    }

    pub fn owner(&self, name: &str) -> Option<Arc<Tunnel>> {
        self.routes.get(name).map(|t| t.clone())
    }

    /// Exact `proto-port:domain` first, then the default-port `proto:domain`.
    pub fn lookup(&self, proto: &str, domain: &str, port: u16) -> Option<Arc<Tunnel>> {
        self.owner(&kite_name(proto, port, domain))
            .or_else(|| self.owner(&kite_name(proto, 0, domain)))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }
}
