//! Client session: one document, one bridge, one relay connection.
//!
//! ```text
//!   view ──► LocalStore ──► Bridge ──outbox──► SyncClient ──ws──► relay
//!                              ▲                    │
//!                              └──── next_event ◄───┘
//! ```
//!
//! The session is driven by its host: call [`CollabSession::flush_local`]
//! once per frame and [`CollabSession::next_event`] whenever the transport
//! has something. Nothing here blocks on the network except those awaits.

use std::time::Instant;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use uuid::Uuid;

use tessera_core::codec::{Update, VersionVector};
use tessera_core::{
    Bridge, BridgeError, ChangeEvent, CoalesceConfig, ListenerId, LocalStore, Snapshot,
};

use crate::client::{ReconnectPolicy, SyncClient, SyncEvent};
use crate::presence::{AwarenessMessage, Point, PresenceRoom};
use crate::protocol::{PeerInfo, ProtocolError};

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Relay base URL; the document id is appended as the path.
    pub server_url: String,
    /// Display name shown to other peers
    pub peer_name: String,
    pub reconnect: ReconnectPolicy,
    pub coalesce: CoalesceConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            peer_name: "anonymous".to_string(),
            reconnect: ReconnectPolicy::default(),
            coalesce: CoalesceConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn for_testing(server_url: impl Into<String>, peer_name: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            peer_name: peer_name.into(),
            reconnect: ReconnectPolicy::for_testing(),
            coalesce: CoalesceConfig::for_testing(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Connecting,
    Live,
    Reconnecting,
    Closed,
}

/// What [`CollabSession::next_event`] reports to the host.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Remote edits (or their reconciliation) changed the document.
    RemoteChange(ChangeEvent),
    /// Bootstrap state applied; the replica holds the relay's full state.
    Synced,
    StatusChanged(SessionStatus),
    /// The relay could not persist the update sent with this clock.
    /// Editing continues; the edit lives on in the other replicas.
    DurabilityWarning { clock: u64 },
    Presence(AwarenessMessage),
    PeerJoined(PeerInfo),
    PeerLeft(Uuid),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Transport error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("Session is closed")]
    Closed,
}

/// A live editing session on one document.
pub struct CollabSession {
    document_id: String,
    peer: PeerInfo,
    bridge: Bridge,
    client: SyncClient,
    events: mpsc::UnboundedReceiver<SyncEvent>,
    presence: PresenceRoom,
    status: SessionStatus,
    synced: bool,
}

impl CollabSession {
    /// Open a session on `document_id` and connect to the relay.
    pub async fn connect(config: SessionConfig, document_id: impl Into<String>) -> Result<Self, SessionError> {
        let document_id = document_id.into();
        let peer = PeerInfo::new(config.peer_name.as_str());
        let mut client = SyncClient::with_policy(
            peer.clone(),
            document_id.as_str(),
            config.server_url.as_str(),
            config.reconnect.clone(),
        );
        let events = client.take_event_rx().ok_or(SessionError::Closed)?;
        let bridge = Bridge::new(LocalStore::new(), config.coalesce);

        client.set_version_vector(bridge.version_vector().encode());
        client.connect().await?;
        log::info!("Session for {document_id} opened as {}", peer.name);

        Ok(Self {
            document_id,
            presence: PresenceRoom::new(peer.peer_id),
            peer,
            bridge,
            client,
            events,
            status: SessionStatus::Connecting,
            synced: false,
        })
    }

    /// Commit pending local edits and send them. Returns how many updates
    /// were handed to the transport.
    pub async fn flush_local(&mut self, now: Instant) -> Result<usize, SessionError> {
        self.ensure_open()?;
        self.bridge.flush(now)?;
        self.send_outbox().await
    }

    /// Wait for the next transport event and process it. Returns `None`
    /// once the session is closed and every buffered event is consumed.
    pub async fn next_event(&mut self) -> Result<Option<SessionEvent>, SessionError> {
        loop {
            let event = if self.status == SessionStatus::Closed {
                match self.events.try_recv() {
                    Ok(event) => event,
                    Err(TryRecvError::Empty | TryRecvError::Disconnected) => return Ok(None),
                }
            } else {
                match self.events.recv().await {
                    Some(event) => event,
                    None => return Ok(None),
                }
            };

            if let Some(out) = self.handle(event).await? {
                return Ok(Some(out));
            }
        }
    }

    async fn handle(&mut self, event: SyncEvent) -> Result<Option<SessionEvent>, SessionError> {
        match event {
            SyncEvent::Connected => {
                let join = self.presence.join_message(self.peer.name.as_str());
                if let Err(e) = self.client.send_awareness(&join).await {
                    log::debug!("Presence join not sent: {e}");
                }
                Ok(self.set_status(SessionStatus::Live))
            }

            SyncEvent::Reconnecting { attempt } => {
                log::info!("Session {} reconnecting (attempt {attempt})", self.document_id);
                self.synced = false;
                self.client.set_version_vector(self.bridge.version_vector().encode());
                Ok(self.set_status(SessionStatus::Reconnecting))
            }

            SyncEvent::Disconnected => Ok(self.set_status(SessionStatus::Closed)),

            SyncEvent::RemoteUpdate { update, .. } => {
                let change = self.bridge.apply_remote(&Update::from_bytes(update))?;
                self.after_remote().await?;
                Ok(change.map(SessionEvent::RemoteChange))
            }

            SyncEvent::StateSynced(state) => {
                self.bridge.apply_remote(&Update::from_bytes(state))?;
                // The replica now holds everything the relay knows, so any
                // edge still missing an endpoint is truly dangling.
                self.bridge.reconcile_all()?;
                self.after_remote().await?;
                self.synced = true;
                log::debug!("Session {} synced", self.document_id);
                Ok(Some(SessionEvent::Synced))
            }

            SyncEvent::ServerVersion(bytes) => {
                match VersionVector::decode(&bytes) {
                    Ok(server_vv) => {
                        let missing = self.bridge.encode_since(&server_vv);
                        if !missing.is_empty() {
                            log::debug!("Pushing {} bytes the relay lacks", missing.len());
                            self.send(missing).await?;
                        }
                    }
                    Err(e) => log::warn!("Unreadable relay version vector: {e}"),
                }
                Ok(None)
            }

            SyncEvent::Acked { clock, durable } => {
                if durable {
                    return Ok(None);
                }
                log::warn!("Relay failed to persist update {clock} of {}", self.document_id);
                Ok(Some(SessionEvent::DurabilityWarning { clock }))
            }

            SyncEvent::RemoteAwareness { message, .. } => {
                if self.presence.handle_message(&message, Instant::now()) {
                    Ok(Some(SessionEvent::Presence(message)))
                } else {
                    Ok(None)
                }
            }

            SyncEvent::PeerJoined(info) => Ok(Some(SessionEvent::PeerJoined(info))),

            SyncEvent::PeerLeft(peer_id) => {
                self.presence.remove_peer(&peer_id);
                Ok(Some(SessionEvent::PeerLeft(peer_id)))
            }

            SyncEvent::Rejected(reason) => {
                log::warn!("Relay rejected a frame on {}: {reason}", self.document_id);
                Ok(None)
            }
        }
    }

    /// Reconciliations triggered by remote changes go out like local edits.
    async fn after_remote(&mut self) -> Result<(), SessionError> {
        self.send_outbox().await?;
        self.client.set_version_vector(self.bridge.version_vector().encode());
        Ok(())
    }

    async fn send_outbox(&mut self) -> Result<usize, SessionError> {
        let outbox = self.bridge.take_outbox();
        let count = outbox.len();
        for update in outbox {
            self.send(update).await?;
        }
        if count > 0 {
            self.client.set_version_vector(self.bridge.version_vector().encode());
        }
        Ok(count)
    }

    async fn send(&self, update: Update) -> Result<(), SessionError> {
        match self.client.send_update(update.into_bytes()).await {
            Ok(_) => Ok(()),
            // Still in the replica; the next version vector exchange resends it.
            Err(ProtocolError::QueueFull(capacity)) => {
                log::warn!("Offline queue full ({capacity} updates), relying on resync");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn set_status(&mut self, status: SessionStatus) -> Option<SessionEvent> {
        if self.status == status {
            return None;
        }
        self.status = status;
        Some(SessionEvent::StatusChanged(status))
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.status == SessionStatus::Closed || self.bridge.is_disposed() {
            return Err(SessionError::Closed);
        }
        Ok(())
    }

    // ─── Presence ─────────────────────────────────────────────────────

    /// Move the local cursor; sent at most 30 times a second.
    pub async fn update_cursor(&mut self, position: Point, now: Instant) -> Result<(), SessionError> {
        if let Some(msg) = self.presence.update_local_cursor(position, now) {
            self.client.send_awareness(&msg).await?;
        }
        Ok(())
    }

    pub async fn update_selection(&mut self, node_ids: Vec<String>, edge_ids: Vec<String>) -> Result<(), SessionError> {
        let msg = self.presence.update_local_selection(node_ids, edge_ids);
        self.client.send_awareness(&msg).await?;
        Ok(())
    }

    // ─── Lifecycle ────────────────────────────────────────────────────

    /// Leave the document. Idempotent.
    pub async fn disconnect(&mut self) {
        if self.status == SessionStatus::Closed && self.bridge.is_disposed() {
            return;
        }
        let leave = self.presence.leave_message();
        if let Err(e) = self.client.send_awareness(&leave).await {
            log::debug!("Presence leave not sent: {e}");
        }
        self.client.disconnect().await;
        self.bridge.dispose();
        self.status = SessionStatus::Closed;
        log::info!("Session for {} closed", self.document_id);
    }

    // ─── Accessors ────────────────────────────────────────────────────

    pub fn on_remote_change<F>(&mut self, listener: F) -> ListenerId
    where
        F: FnMut(&ChangeEvent) + Send + 'static,
    {
        self.bridge.on_remote_change(listener)
    }

    pub fn remove_remote_change(&mut self, id: ListenerId) -> bool {
        self.bridge.remove_remote_listener(id)
    }

    pub fn snapshot(&self) -> Snapshot {
        self.bridge.snapshot()
    }

    /// The store the view edits.
    pub fn store_mut(&mut self) -> &mut LocalStore {
        self.bridge.store_mut()
    }

    pub fn store(&self) -> &LocalStore {
        self.bridge.store()
    }

    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// True once the bootstrap of the current connection was applied.
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn presence(&self) -> &PresenceRoom {
        &self.presence
    }

    pub fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn client(&self) -> &SyncClient {
        &self.client
    }
}
