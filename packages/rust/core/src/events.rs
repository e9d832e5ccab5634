//! Ordered progress events per session.
//!
//! Each event is persisted first, then broadcast. The store numbers events,
//! so processes sharing one database never collide. Broadcasting never
//! blocks and never fails when nobody is subscribed; pollers replay from the
//! store with [`EventBus::events_since`].

use std::sync::Arc;

use chrono::Utc;
use siteport_shared::{EventStatus, Phase, ProgressEvent, Result, SessionId};
use siteport_storage::KnowledgeStore;
use tokio::sync::broadcast;
use tracing::debug;

/// Capacity of the live event channel. Slow subscribers see `Lagged`.
const CHANNEL_CAPACITY: usize = 1024;

pub struct EventBus {
    store: Arc<KnowledgeStore>,
    sender: broadcast::Sender<ProgressEvent>,
}

impl EventBus {
    pub fn new(store: Arc<KnowledgeStore>) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { store, sender }
    }

    /// Record and broadcast one event. Sequence numbers are gap-free per session.
    pub async fn emit(
        &self,
        session_id: SessionId,
        phase: Phase,
        status: EventStatus,
        detail: impl Into<String>,
    ) -> Result<ProgressEvent> {
        let mut event = ProgressEvent {
            session_id,
            seq: 0,
            phase,
            status,
            detail: detail.into(),
            at: Utc::now(),
        };
        event.seq = self.store.append_event(&event).await?;

        debug!(%session_id, seq = event.seq, %phase, %status, detail = %event.detail, "progress");
        let _ = self.sender.send(event.clone());
        Ok(event)
    }

    /// Live stream of events from all sessions.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    /// Persisted events of one session after `seq`.
    pub async fn events_since(&self, session_id: SessionId, seq: u64) -> Result<Vec<ProgressEvent>> {
        self.store.events_since(session_id, seq).await
    }
}
