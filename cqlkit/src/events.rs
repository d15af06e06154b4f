//! Server push events. The control connection registers for all of them and republishes
//! every received event to session subscribers, see
//! [`Session::listen`](crate::cluster::session::Session::listen).
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use tracing::*;

use crate::frame::events::{
    SchemaChange as FrameSchemaChange, ServerEvent as FrameServerEvent,
    SimpleServerEvent as FrameSimpleServerEvent,
};

/// Full Server Event which includes all details about occurred change.
pub type ServerEvent = FrameServerEvent;

/// Simplified Server event, used when registering for events.
pub type SimpleServerEvent = FrameSimpleServerEvent;

/// Reexport of `FrameSchemaChange`.
pub type SchemaChange = FrameSchemaChange;

pub(crate) const ALL_EVENTS: [SimpleServerEvent; 3] = [
    SimpleServerEvent::TopologyChange,
    SimpleServerEvent::StatusChange,
    SimpleServerEvent::SchemaChange,
];

/// Stream of events received by the session. Slow consumers skip events they were too late to
/// see instead of failing.
#[derive(Debug)]
pub struct EventStream {
    receiver: Receiver<ServerEvent>,
}

impl EventStream {
    pub(crate) fn new(receiver: Receiver<ServerEvent>) -> Self {
        EventStream { receiver }
    }

    /// Waits for the next event. Returns `None` once the session is gone.
    pub async fn next(&mut self) -> Option<ServerEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event stream lagging behind, events skipped.");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Returns an already received event, if any, without waiting.
    pub fn try_next(&mut self) -> Option<ServerEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(tokio::sync::broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}
