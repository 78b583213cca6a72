//! Shared application state for the operator API server.
//!
//! [`AppState`] holds the [`ControlPlane`] the handlers drive and the
//! broadcast channel that fans evolution events and lock transitions out
//! to `WebSocket` clients.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use vigil_types::EvolutionEvent;

use crate::control::ControlPlane;

/// Capacity of the broadcast channel.
///
/// If a subscriber falls behind by more than this many messages it will
/// receive a [`broadcast::error::RecvError::Lagged`] and skip to the
/// newest message.
const BROADCAST_CAPACITY: usize = 256;

/// JSON message pushed over the `WebSocket`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stream", rename_all = "snake_case")]
pub enum StreamMessage {
    /// An evolution loop event.
    Evolution {
        /// The event as published by the loop.
        event: EvolutionEvent,
    },
    /// The manual-session lock changed hands.
    Lock {
        /// New held state.
        held: bool,
    },
}

/// Shared state for the Axum application.
#[derive(Clone)]
pub struct AppState {
    /// Broadcast sender for stream messages.
    pub tx: broadcast::Sender<StreamMessage>,
    /// The coordination core.
    pub control: Arc<dyn ControlPlane>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("receivers", &self.tx.receiver_count())
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// Create state around `control` with a fresh broadcast channel.
    pub fn new(control: Arc<dyn ControlPlane>) -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx, control }
    }

    /// Subscribe to the stream.
    pub fn subscribe(&self) -> broadcast::Receiver<StreamMessage> {
        self.tx.subscribe()
    }

    /// Publish a message to all connected clients.
    ///
    /// Returns the number of receivers that received the message.
    /// Returns 0 if no clients are connected (this is not an error).
    pub fn broadcast(&self, message: &StreamMessage) -> usize {
        self.tx.send(message.clone()).unwrap_or(0)
    }
}
