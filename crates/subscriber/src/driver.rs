//! Pumps a chain source's notifications into the engine, in delivery order.

use crate::engine::{Engine, EngineError, Lifecycle};
use crate::head::Head;
use futures_util::{pin_mut, Stream, StreamExt};
use serde::{Deserialize, Serialize};

/// Notification from the chain-head source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ChainEvent {
    Connected { head: Head },
    NewHead { head: Head },
    Disconnected,
}

/// Why [drive] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveExit {
    /// The stream ended; the engine was disconnected.
    SourceClosed,
    Stopped,
}

/// Feeds `events` to `engine` until the stream ends or the engine is stopped.
///
/// A second `Connected` without an intervening `Disconnected` is treated as a resync.
pub async fn drive<S>(engine: &Engine, events: S) -> DriveExit
where
    S: Stream<Item = ChainEvent>,
{
    pin_mut!(events);
    while let Some(event) = events.next().await {
        match event {
            ChainEvent::Connected { head } => match engine.connect(head).await {
                Ok(()) => {}
                Err(EngineError::AlreadyConnected) => {
                    tracing::warn!(height = head.height, "chain source reconnected without disconnect; resyncing");
                    engine.disconnect().await;
                    if let Err(e) = engine.connect(head).await {
                        tracing::warn!(reason = %e, "resync connect failed");
                    }
                }
                Err(EngineError::Stopped) => return DriveExit::Stopped,
                Err(e) => tracing::warn!(reason = %e, "connect rejected"),
            },
            ChainEvent::NewHead { head } => engine.on_new_longest_chain(head).await,
            ChainEvent::Disconnected => engine.disconnect().await,
        }
        if engine.lifecycle().await == Lifecycle::Stopped {
            return DriveExit::Stopped;
        }
    }
    engine.disconnect().await;
    DriveExit::SourceClosed
}
