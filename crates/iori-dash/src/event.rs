use std::time::Duration;

use tokio::sync::mpsc;

use crate::StreamType;

/// Notifications delivered to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerEvent {
    /// The first manifest was applied and downloads have begun.
    PlayReady,
    ClipDurationChanged(Duration),
    BufferingStarted(StreamType),
    BufferingCompleted(StreamType),
    EndOfStream(StreamType),
    /// A terminal failure. The affected pipeline has shut down.
    StreamError(String),
}

/// Cloneable sending half of the application event channel.
#[derive(Debug, Clone)]
pub struct EventSender(mpsc::UnboundedSender<PlayerEvent>);

pub type EventReceiver = mpsc::UnboundedReceiver<PlayerEvent>;

impl EventSender {
    pub fn channel() -> (Self, EventReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self(sender), receiver)
    }

    pub fn send(&self, event: PlayerEvent) {
        tracing::debug!(?event, "player event");
        // The application may have stopped listening.
        let _ = self.0.send(event);
    }
}
