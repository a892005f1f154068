//! In-process publish/subscribe for [`AppEvent`]s.
//!
//! Best effort: publishing never blocks and never fails, a subscriber that
//! falls behind by more than the channel capacity loses the oldest events.

use crate::domain::models::{AppEvent, MessageSeverity, StatusMessage};
use tokio::sync::broadcast;
use tracing::trace;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<AppEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub fn publish(&self, event: AppEvent) {
        trace!("Publishing {:?}", event);
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }

    pub fn log(&self, message: impl Into<String>, severity: MessageSeverity) {
        self.publish(AppEvent::LogMessage(StatusMessage::new(message, severity)));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::ConnectionState;

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        bus.publish(AppEvent::ScanningChanged(true));
    }

    #[tokio::test]
    async fn test_every_subscriber_receives() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish(AppEvent::ConnectionStateChanged(ConnectionState::Connecting));

        for rx in [&mut a, &mut b] {
            match rx.recv().await.unwrap() {
                AppEvent::ConnectionStateChanged(state) => {
                    assert_eq!(state, ConnectionState::Connecting)
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
    }
}
