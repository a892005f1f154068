//! Deferred events for the connection manager.
//!
//! Scan windows and the pause between keypad bytes are timers that post an
//! event back into the manager's queue instead of sleeping on its task.
//! Cancelling is done by id: the manager drops expiries it no longer expects.

use crate::infrastructure::bluetooth::scanner::ScanId;
use crate::infrastructure::bluetooth::sequencer::SequenceId;
use crate::infrastructure::bluetooth::service::Event;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    ScanWindowElapsed(ScanId),
    UnlockStep(SequenceId),
}

pub trait Timer: Send {
    fn schedule(&mut self, delay: Duration, event: TimerEvent);
}

/// Timer backed by the tokio clock
pub struct TokioTimer {
    events: mpsc::UnboundedSender<Event>,
}

impl TokioTimer {
    pub fn new(events: mpsc::UnboundedSender<Event>) -> Self {
        Self { events }
    }
}

impl Timer for TokioTimer {
    fn schedule(&mut self, delay: Duration, event: TimerEvent) {
        let sender = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Manager gone means nobody is waiting for this.
            let _ = sender.send(Event::Timer(event));
        });
    }
}
