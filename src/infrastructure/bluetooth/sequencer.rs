//! Unlock Sequencer
//!
//! Types the passcode on the lock keypad one key at a time. The lock drops
//! keys that arrive back-to-back, so every key after the first is released
//! by a timer step rather than written immediately. The sequencer only
//! decides *what* comes next; the connection manager performs the writes
//! and schedules the steps.

use crate::domain::error::{LockError, Result};
use crate::domain::models::Passcode;
use crate::infrastructure::bluetooth::protocol::Command;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SequenceId(u64);

/// Next key to write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceStep {
    pub id: SequenceId,
    pub command: Command,
    /// ENTER was handed out; the sequence is over once it is written
    pub is_last: bool,
}

#[derive(Debug)]
struct ActiveSequence {
    id: SequenceId,
    remaining: VecDeque<Command>,
}

#[derive(Debug)]
pub struct UnlockSequencer {
    active: Option<ActiveSequence>,
    next_id: u64,
    key_delay: Duration,
}

impl UnlockSequencer {
    pub fn new(key_delay: Duration) -> Self {
        Self {
            active: None,
            next_id: 0,
            key_delay,
        }
    }

    pub fn key_delay(&self) -> Duration {
        self.key_delay
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Begin a sequence and return its first key.
    ///
    /// Fails with `NotConnected` before anything is queued when the lock is
    /// not connected.
    pub fn submit(&mut self, passcode: &Passcode, connected: bool) -> Result<SequenceStep> {
        if !connected {
            return Err(LockError::NotConnected);
        }
        if self.active.is_some() {
            return Err(LockError::UnlockInProgress);
        }

        self.next_id += 1;
        let id = SequenceId(self.next_id);
        let remaining = passcode
            .digits()
            .iter()
            .map(|d| Command::Digit(*d))
            .chain(std::iter::once(Command::Enter))
            .collect();
        info!("Submitting passcode {} ({:?})", passcode, id);
        self.active = Some(ActiveSequence { id, remaining });

        self.next_step(id)
            .ok_or_else(|| LockError::invalid_passcode("passcode is empty"))
    }

    /// Timer step fired. Stale ids (cancelled or finished sequences) yield nothing.
    pub fn next_step(&mut self, id: SequenceId) -> Option<SequenceStep> {
        let active = self.active.as_mut().filter(|active| active.id == id)?;
        let command = active.remaining.pop_front()?;
        let is_last = active.remaining.is_empty();
        if is_last {
            self.active = None;
        }
        debug!("Unlock step {:?}: {:?}", id, command);
        Some(SequenceStep {
            id,
            command,
            is_last,
        })
    }

    /// Stop emitting keys. Returns true if a sequence was running.
    pub fn cancel(&mut self) -> bool {
        match self.active.take() {
            Some(active) => {
                info!(
                    "Unlock sequence {:?} cancelled with {} keys unsent",
                    active.id,
                    active.remaining.len()
                );
                true
            }
            None => false,
        }
    }
}
