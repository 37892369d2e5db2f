//! Command queue for the browser-extension bridge.
//!
//! A tool invocation enqueues a command and blocks on its result; the
//! extension drains pending commands over HTTP and posts completions
//! back. The queue is the rendezvous between the two: completions that
//! arrive early are held for the next waiter, waiters that are already
//! parked are woken, and each completion is delivered exactly once.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Actions the extension understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandAction {
    Navigate,
    Click,
    Type,
    Snapshot,
    Screenshot,
    Console,
    Wait,
}

impl CommandAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandAction::Navigate => "navigate",
            CommandAction::Click => "click",
            CommandAction::Type => "type",
            CommandAction::Snapshot => "snapshot",
            CommandAction::Screenshot => "screenshot",
            CommandAction::Console => "console",
            CommandAction::Wait => "wait",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "navigate" => Some(CommandAction::Navigate),
            "click" => Some(CommandAction::Click),
            "type" => Some(CommandAction::Type),
            "snapshot" => Some(CommandAction::Snapshot),
            "screenshot" => Some(CommandAction::Screenshot),
            "console" => Some(CommandAction::Console),
            "wait" => Some(CommandAction::Wait),
            _ => None,
        }
    }
}

/// A queued browser command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: Uuid,
    pub action: CommandAction,
    pub params: Value,
    pub created_at: DateTime<Utc>,
}

impl Command {
    pub fn new(action: CommandAction, params: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            action,
            params,
            created_at: Utc::now(),
        }
    }
}

/// Completion record posted by the extension.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub command_id: Uuid,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl CommandOutcome {
    pub fn ok(command_id: Uuid, result: Value) -> Self {
        Self {
            command_id,
            success: true,
            result: Some(result),
            error: None,
            completed_at: Utc::now(),
        }
    }

    pub fn failed(command_id: Uuid, error: impl Into<String>) -> Self {
        Self {
            command_id,
            success: false,
            result: None,
            error: Some(error.into()),
            completed_at: Utc::now(),
        }
    }
}

#[derive(Default)]
struct QueueInner {
    /// Commands waiting for the extension's next poll, FIFO.
    pending: VecDeque<Command>,
    /// Completions that arrived before their waiter.
    completions: HashMap<Uuid, CommandOutcome>,
    /// Parked waiters, one per command id.
    waiters: HashMap<Uuid, oneshot::Sender<CommandOutcome>>,
}

/// Multi-producer, multi-consumer command rendezvous.
///
/// The timed wait is a oneshot channel raced against
/// `tokio::time::timeout`; state transitions happen under one mutex so
/// a completion is consumed by exactly one waiter.
#[derive(Default)]
pub struct CommandQueue {
    inner: Mutex<QueueInner>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a command for the extension's next poll.
    pub fn enqueue(&self, command: Command) {
        let mut inner = self.inner.lock();
        debug!(
            command_id = %command.id,
            action = command.action.as_str(),
            "Enqueued browser command"
        );
        inner.pending.push_back(command);
    }

    /// Atomically take every pending command, preserving enqueue order.
    pub fn drain_pending(&self) -> Vec<Command> {
        let mut inner = self.inner.lock();
        inner.pending.drain(..).collect()
    }

    /// Number of commands waiting to be polled.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Record a completion. Wakes the parked waiter when there is one,
    /// otherwise stores the record for the next waiter. Unknown ids are
    /// stored too; they are dropped when consumed or on `clear`.
    pub fn complete(&self, outcome: CommandOutcome) {
        let mut inner = self.inner.lock();
        let id = outcome.command_id;

        if let Some(waiter) = inner.waiters.remove(&id) {
            // A closed receiver means the waiter timed out between
            // deregistering and now; fall back to storing the record.
            if let Err(returned) = waiter.send(outcome) {
                inner.completions.insert(id, returned);
            }
        } else if inner.completions.insert(id, outcome).is_some() {
            warn!(command_id = %id, "Duplicate completion replaced an unconsumed record");
        }
    }

    /// Block until the completion for `id` arrives, or fail with
    /// [`Error::CommandTimeout`] after `timeout`.
    ///
    /// A record stored before this call is consumed immediately.
    pub async fn wait_for_result(&self, id: Uuid, timeout: Duration) -> Result<CommandOutcome> {
        let rx = {
            let mut inner = self.inner.lock();

            if let Some(outcome) = inner.completions.remove(&id) {
                return Ok(outcome);
            }

            let (tx, rx) = oneshot::channel();
            if inner.waiters.insert(id, tx).is_some() {
                warn!(command_id = %id, "Replaced an existing waiter for the same command");
            }
            rx
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => {
                // Sender dropped without a value: the queue was cleared.
                Err(Error::CommandTimeout(timeout.as_millis() as u64))
            },
            Err(_) => {
                let mut inner = self.inner.lock();
                inner.waiters.remove(&id);
                // The completion may have landed between the timeout
                // firing and the lock being taken; deliver it if so.
                if let Some(outcome) = inner.completions.remove(&id) {
                    return Ok(outcome);
                }
                Err(Error::CommandTimeout(timeout.as_millis() as u64))
            },
        }
    }

    /// Drop all pending commands, stored completions and waiters.
    /// Parked waiters observe a timeout-class error.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        let dropped = inner.pending.len() + inner.completions.len() + inner.waiters.len();
        inner.pending.clear();
        inner.completions.clear();
        inner.waiters.clear();
        if dropped > 0 {
            debug!(dropped, "Cleared command queue");
        }
    }
}
