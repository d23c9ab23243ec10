//! Pending command tracking.
//!
//! Maps command ids to waiting callers until the terminal ack arrives or
//! the command's TTL timer fires. Each entry carries a oneshot resolver
//! and the handle of its timeout task.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::domain::foundation::{MessageId, Namespace, Timestamp};
use crate::domain::message::{AckPayload, BridgeMessage};

/// One command awaiting its terminal ack.
pub struct PendingCommand {
    pub message: BridgeMessage,
    pub sent_at: Timestamp,
    resolver: oneshot::Sender<AckPayload>,
    timeout: Option<JoinHandle<()>>,
}

impl PendingCommand {
    /// Cancels the timeout timer and resolves the waiter.
    pub fn resolve(mut self, ack: AckPayload) {
        if let Some(handle) = self.timeout.take() {
            handle.abort();
        }
        // The caller may have dropped its receiver; that is fine.
        let _ = self.resolver.send(ack);
    }
}

/// Registry of in-flight commands keyed by message id.
#[derive(Default)]
pub struct PendingCommands {
    pending: Mutex<HashMap<MessageId, PendingCommand>>,
}

impl PendingCommands {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a command and returns the receiver its terminal ack
    /// will be delivered on.
    pub fn register(
        &self,
        message: BridgeMessage,
        sent_at: Timestamp,
        timeout: Option<JoinHandle<()>>,
    ) -> oneshot::Receiver<AckPayload> {
        let (tx, rx) = oneshot::channel();
        let id = message.id;
        let entry = PendingCommand {
            message,
            sent_at,
            resolver: tx,
            timeout,
        };
        if self.pending.lock().insert(id, entry).is_some() {
            debug!(command_id = %id, "replaced pending command with duplicate id");
        }
        rx
    }

    /// Removes and returns the pending entry for a command, if any.
    pub fn take(&self, id: &MessageId) -> Option<PendingCommand> {
        self.pending.lock().remove(id)
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.pending.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Removes every pending command addressed to `target`, including
    /// commands whose address resolved to it by prefix.
    pub fn take_for_target(&self, target: &Namespace) -> Vec<PendingCommand> {
        let mut pending = self.pending.lock();
        let doomed: Vec<MessageId> = pending
            .iter()
            .filter(|(_, cmd)| {
                cmd.message.target.as_ref().is_some_and(|addressed| {
                    addressed == target
                        || addressed.prefixes().any(|p| p == target.as_str())
                })
            })
            .map(|(id, _)| *id)
            .collect();
        doomed
            .into_iter()
            .filter_map(|id| pending.remove(&id))
            .collect()
    }

    /// Drains every pending command.
    pub fn take_all(&self) -> Vec<PendingCommand> {
        let mut pending = self.pending.lock();
        pending.drain().map(|(_, cmd)| cmd).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::foundation::{Namespace, SystemClock};
    use crate::domain::message::{AckStatus, CommandPayload, MessagePayload};

    fn ns(s: &str) -> Namespace {
        Namespace::new(s).unwrap()
    }

    fn command(target: &str) -> BridgeMessage {
        BridgeMessage::new(
            ns("app.test"),
            MessagePayload::Command(CommandPayload {
                action: "press".to_string(),
                params: None,
            }),
            &SystemClock,
            0,
        )
        .with_target(ns(target))
        .with_idempotency_key("k")
    }

    fn ack_for(message: &BridgeMessage) -> AckPayload {
        AckPayload {
            status: AckStatus::Completed,
            command_id: message.id,
            result: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn resolve_delivers_to_the_waiter() {
        let pending = PendingCommands::new();
        let message = command("companion");
        let id = message.id;
        let ack = ack_for(&message);

        let rx = pending.register(message, Timestamp::from_millis(0), None);
        pending.take(&id).unwrap().resolve(ack.clone());

        assert_eq!(rx.await.unwrap(), ack);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn take_for_target_drains_only_that_namespace() {
        let pending = PendingCommands::new();
        let to_companion = command("companion");
        let to_other = command("app.other");

        let _rx1 = pending.register(to_companion, Timestamp::from_millis(0), None);
        let _rx2 = pending.register(to_other, Timestamp::from_millis(0), None);

        let drained = pending.take_for_target(&ns("companion"));
        assert_eq!(drained.len(), 1);
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn take_for_target_catches_prefix_addressed_commands() {
        let pending = PendingCommands::new();
        let _rx = pending.register(
            command("companion.satellite"),
            Timestamp::from_millis(0),
            None,
        );

        let drained = pending.take_for_target(&ns("companion"));
        assert_eq!(drained.len(), 1);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn take_all_empties_the_registry() {
        let pending = PendingCommands::new();
        let _rx1 = pending.register(command("a"), Timestamp::from_millis(0), None);
        let _rx2 = pending.register(command("b"), Timestamp::from_millis(0), None);

        assert_eq!(pending.take_all().len(), 2);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn resolve_aborts_the_timeout_task() {
        let pending = PendingCommands::new();
        let message = command("companion");
        let id = message.id;
        let ack = ack_for(&message);

        let timer = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        });
        let _rx = pending.register(message, Timestamp::from_millis(0), Some(timer));

        let entry = pending.take(&id).unwrap();
        entry.resolve(ack);
        // Aborting is fire-and-forget; yielding lets the abort land.
        tokio::task::yield_now().await;
    }

    #[tokio::test]
    async fn dropped_receiver_does_not_panic_resolution() {
        let pending = PendingCommands::new();
        let message = command("companion");
        let id = message.id;
        let ack = ack_for(&message);

        let rx = pending.register(message, Timestamp::from_millis(0), None);
        drop(rx);
        pending.take(&id).unwrap().resolve(ack);
    }
}
