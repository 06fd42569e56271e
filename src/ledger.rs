// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Confirmation Ledger
//!
//! Correlates publish sequence numbers with broker confirmations for one confirm-mode
//! channel. The ledger is owned by a single task; the publish loop and the client's
//! confirm and shutdown callbacks only ever reach it through [`LedgerCommand`]s sent
//! over one queue, so commands are applied in the order they were issued.
//!
//! The publish loop enqueues `Track` before it writes the message, which guarantees
//! that a confirmation can never be applied before its entry exists.
//!
//! The task exits, closing the result stream, once
//! - the input is exhausted and every entry has been resolved, or
//! - the channel closed or the operation was terminated, after every outstanding
//!   entry has been emitted as failed followed by the terminal error.

use crate::{
    client::{ConfirmListener, ShutdownListener},
    errors::AmqpError,
    message::{OutboundMessage, OutboundMessageResult},
};
use std::collections::BTreeMap;
use tokio::{
    sync::{mpsc, OwnedSemaphorePermit},
    task::JoinHandle,
};
use tracing::{debug, warn};

pub(crate) type ResultSender = mpsc::UnboundedSender<Result<OutboundMessageResult, AmqpError>>;
pub(crate) type ResultReceiver = mpsc::UnboundedReceiver<Result<OutboundMessageResult, AmqpError>>;

pub(crate) enum LedgerCommand {
    /// A message is about to be written with this sequence number.
    Track {
        seq_no: u64,
        message: OutboundMessage,
        permit: Option<OwnedSemaphorePermit>,
    },
    /// The write for this sequence number failed; no confirmation will follow.
    Untrack { seq_no: u64 },
    Confirm {
        seq_no: u64,
        ack: bool,
        multiple: bool,
    },
    /// No more messages will be tracked.
    InputComplete,
    /// The channel shut down.
    ChannelClosed(AmqpError),
    /// Fail everything outstanding and stop, e.g. on a publish failure or when the
    /// sender's close timeout expired.
    Terminate(AmqpError),
}

struct Pending {
    message: OutboundMessage,
    // released when the entry resolves
    _permit: Option<OwnedSemaphorePermit>,
}

/// Sequence number to pending message for one channel.
pub(crate) struct Ledger {
    channel_id: u16,
    pending: BTreeMap<u64, Pending>,
}

impl Ledger {
    pub(crate) fn new(channel_id: u16) -> Self {
        Ledger {
            channel_id,
            pending: BTreeMap::new(),
        }
    }

    pub(crate) fn track(
        &mut self,
        seq_no: u64,
        message: OutboundMessage,
        permit: Option<OwnedSemaphorePermit>,
    ) {
        self.pending.insert(
            seq_no,
            Pending {
                message,
                _permit: permit,
            },
        );
    }

    pub(crate) fn untrack(&mut self, seq_no: u64) -> Option<OutboundMessage> {
        self.pending.remove(&seq_no).map(|pending| pending.message)
    }

    /// Resolves `seq_no`, or with `multiple` every still-pending entry up to and
    /// including it, in sequence order.
    pub(crate) fn confirm(
        &mut self,
        seq_no: u64,
        ack: bool,
        multiple: bool,
    ) -> Vec<OutboundMessageResult> {
        let resolved = if multiple {
            let rest = match seq_no.checked_add(1) {
                Some(bound) => self.pending.split_off(&bound),
                None => BTreeMap::new(),
            };
            std::mem::replace(&mut self.pending, rest)
        } else {
            self.pending
                .remove_entry(&seq_no)
                .into_iter()
                .collect::<BTreeMap<_, _>>()
        };

        if resolved.is_empty() {
            debug!(seq_no, multiple, "confirmation for unknown sequence number");
        }

        resolved
            .into_iter()
            .map(|(seq, pending)| self.result(seq, pending, ack, None))
            .collect()
    }

    /// Resolves every outstanding entry as failed with `cause`.
    pub(crate) fn fail_all(&mut self, cause: &AmqpError) -> Vec<OutboundMessageResult> {
        std::mem::take(&mut self.pending)
            .into_iter()
            .map(|(seq, pending)| self.result(seq, pending, false, Some(cause.clone())))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn result(
        &self,
        seq_no: u64,
        pending: Pending,
        ack: bool,
        error: Option<AmqpError>,
    ) -> OutboundMessageResult {
        OutboundMessageResult {
            message: pending.message,
            ack,
            channel_id: self.channel_id,
            sequence_number: seq_no,
            error,
        }
    }
}

/// Forwards broker confirmations into the ledger queue.
pub(crate) struct LedgerConfirms(pub(crate) mpsc::UnboundedSender<LedgerCommand>);

impl ConfirmListener for LedgerConfirms {
    fn on_confirm(&self, seq_no: u64, ack: bool, multiple: bool) {
        let _ = self.0.send(LedgerCommand::Confirm {
            seq_no,
            ack,
            multiple,
        });
    }
}

/// Forwards the channel shutdown notice into the ledger queue.
pub(crate) struct LedgerShutdown(pub(crate) mpsc::UnboundedSender<LedgerCommand>);

impl ShutdownListener for LedgerShutdown {
    fn on_shutdown(&self, cause: AmqpError) {
        let cause = match cause {
            AmqpError::ChannelClosedError(_) => cause,
            other => AmqpError::ChannelClosedError(other.to_string()),
        };
        let _ = self.0.send(LedgerCommand::ChannelClosed(cause));
    }
}

/// Starts the ledger task for `channel_id`.
pub(crate) fn spawn(
    channel_id: u16,
    commands: mpsc::UnboundedReceiver<LedgerCommand>,
    results: ResultSender,
) -> JoinHandle<()> {
    tokio::spawn(run(Ledger::new(channel_id), commands, results))
}

async fn run(
    mut ledger: Ledger,
    mut commands: mpsc::UnboundedReceiver<LedgerCommand>,
    results: ResultSender,
) {
    let mut input_complete = false;

    while let Some(command) = commands.recv().await {
        match command {
            LedgerCommand::Track {
                seq_no,
                message,
                permit,
            } => ledger.track(seq_no, message, permit),
            LedgerCommand::Untrack { seq_no } => {
                ledger.untrack(seq_no);
            }
            LedgerCommand::Confirm {
                seq_no,
                ack,
                multiple,
            } => emit(&results, ledger.confirm(seq_no, ack, multiple)),
            LedgerCommand::InputComplete => input_complete = true,
            LedgerCommand::ChannelClosed(cause) | LedgerCommand::Terminate(cause) => {
                if !ledger.is_empty() {
                    warn!(
                        channel = ledger.channel_id,
                        outstanding = ledger.len(),
                        error = cause.to_string(),
                        "failing unconfirmed publishes"
                    );
                }
                emit(&results, ledger.fail_all(&cause));
                let _ = results.send(Err(cause));
                return;
            }
        }

        if input_complete && ledger.is_empty() {
            debug!(channel = ledger.channel_id, "all publishes confirmed");
            return;
        }
        if results.is_closed() {
            debug!(channel = ledger.channel_id, "confirm stream dropped");
            return;
        }
    }

    if !ledger.is_empty() {
        let cause = AmqpError::ChannelClosedError("confirmation ledger abandoned".to_owned());
        emit(&results, ledger.fail_all(&cause));
        let _ = results.send(Err(cause));
    }
}

fn emit(results: &ResultSender, resolved: Vec<OutboundMessageResult>) {
    for result in resolved {
        let _ = results.send(Ok(result));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Semaphore;

    fn message(n: u64) -> OutboundMessage {
        OutboundMessage::new("", "q", n.to_string().into_bytes())
    }

    fn ledger_with(seqs: &[u64]) -> Ledger {
        let mut ledger = Ledger::new(7);
        for seq in seqs {
            ledger.track(*seq, message(*seq), None);
        }
        ledger
    }

    fn seqs(results: &[OutboundMessageResult]) -> Vec<u64> {
        results.iter().map(|r| r.sequence_number()).collect()
    }

    #[test]
    fn single_confirm_resolves_one_entry() {
        let mut ledger = ledger_with(&[1, 2, 3]);

        let resolved = ledger.confirm(2, true, false);

        assert_eq!(seqs(&resolved), vec![2]);
        assert!(resolved[0].is_ack());
        assert_eq!(resolved[0].channel_id(), 7);
        assert_eq!(resolved[0].message().body(), b"2");
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn ranged_confirm_resolves_only_unresolved_entries_up_to_seq() {
        let mut ledger = ledger_with(&[1, 2, 3, 4, 5]);
        ledger.confirm(2, true, false);

        let resolved = ledger.confirm(4, false, true);

        assert_eq!(seqs(&resolved), vec![1, 3, 4]);
        assert!(resolved.iter().all(|r| !r.is_ack() && r.error().is_none()));
        assert_eq!(seqs(&ledger.confirm(5, true, true)), vec![5]);
        assert!(ledger.is_empty());
    }

    #[test]
    fn unknown_confirm_is_ignored() {
        let mut ledger = ledger_with(&[1]);

        assert!(ledger.confirm(9, true, false).is_empty());
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn fail_all_drains_in_sequence_order() {
        let mut ledger = ledger_with(&[3, 1, 2]);
        let cause = AmqpError::ChannelClosedError("gone".to_owned());

        let failed = ledger.fail_all(&cause);

        assert_eq!(seqs(&failed), vec![1, 2, 3]);
        assert!(failed.iter().all(|r| r.error() == Some(&cause)));
        assert!(ledger.is_empty());
    }

    #[test]
    fn resolving_an_entry_releases_its_permit() {
        let permits = Arc::new(Semaphore::new(1));
        let mut ledger = Ledger::new(1);
        let permit = permits.clone().try_acquire_owned().unwrap();
        ledger.track(1, message(1), Some(permit));
        assert_eq!(permits.available_permits(), 0);

        ledger.confirm(1, true, false);

        assert_eq!(permits.available_permits(), 1);
    }

    #[tokio::test]
    async fn task_exits_once_input_is_complete_and_confirmed() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (results_tx, mut results) = mpsc::unbounded_channel();
        let task = spawn(1, rx, results_tx);

        for seq in 1..=2 {
            tx.send(LedgerCommand::Track {
                seq_no: seq,
                message: message(seq),
                permit: None,
            })
            .unwrap();
        }
        tx.send(LedgerCommand::InputComplete).unwrap();
        LedgerConfirms(tx.clone()).on_confirm(2, true, true);

        task.await.unwrap();
        assert_eq!(results.recv().await.unwrap().unwrap().sequence_number(), 1);
        assert_eq!(results.recv().await.unwrap().unwrap().sequence_number(), 2);
        assert!(results.recv().await.is_none());
    }

    #[tokio::test]
    async fn channel_closure_fails_outstanding_then_terminates() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (results_tx, mut results) = mpsc::unbounded_channel();
        let task = spawn(1, rx, results_tx);

        for seq in 1..=3 {
            tx.send(LedgerCommand::Track {
                seq_no: seq,
                message: message(seq),
                permit: None,
            })
            .unwrap();
        }
        tx.send(LedgerCommand::Untrack { seq_no: 3 }).unwrap();
        LedgerShutdown(tx.clone()).on_shutdown(AmqpError::ChannelError("reset".to_owned()));

        task.await.unwrap();
        let mut failed = Vec::new();
        let mut terminal = None;
        while let Some(item) = results.recv().await {
            match item {
                Ok(result) => failed.push(result),
                Err(err) => terminal = Some(err),
            }
        }

        assert_eq!(seqs(&failed), vec![1, 2]);
        assert!(failed.iter().all(|r| !r.is_ack()));
        assert!(terminal.is_some_and(|err| err.is_channel_closed()));
    }
}
