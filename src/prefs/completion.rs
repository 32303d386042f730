//! Single-shot completion handles for mutating operations.
//!
//! Every accepted mutation walks through
//! `Validated -> CacheApplied -> DurablePending -> Completed | Failed`.
//! The service drives the first three synchronously, so a freshly returned
//! [`Completion`] reports `DurablePending`: the cache already reflects the
//! operation while the durable store has not caught up yet.
use std::fmt::Display;

use tokio::sync::watch;

use crate::errors::PrefsError;

/// Sequence number of an operation within one service instance.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(pub(crate) u64);

impl Display for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OpState {
    Validated,
    CacheApplied,
    DurablePending,
    Completed,
    Failed(String),
}

impl OpState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OpState::Completed | OpState::Failed(_))
    }
}

/// Caller side: observe the state or wait for the durable outcome.
#[derive(Debug)]
pub struct Completion {
    id: OpId,
    state: watch::Receiver<OpState>,
}

/// Service side. Consumed by `complete`/`fail`, so the outcome is reported once.
#[derive(Debug)]
pub(crate) struct CompletionSender {
    id: OpId,
    tx: watch::Sender<OpState>,
}

pub(crate) fn completion_pair(id: OpId) -> (CompletionSender, Completion) {
    let (tx, rx) = watch::channel(OpState::Validated);
    (CompletionSender { id, tx }, Completion { id, state: rx })
}

impl CompletionSender {
    pub(crate) fn id(&self) -> OpId {
        self.id
    }

    pub(crate) fn advance(&self, state: OpState) {
        self.tx.send_replace(state);
    }

    pub(crate) fn complete(self) {
        self.tx.send_replace(OpState::Completed);
    }

    pub(crate) fn fail(self, err: &anyhow::Error) {
        self.tx.send_replace(OpState::Failed(format!("{:#}", err)));
    }
}

impl Completion {
    pub fn id(&self) -> OpId {
        self.id
    }

    /// Current state, without waiting.
    pub fn state(&self) -> OpState {
        self.state.borrow().clone()
    }

    pub fn is_done(&self) -> bool {
        self.state.borrow().is_terminal()
    }

    /// Waits until the durable store has applied (or failed to apply) the operation.
    pub async fn wait(mut self) -> Result<(), PrefsError> {
        loop {
            match &*self.state.borrow_and_update() {
                OpState::Completed => return Ok(()),
                OpState::Failed(msg) => return Err(PrefsError::DurableFailure(msg.clone())),
                _ => {}
            }
            if self.state.changed().await.is_err() {
                // Sender is gone; the last value it sent is final.
                return match &*self.state.borrow() {
                    OpState::Completed => Ok(()),
                    OpState::Failed(msg) => Err(PrefsError::DurableFailure(msg.clone())),
                    _ => Err(PrefsError::StoreClosed),
                };
            }
        }
    }
}
