//! Durable storage worker.
//!
//! One worker per service owns the [`PrefStorage`] handle and drains a FIFO
//! command queue. Because every durable operation (reads included) goes
//! through this single queue, a read observes every mutation issued before it,
//! and mutations apply in the order callers issued them.
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::Result;
use tokio::sync::{mpsc, oneshot};

use crate::config::FailurePolicy;
use crate::prefs::cache::PrefCache;
use crate::prefs::completion::CompletionSender;
use crate::prefs::event::{PrefBus, PrefEvent};
use crate::prefs::store::PrefStorage;
use crate::prefs::types::{PrefEntry, PrefFilter, PrefKey, PrefValue, StoreId};

pub(crate) enum StorageCommand {
    Upsert { entry: PrefEntry, done: CompletionSender },
    Delete { filter: PrefFilter, done: CompletionSender },
    Query { key: PrefKey, reply: oneshot::Sender<Result<Option<PrefValue>>> },
    Select { filter: PrefFilter, reply: oneshot::Sender<Result<Vec<PrefEntry>>> },
    Flush { reply: oneshot::Sender<()> },
}

impl std::fmt::Debug for StorageCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageCommand::Upsert { entry, done } => write!(f, "Upsert({}, {})", entry.key, done.id()),
            StorageCommand::Delete { filter, done } => write!(f, "Delete({:?}, {})", filter, done.id()),
            StorageCommand::Query { key, .. } => write!(f, "Query({})", key),
            StorageCommand::Select { filter, .. } => write!(f, "Select({:?})", filter),
            StorageCommand::Flush { .. } => write!(f, "Flush"),
        }
    }
}

pub(crate) struct StorageWorker {
    store_id: StoreId,
    storage: Arc<dyn PrefStorage>,
    cmd_rx: mpsc::UnboundedReceiver<StorageCommand>,
    bus: Arc<PrefBus>,
    cache: Arc<RwLock<PrefCache>>,
    failure_policy: FailurePolicy,
}

impl StorageWorker {
    pub(crate) fn new(
        store_id: StoreId,
        storage: Arc<dyn PrefStorage>,
        cmd_rx: mpsc::UnboundedReceiver<StorageCommand>,
        bus: Arc<PrefBus>,
        cache: Arc<RwLock<PrefCache>>,
        failure_policy: FailurePolicy,
    ) -> Self {
        Self { store_id, storage, cmd_rx, bus, cache, failure_policy }
    }

    /// Runs until every sender is dropped and the queue is drained.
    pub(crate) async fn run(mut self) {
        log::info!("prefs[{}]: storage worker started", self.store_id);
        while let Some(cmd) = self.cmd_rx.recv().await {
            self.handle_command(cmd).await;
        }
        log::info!("prefs[{}]: storage worker stopped", self.store_id);
    }

    async fn handle_command(&mut self, cmd: StorageCommand) {
        log::trace!("prefs[{}]: {:?}", self.store_id, cmd);
        match cmd {
            StorageCommand::Upsert { entry, done } => {
                let row = entry.clone();
                match self.blocking(move |s| s.upsert(&row)).await {
                    Ok(()) => {
                        done.complete();
                        self.bus.publish(PrefEvent::Set {
                            store: self.store_id,
                            key: entry.key,
                            value: entry.value,
                        });
                    }
                    Err(e) => {
                        log::error!("prefs[{}]: {} upsert of {} failed: {:#}", self.store_id, done.id(), entry.key, e);
                        self.on_failure(&PrefFilter::key(&entry.key));
                        done.fail(&e);
                    }
                }
            }
            StorageCommand::Delete { filter, done } => {
                let f = filter.clone();
                match self.blocking(move |s| s.delete_where(&f)).await {
                    Ok(removed) => {
                        log::debug!("prefs[{}]: {} removed {} row(s)", self.store_id, done.id(), removed.len());
                        done.complete();
                        for key in removed {
                            self.bus.publish(PrefEvent::Removed { store: self.store_id, key });
                        }
                    }
                    Err(e) => {
                        log::error!("prefs[{}]: {} delete failed: {:#}", self.store_id, done.id(), e);
                        self.on_failure(&filter);
                        done.fail(&e);
                    }
                }
            }
            StorageCommand::Query { key, reply } => {
                let res = self.blocking(move |s| s.query(&key)).await;
                let _ = reply.send(res);
            }
            StorageCommand::Select { filter, reply } => {
                let res = self.blocking(move |s| s.select(&filter)).await;
                let _ = reply.send(res);
            }
            StorageCommand::Flush { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn on_failure(&self, filter: &PrefFilter) {
        if self.failure_policy == FailurePolicy::Resync {
            let dropped = self.cache.write().unwrap_or_else(PoisonError::into_inner).forget(filter);
            log::warn!("prefs[{}]: resync dropped {} cached entr(ies)", self.store_id, dropped);
        }
    }

    /// Runs a storage call on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn PrefStorage) -> Result<T> + Send + 'static,
    {
        let storage = self.storage.clone();
        tokio::task::spawn_blocking(move || f(storage.as_ref())).await?
    }
}
