// ABOUTME: Background autosaver task that owns the last state of each entity reported by the UI layer.
// ABOUTME: Callers talk to it through AutosaveHandle over an mpsc channel; saves run on the blocking pool.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rollbook_core::Entity;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};

use crate::entity_store::{EntityStore, SaveOutcome};
use crate::error::StoreError;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum AutosaveError {
    #[error("autosaver has stopped")]
    ChannelClosed,

    #[error("autosave failed: {0}")]
    Store(#[from] StoreError),

    #[error("autosave task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Outcomes of one flush, keyed by entity id.
pub type Saved = BTreeMap<String, SaveOutcome>;

type Reply = oneshot::Sender<Result<Saved, AutosaveError>>;

enum Message {
    Record(Box<Entity>),
    Flush(Reply),
    Shutdown(Reply),
}

/// The most recent unsaved state of each entity. Owned by the autosave task only.
#[derive(Debug, Default)]
pub struct LastKnownState {
    pending: BTreeMap<String, Entity>,
}

impl LastKnownState {
    /// Replace whatever was pending for `entity.id`.
    pub fn record(&mut self, entity: Entity) {
        self.pending.insert(entity.id.clone(), entity);
    }

    /// Remove and return every pending state, ordered by id.
    pub fn take_all(&mut self) -> BTreeMap<String, Entity> {
        std::mem::take(&mut self.pending)
    }

    /// Put back a state whose save failed, unless something newer arrived for the same id.
    pub fn restore(&mut self, entity: Entity) {
        self.pending.entry(entity.id.clone()).or_insert(entity);
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Cloneable handle to a running autosaver.
#[derive(Clone)]
pub struct AutosaveHandle {
    tx: mpsc::Sender<Message>,
}

impl AutosaveHandle {
    /// Report the latest state of an entity. Only the newest recorded state
    /// per id is saved.
    pub async fn record(&self, entity: Entity) -> Result<(), AutosaveError> {
        self.tx
            .send(Message::Record(Box::new(entity)))
            .await
            .map_err(|_| AutosaveError::ChannelClosed)
    }

    /// Save every pending state now. Empty when nothing was pending.
    pub async fn flush(&self) -> Result<Saved, AutosaveError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Message::Flush(tx))
            .await
            .map_err(|_| AutosaveError::ChannelClosed)?;
        rx.await.map_err(|_| AutosaveError::ChannelClosed)?
    }

    /// Flush and stop the task. Later calls on any clone fail with `ChannelClosed`.
    pub async fn shutdown(self) -> Result<Saved, AutosaveError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Message::Shutdown(tx))
            .await
            .map_err(|_| AutosaveError::ChannelClosed)?;
        rx.await.map_err(|_| AutosaveError::ChannelClosed)?
    }
}

pub struct Autosaver {
    store: Arc<EntityStore>,
    state: LastKnownState,
    rx: mpsc::Receiver<Message>,
    interval: Duration,
}

impl Autosaver {
    /// Start the autosave task on the current tokio runtime. Pending state is
    /// saved every `interval`, on `flush`, on `shutdown`, and when the last
    /// handle is dropped.
    pub fn spawn(store: Arc<EntityStore>, interval: Duration) -> AutosaveHandle {
        let (tx, rx) = mpsc::channel(64);
        let saver = Autosaver {
            store,
            state: LastKnownState::default(),
            rx,
            interval,
        };
        tokio::spawn(saver.run());
        AutosaveHandle { tx }
    }

    async fn run(mut self) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(Message::Record(entity)) => self.state.record(*entity),
                    Some(Message::Flush(reply)) => {
                        let _ = reply.send(self.save_pending().await);
                    }
                    Some(Message::Shutdown(reply)) => {
                        self.rx.close();
                        let _ = reply.send(self.save_pending().await);
                        break;
                    }
                    None => {
                        if let Err(e) = self.save_pending().await {
                            tracing::error!("final autosave failed: {}", e);
                        }
                        break;
                    }
                },
                _ = ticker.tick() => {
                    if let Err(e) = self.save_pending().await {
                        tracing::error!("autosave failed; will retry: {}", e);
                    }
                }
            }
        }
        tracing::debug!("autosaver stopped");
    }

    /// Save all pending states. A failed save is put back for the next tick;
    /// the others still go through and the first error is returned.
    async fn save_pending(&mut self) -> Result<Saved, AutosaveError> {
        let pending = self.state.take_all();
        if pending.is_empty() {
            return Ok(Saved::new());
        }

        let store = Arc::clone(&self.store);
        let results = tokio::task::spawn_blocking(move || {
            pending
                .into_values()
                .map(|mut entity| {
                    let result = store.save(&mut entity);
                    (entity, result)
                })
                .collect::<Vec<_>>()
        })
        .await?;

        let mut saved = Saved::new();
        let mut first_error = None;
        for (entity, result) in results {
            match result {
                Ok(outcome) => {
                    tracing::debug!("autosaved {}", entity.id);
                    saved.insert(entity.id, outcome);
                }
                Err(e) => {
                    tracing::warn!("autosave of {} failed, kept pending: {}", entity.id, e);
                    self.state.restore(entity);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(saved),
        }
    }
}
