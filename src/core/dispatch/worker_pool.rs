// Guild-keyed worker pool.
//
// Events for one guild always land on the same worker's queue, so they are
// handled in arrival order; different guilds spread across workers and
// interleave freely. No lock is shared across guilds.

use super::engine::Engine;
use super::event_models::Event;
use crate::core::outbound::ActionSink;
use crate::core::storage::GuildStore;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Queue depth per worker before `submit` applies backpressure.
const WORKER_QUEUE_DEPTH: usize = 256;

pub struct WorkerPool {
    senders: Vec<mpsc::Sender<Event>>,
}

impl WorkerPool {
    /// Spawn `workers` tasks, each draining its own queue through the engine.
    pub fn spawn<S, A>(engine: Arc<Engine<S, A>>, workers: usize) -> Self
    where
        S: GuildStore + 'static,
        A: ActionSink + 'static,
    {
        let workers = workers.max(1);
        let mut senders = Vec::with_capacity(workers);

        for index in 0..workers {
            let (tx, mut rx) = mpsc::channel::<Event>(WORKER_QUEUE_DEPTH);
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    engine.handle(event).await;
                }
                tracing::debug!(worker = index, "event worker shut down");
            });
            senders.push(tx);
        }

        Self { senders }
    }

    fn worker_for(&self, guild_id: u64) -> usize {
        let mut hasher = DefaultHasher::new();
        guild_id.hash(&mut hasher);
        (hasher.finish() % self.senders.len() as u64) as usize
    }

    /// Queue an event on the worker that owns its guild. Waits when that
    /// worker's queue is full.
    pub async fn submit(&self, event: Event) {
        let index = self.worker_for(event.guild_id);
        if self.senders[index].send(event).await.is_err() {
            tracing::error!(worker = index, "event worker is gone, event dropped");
        }
    }
}
