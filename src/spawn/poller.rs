//! Background spawn status poller.
//!
//! Started when a turn begins and stopped when it ends. Every tick re-reads
//! all children of the turn and publishes the full snapshot, but only when
//! it differs from the last one published.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::domain::SpawnStatus;
use crate::error::Result;
use crate::store::Store;

/// One child as the poller sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnSnapshot {
    pub id: String,
    pub profile: String,
    pub status: SpawnStatus,
    pub question: Option<String>,
}

pub struct SpawnPoller;

impl SpawnPoller {
    /// Current children of `parent_turn_id`, in creation order.
    pub fn snapshot(store: &dyn Store, parent_turn_id: &str) -> Result<Vec<SpawnSnapshot>> {
        Ok(store
            .spawns_by_parent(parent_turn_id)?
            .into_iter()
            .map(|s| SpawnSnapshot {
                id: s.id,
                profile: s.profile,
                status: s.status,
                question: s.question,
            })
            .collect())
    }

    /// Start polling. `publish` must not block; it runs on the poller task.
    pub fn start<F>(
        store: Arc<dyn Store>,
        parent_turn_id: String,
        interval: Duration,
        cancel: &CancellationToken,
        publish: F,
    ) -> PollerHandle
    where
        F: Fn(Vec<SpawnSnapshot>) + Send + 'static,
    {
        let token = cancel.child_token();
        let task_token = token.clone();
        let join = tokio::spawn(async move {
            let mut last: Option<Vec<SpawnSnapshot>> = None;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => match Self::snapshot(store.as_ref(), &parent_turn_id) {
                        Ok(current) => {
                            if last.as_ref() != Some(&current) {
                                // An empty first read is not a change
                                if last.is_some() || !current.is_empty() {
                                    publish(current.clone());
                                }
                                last = Some(current);
                            }
                        }
                        Err(e) => tracing::warn!(turn_id = %parent_turn_id, error = %e, "Spawn poll failed"),
                    },
                }
            }
        });
        PollerHandle { token, join }
    }
}

pub struct PollerHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl PollerHandle {
    /// Stop the poller and wait for it to exit.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.join.await {
            tracing::warn!(error = %e, "Spawn poller task failed");
        }
    }
}
