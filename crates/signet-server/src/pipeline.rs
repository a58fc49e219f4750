//! Consumer groups that drain the change log into the search index and out
//! to live connections.

use std::sync::Arc;

use serde::Serialize;
use signet_changelog::{
    spawn_consumer_group, ConsumerGroupHandle, ConsumerStats, ConsumerStatsSnapshot, LogHead,
};
use signet_db::DbPool;
use signet_search::{Projector, ProjectorStats, ProjectorStatsSnapshot, SqliteSearchIndex};
use tokio_util::sync::CancellationToken;

use crate::broadcaster::{Broadcaster, BroadcasterStats, BroadcasterStatsSnapshot};
use crate::config::ChangeLogConfig;
use crate::registry::ConnectionRegistry;

pub const SEARCH_GROUP: &str = "search-projector";
pub const BROADCAST_GROUP: &str = "broadcaster";

/// Running consumer groups.
pub struct Pipeline {
    cancel: CancellationToken,
    groups: Vec<ConsumerGroupHandle>,
    status: PipelineStatus,
}

/// Cloneable view of the pipeline's counters for the HTTP layer.
#[derive(Clone)]
pub struct PipelineStatus {
    cancel: CancellationToken,
    search: Arc<ConsumerStats>,
    broadcast: Arc<ConsumerStats>,
    projector: Arc<ProjectorStats>,
    broadcaster: Arc<BroadcasterStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatsSnapshot {
    pub running: bool,
    pub search_consumer: ConsumerStatsSnapshot,
    pub projector: ProjectorStatsSnapshot,
    pub broadcast_consumer: ConsumerStatsSnapshot,
    pub broadcaster: BroadcasterStatsSnapshot,
}

impl PipelineStatus {
    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            running: self.is_running(),
            search_consumer: self.search.snapshot(),
            projector: self.projector.snapshot(),
            broadcast_consumer: self.broadcast.snapshot(),
            broadcaster: self.broadcaster.snapshot(),
        }
    }
}

impl Pipeline {
    /// Starts the search projector and broadcaster groups. Both stop when
    /// `cancel` fires.
    pub fn start(
        pool: DbPool,
        head: LogHead,
        registry: ConnectionRegistry,
        config: &ChangeLogConfig,
        cancel: CancellationToken,
    ) -> Self {
        let projector = Arc::new(Projector::new(Arc::new(SqliteSearchIndex::new(pool.clone()))));
        let projector_stats = projector.stats();
        let search = spawn_consumer_group(
            pool.clone(),
            head.clone(),
            projector,
            config.consumer(SEARCH_GROUP),
            cancel.clone(),
        );

        let broadcaster = Arc::new(Broadcaster::new(registry));
        let broadcaster_stats = broadcaster.stats();
        let broadcast = spawn_consumer_group(
            pool,
            head,
            broadcaster,
            config.consumer(BROADCAST_GROUP),
            cancel.clone(),
        );

        let status = PipelineStatus {
            cancel: cancel.clone(),
            search: Arc::clone(&search.stats),
            broadcast: Arc::clone(&broadcast.stats),
            projector: projector_stats,
            broadcaster: broadcaster_stats,
        };

        Self {
            cancel,
            groups: vec![search, broadcast],
            status,
        }
    }

    pub fn status(&self) -> PipelineStatus {
        self.status.clone()
    }

    /// Cancels every worker and waits for them to finish their current step.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for group in self.groups {
            group.join().await;
        }
        tracing::info!("change-log consumers stopped");
    }
}
