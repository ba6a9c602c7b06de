//! Retrying RPC dispatch.
//!
//! Every metadata operation runs as a task: resolve the target partition and
//! leader from the cache, invoke the call, then map the reply. Transient
//! failures (transport errors, timeouts, redirects, stale tx ids) recover
//! here with bounded exponential backoff; everything else surfaces to the
//! caller unchanged. Operations on the same inode serialize client-side
//! unless the rename-parallel escape hatch is on.

use dashmap::DashMap;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::meta::cache::MetaCache;
use crate::meta::types::{InodeId, MetaStatus, PartitionId};
use crate::rpc::{RequestContext, RpcError, RpcResult};

const BACKOFF_CAP: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Per-attempt RPC timeout.
    pub timeout: Duration,
    pub max_retry: u32,
    /// Base backoff, doubled per attempt with jitter.
    pub backoff: Duration,
    pub stream_idle_timeout: Duration,
    /// Allow rename sub-steps on the same inode to dispatch concurrently.
    pub enable_rename_parallel: bool,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            max_retry: 5,
            backoff: Duration::from_millis(100),
            stream_idle_timeout: Duration::from_secs(10),
            enable_rename_parallel: false,
        }
    }
}

/// What one task dispatches against.
#[derive(Debug, Clone, Copy)]
pub struct TaskContext {
    pub op: &'static str,
    /// Inode used for routing and client-side serialization; 0 for routed
    /// tasks that target an explicit partition.
    pub inode_id: InodeId,
    pub partition_id: Option<PartitionId>,
    pub rename_parallel: bool,
    pub deadline: Option<Instant>,
}

impl TaskContext {
    /// Dispatch by owning partition of `inode_id`.
    pub fn dispatch(op: &'static str, inode_id: InodeId) -> Self {
        Self {
            op,
            inode_id,
            partition_id: None,
            rename_parallel: false,
            deadline: None,
        }
    }

    /// Dispatch to an explicit partition.
    pub fn routed(op: &'static str, partition_id: PartitionId) -> Self {
        Self {
            op,
            inode_id: 0,
            partition_id: Some(partition_id),
            rename_parallel: false,
            deadline: None,
        }
    }

    pub fn with_rename_parallel(mut self, enabled: bool) -> Self {
        self.rename_parallel = enabled;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

pub struct TaskExecutor {
    options: ExecutorOptions,
    cache: Arc<MetaCache>,
    inflight: DashMap<InodeId, Arc<Mutex<()>>>,
}

impl TaskExecutor {
    pub fn new(options: ExecutorOptions, cache: Arc<MetaCache>) -> Arc<Self> {
        Arc::new(Self {
            options,
            cache,
            inflight: DashMap::new(),
        })
    }

    pub fn options(&self) -> &ExecutorOptions {
        &self.options
    }

    pub fn cache(&self) -> &Arc<MetaCache> {
        &self.cache
    }

    /// Run `call` until it returns a terminal status or the task deadline
    /// passes. `call` must be idempotent: it may be invoked several times.
    pub async fn execute<T, F, Fut>(&self, task: TaskContext, call: F) -> Result<T, MetaStatus>
    where
        F: Fn(RequestContext) -> Fut,
        Fut: Future<Output = RpcResult<T>>,
    {
        let _serial = self.acquire_serialization(&task).await;

        let deadline = task.deadline.unwrap_or_else(|| {
            Instant::now() + self.options.timeout * (self.options.max_retry + 1)
        });
        let mut attempt: u32 = 0;
        loop {
            let now = Instant::now();
            if now >= deadline {
                warn!(op = task.op, "task deadline exceeded");
                return Err(MetaStatus::DeadlineExceeded);
            }

            let target = match task.partition_id {
                Some(partition_id) => self.cache.resolve_partition(partition_id).await?,
                None => self.cache.resolve(task.inode_id).await?,
            };
            let rctx = RequestContext {
                pool_id: target.pool_id,
                copyset_id: target.copyset_id,
                partition_id: target.partition_id,
                fs_id: self.cache.fs_id(),
                tx_id: target.tx_id,
                applied_index: self.cache.get_apply_index(target.copyset_id),
                leader: target.leader,
            };

            let per_attempt = self.options.timeout.min(deadline - now);
            let outcome = tokio::time::timeout(per_attempt, call(rctx)).await;

            let reply = match outcome {
                Err(_) => {
                    debug!(op = task.op, attempt, "rpc attempt timed out");
                    self.recover_transient(&task, target.pool_id, target.copyset_id, &mut attempt)
                        .await?;
                    continue;
                }
                Ok(Err(RpcError::Timeout)) => {
                    debug!(op = task.op, attempt, "transport reported timeout");
                    self.recover_transient(&task, target.pool_id, target.copyset_id, &mut attempt)
                        .await?;
                    continue;
                }
                Ok(Err(RpcError::Transport(reason))) => {
                    debug!(op = task.op, attempt, reason, "transport failure");
                    self.recover_transient(&task, target.pool_id, target.copyset_id, &mut attempt)
                        .await?;
                    continue;
                }
                Ok(Ok(reply)) => reply,
            };

            match reply.status {
                MetaStatus::Ok => {
                    let Some(applied_index) = reply.applied_index else {
                        // A partition answering OK without an apply index has
                        // broken its contract; surface it, never cache it.
                        error!(
                            op = task.op,
                            partition = target.partition_id,
                            "OK reply without apply index"
                        );
                        return Err(MetaStatus::Internal);
                    };
                    self.cache
                        .update_apply_index(target.copyset_id, applied_index);
                    return reply.body.ok_or_else(|| {
                        error!(op = task.op, "OK reply without body");
                        MetaStatus::Internal
                    });
                }
                MetaStatus::Redirect => {
                    match reply.redirect {
                        Some(leader) => {
                            self.cache
                                .set_leader(target.pool_id, target.copyset_id, leader);
                        }
                        None => {
                            let _ = self
                                .cache
                                .refresh_leader(target.pool_id, target.copyset_id)
                                .await;
                        }
                    }
                    self.backoff_or_fail(&task, &mut attempt).await?;
                }
                MetaStatus::StaleTx => {
                    match reply.latest_tx_id {
                        Some(tx_id) => self.cache.set_tx_id(target.partition_id, tx_id),
                        None => self.cache.refresh().await?,
                    }
                    self.backoff_or_fail(&task, &mut attempt).await?;
                }
                MetaStatus::PartitionNotFound => {
                    self.cache.invalidate_partition(target.partition_id);
                    return Err(MetaStatus::PartitionNotFound);
                }
                status => {
                    if status != MetaStatus::NotFound {
                        warn!(
                            op = task.op,
                            partition = target.partition_id,
                            status = status.name(),
                            "rpc failed"
                        );
                    }
                    return Err(status);
                }
            }
        }
    }

    async fn acquire_serialization(
        &self,
        task: &TaskContext,
    ) -> Option<tokio::sync::OwnedMutexGuard<()>> {
        if task.inode_id == 0 || (task.rename_parallel && self.options.enable_rename_parallel) {
            return None;
        }
        let lock = self
            .inflight
            .entry(task.inode_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock_owned().await;
        Some(guard)
    }

    async fn recover_transient(
        &self,
        task: &TaskContext,
        pool_id: u32,
        copyset_id: u32,
        attempt: &mut u32,
    ) -> Result<(), MetaStatus> {
        let _ = self.cache.refresh_leader(pool_id, copyset_id).await;
        self.backoff_or_fail(task, attempt).await
    }

    async fn backoff_or_fail(&self, task: &TaskContext, attempt: &mut u32) -> Result<(), MetaStatus> {
        *attempt += 1;
        if *attempt > self.options.max_retry {
            warn!(op = task.op, attempts = *attempt, "retry budget exhausted");
            return Err(MetaStatus::DeadlineExceeded);
        }
        let base = self.options.backoff * 2u32.saturating_pow(*attempt - 1);
        let jitter_ms = rand::thread_rng().gen_range(0..=self.options.backoff.as_millis().max(2) as u64 / 2);
        let delay = (base + Duration::from_millis(jitter_ms)).min(BACKOFF_CAP);
        tokio::time::sleep(delay).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ChunkLayout;
    use crate::meta::types::{FsInfo, PartitionInfo, PartitionStatus};
    use crate::rpc::router::LocalCluster;
    use crate::rpc::Reply;
    use crate::storage::{StorageEngine, StorageOptions};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn cache() -> Arc<MetaCache> {
        let cluster = LocalCluster::new(
            StorageEngine::new(StorageOptions::default()),
            None,
            ChunkLayout::default(),
            Duration::from_secs(1),
        );
        cluster.mapping.register_fs(
            FsInfo {
                fs_id: 7,
                fs_name: "fs".into(),
                block_size: 4096,
                capacity: 0,
                enable_sum_in_dir: false,
                mount_points: Vec::new(),
            },
            vec![PartitionInfo {
                pool_id: 1,
                copyset_id: 1,
                partition_id: 1,
                fs_id: 7,
                start: 1,
                end: 1000,
                tx_id: 0,
                status: PartitionStatus::ReadWrite,
                next_id: 1,
            }],
        );
        let cache = MetaCache::new(Arc::clone(&cluster.mapping) as _);
        cache.set_fs_id(7);
        cache
    }

    fn executor(options: ExecutorOptions) -> Arc<TaskExecutor> {
        TaskExecutor::new(options, cache())
    }

    #[tokio::test]
    async fn test_ok_records_apply_index() {
        let executor = executor(ExecutorOptions::default());
        let result = executor
            .execute(TaskContext::dispatch("Test", 5), |_ctx| async {
                Ok(Reply::ok(42, "body"))
            })
            .await
            .unwrap();
        assert_eq!(result, "body");
        assert_eq!(executor.cache().get_apply_index(1), 42);
    }

    #[tokio::test]
    async fn test_ok_without_apply_index_is_fatal() {
        let executor = executor(ExecutorOptions::default());
        let result: Result<(), _> = executor
            .execute(TaskContext::dispatch("Test", 5), |_ctx| async {
                Ok(Reply {
                    status: MetaStatus::Ok,
                    applied_index: None,
                    redirect: None,
                    latest_tx_id: None,
                    body: Some(()),
                })
            })
            .await;
        assert_eq!(result.unwrap_err(), MetaStatus::Internal);
        // The bogus reply must not have poisoned the apply index.
        assert_eq!(executor.cache().get_apply_index(1), 0);
    }

    #[tokio::test]
    async fn test_redirect_then_success() {
        let options = ExecutorOptions {
            backoff: Duration::from_millis(1),
            ..Default::default()
        };
        let executor = executor(options);
        let calls = AtomicU32::new(0);
        let result = executor
            .execute(TaskContext::dispatch("Test", 5), |ctx| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Ok(Reply::redirect(9))
                    } else {
                        // The second attempt must aim at the new leader.
                        assert_eq!(ctx.leader, 9);
                        Ok(Reply::ok(1, ()))
                    }
                }
            })
            .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stale_tx_bumps_and_retries() {
        let options = ExecutorOptions {
            backoff: Duration::from_millis(1),
            ..Default::default()
        };
        let executor = executor(options);
        executor.cache().refresh().await.unwrap();
        let calls = AtomicU32::new(0);
        let result = executor
            .execute(TaskContext::dispatch("Test", 5), |ctx| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        assert_eq!(ctx.tx_id, 0);
                        Ok(Reply::stale_tx(6))
                    } else {
                        assert_eq!(ctx.tx_id, 6);
                        Ok(Reply::ok(1, ()))
                    }
                }
            })
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_transport_errors_exhaust_retry_budget() {
        let options = ExecutorOptions {
            timeout: Duration::from_millis(50),
            max_retry: 2,
            backoff: Duration::from_millis(1),
            ..Default::default()
        };
        let executor = executor(options);
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = executor
            .execute(TaskContext::dispatch("Test", 5), |_ctx| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(RpcError::Transport("boom".into())) }
            })
            .await;
        assert_eq!(result.unwrap_err(), MetaStatus::DeadlineExceeded);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_explicit_deadline_wins() {
        let executor = executor(ExecutorOptions::default());
        let task = TaskContext::dispatch("Test", 5)
            .with_deadline(Instant::now() - Duration::from_millis(1));
        let result: Result<(), _> = executor
            .execute(task, |_ctx| async { Ok(Reply::ok(1, ())) })
            .await;
        assert_eq!(result.unwrap_err(), MetaStatus::DeadlineExceeded);
    }

    #[tokio::test]
    async fn test_hard_error_surfaces_unchanged() {
        let executor = executor(ExecutorOptions::default());
        let result: Result<(), _> = executor
            .execute(TaskContext::dispatch("Test", 5), |_ctx| async {
                Ok(Reply::status(MetaStatus::NotEmpty))
            })
            .await;
        assert_eq!(result.unwrap_err(), MetaStatus::NotEmpty);
    }

    #[tokio::test]
    async fn test_same_inode_ops_serialize() {
        let executor = executor(ExecutorOptions::default());
        let running = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let executor = Arc::clone(&executor);
            let running = Arc::clone(&running);
            handles.push(tokio::spawn(async move {
                executor
                    .execute(TaskContext::dispatch("Test", 5), |_ctx| {
                        let running = Arc::clone(&running);
                        async move {
                            let inflight = running.fetch_add(1, Ordering::SeqCst);
                            assert_eq!(inflight, 0, "same-inode ops overlapped");
                            tokio::time::sleep(Duration::from_millis(5)).await;
                            running.fetch_sub(1, Ordering::SeqCst);
                            Ok(Reply::ok(1, ()))
                        }
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
    }
}
