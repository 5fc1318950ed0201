//! Map/reduce execution engine.
//!
//! Takes a planned query and a shard list, fans map tasks out over the
//! worker pool with bounded concurrency and retries, then drives an
//! iterative tree reduce over the partial results until one remains.
//!
//! The reduce tree is built statically from the ordinal-sorted partials,
//! so the association order of every combine is fixed: repeated runs
//! reduce floating-point aggregates in the same order no matter how the
//! scheduler interleaves tasks. Tree nodes fire as soon as their inputs
//! are ready, letting later rounds overlap the tail of earlier ones.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use rand::Rng;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::catalog::ShardRef;
use crate::frontend::router::PlannedQuery;
use crate::net::{ExecInput, ExecRequest};
use crate::sharding::Batch;

use super::registry::Registry;
use super::worker::WorkerApi;
use super::Error;

pub mod partial;

static QUERY_ID: Lazy<AtomicU64> = Lazy::new(|| AtomicU64::new(0));

const RETRY_BACKOFF: Duration = Duration::from_millis(100);
const RETRY_JITTER_MS: u64 = 50;

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub max_in_flight: Option<usize>,
    pub tasks_per_worker: usize,
    pub reduce_fanin: usize,
    pub task_timeout: Duration,
    pub query_timeout: Duration,
    pub max_retries: usize,
    pub cancel_grace: Duration,
}

/// Per-query execution context. The cancellation token is observed at
/// every suspension point.
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub query_id: u64,
    pub cancel: CancellationToken,
}

impl QueryContext {
    pub fn new() -> Self {
        Self::with_cancel(CancellationToken::new())
    }

    /// Context cancelled through an external token, e.g. server shutdown.
    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            query_id: QUERY_ID.fetch_add(1, Ordering::SeqCst),
            cancel,
        }
    }
}

impl Default for QueryContext {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Engine {
    registry: Arc<Registry>,
    worker: Arc<dyn WorkerApi>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(registry: Arc<Registry>, worker: Arc<dyn WorkerApi>, config: EngineConfig) -> Self {
        Self {
            registry,
            worker,
            config,
        }
    }

    /// Execute a planned query over the table's shards and return the
    /// final result.
    pub async fn execute(
        &self,
        plan: &PlannedQuery,
        shards: &[ShardRef],
        ctx: &QueryContext,
    ) -> Result<Batch, Error> {
        match timeout(
            self.config.query_timeout,
            self.execute_inner(plan, shards, ctx),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                // Dropping the inner future released the workers; signal
                // anything still observing the context.
                ctx.cancel.cancel();
                warn!("query {} deadline exceeded", ctx.query_id);
                Err(Error::QueryTimeout)
            }
        }
    }

    async fn execute_inner(
        &self,
        plan: &PlannedQuery,
        shards: &[ShardRef],
        ctx: &QueryContext,
    ) -> Result<Batch, Error> {
        debug!("query {} mapping {} shards", ctx.query_id, shards.len());
        let partials = self.map_phase(plan, shards, ctx).await?;

        let reduced = match &plan.reduce_sql {
            // Pass-through: concatenate, preserving shard order.
            None => {
                if partials.is_empty() {
                    None
                } else {
                    Some(Batch::concat(partials)?)
                }
            }
            Some(reduce_sql) => {
                if partials.len() > 1 {
                    debug!(
                        "query {} reducing {} partials, fan-in {}",
                        ctx.query_id,
                        partials.len(),
                        self.config.reduce_fanin
                    );
                    Some(self.reduce_phase(plan, reduce_sql, partials, ctx).await?)
                } else {
                    partials.into_iter().next()
                }
            }
        };

        let result = partial::finalize(plan, reduced)?;
        debug!("query {} done, {} rows", ctx.query_id, result.row_count());
        Ok(result)
    }

    fn in_flight_limit(&self) -> usize {
        self.config
            .max_in_flight
            .unwrap_or(self.registry.healthy_count() * self.config.tasks_per_worker)
            .max(1)
    }

    fn runner(&self, ctx: &QueryContext) -> TaskRunner {
        TaskRunner {
            registry: self.registry.clone(),
            worker: self.worker.clone(),
            task_timeout: self.config.task_timeout,
            max_retries: self.config.max_retries,
            cancel: ctx.cancel.clone(),
            query_id: ctx.query_id,
        }
    }

    async fn map_phase(
        &self,
        plan: &PlannedQuery,
        shards: &[ShardRef],
        ctx: &QueryContext,
    ) -> Result<Vec<Batch>, Error> {
        let limit = self.in_flight_limit();
        let mut results: Vec<Option<Batch>> = (0..shards.len()).map(|_| None).collect();
        let mut tasks: JoinSet<(usize, Result<Batch, Error>)> = JoinSet::new();
        let mut next = 0;

        while next < shards.len() || !tasks.is_empty() {
            while next < shards.len() && tasks.len() < limit {
                let runner = self.runner(ctx);
                let sql = plan.map_sql.clone();
                let inputs = vec![ExecInput::Shard(shards[next].path.clone())];
                let label = format!("map:{}", shards[next].id);
                let ordinal = next;
                tasks.spawn(async move { (ordinal, runner.run(sql, inputs, label).await) });
                next += 1;
            }

            let (ordinal, outcome) = self.join_one(&mut tasks, ctx).await?;
            match outcome {
                Ok(batch) => {
                    if let Err(err) = validate_partial(plan, &batch) {
                        return Err(self.fail(tasks, ctx, err).await);
                    }
                    results[ordinal] = Some(batch);
                }
                Err(err) => return Err(self.fail(tasks, ctx, err).await),
            }
        }

        Ok(results.into_iter().flatten().collect())
    }

    async fn reduce_phase(
        &self,
        plan: &PlannedQuery,
        reduce_sql: &str,
        partials: Vec<Batch>,
        ctx: &QueryContext,
    ) -> Result<Batch, Error> {
        let (groups, root) = build_tree(partials.len(), self.config.reduce_fanin);
        let limit = self.in_flight_limit();

        let mut completed: HashMap<usize, Batch> = partials.into_iter().enumerate().collect();

        // A node's parent, and how many inputs each group still waits on.
        let mut parent: HashMap<usize, usize> = HashMap::new();
        for (index, group) in groups.iter().enumerate() {
            for input in &group.inputs {
                parent.insert(*input, index);
            }
        }
        let mut waiting: Vec<usize> = groups
            .iter()
            .map(|group| {
                group
                    .inputs
                    .iter()
                    .filter(|input| !completed.contains_key(input))
                    .count()
            })
            .collect();

        let mut ready: VecDeque<usize> = (0..groups.len()).filter(|g| waiting[*g] == 0).collect();
        let mut tasks: JoinSet<(usize, Result<Batch, Error>)> = JoinSet::new();

        while !completed.contains_key(&root) {
            while tasks.len() < limit {
                let Some(group_index) = ready.pop_front() else {
                    break;
                };
                let group = &groups[group_index];
                let inputs: Vec<ExecInput> = group
                    .inputs
                    .iter()
                    .map(|input| {
                        ExecInput::Partial(completed.remove(input).expect("input is ready"))
                    })
                    .collect();

                let runner = self.runner(ctx);
                let sql = reduce_sql.to_string();
                let label = format!("reduce:{}", group.id);
                tasks.spawn(async move { (group_index, runner.run(sql, inputs, label).await) });
            }

            let (group_index, outcome) = self.join_one(&mut tasks, ctx).await?;
            match outcome {
                Ok(batch) => {
                    if let Err(err) = validate_partial(plan, &batch) {
                        return Err(self.fail(tasks, ctx, err).await);
                    }
                    let id = groups[group_index].id;
                    completed.insert(id, batch);
                    if let Some(parent_index) = parent.get(&id) {
                        waiting[*parent_index] -= 1;
                        if waiting[*parent_index] == 0 {
                            ready.push_back(*parent_index);
                        }
                    }
                }
                Err(err) => return Err(self.fail(tasks, ctx, err).await),
            }
        }

        Ok(completed.remove(&root).expect("root is complete"))
    }

    /// Wait for the next task, observing cancellation.
    async fn join_one(
        &self,
        tasks: &mut JoinSet<(usize, Result<Batch, Error>)>,
        ctx: &QueryContext,
    ) -> Result<(usize, Result<Batch, Error>), Error> {
        let joined = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                let tasks = std::mem::take(tasks);
                self.drain(tasks).await;
                return Err(Error::Cancelled);
            }
            joined = tasks.join_next() => joined,
        };

        match joined {
            Some(Ok(result)) => Ok(result),
            Some(Err(err)) => Err(Error::Internal(format!("task panicked: {}", err))),
            None => Err(Error::Internal("awaited an empty task set".into())),
        }
    }

    /// Terminal failure: stop dispatching, tell in-flight tasks to wind
    /// down, and wait out the grace period before abandoning them.
    async fn fail(
        &self,
        tasks: JoinSet<(usize, Result<Batch, Error>)>,
        ctx: &QueryContext,
        err: Error,
    ) -> Error {
        warn!("query {} failed: {}", ctx.query_id, err);
        ctx.cancel.cancel();
        self.drain(tasks).await;
        err
    }

    async fn drain(&self, mut tasks: JoinSet<(usize, Result<Batch, Error>)>) {
        let graceful = timeout(self.config.cancel_grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if graceful.is_err() {
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
    }
}

fn validate_partial(plan: &PlannedQuery, batch: &Batch) -> Result<(), Error> {
    if batch.columns != plan.partial_columns || batch.types != plan.partial_types {
        return Err(Error::SchemaMismatch {
            expected: plan.partial_columns.clone(),
            got: batch.columns.clone(),
        });
    }
    Ok(())
}

/// One reduce task: combine `inputs` (leaf ordinals or group ids) into
/// a new partial.
#[derive(Debug, PartialEq)]
struct ReduceGroup {
    id: usize,
    inputs: Vec<usize>,
}

/// Build the reduce tree over `leaves` ordinal-sorted partials. Groups
/// of one pass through to the next round unchanged.
fn build_tree(leaves: usize, fanin: usize) -> (Vec<ReduceGroup>, usize) {
    let fanin = fanin.max(2);
    let mut groups = vec![];
    let mut level: Vec<usize> = (0..leaves).collect();
    let mut next_id = leaves;

    while level.len() > 1 {
        let mut next_level = vec![];
        for chunk in level.chunks(fanin) {
            if chunk.len() == 1 {
                next_level.push(chunk[0]);
            } else {
                groups.push(ReduceGroup {
                    id: next_id,
                    inputs: chunk.to_vec(),
                });
                next_level.push(next_id);
                next_id += 1;
            }
        }
        level = next_level;
    }

    (groups, level[0])
}

/// Runs one task to completion: acquire a worker, execute with the task
/// deadline, retry transient failures with exponential backoff on a
/// different worker when possible.
///
/// Task states: pending -> dispatched -> succeeded, or back to pending
/// on a retryable failure until the attempt budget runs out.
struct TaskRunner {
    registry: Arc<Registry>,
    worker: Arc<dyn WorkerApi>,
    task_timeout: Duration,
    max_retries: usize,
    cancel: CancellationToken,
    query_id: u64,
}

enum AttemptFailure {
    NoWorkers,
    Failed(String),
}

impl TaskRunner {
    async fn run(
        self,
        sql: String,
        inputs: Vec<ExecInput>,
        label: String,
    ) -> Result<Batch, Error> {
        let request = ExecRequest {
            sql,
            inputs,
            deadline_ms: self.task_timeout.as_millis() as u64,
        };

        let attempts = self.max_retries + 1;
        let mut last_worker: Vec<String> = vec![];
        let mut last_failure = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                let backoff = RETRY_BACKOFF * 2u32.pow(attempt as u32 - 1)
                    + Duration::from_millis(rand::rng().random_range(0..RETRY_JITTER_MS));
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                    _ = sleep(backoff) => {}
                }
            }

            let acquired = tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                acquired = self.registry.acquire(1, &last_worker) => acquired,
            };

            let worker = match acquired {
                Ok(mut workers) => workers.remove(0),
                Err(Error::NoWorkers) => {
                    debug!(
                        "query {} task {} attempt {}: no workers",
                        self.query_id, label, attempt
                    );
                    last_failure = Some(AttemptFailure::NoWorkers);
                    continue;
                }
                Err(err) => return Err(err),
            };

            let mut guard = WorkerGuard::new(self.registry.clone(), worker.id.clone());
            debug!(
                "query {} task {} dispatched to \"{}\" (attempt {})",
                self.query_id, label, worker.id, attempt
            );

            let result = tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                result = timeout(self.task_timeout, self.worker.exec(&worker.address, &request)) => result,
            };

            match result {
                Ok(Ok(batch)) => return Ok(batch),

                Ok(Err(err)) if err.is_retryable() => {
                    guard.mark_failed();
                    debug!(
                        "query {} task {} attempt {} retryable: {}",
                        self.query_id, label, attempt, err
                    );
                    last_failure = Some(AttemptFailure::Failed(err.to_string()));
                    last_worker = vec![worker.id];
                }

                Ok(Err(err)) => {
                    guard.mark_failed();
                    return Err(Error::TaskFailed {
                        attempts: attempt + 1,
                        message: err.to_string(),
                    });
                }

                // Single-task deadline; the worker may still be healthy
                // enough for someone else.
                Err(_) => {
                    guard.mark_failed();
                    last_failure = Some(AttemptFailure::Failed(format!(
                        "no response within {:?}",
                        self.task_timeout
                    )));
                    last_worker = vec![worker.id];
                }
            }
        }

        match last_failure {
            Some(AttemptFailure::NoWorkers) => Err(Error::NoWorkers),
            Some(AttemptFailure::Failed(message)) => Err(Error::TaskFailed { attempts, message }),
            None => Err(Error::Internal("task ran zero attempts".into())),
        }
    }
}

/// Releases the worker back to the registry when the task is done with
/// it, successful or not. Dropping mid-cancel releases without penalty.
struct WorkerGuard {
    registry: Arc<Registry>,
    id: String,
    ok: bool,
}

impl WorkerGuard {
    fn new(registry: Arc<Registry>, id: String) -> Self {
        Self {
            registry,
            id,
            ok: true,
        }
    }

    fn mark_failed(&mut self) {
        self.ok = false;
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.registry.release(&self.id, self.ok);
    }
}
