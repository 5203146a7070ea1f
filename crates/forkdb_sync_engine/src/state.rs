//! Replication state and orchestration.

use crate::checkpoint::CheckpointStore;
use crate::config::ReplicationConfig;
use crate::error::{ReplicationError, ReplicationResult};
use crate::events::{ConflictEvent, EventHub, PassError, ProcessedBatch, ReplicationStats};
use crate::queue::{QueueStatus, RunQueue};
use crate::{downstream, upstream};
use forkdb_storage::{DocumentStore, EventBulk, StorageInstance};
use forkdb_sync_protocol::{
    default_hash_function, CheckpointKey, ConflictHandler, ConflictInput, ConflictOutput,
    ConflictPolicy, Direction, HashFunction, ResolvedConflict,
};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Hook awaited before every upstream write to master.
pub type PersistHook = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Everything needed to start a replication.
pub struct ReplicationInput<M: StorageInstance, F: StorageInstance> {
    /// Replication settings.
    pub config: ReplicationConfig,
    /// The authoritative instance.
    pub master: Arc<M>,
    /// The local instance.
    pub fork: Arc<F>,
    /// Conflict handler (defaults to [`ConflictPolicy::MasterWins`]).
    pub conflict_handler: Arc<dyn ConflictHandler>,
    /// Where checkpoints are persisted. In memory when `None`.
    pub checkpoint_instance: Option<Arc<dyn DocumentStore>>,
    /// Awaited before each upstream write.
    pub wait_before_persist: Option<PersistHook>,
    /// Content hash used for resolution revisions and checkpoint documents.
    pub hash_function: HashFunction,
    /// Upstream starting point used while no upstream checkpoint is stored.
    pub initial_checkpoint_up: Option<F::Checkpoint>,
    /// Downstream starting point used while no downstream checkpoint is stored.
    pub initial_checkpoint_down: Option<M::Checkpoint>,
}

impl<M: StorageInstance, F: StorageInstance> ReplicationInput<M, F> {
    /// Creates an input with default collaborators.
    pub fn new(config: ReplicationConfig, master: Arc<M>, fork: Arc<F>) -> Self {
        Self {
            config,
            master,
            fork,
            conflict_handler: Arc::new(ConflictPolicy::default()),
            checkpoint_instance: None,
            wait_before_persist: None,
            hash_function: default_hash_function(),
            initial_checkpoint_up: None,
            initial_checkpoint_down: None,
        }
    }

    /// Sets the conflict handler.
    pub fn with_conflict_handler(mut self, handler: impl ConflictHandler + 'static) -> Self {
        self.conflict_handler = Arc::new(handler);
        self
    }

    /// Persists checkpoints in `store`.
    ///
    /// The store should not be the fork or master instance of this
    /// replication.
    pub fn with_checkpoint_instance(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.checkpoint_instance = Some(store);
        self
    }

    /// Sets a hook awaited before each upstream write.
    pub fn with_wait_before_persist<H, Fut>(mut self, hook: H) -> Self
    where
        H: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.wait_before_persist = Some(Arc::new(move || hook().boxed()));
        self
    }

    /// Starts the upstream after `checkpoint` of the fork unless an upstream
    /// checkpoint was persisted before.
    ///
    /// Fork changes up to `checkpoint` are never pushed to master.
    pub fn with_initial_checkpoint_up(mut self, checkpoint: F::Checkpoint) -> Self {
        self.initial_checkpoint_up = Some(checkpoint);
        self
    }

    /// Starts the downstream after `checkpoint` of the master unless a
    /// downstream checkpoint was persisted before.
    pub fn with_initial_checkpoint_down(mut self, checkpoint: M::Checkpoint) -> Self {
        self.initial_checkpoint_down = Some(checkpoint);
        self
    }

    /// Sets the content hash function.
    pub fn with_hash_function(
        mut self,
        hash_function: impl Fn(&[u8]) -> String + Send + Sync + 'static,
    ) -> Self {
        self.hash_function = Arc::new(hash_function);
        self
    }
}

/// State shared by the workers, subscribers and handles of one replication.
pub(crate) struct Inner<M: StorageInstance, F: StorageInstance> {
    pub(crate) config: ReplicationConfig,
    pub(crate) key: CheckpointKey,
    pub(crate) master: Arc<M>,
    pub(crate) fork: Arc<F>,
    pub(crate) hash_function: HashFunction,
    pub(crate) wait_before_persist: Option<PersistHook>,
    pub(crate) checkpoint_down: CheckpointStore<M::Checkpoint>,
    pub(crate) checkpoint_up: CheckpointStore<F::Checkpoint>,
    pub(crate) up_queue: RunQueue,
    pub(crate) down_queue: RunQueue,
    pub(crate) events: EventHub,
    conflict_handler: Arc<dyn ConflictHandler>,
    first_sync_up: watch::Sender<bool>,
    first_sync_down: watch::Sender<bool>,
    cancel: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<M: StorageInstance, F: StorageInstance> Inner<M, F> {
    pub(crate) fn queue(&self, direction: Direction) -> &RunQueue {
        match direction {
            Direction::Up => &self.up_queue,
            Direction::Down => &self.down_queue,
        }
    }

    fn first_sync(&self, direction: Direction) -> &watch::Sender<bool> {
        match direction {
            Direction::Up => &self.first_sync_up,
            Direction::Down => &self.first_sync_down,
        }
    }

    pub(crate) fn is_canceled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Fails with [`ReplicationError::Cancelled`] once cancelled.
    pub(crate) fn ensure_active(&self) -> ReplicationResult<()> {
        if self.is_canceled() {
            Err(ReplicationError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Runs `future` unless the replication is cancelled first.
    pub(crate) async fn until_cancelled<T>(
        &self,
        future: impl Future<Output = T>,
    ) -> ReplicationResult<T> {
        let mut cancel = self.cancel.subscribe();
        tokio::select! {
            biased;
            _ = cancel.wait_for(|cancelled| *cancelled) => Err(ReplicationError::Cancelled),
            output = future => Ok(output),
        }
    }

    /// Returns true for the primary keys of this replication's checkpoints.
    pub(crate) fn is_checkpoint_document(&self, primary_key: &str) -> bool {
        primary_key == self.checkpoint_up.document_id()
            || primary_key == self.checkpoint_down.document_id()
    }

    pub(crate) fn mark_first_sync(&self, direction: Direction) {
        if !self.first_sync(direction).send_replace(true) {
            info!(
                direction = %direction,
                checkpoint_key = %self.key,
                "first sync done"
            );
        }
    }

    /// Calls the conflict handler and publishes the outcome.
    pub(crate) fn resolve_conflict(
        &self,
        direction: Direction,
        input: ConflictInput,
    ) -> ConflictOutput {
        let output = self.conflict_handler.resolve(&input).normalize(&input);
        warn!(
            direction = %direction,
            checkpoint_key = %self.key,
            primary_key = %input.current_fork_document_state.primary_key,
            master_revision = %input.new_document_state_in_master.revision,
            fork_revision = %input.current_fork_document_state.revision,
            already_equal = output.is_already_equal(),
            "resolved replication conflict"
        );
        self.events.conflict(
            direction,
            ResolvedConflict {
                input,
                output: output.clone(),
            },
        );
        output
    }

    /// Returns true if the source of `direction` has changes past its
    /// checkpoint that are not checkpoint documents.
    async fn has_pending_changes(&self, direction: Direction) -> ReplicationResult<bool> {
        // Room for both checkpoint documents.
        let limit = self.config.bulk_size + 2;
        let primary_keys: Vec<String> = match direction {
            Direction::Down => {
                let checkpoint = self.checkpoint_down.get().await?;
                self.master
                    .get_changed_documents_since(limit, checkpoint.as_ref())
                    .await?
                    .into_iter()
                    .map(|c| c.document.primary_key)
                    .collect()
            }
            Direction::Up => {
                let checkpoint = self.checkpoint_up.get().await?;
                self.fork
                    .get_changed_documents_since(limit, checkpoint.as_ref())
                    .await?
                    .into_iter()
                    .map(|c| c.document.primary_key)
                    .collect()
            }
        };
        Ok(primary_keys
            .iter()
            .any(|key| !self.is_checkpoint_document(key)))
    }

    fn is_relevant(&self, bulk: &EventBulk) -> bool {
        bulk.events
            .iter()
            .any(|event| !self.is_checkpoint_document(&event.document_id))
    }
}

/// Handle to a running replication.
///
/// Cloning the handle is cheap; all clones control the same replication.
/// Call [`ReplicationState::cancel`] to stop it, dropping the handles does
/// not stop the background tasks.
pub struct ReplicationState<M: StorageInstance, F: StorageInstance> {
    inner: Arc<Inner<M, F>>,
}

impl<M: StorageInstance, F: StorageInstance> Clone for ReplicationState<M, F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Starts replicating between `input.master` and `input.fork`.
///
/// Both directions run an initial pass right away and then follow the change
/// streams of their source. Must be called from within a Tokio runtime.
pub fn replicate<M, F>(input: ReplicationInput<M, F>) -> ReplicationState<M, F>
where
    M: StorageInstance + 'static,
    F: StorageInstance + 'static,
{
    let ReplicationInput {
        config,
        master,
        fork,
        conflict_handler,
        checkpoint_instance,
        wait_before_persist,
        hash_function,
        initial_checkpoint_up,
        initial_checkpoint_down,
    } = input;

    let key = CheckpointKey::derive(&config.identifier, master.identity(), fork.identity());
    let inner = Arc::new(Inner {
        checkpoint_down: CheckpointStore::new(
            &key,
            Direction::Down,
            checkpoint_instance.clone(),
            hash_function.clone(),
        )
        .with_initial(initial_checkpoint_down),
        checkpoint_up: CheckpointStore::new(
            &key,
            Direction::Up,
            checkpoint_instance,
            hash_function.clone(),
        )
        .with_initial(initial_checkpoint_up),
        up_queue: RunQueue::new(Direction::Up, config.max_pending_runs),
        down_queue: RunQueue::new(Direction::Down, config.max_pending_runs),
        events: EventHub::new(config.event_capacity),
        first_sync_up: watch::Sender::new(false),
        first_sync_down: watch::Sender::new(false),
        cancel: watch::Sender::new(false),
        tasks: Mutex::new(Vec::new()),
        config,
        key,
        master,
        fork,
        hash_function,
        wait_before_persist,
        conflict_handler,
    });

    info!(
        checkpoint_key = %inner.key,
        identifier = %inner.config.identifier,
        bulk_size = inner.config.bulk_size,
        "starting replication"
    );

    // Subscribe before the initial passes so that no write is missed.
    let master_changes = inner.master.change_stream();
    let fork_changes = inner.fork.change_stream();
    inner.down_queue.schedule();
    inner.up_queue.schedule();

    let tasks = vec![
        tokio::spawn(forward_changes(inner.clone(), master_changes, Direction::Down)),
        tokio::spawn(forward_changes(inner.clone(), fork_changes, Direction::Up)),
        tokio::spawn(run_worker(inner.clone(), Direction::Down)),
        tokio::spawn(run_worker(inner.clone(), Direction::Up)),
    ];
    *inner.tasks.lock() = tasks;

    ReplicationState { inner }
}

/// Schedules a pass of `direction` for every relevant change bulk.
async fn forward_changes<M, F>(
    inner: Arc<Inner<M, F>>,
    mut changes: broadcast::Receiver<EventBulk>,
    direction: Direction,
) where
    M: StorageInstance,
    F: StorageInstance,
{
    let mut cancel = inner.cancel.subscribe();
    loop {
        if *cancel.borrow_and_update() {
            break;
        }
        tokio::select! {
            changed = cancel.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            received = changes.recv() => match received {
                Ok(bulk) => {
                    if inner.is_relevant(&bulk) {
                        inner.queue(direction).schedule();
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(direction = %direction, skipped, "change stream lagged");
                    inner.queue(direction).schedule();
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
    debug!(direction = %direction, "change subscription stopped");
}

/// Serves the run queue of `direction` until cancellation.
async fn run_worker<M, F>(inner: Arc<Inner<M, F>>, direction: Direction)
where
    M: StorageInstance,
    F: StorageInstance,
{
    let queue = inner.queue(direction);
    let mut cancel = inner.cancel.subscribe();
    while queue.next(&mut cancel).await {
        debug!(direction = %queue.direction(), checkpoint_key = %inner.key, "pass started");
        let pass = async {
            match direction {
                Direction::Down => downstream::run_pass(&inner).await,
                Direction::Up => upstream::run_pass(&inner).await,
            }
        };
        // A pass blocked in a hook or storage call is dropped on cancellation.
        let result = inner.until_cancelled(pass).await.and_then(|outcome| outcome);
        match result {
            Ok(()) => {
                inner.events.pass_completed(direction);
                debug!(direction = %direction, "pass finished");
            }
            Err(ReplicationError::Cancelled) => {
                debug!(direction = %direction, "pass interrupted by cancellation");
            }
            Err(err) => {
                error!(
                    direction = %direction,
                    checkpoint_key = %inner.key,
                    error = %err,
                    retryable = err.is_retryable(),
                    "replication pass failed"
                );
                inner.events.pass_failed(direction, err);
            }
        }
        queue.finish();
    }
    debug!(direction = %direction, "worker stopped");
}

async fn next_failure(errors: &mut broadcast::Receiver<PassError>) -> ReplicationError {
    loop {
        match errors.recv().await {
            Ok(failure) => return ReplicationError::pass_failed(failure.direction, &failure.error),
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return std::future::pending().await,
        }
    }
}

impl<M: StorageInstance, F: StorageInstance> ReplicationState<M, F> {
    /// Returns the checkpoint key of this replication.
    pub fn checkpoint_key(&self) -> &CheckpointKey {
        &self.inner.key
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ReplicationConfig {
        &self.inner.config
    }

    /// Stops the replication and waits for its background tasks to exit.
    ///
    /// A running pass is interrupted at its next await point, so a pass
    /// stuck in the persist hook or in a storage call does not delay the
    /// return. Cancellation is terminal. Calling it again is a no-op.
    pub async fn cancel(&self) {
        if !self.inner.cancel.send_replace(true) {
            info!(checkpoint_key = %self.inner.key, "cancelling replication");
        }
        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            // A panicked task has nothing left to clean up.
            let _ = task.await;
        }
    }

    /// Returns true once [`cancel`](Self::cancel) was called.
    pub fn is_canceled(&self) -> bool {
        self.inner.is_canceled()
    }

    /// Subscribes to the first-sync flag of `direction`.
    pub fn first_sync_done(&self, direction: Direction) -> watch::Receiver<bool> {
        self.inner.first_sync(direction).subscribe()
    }

    /// Subscribes to the running flag of `direction`.
    pub fn active(&self, direction: Direction) -> watch::Receiver<bool> {
        self.inner.queue(direction).subscribe_active()
    }

    /// Subscribes to the queue status of `direction`.
    pub fn queue_status(&self, direction: Direction) -> watch::Receiver<QueueStatus> {
        self.inner.queue(direction).subscribe()
    }

    /// Subscribes to the documents written by the loop of `direction`.
    pub fn processed(&self, direction: Direction) -> broadcast::Receiver<ProcessedBatch> {
        self.inner.events.subscribe_processed(direction)
    }

    /// Subscribes to resolved conflicts.
    pub fn resolved_conflicts(&self) -> broadcast::Receiver<ConflictEvent> {
        self.inner.events.subscribe_conflicts()
    }

    /// Subscribes to failed passes.
    pub fn errors(&self) -> broadcast::Receiver<PassError> {
        self.inner.events.subscribe_errors()
    }

    /// Returns a snapshot of the statistics.
    pub fn stats(&self) -> ReplicationStats {
        self.inner.events.stats()
    }

    /// Schedules a pass of `direction`.
    pub fn trigger(&self, direction: Direction) {
        self.inner.queue(direction).schedule();
    }

    /// Waits until both directions completed their first full sync.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicationError::Cancelled`] if the replication is
    /// cancelled first.
    pub async fn await_first_in_sync(&self) -> ReplicationResult<()> {
        let mut up = self.first_sync_done(Direction::Up);
        let mut down = self.first_sync_done(Direction::Down);
        self.inner
            .until_cancelled(async move {
                let _ = up.wait_for(|done| *done).await;
                let _ = down.wait_for(|done| *done).await;
            })
            .await
    }

    /// Waits for the first sync, then until both queues drained once.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicationError::Cancelled`] if the replication is
    /// cancelled first.
    pub async fn await_in_sync(&self) -> ReplicationResult<()> {
        self.await_first_in_sync().await?;
        self.inner
            .until_cancelled(async {
                self.inner.up_queue.wait_drained().await;
                self.inner.down_queue.wait_drained().await;
            })
            .await
    }

    /// Waits until the replication is idle.
    ///
    /// Idle means both queues are drained, no change is waiting past either
    /// checkpoint and no pass started between two consecutive observations.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicationError::PassFailed`] if a pass fails while
    /// waiting, and [`ReplicationError::Cancelled`] on cancellation.
    pub async fn await_idle(&self) -> ReplicationResult<()> {
        let mut errors = self.errors();
        // A first pass that failed before this call is not retried on its
        // own, so run it again while the failure can still be observed.
        for direction in Direction::ALL {
            if !self.is_canceled() && !*self.inner.first_sync(direction).borrow() {
                self.inner.queue(direction).schedule();
            }
        }
        let idle = async {
            self.await_first_in_sync().await?;
            loop {
                let before = self.started_passes();
                self.inner
                    .until_cancelled(async {
                        self.inner.up_queue.wait_drained().await;
                        self.inner.down_queue.wait_drained().await;
                    })
                    .await?;

                let mut pending = false;
                for direction in Direction::ALL {
                    if self.inner.has_pending_changes(direction).await? {
                        self.inner.queue(direction).schedule();
                        pending = true;
                    }
                }
                if pending {
                    continue;
                }

                let up = self.inner.up_queue.status();
                let down = self.inner.down_queue.status();
                if up.is_drained() && down.is_drained() && (up.started, down.started) == before {
                    return Ok(());
                }
            }
        };

        tokio::select! {
            result = idle => result,
            failure = next_failure(&mut errors) => Err(failure),
        }
    }

    fn started_passes(&self) -> (u64, u64) {
        (
            self.inner.up_queue.status().started,
            self.inner.down_queue.status().started,
        )
    }
}
