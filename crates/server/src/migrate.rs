//! Background migration of externally-written metadata.
//!
//! The storage layer queues any object whose encrypted metadata was replaced
//! by an external writer. One worker per project drains that queue: it fans
//! out over the project's capability repository to decrypt the path and the
//! metadata blob, then writes the cleartext back and dequeues the object.
//!
//! Workers run at most one drain at a time. Requests block on
//! [`MetadataMigrator::wait_for_project`] until *a* drain completes; the
//! per-object freshness GET needs on top of that is provided by
//! [`MetadataMigrator::migrate_object`].

use futures::StreamExt;
use keyhole_access::{AccessError, CapabilityRepository, Encryptor};
use keyhole_core::location::ObjectInfo;
use keyhole_metadata::{MetadataRepo, RepoError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Errors from migrating a single object.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("worker project mismatch: {expected} vs {actual}")]
    ProjectMismatch { expected: Uuid, actual: Uuid },

    #[error("no migration worker for project '{0}'")]
    NoWorker(Uuid),

    #[error(transparent)]
    Access(#[from] AccessError),

    #[error(transparent)]
    Repo(#[from] RepoError),
}

#[derive(Default)]
struct WorkerState {
    running: bool,
    /// Queue-scan watermark. `None` rescans the whole queue.
    start_time: Option<OffsetDateTime>,
    /// Bumped whenever the watermark is cleared; in-flight advances from
    /// before the bump are dropped so a freshly-added capability always gets
    /// a full rescan.
    reset_epoch: u64,
    waiters: Vec<oneshot::Sender<()>>,
}

/// Migrates queued objects for a single project.
pub struct MigrationWorker {
    project_id: Uuid,
    repo: Arc<dyn MetadataRepo>,
    capabilities: CapabilityRepository,
    max_capabilities: usize,
    state: Mutex<WorkerState>,
}

impl MigrationWorker {
    fn new(project_id: Uuid, repo: Arc<dyn MetadataRepo>, max_capabilities: usize) -> Self {
        Self {
            project_id,
            repo,
            capabilities: CapabilityRepository::new(),
            max_capabilities,
            state: Mutex::new(WorkerState::default()),
        }
    }

    /// Register a capability. If it extends the set, the watermark is
    /// cleared so the next run re-scans objects that previously failed to
    /// decrypt.
    pub fn add_capability(&self, encryptor: Arc<dyn Encryptor>) {
        if self.capabilities.add(encryptor) {
            let mut state = self.state.lock().expect("worker lock poisoned");
            state.start_time = None;
            state.reset_epoch += 1;
        }
    }

    /// Start a drain in the background unless one is already running.
    pub fn start(self: Arc<Self>) {
        {
            let mut state = self.state.lock().expect("worker lock poisoned");
            if state.running {
                return;
            }
            state.running = true;
        }

        let worker = self;
        tokio::spawn(async move {
            if let Err(e) = worker.migrate_project().await {
                tracing::warn!(
                    project_id = %worker.project_id,
                    error = %e,
                    "error migrating project"
                );
            }

            let waiters = {
                let mut state = worker.state.lock().expect("worker lock poisoned");
                state.running = false;
                std::mem::take(&mut state.waiters)
            };
            // One-shot senders never block; a waiter that timed out is gone
            // and the send is a no-op.
            for waiter in waiters {
                let _ = waiter.send(());
            }
        });
    }

    /// Trigger a drain and wait for the current or next run to complete.
    /// Returns false on timeout.
    pub async fn wait_for_project(self: Arc<Self>, timeout: Duration) -> bool {
        let rx = {
            let mut state = self.state.lock().expect("worker lock poisoned");
            let (tx, rx) = oneshot::channel();
            state.waiters.push(tx);
            rx
        };

        Arc::clone(&self).start();

        matches!(tokio::time::timeout(timeout, rx).await, Ok(Ok(())))
    }

    /// Drain the project's queue from the current watermark. Per-object
    /// errors are logged and skipped; a scan error aborts the run.
    async fn migrate_project(&self) -> Result<(), RepoError> {
        let start_time = self.state.lock().expect("worker lock poisoned").start_time;

        let mut stream = self.repo.objects_for_migration(self.project_id, start_time);
        while let Some(next) = stream.next().await {
            let mut obj = next?;
            if let Err(e) = self.migrate_object(&mut obj).await {
                tracing::warn!(
                    project_id = %self.project_id,
                    object_key = %obj.location.object_key,
                    error = %e,
                    "cannot migrate object"
                );
            }
        }
        Ok(())
    }

    /// Migrate a single object. On success `obj` carries the decrypted
    /// metadata and is no longer queued.
    pub async fn migrate_object(&self, obj: &mut ObjectInfo) -> Result<(), MigrationError> {
        if obj.location.project_id != self.project_id {
            return Err(MigrationError::ProjectMismatch {
                expected: self.project_id,
                actual: obj.location.project_id,
            });
        }

        let epoch = self.state.lock().expect("worker lock poisoned").reset_epoch;

        let (clear_key, metadata) = match self.capabilities.decrypt_object(obj) {
            Ok(decrypted) => decrypted,
            Err(e) => {
                // Skip this object until a new capability clears the
                // watermark.
                if let Some(queued_at) = obj.queued_at {
                    self.advance_start_time(queued_at + time::Duration::microseconds(1), epoch);
                }
                return Err(e.into());
            }
        };

        self.capabilities.prune(self.max_capabilities);

        let queued_at = obj.queued_at;
        let mut migrated = obj.clone();
        migrated.metadata = metadata;
        self.repo.migrate_metadata(&migrated).await?;

        obj.metadata = migrated.metadata;
        obj.queued_at = None;

        if let Some(queued_at) = queued_at {
            self.advance_start_time(queued_at, epoch);
        }

        tracing::debug!(
            project_id = %self.project_id,
            object_key = %clear_key,
            "migrated metadata for object"
        );
        Ok(())
    }

    fn advance_start_time(&self, to: OffsetDateTime, epoch: u64) {
        let mut state = self.state.lock().expect("worker lock poisoned");
        if state.reset_epoch != epoch {
            return;
        }
        state.start_time = Some(state.start_time.map_or(to, |current| current.max(to)));
    }
}

/// Owns the per-project workers and the periodic sweep.
pub struct MetadataMigrator {
    repo: Arc<dyn MetadataRepo>,
    max_capabilities: usize,
    workers: Mutex<HashMap<Uuid, Arc<MigrationWorker>>>,
    running: AtomicBool,
    done: Mutex<Option<oneshot::Receiver<()>>>,
}

impl MetadataMigrator {
    pub fn new(repo: Arc<dyn MetadataRepo>, max_capabilities: usize) -> Self {
        Self {
            repo,
            max_capabilities,
            workers: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
            done: Mutex::new(None),
        }
    }

    /// Get or create the worker for a project and register the request's
    /// capability with it. Fast; called on every request.
    pub fn add_project(&self, project_id: Uuid, encryptor: Arc<dyn Encryptor>) {
        let worker = {
            let mut workers = self.workers.lock().expect("migrator lock poisoned");
            Arc::clone(workers.entry(project_id).or_insert_with(|| {
                Arc::new(MigrationWorker::new(
                    project_id,
                    Arc::clone(&self.repo),
                    self.max_capabilities,
                ))
            }))
        };
        worker.add_capability(encryptor);
    }

    /// Trigger a drain for the project and wait for it, bounded by
    /// `timeout`. Returns false on timeout or if the project is unknown.
    pub async fn wait_for_project(&self, project_id: Uuid, timeout: Duration) -> bool {
        let worker = self
            .workers
            .lock()
            .expect("migrator lock poisoned")
            .get(&project_id)
            .cloned();

        match worker {
            Some(worker) => worker.wait_for_project(timeout).await,
            None => {
                tracing::error!(project_id = %project_id, "no migration worker for project");
                false
            }
        }
    }

    /// Migrate a single object inline using the project's capabilities.
    pub async fn migrate_object(&self, obj: &mut ObjectInfo) -> Result<(), MigrationError> {
        let worker = self
            .workers
            .lock()
            .expect("migrator lock poisoned")
            .get(&obj.location.project_id)
            .cloned();

        match worker {
            Some(worker) => worker.migrate_object(obj).await,
            None => Err(MigrationError::NoWorker(obj.location.project_id)),
        }
    }

    /// Start the periodic sweep that drains every project between explicit
    /// waits.
    pub fn start(self: Arc<Self>, interval: Duration) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let (done_tx, done_rx) = oneshot::channel();
        *self.done.lock().expect("migrator lock poisoned") = Some(done_rx);

        let migrator = self;
        tokio::spawn(async move {
            while migrator.running.load(Ordering::SeqCst) {
                tokio::time::sleep(interval).await;

                let workers: Vec<Arc<MigrationWorker>> = migrator
                    .workers
                    .lock()
                    .expect("migrator lock poisoned")
                    .values()
                    .cloned()
                    .collect();
                for worker in workers {
                    worker.start();
                }
            }
            let _ = done_tx.send(());
        });
    }

    /// Stop the sweep and wait for it to wind down. Workers in flight
    /// finish their current run; no new runs are started. Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let done = self.done.lock().expect("migrator lock poisoned").take();
        if let Some(done) = done {
            let _ = done.await;
        }
    }
}
