//! Background jobs: a small state machine around the document pipeline.
//!
//! Every job moves `PENDING -> PROCESSING -> SUCCESS | FAILURE`. Callers poll
//! a [`JobStore`] for the current [`JobStatus`], which carries the latest
//! progress message while the job runs.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use futures::{FutureExt as _, channel::oneshot};
use schemars::JsonSchema;
use uuid::Uuid;

use crate::{
    async_utils::JoinWorker,
    error::{JobError, JobResult},
    model::EditRequest,
    pipeline::{Pipeline, Progress},
    prelude::*,
    work::{WorkFn, WorkQueue, WorkQueueHandle},
};

/// Status message for jobs that haven't started yet.
pub const WAITING_MESSAGE: &str = "Task is waiting to be processed...";

/// Job identifier.
pub type JobId = String;

/// The lifecycle state of a job.
#[derive(Clone, Copy, Debug, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Processing,
    Success,
    Failure,
}

impl JobState {
    /// Terminal states have no outgoing transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Success | JobState::Failure)
    }

    /// Is `self -> next` a legal transition?
    ///
    /// `PROCESSING -> PROCESSING` is allowed, because that's how progress
    /// updates are recorded.
    pub fn can_transition_to(self, next: JobState) -> bool {
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (JobState::Pending, JobState::Processing)
                | (
                    JobState::Processing,
                    JobState::Processing | JobState::Success | JobState::Failure
                )
        )
    }
}

/// Progress information for a job.
#[derive(Clone, Debug, JsonSchema, PartialEq, Serialize)]
pub struct JobMeta {
    /// What the job is doing right now.
    pub status: String,
}

/// A snapshot of a job, as returned by polling.
#[derive(Clone, Debug, JsonSchema, PartialEq, Serialize)]
pub struct JobStatus {
    /// The job's ID.
    pub task_id: JobId,

    /// Where the job is in its lifecycle.
    pub state: JobState,

    /// The latest progress message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<JobMeta>,

    /// The job's result. Only present on `SUCCESS`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// What went wrong. Only present on `FAILURE`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobStatus {
    fn pending(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_owned(),
            state: JobState::Pending,
            meta: Some(JobMeta {
                status: WAITING_MESSAGE.to_owned(),
            }),
            result: None,
            error: None,
        }
    }
}

/// The registry of jobs, keyed by ID.
#[derive(Clone, Default)]
pub struct JobStore {
    jobs: Arc<Mutex<HashMap<JobId, JobStatus>>>,
}

impl JobStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new job in the `PENDING` state.
    pub fn insert_pending(&self, id: &str) -> Result<()> {
        let mut jobs = self.jobs.lock().expect("lock poisoned");
        if jobs.contains_key(id) {
            return Err(anyhow!("job {} already exists", id));
        }
        jobs.insert(id.to_owned(), JobStatus::pending(id));
        Ok(())
    }

    /// Get a snapshot of a job. Unknown jobs look like they're still waiting.
    pub fn poll(&self, id: &str) -> JobStatus {
        self.jobs
            .lock()
            .expect("lock poisoned")
            .get(id)
            .cloned()
            .unwrap_or_else(|| JobStatus::pending(id))
    }

    /// Mark a job as started.
    pub fn mark_processing(&self, id: &str) -> Result<()> {
        self.transition(id, JobState::Processing, |status| {
            status.meta = Some(JobMeta {
                status: "Processing...".to_owned(),
            });
        })
    }

    /// Record a progress message for a running job. The latest message wins.
    pub fn set_progress(&self, id: &str, message: String) -> Result<()> {
        self.transition(id, JobState::Processing, |status| {
            status.meta = Some(JobMeta { status: message });
        })
    }

    /// Record a successful result.
    pub fn succeed(&self, id: &str, result: Value) -> Result<()> {
        self.transition(id, JobState::Success, |status| {
            status.meta = None;
            status.result = Some(result);
        })
    }

    /// Record a failure.
    pub fn fail(&self, id: &str, error: String) -> Result<()> {
        self.transition(id, JobState::Failure, |status| {
            status.meta = None;
            status.error = Some(error);
        })
    }

    /// Move a job to `next`, applying `update` only if the transition is legal.
    fn transition(
        &self,
        id: &str,
        next: JobState,
        update: impl FnOnce(&mut JobStatus),
    ) -> Result<()> {
        let mut jobs = self.jobs.lock().expect("lock poisoned");
        let status = jobs
            .get_mut(id)
            .ok_or_else(|| anyhow!("unknown job {}", id))?;
        if !status.state.can_transition_to(next) {
            warn!(job = id, from = ?status.state, to = ?next, "rejected illegal job transition");
            return Err(anyhow!(
                "job {} cannot move from {:?} to {:?}",
                id,
                status.state,
                next
            ));
        }
        status.state = next;
        update(status);
        Ok(())
    }
}

/// Reports pipeline progress into a job's status.
struct JobProgress {
    store: JobStore,
    id: JobId,
}

impl Progress for JobProgress {
    fn report(&self, status: String) {
        debug!(job = %self.id, "{}", status);
        if let Err(err) = self.store.set_progress(&self.id, status) {
            warn!("could not record progress: {:#}", err);
        }
    }
}

/// Work a job should do.
#[derive(Clone, Debug)]
pub enum JobSpec {
    /// Extract text blocks from a document.
    Extract { source: PathBuf },
    /// Apply edits to a document.
    ApplyEdits {
        source: PathBuf,
        edits: Vec<EditRequest>,
        /// Put the job ID in the output file name.
        unique_output: bool,
    },
}

/// Runs jobs on a bounded pool of workers.
pub struct JobRunner {
    store: JobStore,
    queue: WorkQueue<(JobId, JobSpec), JobStatus>,
}

impl JobRunner {
    /// Create a runner with `concurrency` workers. The returned worker
    /// finishes once the runner is dropped and every job is done.
    pub fn new(pipeline: Pipeline, concurrency: usize) -> Result<(Self, JoinWorker)> {
        let store = JobStore::new();
        let work_fn: WorkFn<(JobId, JobSpec), JobStatus> = {
            let store = store.clone();
            Arc::new(move |(id, spec): (JobId, JobSpec)| {
                run_job(pipeline.clone(), store.clone(), id, spec).boxed()
            })
        };
        let (queue, worker) = WorkQueue::new(concurrency, work_fn)?;
        Ok((Self { store, queue }, worker))
    }

    /// The job registry, for polling.
    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Queue a job. Returns its ID, and a channel which receives the job's
    /// final status.
    pub async fn submit(&self, spec: JobSpec) -> Result<(JobId, oneshot::Receiver<JobStatus>)> {
        let id = Uuid::new_v4().simple().to_string();
        self.store.insert_pending(&id)?;
        let handle: WorkQueueHandle<_, _> = self.queue.handle();
        let rx = handle.submit((id.clone(), spec)).await?;
        Ok((id, rx))
    }
}

/// Run a single job to completion, recording its outcome.
#[instrument(level = "debug", skip_all, fields(job = %id))]
async fn run_job(pipeline: Pipeline, store: JobStore, id: JobId, spec: JobSpec) -> JobStatus {
    if let Err(err) = store.mark_processing(&id) {
        warn!("not running job: {:#}", err);
        return store.poll(&id);
    }

    // Run the pipeline in its own task, so that a panic fails just this job.
    let task = tokio::spawn({
        let progress = JobProgress {
            store: store.clone(),
            id: id.clone(),
        };
        async move { execute(&pipeline, spec, &progress).await }
    });
    let recorded = match task.await {
        Ok(Ok(result)) => {
            info!("job succeeded");
            store.succeed(&id, result)
        }
        Ok(Err(err)) => {
            if err.is_fatal() {
                error!("job failed: {}", err);
            } else {
                warn!("job failed on a recoverable error: {}", err);
            }
            store.fail(&id, err.to_string())
        }
        Err(err) => {
            let message = if err.is_panic() {
                format!("job panicked: {}", panic_message(err.into_panic()))
            } else {
                "job was cancelled".to_owned()
            };
            error!("{}", message);
            store.fail(&id, message)
        }
    };
    if let Err(err) = recorded {
        warn!("could not record job outcome: {:#}", err);
    }
    store.poll(&id)
}

/// Do the work a job describes, and serialize the result.
async fn execute(pipeline: &Pipeline, spec: JobSpec, progress: &JobProgress) -> JobResult<Value> {
    let result = match spec {
        JobSpec::Extract { source } => {
            serde_json::to_value(pipeline.extract(&source, progress).await?)
        }
        JobSpec::ApplyEdits {
            source,
            edits,
            unique_output,
        } => {
            let token = unique_output.then_some(progress.id.as_str());
            serde_json::to_value(
                pipeline
                    .apply_edits(&source, edits, token, progress)
                    .await?,
            )
        }
    };
    result.map_err(|err| JobError::internal(err.into()))
}

/// Get a printable message from a panic payload.
fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}
