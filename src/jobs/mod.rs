//! Job tracking and execution.
//!
//! Every external operation the agent performs (a mount, a backup, a
//! checkout) runs as a named [`Job`] owned by the [`JobRegistry`]. A job
//! wraps either a shell invocation or an opaque future, captures its output,
//! and records a terminal error that stays retrievable after background runs.

pub mod command;

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock, watch};
use tracing::{error, info};

use crate::error::ExecutionError;

pub use command::{Captured, CommandRunner, CommandSpec, ShellRunner};

/// The unit of work a job executes once.
enum Work {
    Command(CommandSpec),
    Func(BoxFuture<'static, Result<String, ExecutionError>>),
}

struct JobState {
    work: Option<Work>,
    stdout: String,
    stderr: String,
    error: Option<ExecutionError>,
}

/// One tracked unit of external work.
///
/// Once finished, buffers and the recorded error are immutable; the name may
/// be reused by registering a brand-new job, which replaces the entry.
pub struct Job {
    name: String,
    state: Mutex<JobState>,
    done: watch::Sender<bool>,
}

impl Job {
    fn new(name: &str, work: Work) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            name: name.to_string(),
            state: Mutex::new(JobState {
                work: Some(work),
                stdout: String::new(),
                stderr: String::new(),
                error: None,
            }),
            done,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        *self.done.borrow()
    }

    /// Resolves once the job reaches its terminal state.
    pub async fn finished(&self) {
        let mut rx = self.done.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Point-in-time view of the job.
    pub async fn snapshot(&self) -> JobSnapshot {
        let state = self.state.lock().await;
        JobSnapshot {
            name: self.name.clone(),
            finished: self.is_finished(),
            stdout: state.stdout.clone(),
            stderr: state.stderr.clone(),
            error: state.error.as_ref().map(|e| e.to_string()),
        }
    }

    async fn take_work(&self) -> Option<Work> {
        self.state.lock().await.work.take()
    }

    async fn finish(&self, stdout: String, stderr: String, err: Option<ExecutionError>) {
        {
            let mut state = self.state.lock().await;
            state.stdout = stdout;
            state.stderr = stderr;
            state.error = err;
        }
        self.done.send_replace(true);
    }

    /// Mark finished without executing; pending work is discarded.
    async fn mark_finished(&self) {
        self.state.lock().await.work = None;
        self.done.send_replace(true);
    }

    async fn log_output(&self, emit: bool) {
        if !emit {
            return;
        }
        let snap = self.snapshot().await;
        if snap.stdout.is_empty() {
            info!(job = %snap.name, "no stdout output");
        } else {
            info!(job = %snap.name, stdout = %snap.stdout, "job output");
        }
        if snap.stderr.is_empty() {
            info!(job = %snap.name, "no stderr output");
        } else {
            info!(job = %snap.name, stderr = %snap.stderr, "job output");
        }
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Read-only snapshot of one job at one instant.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub name: String,
    pub finished: bool,
    pub stdout: String,
    pub stderr: String,
    pub error: Option<String>,
}

/// Concurrent name→job map plus the runner command jobs execute with.
pub struct JobRegistry {
    jobs: RwLock<HashMap<String, Arc<Job>>>,
    runner: Arc<dyn CommandRunner>,
}

impl JobRegistry {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            runner,
        }
    }

    /// The runner this registry executes command jobs with. Function jobs
    /// that shell out (checkout pipelines) capture a clone of it.
    pub fn runner(&self) -> Arc<dyn CommandRunner> {
        Arc::clone(&self.runner)
    }

    /// Register a job wrapping a process invocation under `name`.
    ///
    /// Replaces a finished entry of the same name; rejected with
    /// [`ExecutionError::JobInFlight`] while a previous job is still running.
    pub async fn create_from_command(
        &self,
        spec: CommandSpec,
        name: &str,
    ) -> Result<Arc<Job>, ExecutionError> {
        self.register(Job::new(name, Work::Command(spec))).await
    }

    /// Register a job wrapping an arbitrary unit of work. Same registration
    /// contract as [`Self::create_from_command`].
    pub async fn create_from_func(
        &self,
        name: &str,
        work: BoxFuture<'static, Result<String, ExecutionError>>,
    ) -> Result<Arc<Job>, ExecutionError> {
        self.register(Job::new(name, Work::Func(work))).await
    }

    async fn register(&self, job: Job) -> Result<Arc<Job>, ExecutionError> {
        let mut jobs = self.jobs.write().await;
        if let Some(existing) = jobs.get(job.name()) {
            if !existing.is_finished() {
                return Err(ExecutionError::JobInFlight {
                    name: job.name().to_string(),
                });
            }
        }
        let job = Arc::new(job);
        jobs.insert(job.name().to_string(), Arc::clone(&job));
        Ok(job)
    }

    /// Execute the job on the caller's task, blocking until completion.
    ///
    /// Returns the underlying execution error unmodified; the same error is
    /// recorded on the entry.
    pub async fn run_sync(&self, job: &Arc<Job>, emit_output: bool) -> Result<(), ExecutionError> {
        let result = execute(&self.runner, job).await;
        job.log_output(emit_output).await;
        result
    }

    /// Execute the job on a spawned task and return immediately.
    ///
    /// Errors are logged and recorded on the entry only; poll
    /// [`Self::status`] or await [`Job::finished`] to observe them.
    pub fn run_async(&self, job: Arc<Job>, emit_output: bool) {
        let runner = Arc::clone(&self.runner);
        tokio::spawn(async move {
            if let Err(e) = execute(&runner, &job).await {
                error!(job = %job.name(), error = %e, "background job failed");
            }
            job.log_output(emit_output).await;
        });
    }

    /// Mark the job finished without executing anything; logs whatever the
    /// buffers already contain.
    pub async fn dry_run(&self, job: &Arc<Job>, emit_output: bool) {
        job.mark_finished().await;
        job.log_output(emit_output).await;
    }

    /// Snapshot of one job by name.
    pub async fn status(&self, name: &str) -> Option<JobSnapshot> {
        let job = {
            let jobs = self.jobs.read().await;
            jobs.get(name).cloned()
        };
        match job {
            Some(job) => Some(job.snapshot().await),
            None => None,
        }
    }

    /// Snapshots of every tracked job, sorted by name.
    pub async fn snapshots(&self) -> Vec<JobSnapshot> {
        let jobs: Vec<Arc<Job>> = {
            let jobs = self.jobs.read().await;
            jobs.values().cloned().collect()
        };
        let mut snaps = Vec::with_capacity(jobs.len());
        for job in jobs {
            snaps.push(job.snapshot().await);
        }
        snaps.sort_by(|a, b| a.name.cmp(&b.name));
        snaps
    }
}

async fn execute(runner: &Arc<dyn CommandRunner>, job: &Arc<Job>) -> Result<(), ExecutionError> {
    let Some(work) = job.take_work().await else {
        return Err(ExecutionError::JobInFlight {
            name: job.name().to_string(),
        });
    };
    match work {
        Work::Command(spec) => match runner.run(&spec).await {
            Ok(captured) => {
                let err = (!captured.success()).then(|| captured.to_error());
                job.finish(captured.stdout, captured.stderr, err.clone()).await;
                err.map_or(Ok(()), Err)
            }
            Err(e) => {
                job.finish(String::new(), e.to_string(), Some(e.clone())).await;
                Err(e)
            }
        },
        Work::Func(fut) => match fut.await {
            Ok(out) => {
                job.finish(out, String::new(), None).await;
                Ok(())
            }
            Err(e) => {
                job.finish(String::new(), e.to_string(), Some(e.clone())).await;
                Err(e)
            }
        },
    }
}
