use futures_util::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::idle::panic_message;
use super::{ControlHandle, IdleHandle, StopToken, checkpoint};
use crate::error::{Error, Result};

/// What a running job gets to work with.
#[derive(Debug, Clone)]
pub struct JobContext {
    name: String,
    token: StopToken,
    control: ControlHandle,
}

impl JobContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> &StopToken {
        &self.token
    }

    pub fn control(&self) -> &ControlHandle {
        &self.control
    }

    pub fn checkpoint(&self) -> Result<()> {
        checkpoint(&self.token)
    }

    /// Schedules `call` on the control loop; skipped if this job is stopped
    /// before the control loop gets to it.
    pub fn schedule<F>(&self, call: F) -> IdleHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.control.schedule_unless_stopped(&self.token, call)
    }
}

/// A job tracked by the [`JobScheduler`].
#[derive(Debug)]
pub struct BackgroundJob {
    name: String,
    generation: u64,
    token: StopToken,
    handle: JoinHandle<()>,
    started_at: Instant,
}

impl BackgroundJob {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> &StopToken {
        &self.token
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_set()
    }

    /// True once the work itself has returned; its callback may still be pending.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

type JobMap = HashMap<String, BackgroundJob>;

/// Keeps track of named background jobs within one scope, such as one
/// installation, that may end before the jobs do.
///
/// At most one job runs per name. Results are delivered to callbacks on the
/// control loop, never on the worker.
pub struct JobScheduler {
    jobs: Arc<Mutex<JobMap>>,
    control: ControlHandle,
    generation: AtomicU64,
}

impl JobScheduler {
    pub fn new(control: ControlHandle) -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            control,
            generation: AtomicU64::new(0),
        }
    }

    pub fn control(&self) -> &ControlHandle {
        &self.control
    }

    /// Starts `work` and returns the job's name, or `None` if a job with the
    /// same name is already running (the running job is left untouched).
    ///
    /// Without a name, a unique one is derived from the work's type.
    pub fn submit<T, W, Fut, C>(&self, name: Option<&str>, work: W, callback: C) -> Option<String>
    where
        T: Send + 'static,
        W: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        C: FnOnce(Result<T>) + Send + 'static,
    {
        let name = name
            .map(str::to_string)
            .unwrap_or_else(|| synthetic_name::<W>());

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                error!("Cannot start job '{}' outside of a runtime: {}", name, e);
                return None;
            }
        };

        let mut jobs = self.jobs.lock();
        if jobs.contains_key(&name) {
            error!("Job with name '{}' already exists, dropping new job", name);
            return None;
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let token = StopToken::new();
        let context = JobContext {
            name: name.clone(),
            token: token.clone(),
            control: self.control.clone(),
        };

        let jobs_ref = Arc::clone(&self.jobs);
        let control = self.control.clone();
        let job_token = token.clone();
        let job_name = name.clone();

        let handle = runtime.spawn(async move {
            let outcome = AssertUnwindSafe(async move { work(context).await })
                .catch_unwind()
                .await;

            let result = match outcome {
                Ok(result) => result,
                Err(panic) => Err(Error::JobPanicked {
                    name: job_name.clone(),
                    message: panic_message(panic.as_ref()),
                }),
            };

            if job_token.is_set() {
                debug!("Job '{}' was stopped, dropping its callback", job_name);
                return;
            }

            match result {
                Err(Error::Cancelled) => {
                    debug!("Job '{}' exited on a stop request", job_name);
                    control.schedule(move || forget(&jobs_ref, &job_name, generation));
                }
                result => {
                    if let Err(e) = &result {
                        error!("Error while completing job '{}': {}", job_name, e);
                    }
                    control.schedule_unless_stopped(&job_token, move || {
                        forget(&jobs_ref, &job_name, generation);
                        callback(result);
                    });
                }
            }
        });

        jobs.insert(
            name.clone(),
            BackgroundJob {
                name: name.clone(),
                generation,
                token,
                handle,
                started_at: Instant::now(),
            },
        );
        debug!("Started job '{}'", name);
        Some(name)
    }

    /// Removes the job and sets its stop token. Its callback will not run.
    pub fn cancel(&self, name: &str) -> Option<BackgroundJob> {
        let mut jobs = self.jobs.lock();
        let job = jobs.remove(name)?;
        job.token.set();
        debug!("Sent stop request to job '{}'", name);
        Some(job)
    }

    /// Stops every tracked job and clears the map. Returns how many were stopped.
    pub fn cancel_all(&self, origin: &str) -> usize {
        let mut jobs = self.jobs.lock();
        for name in jobs.keys() {
            debug!("({}) Sending stop request to job '{}'", origin, name);
        }
        for job in jobs.values() {
            job.token.set();
        }
        let count = jobs.len();
        jobs.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.jobs.lock().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.jobs.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        if !self.is_empty() {
            warn!(
                "JobScheduler dropped with {} active jobs, stopping them",
                self.len()
            );
            self.cancel_all("JobScheduler");
        }
    }
}

impl std::fmt::Display for JobScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JobScheduler({:?})", self.names())
    }
}

/// Removes the finished job, unless its name has since been reused.
fn forget(jobs: &Mutex<JobMap>, name: &str, generation: u64) {
    let mut jobs = jobs.lock();
    if jobs.get(name).is_some_and(|job| job.generation == generation) {
        jobs.remove(name);
    }
}

fn synthetic_name<W>() -> String {
    format!(
        "{}_{}",
        std::any::type_name::<W>(),
        &Uuid::new_v4().to_string()[..8]
    )
}
