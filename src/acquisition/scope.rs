use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

use super::{AcquisitionEvent, FileAcquisition, ProbeSettings, SubscriptionId};
use crate::download::TransferEngine;
use crate::error::Result;
use crate::jobs::{ControlHandle, JobScheduler};
use crate::source::Speed;

struct ScopedFile {
    file: Arc<FileAcquisition>,
    subscription: SubscriptionId,
}

type FileList = Arc<RwLock<Vec<ScopedFile>>>;

/// The files of one installation, sharing one job scheduler and transfer engine.
///
/// A speed measured for one file is handed to every file in the scope with
/// sources on the same host.
pub struct InstallScope {
    files: FileList,
    scheduler: JobScheduler,
    engine: Arc<dyn TransferEngine>,
    probe: ProbeSettings,
}

impl InstallScope {
    pub fn new(control: ControlHandle, engine: Arc<dyn TransferEngine>, probe: ProbeSettings) -> Self {
        Self {
            files: Arc::new(RwLock::new(Vec::new())),
            scheduler: JobScheduler::new(control),
            engine,
            probe,
        }
    }

    pub fn scheduler(&self) -> &JobScheduler {
        &self.scheduler
    }

    pub fn add_file(&self, file: Arc<FileAcquisition>) {
        let files: Weak<RwLock<Vec<ScopedFile>>> = Arc::downgrade(&self.files);
        let subscription = file.events().subscribe(move |event| {
            if let AcquisitionEvent::SourceSpeedChanged {
                domain,
                url,
                speed: Speed::Measured(speed),
                ..
            } = event
            {
                if let Some(files) = files.upgrade() {
                    federate(&files, domain, url, *speed);
                }
            }
        });

        self.files.write().push(ScopedFile { file, subscription });
    }

    pub fn files(&self) -> Vec<Arc<FileAcquisition>> {
        self.files
            .read()
            .iter()
            .map(|scoped| Arc::clone(&scoped.file))
            .collect()
    }

    /// Starts one speed-test job per file. Returns the names of the jobs that
    /// started; files already being tested are left alone.
    pub fn start_speed_tests(&self, force: bool) -> Vec<String> {
        self.files()
            .into_iter()
            .filter_map(|file| {
                let name = format!("speedtest:{}", file);
                let engine = Arc::clone(&self.engine);
                let settings = self.probe.clone();
                self.scheduler.submit(
                    Some(&name),
                    move |ctx| async move {
                        file.run_speedtest(&ctx, engine.as_ref(), &settings, force)
                            .await
                    },
                    report(name.clone()),
                )
            })
            .collect()
    }

    /// Starts one availability job per file, like [`start_speed_tests`](Self::start_speed_tests).
    pub fn start_availability_checks(&self, all: bool) -> Vec<String> {
        self.files()
            .into_iter()
            .filter_map(|file| {
                let name = format!("availability:{}", file);
                let engine = Arc::clone(&self.engine);
                self.scheduler.submit(
                    Some(&name),
                    move |ctx| async move { file.check_availability(&ctx, engine.as_ref(), all).await },
                    report(name.clone()),
                )
            })
            .collect()
    }

    pub fn is_busy(&self) -> bool {
        !self.scheduler.is_empty()
    }

    /// Stops every job of this scope. Their callbacks will not run.
    pub fn abort(&self) -> usize {
        self.scheduler.cancel_all("InstallScope")
    }
}

impl Drop for InstallScope {
    fn drop(&mut self) {
        for scoped in self.files.read().iter() {
            scoped.file.events().unsubscribe(scoped.subscription);
        }
        if self.is_busy() {
            warn!(
                "Install scope dropped with {} active jobs",
                self.scheduler.len()
            );
            self.abort();
        }
    }
}

fn report(name: String) -> impl FnOnce(Result<()>) + Send + 'static {
    move |result| {
        if result.is_ok() {
            debug!("Job '{}' finished", name);
        }
    }
}

/// Runs on the control loop, from inside the measuring file's event emission.
fn federate(files: &RwLock<Vec<ScopedFile>>, domain: &str, url: &str, speed: f64) {
    let targets: Vec<Arc<FileAcquisition>> = files
        .read()
        .iter()
        .map(|scoped| Arc::clone(&scoped.file))
        .collect();

    let updated: usize = targets
        .iter()
        .map(|file| file.apply_speed_measurement(domain, url, speed))
        .sum();
    if updated > 0 {
        debug!(
            "Applied speed of {} to {} other sources on {}",
            url, updated, domain
        );
    }
}
