use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info};

use super::{AcquisitionEvent, FileAcquisition};
use crate::download::{TransferEngine, TransferRequest, TransferState};
use crate::error::{Error, Result};
use crate::jobs::JobContext;
use crate::source::{Availability, CacheSource, FileSource, Source, SourceKind, Speed};

#[derive(Debug, Clone)]
pub struct ProbeSettings {
    /// Wall-clock limit for one source's speed test.
    pub window: Duration,
    /// How often a running speed test is polled.
    pub poll_interval: Duration,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(2500),
            poll_interval: Duration::from_millis(100),
        }
    }
}

struct ProbeTarget {
    source_id: String,
    url: String,
    request: TransferRequest,
    speed: Speed,
    available: bool,
}

enum SpeedOutcome {
    Measured { speed: f64, buffer: Option<Bytes> },
    Failed { error: Option<String>, code: Option<u16> },
    TimedOut,
}

impl FileAcquisition {
    fn probe_targets(&self) -> Vec<ProbeTarget> {
        self.sources
            .lock()
            .sources
            .iter()
            .filter_map(Source::as_download)
            .map(|download| ProbeTarget {
                source_id: download.source_id().to_string(),
                url: download.url().to_string(),
                request: download.transfer_request(),
                speed: download.speed(),
                available: download.is_available(),
            })
            .collect()
    }

    fn schedule_event(self: &Arc<Self>, ctx: &JobContext, event: AcquisitionEvent) {
        let file = Arc::clone(self);
        ctx.schedule(move || file.events.emit(event));
    }

    /// Speed-tests the download sources one after another.
    ///
    /// Sources with a measured speed are skipped unless `force` is set. A
    /// source whose whole body arrives within the window becomes a local
    /// Cache source and ends the run.
    ///
    /// An aborted run returns `Cancelled` without emitting `ProcessingStopped`.
    pub async fn run_speedtest(
        self: &Arc<Self>,
        ctx: &JobContext,
        engine: &dyn TransferEngine,
        settings: &ProbeSettings,
        force: bool,
    ) -> Result<()> {
        self.schedule_event(ctx, AcquisitionEvent::ProcessingStarted);

        for target in self.probe_targets() {
            ctx.checkpoint()?;
            if !force && target.speed.is_measured() {
                continue;
            }

            let outcome = probe_speed(ctx, engine, &target, settings).await?;
            let file = Arc::clone(self);
            let source_id = target.source_id.clone();
            match outcome {
                SpeedOutcome::Measured { speed, buffer } => {
                    ctx.schedule(move || file.record_speed(&source_id, Speed::Measured(speed)));
                    if let Some(buffer) = buffer {
                        if !self.cache_source_available() {
                            let file = Arc::clone(self);
                            let source_id = target.source_id.clone();
                            ctx.schedule(move || {
                                if let Err(e) = file.adopt_probe_buffer(&source_id, buffer) {
                                    error!("Failed to keep downloaded copy of {}: {}", file, e);
                                }
                            });
                        }
                        break;
                    }
                }
                SpeedOutcome::Failed { error, code } => {
                    ctx.schedule(move || file.record_failure(&source_id, error, code));
                }
                SpeedOutcome::TimedOut => {
                    info!("Speedtest timed out for {}", target.url);
                    ctx.schedule(move || file.record_speed(&source_id, Speed::NotApplicable));
                }
            }
        }

        self.schedule_event(ctx, AcquisitionEvent::ProcessingStopped);
        Ok(())
    }

    /// Checks reachability of the download sources one after another. Unless
    /// `all` is set, sources already known to be reachable are skipped.
    ///
    /// An aborted run returns `Cancelled` without emitting `ProcessingStopped`.
    pub async fn check_availability(
        self: &Arc<Self>,
        ctx: &JobContext,
        engine: &dyn TransferEngine,
        all: bool,
    ) -> Result<()> {
        self.schedule_event(ctx, AcquisitionEvent::ProcessingStarted);

        for target in self.probe_targets() {
            ctx.checkpoint()?;
            if !all && target.available {
                continue;
            }

            let result = tokio::select! {
                result = engine.is_available(&target.request) => result,
                _ = ctx.token().stopped() => return Err(Error::Cancelled),
            };
            let availability = match result {
                Ok(true) => Availability::Reachable,
                Ok(false) => Availability::Unreachable,
                Err(e) => {
                    debug!("Availability check for {} failed: {}", target.url, e);
                    Availability::NetworkError
                }
            };

            let file = Arc::clone(self);
            let source_id = target.source_id;
            ctx.schedule(move || file.record_availability(&source_id, availability));
        }

        self.schedule_event(ctx, AcquisitionEvent::ProcessingStopped);
        Ok(())
    }

    /// Takes over a measurement made for another source on the same host.
    /// The measured URL itself is left alone. Returns how many sources changed.
    pub fn apply_speed_measurement(&self, domain: &str, url: &str, speed: f64) -> usize {
        let mut set = self.sources.lock();
        let mut updated = 0;
        for source in set.sources.iter_mut() {
            if source.domain().as_deref() != Some(domain) || source.url() == url {
                continue;
            }
            if let Some(download) = source.as_download_mut() {
                download.set_speed(Speed::Measured(speed));
                updated += 1;
            }
        }
        updated
    }

    fn record_speed(&self, source_id: &str, speed: Speed) {
        let changed = {
            let mut set = self.sources.lock();
            set.index_of(source_id).and_then(|index| {
                let source = &mut set.sources[index];
                let download = source.as_download_mut()?;
                download.set_speed(speed);
                Some((download.domain().unwrap_or_default(), download.url().to_string()))
            })
        };

        if let Some((domain, url)) = changed {
            self.events.emit(AcquisitionEvent::SourceSpeedChanged {
                source_id: source_id.to_string(),
                domain,
                url,
                speed,
            });
        }
    }

    fn record_failure(&self, source_id: &str, error: Option<String>, code: Option<u16>) {
        let changed = {
            let mut set = self.sources.lock();
            set.index_of(source_id).and_then(|index| {
                let download = set.sources[index].as_download_mut()?;
                if download.is_available() {
                    debug!(
                        "Url was supposed to be available, yet the speedtest failed: {}",
                        download.url()
                    );
                }
                download.record_failure(error, code);
                Some((download.domain().unwrap_or_default(), download.url().to_string()))
            })
        };

        if let Some((domain, url)) = changed {
            self.events.emit(AcquisitionEvent::SourceSpeedChanged {
                source_id: source_id.to_string(),
                domain,
                url,
                speed: Speed::NotApplicable,
            });
        }
    }

    fn record_availability(&self, source_id: &str, availability: Availability) {
        let changed = {
            let mut set = self.sources.lock();
            set.index_of(source_id)
                .and_then(|index| set.sources[index].as_download_mut())
                .map(|download| download.set_availability(availability))
                .is_some()
        };

        if changed {
            self.events.emit(AcquisitionEvent::SourceAvailabilityChanged {
                source_id: source_id.to_string(),
            });
        }
    }

    /// Keeps the body a speed test downloaded in full as a Cache source.
    fn adopt_probe_buffer(&self, source_id: &str, buffer: Bytes) -> Result<Option<String>> {
        if self.source_exists(SourceKind::Cache) {
            debug!("{} already has a cache source, dropping probe buffer", self);
            return Ok(None);
        }

        self.prepare()?;
        let dest = self.dest_file()?;
        let temp = self.download_file()?;
        let checksum = self
            .source(source_id)
            .and_then(|source| source.checksum().map(str::to_string));

        let cache =
            CacheSource::from_memory("tempcache", &buffer, &temp, &dest, checksum, self.storage())?;
        let cache_id = self.add_source(Source::Cache(cache))?;
        debug!(
            "File fully downloaded during speedtest, added new cache source to {}",
            self
        );
        Ok(Some(cache_id))
    }
}

/// Runs one speed test until it finishes, the window closes, or the job is stopped.
async fn probe_speed(
    ctx: &JobContext,
    engine: &dyn TransferEngine,
    target: &ProbeTarget,
    settings: &ProbeSettings,
) -> Result<SpeedOutcome> {
    let transfer = engine.start_speed_test(target.request.clone());
    let deadline = Instant::now() + settings.window;

    loop {
        if let Err(e) = ctx.checkpoint() {
            transfer.cancel();
            return Err(e);
        }

        match transfer.state() {
            TransferState::Completed => {
                let buffer = if transfer.is_fully_buffered() {
                    transfer.take_buffer()
                } else {
                    None
                };
                return Ok(SpeedOutcome::Measured {
                    speed: transfer.average_speed(),
                    buffer,
                });
            }
            TransferState::Cancelled | TransferState::Error => {
                return Ok(SpeedOutcome::Failed {
                    error: transfer.error(),
                    code: transfer.error_code(),
                });
            }
            TransferState::Running => {}
        }

        let now = Instant::now();
        if now >= deadline {
            transfer.cancel();
            return Ok(SpeedOutcome::TimedOut);
        }
        let nap = settings.poll_interval.min(deadline - now);
        if let Err(e) = ctx.token().sleep(nap).await {
            transfer.cancel();
            return Err(e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::AcquisitionSettings;
    use super::*;
    use crate::download::Transfer;
    use crate::jobs::{ControlLoop, JobScheduler};
    use crate::source::{FileSpec, RestrictedDomains, SourceDescriptor};
    use crate::storage::FsCacheStorage;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    use crate::download::TransferProgress;
    use crate::jobs::StopToken;

    #[derive(Clone)]
    enum Behaviour {
        Measure(f64),
        Buffer(f64, &'static [u8]),
        Fail(u16),
        Hang,
    }

    struct FakeTransfer {
        state: TransferState,
        speed: f64,
        buffer: Mutex<Option<Bytes>>,
        code: Option<u16>,
    }

    impl Transfer for FakeTransfer {
        fn state(&self) -> TransferState {
            self.state
        }
        fn average_speed(&self) -> f64 {
            self.speed
        }
        fn is_fully_buffered(&self) -> bool {
            self.buffer.lock().is_some()
        }
        fn take_buffer(&self) -> Option<Bytes> {
            self.buffer.lock().take()
        }
        fn error(&self) -> Option<String> {
            self.code.map(|code| format!("HTTP {}", code))
        }
        fn error_code(&self) -> Option<u16> {
            self.code
        }
        fn cancel(&self) {}
    }

    #[derive(Default)]
    struct FakeEngine {
        speed: HashMap<String, Behaviour>,
        reachable: HashMap<String, Option<bool>>,
        started: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TransferEngine for FakeEngine {
        fn start_speed_test(&self, request: TransferRequest) -> Box<dyn Transfer> {
            self.started.lock().push(request.url.clone());
            let behaviour = self.speed.get(&request.url).cloned().unwrap_or(Behaviour::Hang);
            let (state, speed, buffer, code) = match behaviour {
                Behaviour::Measure(speed) => (TransferState::Completed, speed, None, None),
                Behaviour::Buffer(speed, bytes) => (
                    TransferState::Completed,
                    speed,
                    Some(Bytes::from_static(bytes)),
                    None,
                ),
                Behaviour::Fail(code) => (TransferState::Error, 0.0, None, Some(code)),
                Behaviour::Hang => (TransferState::Running, 0.0, None, None),
            };
            Box::new(FakeTransfer {
                state,
                speed,
                buffer: Mutex::new(buffer),
                code,
            })
        }

        async fn is_available(&self, request: &TransferRequest) -> Result<bool> {
            match self.reachable.get(&request.url).copied().flatten() {
                Some(reachable) => Ok(reachable),
                None => Err(Error::Probe {
                    url: request.url.clone(),
                    message: "connection refused".to_string(),
                    code: None,
                }),
            }
        }

        async fn download_to(
            &self,
            _request: &TransferRequest,
            _output_path: &Path,
            _stop: &StopToken,
            _progress: Option<&mpsc::UnboundedSender<TransferProgress>>,
        ) -> Result<u64> {
            Ok(0)
        }
    }

    fn file(dir: &TempDir, urls: &[(&str, &str)]) -> Arc<FileAcquisition> {
        let spec = urls
            .iter()
            .fold(FileSpec::new(Some("f.zip".to_string())), |spec, (id, url)| {
                spec.with_source(*id, SourceDescriptor::new(*url))
            });
        let settings = AcquisitionSettings {
            durable_cache: None,
            temp_root: dir.path().to_path_buf(),
            restricted: RestrictedDomains::default(),
        };
        Arc::new(
            FileAcquisition::new("game", "file", spec, settings, Arc::new(FsCacheStorage)).unwrap(),
        )
    }

    fn quick() -> ProbeSettings {
        ProbeSettings {
            window: Duration::from_millis(150),
            poll_interval: Duration::from_millis(10),
        }
    }

    async fn speedtest(
        file: &Arc<FileAcquisition>,
        engine: Arc<FakeEngine>,
        settings: ProbeSettings,
        force: bool,
    ) {
        let (control, mut control_loop) = ControlLoop::new();
        let scheduler = JobScheduler::new(control);
        let done = Arc::new(AtomicBool::new(false));

        let job_file = Arc::clone(file);
        let finished = Arc::clone(&done);
        scheduler.submit(
            Some("speedtest"),
            move |ctx| async move {
                job_file
                    .run_speedtest(&ctx, engine.as_ref(), &settings, force)
                    .await
            },
            move |result: Result<()>| {
                result.unwrap();
                finished.store(true, Ordering::SeqCst);
            },
        );

        assert!(
            control_loop
                .run_until(Duration::from_secs(5), || done.load(Ordering::SeqCst))
                .await
        );
    }

    #[tokio::test]
    async fn test_speedtest_records_speed_and_failure() {
        let dir = TempDir::new().unwrap();
        let file = file(
            &dir,
            &[("a", "http://a.test/f.zip"), ("b", "http://b.test/f.zip")],
        );
        let mut events = file.events().subscribe_channel();
        let engine = Arc::new(FakeEngine {
            speed: HashMap::from([
                ("http://a.test/f.zip".to_string(), Behaviour::Measure(2048.0)),
                ("http://b.test/f.zip".to_string(), Behaviour::Fail(503)),
            ]),
            ..Default::default()
        });

        speedtest(&file, Arc::clone(&engine), quick(), false).await;

        assert_eq!(file.speed(), Some(2048.0));
        let b = file.source("b").unwrap();
        assert_eq!(b.speed(), Speed::NotApplicable);
        assert_eq!(b.as_download().unwrap().error_code(), Some(503));
        assert_eq!(file.speed_fastest(), Some(("http://a.test/f.zip".to_string(), 2048.0)));

        assert_eq!(events.try_recv().unwrap(), AcquisitionEvent::ProcessingStarted);
        assert!(matches!(
            events.try_recv().unwrap(),
            AcquisitionEvent::SourceSpeedChanged { ref source_id, .. } if source_id == "a"
        ));
        assert!(matches!(
            events.try_recv().unwrap(),
            AcquisitionEvent::SourceSpeedChanged { speed: Speed::NotApplicable, .. }
        ));
        assert_eq!(events.try_recv().unwrap(), AcquisitionEvent::ProcessingStopped);

        // Measured sources are skipped, failed ones are retried.
        engine.started.lock().clear();
        speedtest(&file, Arc::clone(&engine), quick(), false).await;
        assert_eq!(*engine.started.lock(), vec!["http://b.test/f.zip".to_string()]);
    }

    #[tokio::test]
    async fn test_timeout_moves_on_to_next_source() {
        let dir = TempDir::new().unwrap();
        let file = file(
            &dir,
            &[("slow", "http://slow.test/f.zip"), ("b", "http://b.test/f.zip")],
        );
        let engine = Arc::new(FakeEngine {
            speed: HashMap::from([
                ("http://slow.test/f.zip".to_string(), Behaviour::Hang),
                ("http://b.test/f.zip".to_string(), Behaviour::Measure(10.0)),
            ]),
            ..Default::default()
        });

        let started = std::time::Instant::now();
        speedtest(&file, Arc::clone(&engine), quick(), false).await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(file.source("slow").unwrap().speed(), Speed::NotApplicable);
        assert_eq!(file.source("b").unwrap().speed(), Speed::Measured(10.0));
        assert_eq!(engine.started.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_full_body_becomes_single_cache_source() {
        let dir = TempDir::new().unwrap();
        let file = file(
            &dir,
            &[("a", "http://a.test/f.zip"), ("b", "http://b.test/f.zip")],
        );
        let engine = Arc::new(FakeEngine {
            speed: HashMap::from([
                ("http://a.test/f.zip".to_string(), Behaviour::Buffer(99.0, b"whole file")),
                ("http://b.test/f.zip".to_string(), Behaviour::Measure(1.0)),
            ]),
            ..Default::default()
        });

        speedtest(&file, Arc::clone(&engine), quick(), false).await;

        let caches = file.sources_of_kind(SourceKind::Cache);
        assert_eq!(caches.len(), 1);
        assert!(caches[0].is_available());
        assert!(!caches[0].as_cache().unwrap().is_pga_cache());
        assert_eq!(std::fs::read(file.dest_file().unwrap()).unwrap(), b"whole file");
        // Probing stopped after the full copy arrived.
        assert_eq!(*engine.started.lock(), vec!["http://a.test/f.zip".to_string()]);

        speedtest(&file, Arc::clone(&engine), quick(), true).await;
        assert_eq!(file.sources_of_kind(SourceKind::Cache).len(), 1);
    }

    #[tokio::test]
    async fn test_availability_check() {
        let dir = TempDir::new().unwrap();
        let file = file(
            &dir,
            &[
                ("a", "http://a.test/f.zip"),
                ("b", "http://b.test/f.zip"),
                ("c", "http://c.test/f.zip"),
            ],
        );
        let mut events = file.events().subscribe_channel();
        let engine = Arc::new(FakeEngine {
            reachable: HashMap::from([
                ("http://a.test/f.zip".to_string(), Some(false)),
                ("http://b.test/f.zip".to_string(), Some(true)),
                ("http://c.test/f.zip".to_string(), None),
            ]),
            ..Default::default()
        });

        let (control, mut control_loop) = ControlLoop::new();
        let scheduler = JobScheduler::new(control);
        let done = Arc::new(AtomicBool::new(false));
        let job_file = Arc::clone(&file);
        let finished = Arc::clone(&done);
        scheduler.submit(
            Some("availability"),
            move |ctx| async move { job_file.check_availability(&ctx, engine.as_ref(), true).await },
            move |_: Result<()>| finished.store(true, Ordering::SeqCst),
        );
        assert!(
            control_loop
                .run_until(Duration::from_secs(5), || done.load(Ordering::SeqCst))
                .await
        );

        let availability = |id: &str| file.source(id).unwrap().as_download().unwrap().availability();
        assert_eq!(availability("a"), Availability::Unreachable);
        assert_eq!(availability("b"), Availability::Reachable);
        assert_eq!(availability("c"), Availability::NetworkError);
        assert_eq!(file.available_downloads(), 1);
        assert!(!file.is_offline());

        let changed: Vec<AcquisitionEvent> = std::iter::from_fn(|| events.try_recv().ok()).collect();
        assert_eq!(changed.len(), 5);
        assert_eq!(
            changed[1],
            AcquisitionEvent::SourceAvailabilityChanged {
                source_id: "a".to_string()
            }
        );
    }

    #[test]
    fn test_apply_speed_measurement_skips_measured_url() {
        let dir = TempDir::new().unwrap();
        let file = file(
            &dir,
            &[
                ("one", "http://cdn.test/one.zip"),
                ("two", "http://cdn.test/two.zip"),
                ("other", "http://other.test/one.zip"),
            ],
        );
        assert_eq!(
            file.apply_speed_measurement("cdn.test", "http://cdn.test/one.zip", 500.0),
            1
        );
        assert_eq!(file.source("two").unwrap().speed(), Speed::Measured(500.0));
        assert_eq!(file.source("one").unwrap().speed(), Speed::Untested);
        assert_eq!(file.source("other").unwrap().speed(), Speed::Untested);
    }
}
