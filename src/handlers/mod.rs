pub mod config;
pub mod fetch;
pub mod probe;

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use sourcepick::config::Config;
use sourcepick::download::{HttpTransferEngine, TransferEngine};
use sourcepick::jobs::ControlLoop;
use sourcepick::source::{FileSource, FileSpec, Source, SourceDescriptor};
use sourcepick::storage::FsCacheStorage;
use sourcepick::{AcquisitionEvent, FileAcquisition, InstallScope};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::cli::{Commands, ConfigAction};

// Re-export all handlers
pub use config::handle_config;
pub use fetch::handle_fetch;
pub use probe::handle_probe;

/// Check if config validation should be skipped for certain commands
pub fn should_skip_config_validation(command: &Commands) -> bool {
    matches!(
        command,
        Commands::Config {
            action: ConfigAction::Validate | ConfigAction::Reset { .. } | ConfigAction::Path
        }
    )
}

/// Sources are numbered in command-line order and share one checksum.
pub fn build_spec(filename: Option<String>, urls: &[String], checksum: Option<&str>) -> FileSpec {
    urls.iter()
        .enumerate()
        .fold(FileSpec::new(filename), |spec, (index, url)| {
            let descriptor = SourceDescriptor::new(url.as_str());
            let descriptor = match checksum {
                Some(checksum) => descriptor.with_checksum(checksum),
                None => descriptor,
            };
            spec.with_source((index + 1).to_string(), descriptor)
        })
}

/// One file in its own install scope, with the control loop that serves it.
pub struct Session {
    pub file: Arc<FileAcquisition>,
    pub scope: InstallScope,
    pub engine: Arc<dyn TransferEngine>,
    control_loop: ControlLoop,
    job_limit: Duration,
}

impl Session {
    pub fn open(config: &Config, game: &str, file_id: &str, spec: FileSpec) -> Result<Self> {
        let file = Arc::new(FileAcquisition::new(
            game,
            file_id,
            spec,
            config.acquisition_settings(),
            Arc::new(FsCacheStorage),
        )?);
        let engine: Arc<dyn TransferEngine> =
            Arc::new(HttpTransferEngine::new(config.engine_settings())?);

        let (control, control_loop) = ControlLoop::new();
        let probe = config.probe_settings();
        let sources = file.source_count() as u32;
        let job_limit = (probe.window + Duration::from_secs(config.general.request_timeout_secs))
            * sources.max(1)
            + Duration::from_secs(5);

        let scope = InstallScope::new(control, Arc::clone(&engine), probe);
        scope.add_file(Arc::clone(&file));

        Ok(Self {
            file,
            scope,
            engine,
            control_loop,
            job_limit,
        })
    }

    /// Shows `spinner` while the file reports it is processing.
    pub fn attach_spinner(&self, spinner: &ProgressBar, message: &'static str) {
        let spinner = spinner.clone();
        self.file.events().subscribe(move |event| match event {
            AcquisitionEvent::ProcessingStarted => {
                spinner.set_message(message);
                spinner.enable_steady_tick(Duration::from_millis(100));
            }
            AcquisitionEvent::ProcessingStopped => spinner.disable_steady_tick(),
            _ => {}
        });
    }

    /// Drives the control loop until the scope's jobs are done. Ctrl-C aborts them.
    pub async fn wait_for_jobs(&mut self) -> Result<bool> {
        let scope = &self.scope;
        let finished = tokio::select! {
            finished = self.control_loop.run_until(self.job_limit, || !scope.is_busy()) => finished,
            interrupted = tokio::signal::ctrl_c() => {
                interrupted?;
                warn!("Interrupted, stopping {} jobs", scope.abort());
                false
            }
        };
        if !finished && self.scope.is_busy() {
            warn!("Jobs still running after {:?}, aborting", self.job_limit);
            self.scope.abort();
        }
        // Drain callbacks queued by jobs that ended just now.
        self.control_loop.run_pending();
        Ok(finished)
    }
}

pub fn spinner() -> Result<ProgressBar> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::default_spinner().template("{spinner:.blue} {msg}")?);
    Ok(spinner)
}

/// "host" for downloads, the kind name for everything else.
pub fn source_label(source: &Source) -> String {
    source
        .domain()
        .filter(|domain| !domain.is_empty())
        .unwrap_or_else(|| source.kind().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sourcepick::source::SourceKind;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.cache.temp_directory = Some(dir.path().to_path_buf());
        config
    }

    #[test]
    fn test_build_spec_numbers_sources() {
        let spec = build_spec(
            Some("f.zip".to_string()),
            &["http://a.test/f.zip".to_string(), "http://b.test/f.zip".to_string()],
            Some("sha1:abc"),
        );
        assert_eq!(spec.filename.as_deref(), Some("f.zip"));
        let ids: Vec<&str> = spec.sources.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2"]);
        assert!(
            spec.sources
                .iter()
                .all(|(_, descriptor)| descriptor.checksum.as_deref() == Some("sha1:abc"))
        );
    }

    #[test]
    fn test_session_registers_file() {
        let dir = TempDir::new().unwrap();
        let spec = build_spec(None, &["http://a.test/f.zip".to_string()], None);
        let session = Session::open(&config(&dir), "game", "file", spec).unwrap();

        assert_eq!(session.scope.files().len(), 1);
        assert_eq!(session.file.active_source_id(), "1");
        assert_eq!(source_label(&session.file.active_source()), "a.test");

        let user = session.file.sources_of_kind(SourceKind::User);
        assert_eq!(source_label(&user[0]), "User");
    }

    #[test]
    fn test_skip_validation_for_repair_commands() {
        assert!(should_skip_config_validation(&Commands::Config {
            action: ConfigAction::Reset { yes: true }
        }));
        assert!(!should_skip_config_validation(&Commands::Config {
            action: ConfigAction::Show
        }));
    }
}
