use anyhow::{Context, Result};
use console::{Term, style};
use indicatif::{ProgressBar, ProgressStyle};
use sourcepick::config::ConfigManager;
use sourcepick::download::{ProgressFormatter, TransferProgress};
use sourcepick::jobs::StopToken;
use sourcepick::source::{FileSource, Source};
use sourcepick::{Error, FileAcquisition, SELECT_AUTO_AVAILABLE, SELECT_INIT};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{Session, build_spec, source_label, spinner};

pub async fn handle_fetch(
    config_manager: &ConfigManager,
    urls: Vec<String>,
    filename: String,
    checksum: Option<String>,
    dest: Option<PathBuf>,
    verbose: bool,
) -> Result<()> {
    let term = Term::stdout();
    let spec = build_spec(Some(filename.clone()), &urls, checksum.as_deref());
    let mut session = Session::open(config_manager.config(), "sourcepick", "file", spec)?;

    let spinner = spinner()?;
    session.attach_spinner(&spinner, "Checking which sources are reachable...");
    session.scope.start_availability_checks(false);
    session.wait_for_jobs().await?;
    spinner.finish_and_clear();

    let picked = pick_source(&session.file)?;
    let active = session.file.active_source();
    term.write_line(&format!(
        "{} Using source {} ({})",
        style("🌐").cyan(),
        style(&picked).cyan(),
        source_label(&active)
    ))?;
    if verbose {
        term.write_line(&format!("   {}", style(active.url()).dim()))?;
    }

    if let Some(dest) = dest {
        session.file.set_dest_file(dest);
    }

    let stop = StopToken::new();
    let (progress_tx, progress_rx) = mpsc::unbounded_channel();
    let progress_task = tokio::spawn(show_progress(progress_rx, filename));

    let result = tokio::select! {
        result = session.file.fetch(session.engine.as_ref(), &stop, Some(&progress_tx)) => result,
        interrupted = tokio::signal::ctrl_c() => {
            interrupted?;
            stop.set();
            Err(Error::Cancelled)
        }
    };
    drop(progress_tx);
    progress_task.await.context("Progress display failed")??;

    match result {
        Ok(path) => {
            term.write_line(&format!(
                "{} Saved to {}",
                style("✅").green(),
                style(path.display()).cyan()
            ))?;
            if session.file.active_source().checksum().is_some() {
                term.write_line(&format!("{} Checksum verified", style("🔒").green()))?;
            }
            Ok(())
        }
        Err(error) => {
            if let Error::ChecksumMismatch { .. } = error {
                term.write_line(&format!(
                    "{} Checksum mismatch for {}, the file was left in place",
                    style("❌").red(),
                    session.file.dest_file()?.display()
                ))?;
            }
            Err(error.into())
        }
    }
}

/// Starts from `init`; a download source already known to be down gives way
/// to the first reachable one.
fn pick_source(file: &FileAcquisition) -> Result<String> {
    let picked = file.select(SELECT_INIT)?;
    let down = matches!(
        file.active_source(),
        Source::Download(ref download) if download.availability().is_confirmed_down()
    );
    if !down {
        return Ok(picked);
    }

    match file.select(SELECT_AUTO_AVAILABLE) {
        Ok(available) => {
            debug!("Source {} is down, switched to {}", picked, available);
            Ok(available)
        }
        Err(Error::NoAvailableSource { .. }) => {
            warn!("No source of {} is reachable, trying {} anyway", file, picked);
            Ok(file.select(&picked)?)
        }
        Err(e) => Err(e.into()),
    }
}

async fn show_progress(
    mut progress: mpsc::UnboundedReceiver<TransferProgress>,
    filename: String,
) -> Result<()> {
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")?
            .progress_chars("#>-"),
    );
    pb.set_message(format!("Downloading {}", filename));

    while let Some(update) = progress.recv().await {
        match update {
            TransferProgress::Started { resume_from, .. } => {
                if resume_from > 0 {
                    pb.println(format!(
                        "Resuming from {}",
                        ProgressFormatter::format_bytes(resume_from)
                    ));
                }
                pb.set_position(resume_from);
            }
            TransferProgress::Progress {
                bytes_downloaded,
                total_bytes,
                ..
            } => {
                if total_bytes > 0 {
                    pb.set_length(total_bytes);
                }
                pb.set_position(bytes_downloaded);
            }
            TransferProgress::Completed { bytes_downloaded } => {
                pb.set_position(bytes_downloaded);
                pb.println(format!(
                    "Downloaded {} in {}",
                    ProgressFormatter::format_bytes(bytes_downloaded),
                    ProgressFormatter::format_duration(pb.elapsed())
                ));
                pb.finish_and_clear();
            }
            TransferProgress::Cancelled => pb.abandon_with_message("Cancelled"),
        }
    }
    if !pb.is_finished() {
        pb.finish_and_clear();
    }
    Ok(())
}
