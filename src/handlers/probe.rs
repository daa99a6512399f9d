use anyhow::Result;
use console::{Term, style};
use sourcepick::SELECT_INIT;
use sourcepick::config::ConfigManager;
use sourcepick::download::ProgressFormatter;
use sourcepick::source::{Availability, FileSource, Source, Speed};

use super::{Session, build_spec, source_label, spinner};

pub async fn handle_probe(
    config_manager: &ConfigManager,
    urls: Vec<String>,
    filename: Option<String>,
    game: String,
    file: String,
    force: bool,
    verbose: bool,
) -> Result<()> {
    let term = Term::stdout();
    let spec = build_spec(filename, &urls, None);
    let mut session = Session::open(config_manager.config(), &game, &file, spec)?;

    term.write_line(&format!(
        "{} Probing {} sources for {}",
        style("🔍").cyan(),
        urls.len(),
        style(session.file.as_ref()).bold()
    ))?;

    let spinner = spinner()?;
    session.attach_spinner(&spinner, "Checking sources...");

    session.scope.start_availability_checks(true);
    let mut finished = session.wait_for_jobs().await?;
    if finished {
        session.scope.start_speed_tests(force);
        finished = session.wait_for_jobs().await?;
    }
    spinner.finish_and_clear();

    if !finished {
        term.write_line(&format!(
            "{} Probing did not complete, results are partial",
            style("⚠️").yellow()
        ))?;
    }

    term.write_line("")?;
    for source in session.file.sources() {
        term.write_line(&describe(&source, verbose))?;
    }

    let picked = session.file.select(SELECT_INIT)?;
    term.write_line("")?;
    term.write_line(&format!(
        "{} Best source: {} ({})",
        style("✅").green(),
        style(&picked).cyan(),
        session.file.human_url()
    ))?;
    if let Some((url, speed)) = session.file.speed_fastest() {
        term.write_line(&format!(
            "{} Fastest: {} at {}",
            style("🚀").green(),
            url,
            ProgressFormatter::format_speed(speed)
        ))?;
    }

    Ok(())
}

fn describe(source: &Source, verbose: bool) -> String {
    let state = match source {
        Source::Download(download) => {
            let availability = match download.availability() {
                Availability::Unknown => style("unknown").dim(),
                Availability::Reachable => style("reachable").green(),
                Availability::Unreachable => style("unreachable").red(),
                Availability::NetworkError => style("network error").red(),
            };
            let speed = match download.speed() {
                Speed::Measured(_) => download.speed_human_readable().unwrap_or_default(),
                Speed::NotApplicable => "n/a".to_string(),
                Speed::Untested => "untested".to_string(),
            };
            let mut state = format!("{} {}", availability, speed);
            if let Some(error) = download.error() {
                state.push_str(&format!(" ({})", style(error).red()));
            }
            if download.is_restricted() {
                state.push_str(&format!(" {}", style("[restricted]").yellow()));
            }
            state
        }
        other if other.is_available() => style("available").green().to_string(),
        _ => style("not available").dim().to_string(),
    };

    let mut line = format!(
        "  {} {:<24} {}",
        style(source.source_id()).cyan(),
        source_label(source),
        state
    );
    if verbose {
        line.push_str(&format!("\n      {}", style(source.url()).dim()));
    }
    line
}
