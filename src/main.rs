mod cli;
mod handlers;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use sourcepick::config::ConfigManager;
use std::process;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    // Validate CLI arguments first
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        process::exit(1);
    }

    // Initialize logging based on verbosity; RUST_LOG wins when set
    let verbose = args.verbose;
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let mut config_manager = match &args.config {
        Some(path) => ConfigManager::from_path(path)?,
        None => ConfigManager::new()?,
    };

    // Validate config on startup (unless we're about to fix it)
    if !handlers::should_skip_config_validation(&args.command) {
        if let Err(e) = config_manager.validate() {
            eprintln!("Configuration validation failed: {}", e);
            eprintln!("Run 'sourcepick config reset' to restore the defaults");
            process::exit(1);
        }
    }

    // Handle commands
    match args.command {
        Commands::Probe {
            urls,
            filename,
            game,
            file,
            force,
        } => {
            handlers::handle_probe(&config_manager, urls, filename, game, file, force, verbose)
                .await?;
        }
        Commands::Fetch {
            urls,
            filename,
            checksum,
            dest,
        } => {
            handlers::handle_fetch(&config_manager, urls, filename, checksum, dest, verbose)
                .await?;
        }
        Commands::Config { action } => {
            handlers::handle_config(&mut config_manager, action).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sourcepick::download::{EngineSettings, HttpTransferEngine};
    use std::sync::Once;
    use tempfile::TempDir;

    static INIT: Once = Once::new();

    fn init_test_logging() {
        INIT.call_once(|| {
            tracing_subscriber::fmt()
                .with_max_level(tracing::Level::DEBUG)
                .with_test_writer()
                .init();
        });
    }

    #[tokio::test]
    async fn test_config_manager_initialization() {
        init_test_logging();

        let dir = TempDir::new().unwrap();
        let result = ConfigManager::from_path(dir.path().join("config.toml"));
        assert!(
            result.is_ok(),
            "Config manager should initialize successfully"
        );
        assert!(result.unwrap().validate().is_ok());
    }

    #[tokio::test]
    async fn test_engine_initialization() {
        init_test_logging();

        let engine = HttpTransferEngine::new(EngineSettings::default());
        assert!(engine.is_ok(), "HTTP engine should build with defaults");
    }

    #[test]
    fn test_cli_integration() {
        let cli = Cli::try_parse_from([
            "sourcepick",
            "--config",
            "/tmp/sourcepick.toml",
            "config",
            "path",
        ])
        .unwrap();
        assert!(handlers::should_skip_config_validation(&cli.command));
        assert_eq!(
            cli.config.as_deref(),
            Some(std::path::Path::new("/tmp/sourcepick.toml"))
        );
    }

    #[tokio::test]
    async fn test_probe_of_local_file() {
        init_test_logging();

        let dir = TempDir::new().unwrap();
        let origin = dir.path().join("data.bin");
        std::fs::write(&origin, b"local bytes").unwrap();

        let mut manager = ConfigManager::from_path(dir.path().join("config.toml")).unwrap();
        manager.config_mut().cache.temp_directory = Some(dir.path().join("tmp"));
        manager.config_mut().probe.window_ms = 500;
        manager.config_mut().probe.sample_ms = 200;

        let result = handlers::handle_probe(
            &manager,
            vec![format!("file://{}", origin.display())],
            Some("data.bin".to_string()),
            "game".to_string(),
            "data".to_string(),
            false,
            true,
        )
        .await;
        assert!(result.is_ok(), "Probing a local file should succeed");
    }
}
