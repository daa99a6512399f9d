use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "sourcepick")]
#[command(about = "Pick the fastest reachable source for an installer file")]
#[command(long_about = "
sourcepick resolves where the bytes of an installer file should come from.
Given several mirrors it checks which are reachable, measures their speed,
and downloads from the best one, verifying the result against a checksum.

Examples:
  sourcepick probe https://a.example/game.zip https://b.example/game.zip
  sourcepick fetch https://a.example/game.zip --filename game.zip --checksum sha256:...
  sourcepick config show
")]
#[command(version)]
pub struct Cli {
    /// Override config file path
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check availability and speed of every source of a file
    #[command(visible_alias = "p")]
    Probe {
        /// Source URLs, in priority order
        #[arg(required = true, value_name = "URL")]
        urls: Vec<String>,

        /// Name of the file on disk
        #[arg(short = 'n', long, value_name = "NAME")]
        filename: Option<String>,

        /// Game identifier used for cache paths
        #[arg(short, long, default_value = "sourcepick")]
        game: String,

        /// File identifier used for cache paths
        #[arg(long, default_value = "file")]
        file: String,

        /// Re-measure sources that already have a speed
        #[arg(short, long)]
        force: bool,
    },

    /// Download a file from its best source and verify it
    #[command(visible_alias = "f")]
    Fetch {
        /// Source URLs, in priority order
        #[arg(required = true, value_name = "URL")]
        urls: Vec<String>,

        /// Name of the file on disk
        #[arg(short = 'n', long, value_name = "NAME")]
        filename: String,

        /// Expected checksum as algorithm:hex (md5, sha1, sha256, sha512)
        #[arg(short = 'c', long, value_name = "ALGO:HEX")]
        checksum: Option<String>,

        /// Where to put the verified file
        #[arg(short, long, value_name = "PATH")]
        dest: Option<PathBuf>,
    },

    /// Manage configuration
    #[command(visible_alias = "cfg")]
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Print the config file location
    Path,

    /// Validate configuration
    Validate,

    /// Reset configuration to defaults
    Reset {
        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

impl Cli {
    /// Validate CLI arguments for logical consistency
    pub fn validate(&self) -> Result<(), String> {
        match &self.command {
            Commands::Probe { urls, .. } | Commands::Fetch { urls, .. }
                if urls.iter().any(|url| url.trim().is_empty()) =>
            {
                Err("Source URLs cannot be empty".to_string())
            }
            Commands::Fetch { filename, .. } if filename.trim().is_empty() => {
                Err("Filename cannot be empty".to_string())
            }
            Commands::Fetch {
                checksum: Some(checksum),
                ..
            } if !checksum.contains(':') => {
                Err(format!("Checksum '{}' must look like algorithm:hex", checksum))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["sourcepick", "probe", "http://a.test/f.zip"]).unwrap();
        if let Commands::Probe {
            urls, game, file, force, ..
        } = cli.command
        {
            assert_eq!(urls, vec!["http://a.test/f.zip"]);
            assert_eq!(game, "sourcepick");
            assert_eq!(file, "file");
            assert!(!force);
        } else {
            panic!("Expected Probe command");
        }
        assert!(!cli.verbose);
    }

    #[test]
    fn test_fetch_command_options() {
        let cli = Cli::try_parse_from([
            "sourcepick",
            "--verbose",
            "fetch",
            "http://a.test/f.zip",
            "http://b.test/f.zip",
            "--filename",
            "f.zip",
            "--checksum",
            "sha1:abc",
            "--dest",
            "/tmp/f.zip",
        ])
        .unwrap();

        assert!(cli.verbose);
        assert!(cli.validate().is_ok());
        if let Commands::Fetch {
            urls,
            filename,
            checksum,
            dest,
        } = cli.command
        {
            assert_eq!(urls.len(), 2);
            assert_eq!(filename, "f.zip");
            assert_eq!(checksum.as_deref(), Some("sha1:abc"));
            assert_eq!(dest, Some(PathBuf::from("/tmp/f.zip")));
        } else {
            panic!("Expected Fetch command");
        }
    }

    #[test]
    fn test_probe_requires_url() {
        assert!(Cli::try_parse_from(["sourcepick", "probe"]).is_err());
        assert!(Cli::try_parse_from(["sourcepick", "fetch", "http://a.test/f.zip"]).is_err());
    }

    #[test]
    fn test_config_subcommands() {
        let cli = Cli::try_parse_from(["sourcepick", "config", "reset", "--yes"]).unwrap();
        if let Commands::Config { action } = cli.command {
            assert!(matches!(action, ConfigAction::Reset { yes: true }));
        } else {
            panic!("Expected Config command");
        }
    }

    #[test]
    fn test_validation() {
        let cli = Cli::try_parse_from([
            "sourcepick",
            "fetch",
            "http://a.test/f.zip",
            "--filename",
            "f.zip",
            "--checksum",
            "deadbeef",
        ])
        .unwrap();
        assert!(cli.validate().is_err());

        let cli = Cli::try_parse_from(["sourcepick", "probe", " "]).unwrap();
        assert!(cli.validate().is_err());
    }
}
