use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "sipguard")]
#[command(about = "Privacy proxy and self-hosted replacement for a smart-bottle Parse API")]
#[command(version)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "sipguard.toml")]
    pub config: PathBuf,

    /// Local override file merged over the config (default: <config>.local.toml)
    #[arg(long = "override")]
    pub override_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn override_path(&self) -> PathBuf {
        self.override_path
            .clone()
            .unwrap_or_else(|| crate::config::AppConfig::default_override_path(&self.config))
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the redacting MITM proxy
    Mitm {
        /// Log every raw request, overriding the config file
        #[arg(long)]
        log_requests: bool,
    },
    /// Run the full replacement server
    Serve,
    /// Apply pending schema migrations to the server database
    Migrate,
    /// Write a default configuration file
    Init,
    /// View the MITM request log
    Logs {
        /// Show last N entries
        #[arg(long, default_value = "50")]
        tail: usize,
        /// Export every entry
        #[arg(long)]
        export: bool,
        /// Export format
        #[arg(long, value_enum, default_value = "json")]
        format: ExportFormat,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ExportFormat {
    Json,
    Csv,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_mitm_with_logging() {
        let cli = Cli::parse_from(["sipguard", "-c", "proxy.toml", "mitm", "--log-requests"]);
        assert_eq!(cli.config, PathBuf::from("proxy.toml"));
        assert!(matches!(cli.command, Commands::Mitm { log_requests: true }));
        assert_eq!(cli.override_path(), PathBuf::from("proxy.local.toml"));
    }

    #[test]
    fn parses_logs_export() {
        let cli = Cli::parse_from(["sipguard", "--override", "x.toml", "logs", "--export", "--format", "csv"]);
        assert_eq!(cli.override_path(), PathBuf::from("x.toml"));
        match cli.command {
            Commands::Logs { tail, export, format } => {
                assert_eq!(tail, 50);
                assert!(export);
                assert_eq!(format, ExportFormat::Csv);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn rejects_unknown_format() {
        assert!(Cli::try_parse_from(["sipguard", "logs", "--format", "xml"]).is_err());
    }
}
