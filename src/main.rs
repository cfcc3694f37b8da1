use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use sipguard::cli::{Cli, Commands, ExportFormat};
use sipguard::config::AppConfig;
use sipguard::logging::{self, RequestLogger};
use sipguard::proxy::{MitmServer, UpstreamRelay};
use sipguard::redact::RuleSet;
use sipguard::server::{FullServer, db};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = include_str!("../templates/sipguard.toml");

fn init_tracing(debug: bool) {
    let default = if debug { "sipguard=debug" } else { "sipguard=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(cli: &Cli) -> anyhow::Result<AppConfig> {
    let override_path = cli.override_path();
    Ok(AppConfig::load_with_override(&cli.config, Some(&override_path))?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Init => {
            init_tracing(false);
            cmd_init(&cli.config)?;
        }
        Commands::Mitm { log_requests } => {
            let config = load_config(&cli)?;
            init_tracing(false);
            cmd_mitm(config, *log_requests).await?;
        }
        Commands::Serve => {
            let config = load_config(&cli)?;
            init_tracing(config.server.debug);
            cmd_serve(config).await?;
        }
        Commands::Migrate => {
            let config = load_config(&cli)?;
            init_tracing(config.server.debug);
            cmd_migrate(&config)?;
        }
        Commands::Logs { tail, export, format } => {
            let config = load_config(&cli)?;
            init_tracing(false);
            cmd_logs(&config.mitm.log_db, *tail, *export, *format)?;
        }
    }

    Ok(())
}

async fn cmd_mitm(config: AppConfig, log_requests: bool) -> anyhow::Result<()> {
    config.validate_mitm()?;
    let rules = RuleSet::from_config(&config.redaction)?;
    let relay = UpstreamRelay::new(
        &config.mitm.upstream,
        Duration::from_secs(config.mitm.timeout_secs),
    )?;

    let logger = if log_requests || config.mitm.log_requests {
        let pool = logging::open_pool(&config.mitm.log_db)?;
        println!("Logging raw requests to {}", config.mitm.log_db.display());
        RequestLogger::new(Arc::new(pool))
    } else {
        RequestLogger::disabled()
    };

    println!("sipguard MITM proxy starting...");
    println!("Upstream: {}", config.mitm.upstream);
    println!("Blocked paths: {}", config.mitm.blocked_paths.len());

    let addr = MitmServer::new(config.mitm.listen.clone())
        .with_rules(rules)
        .with_logger(logger)
        .with_relay(relay)
        .with_blocked_paths(config.mitm.blocked_paths.clone())
        .with_config_overrides(config.mitm.config_overrides.clone())
        .start()
        .await?;
    println!("Proxy running on {}", addr);

    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");
    Ok(())
}

async fn cmd_serve(config: AppConfig) -> anyhow::Result<()> {
    config.validate_server()?;
    let pool = db::open_pool(&config.server.database)?;

    println!("sipguard server starting...");
    println!("Database: {}", config.server.database.display());
    println!("Allowed hosts: {}", config.server.allowed_hosts.join(", "));

    let addr = FullServer::new(config.server, pool).start().await?;
    println!("Server running on {}", addr);

    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");
    Ok(())
}

fn cmd_migrate(config: &AppConfig) -> anyhow::Result<()> {
    let mut conn = rusqlite::Connection::open(&config.server.database)?;
    let applied = db::migrate(&mut conn)?;
    let version = db::schema_version(&conn)?;
    if applied == 0 {
        println!("Database {} is up to date (version {})", config.server.database.display(), version);
    } else {
        println!(
            "Applied {} migration(s) to {}; now at version {}",
            applied,
            config.server.database.display(),
            version
        );
    }
    Ok(())
}

fn cmd_init(config_path: &Path) -> anyhow::Result<()> {
    if config_path.exists() {
        println!("Config already exists: {}", config_path.display());
        return Ok(());
    }
    std::fs::write(config_path, DEFAULT_CONFIG)?;
    println!("Created config: {}", config_path.display());

    println!("\nNext steps:");
    println!("  1. Set mitm.upstream, or the [server] keys in {}", AppConfig::default_override_path(config_path).display());
    println!("  2. Run the proxy:   sipguard mitm");
    println!("     or the server:   sipguard migrate && sipguard serve");
    Ok(())
}

fn cmd_logs(db: &Path, tail: usize, export: bool, format: ExportFormat) -> anyhow::Result<()> {
    if !db.exists() {
        println!("No request log found at {}. Run 'sipguard mitm --log-requests' first.", db.display());
        return Ok(());
    }

    let conn = logging::open_db(db)?;

    if export {
        match format {
            ExportFormat::Csv => print!("{}", logging::export::export_csv(&conn)?),
            ExportFormat::Json => println!("{}", logging::export::export_json(&conn)?),
        }
        return Ok(());
    }

    let records = logging::query_recent(&conn, tail)?;
    if records.is_empty() {
        println!("No log entries found.");
        return Ok(());
    }
    println!(
        "{:<6} {:<34} {:<8} {:<50} {:<8} {:<8} {}",
        "ID", "TIMESTAMP", "METHOD", "PATH", "BYTES", "STATUS", "RESP BYTES"
    );
    println!("{}", "─".repeat(130));
    for record in &records {
        let status = record
            .response_status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        let response_bytes = record
            .response_body
            .as_ref()
            .map(|b| b.len().to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<6} {:<34} {:<8} {:<50} {:<8} {:<8} {}",
            record.id.unwrap_or_default(),
            record.timestamp,
            record.method,
            record.path,
            record.body.len(),
            status,
            response_bytes
        );
    }
    Ok(())
}
