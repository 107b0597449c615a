//! Cloudlink CLI - Command line interface for connection health operations.
//!
//! This tool inspects the provider capability matrix and runs token
//! renewal and health checks against a token database.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use cloudlink_common::{ConnectionKey, ProviderId, Secret};
use cloudlink_health::{
    derive_consolidated_status, Collaborators, DeliveryError, HealthConfig, HealthEngine, Mailer,
    MemoryFailedOperations, MemoryJobQueue, Recipient, ValidatorOutcome,
};
use cloudlink_providers::{
    create_default_capabilities, create_default_registry, CapabilityDegradationService, Feature,
    ProviderCapabilityRegistry,
};
use cloudlink_store::{MemoryCache, SqliteLock, SqliteTokenStore, Token, TokenStore};

#[derive(Parser)]
#[command(name = "cloudlink")]
#[command(about = "Cloudlink - Cloud storage connection health")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// JSON configuration file (engine settings and provider clients).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show provider capabilities.
    Capabilities {
        /// Only show this provider.
        #[arg(short, long)]
        provider: Option<String>,
    },

    /// Pick the provider best matching a feature request.
    BestProvider {
        /// Features the provider must support (comma separated).
        #[arg(short, long, value_delimiter = ',')]
        require: Vec<Feature>,

        /// Features that are nice to have (comma separated).
        #[arg(short = 'P', long, value_delimiter = ',')]
        prefer: Vec<Feature>,
    },

    /// List workarounds for a feature a provider lacks.
    Alternatives {
        /// Missing feature.
        #[arg(short, long)]
        feature: Feature,

        /// Provider to degrade on.
        #[arg(short, long)]
        provider: String,
    },

    /// Show how a provider covers a set of required features.
    Plan {
        /// Provider to plan for.
        #[arg(short, long)]
        provider: String,

        /// Required features (comma separated).
        #[arg(short, long, value_delimiter = ',')]
        require: Vec<Feature>,
    },

    /// Store the tokens of a new OAuth grant.
    Connect {
        /// Token database.
        #[arg(short, long)]
        db: Option<PathBuf>,

        #[arg(short, long)]
        user: String,

        #[arg(short, long)]
        provider: String,

        /// Access token.
        #[arg(long)]
        access_token: String,

        /// Refresh token.
        #[arg(long)]
        refresh_token: Option<String>,

        /// Access token lifetime in seconds.
        #[arg(long)]
        expires_in: Option<i64>,
    },

    /// Show the stored state of a connection without contacting the provider.
    Status {
        /// Token database.
        #[arg(short, long)]
        db: Option<PathBuf>,

        #[arg(short, long)]
        user: String,

        #[arg(short, long)]
        provider: String,
    },

    /// Validate a connection live: refresh if needed and probe the provider.
    Check {
        /// Token database.
        #[arg(short, long)]
        db: Option<PathBuf>,

        #[arg(short, long)]
        user: String,

        #[arg(short, long)]
        provider: String,
    },

    /// Refresh every token that expires within the proactive window.
    Sweep {
        /// Token database.
        #[arg(short, long)]
        db: Option<PathBuf>,
    },
}

/// Contents of the `--config` file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CliConfig {
    #[serde(flatten)]
    health: HealthConfig,
    /// Provider client configurations keyed by registered provider name.
    providers: BTreeMap<String, Value>,
}

impl CliConfig {
    fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: CliConfig = serde_json::from_str(&json)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        config.health.validate().context("Invalid engine settings")?;
        Ok(config)
    }
}

/// Mailer that writes notifications to the log.
struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(
        &self,
        template: &str,
        recipient: &Recipient,
        payload: &Value,
    ) -> std::result::Result<(), DeliveryError> {
        info!(template, recipient = ?recipient, "Notification: {}", payload);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str())),
        )
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = CliConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Capabilities { provider } => cmd_capabilities(provider.as_deref()),

        Commands::BestProvider { require, prefer } => cmd_best_provider(&require, &prefer),

        Commands::Alternatives { feature, provider } => cmd_alternatives(feature, &provider),

        Commands::Plan { provider, require } => cmd_plan(&provider, &require),

        Commands::Connect {
            db,
            user,
            provider,
            access_token,
            refresh_token,
            expires_in,
        } => {
            cmd_connect(
                &db_path(db)?,
                &user,
                &provider,
                access_token,
                refresh_token,
                expires_in,
            )
            .await
        }

        Commands::Status { db, user, provider } => cmd_status(&db_path(db)?, &user, &provider).await,

        Commands::Check { db, user, provider } => {
            cmd_check(&config, &db_path(db)?, &user, &provider).await
        }

        Commands::Sweep { db } => cmd_sweep(&config, &db_path(db)?).await,
    }
}

/// Token database path, defaulting to the user data directory.
fn db_path(db: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(db) = db {
        return Ok(db);
    }
    let dir = dirs::data_dir()
        .context("No data directory on this platform; pass --db")?
        .join("cloudlink");
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    Ok(dir.join("tokens.db"))
}

fn capability_registry() -> Result<Arc<ProviderCapabilityRegistry>> {
    Ok(Arc::new(
        create_default_capabilities().context("Failed to build capability matrix")?,
    ))
}

fn provider_id(provider: &str) -> Result<ProviderId> {
    ProviderId::new(provider).with_context(|| format!("Invalid provider '{}'", provider))
}

fn connection_key(user: &str, provider: &str) -> Result<ConnectionKey> {
    ConnectionKey::parse(user, provider).context("Invalid user or provider")
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Show provider capabilities.
fn cmd_capabilities(provider: Option<&str>) -> Result<()> {
    let registry = capability_registry()?;

    if let Some(provider) = provider {
        let id = provider_id(provider)?;
        let record = registry
            .get_capabilities(&id)
            .with_context(|| format!("Unknown provider '{}'", provider))?;
        return print_json(record);
    }

    let providers = registry.providers();
    println!("Providers: {}", providers.iter().map(|p| p.as_str()).collect::<Vec<_>>().join(", "));
    println!();
    for feature in registry.get_all_features() {
        let supported: Vec<&str> = providers
            .iter()
            .filter(|p| {
                registry
                    .get_capabilities(p)
                    .is_some_and(|record| record.supports(feature))
            })
            .map(|p| p.as_str())
            .collect();
        println!("  {:<26} {}", feature.as_str(), supported.join(", "));
    }
    Ok(())
}

/// Pick the best provider for a feature request.
fn cmd_best_provider(require: &[Feature], prefer: &[Feature]) -> Result<()> {
    let registry = capability_registry()?;

    match registry.find_best_provider_for_features(require, prefer) {
        Some(found) => {
            println!("Best provider: {} (score {})", found.provider, found.score);
            if !found.missing_preferred.is_empty() {
                let missing: Vec<&str> = found.missing_preferred.iter().map(|f| f.as_str()).collect();
                println!("  Missing preferred: {}", missing.join(", "));
            }
        }
        None => println!("No provider supports all required features"),
    }
    Ok(())
}

/// List workarounds for a missing feature.
fn cmd_alternatives(feature: Feature, provider: &str) -> Result<()> {
    let service = CapabilityDegradationService::new(capability_registry()?);
    let id = provider_id(provider)?;

    if service
        .registry()
        .get_capabilities(&id)
        .is_some_and(|record| record.supports(feature))
    {
        println!("{} supports {} natively", provider, feature);
        return Ok(());
    }
    if !service.can_gracefully_degrade(feature, &id) {
        println!("No workaround for {} on {}", feature, provider);
        return Ok(());
    }
    for alternative in service.get_feature_alternatives(feature, &id) {
        println!(
            "  {:<24} [{:?}] {}",
            alternative.strategy, alternative.impact, alternative.description
        );
    }
    Ok(())
}

/// Show how a provider covers required features.
fn cmd_plan(provider: &str, require: &[Feature]) -> Result<()> {
    let service = CapabilityDegradationService::new(capability_registry()?);
    let plan = service.degradation_plan(require, &provider_id(provider)?);
    print_json(&plan)?;
    if !plan.is_viable() {
        anyhow::bail!("{} cannot serve all required features", provider);
    }
    Ok(())
}

/// Store a new grant.
async fn cmd_connect(
    db: &Path,
    user: &str,
    provider: &str,
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
) -> Result<()> {
    let key = connection_key(user, provider)?;
    let store = SqliteTokenStore::open(db).context("Failed to open token database")?;

    let expires_at = expires_in.map(|secs| Utc::now() + chrono::Duration::seconds(secs));
    let token = Token::from_grant(
        key.clone(),
        Secret::new(access_token),
        refresh_token.map(Secret::new),
        expires_at,
    );
    let stored = store.insert(token).await.context("Failed to store token")?;

    info!("Connected {} (version {})", key, stored.version);
    Ok(())
}

/// Show stored state without probing.
async fn cmd_status(db: &Path, user: &str, provider: &str) -> Result<()> {
    let key = connection_key(user, provider)?;
    let store = SqliteTokenStore::open(db).context("Failed to open token database")?;
    let token = store.get(&key).await.context("Failed to read token")?;

    // Offline: only token facts count
    let status = derive_consolidated_status(token.as_ref(), ValidatorOutcome::Success);
    let report = match &token {
        Some(token) => serde_json::json!({
            "connection": key.to_string(),
            "status": status.as_str(),
            "expires_at": token.expires_at,
            "expired": token.is_expired(),
            "refresh_failure_count": token.refresh_failure_count,
            "requires_user_intervention": token.requires_user_intervention,
            "last_successful_refresh_at": token.last_successful_refresh_at,
            "last_refresh_error": token.last_refresh_error,
            "next_retry_at": token.next_retry_at,
        }),
        None => serde_json::json!({
            "connection": key.to_string(),
            "status": status.as_str(),
        }),
    };
    print_json(&report)
}

fn build_engine(config: &CliConfig, db: &Path) -> Result<HealthEngine> {
    let store = Arc::new(SqliteTokenStore::open(db).context("Failed to open token database")?);
    let lock = Arc::new(SqliteLock::open(db).context("Failed to open lock table")?);
    let providers = create_default_registry()
        .context("Failed to build provider registry")?
        .resolve_all(&config.providers)
        .context("Failed to configure provider clients")?;

    let engine = HealthEngine::new(
        config.health.clone(),
        Collaborators {
            store,
            lock,
            cache: Arc::new(MemoryCache::new()),
            providers,
            mailer: Arc::new(LogMailer),
            queue: Arc::new(MemoryJobQueue::new()),
            failed_operations: Arc::new(MemoryFailedOperations::new()),
        },
    )?;
    Ok(engine)
}

/// Validate a connection live.
async fn cmd_check(config: &CliConfig, db: &Path, user: &str, provider: &str) -> Result<()> {
    let key = connection_key(user, provider)?;
    let engine = build_engine(config, db)?;

    let status = engine.health().check_connection_health(&key).await;
    print_json(&status)
}

/// Run one renewal sweep.
async fn cmd_sweep(config: &CliConfig, db: &Path) -> Result<()> {
    let engine = build_engine(config, db)?;
    let report = engine
        .renewal()
        .renew_expiring()
        .await
        .context("Renewal sweep failed")?;

    println!(
        "Examined {}, refreshed {}, already valid {}, skipped {}, failed {} in {:?}",
        report.examined,
        report.refreshed,
        report.already_valid,
        report.skipped,
        report.failed,
        report.duration
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_feature_lists() {
        let cli = Cli::try_parse_from([
            "cloudlink",
            "best-provider",
            "--require",
            "presigned_urls,storage_classes",
            "--prefer",
            "multipart_uploads",
        ])
        .unwrap();
        match cli.command {
            Commands::BestProvider { require, prefer } => {
                assert_eq!(require, vec![Feature::PresignedUrls, Feature::StorageClasses]);
                assert_eq!(prefer, vec![Feature::MultipartUploads]);
            }
            _ => panic!("wrong command"),
        }
    }

    #[test]
    fn test_unknown_feature_rejected() {
        assert!(Cli::try_parse_from(["cloudlink", "alternatives", "-f", "teleport", "-p", "amazon-s3"]).is_err());
    }

    #[test]
    fn test_config_file_flattens_engine_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cloudlink.json");
        std::fs::write(
            &path,
            r#"{
                "refresh": { "lock_wait": 3 },
                "providers": { "memory": { "id": "google-drive" } }
            }"#,
        )
        .unwrap();

        let config = CliConfig::load(Some(&path)).unwrap();
        assert_eq!(config.health.refresh.lock_wait, std::time::Duration::from_secs(3));
        assert!(config.providers.contains_key("memory"));
    }

    #[tokio::test]
    async fn test_connect_then_sweep_with_scripted_provider() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("tokens.db");
        cmd_connect(&db, "7", "google-drive", "access".into(), Some("refresh".into()), Some(60))
            .await
            .unwrap();

        let mut config = CliConfig::default();
        config
            .providers
            .insert("memory".to_string(), serde_json::json!({ "id": "google-drive" }));
        let engine = build_engine(&config, &db).unwrap();
        let report = engine.renewal().renew_expiring().await.unwrap();
        assert_eq!(report.refreshed, 1);

        let store = SqliteTokenStore::open(&db).unwrap();
        let token = store
            .get(&connection_key("7", "google-drive").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(token.access_token.expose(), "access-1");
    }
}
