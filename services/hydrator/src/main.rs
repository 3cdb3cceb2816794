//! Timeline Hydrator
//!
//! Batch service that:
//! 1. Reads entity identifiers from a newline-delimited JSON file
//! 2. Fetches each entity's profile and full timeline through a pool of
//!    rate-limited API clients
//! 3. Writes a status line per identifier and the hydrated records

mod client_impl;
mod config;
mod dispatch;
mod error;
mod fetch;
mod input;
mod metrics;
mod writer;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use remote::TimelineApi;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use twitter_auth::expand_accounts;
use twitter_pool::{Pool, PoolConfig, spawn_sync_task, sync_cycle};

use crate::client_impl::TwitterClient;
use crate::config::Config;
use crate::fetch::Fetcher;
use crate::input::InputReader;
use crate::writer::Writer;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let run_id = uuid::Uuid::new_v4();
    run().instrument(info_span!("run", %run_id)).await
}

async fn run() -> Result<()> {
    info!("starting timeline-hydrator");

    let args: Vec<String> = std::env::args().collect();
    let config_path = Config::resolve_path(config_arg(&args));
    info!(path = %config_path.display(), "loading configuration");
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    info!(
        input = %config.input_file.display(),
        output = %config.output_path.display(),
        aggregation = %config.aggregation,
        accounts = config.accounts.len(),
        "configuration loaded"
    );

    if let Some(addr) = config.metrics.listen_addr {
        metrics::install_recorder(addr)
            .with_context(|| format!("failed to start metrics listener on {addr}"))?;
        info!(%addr, "prometheus exporter listening");
    }

    let input = InputReader::open(&config.input_file).await?;
    let writer = Writer::open(&config.output_path, config.aggregation, &config.compact_file)
        .await
        .context("failed to prepare output directory")?;

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.api.timeout_secs))
        .build()
        .context("failed to build HTTP client")?;
    let clients = build_clients(&config, &http).await;
    if clients.is_empty() {
        anyhow::bail!("no API client could be authenticated");
    }

    let pool = Arc::new(Pool::new(
        clients,
        PoolConfig {
            max_quota_waits: config.limits.max_quota_waits,
            default_reset: config.limits.default_reset(),
        },
    )?);
    let synced = sync_cycle(&pool).await;
    info!(clients = pool.size(), synced, "client pool ready");
    let sync_task = config
        .limits
        .sync_interval()
        .map(|interval| spawn_sync_task(pool.clone(), interval));

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            cancel.cancel();
        }
    });

    let fetcher = Arc::new(Fetcher::new(
        pool.clone(),
        config.limits.max_rate_limit_retries,
        cancel.clone(),
    ));
    let summary = dispatch::run(input, fetcher, Arc::new(writer), pool.size(), cancel).await;

    if let Some(task) = sync_task {
        task.abort();
    }
    let summary = summary.context("hydration aborted")?;

    info!(
        dispatched = summary.dispatched,
        succeeded = summary.succeeded,
        failed = summary.failed,
        interrupted = summary.interrupted,
        malformed = summary.malformed,
        peak_leased = pool.peak_leased(),
        pool = %pool.health(),
        "hydration complete"
    );
    Ok(())
}

/// Value following `--config`, if any.
fn config_arg(args: &[String]) -> Option<&str> {
    args.iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
}

/// Authenticate every configured identity. Identities that fail are logged
/// and left out of the pool.
async fn build_clients(config: &Config, http: &reqwest::Client) -> Vec<Arc<dyn TimelineApi>> {
    let mut clients: Vec<Arc<dyn TimelineApi>> = Vec::new();
    for identity in expand_accounts(&config.accounts) {
        match TwitterClient::connect(&identity, http, &config.api.base_url, config.api.page_size)
            .await
        {
            Ok(client) => clients.push(Arc::new(client)),
            Err(e) => warn!(client_id = identity.label(), error = %e, "skipping client"),
        }
    }
    clients
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn config_flag_value_is_picked_up() {
        let argv = args(&["timeline-hydrator", "--config", "/etc/hydrator.toml"]);
        assert_eq!(config_arg(&argv), Some("/etc/hydrator.toml"));
    }

    #[test]
    fn config_flag_without_value_is_ignored() {
        assert_eq!(config_arg(&args(&["timeline-hydrator", "--config"])), None);
        assert_eq!(config_arg(&args(&["timeline-hydrator"])), None);
    }

    fn config_for(base_url: &str) -> Config {
        let raw = format!(
            r#"
input_file = "in.ndjson"
output_path = "out"
aggregation = "compact"

[api]
base_url = "{base_url}"

[[accounts]]
consumer_key = "good"
consumer_secret = "s1"

[[accounts.user_auth]]
access_key = "111-a"
access_secret = "as"

[[accounts]]
consumer_key = "bad"
consumer_secret = "s2"
"#
        );
        toml::from_str(&raw).unwrap()
    }

    #[tokio::test]
    async fn failed_token_exchange_skips_only_that_identity() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(twitter_auth::TOKEN_PATH))
            // base64("good:s1")
            .and(header("authorization", "Basic Z29vZDpzMQ=="))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({"token_type": "bearer", "access_token": "t"}),
            ))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(twitter_auth::TOKEN_PATH))
            .respond_with(ResponseTemplate::new(403).set_body_json(
                serde_json::json!({"errors": [{"code": 99, "message": "Unable to verify your credentials"}]}),
            ))
            .mount(&server)
            .await;

        let config = config_for(&server.uri());
        let clients = build_clients(&config, &reqwest::Client::new()).await;

        let ids: Vec<&str> = clients.iter().map(|c| c.id()).collect();
        assert_eq!(ids.len(), 2, "got: {ids:?}");
        assert!(ids[0].starts_with("app-0"));
        assert!(ids[1].starts_with("user-0.0"));
    }
}
