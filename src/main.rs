use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ratewarden::config::{DefinitionConfig, IdentifierConfig, RatewardenConfig};
use ratewarden::ratelimit::{Context, RateLimiter};

/// Replay requests against configured rate limits and print each decision.
#[derive(Parser, Debug)]
#[command(name = "ratewarden", version, about)]
struct Args {
    /// YAML configuration file; `RATEWARDEN__*` variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Owner tag namespacing the scope keys
    #[arg(long)]
    owner: Option<String>,

    /// Acting principal (user ID, API key, ...)
    #[arg(short, long)]
    principal: Option<String>,

    /// Request attribute as key=value; may be repeated
    #[arg(short, long = "attr", value_parser = parse_attribute)]
    attributes: Vec<(String, String)>,

    /// Ad-hoc per-principal limit added to the configured ones
    #[arg(long, requires = "window")]
    limit: Option<u64>,

    /// Window in seconds of the ad-hoc limit
    #[arg(long, requires = "limit")]
    window: Option<u64>,

    /// Number of requests to replay
    #[arg(short = 'n', long, default_value_t = 1)]
    requests: u32,

    /// Pause between requests in milliseconds
    #[arg(long, default_value_t = 0)]
    interval_ms: u64,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

fn parse_attribute(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got `{}`", s))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    setup_logging(args.json_logs);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => RatewardenConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => RatewardenConfig::default(),
    };

    if let (Some(limit), Some(window)) = (args.limit, args.window) {
        config.definitions.insert(
            "cli".to_string(),
            DefinitionConfig {
                limit,
                window,
                identifier: Some(IdentifierConfig::Principal),
                active: true,
            },
        );
    }
    info!(definitions = config.definitions.len(), "Configuration loaded");

    let limiter = RateLimiter::from_config(&config).context("Failed to build rate limiter")?;

    for request in 1..=args.requests {
        let mut context = Context::new();
        if let Some(owner) = &args.owner {
            context = context.with_owner(owner.clone());
        }
        if let Some(principal) = &args.principal {
            context = context.with_principal(principal.clone());
        }
        for (key, value) in &args.attributes {
            context = context.with_attribute(key.clone(), value.clone());
        }

        let (allowed, rejection) = match limiter.evaluate(&context).await {
            Ok(allowed) => (allowed, None),
            Err(e) if e.is_rate_limited() => (false, Some(e)),
            Err(e) => {
                warn!(error = %e, request, "Rate limiter failed");
                return Err(e).context("Rate limit evaluation failed");
            }
        };

        let retry_after = match &rejection {
            Some(ratewarden::error::RateLimiterError::TooManyRequests { retry_after, .. }) => {
                *retry_after
            }
            _ => None,
        };

        let line = json!({
            "request": request,
            "allowed": allowed,
            "rejection": rejection.as_ref().map(|e| e.to_string()),
            "retry_after": retry_after,
            "headers": context.headers().snapshot(),
        });
        println!("{}", serde_json::to_string(&line)?);

        if args.interval_ms > 0 && request < args.requests {
            tokio::time::sleep(Duration::from_millis(args.interval_ms)).await;
        }
    }

    Ok(())
}

/// Logs go to stderr so stdout carries only decisions.
fn setup_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}
