use anyhow::Result;
use secrecy::ExposeSecret;
use tracing::{error, info};
use url::Url;

use crate::api;
use crate::cli::actions::runtime;
use crate::cli::commands::registry::Options;
use crate::cli::telemetry;
use crate::registry::{Backend, CleanerConfig, LockConfig, RegistryCleaner, spawn_cleaner};
use crate::ticket::PolicySet;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub registry: Options,
    pub policies: PolicySet,
    pub cleaner: CleanerConfig,
    pub lock: Option<LockConfig>,
}

/// Execute the server action.
/// # Errors
/// Returns an error if the backend cannot be reached or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    log_startup_args(&args);

    let runtime = runtime::connect(&args.registry, args.policies, args.lock).await?;

    let mut cleaner = RegistryCleaner::new(runtime.registry().clone());
    if let Some(locks) = runtime.locks.clone() {
        cleaner = cleaner.with_locks(locks);
    }
    let sweeper = spawn_cleaner(cleaner, args.cleaner);

    let served = api::serve(args.port, &runtime.service, shutdown_signal()).await;

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }
    telemetry::shutdown_tracer();
    served
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
}

fn log_startup_args(args: &Args) {
    let connection = match args.registry.backend {
        Backend::Memory => "in-process".to_string(),
        Backend::Postgres => args
            .registry
            .dsn
            .as_ref()
            .map_or_else(|| "none".to_string(), |dsn| redact_url(dsn.expose_secret())),
        Backend::Redis => args
            .registry
            .redis_url
            .as_ref()
            .map_or_else(|| "none".to_string(), |url| redact_url(url.expose_secret())),
    };
    let entries = [
        ("listen", format!("tcp:{}", args.port)),
        ("backend", format!("{:?}", args.registry.backend).to_lowercase()),
        ("connection", connection),
        (
            "node",
            args.registry
                .node
                .clone()
                .unwrap_or_else(|| runtime::DEFAULT_NODE.to_string()),
        ),
        ("retry_attempts", args.registry.retry_attempts.to_string()),
        (
            "operation_timeout",
            format!("{:?}", args.registry.operation_timeout),
        ),
        ("cleaner_enabled", args.cleaner.enabled().to_string()),
        ("cleaner_interval", format!("{:?}", args.cleaner.interval())),
        ("locking", args.lock.is_some().to_string()),
    ];
    log_entries("Startup configuration", &entries);
}

fn redact_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("REDACTED"));
            }
            parsed.to_string()
        }
        Err(_) => "invalid-url".to_string(),
    }
}

fn log_entries(title: &str, entries: &[(&str, String)]) {
    let max_key_len = entries.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
    let mut message = format!(
        "tessera {} ({})\n\n{title}:",
        env!("CARGO_PKG_VERSION"),
        short_commit(crate::GIT_COMMIT_HASH)
    );
    for (key, value) in entries {
        let padding = " ".repeat(max_key_len.saturating_sub(key.len()));
        let _ =
            std::fmt::Write::write_fmt(&mut message, format_args!("\n  {key}:{padding} {value}"));
    }
    info!("{message}");
}

fn short_commit(hash: &str) -> &str {
    let trimmed = hash.trim();
    trimmed.get(..7).unwrap_or(trimmed)
}
