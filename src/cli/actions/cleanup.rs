use anyhow::{Context, Result};
use tracing::info;

use crate::cli::actions::runtime;
use crate::cli::commands::registry::Options;
use crate::registry::{CleanupReport, RegistryCleaner};
use crate::ticket::PolicySet;

#[derive(Debug)]
pub struct Args {
    pub registry: Options,
}

/// Run a single sweep and print the report as JSON.
/// # Errors
/// Returns an error if the backend cannot be reached or the scan fails.
pub async fn execute(args: Args) -> Result<()> {
    let report = sweep(&args).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn sweep(args: &Args) -> Result<CleanupReport> {
    // Policies only shape new tickets; a sweep reads the stored ones.
    let runtime = runtime::connect(&args.registry, PolicySet::default(), None).await?;
    let report = RegistryCleaner::new(runtime.registry().clone())
        .run_once()
        .await
        .context("registry cleanup failed")?;
    info!(
        expired = report.expired,
        removed = report.removed,
        failed = report.failed,
        "cleanup finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Backend;
    use std::time::Duration;

    #[tokio::test]
    async fn sweep_on_empty_memory_registry() -> Result<()> {
        let args = Args {
            registry: Options {
                backend: Backend::Memory,
                dsn: None,
                redis_url: None,
                redis_namespace: "tessera".to_string(),
                max_connections: 1,
                operation_timeout: Duration::from_secs(1),
                retry_attempts: 1,
                node: None,
                id_random_length: 40,
                encryption_key: None,
            },
        };
        let report = sweep(&args).await?;
        assert_eq!(report, CleanupReport::default());
        Ok(())
    }
}
