//! Wires the configured backend into a registry, lock manager and ticket
//! service. Pools and clients are created once here and shared from then on.

use anyhow::{Context, Result};
use secrecy::ExposeSecret;
use std::sync::Arc;
use tracing::{debug, info};

use crate::cli::commands::registry::Options;
use crate::clock::{Clock, SystemClock};
use crate::registry::postgres::PostgresTicketStore;
use crate::registry::{
    Backend, LockConfig, LockManager, LockingTicketRegistry, MemoryTicketStore, RetryPolicy,
    TicketCipher, TicketLocks, TicketRegistry, TicketStore, lock::MemoryLockManager, lock::PostgresLockManager,
};
use crate::service::TicketService;
use crate::ticket::{PolicySet, TicketFactory, TicketIdGenerator};

/// Lock owner prefix when no node name is configured.
pub const DEFAULT_NODE: &str = "tessera";

#[derive(Clone, Debug)]
pub struct Runtime {
    pub service: TicketService,
    /// Set when locking is enabled; the cleaner sweeps under these leases.
    pub locks: Option<TicketLocks>,
}

impl Runtime {
    #[must_use]
    pub fn registry(&self) -> &TicketRegistry {
        self.service.registry()
    }
}

/// Connect the backend selected in `options`.
///
/// # Errors
///
/// Returns an error if the backend is unreachable, the schema cannot be
/// created, or the connection string is missing.
pub async fn connect(
    options: &Options,
    policies: PolicySet,
    lock: Option<LockConfig>,
) -> Result<Runtime> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (store, manager) = open_backend(options, &clock).await?;
    info!(backend = store.name(), "ticket registry connected");

    let retry = RetryPolicy::new()
        .with_max_attempts(options.retry_attempts)
        .with_operation_timeout(options.operation_timeout)
        .normalize();
    let mut registry = TicketRegistry::new(store, Arc::clone(&clock)).with_retry_policy(retry);
    if let Some(key) = &options.encryption_key {
        registry = registry.with_cipher(TicketCipher::from_base64(key.expose_secret())?);
        info!("ticket registry encryption enabled");
    }

    let mut ids = TicketIdGenerator::new(options.id_random_length);
    if let Some(node) = &options.node {
        ids = ids.with_suffix(node);
    }
    let factory = TicketFactory::new(clock)
        .with_id_generator(ids)
        .with_policies(policies);
    let service = TicketService::new(registry.clone(), Arc::new(factory));

    let node = options.node.as_deref().unwrap_or(DEFAULT_NODE);
    let Some(config) = lock else {
        return Ok(Runtime {
            service,
            locks: None,
        });
    };
    debug!(
        lease = ?config.lease(),
        wait_timeout = ?config.wait_timeout(),
        node,
        "ticket locking enabled"
    );
    let service = service.with_locking(LockingTicketRegistry::new(
        registry,
        Arc::clone(&manager),
        config,
        node,
    ));

    Ok(Runtime {
        service,
        locks: Some(TicketLocks::new(manager, config, node)),
    })
}

async fn open_backend(
    options: &Options,
    clock: &Arc<dyn Clock>,
) -> Result<(Arc<dyn TicketStore>, Arc<dyn LockManager>)> {
    match options.backend {
        Backend::Memory => Ok((
            Arc::new(MemoryTicketStore::new()),
            Arc::new(MemoryLockManager::new()),
        )),
        Backend::Postgres => {
            let dsn = options
                .dsn
                .as_ref()
                .context("missing required argument: --dsn")?;
            let store =
                PostgresTicketStore::connect(dsn.expose_secret(), options.max_connections).await?;
            store
                .migrate()
                .await
                .context("Failed to create registry schema")?;
            let manager = PostgresLockManager::new(store.pool().clone());
            Ok((Arc::new(store), Arc::new(manager)))
        }
        Backend::Redis => open_redis(options, clock).await,
    }
}

#[cfg(feature = "redis")]
async fn open_redis(
    options: &Options,
    clock: &Arc<dyn Clock>,
) -> Result<(Arc<dyn TicketStore>, Arc<dyn LockManager>)> {
    use crate::registry::lock::RedisLockManager;
    use crate::registry::redis::RedisTicketStore;

    let url = options
        .redis_url
        .as_ref()
        .context("missing required argument: --redis-url")?;
    let store = RedisTicketStore::connect(url.expose_secret(), &options.redis_namespace)
        .await?
        .with_clock(Arc::clone(clock));
    let manager = RedisLockManager::new(store.connection(), &options.redis_namespace);
    Ok((Arc::new(store), Arc::new(manager)))
}

#[cfg(not(feature = "redis"))]
async fn open_redis(
    _options: &Options,
    _clock: &Arc<dyn Clock>,
) -> Result<(Arc<dyn TicketStore>, Arc<dyn LockManager>)> {
    Err(anyhow::anyhow!(
        "redis backend requested but tessera was built without the `redis` feature"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ticket::{Authentication, ExpirationPolicy, TicketKind};
    use chrono::Utc;
    use std::time::Duration;

    fn options(backend: Backend) -> Options {
        Options {
            backend,
            dsn: None,
            redis_url: None,
            redis_namespace: "tessera".to_string(),
            max_connections: 1,
            operation_timeout: Duration::from_secs(1),
            retry_attempts: 1,
            node: Some("node1".to_string()),
            id_random_length: 20,
            encryption_key: None,
        }
    }

    #[tokio::test]
    async fn memory_runtime_issues_tickets_with_node_suffix() -> Result<()> {
        let policies = PolicySet::default()
            .with_transient_session(ExpirationPolicy::timeout(Duration::from_secs(60)));
        let runtime = connect(&options(Backend::Memory), policies.clone(), None).await?;
        assert!(runtime.locks.is_none());
        assert_eq!(runtime.registry().backend(), "memory");
        assert_eq!(runtime.service.factory().policies(), &policies);

        let tgt = runtime
            .service
            .create_ticket_granting_ticket(Authentication::new("casuser", Utc::now()))
            .await?;
        assert!(tgt.id().starts_with("TGT-"));
        assert!(tgt.id().ends_with("-node1"));
        assert!(
            runtime
                .registry()
                .get_ticket(tgt.id(), TicketKind::TicketGranting)
                .await
                .is_ok()
        );
        Ok(())
    }

    #[tokio::test]
    async fn locking_config_yields_cleaner_locks() -> Result<()> {
        let runtime = connect(
            &options(Backend::Memory),
            PolicySet::default(),
            Some(LockConfig::new()),
        )
        .await?;
        let locks = runtime.locks.context("locks")?;
        let guard = locks.acquire("registry-cleaner").await?;
        assert_eq!(guard.key(), "registry-cleaner");
        assert!(guard.release().await.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn encryption_key_enables_sealed_storage() -> Result<()> {
        let options = Options {
            encryption_key: Some(secrecy::SecretString::from(
                "KioqKioqKioqKioqKioqKioqKioqKioqKioqKioqKio=".to_string(),
            )),
            ..options(Backend::Memory)
        };
        let runtime = connect(&options, PolicySet::default(), None).await?;
        assert!(runtime.registry().is_encrypted());

        let tgt = runtime
            .service
            .create_ticket_granting_ticket(Authentication::new("casuser", Utc::now()))
            .await?;
        assert_ne!(runtime.registry().storage_id(tgt.id()), tgt.id());
        let found = runtime.registry().find_ticket(tgt.id()).await?;
        assert_eq!(found, tgt);
        Ok(())
    }

    #[tokio::test]
    async fn postgres_without_dsn_is_rejected() {
        let result = connect(&options(Backend::Postgres), PolicySet::default(), None).await;
        assert!(result.is_err_and(|err| err.to_string().contains("--dsn")));
    }
}
