use crate::GIT_COMMIT_HASH;
use crate::registry::TicketRegistry;
use axum::{
    body::Body,
    extract::Extension,
    http::{HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

#[derive(Serialize, Deserialize, Debug)]
pub struct Health {
    commit: String,
    name: String,
    version: String,
    backend: String,
    registry: String,
}

// axum handler for health
pub async fn health(method: Method, registry: Extension<TicketRegistry>) -> impl IntoResponse {
    // A count is the cheapest round trip every backend supports.
    let result = match registry.0.count_tickets().await {
        Ok(_) => Ok(()),
        Err(err) => {
            error!("Failed to reach ticket registry: {err}");
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    };

    let health = Health {
        commit: GIT_COMMIT_HASH.to_string(),
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        backend: registry.0.backend().to_string(),
        registry: if result.is_ok() {
            "ok".to_string()
        } else {
            "error".to_string()
        },
    };

    let body = if method == Method::GET {
        Json(&health).into_response()
    } else {
        Body::empty().into_response()
    };

    let short_hash = if health.commit.len() > 7 {
        &health.commit[0..7]
    } else {
        ""
    };

    let headers = format!("{}:{}:{}", health.name, health.version, short_hash)
        .parse::<HeaderValue>()
        .map(|x_app_header_value| {
            debug!("X-App header: {:?}", x_app_header_value);

            let mut headers = HeaderMap::new();
            headers.insert("X-App", x_app_header_value);
            headers
        })
        .unwrap_or_else(|err| {
            error!("Failed to parse X-App header: {}", err);
            HeaderMap::new()
        });

    if result.is_ok() {
        (StatusCode::OK, headers, body)
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, headers, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::registry::{MemoryTicketStore, RetryPolicy, ScanPage, StoreError, TicketStore};
    use crate::ticket::Ticket;
    use anyhow::{Result, anyhow};
    use async_trait::async_trait;
    use axum::body::to_bytes;
    use std::sync::Arc;

    /// Backend that is always down.
    #[derive(Debug)]
    struct Unreachable;

    #[async_trait]
    impl TicketStore for Unreachable {
        fn name(&self) -> &'static str {
            "unreachable"
        }

        async fn insert(&self, _ticket: &Ticket) -> Result<(), StoreError> {
            Err(StoreError::Permanent(anyhow!("down")))
        }

        async fn load(&self, _id: &str) -> Result<Option<Ticket>, StoreError> {
            Err(StoreError::Permanent(anyhow!("down")))
        }

        async fn compare_and_swap(&self, _ticket: &Ticket, _expected: u64) -> Result<bool, StoreError> {
            Err(StoreError::Permanent(anyhow!("down")))
        }

        async fn remove(&self, _id: &str) -> Result<bool, StoreError> {
            Err(StoreError::Permanent(anyhow!("down")))
        }

        async fn children(&self, _id: &str) -> Result<Vec<String>, StoreError> {
            Err(StoreError::Permanent(anyhow!("down")))
        }

        async fn scan(&self, _cursor: Option<String>, _limit: usize) -> Result<ScanPage, StoreError> {
            Err(StoreError::Permanent(anyhow!("down")))
        }

        async fn count(&self) -> Result<usize, StoreError> {
            Err(StoreError::Permanent(anyhow!("down")))
        }

        async fn clear(&self) -> Result<usize, StoreError> {
            Err(StoreError::Permanent(anyhow!("down")))
        }
    }

    #[tokio::test]
    async fn healthy_registry_reports_ok() -> Result<()> {
        let registry = TicketRegistry::new(Arc::new(MemoryTicketStore::new()), Arc::new(SystemClock));
        let response = health(Method::GET, Extension(registry)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("X-App"));

        let body = to_bytes(response.into_body(), usize::MAX).await?;
        let health: Health = serde_json::from_slice(&body)?;
        assert_eq!(health.registry, "ok");
        assert_eq!(health.backend, "memory");
        assert_eq!(health.name, env!("CARGO_PKG_NAME"));
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_registry_is_unavailable() -> Result<()> {
        let registry = TicketRegistry::new(Arc::new(Unreachable), Arc::new(SystemClock))
            .with_retry_policy(RetryPolicy::none());
        let response = health(Method::GET, Extension(registry)).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = to_bytes(response.into_body(), usize::MAX).await?;
        let health: Health = serde_json::from_slice(&body)?;
        assert_eq!(health.registry, "error");
        Ok(())
    }

    #[tokio::test]
    async fn options_has_empty_body() -> Result<()> {
        let registry = TicketRegistry::new(Arc::new(MemoryTicketStore::new()), Arc::new(SystemClock));
        let response = health(Method::OPTIONS, Extension(registry)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await?;
        assert!(body.is_empty());
        Ok(())
    }
}
