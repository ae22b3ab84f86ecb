//! Ticket use-cases.
//!
//! [`TicketService`] strings factory and registry calls together the way a
//! CAS server drives them: log in, grant, validate, proxy, log out. Every
//! read-modify-write goes through the registry's compare-and-swap loop, or
//! through the lock-guarded registry when one is configured, and a lost race
//! is retried a few times before surfacing as `Contention`.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{Result, TicketError};
use crate::registry::{LockingTicketRegistry, TicketRegistry, store::MAX_CASCADE_DEPTH};
use crate::ticket::{Authentication, Service, Ticket, TicketFactory, TicketKind};

/// Whole use-case attempts made when the ticket keeps changing underneath.
pub const CONTENTION_RETRIES: u32 = 3;

/// What a relying service learns from a successful validation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Assertion {
    pub authentication: Authentication,
    pub service: Service,
    pub from_new_login: bool,
    /// Proxies the request went through, newest first. Empty for a plain ST.
    pub proxy_chain: Vec<Service>,
    /// TGT or PGT the validated ticket was granted from.
    pub granted_by: String,
}

impl Assertion {
    #[must_use]
    pub fn principal(&self) -> &str {
        self.authentication.principal()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Validation {
    pub assertion: Assertion,
    pub proxy_granting_ticket: Option<String>,
}

#[derive(Clone, Debug)]
pub struct TicketService {
    registry: TicketRegistry,
    factory: Arc<TicketFactory>,
    locking: Option<LockingTicketRegistry>,
}

impl TicketService {
    #[must_use]
    pub fn new(registry: TicketRegistry, factory: Arc<TicketFactory>) -> Self {
        Self {
            registry,
            factory,
            locking: None,
        }
    }

    /// Route read-modify-write cycles through `locking`. Its inner registry
    /// should share the store of this service's registry.
    #[must_use]
    pub fn with_locking(mut self, locking: LockingTicketRegistry) -> Self {
        self.locking = Some(locking);
        self
    }

    #[must_use]
    pub fn registry(&self) -> &TicketRegistry {
        &self.registry
    }

    #[must_use]
    pub fn factory(&self) -> &TicketFactory {
        &self.factory
    }

    /// Start an SSO session.
    ///
    /// # Errors
    ///
    /// Propagates id generation and registry failures.
    pub async fn create_ticket_granting_ticket(&self, authentication: Authentication) -> Result<Ticket> {
        let ticket = self.factory.create_ticket_granting_ticket(authentication)?;
        self.registry.add_ticket(&ticket).await?;
        info!(
            ticket_id = ticket.id(),
            principal = ticket.authentication().map(Authentication::principal),
            "ticket-granting ticket created"
        );
        Ok(ticket)
    }

    /// Grant an ST for `service` from the session `tgt_id`. Counts as a use
    /// of the TGT, which refreshes its idle timeout.
    ///
    /// # Errors
    ///
    /// `NotFound` when the session is gone, `Creation` when the session's
    /// authentication does not satisfy the service.
    pub async fn grant_service_ticket(
        &self,
        tgt_id: &str,
        service: &Service,
        credentials_provided: bool,
    ) -> Result<Ticket> {
        let factory = &self.factory;
        let clock = self.registry.clock();
        let (_, service_ticket) = self
            .modify(tgt_id, TicketKind::TicketGranting, |ticket| {
                let tgt = ticket
                    .as_ticket_granting()
                    .ok_or_else(|| unexpected(ticket, TicketKind::TicketGranting))?;
                let service_ticket =
                    factory.create_service_ticket(tgt, service.clone(), credentials_provided)?;
                ticket.record_use(clock.now())?;
                if let Some(tgt) = ticket.as_ticket_granting_mut() {
                    tgt.record_service(service_ticket.id(), service.clone());
                }
                Ok(service_ticket)
            })
            .await?;

        self.registry.add_ticket(&service_ticket).await?;
        debug!(
            ticket_id = service_ticket.id(),
            parent = tgt_id,
            service = service.id(),
            "service ticket granted"
        );
        Ok(service_ticket)
    }

    /// Validate an ST or PT presented by `service`, optionally delivering a
    /// PGT to `proxy_callback`. A ticket presented by the wrong service is
    /// destroyed. A ticket whose policy is exhausted by this use is removed.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown, expired or already consumed tickets and for
    /// tickets whose session is gone. `ServiceMismatch`, `Throttled`, and
    /// `Creation` when the PGT cannot be issued.
    pub async fn validate_service_ticket(
        &self,
        ticket_id: &str,
        service: &Service,
        proxy_callback: Option<&Service>,
    ) -> Result<Validation> {
        let kind = consumable_kind(ticket_id)?;
        let ticket = self.registry.get_ticket(ticket_id, kind).await?;
        self.check_service(&ticket, service).await?;

        let (granted_by, authentication) = match self.root_authentication(&ticket).await {
            Ok(root) => root,
            Err(err) => {
                self.discard(ticket_id).await;
                return Err(err);
            }
        };

        let proxy_granting_ticket = match proxy_callback {
            Some(callback) => Some(
                self.create_proxy_granting_ticket(ticket_id, callback)
                    .await?
                    .id()
                    .to_string(),
            ),
            None => None,
        };

        let clock = self.registry.clock();
        let (consumed, ()) = match self
            .modify(ticket_id, kind, |ticket| {
                if !issued_for(ticket, service) {
                    return Err(mismatch(ticket, service));
                }
                ticket.record_use(clock.now())
            })
            .await
        {
            Err(err @ TicketError::ServiceMismatch { .. }) => {
                self.discard(ticket_id).await;
                return Err(err);
            }
            other => other?,
        };

        if consumed.is_expired(clock.now()) {
            self.registry.delete_ticket(ticket_id).await?;
        }

        let (from_new_login, proxy_chain) = match &consumed {
            Ticket::Service(st) => (st.is_from_new_login(), Vec::new()),
            Ticket::Proxy(pt) => (false, pt.proxy_chain().to_vec()),
            other => return Err(unexpected(other, kind)),
        };
        info!(
            ticket_id,
            service = service.id(),
            principal = authentication.principal(),
            "ticket validated"
        );
        Ok(Validation {
            assertion: Assertion {
                authentication,
                service: service.clone(),
                from_new_login,
                proxy_chain,
                granted_by,
            },
            proxy_granting_ticket,
        })
    }

    /// Issue a PGT from the ST or PT `ticket_id` for `callback`. The PGT
    /// hangs off the session root so logging out removes it, and a ticket
    /// yields at most one PGT. Does not count as a use of `ticket_id`.
    ///
    /// # Errors
    ///
    /// `NotFound` when the ticket or its root is gone,
    /// `Creation(ProxyAlreadyGranted)` on a second request.
    pub async fn create_proxy_granting_ticket(&self, ticket_id: &str, callback: &Service) -> Result<Ticket> {
        let kind = consumable_kind(ticket_id)?;
        let ticket = self.registry.get_ticket(ticket_id, kind).await?;
        let (root, authentication) = self.root_authentication(&ticket).await?;

        let factory = &self.factory;
        let (_, pgt) = self
            .modify(ticket_id, kind, |ticket| {
                let pgt = factory.create_proxy_granting_ticket(
                    ticket,
                    callback.clone(),
                    authentication.clone(),
                )?;
                match ticket {
                    Ticket::Service(st) => st.mark_proxy_granted(),
                    Ticket::Proxy(pt) => pt.mark_proxy_granted(),
                    other => return Err(unexpected(other, kind)),
                }
                Ok(pgt)
            })
            .await?;
        self.registry.add_ticket(&pgt).await?;

        if TicketKind::from_id(&root) == Some(TicketKind::TicketGranting) {
            let recorded = self
                .modify(&root, TicketKind::TicketGranting, |ticket| {
                    if let Some(tgt) = ticket.as_ticket_granting_mut() {
                        tgt.record_proxy_granting_ticket(pgt.id());
                    }
                    Ok(())
                })
                .await;
            if let Err(err) = recorded {
                // The session went away while the PGT was being stored.
                self.discard(pgt.id()).await;
                return Err(err);
            }
        }

        info!(
            ticket_id = pgt.id(),
            parent = root.as_str(),
            callback = callback.id(),
            "proxy-granting ticket created"
        );
        Ok(pgt)
    }

    /// Grant a PT for `service` from `pgt_id`.
    ///
    /// # Errors
    ///
    /// `NotFound` when the PGT is gone, `Creation` when its authentication
    /// does not satisfy the service.
    pub async fn grant_proxy_ticket(&self, pgt_id: &str, service: &Service) -> Result<Ticket> {
        let pgt = self
            .registry
            .get_ticket(pgt_id, TicketKind::ProxyGranting)
            .await?;
        self.require_session(&pgt).await?;

        let factory = &self.factory;
        let clock = self.registry.clock();
        let (_, proxy_ticket) = self
            .modify(pgt_id, TicketKind::ProxyGranting, |ticket| {
                let pgt = ticket
                    .as_proxy_granting()
                    .ok_or_else(|| unexpected(ticket, TicketKind::ProxyGranting))?;
                let proxy_ticket = factory.create_proxy_ticket(pgt, service.clone())?;
                ticket.record_use(clock.now())?;
                if let Some(pgt) = ticket.as_proxy_granting_mut() {
                    pgt.record_proxy_ticket(proxy_ticket.id(), service.clone());
                }
                Ok(proxy_ticket)
            })
            .await?;

        self.registry.add_ticket(&proxy_ticket).await?;
        debug!(
            ticket_id = proxy_ticket.id(),
            parent = pgt_id,
            service = service.id(),
            "proxy ticket granted"
        );
        Ok(proxy_ticket)
    }

    /// End the SSO session `tgt_id` and everything granted under it. Returns
    /// the services that received tickets from the session, for single
    /// logout notifications. An unknown or expired session yields an empty
    /// list.
    ///
    /// # Errors
    ///
    /// Registry failures only.
    pub async fn destroy_ticket_granting_ticket(&self, tgt_id: &str) -> Result<Vec<Service>> {
        let ticket = match self.registry.get_ticket(tgt_id, TicketKind::TicketGranting).await {
            Ok(ticket) => ticket,
            Err(TicketError::NotFound(_)) => {
                // Expired sessions still leave children behind.
                self.registry.delete_ticket(tgt_id).await?;
                return Ok(Vec::new());
            }
            Err(err) => return Err(err),
        };

        let mut services = Vec::new();
        if let Some(tgt) = ticket.as_ticket_granting() {
            services.extend(tgt.services().values().cloned());
            for pgt_id in tgt.proxy_granting_tickets() {
                if let Ok(pgt) = self.registry.get_ticket(pgt_id, TicketKind::ProxyGranting).await
                    && let Some(pgt) = pgt.as_proxy_granting()
                {
                    services.extend(pgt.proxy_tickets().values().cloned());
                }
            }
        }
        services.sort();
        services.dedup();

        self.registry.delete_ticket(tgt_id).await?;
        info!(
            ticket_id = tgt_id,
            services = services.len(),
            "ticket-granting ticket destroyed"
        );
        Ok(services)
    }

    /// # Errors
    ///
    /// Propagates id generation and registry failures.
    pub async fn create_transient_ticket(
        &self,
        service: Option<Service>,
        properties: BTreeMap<String, serde_json::Value>,
    ) -> Result<Ticket> {
        let ticket = self
            .factory
            .create_transient_session_ticket(service, properties)?;
        self.registry.add_ticket(&ticket).await?;
        debug!(ticket_id = ticket.id(), "transient session ticket created");
        Ok(ticket)
    }

    /// Fetch and remove a transient ticket. Only one caller can consume it.
    ///
    /// # Errors
    ///
    /// `NotFound` when absent, expired or consumed by someone else.
    pub async fn consume_transient_ticket(&self, ticket_id: &str) -> Result<Ticket> {
        let ticket = self
            .registry
            .get_ticket(ticket_id, TicketKind::TransientSession)
            .await?;
        if !self.registry.delete_ticket(ticket_id).await? {
            return Err(TicketError::NotFound(ticket_id.to_string()));
        }
        Ok(ticket)
    }

    async fn modify<T, F>(&self, id: &str, kind: TicketKind, mut mutate: F) -> Result<(Ticket, T)>
    where
        F: FnMut(&mut Ticket) -> Result<T> + Send,
        T: Send,
    {
        let mut attempt = 1;
        loop {
            let result = match &self.locking {
                Some(locking) => locking.with_lock(id, kind, &mut mutate).await,
                None => self.registry.update_with(id, kind, &mut mutate).await,
            };
            match result {
                Err(err) if err.is_retryable() && attempt < CONTENTION_RETRIES => {
                    debug!(ticket_id = id, attempt, "ticket contended, retrying use-case step");
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn check_service(&self, ticket: &Ticket, service: &Service) -> Result<()> {
        if issued_for(ticket, service) {
            return Ok(());
        }
        warn!(
            ticket_id = ticket.id(),
            presented = service.id(),
            issued = ticket.service().map(Service::id),
            "ticket presented by another service"
        );
        self.discard(ticket.id()).await;
        Err(mismatch(ticket, service))
    }

    /// Session root of an ST or PT and the authentication it carries.
    async fn root_authentication(&self, ticket: &Ticket) -> Result<(String, Authentication)> {
        let (root_id, root_kind) = match ticket {
            Ticket::Service(st) => (st.ticket_granting_ticket(), TicketKind::TicketGranting),
            Ticket::Proxy(pt) => (pt.proxy_granting_ticket(), TicketKind::ProxyGranting),
            other => return Err(unexpected(other, TicketKind::Service)),
        };
        let root = self.registry.get_ticket(root_id, root_kind).await?;
        if root_kind == TicketKind::ProxyGranting {
            self.require_session(&root).await?;
        }
        let authentication = root
            .authentication()
            .cloned()
            .ok_or_else(|| TicketError::NotFound(root_id.to_string()))?;
        Ok((root_id.to_string(), authentication))
    }

    /// A PGT lives only as long as the session above it. Walks the PGT
    /// chain up to its TGT; a broken chain discards `pgt` and reports it
    /// missing.
    async fn require_session(&self, pgt: &Ticket) -> Result<()> {
        let mut parent = pgt.parent_id().map(str::to_string);
        for _ in 0..MAX_CASCADE_DEPTH {
            let Some(id) = parent.take() else { break };
            let kind = match TicketKind::from_id(&id) {
                Some(kind @ (TicketKind::TicketGranting | TicketKind::ProxyGranting)) => kind,
                _ => break,
            };
            match self.registry.get_ticket(&id, kind).await {
                Ok(_) if kind == TicketKind::TicketGranting => return Ok(()),
                Ok(ancestor) => parent = ancestor.parent_id().map(str::to_string),
                Err(TicketError::NotFound(_)) => break,
                Err(err) => return Err(err),
            }
        }

        debug!(ticket_id = pgt.id(), "proxy-granting ticket outlived its session");
        self.discard(pgt.id()).await;
        Err(TicketError::NotFound(pgt.id().to_string()))
    }

    async fn discard(&self, id: &str) {
        if let Err(err) = self.registry.delete_ticket(id).await {
            warn!(ticket_id = id, "failed to delete rejected ticket: {err}");
        }
    }
}

fn consumable_kind(id: &str) -> Result<TicketKind> {
    match TicketKind::from_id(id) {
        Some(kind @ (TicketKind::Service | TicketKind::Proxy)) => Ok(kind),
        Some(actual) => Err(TicketError::UnexpectedKind {
            id: id.to_string(),
            expected: TicketKind::Service,
            actual,
        }),
        None => Err(TicketError::NotFound(id.to_string())),
    }
}

fn issued_for(ticket: &Ticket, service: &Service) -> bool {
    ticket.service().is_some_and(|issued| issued.matches(service))
}

fn mismatch(ticket: &Ticket, service: &Service) -> TicketError {
    TicketError::ServiceMismatch {
        id: ticket.id().to_string(),
        service: service.id().to_string(),
    }
}

fn unexpected(ticket: &Ticket, expected: TicketKind) -> TicketError {
    TicketError::UnexpectedKind {
        id: ticket.id().to_string(),
        expected,
        actual: ticket.kind(),
    }
}
