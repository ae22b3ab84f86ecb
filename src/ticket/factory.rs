//! Ticket factory: mints tickets with fresh ids and the configured policies.
//!
//! The factory never touches the registry. Callers persist the new ticket and
//! update the parent's bookkeeping themselves.

use regex::Regex;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::debug;

use super::{
    Authentication, PolicySet, ProxyGrantingTicket, ProxyTicket, Service, ServiceTicket, Ticket,
    TicketGrantingTicket, TicketIdGenerator, TicketKind, TicketState, TransientSessionTicket,
};
use crate::clock::Clock;
use crate::error::{CreationError, Result};

/// Gate on issuing service tickets for a given authentication.
pub trait AuthenticationRequirement: Send + Sync + Debug {
    /// `Err(reason)` refuses the grant.
    ///
    /// # Errors
    ///
    /// Returns a human readable reason when the authentication is not enough.
    fn check(&self, authentication: &Authentication, service: &Service) -> Result<(), String>;
}

/// Requires an attribute value matching a pattern, optionally only for
/// services matching another pattern.
#[derive(Debug, Clone)]
pub struct RequiredAttribute {
    name: String,
    value_pattern: Regex,
    service_pattern: Option<Regex>,
}

impl RequiredAttribute {
    /// # Errors
    ///
    /// Returns an error if `value_pattern` is not a valid regex.
    pub fn new(name: impl Into<String>, value_pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            name: name.into(),
            value_pattern: Regex::new(value_pattern)?,
            service_pattern: None,
        })
    }

    /// # Errors
    ///
    /// Returns an error if `pattern` is not a valid regex.
    pub fn with_service_pattern(mut self, pattern: &str) -> Result<Self, regex::Error> {
        self.service_pattern = Some(Regex::new(pattern)?);
        Ok(self)
    }
}

impl AuthenticationRequirement for RequiredAttribute {
    fn check(&self, authentication: &Authentication, service: &Service) -> Result<(), String> {
        if let Some(pattern) = &self.service_pattern
            && !pattern.is_match(service.id())
        {
            return Ok(());
        }
        let satisfied = authentication
            .attribute(&self.name)
            .is_some_and(|values| values.iter().any(|v| self.value_pattern.is_match(v)));
        if satisfied {
            Ok(())
        } else {
            Err(format!(
                "attribute {} does not match {}",
                self.name,
                self.value_pattern.as_str()
            ))
        }
    }
}

#[derive(Debug)]
pub struct TicketFactory {
    ids: TicketIdGenerator,
    policies: PolicySet,
    requirements: Vec<Arc<dyn AuthenticationRequirement>>,
    clock: Arc<dyn Clock>,
}

impl TicketFactory {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            ids: TicketIdGenerator::default(),
            policies: PolicySet::default(),
            requirements: Vec::new(),
            clock,
        }
    }

    #[must_use]
    pub fn with_id_generator(mut self, ids: TicketIdGenerator) -> Self {
        self.ids = ids;
        self
    }

    #[must_use]
    pub fn with_policies(mut self, policies: PolicySet) -> Self {
        self.policies = policies;
        self
    }

    #[must_use]
    pub fn with_requirement(mut self, requirement: Arc<dyn AuthenticationRequirement>) -> Self {
        self.requirements.push(requirement);
        self
    }

    #[must_use]
    pub fn policies(&self) -> &PolicySet {
        &self.policies
    }

    fn state(&self, kind: TicketKind) -> Result<TicketState> {
        let id = self.ids.generate(kind)?;
        Ok(TicketState::new(
            id,
            self.policies.for_kind(kind).clone(),
            self.clock.now(),
        ))
    }

    fn check_requirements(&self, authentication: &Authentication, service: &Service) -> Result<()> {
        for requirement in &self.requirements {
            if let Err(reason) = requirement.check(authentication, service) {
                debug!(
                    principal = authentication.principal(),
                    service = service.id(),
                    "authentication requirement not met: {reason}"
                );
                return Err(CreationError::UnsatisfiedAuthenticationPolicy {
                    service: service.id().to_string(),
                    reason,
                }
                .into());
            }
        }
        Ok(())
    }

    /// Mint a ticket of whatever kind the context calls for:
    ///
    /// | parent | service | authentication | result |
    /// |--------|---------|----------------|--------|
    /// | none   | none    | some           | TGT    |
    /// | none   | any     | none           | TST    |
    /// | TGT    | some    | -              | ST     |
    /// | ST/PT  | some    | some           | PGT    |
    /// | PGT    | some    | -              | PT     |
    ///
    /// # Errors
    ///
    /// Returns `CreationError::InvalidContext` for any other combination and
    /// propagates the errors of the specific constructors.
    pub fn create(
        &self,
        parent: Option<&Ticket>,
        service: Option<&Service>,
        authentication: Option<&Authentication>,
    ) -> Result<Ticket> {
        match (parent, service, authentication) {
            (None, None, Some(authentication)) => {
                self.create_ticket_granting_ticket(authentication.clone())
            }
            (None, service, None) => {
                self.create_transient_session_ticket(service.cloned(), BTreeMap::new())
            }
            (Some(Ticket::TicketGranting(tgt)), Some(service), _) => {
                self.create_service_ticket(tgt, service.clone(), false)
            }
            (Some(parent), Some(service), Some(auth))
                if matches!(parent.kind(), TicketKind::Service | TicketKind::Proxy) =>
            {
                self.create_proxy_granting_ticket(parent, service.clone(), auth.clone())
            }
            (Some(Ticket::ProxyGranting(pgt)), Some(service), _) => {
                self.create_proxy_ticket(pgt, service.clone())
            }
            _ => Err(CreationError::InvalidContext {
                parent: parent.map(Ticket::kind),
                service: service.map(|s| s.id().to_string()),
            }
            .into()),
        }
    }

    /// # Errors
    ///
    /// Fails only when id generation fails.
    pub fn create_ticket_granting_ticket(&self, authentication: Authentication) -> Result<Ticket> {
        let state = self.state(TicketKind::TicketGranting)?;
        Ok(Ticket::TicketGranting(TicketGrantingTicket::new(
            state,
            authentication,
        )))
    }

    /// A ticket is from a new login when credentials were just presented or
    /// the TGT has never been used to grant anything.
    ///
    /// # Errors
    ///
    /// Fails when an [`AuthenticationRequirement`] refuses the grant.
    pub fn create_service_ticket(
        &self,
        tgt: &TicketGrantingTicket,
        service: Service,
        credentials_provided: bool,
    ) -> Result<Ticket> {
        self.check_requirements(tgt.authentication(), &service)?;
        let from_new_login = credentials_provided || tgt.state.count_of_uses() == 0;
        let state = self.state(TicketKind::Service)?;
        Ok(Ticket::Service(ServiceTicket::new(
            state,
            tgt.state.id(),
            service,
            from_new_login,
        )))
    }

    /// PGTs hang off the session root. For a PT the root is the PGT it was
    /// minted from, which extends the proxy chain.
    ///
    /// # Errors
    ///
    /// Fails on a parent that is neither ST nor PT, or that already produced
    /// a PGT.
    pub fn create_proxy_granting_ticket(
        &self,
        parent: &Ticket,
        callback: Service,
        authentication: Authentication,
    ) -> Result<Ticket> {
        let (root, mut chain, already_granted) = match parent {
            Ticket::Service(st) => (
                st.ticket_granting_ticket().to_string(),
                Vec::new(),
                st.is_proxy_granted(),
            ),
            Ticket::Proxy(pt) => (
                pt.proxy_granting_ticket().to_string(),
                pt.proxy_chain().to_vec(),
                pt.is_proxy_granted(),
            ),
            other => {
                return Err(CreationError::InvalidContext {
                    parent: Some(other.kind()),
                    service: Some(callback.id().to_string()),
                }
                .into());
            }
        };
        if already_granted {
            return Err(CreationError::ProxyAlreadyGranted(parent.id().to_string()).into());
        }
        chain.insert(0, callback.clone());
        let state = self.state(TicketKind::ProxyGranting)?;
        Ok(Ticket::ProxyGranting(ProxyGrantingTicket::new(
            state,
            authentication,
            root,
            callback,
            chain,
        )))
    }

    /// # Errors
    ///
    /// Fails when an [`AuthenticationRequirement`] refuses the grant.
    pub fn create_proxy_ticket(&self, pgt: &ProxyGrantingTicket, service: Service) -> Result<Ticket> {
        self.check_requirements(pgt.authentication(), &service)?;
        let state = self.state(TicketKind::Proxy)?;
        Ok(Ticket::Proxy(ProxyTicket::new(
            state,
            pgt.state.id(),
            service,
            pgt.proxy_chain().to_vec(),
        )))
    }

    /// # Errors
    ///
    /// Fails only when id generation fails.
    pub fn create_transient_session_ticket(
        &self,
        service: Option<Service>,
        properties: BTreeMap<String, serde_json::Value>,
    ) -> Result<Ticket> {
        let state = self.state(TicketKind::TransientSession)?;
        Ok(Ticket::TransientSession(TransientSessionTicket::new(
            state, service, properties,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::TicketError;
    use crate::ticket::ExpirationPolicy;
    use std::time::Duration;

    fn factory() -> TicketFactory {
        TicketFactory::new(Arc::new(ManualClock::default()))
    }

    fn auth() -> Authentication {
        Authentication::new("casuser", chrono::Utc::now()).with_attribute("memberOf", ["staff"])
    }

    fn app() -> Service {
        Service::new("https://app.example.org")
    }

    #[test]
    fn create_dispatches_on_context() {
        let factory = factory();
        let auth = auth();

        let tgt = factory.create(None, None, Some(&auth));
        assert!(tgt.is_ok());
        let Ok(tgt) = tgt else { return };
        assert_eq!(tgt.kind(), TicketKind::TicketGranting);
        assert!(tgt.id().starts_with("TGT-"));

        let st = factory.create(Some(&tgt), Some(&app()), None);
        assert!(st.is_ok());
        let Ok(st) = st else { return };
        assert_eq!(st.kind(), TicketKind::Service);
        assert_eq!(st.parent_id(), Some(tgt.id()));

        let callback = Service::new("https://app.example.org/pgtCallback");
        let pgt = factory.create(Some(&st), Some(&callback), Some(&auth));
        assert!(pgt.is_ok());
        let Ok(pgt) = pgt else { return };
        assert_eq!(pgt.kind(), TicketKind::ProxyGranting);
        assert_eq!(pgt.parent_id(), Some(tgt.id()));

        let backend = Service::new("https://backend.example.org");
        let pt = factory.create(Some(&pgt), Some(&backend), None);
        assert!(pt.is_ok());
        let Ok(pt) = pt else { return };
        assert_eq!(pt.kind(), TicketKind::Proxy);
        assert_eq!(
            pt.as_proxy().map(ProxyTicket::proxy_chain),
            Some([callback].as_slice())
        );

        let tst = factory.create(None, Some(&app()), None);
        assert!(tst.is_ok_and(|t| t.kind() == TicketKind::TransientSession));
    }

    #[test]
    fn invalid_context_is_rejected() {
        let factory = factory();
        let Ok(tgt) = factory.create_ticket_granting_ticket(auth()) else {
            return;
        };
        let result = factory.create(Some(&tgt), None, None);
        assert!(matches!(
            result,
            Err(TicketError::Creation(CreationError::InvalidContext { .. }))
        ));
    }

    #[test]
    fn new_tickets_take_policy_from_set() {
        let factory = factory().with_policies(
            PolicySet::default().with_service(ExpirationPolicy::multi_use(2, Duration::from_secs(30))),
        );
        let Ok(tgt) = factory.create_ticket_granting_ticket(auth()) else {
            return;
        };
        let Some(inner) = tgt.as_ticket_granting() else {
            return;
        };
        let st = factory.create_service_ticket(inner, app(), false);
        assert!(st.is_ok_and(|st| {
            st.expiration_policy() == &ExpirationPolicy::multi_use(2, Duration::from_secs(30))
                && st.count_of_uses() == 0
        }));
    }

    #[test]
    fn from_new_login_only_for_unused_tgt_or_fresh_credentials() {
        let factory = factory();
        let Ok(mut tgt) = factory.create_ticket_granting_ticket(auth()) else {
            return;
        };
        let from_new_login = |tgt: &Ticket, credentials_provided: bool| {
            tgt.as_ticket_granting()
                .and_then(|t| {
                    factory
                        .create_service_ticket(t, app(), credentials_provided)
                        .ok()
                })
                .and_then(|st| st.as_service().map(ServiceTicket::is_from_new_login))
        };

        assert_eq!(from_new_login(&tgt, false), Some(true));

        assert!(tgt.record_use(chrono::Utc::now()).is_ok());
        assert_eq!(from_new_login(&tgt, false), Some(false));
        assert_eq!(from_new_login(&tgt, true), Some(true));
    }

    #[test]
    fn unmet_requirement_refuses_service_ticket() {
        let requirement = RequiredAttribute::new("memberOf", "^admins$")
            .and_then(|r| r.with_service_pattern("^https://admin\\."));
        assert!(requirement.is_ok());
        let Ok(requirement) = requirement else { return };
        let factory = factory().with_requirement(Arc::new(requirement));
        let Ok(tgt) = factory.create_ticket_granting_ticket(auth()) else {
            return;
        };
        let Some(inner) = tgt.as_ticket_granting() else {
            return;
        };

        let admin = factory.create_service_ticket(inner, Service::new("https://admin.example.org"), false);
        assert!(matches!(
            admin,
            Err(TicketError::Creation(CreationError::UnsatisfiedAuthenticationPolicy { .. }))
        ));

        // Requirement only applies to admin services.
        assert!(factory.create_service_ticket(inner, app(), false).is_ok());
    }

    #[test]
    fn second_pgt_from_same_service_ticket_is_refused() {
        let factory = factory();
        let Ok(tgt) = factory.create_ticket_granting_ticket(auth()) else {
            return;
        };
        let Some(Ok(mut st)) = tgt
            .as_ticket_granting()
            .map(|t| factory.create_service_ticket(t, app(), false))
        else {
            return;
        };
        if let Some(inner) = st.as_service_mut() {
            inner.mark_proxy_granted();
        }
        let result = factory.create_proxy_granting_ticket(&st, app(), auth());
        assert!(matches!(
            result,
            Err(TicketError::Creation(CreationError::ProxyAlreadyGranted(_)))
        ));
    }
}
