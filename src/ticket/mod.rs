//! Ticket data model.
//!
//! A [`Ticket`] is a closed set of kinds. Common bookkeeping lives in
//! [`TicketState`]; kind specific fields live in the variant structs. Tickets
//! serialize to self-describing JSON (tagged by `kind`) so every storage backend
//! can persist them without a side table of types.

pub mod authentication;
pub mod duration;
pub mod factory;
pub mod id;
pub mod policy;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, TicketError};

pub use authentication::{Authentication, Service};
pub use factory::{AuthenticationRequirement, RequiredAttribute, TicketFactory};
pub use id::TicketIdGenerator;
pub use policy::{ExpirationPolicy, PolicySet};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketKind {
    TicketGranting,
    Service,
    ProxyGranting,
    Proxy,
    TransientSession,
}

impl TicketKind {
    pub const ALL: [Self; 5] = [
        Self::TicketGranting,
        Self::Service,
        Self::ProxyGranting,
        Self::Proxy,
        Self::TransientSession,
    ];

    /// Id prefix for tickets of this kind.
    #[must_use]
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::TicketGranting => "TGT",
            Self::Service => "ST",
            Self::ProxyGranting => "PGT",
            Self::Proxy => "PT",
            Self::TransientSession => "TST",
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TicketGranting => "ticket_granting",
            Self::Service => "service",
            Self::ProxyGranting => "proxy_granting",
            Self::Proxy => "proxy",
            Self::TransientSession => "transient_session",
        }
    }

    /// Kind encoded in a ticket id, if the prefix is known.
    #[must_use]
    pub fn from_id(id: &str) -> Option<Self> {
        let prefix = id.split_once('-').map_or(id, |(prefix, _)| prefix);
        Self::ALL.into_iter().find(|kind| kind.prefix() == prefix)
    }

    /// TGTs and PGTs carry an authentication and can mint children.
    #[must_use]
    pub const fn is_root(self) -> bool {
        matches!(self, Self::TicketGranting | Self::ProxyGranting)
    }
}

impl fmt::Display for TicketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

impl FromStr for TicketKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s || kind.prefix() == s)
            .ok_or_else(|| format!("unknown ticket kind: {s}"))
    }
}

/// Bookkeeping shared by every ticket kind.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketState {
    id: String,
    created_at: DateTime<Utc>,
    last_used_at: DateTime<Utc>,
    #[serde(default)]
    previous_used_at: Option<DateTime<Utc>>,
    #[serde(default)]
    count_of_uses: u32,
    expiration_policy: ExpirationPolicy,
    #[serde(default)]
    revoked: bool,
    #[serde(default)]
    version: u64,
}

impl TicketState {
    #[must_use]
    pub fn new(id: impl Into<String>, policy: ExpirationPolicy, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            created_at,
            last_used_at: created_at,
            previous_used_at: None,
            count_of_uses: 0,
            expiration_policy: policy,
            revoked: false,
            version: 0,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub fn last_used_at(&self) -> DateTime<Utc> {
        self.last_used_at
    }

    #[must_use]
    pub fn previous_used_at(&self) -> Option<DateTime<Utc>> {
        self.previous_used_at
    }

    #[must_use]
    pub fn count_of_uses(&self) -> u32 {
        self.count_of_uses
    }

    #[must_use]
    pub fn expiration_policy(&self) -> &ExpirationPolicy {
        &self.expiration_policy
    }

    #[must_use]
    pub fn is_revoked(&self) -> bool {
        self.revoked
    }

    /// Version of the stored copy this value was read from.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    pub(crate) fn touch(&mut self, now: DateTime<Utc>) {
        self.previous_used_at = Some(self.last_used_at);
        self.last_used_at = now;
        self.count_of_uses = self.count_of_uses.saturating_add(1);
    }

    pub(crate) fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketGrantingTicket {
    state: TicketState,
    authentication: Authentication,
    /// PGT through which this session was established, if any.
    #[serde(default)]
    proxied_by: Option<String>,
    /// Service tickets issued from this TGT, by id.
    #[serde(default)]
    services: BTreeMap<String, Service>,
    #[serde(default)]
    proxy_granting_tickets: BTreeSet<String>,
}

impl TicketGrantingTicket {
    #[must_use]
    pub fn new(state: TicketState, authentication: Authentication) -> Self {
        Self {
            state,
            authentication,
            proxied_by: None,
            services: BTreeMap::new(),
            proxy_granting_tickets: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn with_proxied_by(mut self, proxy_granting_ticket: impl Into<String>) -> Self {
        self.proxied_by = Some(proxy_granting_ticket.into());
        self
    }

    #[must_use]
    pub fn authentication(&self) -> &Authentication {
        &self.authentication
    }

    #[must_use]
    pub fn proxied_by(&self) -> Option<&str> {
        self.proxied_by.as_deref()
    }

    #[must_use]
    pub fn services(&self) -> &BTreeMap<String, Service> {
        &self.services
    }

    #[must_use]
    pub fn proxy_granting_tickets(&self) -> &BTreeSet<String> {
        &self.proxy_granting_tickets
    }

    pub fn record_service(&mut self, service_ticket_id: impl Into<String>, service: Service) {
        self.services.insert(service_ticket_id.into(), service);
    }

    pub fn record_proxy_granting_ticket(&mut self, id: impl Into<String>) {
        self.proxy_granting_tickets.insert(id.into());
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceTicket {
    state: TicketState,
    ticket_granting_ticket: String,
    service: Service,
    from_new_login: bool,
    #[serde(default)]
    proxy_granted: bool,
}

impl ServiceTicket {
    #[must_use]
    pub fn new(
        state: TicketState,
        ticket_granting_ticket: impl Into<String>,
        service: Service,
        from_new_login: bool,
    ) -> Self {
        Self {
            state,
            ticket_granting_ticket: ticket_granting_ticket.into(),
            service,
            from_new_login,
            proxy_granted: false,
        }
    }

    #[must_use]
    pub fn ticket_granting_ticket(&self) -> &str {
        &self.ticket_granting_ticket
    }

    #[must_use]
    pub fn service(&self) -> &Service {
        &self.service
    }

    #[must_use]
    pub fn is_from_new_login(&self) -> bool {
        self.from_new_login
    }

    #[must_use]
    pub fn is_proxy_granted(&self) -> bool {
        self.proxy_granted
    }

    pub fn mark_proxy_granted(&mut self) {
        self.proxy_granted = true;
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyGrantingTicket {
    state: TicketState,
    authentication: Authentication,
    /// Root this PGT hangs off: the session TGT, or the PGT of an outer proxy.
    parent: String,
    /// Callback service the PGT was delivered to.
    proxied_by: Service,
    #[serde(default)]
    proxy_chain: Vec<Service>,
    #[serde(default)]
    proxy_tickets: BTreeMap<String, Service>,
}

impl ProxyGrantingTicket {
    #[must_use]
    pub fn new(
        state: TicketState,
        authentication: Authentication,
        parent: impl Into<String>,
        proxied_by: Service,
        proxy_chain: Vec<Service>,
    ) -> Self {
        Self {
            state,
            authentication,
            parent: parent.into(),
            proxied_by,
            proxy_chain,
            proxy_tickets: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn authentication(&self) -> &Authentication {
        &self.authentication
    }

    #[must_use]
    pub fn parent(&self) -> &str {
        &self.parent
    }

    #[must_use]
    pub fn proxied_by(&self) -> &Service {
        &self.proxied_by
    }

    /// Services the user's identity has been proxied through, newest first.
    #[must_use]
    pub fn proxy_chain(&self) -> &[Service] {
        &self.proxy_chain
    }

    #[must_use]
    pub fn proxy_tickets(&self) -> &BTreeMap<String, Service> {
        &self.proxy_tickets
    }

    pub fn record_proxy_ticket(&mut self, proxy_ticket_id: impl Into<String>, service: Service) {
        self.proxy_tickets.insert(proxy_ticket_id.into(), service);
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyTicket {
    state: TicketState,
    proxy_granting_ticket: String,
    service: Service,
    #[serde(default)]
    proxy_chain: Vec<Service>,
    #[serde(default)]
    proxy_granted: bool,
}

impl ProxyTicket {
    #[must_use]
    pub fn new(
        state: TicketState,
        proxy_granting_ticket: impl Into<String>,
        service: Service,
        proxy_chain: Vec<Service>,
    ) -> Self {
        Self {
            state,
            proxy_granting_ticket: proxy_granting_ticket.into(),
            service,
            proxy_chain,
            proxy_granted: false,
        }
    }

    #[must_use]
    pub fn proxy_granting_ticket(&self) -> &str {
        &self.proxy_granting_ticket
    }

    #[must_use]
    pub fn service(&self) -> &Service {
        &self.service
    }

    #[must_use]
    pub fn proxy_chain(&self) -> &[Service] {
        &self.proxy_chain
    }

    #[must_use]
    pub fn is_proxy_granted(&self) -> bool {
        self.proxy_granted
    }

    pub fn mark_proxy_granted(&mut self) {
        self.proxy_granted = true;
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransientSessionTicket {
    state: TicketState,
    #[serde(default)]
    service: Option<Service>,
    #[serde(default)]
    properties: BTreeMap<String, serde_json::Value>,
}

impl TransientSessionTicket {
    #[must_use]
    pub fn new(
        state: TicketState,
        service: Option<Service>,
        properties: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            state,
            service,
            properties,
        }
    }

    #[must_use]
    pub fn service(&self) -> Option<&Service> {
        self.service.as_ref()
    }

    #[must_use]
    pub fn properties(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.properties
    }

    #[must_use]
    pub fn property(&self, name: &str) -> Option<&serde_json::Value> {
        self.properties.get(name)
    }
}

/// A ticket as an encrypting registry hands it to storage. The id and the
/// parent link are digests and the payload is the sealed ticket; only the
/// columns stores index on stay readable.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedTicket {
    state: TicketState,
    sealed_kind: TicketKind,
    #[serde(default)]
    parent: Option<String>,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
    payload: String,
}

impl EncodedTicket {
    /// Wrap `payload`, the sealed form of `ticket`, under the digests `id`
    /// and `parent`. Use count and version are carried over so stores can
    /// still compare-and-swap.
    #[must_use]
    pub fn seal(ticket: &Ticket, id: String, parent: Option<String>, payload: String) -> Self {
        let source = ticket.state();
        let mut state = TicketState::new(id, ExpirationPolicy::NeverExpires, source.created_at);
        state.count_of_uses = source.count_of_uses;
        state.version = source.version;
        Self {
            state,
            sealed_kind: ticket.kind(),
            parent,
            expires_at: ticket.expires_at(),
            payload,
        }
    }

    #[must_use]
    pub fn payload(&self) -> &str {
        &self.payload
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Ticket {
    TicketGranting(TicketGrantingTicket),
    Service(ServiceTicket),
    ProxyGranting(ProxyGrantingTicket),
    Proxy(ProxyTicket),
    TransientSession(TransientSessionTicket),
    /// Only ever seen between the registry and its store.
    Encoded(EncodedTicket),
}

macro_rules! accessors {
    ($as:ident, $as_mut:ident, $variant:ident, $ty:ty) => {
        #[must_use]
        pub fn $as(&self) -> Option<&$ty> {
            match self {
                Self::$variant(inner) => Some(inner),
                _ => None,
            }
        }

        pub fn $as_mut(&mut self) -> Option<&mut $ty> {
            match self {
                Self::$variant(inner) => Some(inner),
                _ => None,
            }
        }
    };
}

impl Ticket {
    accessors!(as_ticket_granting, as_ticket_granting_mut, TicketGranting, TicketGrantingTicket);
    accessors!(as_service, as_service_mut, Service, ServiceTicket);
    accessors!(as_proxy_granting, as_proxy_granting_mut, ProxyGranting, ProxyGrantingTicket);
    accessors!(as_proxy, as_proxy_mut, Proxy, ProxyTicket);
    accessors!(as_transient_session, as_transient_session_mut, TransientSession, TransientSessionTicket);
    accessors!(as_encoded, as_encoded_mut, Encoded, EncodedTicket);

    #[must_use]
    pub fn kind(&self) -> TicketKind {
        match self {
            Self::TicketGranting(_) => TicketKind::TicketGranting,
            Self::Service(_) => TicketKind::Service,
            Self::ProxyGranting(_) => TicketKind::ProxyGranting,
            Self::Proxy(_) => TicketKind::Proxy,
            Self::TransientSession(_) => TicketKind::TransientSession,
            Self::Encoded(t) => t.sealed_kind,
        }
    }

    #[must_use]
    pub fn state(&self) -> &TicketState {
        match self {
            Self::TicketGranting(t) => &t.state,
            Self::Service(t) => &t.state,
            Self::ProxyGranting(t) => &t.state,
            Self::Proxy(t) => &t.state,
            Self::TransientSession(t) => &t.state,
            Self::Encoded(t) => &t.state,
        }
    }

    pub(crate) fn state_mut(&mut self) -> &mut TicketState {
        match self {
            Self::TicketGranting(t) => &mut t.state,
            Self::Service(t) => &mut t.state,
            Self::ProxyGranting(t) => &mut t.state,
            Self::Proxy(t) => &mut t.state,
            Self::TransientSession(t) => &mut t.state,
            Self::Encoded(t) => &mut t.state,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        self.state().id()
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.state().created_at()
    }

    #[must_use]
    pub fn count_of_uses(&self) -> u32 {
        self.state().count_of_uses()
    }

    #[must_use]
    pub fn expiration_policy(&self) -> &ExpirationPolicy {
        self.state().expiration_policy()
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.state().version()
    }

    /// Authentication carried by root tickets.
    #[must_use]
    pub fn authentication(&self) -> Option<&Authentication> {
        match self {
            Self::TicketGranting(t) => Some(&t.authentication),
            Self::ProxyGranting(t) => Some(&t.authentication),
            _ => None,
        }
    }

    /// Ticket whose deletion must cascade to this one.
    #[must_use]
    pub fn parent_id(&self) -> Option<&str> {
        match self {
            Self::Service(t) => Some(&t.ticket_granting_ticket),
            Self::ProxyGranting(t) => Some(&t.parent),
            Self::Proxy(t) => Some(&t.proxy_granting_ticket),
            Self::Encoded(t) => t.parent.as_deref(),
            Self::TicketGranting(_) | Self::TransientSession(_) => None,
        }
    }

    /// Service the ticket was issued for, where applicable.
    #[must_use]
    pub fn service(&self) -> Option<&Service> {
        match self {
            Self::Service(t) => Some(&t.service),
            Self::Proxy(t) => Some(&t.service),
            Self::TransientSession(t) => t.service.as_ref(),
            Self::TicketGranting(_) | Self::ProxyGranting(_) | Self::Encoded(_) => None,
        }
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let state = self.state();
        state.revoked || state.expiration_policy.evaluate(state, self.authentication(), now)
    }

    /// See [`ExpirationPolicy::deadline`].
    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Encoded(t) => t.expires_at,
            _ => self.expiration_policy().deadline(self),
        }
    }

    /// Mark a use: shifts `last_used_at` into `previous_used_at` and bumps
    /// the use count.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the ticket is already expired and `Throttled`
    /// when the policy refuses a use this soon after the previous one. The
    /// ticket is left untouched in both cases.
    pub fn record_use(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.is_expired(now) {
            return Err(TicketError::NotFound(self.id().to_string()));
        }
        let state = self.state();
        if let Some(retry_after) = state
            .expiration_policy
            .throttle(state, self.authentication(), now)
        {
            return Err(TicketError::Throttled {
                id: self.id().to_string(),
                retry_after,
            });
        }
        self.state_mut().touch(now);
        Ok(())
    }

    /// Latch the ticket into the expired state regardless of its policy.
    pub fn revoke(&mut self) {
        self.state_mut().revoked = true;
    }
}
