//! Expiration policies.
//!
//! A policy is pure data persisted with the ticket it governs. Evaluation takes
//! the ticket's timestamps and use count plus the caller's `now`; it never reads
//! a clock on its own. For a fixed ticket state, once a policy answers
//! "expired" it answers "expired" for every later instant.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::authentication::Authentication;
use super::duration::{iso8601, to_time_delta};
use super::{Ticket, TicketKind, TicketState};

/// Attribute set when the user ticked "remember me".
pub const REMEMBER_ME_ATTRIBUTE: &str = "longTermAuthenticationRequestTokenUsed";

/// Attribute set when the session impersonates another principal.
pub const SURROGATE_ATTRIBUTE: &str = "surrogateEnabled";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExpirationPolicy {
    NeverExpires,
    /// Expires a fixed time after creation.
    Timeout {
        #[serde(with = "iso8601")]
        time_to_live: Duration,
    },
    /// Expires after `number_of_uses` uses or `time_to_kill` since the last
    /// use. While live, a use within `time_in_between_uses` of the previous one
    /// is refused without expiring the ticket.
    ThrottledUseAndTimeout {
        number_of_uses: u32,
        #[serde(with = "iso8601")]
        time_to_kill: Duration,
        #[serde(with = "iso8601")]
        time_in_between_uses: Duration,
    },
    /// Expires after `number_of_uses` uses or `time_to_kill` since the last use.
    MultiTimeUseOrTimeout {
        number_of_uses: u32,
        #[serde(with = "iso8601")]
        time_to_kill: Duration,
    },
    /// Hard session lifetime plus an idle timeout.
    TicketGranting {
        #[serde(with = "iso8601")]
        max_time_to_live: Duration,
        #[serde(with = "iso8601")]
        time_to_kill: Duration,
    },
    /// Picks `remember_me` when the authentication carries
    /// [`REMEMBER_ME_ATTRIBUTE`], otherwise `fallback`.
    RememberMeDelegating {
        remember_me: Box<ExpirationPolicy>,
        fallback: Box<ExpirationPolicy>,
    },
    /// Picks `surrogate` when the authentication carries
    /// [`SURROGATE_ATTRIBUTE`], otherwise `fallback`.
    SurrogateSessionDelegating {
        surrogate: Box<ExpirationPolicy>,
        fallback: Box<ExpirationPolicy>,
    },
}

impl ExpirationPolicy {
    #[must_use]
    pub fn timeout(time_to_live: Duration) -> Self {
        Self::Timeout { time_to_live }
    }

    #[must_use]
    pub fn multi_use(number_of_uses: u32, time_to_kill: Duration) -> Self {
        Self::MultiTimeUseOrTimeout {
            number_of_uses,
            time_to_kill,
        }
    }

    #[must_use]
    pub fn throttled(
        number_of_uses: u32,
        time_to_kill: Duration,
        time_in_between_uses: Duration,
    ) -> Self {
        Self::ThrottledUseAndTimeout {
            number_of_uses,
            time_to_kill,
            time_in_between_uses,
        }
    }

    #[must_use]
    pub fn ticket_granting(max_time_to_live: Duration, time_to_kill: Duration) -> Self {
        Self::TicketGranting {
            max_time_to_live,
            time_to_kill,
        }
    }

    #[must_use]
    pub fn remember_me(remember_me: Self, fallback: Self) -> Self {
        Self::RememberMeDelegating {
            remember_me: Box::new(remember_me),
            fallback: Box::new(fallback),
        }
    }

    #[must_use]
    pub fn surrogate(surrogate: Self, fallback: Self) -> Self {
        Self::SurrogateSessionDelegating {
            surrogate: Box::new(surrogate),
            fallback: Box::new(fallback),
        }
    }

    /// Whether the policy alone considers `ticket` expired at `now`. The
    /// revoked latch is checked by [`Ticket::is_expired`].
    #[must_use]
    pub fn is_expired(&self, ticket: &Ticket, now: DateTime<Utc>) -> bool {
        self.evaluate(ticket.state(), ticket.authentication(), now)
    }

    /// Remaining wait when a use right now would be refused by throttling.
    #[must_use]
    pub fn retry_after(&self, ticket: &Ticket, now: DateTime<Utc>) -> Option<Duration> {
        self.throttle(ticket.state(), ticket.authentication(), now)
    }

    /// Throttling is checked on the consume path only and never counts as
    /// expiration.
    #[must_use]
    pub fn is_throttled(&self, ticket: &Ticket, now: DateTime<Utc>) -> bool {
        self.retry_after(ticket, now).is_some()
    }

    /// Instant from which time alone expires `ticket`, given its current
    /// state. Use counts and revocation can expire it earlier. `None` when
    /// time never expires it.
    #[must_use]
    pub fn deadline(&self, ticket: &Ticket) -> Option<DateTime<Utc>> {
        self.deadline_for(ticket.state(), ticket.authentication())
    }

    fn deadline_for(
        &self,
        state: &TicketState,
        authentication: Option<&Authentication>,
    ) -> Option<DateTime<Utc>> {
        if let Some(policy) = self.delegate(authentication) {
            return policy.deadline_for(state, authentication);
        }
        match self {
            Self::NeverExpires
            | Self::RememberMeDelegating { .. }
            | Self::SurrogateSessionDelegating { .. } => None,
            Self::Timeout { time_to_live } => Some(state.created_at() + to_time_delta(*time_to_live)),
            Self::ThrottledUseAndTimeout { time_to_kill, .. }
            | Self::MultiTimeUseOrTimeout { time_to_kill, .. } => {
                Some(state.last_used_at() + to_time_delta(*time_to_kill))
            }
            Self::TicketGranting {
                max_time_to_live,
                time_to_kill,
            } => Some(
                (state.created_at() + to_time_delta(*max_time_to_live))
                    .min(state.last_used_at() + to_time_delta(*time_to_kill)),
            ),
        }
    }

    /// Upper bound on the ticket lifetime, `None` when unbounded.
    #[must_use]
    pub fn time_to_live(&self) -> Option<Duration> {
        match self {
            Self::NeverExpires => None,
            Self::Timeout { time_to_live } => Some(*time_to_live),
            Self::ThrottledUseAndTimeout { time_to_kill, .. }
            | Self::MultiTimeUseOrTimeout { time_to_kill, .. } => Some(*time_to_kill),
            Self::TicketGranting {
                max_time_to_live, ..
            } => Some(*max_time_to_live),
            Self::RememberMeDelegating {
                remember_me: a,
                fallback: b,
            }
            | Self::SurrogateSessionDelegating {
                surrogate: a,
                fallback: b,
            } => a.time_to_live().zip(b.time_to_live()).map(|(a, b)| a.max(b)),
        }
    }

    /// Idle timeout, `None` when the policy has none.
    #[must_use]
    pub fn time_to_idle(&self) -> Option<Duration> {
        match self {
            Self::TicketGranting { time_to_kill, .. } => Some(*time_to_kill),
            Self::RememberMeDelegating {
                remember_me: a,
                fallback: b,
            }
            | Self::SurrogateSessionDelegating {
                surrogate: a,
                fallback: b,
            } => a.time_to_idle().zip(b.time_to_idle()).map(|(a, b)| a.max(b)),
            _ => None,
        }
    }

    fn delegate(&self, authentication: Option<&Authentication>) -> Option<&Self> {
        match self {
            Self::RememberMeDelegating {
                remember_me,
                fallback,
            } => Some(
                if authentication.is_some_and(|a| a.is_flag_set(REMEMBER_ME_ATTRIBUTE)) {
                    remember_me
                } else {
                    fallback
                },
            ),
            Self::SurrogateSessionDelegating {
                surrogate,
                fallback,
            } => Some(
                if authentication.is_some_and(|a| a.is_flag_set(SURROGATE_ATTRIBUTE)) {
                    surrogate
                } else {
                    fallback
                },
            ),
            _ => None,
        }
    }

    pub(crate) fn evaluate(
        &self,
        state: &TicketState,
        authentication: Option<&Authentication>,
        now: DateTime<Utc>,
    ) -> bool {
        if let Some(policy) = self.delegate(authentication) {
            return policy.evaluate(state, authentication, now);
        }
        let elapsed_since = |instant: DateTime<Utc>, limit: Duration| {
            now.signed_duration_since(instant) >= to_time_delta(limit)
        };
        match self {
            Self::NeverExpires => false,
            Self::Timeout { time_to_live } => elapsed_since(state.created_at(), *time_to_live),
            Self::ThrottledUseAndTimeout {
                number_of_uses,
                time_to_kill,
                ..
            }
            | Self::MultiTimeUseOrTimeout {
                number_of_uses,
                time_to_kill,
            } => {
                state.count_of_uses() >= *number_of_uses
                    || elapsed_since(state.last_used_at(), *time_to_kill)
            }
            Self::TicketGranting {
                max_time_to_live,
                time_to_kill,
            } => {
                elapsed_since(state.created_at(), *max_time_to_live)
                    || elapsed_since(state.last_used_at(), *time_to_kill)
            }
            Self::RememberMeDelegating { .. } | Self::SurrogateSessionDelegating { .. } => false,
        }
    }

    pub(crate) fn throttle(
        &self,
        state: &TicketState,
        authentication: Option<&Authentication>,
        now: DateTime<Utc>,
    ) -> Option<Duration> {
        if let Some(policy) = self.delegate(authentication) {
            return policy.throttle(state, authentication, now);
        }
        let Self::ThrottledUseAndTimeout {
            time_in_between_uses,
            ..
        } = self
        else {
            return None;
        };
        if state.count_of_uses() == 0 {
            return None;
        }
        let since_last = now
            .signed_duration_since(state.last_used_at())
            .to_std()
            .unwrap_or(Duration::ZERO);
        time_in_between_uses
            .checked_sub(since_last)
            .filter(|remaining| !remaining.is_zero())
    }
}

/// Default policy for every ticket kind, used by the factory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PolicySet {
    ticket_granting: ExpirationPolicy,
    service: ExpirationPolicy,
    proxy_granting: Option<ExpirationPolicy>,
    proxy: ExpirationPolicy,
    transient_session: ExpirationPolicy,
}

pub const DEFAULT_TGT_MAX_TIME_TO_LIVE: Duration = Duration::from_secs(8 * 60 * 60);
pub const DEFAULT_TGT_TIME_TO_KILL: Duration = Duration::from_secs(2 * 60 * 60);
pub const DEFAULT_ST_NUMBER_OF_USES: u32 = 1;
pub const DEFAULT_ST_TIME_TO_KILL: Duration = Duration::from_secs(10);
pub const DEFAULT_PT_NUMBER_OF_USES: u32 = 1;
pub const DEFAULT_PT_TIME_TO_KILL: Duration = Duration::from_secs(10);
pub const DEFAULT_TST_TIME_TO_KILL: Duration = Duration::from_secs(5 * 60);

impl Default for PolicySet {
    fn default() -> Self {
        Self {
            ticket_granting: ExpirationPolicy::ticket_granting(
                DEFAULT_TGT_MAX_TIME_TO_LIVE,
                DEFAULT_TGT_TIME_TO_KILL,
            ),
            service: ExpirationPolicy::multi_use(DEFAULT_ST_NUMBER_OF_USES, DEFAULT_ST_TIME_TO_KILL),
            proxy_granting: None,
            proxy: ExpirationPolicy::multi_use(DEFAULT_PT_NUMBER_OF_USES, DEFAULT_PT_TIME_TO_KILL),
            transient_session: ExpirationPolicy::timeout(DEFAULT_TST_TIME_TO_KILL),
        }
    }
}

impl PolicySet {
    #[must_use]
    pub fn with_ticket_granting(mut self, policy: ExpirationPolicy) -> Self {
        self.ticket_granting = policy;
        self
    }

    #[must_use]
    pub fn with_service(mut self, policy: ExpirationPolicy) -> Self {
        self.service = policy;
        self
    }

    /// Without an explicit policy, PGTs follow the TGT policy.
    #[must_use]
    pub fn with_proxy_granting(mut self, policy: ExpirationPolicy) -> Self {
        self.proxy_granting = Some(policy);
        self
    }

    #[must_use]
    pub fn with_proxy(mut self, policy: ExpirationPolicy) -> Self {
        self.proxy = policy;
        self
    }

    #[must_use]
    pub fn with_transient_session(mut self, policy: ExpirationPolicy) -> Self {
        self.transient_session = policy;
        self
    }

    #[must_use]
    pub fn for_kind(&self, kind: TicketKind) -> &ExpirationPolicy {
        match kind {
            TicketKind::TicketGranting => &self.ticket_granting,
            TicketKind::Service => &self.service,
            TicketKind::ProxyGranting => self
                .proxy_granting
                .as_ref()
                .unwrap_or(&self.ticket_granting),
            TicketKind::Proxy => &self.proxy,
            TicketKind::TransientSession => &self.transient_session,
        }
    }
}
