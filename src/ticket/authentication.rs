use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Outcome of a successful primary authentication, captured in the TGT and
/// copied into every PGT. Opaque to the registry except for the attributes the
/// delegating expiration policies look at.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authentication {
    principal: String,
    #[serde(default)]
    attributes: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    handlers: Vec<String>,
    authenticated_at: DateTime<Utc>,
}

impl Authentication {
    #[must_use]
    pub fn new(principal: impl Into<String>, authenticated_at: DateTime<Utc>) -> Self {
        Self {
            principal: principal.into(),
            attributes: BTreeMap::new(),
            handlers: Vec::new(),
            authenticated_at,
        }
    }

    #[must_use]
    pub fn with_attribute<I, V>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        self.attributes
            .insert(name.into(), values.into_iter().map(Into::into).collect());
        self
    }

    /// Record the name of an authentication handler that succeeded.
    #[must_use]
    pub fn with_handler(mut self, name: impl Into<String>) -> Self {
        self.handlers.push(name.into());
        self
    }

    #[must_use]
    pub fn principal(&self) -> &str {
        &self.principal
    }

    #[must_use]
    pub fn attributes(&self) -> &BTreeMap<String, Vec<String>> {
        &self.attributes
    }

    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&[String]> {
        self.attributes.get(name).map(Vec::as_slice)
    }

    #[must_use]
    pub fn handlers(&self) -> &[String] {
        &self.handlers
    }

    #[must_use]
    pub fn authenticated_at(&self) -> DateTime<Utc> {
        self.authenticated_at
    }

    /// True when any value of `name` reads as boolean `true`.
    #[must_use]
    pub fn is_flag_set(&self, name: &str) -> bool {
        self.attribute(name)
            .is_some_and(|values| values.iter().any(|v| v.trim().eq_ignore_ascii_case("true")))
    }
}

/// Service identifier (normally the service URL) a ticket is issued for.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Service(String);

impl Service {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.0
    }

    /// Services match when their ids are equal, ignoring one trailing slash.
    #[must_use]
    pub fn matches(&self, other: &Self) -> bool {
        fn normalize(id: &str) -> &str {
            id.strip_suffix('/').unwrap_or(id)
        }
        normalize(&self.0) == normalize(&other.0)
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_attribute_is_case_insensitive() {
        let auth = Authentication::new("casuser", Utc::now())
            .with_attribute("rememberMe", ["TRUE"])
            .with_attribute("surrogateEnabled", ["false"]);

        assert!(auth.is_flag_set("rememberMe"));
        assert!(!auth.is_flag_set("surrogateEnabled"));
        assert!(!auth.is_flag_set("missing"));
    }

    #[test]
    fn service_match_ignores_trailing_slash() {
        let a = Service::new("https://app.example.org/");
        let b = Service::new("https://app.example.org");
        let c = Service::new("https://other.example.org");

        assert!(a.matches(&b));
        assert!(b.matches(&a));
        assert!(!a.matches(&c));
    }
}
