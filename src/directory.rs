//! Directory capability used by the resolver.
//!
//! The engine only needs three operations from a directory client: bind,
//! search and close. They are expressed as traits so the resolution logic
//! does not depend on a specific wire implementation.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::config::Error as ConfigError;
use crate::error::Cause;

const SUPPORTED_SCHEMES: [&str; 3] = ["ldap", "ldaps", "ldapi"];

/// What to do with referrals returned by the directory.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ReferralPolicy {
    /// Chase referrals one hop with the same credential.
    #[default]
    Follow,
    /// Drop referrals silently.
    Ignore,
}

/// Immutable connection parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectoryEndpoint {
    url: String,
    referrals: ReferralPolicy,
    connect_timeout: Option<Duration>,
    start_tls: bool,
}

impl DirectoryEndpoint {
    /// Create a new [`DirectoryEndpoint`].
    pub fn new(url: &str) -> Result<Self, ConfigError> {
        let parsed = Url::parse(url)?;
        if !SUPPORTED_SCHEMES.contains(&parsed.scheme()) {
            return Err(ConfigError::Scheme(parsed.scheme().to_owned()));
        }

        Ok(Self {
            url: url.to_owned(),
            referrals: ReferralPolicy::default(),
            connect_timeout: None,
            start_tls: false,
        })
    }

    /// Update referral policy.
    pub fn with_referrals(mut self, referrals: ReferralPolicy) -> Self {
        self.referrals = referrals;
        self
    }

    /// Bound connection establishment.
    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Upgrade plain `ldap://` connections with StartTLS.
    pub fn with_start_tls(mut self, start_tls: bool) -> Self {
        self.start_tls = start_tls;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn referrals(&self) -> ReferralPolicy {
        self.referrals
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }

    pub fn start_tls(&self) -> bool {
        self.start_tls
    }
}

/// Principal and secret used to bind for searches.
#[derive(Clone, PartialEq, Eq)]
pub struct AdminCredential {
    principal: String,
    secret: String,
}

impl AdminCredential {
    pub fn new(principal: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            secret: secret.into(),
        }
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    pub(crate) fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for AdminCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminCredential")
            .field("principal", &self.principal)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// A matching entry, with multi-valued text attributes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DirectoryEntry {
    pub dn: String,
    pub attrs: HashMap<String, Vec<String>>,
}

impl DirectoryEntry {
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attrs: HashMap::new(),
        }
    }

    /// Add values to an attribute.
    pub fn with_attr<I, S>(mut self, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attrs
            .entry(name.to_owned())
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    /// Look an attribute up, ignoring case of its name.
    ///
    /// Servers are free to return `memberof` for a request of `memberOf`.
    pub fn attr(&self, name: &str) -> Option<&[String]> {
        self.attrs
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, values)| values.as_slice())
    }
}

/// Outcome of a bind attempt that did not produce a session.
#[derive(Debug, thiserror::Error)]
pub enum BindFailure {
    /// The directory refused the credential. Retrying cannot help.
    #[error("credentials rejected: {0}")]
    Rejected(String),
    /// Network or protocol failure; a later attempt may succeed.
    #[error(transparent)]
    Transient(Cause),
}

/// A directory client able to open authenticated sessions.
#[async_trait]
pub trait Directory: Send + Sync {
    type Session: DirectorySession;

    /// Open a session bound with simple authentication.
    async fn bind(
        &self,
        endpoint: &DirectoryEndpoint,
        credential: &AdminCredential,
    ) -> Result<Self::Session, BindFailure>;
}

/// An open, authenticated directory session.
#[async_trait]
pub trait DirectorySession: Send {
    /// Subtree search under `base` returning only `attrs`.
    ///
    /// A base that does not exist yields no entries rather than an error.
    async fn search(
        &mut self,
        base: &str,
        filter: &str,
        attrs: &[&str],
    ) -> Result<Vec<DirectoryEntry>, Cause>;

    /// Release the session.
    async fn close(&mut self) -> Result<(), Cause>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_scheme() {
        assert!(DirectoryEndpoint::new("ldap://localhost:389").is_ok());
        assert!(DirectoryEndpoint::new("ldaps://ad.example.com").is_ok());
        assert!(matches!(
            DirectoryEndpoint::new("http://localhost"),
            Err(ConfigError::Scheme(_))
        ));
        assert!(DirectoryEndpoint::new("not a url").is_err());
    }

    #[test]
    fn test_endpoint_defaults() {
        let endpoint = DirectoryEndpoint::new("ldap://localhost").unwrap();
        assert_eq!(endpoint.referrals(), ReferralPolicy::Follow);
        assert_eq!(endpoint.connect_timeout(), None);
        assert!(!endpoint.start_tls());
    }

    #[test]
    fn test_credential_debug_is_redacted() {
        let credential = AdminCredential::new("cn=admin,dc=x", "hunter2");
        let printed = format!("{credential:?}");
        assert!(printed.contains("cn=admin,dc=x"));
        assert!(!printed.contains("hunter2"));
    }

    #[test]
    fn test_attr_lookup_ignores_case() {
        let entry = DirectoryEntry::new("uid=jdoe,dc=x")
            .with_attr("memberof", ["CN=a,OU=eng,DC=x"]);
        assert_eq!(entry.attr("memberOf").map(<[_]>::len), Some(1));
        assert!(entry.attr("mail").is_none());
    }
}
