//! LDAP support.

use async_trait::async_trait;
use ldap3::{
    Ldap, LdapConnAsync, LdapConnSettings, LdapError, LdapResult, Scope,
    SearchEntry, SearchResult,
};
use percent_encoding::percent_decode_str;
use url::Url;

use crate::directory::{
    AdminCredential, BindFailure, Directory, DirectoryEndpoint, DirectoryEntry,
    DirectorySession, ReferralPolicy,
};
use crate::error::Cause;

const REFERRAL: u32 = 10;
const NO_SUCH_OBJECT: u32 = 32;
const INAPPROPRIATE_AUTHENTICATION: u32 = 48;
const INVALID_CREDENTIALS: u32 = 49;

/// [`Directory`] backed by `ldap3`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ldap3Directory;

#[async_trait]
impl Directory for Ldap3Directory {
    type Session = Ldap3Session;

    async fn bind(
        &self,
        endpoint: &DirectoryEndpoint,
        credential: &AdminCredential,
    ) -> Result<Ldap3Session, BindFailure> {
        let ldap = bind(endpoint.url(), endpoint, credential).await?;

        Ok(Ldap3Session {
            ldap,
            endpoint: endpoint.clone(),
            credential: credential.clone(),
        })
    }
}

/// Bound `ldap3` connection.
#[derive(Debug)]
pub struct Ldap3Session {
    ldap: Ldap,
    endpoint: DirectoryEndpoint,
    credential: AdminCredential,
}

#[async_trait]
impl DirectorySession for Ldap3Session {
    async fn search(
        &mut self,
        base: &str,
        filter: &str,
        attrs: &[&str],
    ) -> Result<Vec<DirectoryEntry>, Cause> {
        let SearchResult(entries, result) = self
            .ldap
            .search(base, Scope::Subtree, filter, attrs.to_vec())
            .await?;

        let mut refs = Vec::new();
        let rc = result.rc;
        match rc {
            NO_SUCH_OBJECT => {
                tracing::debug!(base, "search base does not exist");
                return Ok(Vec::new());
            },
            REFERRAL => refs.extend(result.refs),
            _ => {
                result.success()?;
            },
        }

        let mut found = Vec::with_capacity(entries.len());
        for entry in entries {
            if entry.is_ref() {
                refs.extend(ldap3::parse_refs(entry.0));
            } else {
                found.push(into_entry(SearchEntry::construct(entry)));
            }
        }

        if refs.is_empty() {
            return Ok(found);
        }
        match self.endpoint.referrals() {
            ReferralPolicy::Ignore => {
                tracing::debug!(base, count = refs.len(), "ignoring referrals");
            },
            ReferralPolicy::Follow => {
                for referral in refs {
                    found.extend(self.chase(&referral, base, filter, attrs).await?);
                }
            },
        }

        Ok(found)
    }

    async fn close(&mut self) -> Result<(), Cause> {
        self.ldap.unbind().await?;
        Ok(())
    }
}

impl Ldap3Session {
    /// Repeat a search on the referred server. Referrals returned there are
    /// dropped.
    async fn chase(
        &self,
        referral: &str,
        base: &str,
        filter: &str,
        attrs: &[&str],
    ) -> Result<Vec<DirectoryEntry>, Cause> {
        let (server, referred_base) = split_referral(referral)?;
        let base = referred_base.as_deref().unwrap_or(base);
        tracing::debug!(%server, base, "following referral");

        let mut ldap = bind(&server, &self.endpoint, &self.credential).await?;
        let outcome = ldap
            .search(base, Scope::Subtree, filter, attrs.to_vec())
            .await;
        if let Err(err) = ldap.unbind().await {
            tracing::debug!(error = %err, "failed to unbind referral connection");
        }

        let SearchResult(entries, result) = outcome?;
        match result.rc {
            NO_SUCH_OBJECT => return Ok(Vec::new()),
            REFERRAL => {},
            _ => {
                result.success()?;
            },
        }

        Ok(entries
            .into_iter()
            .filter(|entry| !entry.is_ref())
            .map(|entry| into_entry(SearchEntry::construct(entry)))
            .collect())
    }
}

async fn bind(
    url: &str,
    endpoint: &DirectoryEndpoint,
    credential: &AdminCredential,
) -> Result<Ldap, BindFailure> {
    let mut settings = LdapConnSettings::new().set_starttls(endpoint.start_tls());
    if let Some(timeout) = endpoint.connect_timeout() {
        settings = settings.set_conn_timeout(timeout);
    }

    let (handle, mut ldap) = LdapConnAsync::with_settings(settings, url)
        .await
        .map_err(transient)?;
    ldap3::drive!(handle);

    let result = ldap
        .simple_bind(credential.principal(), credential.secret())
        .await
        .map_err(transient)?;
    if result.rc == 0 {
        return Ok(ldap);
    }

    let failure = bind_failure(result);
    let _ = ldap.unbind().await;
    Err(failure)
}

/// Invalid or inappropriate credentials are final, anything else may be
/// retried.
fn bind_failure(result: LdapResult) -> BindFailure {
    match result.rc {
        INAPPROPRIATE_AUTHENTICATION | INVALID_CREDENTIALS => {
            BindFailure::Rejected(format!("rc={}: {}", result.rc, result.text))
        },
        _ => BindFailure::Transient(Box::new(LdapError::LdapResult { result })),
    }
}

fn transient(err: LdapError) -> BindFailure {
    BindFailure::Transient(Box::new(err))
}

fn into_entry(entry: SearchEntry) -> DirectoryEntry {
    DirectoryEntry {
        dn: entry.dn,
        attrs: entry.attrs,
    }
}

/// Split an LDAP URL into the server to contact and the base it names.
fn split_referral(referral: &str) -> Result<(String, Option<String>), Cause> {
    let url = Url::parse(referral)?;
    let host = url.host_str().ok_or("referral without host")?;

    let server = match url.port() {
        Some(port) => format!("{}://{host}:{port}", url.scheme()),
        None => format!("{}://{host}", url.scheme()),
    };
    let path = url.path().trim_start_matches('/');
    let base = (!path.is_empty())
        .then(|| percent_decode_str(path).decode_utf8_lossy().into_owned());

    Ok((server, base))
}
