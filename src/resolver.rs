//! Group membership lookup for a single user.

use crate::connection::ConnectionManager;
use crate::directory::{AdminCredential, Directory, DirectoryEntry, DirectorySession};
use crate::error::{Error, Result};
use crate::group::{GroupFilter, Groups};

pub const USER_PLACEHOLDER: &str = "${USER}";
pub const DEFAULT_GROUP_ATTRIBUTE: &str = "memberOf";

/// Where and how users are searched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchSettings {
    pub primary_base: String,
    /// Fallback base, searched when the primary base has no match.
    pub secondary_base: String,
    pub user_filter: String,
    pub group_attribute: String,
}

impl SearchSettings {
    /// Create a new [`SearchSettings`] whose secondary base is the primary one.
    pub fn new(base: impl Into<String>, user_filter: impl Into<String>) -> Self {
        let base = base.into();
        Self {
            secondary_base: base.clone(),
            primary_base: base,
            user_filter: user_filter.into(),
            group_attribute: DEFAULT_GROUP_ATTRIBUTE.to_owned(),
        }
    }

    /// Update fallback base.
    pub fn with_secondary_base(mut self, base: impl Into<String>) -> Self {
        self.secondary_base = base.into();
        self
    }

    /// Update membership attribute.
    pub fn with_group_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.group_attribute = attribute.into();
        self
    }

    /// Configure search filter for user identifier.
    pub fn user_filter(&self, user: &str) -> String {
        self.user_filter.replace(USER_PLACEHOLDER, &escape_filter(user))
    }
}

/// Resolves users to their groups with one admin bind per call.
pub struct GroupResolver<D: Directory> {
    connections: ConnectionManager<D>,
    credential: AdminCredential,
    search: SearchSettings,
    filter: GroupFilter,
}

impl<D: Directory> GroupResolver<D> {
    /// Create a new [`GroupResolver`].
    pub fn new(
        connections: ConnectionManager<D>,
        credential: AdminCredential,
        search: SearchSettings,
        filter: GroupFilter,
    ) -> Self {
        Self {
            connections,
            credential,
            search,
            filter,
        }
    }

    /// Resolve groups of `user`.
    ///
    /// A user unknown to the directory, or without membership attribute,
    /// has no groups. The session is closed whatever the outcome.
    pub async fn resolve(&self, user: &str) -> Result<Groups> {
        let mut session = self.connections.bind(&self.credential).await?;
        let outcome = self.search_groups(&mut session, user).await;

        if let Err(err) = session.close().await {
            tracing::debug!(error = %err, "failed to close directory session");
        }

        outcome
    }

    async fn search_groups(&self, session: &mut D::Session, user: &str) -> Result<Groups> {
        let filter = self.search.user_filter(user);

        let mut entries = self.search_base(session, &self.search.primary_base, &filter).await?;
        if entries.is_empty() {
            tracing::debug!(user, "user not found in primary base dn");

            if self.search.secondary_base == self.search.primary_base {
                tracing::warn!(user, "user not found in directory");
                return Ok(Groups::new());
            }

            entries = self
                .search_base(session, &self.search.secondary_base, &filter)
                .await?;
            if entries.is_empty() {
                tracing::warn!(user, "user not found in secondary base dn");
                return Ok(Groups::new());
            }
            tracing::debug!(user, "user found in secondary base dn");
        }

        if entries.len() > 1 {
            tracing::debug!(
                user,
                matches = entries.len(),
                "search filter matched several entries, using the first one"
            );
        }

        let entry = entries.swap_remove(0);
        let Some(values) = entry.attr(&self.search.group_attribute) else {
            tracing::debug!(user, "user is not member of any group");
            return Ok(Groups::new());
        };

        tracing::debug!(user, dn = %entry.dn, ?values, "membership values");
        let groups = self.filter.group_names(values);
        tracing::info!(user, ?groups, "directory groups");

        Ok(groups)
    }

    async fn search_base(
        &self,
        session: &mut D::Session,
        base: &str,
        filter: &str,
    ) -> Result<Vec<DirectoryEntry>> {
        session
            .search(base, filter, &[self.search.group_attribute.as_str()])
            .await
            .map_err(|source| Error::Search {
                base: base.to_owned(),
                source,
            })
    }
}

/// Escape an assertion value for a search filter (RFC 4515).
fn escape_filter(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '*' => out.push_str(r"\2a"),
            '(' => out.push_str(r"\28"),
            ')' => out.push_str(r"\29"),
            '\\' => out.push_str(r"\5c"),
            '\0' => out.push_str(r"\00"),
            c => out.push(c),
        }
    }
    out
}
