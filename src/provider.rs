//! Entry point used by the host to look group membership up.

use std::collections::HashMap;
use std::sync::OnceLock;

use tokio::runtime::{Handle, Runtime};
use tracing::Instrument;

use crate::cache::{CacheStats, GroupCache};
use crate::config::Configuration;
use crate::connection::ConnectionManager;
use crate::directory::Directory;
use crate::error::Result;
use crate::group::Groups;
use crate::ldap::Ldap3Directory;
use crate::resolver::GroupResolver;
use crate::telemetry::RESOLUTIONS;

/// Cached group lookups against a directory.
///
/// Lookups never fail: any error is logged and answered with an empty set,
/// so that a broken directory denies group based access instead of breaking
/// the host.
pub struct GroupProvider<D: Directory = Ldap3Directory> {
    resolver: GroupResolver<D>,
    cache: GroupCache,
    span: tracing::Span,
    /// Drives [`GroupProvider::groups_blocking`], started on first use.
    runtime: OnceLock<Option<Runtime>>,
}

impl GroupProvider<Ldap3Directory> {
    /// Build a provider talking to a real LDAP server from `ldap.*`
    /// properties.
    pub fn from_properties(properties: &HashMap<String, String>) -> Result<Self> {
        let config = Configuration::from_properties(properties)?;
        Ok(Self::new(config, Ldap3Directory))
    }
}

impl<D: Directory> GroupProvider<D> {
    /// Create a new [`GroupProvider`].
    pub fn new(config: Configuration, directory: D) -> Self {
        let span = tracing::info_span!("group_provider", url = %config.endpoint.url());
        span.in_scope(|| {
            tracing::info!(
                base = %config.search.primary_base,
                secondary = %config.search.secondary_base,
                ttl = %humantime::format_duration(config.cache.ttl),
                "group provider configured"
            );
        });

        let connections = ConnectionManager::new(directory, config.endpoint, config.retry);

        Self {
            resolver: GroupResolver::new(
                connections,
                config.credential,
                config.search,
                config.filter,
            ),
            cache: GroupCache::new(config.cache),
            span,
            runtime: OnceLock::new(),
        }
    }

    /// Groups of `user`, from cache when fresh.
    pub async fn groups(&self, user: &str) -> Groups {
        async move {
            let outcome = self
                .cache
                .get_or_resolve(user, move || self.resolver.resolve(user))
                .await;

            match outcome {
                Ok(groups) => {
                    metrics::counter!(RESOLUTIONS, "outcome" => "ok").increment(1);
                    groups
                },
                Err(err) => {
                    metrics::counter!(RESOLUTIONS, "outcome" => err.kind()).increment(1);
                    if err.is_auth() {
                        tracing::error!(
                            user,
                            error = %err,
                            "admin credential rejected, check ldap.admin-user and ldap.admin-password"
                        );
                    } else {
                        tracing::warn!(user, error = %err, "group resolution failed, answering no groups");
                    }
                    Groups::new()
                },
            }
        }
        .instrument(self.span.clone())
        .await
    }

    /// Blocking form of [`GroupProvider::groups`] for synchronous hosts.
    ///
    /// Safe to call from any thread. Called from within an async context,
    /// the lookup runs on a scoped thread so the caller's runtime is not
    /// re-entered.
    pub fn groups_blocking(&self, user: &str) -> Groups {
        let Some(runtime) = self.runtime() else {
            return Groups::new();
        };

        if Handle::try_current().is_err() {
            return runtime.block_on(self.groups(user));
        }

        std::thread::scope(|scope| {
            scope
                .spawn(|| runtime.block_on(self.groups(user)))
                .join()
                .unwrap_or_else(|_| {
                    tracing::error!(parent: &self.span, user, "group lookup panicked");
                    Groups::new()
                })
        })
    }

    fn runtime(&self) -> Option<&Runtime> {
        self.runtime
            .get_or_init(|| {
                tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(1)
                    .thread_name("ldap-groups")
                    .enable_all()
                    .build()
                    .inspect_err(|err| {
                        tracing::error!(
                            parent: &self.span,
                            error = %err,
                            "failed to start lookup runtime"
                        );
                    })
                    .ok()
            })
            .as_ref()
    }

    /// Forget the cached groups of `user`.
    pub fn invalidate(&self, user: &str) {
        self.cache.invalidate(user);
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

impl<D: Directory> Drop for GroupProvider<D> {
    fn drop(&mut self) {
        // A runtime may not be dropped in place from an async context.
        if let Some(Some(runtime)) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::config::{self, ERROR_CACHE_TTL, MAX_RETRY_COUNT, RETRY_INTERVAL};
    use crate::directory::DirectoryEntry;
    use crate::directory::mock::{Bind, MockDirectory};
    use crate::error::Error;

    const PEOPLE: &str = "ou=people,dc=example,dc=com";

    fn properties() -> HashMap<String, String> {
        [
            ("ldap.url", "ldap://localhost:389"),
            ("ldap.admin-user", "cn=admin,dc=example,dc=com"),
            ("ldap.admin-password", "secret"),
            ("ldap.user-base-dn", PEOPLE),
            ("ldap.user-search-filter", "(uid=${USER})"),
            (MAX_RETRY_COUNT, "1"),
            (RETRY_INTERVAL, "1s"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect()
    }

    fn provider(directory: MockDirectory) -> GroupProvider<MockDirectory> {
        let config = Configuration::from_properties(&properties()).unwrap();
        GroupProvider::new(config, directory)
    }

    fn jdoe() -> DirectoryEntry {
        DirectoryEntry::new(format!("uid=jdoe,{PEOPLE}")).with_attr(
            "memberOf",
            ["CN=alpha,OU=eng,DC=x", "CN=Domain Users,CN=Users,DC=x"],
        )
    }

    #[tokio::test]
    async fn test_group_name_is_ou_value() {
        let provider = provider(MockDirectory::default().entry(PEOPLE, jdoe()));

        let groups = provider.groups("jdoe").await;
        assert_eq!(groups, Groups::from(["eng".to_owned()]));
    }

    #[tokio::test]
    async fn test_cached_lookup_skips_directory() {
        let directory = MockDirectory::default().entry(PEOPLE, jdoe());
        let provider = provider(directory.clone());

        let first = provider.groups("jdoe").await;
        let second = provider.groups("jdoe").await;

        assert_eq!(first, second);
        assert_eq!(directory.bind_calls(), 1);
        assert_eq!(directory.searched_bases().len(), 1);

        let stats = provider.cache_stats();
        assert_eq!((stats.hits, stats.misses, stats.size), (1, 1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_lookups_share_one_search() {
        let directory = MockDirectory::default()
            .entry(PEOPLE, jdoe())
            .search_delay(std::time::Duration::from_millis(200));
        let provider = provider(directory.clone());

        let (a, b, c) = tokio::join!(
            provider.groups("jdoe"),
            provider.groups("jdoe"),
            provider.groups("jdoe"),
        );

        assert_eq!(a, Groups::from(["eng".to_owned()]));
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(directory.bind_calls(), 1);
        assert_eq!(directory.searched_bases().len(), 1);
    }

    #[tokio::test]
    async fn test_search_failure_degrades_and_is_not_cached() {
        let directory = MockDirectory::default().failing_base(PEOPLE);
        let provider = provider(directory.clone());

        assert!(provider.groups("jdoe").await.is_empty());
        assert!(provider.groups("jdoe").await.is_empty());

        assert_eq!(directory.bind_calls(), 2);
        assert_eq!(provider.cache_stats().size, 0);
    }

    #[tokio::test]
    async fn test_failure_cached_when_configured() {
        let directory = MockDirectory::default().failing_base(PEOPLE);
        let mut props = properties();
        props.insert(ERROR_CACHE_TTL.to_owned(), "30s".to_owned());
        let provider = GroupProvider::new(
            Configuration::from_properties(&props).unwrap(),
            directory.clone(),
        );

        assert!(provider.groups("jdoe").await.is_empty());
        assert!(provider.groups("jdoe").await.is_empty());
        assert_eq!(directory.bind_calls(), 1);
    }

    #[tokio::test]
    async fn test_rejected_credential_answers_empty() {
        let directory = MockDirectory::default()
            .entry(PEOPLE, jdoe())
            .script_binds([Bind::Reject]);
        let provider = provider(directory.clone());

        assert!(provider.groups("jdoe").await.is_empty());
        assert_eq!(directory.bind_calls(), 1);
        assert!(directory.searched_bases().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_directory_answers_empty() {
        let directory = MockDirectory::default()
            .entry(PEOPLE, jdoe())
            .script_binds([Bind::Fail, Bind::Fail]);
        let provider = provider(directory.clone());

        assert!(provider.groups("jdoe").await.is_empty());
        assert_eq!(directory.bind_calls(), 2);

        // Directory is back and nothing was cached.
        assert_eq!(provider.groups("jdoe").await, Groups::from(["eng".to_owned()]));
    }

    #[tokio::test]
    async fn test_invalidate_forces_lookup() {
        let directory = MockDirectory::default().entry(PEOPLE, jdoe());
        let provider = provider(directory.clone());

        provider.groups("jdoe").await;
        provider.invalidate("jdoe");
        provider.groups("jdoe").await;
        assert_eq!(directory.bind_calls(), 2);

        provider.invalidate_all();
        assert_eq!(provider.cache_stats().size, 0);
    }

    #[test]
    fn test_blocking_lookups_from_threads() {
        let directory = MockDirectory::default()
            .entry(PEOPLE, jdoe())
            .search_delay(std::time::Duration::from_millis(50));
        let provider = provider(directory.clone());

        let resolved: Vec<Groups> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| scope.spawn(|| provider.groups_blocking("jdoe")))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        for groups in resolved {
            assert_eq!(groups, Groups::from(["eng".to_owned()]));
        }
        assert_eq!(directory.bind_calls(), 1);
    }

    #[tokio::test]
    async fn test_blocking_lookup_inside_runtime() {
        let provider = provider(MockDirectory::default().entry(PEOPLE, jdoe()));

        assert_eq!(
            provider.groups_blocking("jdoe"),
            Groups::from(["eng".to_owned()])
        );
    }

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_admin_principal_is_never_logged() {
        let capture = Capture::default();
        let writer = capture.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let provider = provider(MockDirectory::default().script_binds([Bind::Reject]));
            assert!(provider.groups_blocking("jdoe").is_empty());
        });

        let logs = String::from_utf8_lossy(&capture.0.lock()).into_owned();
        assert!(logs.contains("group provider configured"));
        assert!(logs.contains("admin credential"));
        assert!(!logs.contains("cn=admin"));
    }

    #[test]
    fn test_from_properties_requires_properties() {
        assert!(matches!(
            GroupProvider::from_properties(&HashMap::new()),
            Err(Error::Config(config::Error::Empty))
        ));
    }
}
