//! Configuration manager for ldap-groups.
//!
//! The provider is configured with flat `ldap.*` properties, either given as
//! an already parsed mapping or read from a YAML file.

use std::collections::HashMap;
use std::fs::File;
use std::num::ParseIntError;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::cache::{CacheSettings, DEFAULT_CAPACITY, DEFAULT_FAILURE_TTL, DEFAULT_TTL};
use crate::connection::{DEFAULT_MAX_RETRIES, DEFAULT_RETRY_INTERVAL, RetryPolicy};
use crate::directory::{AdminCredential, DirectoryEndpoint, ReferralPolicy};
use crate::group::{DEFAULT_GROUP_FILTER, DEFAULT_NAME_COMPONENT, GroupFilter};
use crate::resolver::{DEFAULT_GROUP_ATTRIBUTE, SearchSettings, USER_PLACEHOLDER};

const DEFAULT_CONFIG_PATH: &str = "group-provider.yaml";

pub const URL: &str = "ldap.url";
pub const ADMIN_USER: &str = "ldap.admin-user";
pub const ADMIN_PASSWORD: &str = "ldap.admin-password";
pub const USER_BASE_DN: &str = "ldap.user-base-dn";
pub const USER_BASE_DN_SECONDARY: &str = "ldap.user-base-dn-secondary";
pub const USER_SEARCH_FILTER: &str = "ldap.user-search-filter";
pub const GROUP_FILTER: &str = "ldap.group-filter";
pub const GROUP_ATTRIBUTE: &str = "ldap.group-attribute";
pub const GROUP_NAME_COMPONENT: &str = "ldap.group-name-component";
pub const CACHE_TTL: &str = "ldap.cache-ttl";
pub const ERROR_CACHE_TTL: &str = "ldap.error-cache-ttl";
pub const MAX_RETRY_COUNT: &str = "ldap.max-retry-count";
pub const RETRY_INTERVAL: &str = "ldap.retry-interval";
pub const IGNORE_REFERRALS: &str = "ldap.ignore-referrals";
pub const CONNECT_TIMEOUT: &str = "ldap.connect-timeout";
pub const START_TLS: &str = "ldap.start-tls";

/// Errors that may occur during the configuration loading process.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("group provider requires configuration properties")]
    Empty,
    #[error("missing `{0}` property")]
    Missing(&'static str),
    #[error("`{0}` must contain the `${{USER}}` placeholder")]
    Placeholder(&'static str),
    #[error("invalid duration for `{key}`: {source}")]
    Duration {
        key: &'static str,
        source: humantime::DurationError,
    },
    #[error("invalid number for `{key}`: {source}")]
    Number {
        key: &'static str,
        source: ParseIntError,
    },
    #[error("invalid boolean for `{key}`: `{value}`")]
    Flag { key: &'static str, value: String },
    #[error("URL is invalid: {0}")]
    Url(#[from] url::ParseError),
    #[error("unsupported directory scheme `{0}`")]
    Scheme(String),
    #[error("failed to deserialize configuration: {0}")]
    Deserialize(#[from] serde_yaml::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Every setting of a provider, built once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct Configuration {
    pub endpoint: DirectoryEndpoint,
    pub credential: AdminCredential,
    pub search: SearchSettings,
    pub filter: GroupFilter,
    pub retry: RetryPolicy,
    pub cache: CacheSettings,
}

/// Scalar YAML value, kept as text like any other property.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Scalar {
    Text(String),
    Integer(i64),
    Float(f64),
    Flag(bool),
}

impl std::fmt::Display for Scalar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scalar::Text(text) => f.write_str(text),
            Scalar::Integer(number) => write!(f, "{number}"),
            Scalar::Float(number) => write!(f, "{number}"),
            Scalar::Flag(flag) => write!(f, "{flag}"),
        }
    }
}

struct Properties<'a>(&'a HashMap<String, String>);

impl<'a> Properties<'a> {
    /// Trimmed, non-empty value.
    fn get(&self, key: &str) -> Option<&'a str> {
        self.0
            .get(key)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    fn required(&self, key: &'static str) -> Result<&'a str, Error> {
        self.get(key).ok_or(Error::Missing(key))
    }

    fn duration(&self, key: &'static str) -> Result<Option<Duration>, Error> {
        self.get(key)
            .map(|value| {
                humantime::parse_duration(value)
                    .map_err(|source| Error::Duration { key, source })
            })
            .transpose()
    }

    fn number(&self, key: &'static str) -> Result<Option<u32>, Error> {
        self.get(key)
            .map(|value| value.parse().map_err(|source| Error::Number { key, source }))
            .transpose()
    }

    fn flag(&self, key: &'static str) -> Result<Option<bool>, Error> {
        self.get(key)
            .map(|value| match value.to_ascii_lowercase().as_str() {
                "true" => Ok(true),
                "false" => Ok(false),
                _ => Err(Error::Flag {
                    key,
                    value: value.to_owned(),
                }),
            })
            .transpose()
    }
}

impl Configuration {
    /// Build configuration from `ldap.*` properties, applying defaults.
    pub fn from_properties(properties: &HashMap<String, String>) -> Result<Self, Error> {
        if properties.is_empty() {
            return Err(Error::Empty);
        }
        let props = Properties(properties);

        let referrals = if props.flag(IGNORE_REFERRALS)?.unwrap_or(false) {
            ReferralPolicy::Ignore
        } else {
            ReferralPolicy::Follow
        };
        let endpoint = DirectoryEndpoint::new(props.required(URL)?)?
            .with_referrals(referrals)
            .with_connect_timeout(props.duration(CONNECT_TIMEOUT)?)
            .with_start_tls(props.flag(START_TLS)?.unwrap_or(false));

        // Secrets may legitimately carry surrounding spaces.
        let password = properties
            .get(ADMIN_PASSWORD)
            .ok_or(Error::Missing(ADMIN_PASSWORD))?;
        let credential = AdminCredential::new(props.required(ADMIN_USER)?, password.as_str());

        let base = props.required(USER_BASE_DN)?;
        let template = props.required(USER_SEARCH_FILTER)?;
        if !template.contains(USER_PLACEHOLDER) {
            return Err(Error::Placeholder(USER_SEARCH_FILTER));
        }
        let search = SearchSettings::new(base, template)
            .with_secondary_base(props.get(USER_BASE_DN_SECONDARY).unwrap_or(base))
            .with_group_attribute(props.get(GROUP_ATTRIBUTE).unwrap_or(DEFAULT_GROUP_ATTRIBUTE));

        let filter = GroupFilter::new(
            props.get(GROUP_FILTER).unwrap_or(DEFAULT_GROUP_FILTER),
            props
                .get(GROUP_NAME_COMPONENT)
                .unwrap_or(DEFAULT_NAME_COMPONENT),
        );

        let retry = RetryPolicy {
            max_retries: props.number(MAX_RETRY_COUNT)?.unwrap_or(DEFAULT_MAX_RETRIES),
            interval: props.duration(RETRY_INTERVAL)?.unwrap_or(DEFAULT_RETRY_INTERVAL),
        };

        let cache = CacheSettings {
            ttl: props.duration(CACHE_TTL)?.unwrap_or(DEFAULT_TTL),
            failure_ttl: props.duration(ERROR_CACHE_TTL)?.unwrap_or(DEFAULT_FAILURE_TTL),
            capacity: DEFAULT_CAPACITY,
        };

        Ok(Self {
            endpoint,
            credential,
            search,
            filter,
            retry,
            cache,
        })
    }

    /// Reads a YAML file of `ldap.*` properties from the specified path or
    /// the default location.
    pub fn read(path: Option<&Path>) -> Result<Self, Error> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
        let file = File::open(path)?;
        let raw: HashMap<String, Option<Scalar>> = serde_yaml::from_reader(file)?;

        let properties = raw
            .into_iter()
            .filter_map(|(key, value)| value.map(|value| (key, value.to_string())))
            .collect();
        tracing::debug!(path = %path.display(), "configuration file loaded");

        Self::from_properties(&properties)
    }
}
