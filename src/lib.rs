//! ldap-groups resolves the groups of a user from an LDAP directory.
//!
//! Lookups bind with an admin credential, search the user under a primary
//! then a secondary base, and turn membership DNs into group names. Results
//! are kept in a TTL cache where concurrent lookups of the same user share a
//! single directory round trip.

#![forbid(unsafe_code)]

pub mod cache;
pub mod config;
pub mod connection;
pub mod directory;
pub mod error;
pub mod group;
pub mod ldap;
pub mod provider;
pub mod resolver;
pub mod telemetry;

pub use cache::{CacheSettings, CacheStats};
pub use config::Configuration;
pub use directory::{AdminCredential, DirectoryEndpoint, ReferralPolicy};
pub use error::{Error, Result};
pub use group::{GroupFilter, Groups};
pub use provider::GroupProvider;
