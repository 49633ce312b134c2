//! Authenticated directory sessions with bounded retry.

use std::time::Duration;

use crate::directory::{AdminCredential, BindFailure, Directory, DirectoryEndpoint};
use crate::error::{Error, Result};
use crate::telemetry::BIND_ATTEMPTS;

pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// How often, and how fast, transient bind failures are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

/// Opens sessions against a single endpoint.
#[derive(Debug)]
pub struct ConnectionManager<D> {
    directory: D,
    endpoint: DirectoryEndpoint,
    retry: RetryPolicy,
}

impl<D: Directory> ConnectionManager<D> {
    /// Create a new [`ConnectionManager`].
    pub fn new(directory: D, endpoint: DirectoryEndpoint, retry: RetryPolicy) -> Self {
        Self {
            directory,
            endpoint,
            retry,
        }
    }

    pub fn endpoint(&self) -> &DirectoryEndpoint {
        &self.endpoint
    }

    /// Open a session bound as `credential`.
    ///
    /// Rejected credentials fail at once. Other failures are retried up to
    /// [`RetryPolicy::max_retries`] times, `interval` apart.
    pub async fn bind(&self, credential: &AdminCredential) -> Result<D::Session> {
        let mut attempt = 0;
        loop {
            match self.bind_attempt(credential, attempt).await {
                Ok(session) => return Ok(session),
                Err(BindFailure::Rejected(reason)) => {
                    tracing::error!(%reason, "directory rejected admin credentials");
                    return Err(Error::Auth {
                        principal: credential.principal().to_owned(),
                        reason,
                    });
                },
                Err(BindFailure::Transient(cause)) => {
                    if attempt >= self.retry.max_retries {
                        tracing::error!(
                            attempts = attempt + 1,
                            error = %cause,
                            "giving up on directory connection"
                        );
                        return Err(Error::Connection {
                            attempts: attempt + 1,
                            source: cause,
                        });
                    }

                    tracing::warn!(
                        attempt,
                        error = %cause,
                        retry_in = ?self.retry.interval,
                        "directory connection failed"
                    );
                    tokio::time::sleep(self.retry.interval).await;
                    attempt += 1;
                },
            }
        }
    }

    async fn bind_attempt(
        &self,
        credential: &AdminCredential,
        attempt: u32,
    ) -> std::result::Result<D::Session, BindFailure> {
        tracing::trace!(attempt, url = self.endpoint.url(), "binding");
        let outcome = self.directory.bind(&self.endpoint, credential).await;

        let label = match &outcome {
            Ok(_) => "success",
            Err(BindFailure::Rejected(_)) => "rejected",
            Err(BindFailure::Transient(_)) => "transient",
        };
        metrics::counter!(BIND_ATTEMPTS, "outcome" => label).increment(1);

        outcome
    }
}
