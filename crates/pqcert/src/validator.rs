//! HTTP reachability check for challenge tokens

use std::net::SocketAddr;
use std::time::Duration;

use reqwest::redirect::{Attempt, Policy};
use reqwest::{Client, StatusCode};
use tracing::{debug, trace, warn};
use url::Url;

use pqcert_config::ValidatorConfig;

use crate::challenge::CHALLENGE_PREFIX;

/// Redirect hops followed before giving up
const MAX_REDIRECTS: usize = 5;

/// Confirms that a challenge token is published at the claimed domain
///
/// Performs one unauthenticated GET per check. Redirects are only followed
/// while they stay on the originally requested host, so a domain cannot
/// point the validator at a third party. Every failure mode (connect error,
/// timeout, non-200, token missing from the body) yields `false`.
#[derive(Debug, Clone)]
pub struct DomainValidator {
    client: Client,
    path_prefix: String,
    max_body_bytes: usize,
}

impl DomainValidator {
    pub fn new(config: &ValidatorConfig) -> reqwest::Result<Self> {
        Self::with_prefix(config, CHALLENGE_PREFIX)
    }

    /// Validator publishing under a non-default well-known prefix
    pub fn with_prefix(config: &ValidatorConfig, path_prefix: &str) -> reqwest::Result<Self> {
        Self::build(config, path_prefix, Vec::new())
    }

    /// Validator that connects to fixed addresses for the given domains
    /// instead of resolving them, e.g. for staging setups
    pub fn with_resolved(
        config: &ValidatorConfig,
        overrides: impl IntoIterator<Item = (String, SocketAddr)>,
    ) -> reqwest::Result<Self> {
        Self::build(config, CHALLENGE_PREFIX, overrides.into_iter().collect())
    }

    fn build(
        config: &ValidatorConfig,
        path_prefix: &str,
        overrides: Vec<(String, SocketAddr)>,
    ) -> reqwest::Result<Self> {
        let mut builder = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .redirect(Policy::custom(same_host_redirects))
            .user_agent(concat!("pqcert-validator/", env!("CARGO_PKG_VERSION")));
        for (domain, addr) in &overrides {
            builder = builder.resolve(domain, *addr);
        }

        Ok(Self {
            client: builder.build()?,
            path_prefix: path_prefix.to_string(),
            max_body_bytes: config.max_body_bytes,
        })
    }

    /// URL fetched for `domain` and `token`
    pub fn challenge_url(&self, domain: &str, token: &str) -> Option<Url> {
        Url::parse(&format!("http://{}{}{}", domain, self.path_prefix, token)).ok()
    }

    /// Whether `token` is served at the domain's well-known challenge path
    pub async fn verify(&self, domain: &str, token: &str) -> bool {
        if token.is_empty() {
            return false;
        }
        let Some(url) = self.challenge_url(domain, token) else {
            debug!(domain = %domain, "Challenge URL could not be built");
            return false;
        };

        match self.fetch(url, token).await {
            Ok(found) => {
                debug!(domain = %domain, found, "Challenge fetch completed");
                found
            }
            Err(e) => {
                warn!(domain = %domain, error = %e, "Challenge fetch failed");
                false
            }
        }
    }

    async fn fetch(&self, url: Url, token: &str) -> reqwest::Result<bool> {
        let mut response = self.client.get(url).send().await?;

        if response.status() != StatusCode::OK {
            trace!(status = %response.status(), "Challenge endpoint returned non-200");
            return Ok(false);
        }

        let mut body = Vec::with_capacity(token.len().min(self.max_body_bytes));
        while let Some(chunk) = response.chunk().await? {
            let remaining = self.max_body_bytes.saturating_sub(body.len());
            body.extend_from_slice(&chunk[..chunk.len().min(remaining)]);
            if body.len() >= self.max_body_bytes {
                trace!(limit = self.max_body_bytes, "Challenge body truncated");
                break;
            }
        }

        Ok(String::from_utf8_lossy(&body).contains(token))
    }
}

/// Follow a redirect only when it stays on the first request's origin
fn same_host_redirects(attempt: Attempt<'_>) -> reqwest::redirect::Action {
    if attempt.previous().len() > MAX_REDIRECTS {
        return attempt.error("too many redirects");
    }

    let same = attempt
        .previous()
        .first()
        .is_some_and(|origin| same_origin(origin, attempt.url()));
    if same {
        attempt.follow()
    } else {
        debug!(target_url = %attempt.url(), "Refusing cross-origin redirect");
        attempt.stop()
    }
}

/// Scheme, host and effective port all match
fn same_origin(a: &Url, b: &Url) -> bool {
    a.host_str().is_some()
        && a.scheme() == b.scheme()
        && a.host_str() == b.host_str()
        && a.port_or_known_default() == b.port_or_known_default()
}
