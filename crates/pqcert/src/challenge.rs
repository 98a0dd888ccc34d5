//! Domain-validation challenge management
//!
//! A challenge binds a random token to a domain. The requester publishes the
//! token at `http://<domain>/.well-known/pqcert-challenge/<token>`; once the
//! [`DomainValidator`](crate::validator::DomainValidator) has seen it there the
//! challenge is marked verified, and issuance consumes it.
//!
//! ```text
//! Pending ──verify──▶ Verified ──consume──▶ Consumed (record deleted)
//!    │
//!    └──ttl elapsed──▶ Expired (removed by sweep)
//! ```

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use rand::RngCore;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use pqcert_common::{Algorithm, ChallengeId};
use pqcert_config::ChallengeConfig;

use crate::error::{PqcertError, Result};
use crate::storage::{get_json, put_json, KvStore};

/// Default well-known path prefix for published tokens
pub const CHALLENGE_PREFIX: &str = "/.well-known/pqcert-challenge/";

/// Token entropy in bytes (256 bits)
const TOKEN_BYTES: usize = 32;

/// Longest permitted fully-qualified domain name
const MAX_DOMAIN_LEN: usize = 253;

static DOMAIN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?\.)+[A-Za-z]{2,63}$")
        .expect("Invalid regex")
});

/// Check hostname syntax: labels of 1-63 alphanumerics or inner hyphens,
/// at least two labels, alphabetic TLD of two or more characters
pub fn validate_domain(domain: &str) -> Result<()> {
    if domain.len() <= MAX_DOMAIN_LEN && DOMAIN_RE.is_match(domain) {
        Ok(())
    } else {
        Err(PqcertError::InvalidDomain(domain.to_string()))
    }
}

/// Lifecycle state of a challenge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeState {
    Pending,
    Verified,
    Consumed,
    Expired,
}

/// A domain-validation challenge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Challenge {
    pub id: ChallengeId,
    pub domain: String,
    #[serde(default)]
    pub email: Option<String>,
    pub algorithm: Algorithm,
    pub token: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub state: ChallengeState,
}

impl Challenge {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Creates, tracks and retires domain-validation challenges
///
/// Records live in the shared [`KvStore`] under `challenges/<id>`; each
/// record is written atomically and no lock spans more than one record, so
/// challenges for different domains never contend. Clones share the store.
#[derive(Debug, Clone)]
pub struct ChallengeManager {
    store: Arc<dyn KvStore>,
    ttl: Duration,
    path_prefix: String,
}

impl ChallengeManager {
    /// Manager with the default one-hour TTL
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self::with_config(store, &ChallengeConfig::default())
    }

    pub fn with_config(store: Arc<dyn KvStore>, config: &ChallengeConfig) -> Self {
        let ttl = i64::try_from(config.ttl_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or_else(|| Duration::hours(1));
        Self {
            store,
            ttl,
            path_prefix: config.path_prefix.clone(),
        }
    }

    fn key(id: &ChallengeId) -> String {
        format!("challenges/{}", id)
    }

    /// Register a new pending challenge for `domain`
    pub fn create_challenge(
        &self,
        domain: &str,
        email: Option<String>,
        algorithm: Algorithm,
    ) -> Result<Challenge> {
        validate_domain(domain)?;

        let now = Utc::now();
        let challenge = Challenge {
            id: ChallengeId::new(),
            domain: domain.to_ascii_lowercase(),
            email,
            algorithm,
            token: generate_token(),
            created_at: now,
            expires_at: now + self.ttl,
            state: ChallengeState::Pending,
        };

        put_json(self.store.as_ref(), &Self::key(&challenge.id), &challenge)?;

        info!(
            challenge_id = %challenge.id,
            domain = %challenge.domain,
            algorithm = %challenge.algorithm,
            expires_at = %challenge.expires_at,
            "Created domain-validation challenge"
        );
        Ok(challenge)
    }

    fn load(&self, id: &ChallengeId) -> Result<Challenge> {
        get_json(self.store.as_ref(), &Self::key(id))?
            .ok_or_else(|| PqcertError::ChallengeNotFound(id.to_string()))
    }

    /// Fetch a live challenge; expiry is evaluated on every read
    pub fn get_challenge(&self, id: &ChallengeId) -> Result<Challenge> {
        let challenge = self.load(id)?;
        if challenge.is_expired() {
            debug!(challenge_id = %id, "Challenge read after expiry");
            return Err(PqcertError::ChallengeExpired(id.to_string()));
        }
        trace!(challenge_id = %id, state = ?challenge.state, "Loaded challenge");
        Ok(challenge)
    }

    /// Record a successful validation (Pending → Verified)
    pub fn mark_verified(&self, id: &ChallengeId) -> Result<Challenge> {
        let mut challenge = self.get_challenge(id)?;
        match challenge.state {
            ChallengeState::Pending => {
                challenge.state = ChallengeState::Verified;
                put_json(self.store.as_ref(), &Self::key(id), &challenge)?;
                debug!(challenge_id = %id, domain = %challenge.domain, "Challenge verified");
            }
            ChallengeState::Verified => {}
            ChallengeState::Consumed => return Err(PqcertError::ChallengeNotFound(id.to_string())),
            ChallengeState::Expired => return Err(PqcertError::ChallengeExpired(id.to_string())),
        }
        Ok(challenge)
    }

    /// Retire a verified challenge (Verified → Consumed) and delete it
    ///
    /// The record removal is the commit point: with concurrent callers only
    /// the one whose removal succeeds wins, the rest see `ChallengeNotFound`.
    pub fn consume_challenge(&self, id: &ChallengeId) -> Result<Challenge> {
        let mut challenge = self.load(id)?;
        if challenge.state != ChallengeState::Verified {
            return Err(PqcertError::ChallengeNotVerified(id.to_string()));
        }

        if !self.store.remove(&Self::key(id))? {
            return Err(PqcertError::ChallengeNotFound(id.to_string()));
        }

        challenge.state = ChallengeState::Consumed;
        debug!(challenge_id = %id, domain = %challenge.domain, "Challenge consumed");
        Ok(challenge)
    }

    /// Remove every expired challenge, returning how many were removed
    pub fn sweep_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let mut removed = 0;

        for key in self.store.list("challenges/")? {
            let challenge: Challenge = match get_json(self.store.as_ref(), &key) {
                Ok(Some(c)) => c,
                Ok(None) => continue,
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping unreadable challenge record");
                    continue;
                }
            };
            if challenge.is_expired_at(now) && self.store.remove(&key)? {
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, "Swept expired challenges");
        }
        Ok(removed)
    }

    /// Number of live challenges still awaiting validation
    pub fn pending_count(&self) -> Result<usize> {
        let now = Utc::now();
        let mut count = 0;
        for key in self.store.list("challenges/")? {
            if let Some(c) = get_json::<Challenge>(self.store.as_ref(), &key)? {
                if c.state == ChallengeState::Pending && !c.is_expired_at(now) {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    /// URL at which the token must be published
    pub fn challenge_url(&self, domain: &str, token: &str) -> String {
        format!("http://{}{}{}", domain, self.path_prefix, token)
    }

    pub fn path_prefix(&self) -> &str {
        &self.path_prefix
    }

    /// Token from a challenge request path under this manager's prefix
    pub fn extract_token<'a>(&self, path: &'a str) -> Option<&'a str> {
        path.strip_prefix(self.path_prefix.as_str())
            .filter(|token| !token.is_empty() && !token.contains('/'))
    }
}

/// 256-bit token from the OS CSPRNG, base64url without padding
fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
