//! Caller identity resolution.
//!
//! Every request resolves to exactly one **subject**, identified by a stable
//! key of the form `<type>:<value>`. The subject key is used in:
//!
//! - rate-limit metric tags (by type only, never by identity)
//! - the `api_client_policy.client_key` column
//! - subject-scoped cache keys
//!
//! # Resolve Order
//!
//! Resolution stops at the first success:
//!
//! 1. `X-Api-Key` header -> `apiKey:<hex-hash>`. The raw key is hashed with a
//!    server-side pepper; the raw value never leaves this module. The key
//!    resolves to its own bucket whether or not a matching credential exists,
//!    so unknown-but-present keys are still rate-limited individually.
//! 2. `X-User-Id` / `X-User` header (transport principal) -> `user:<name>`
//! 3. `X-Forwarded-For` (first entry) / `X-Real-IP` / transport peer address
//!    -> `ip:<addr>`
//! 4. `unknown:unknown`
//!
//! # Security Warning: IP Spoofing
//!
//! The IP fallback trusts client-provided headers. Deploy behind a reverse
//! proxy that overwrites `X-Forwarded-For`, and block direct access;
//! otherwise clients can rotate spoofed addresses to dodge per-IP buckets.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::HeaderMap;
use sha2::{Digest, Sha256, Sha512};
use tracing::warn;

use crate::config::HashAlgorithm;
use crate::credentials::CredentialLookup;
use crate::support::to_hex;

/// Header carrying the raw API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Headers carrying the authenticated principal name.
pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_HEADER: &str = "x-user";

/// Subject key used when nothing resolves.
pub const UNKNOWN_SUBJECT_KEY: &str = "unknown:unknown";

/// Discriminator of a resolved subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubjectType {
    ApiKey,
    User,
    Ip,
    Unknown,
}

impl SubjectType {
    /// Low-cardinality tag used in metrics and limiter keys.
    pub fn tag(self) -> &'static str {
        match self {
            SubjectType::ApiKey => "apiKey",
            SubjectType::User => "user",
            SubjectType::Ip => "ip",
            SubjectType::Unknown => "unknown",
        }
    }
}

/// The resolved caller identity for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSubject {
    pub subject_type: SubjectType,
    /// Stable `<type>:<value>` key.
    pub subject_key: String,
    /// Whether an API key resolved to an active credential. Unknown keys
    /// still get their own subject key.
    pub known_api_key: bool,
}

impl ResolvedSubject {
    pub fn unknown() -> Self {
        Self {
            subject_type: SubjectType::Unknown,
            subject_key: UNKNOWN_SUBJECT_KEY.to_string(),
            known_api_key: false,
        }
    }
}

/// Salted digest over raw API keys. Only the hex hash is ever stored or
/// compared.
#[derive(Clone)]
pub struct ApiKeyHasher {
    pepper: String,
    algorithm: HashAlgorithm,
}

impl ApiKeyHasher {
    pub fn new(pepper: impl Into<String>, algorithm: HashAlgorithm) -> Self {
        Self {
            pepper: pepper.into(),
            algorithm,
        }
    }

    /// Hash a raw API key: `H(raw + ":" + pepper)`, lowercase hex.
    pub fn hash(&self, raw_api_key: &str) -> String {
        let input = format!("{raw_api_key}:{}", self.pepper);
        match self.algorithm {
            HashAlgorithm::Sha256 => to_hex(&Sha256::digest(input.as_bytes())),
            HashAlgorithm::Sha512 => to_hex(&Sha512::digest(input.as_bytes())),
        }
    }
}

/// Resolves the caller identity from request context.
pub struct SubjectResolver {
    hasher: ApiKeyHasher,
    credentials: Arc<CredentialLookup>,
}

impl SubjectResolver {
    pub fn new(hasher: ApiKeyHasher, credentials: Arc<CredentialLookup>) -> Self {
        Self {
            hasher,
            credentials,
        }
    }

    /// Resolve the subject for a request. Never fails: lookup errors degrade
    /// to `known_api_key = false` and resolution falls through the chain.
    pub async fn resolve(
        &self,
        headers: &HeaderMap,
        peer_addr: Option<SocketAddr>,
    ) -> ResolvedSubject {
        // 1) API key (preferred)
        if let Some(raw_key) = trimmed_header(headers, API_KEY_HEADER) {
            let hash = self.hasher.hash(raw_key);
            let known = match self.credentials.find_active_by_hash(&hash).await {
                Ok(found) => found.is_some(),
                Err(e) => {
                    warn!(error = %e, "Credential lookup failed; treating API key as unknown");
                    false
                }
            };
            return ResolvedSubject {
                subject_type: SubjectType::ApiKey,
                subject_key: format!("apiKey:{hash}"),
                known_api_key: known,
            };
        }

        // 2) Authenticated principal
        if let Some(user) =
            trimmed_header(headers, USER_ID_HEADER).or_else(|| trimmed_header(headers, USER_HEADER))
        {
            return ResolvedSubject {
                subject_type: SubjectType::User,
                subject_key: format!("user:{user}"),
                known_api_key: false,
            };
        }

        // 3) IP fallback
        if let Some(ip) = extract_client_ip(headers, peer_addr) {
            return ResolvedSubject {
                subject_type: SubjectType::Ip,
                subject_key: format!("ip:{ip}"),
                known_api_key: false,
            };
        }

        ResolvedSubject::unknown()
    }
}

/// Read a header as a trimmed, non-empty string.
fn trimmed_header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Extract the client IP from proxy headers, falling back to the transport
/// peer address.
///
/// `X-Forwarded-For` may contain `"client, proxy1, proxy2"` - only the first
/// (client) entry is used.
fn extract_client_ip(headers: &HeaderMap, peer_addr: Option<SocketAddr>) -> Option<String> {
    if let Some(forwarded) = trimmed_header(headers, "x-forwarded-for")
        && let Some(first) = forwarded.split(',').next()
    {
        let first = first.trim();
        if !first.is_empty() {
            return Some(first.to_string());
        }
    }

    if let Some(real_ip) = trimmed_header(headers, "x-real-ip") {
        return Some(real_ip.to_string());
    }

    peer_addr.map(|addr| addr.ip().to_string())
}
