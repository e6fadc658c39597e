//! Session gate: bearer-token authentication with a revocation denylist.
//!
//! Tokens are compact HS256 JWTs (`header.payload.signature`, base64url
//! without padding). Before verifying a token the gate asks the
//! [`RevocationStore`]; a revoked token is treated as replayed after logout
//! and the caller is told to clear its session cookie.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use devroom_sdk::SenderInfo;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

/// Name of the session cookie.
pub const SESSION_COOKIE: &str = "token";

/// Longest a revocation is remembered, whatever the token's expiry says.
const MAX_REVOCATION_TTL: Duration = Duration::from_secs(10 * 365 * 24 * 3600);

/// Decoded token claims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Participant id.
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Issued-at, seconds since the epoch.
    pub iat: i64,
    /// Expiry, seconds since the epoch.
    pub exp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthFailure {
    #[error("no credentials")]
    Missing,
    #[error("token has been revoked")]
    Revoked,
    #[error("malformed token")]
    Malformed,
    #[error("bad signature")]
    BadSignature,
    #[error("token expired")]
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unauthorized: {reason}")]
pub struct Unauthorized {
    pub reason: AuthFailure,
    /// The caller's session cookie must be cleared.
    pub clear_cookie: bool,
}

impl Identity {
    /// How this participant appears on messages.
    pub fn sender_info(&self) -> SenderInfo {
        SenderInfo {
            id: self.sub.clone(),
            email: self.email.clone(),
        }
    }
}

impl From<AuthFailure> for Unauthorized {
    fn from(reason: AuthFailure) -> Self {
        Self {
            reason,
            clear_cookie: reason == AuthFailure::Revoked,
        }
    }
}

/// Where a request's credentials came from.
#[derive(Debug, Clone, Copy, Default)]
pub struct CredentialSource<'a> {
    /// Value of the session cookie.
    pub cookie: Option<&'a str>,
    /// Raw `Authorization` header value.
    pub authorization: Option<&'a str>,
}

impl<'a> CredentialSource<'a> {
    pub fn from_authorization(header: &'a str) -> Self {
        Self {
            cookie: None,
            authorization: Some(header),
        }
    }

    /// The token to check: the cookie wins over the Authorization header.
    pub fn token(&self) -> Option<&'a str> {
        if let Some(cookie) = self.cookie.map(str::trim).filter(|c| !c.is_empty()) {
            return Some(cookie);
        }
        let header = self.authorization?.trim();
        let (scheme, token) = header.split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }
        Some(token.trim()).filter(|t| !t.is_empty())
    }
}

/// Denylist of revoked tokens.
#[async_trait]
pub trait RevocationStore: Send + Sync {
    async fn is_revoked(&self, token: &str) -> bool;
    /// Remember `token` as revoked for `ttl`.
    async fn revoke(&self, token: &str, ttl: Duration);
}

/// In-process revocation store. Entries vanish once their TTL lapses.
#[derive(Default)]
pub struct MemoryRevocationStore {
    entries: parking_lot::Mutex<HashMap<String, Instant>>,
}

impl MemoryRevocationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.purge();
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn purge(&self) {
        let now = Instant::now();
        self.entries.lock().retain(|_, until| *until > now);
    }
}

#[async_trait]
impl RevocationStore for MemoryRevocationStore {
    async fn is_revoked(&self, token: &str) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(token) {
            Some(until) if *until > Instant::now() => true,
            Some(_) => {
                entries.remove(token);
                false
            }
            None => false,
        }
    }

    async fn revoke(&self, token: &str, ttl: Duration) {
        self.purge();
        self.entries
            .lock()
            .insert(token.to_string(), Instant::now() + ttl.min(MAX_REVOCATION_TTL));
    }
}

#[derive(Serialize, Deserialize)]
struct Header {
    alg: String,
    typ: String,
}

pub struct SessionGate {
    secret: Vec<u8>,
    revocations: Arc<dyn RevocationStore>,
}

impl SessionGate {
    pub fn new(secret: impl AsRef<[u8]>, revocations: Arc<dyn RevocationStore>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
            revocations,
        }
    }

    /// Issue a token for `subject` valid for `ttl` from now.
    pub fn issue(&self, subject: &str, email: Option<&str>, ttl: Duration) -> String {
        let iat = chrono::Utc::now().timestamp();
        self.sign(&Identity {
            sub: subject.to_string(),
            email: email.map(str::to_string),
            iat,
            exp: iat.saturating_add(i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX)),
        })
    }

    /// Sign arbitrary claims.
    pub fn sign(&self, claims: &Identity) -> String {
        let header = Header {
            alg: "HS256".to_string(),
            typ: "JWT".to_string(),
        };
        let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header).unwrap_or_default());
        let payload_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).unwrap_or_default());
        let signing_input = format!("{header_b64}.{payload_b64}");
        let signature = URL_SAFE_NO_PAD.encode(self.mac(signing_input.as_bytes()).finalize().into_bytes());
        format!("{signing_input}.{signature}")
    }

    fn mac(&self, input: &[u8]) -> Hmac<Sha256> {
        let mut mac = match Hmac::<Sha256>::new_from_slice(&self.secret) {
            Ok(mac) => mac,
            Err(_) => unreachable!("HMAC-SHA256 accepts any key length"),
        };
        mac.update(input);
        mac
    }

    /// Check signature, shape and expiry. Does not consult the revocation store.
    pub fn verify(&self, token: &str) -> Result<Identity, AuthFailure> {
        let mut parts = token.split('.');
        let (Some(header_b64), Some(payload_b64), Some(signature_b64), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(AuthFailure::Malformed);
        };

        let header: Header = URL_SAFE_NO_PAD
            .decode(header_b64)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .ok_or(AuthFailure::Malformed)?;
        if header.alg != "HS256" {
            return Err(AuthFailure::Malformed);
        }

        let signature = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| AuthFailure::Malformed)?;
        let signing_input = &token[..header_b64.len() + 1 + payload_b64.len()];
        self.mac(signing_input.as_bytes())
            .verify_slice(&signature)
            .map_err(|_| AuthFailure::BadSignature)?;

        let claims: Identity = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .ok_or(AuthFailure::Malformed)?;
        if claims.exp <= chrono::Utc::now().timestamp() {
            return Err(AuthFailure::Expired);
        }
        Ok(claims)
    }

    /// Authenticate a request. Terminal on failure; never retried.
    pub async fn authenticate(&self, source: CredentialSource<'_>) -> Result<Identity, Unauthorized> {
        let token = source.token().ok_or(AuthFailure::Missing)?;
        if self.revocations.is_revoked(token).await {
            tracing::warn!("Rejected revoked token");
            return Err(AuthFailure::Revoked.into());
        }
        self.verify(token).map_err(|reason| {
            tracing::debug!(%reason, "Rejected token");
            Unauthorized::from(reason)
        })
    }

    /// Log a token out: it stays denylisted until it would have expired anyway.
    pub async fn revoke(&self, token: &str) -> Result<Identity, Unauthorized> {
        let identity = self.verify(token)?;
        let remaining = identity.exp - chrono::Utc::now().timestamp();
        if remaining > 0 {
            self.revocations
                .revoke(token, Duration::from_secs(remaining as u64))
                .await;
            tracing::info!(participant = %identity.sub, "Session revoked");
        }
        Ok(identity)
    }
}
