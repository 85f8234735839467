//! Bearer-token verification at the edge.
//!
//! Tokens come from an upstream identity provider as
//! `base64(claims-json) "." base64(hmac-sha256(secret, claims-b64))`. The
//! plane trusts the `(sub, sid)` claims once the signature verifies.
//! Verified claims are cached per token with TTL = min(remaining lifetime,
//! 60 s); the `jti` blacklist is consulted on every request so revocation
//! takes effect immediately.

// URL-safe alphabet: tokens also travel in `?token=` query parameters for
// WebSocket upgrades, where `+` and `/` would not survive.
use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tandem_core::{Fault, FaultKind};
use tandem_substrate::Substrate;

type HmacSha256 = Hmac<Sha256>;

/// Cap on how long a verified token stays cached.
const CACHE_CAP_SECS: u64 = 60;

/// Claims carried by a bearer token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user id).
    pub sub: String,
    /// Session scope, when the token is session-bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    /// Token id, the blacklist key.
    pub jti: String,
    /// Expiry, unix seconds.
    pub exp: u64,
}

/// Deterministic hashed identifier for cache keys (never stores the raw
/// token or subject in a key).
pub fn cache_identifier(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(b"|");
    }
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Clone)]
pub struct TokenVerifier {
    substrate: Substrate,
    secret: String,
}

impl TokenVerifier {
    pub fn new(substrate: Substrate, secret: impl Into<String>) -> Self {
        Self {
            substrate,
            secret: secret.into(),
        }
    }

    /// Mint a token for the given claims. The identity provider owns this
    /// in production; the gateway exposes it for tests and dev tooling.
    pub fn issue(&self, claims: &Claims) -> String {
        let body = BASE64.encode(serde_json::to_vec(claims).unwrap_or_default());
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("hmac accepts any key size");
        mac.update(body.as_bytes());
        let sig = BASE64.encode(mac.finalize().into_bytes());
        format!("{body}.{sig}")
    }

    /// Verify a bearer token and return its claims.
    pub async fn verify(&self, token: &str) -> Result<Claims, Fault> {
        let claims = match self.cached(token).await {
            Some(claims) => claims,
            None => {
                let claims = self.verify_signature(token)?;
                self.cache(token, &claims).await;
                claims
            }
        };

        if claims.exp <= now_secs() {
            return Err(Fault::new(FaultKind::Unauthorized, "token expired"));
        }
        if self
            .substrate
            .exists(&format!("revoked:{}", claims.jti))
            .await
            .map_err(Fault::from)?
        {
            return Err(Fault::new(FaultKind::Unauthorized, "token revoked"));
        }
        Ok(claims)
    }

    /// Blacklist a token until its natural expiry.
    pub async fn revoke(&self, claims: &Claims) -> Result<(), Fault> {
        let remaining = claims.exp.saturating_sub(now_secs());
        if remaining == 0 {
            return Ok(());
        }
        self.substrate
            .set_ttl(
                &format!("revoked:{}", claims.jti),
                "1",
                std::time::Duration::from_secs(remaining),
            )
            .await
            .map_err(Fault::from)
    }

    fn verify_signature(&self, token: &str) -> Result<Claims, Fault> {
        let (body, sig) = token
            .split_once('.')
            .ok_or_else(|| Fault::new(FaultKind::Unauthorized, "malformed token"))?;
        let sig_bytes = BASE64
            .decode(sig.as_bytes())
            .map_err(|_| Fault::new(FaultKind::Unauthorized, "malformed token signature"))?;

        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("hmac accepts any key size");
        mac.update(body.as_bytes());
        mac.verify_slice(&sig_bytes)
            .map_err(|_| Fault::new(FaultKind::Unauthorized, "bad token signature"))?;

        let claims_bytes = BASE64
            .decode(body.as_bytes())
            .map_err(|_| Fault::new(FaultKind::Unauthorized, "malformed token body"))?;
        serde_json::from_slice(&claims_bytes)
            .map_err(|_| Fault::new(FaultKind::Unauthorized, "malformed token claims"))
    }

    async fn cached(&self, token: &str) -> Option<Claims> {
        let key = format!("cache:auth:{}", cache_identifier(&[token]));
        let payload = self.substrate.get(&key).await.ok()??;
        serde_json::from_str(&payload).ok()
    }

    async fn cache(&self, token: &str, claims: &Claims) {
        let remaining = claims.exp.saturating_sub(now_secs());
        let ttl = remaining.min(CACHE_CAP_SECS);
        if ttl == 0 {
            return;
        }
        let key = format!("cache:auth:{}", cache_identifier(&[token]));
        if let Ok(payload) = serde_json::to_string(claims) {
            let _ = self
                .substrate
                .set_ttl(&key, &payload, std::time::Duration::from_secs(ttl))
                .await;
        }
    }
}

pub(crate) fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
