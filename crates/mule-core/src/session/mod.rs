//! Worker session tokens.
//!
//! Registration hands a worker an HMAC-SHA256 token scoped to its worker
//! id. Format: `mule_wk_<worker_id>_<hmac_hex>`. Every later call on the
//! worker surface presents the token; validation recomputes the HMAC and
//! compares in constant time.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Token prefix used to identify mule worker session tokens.
const TOKEN_PREFIX: &str = "mule_wk_";

/// Errors that can occur during session token operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid session token format: {0}")]
    InvalidFormat(String),

    #[error("session token HMAC verification failed")]
    HmacMismatch,

    #[error("missing session secret")]
    MissingSecret,
}

/// Configuration for session token generation and validation.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// The HMAC secret key bytes.
    pub secret: Vec<u8>,
}

impl SessionConfig {
    /// Create a new SessionConfig with the given secret.
    pub fn new(secret: Vec<u8>) -> Self {
        Self { secret }
    }

    /// Create a SessionConfig from the `MULE_TOKEN_SECRET` environment
    /// variable (hex-encoded, as written by `mule init`).
    pub fn from_env() -> Result<Self, SessionError> {
        let secret_hex =
            std::env::var("MULE_TOKEN_SECRET").map_err(|_| SessionError::MissingSecret)?;
        let secret = hex::decode(&secret_hex).map_err(|e| {
            SessionError::InvalidFormat(format!("MULE_TOKEN_SECRET is not valid hex: {e}"))
        })?;
        Ok(Self::new(secret))
    }
}

/// Claims extracted from a validated session token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionClaims {
    /// The worker id this session is scoped to.
    pub worker_id: String,
}

/// Issue a session token for a worker.
pub fn issue_token(config: &SessionConfig, worker_id: &str) -> String {
    let mac = compute_hmac(&config.secret, worker_id.as_bytes());
    let hmac_hex = hex::encode(mac);
    format!("{TOKEN_PREFIX}{worker_id}_{hmac_hex}")
}

/// Validate a session token and extract its claims.
///
/// Parses the format, recomputes the HMAC over the embedded worker id,
/// and verifies it with a constant-time comparison.
pub fn validate_token(config: &SessionConfig, token: &str) -> Result<SessionClaims, SessionError> {
    let rest = token.strip_prefix(TOKEN_PREFIX).ok_or_else(|| {
        SessionError::InvalidFormat("token must start with 'mule_wk_'".to_owned())
    })?;

    // Worker ids may contain underscores, so split from the right: the
    // final segment is the hex HMAC.
    let (worker_id, hmac_hex) = rest.rsplit_once('_').ok_or_else(|| {
        SessionError::InvalidFormat("expected underscore before hmac".to_owned())
    })?;

    if worker_id.is_empty() {
        return Err(SessionError::InvalidFormat("empty worker id".to_owned()));
    }

    let provided_mac = hex::decode(hmac_hex)
        .map_err(|e| SessionError::InvalidFormat(format!("invalid hex in hmac: {e}")))?;

    verify_hmac_constant_time(&config.secret, worker_id.as_bytes(), &provided_mac)?;

    Ok(SessionClaims {
        worker_id: worker_id.to_owned(),
    })
}

/// Compute HMAC-SHA256 over the given message with the given key.
fn compute_hmac(key: &[u8], message: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

/// Verify HMAC using constant-time comparison.
fn verify_hmac_constant_time(
    key: &[u8],
    message: &[u8],
    expected_mac: &[u8],
) -> Result<(), SessionError> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(message);
    mac.verify_slice(expected_mac)
        .map_err(|_| SessionError::HmacMismatch)
}
