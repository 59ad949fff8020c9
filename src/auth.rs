use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha2::{Digest, Sha256};

use crate::error::ChatError;

/// Identity attached to a connection after a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthClaims {
    pub subject: String,
    pub email: String,
}

/// Raw credential material collected during the websocket handshake.
/// Token sources are consulted in priority order: the Authorization
/// header, then the handshake auth payload, then the raw query token.
#[derive(Debug, Clone, Default)]
pub struct Handshake {
    pub authorization: Option<String>,
    pub auth_token: Option<String>,
    pub query_token: Option<String>,
}

fn strip_bearer(value: &str) -> Option<&str> {
    let mut parts = value.splitn(2, ' ');
    match (parts.next(), parts.next()) {
        (Some("Bearer"), Some(token)) => Some(token),
        _ => None,
    }
}

impl Handshake {
    /// Extracts the bearer token, if any. Header and auth payload must use
    /// the `Bearer <token>` form; the query parameter is taken verbatim.
    pub fn bearer_token(&self) -> Option<&str> {
        if let Some(token) = self.authorization.as_deref().and_then(strip_bearer) {
            return Some(token);
        }
        if let Some(token) = self.auth_token.as_deref().and_then(strip_bearer) {
            return Some(token);
        }
        self.query_token.as_deref()
    }
}

/// Token verification collaborator. Issuance lives outside this crate;
/// deployments provide their own implementation.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<AuthClaims, ChatError>;
}

/// Shared-secret verifier: tokens are `subject.email_b64.sig_b64` with
/// `sig = sha256(secret | subject | email)`. Enough for development and
/// tests; production substitutes a real verifier behind the trait.
pub struct SharedSecretVerifier {
    secret: String,
}

impl SharedSecretVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        SharedSecretVerifier {
            secret: secret.into(),
        }
    }

    fn signature(&self, subject: &str, email: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.secret.as_bytes());
        hasher.update(b"|");
        hasher.update(subject.as_bytes());
        hasher.update(b"|");
        hasher.update(email.as_bytes());
        BASE64.encode(hasher.finalize())
    }

    /// Issues a token for the given identity. Used by tests and dev
    /// tooling; real token issuance is an external concern.
    pub fn issue(&self, subject: &str, email: &str) -> String {
        format!(
            "{subject}.{}.{}",
            BASE64.encode(email.as_bytes()),
            self.signature(subject, email)
        )
    }
}

#[async_trait]
impl TokenVerifier for SharedSecretVerifier {
    async fn verify(&self, token: &str) -> Result<AuthClaims, ChatError> {
        let mut parts = token.splitn(3, '.');
        let (Some(subject), Some(email_b64), Some(sig)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(ChatError::InvalidToken);
        };
        let email_bytes = BASE64.decode(email_b64).map_err(|_| ChatError::InvalidToken)?;
        let email = String::from_utf8(email_bytes).map_err(|_| ChatError::InvalidToken)?;
        if sig != self.signature(subject, &email) {
            return Err(ChatError::InvalidToken);
        }
        Ok(AuthClaims {
            subject: subject.to_string(),
            email,
        })
    }
}
