//! Token signing.
//!
//! [`TokenSigner`] is the seam between the pool writer and the key
//! material. Each pool owns one signer built from its configuration.

use std::fmt;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ed25519_dalek::{Signer as _, SigningKey, VerifyingKey};
use serde::Serialize;

use crate::config::SignerConfig;
use crate::domain::token::TOKEN_TYPE;
use crate::error::ServiceError;

/// Shared handle to a [`TokenSigner`].
pub type SharedSigner = Arc<dyn TokenSigner>;

/// Produces signed status list tokens.
pub trait TokenSigner: Send + Sync + fmt::Debug {
    /// JWS `alg` of the produced tokens.
    fn algorithm(&self) -> &'static str;

    /// Signs `claims` and returns the serialized token.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Signing`] if the claims cannot be serialized
    /// or signed.
    fn sign(&self, claims: &serde_json::Value) -> Result<String, ServiceError>;
}

#[derive(Serialize)]
struct JwsHeader<'a> {
    alg: &'a str,
    typ: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    kid: Option<&'a str>,
}

/// Ed25519 signer producing compact JWS (`alg: EdDSA`).
pub struct Ed25519JwtSigner {
    key: SigningKey,
    kid: Option<String>,
}

impl fmt::Debug for Ed25519JwtSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ed25519JwtSigner")
            .field("verifying_key", &URL_SAFE_NO_PAD.encode(self.key.verifying_key().as_bytes()))
            .field("kid", &self.kid)
            .finish()
    }
}

impl Ed25519JwtSigner {
    /// Creates a signer from a 32-byte secret key.
    #[must_use]
    pub fn new(secret: &[u8; 32], kid: Option<String>) -> Self {
        Self {
            key: SigningKey::from_bytes(secret),
            kid,
        }
    }

    /// Builds the signer described by a pool's signer configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Config`] if `key_seed` is not base64url of
    /// exactly 32 bytes.
    pub fn from_config(config: &SignerConfig) -> Result<Self, ServiceError> {
        let seed = URL_SAFE_NO_PAD
            .decode(config.key_seed.trim())
            .map_err(|e| ServiceError::Config(format!("signer key_seed: {e}")))?;
        let secret: [u8; 32] = seed.try_into().map_err(|bytes: Vec<u8>| {
            ServiceError::Config(format!(
                "signer key_seed must be 32 bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self::new(&secret, config.kid.clone()))
    }

    /// Public key verifiers use to check tokens.
    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }
}

impl TokenSigner for Ed25519JwtSigner {
    fn algorithm(&self) -> &'static str {
        "EdDSA"
    }

    fn sign(&self, claims: &serde_json::Value) -> Result<String, ServiceError> {
        let header = JwsHeader {
            alg: self.algorithm(),
            typ: TOKEN_TYPE,
            kid: self.kid.as_deref(),
        };
        let header = serde_json::to_vec(&header)
            .map_err(|e| ServiceError::Signing(format!("header: {e}")))?;
        let payload =
            serde_json::to_vec(claims).map_err(|e| ServiceError::Signing(format!("claims: {e}")))?;

        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header),
            URL_SAFE_NO_PAD.encode(payload)
        );
        let signature = self.key.sign(signing_input.as_bytes());
        Ok(format!(
            "{signing_input}.{}",
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        ))
    }
}
