//! EdDSA JWT signing and verification.

use anyhow::{Context, Result, anyhow};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use ed25519_dalek::{SigningKey, pkcs8::EncodePrivateKey};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::debug;

use super::claims::Claims;
use crate::hash::random_bytes;

/// Signs and verifies the JWTs minted by the token endpoint.
pub trait TokenSigner: Send + Sync {
    /// # Errors
    /// Returns an error if encoding fails.
    fn sign(&self, claims: &Claims) -> Result<String>;

    /// Verify signature and expiry. `issuer` and `audience` are checked when
    /// given.
    ///
    /// # Errors
    /// Returns an error for any invalid token.
    fn verify(&self, token: &str, issuer: Option<&str>, audience: Option<&str>) -> Result<Claims>;

    fn kid(&self) -> &str;
}

/// Ed25519 signer holding a single key.
pub struct JwtSigner {
    kid: String,
    encoding: EncodingKey,
    decoding: DecodingKey,
    public_key: [u8; 32],
}

impl JwtSigner {
    /// # Errors
    /// Returns an error if the seed cannot be encoded as PKCS#8.
    pub fn from_seed(seed: &[u8; 32], kid: Option<&str>) -> Result<Self> {
        let signing_key = SigningKey::from_bytes(seed);
        let der = signing_key
            .to_pkcs8_der()
            .map_err(|err| anyhow!("encode Ed25519 key: {err}"))?;
        let public_key = signing_key.verifying_key().to_bytes();
        let decoding = DecodingKey::from_ed_components(&URL_SAFE_NO_PAD.encode(public_key))
            .context("failed to build EdDSA decoding key")?;
        let kid = kid
            .map(str::trim)
            .filter(|kid| !kid.is_empty())
            .map_or_else(|| derive_kid(&public_key), str::to_string);
        Ok(Self {
            kid,
            encoding: EncodingKey::from_ed_der(der.as_bytes()),
            decoding,
            public_key,
        })
    }

    /// Ephemeral key; tokens do not survive a restart.
    ///
    /// # Errors
    /// Returns an error if the system RNG fails.
    pub fn generate(kid: Option<&str>) -> Result<Self> {
        let bytes = random_bytes(32)?;
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .context("unexpected seed length")?;
        Self::from_seed(&seed, kid)
    }

    /// Load a base64url (no padding) 32-byte seed from `path`.
    ///
    /// # Errors
    /// Returns an error if the file is unreadable or not a valid seed.
    pub fn from_file(path: &Path, kid: Option<&str>) -> Result<Self> {
        let encoded = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read signing key {}", path.display()))?;
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded.trim())
            .context("signing key is not base64url")?;
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow!("signing key must be a 32-byte Ed25519 seed"))?;
        debug!("Loaded signing key from {}", path.display());
        Self::from_seed(&seed, kid)
    }

    #[must_use]
    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }
}

impl std::fmt::Debug for JwtSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtSigner").field("kid", &self.kid).finish()
    }
}

fn derive_kid(public_key: &[u8; 32]) -> String {
    let digest = URL_SAFE_NO_PAD.encode(Sha256::digest(public_key));
    digest.chars().take(16).collect()
}

impl TokenSigner for JwtSigner {
    fn sign(&self, claims: &Claims) -> Result<String> {
        let mut header = Header::new(Algorithm::EdDSA);
        header.kid = Some(self.kid.clone());
        jsonwebtoken::encode(&header, claims, &self.encoding).context("failed to sign token")
    }

    fn verify(&self, token: &str, issuer: Option<&str>, audience: Option<&str>) -> Result<Claims> {
        let mut validation = Validation::new(Algorithm::EdDSA);
        validation.leeway = 0;
        match audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }
        if let Some(issuer) = issuer {
            validation.set_issuer(&[issuer]);
        }
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding, &validation)
            .context("token verification failed")?;
        Ok(data.claims)
    }

    fn kid(&self) -> &str {
        &self.kid
    }
}

/// Compact JWS shape: three non-empty dot separated segments.
#[must_use]
pub fn looks_like_jwt(token: &str) -> bool {
    let mut parts = token.split('.');
    let shaped = parts.by_ref().take(3).filter(|part| !part.is_empty()).count() == 3;
    shaped && parts.next().is_none()
}
