//! # Credential Signature Verification
//!
//! Local signature checks for cached credentials. Payloads are compact JWS
//! tokens (`header.payload.signature`, base64url without padding) signed
//! with Ed25519 by a trusted issuer.
//!
//! Issuer keys are provisioned on the device ahead of time; nothing here
//! touches the network.

use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;

use shared::{
    digest::matches_sha256,
    error::{IdentityError, IdentityResult},
    types::{CachedCredential, SignatureAlgorithm},
};

/// Checks the signature carried by a cached credential
pub trait CredentialSignatureVerifier: Send + Sync {
    fn verify(&self, credential: &CachedCredential) -> IdentityResult<()>;
}

#[derive(Debug, Deserialize)]
struct JwsHeader {
    alg: String,
    #[serde(default)]
    kid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JwsClaims {
    #[serde(default)]
    iss: Option<String>,
}

struct TrustedKey {
    kid: Option<String>,
    key: VerifyingKey,
}

/// Ed25519 compact JWS verifier over a set of trusted issuer keys
#[derive(Default)]
pub struct Ed25519JwsVerifier {
    issuers: RwLock<HashMap<String, Vec<TrustedKey>>>,
}

impl Ed25519JwsVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `issuer=hex,issuer=hex`
    pub fn from_spec(spec: &str) -> IdentityResult<Self> {
        let verifier = Self::new();
        for item in spec.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (issuer, key_hex) = item.rsplit_once('=').ok_or_else(|| {
                IdentityError::ConfigurationError(format!("expected 'issuer=hex', got '{}'", item))
            })?;
            verifier.trust_hex(issuer.trim(), key_hex.trim())?;
        }
        Ok(verifier)
    }

    pub fn trust(&self, issuer: impl Into<String>, key: VerifyingKey) {
        self.insert(issuer.into(), None, key);
    }

    /// Trust a key that only verifies tokens carrying the matching `kid`
    pub fn trust_with_kid(
        &self,
        issuer: impl Into<String>,
        kid: impl Into<String>,
        key: VerifyingKey,
    ) {
        self.insert(issuer.into(), Some(kid.into()), key);
    }

    pub fn trust_hex(&self, issuer: &str, public_key_hex: &str) -> IdentityResult<()> {
        let bytes = hex::decode(public_key_hex)?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| IdentityError::InvalidKey("public key must be 32 bytes".into()))?;
        let key = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| IdentityError::InvalidKey(format!("invalid public key: {}", e)))?;
        self.trust(issuer, key);
        Ok(())
    }

    pub fn issuer_count(&self) -> usize {
        self.issuers.read().len()
    }

    fn insert(&self, issuer: String, kid: Option<String>, key: VerifyingKey) {
        debug!(issuer = %issuer, kid = ?kid, "Trusting issuer key");
        self.issuers
            .write()
            .entry(issuer)
            .or_default()
            .push(TrustedKey { kid, key });
    }

    fn verify_eddsa(&self, credential: &CachedCredential) -> IdentityResult<()> {
        let parts: Vec<&str> = credential.payload.split('.').collect();
        if parts.len() != 3 {
            return Err(IdentityError::InvalidSignature(
                "expected a compact JWS with 3 parts".into(),
            ));
        }

        let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;

        let header: JwsHeader = serde_json::from_slice(&engine.decode(parts[0])?)
            .map_err(|e| IdentityError::InvalidSignature(format!("invalid JWS header: {}", e)))?;
        if header.alg != credential.algorithm.jws_alg() {
            return Err(IdentityError::InvalidSignature(format!(
                "unsupported algorithm {}, expected {}",
                header.alg,
                credential.algorithm.jws_alg()
            )));
        }

        let claims: JwsClaims = serde_json::from_slice(&engine.decode(parts[1])?)
            .map_err(|e| IdentityError::InvalidSignature(format!("invalid JWS claims: {}", e)))?;
        if let Some(iss) = claims.iss.as_deref() {
            if iss != credential.issuer {
                return Err(IdentityError::InvalidSignature(format!(
                    "token issuer {} does not match cached issuer {}",
                    iss, credential.issuer
                )));
            }
        }

        let signature = Signature::from_slice(&engine.decode(parts[2])?)?;
        let signed_message = format!("{}.{}", parts[0], parts[1]);

        let issuers = self.issuers.read();
        let keys = issuers.get(&credential.issuer).ok_or_else(|| {
            IdentityError::InvalidSignature(format!("issuer {} is not trusted", credential.issuer))
        })?;

        let verified = keys
            .iter()
            .filter(|trusted| match (&header.kid, &trusted.kid) {
                (Some(hint), Some(kid)) => hint == kid,
                (_, None) => true,
                (None, Some(_)) => false,
            })
            .any(|trusted| {
                trusted
                    .key
                    .verify_strict(signed_message.as_bytes(), &signature)
                    .is_ok()
            });

        if verified {
            debug!(
                credential_id = %credential.id,
                issuer = %credential.issuer,
                "Signature verified"
            );
            Ok(())
        } else {
            Err(IdentityError::InvalidSignature(format!(
                "no trusted key of {} verifies credential {}",
                credential.issuer, credential.id
            )))
        }
    }
}

impl CredentialSignatureVerifier for Ed25519JwsVerifier {
    fn verify(&self, credential: &CachedCredential) -> IdentityResult<()> {
        if !matches_sha256(&credential.payload, &credential.payload_hash) {
            return Err(IdentityError::IntegrityError(format!("credential {}", credential.id)));
        }
        match credential.algorithm {
            SignatureAlgorithm::Ed25519 => self.verify_eddsa(credential),
        }
    }
}

/// Produce an EdDSA compact JWS over `claims`
pub fn sign_compact_jws(
    signing_key: &SigningKey,
    kid: Option<&str>,
    claims: &serde_json::Value,
) -> IdentityResult<String> {
    let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
    let header = match kid {
        Some(kid) => serde_json::json!({ "alg": "EdDSA", "typ": "JWT", "kid": kid }),
        None => serde_json::json!({ "alg": "EdDSA", "typ": "JWT" }),
    };
    let signing_input = format!(
        "{}.{}",
        engine.encode(serde_json::to_vec(&header)?),
        engine.encode(serde_json::to_vec(claims)?)
    );
    let signature = signing_key.sign(signing_input.as_bytes());
    Ok(format!("{}.{}", signing_input, engine.encode(signature.to_bytes())))
}
