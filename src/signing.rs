//! Digital-signature collaborator for prescriptions issued at session close-out.

use base64::Engine;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

#[derive(Debug, thiserror::Error)]
pub enum SigningError {
    #[error("Signer id is required")]
    MissingSigner,
    #[error("Signing backend failed: {0}")]
    Backend(String),
}

pub trait PrescriptionSigner: Send + Sync {
    /// Produce a verifiable signature token for `payload` on behalf of `signer_id`.
    fn sign(&self, payload: &[u8], signer_id: &str) -> Result<String, SigningError>;

    /// Check a token previously produced by `sign`.
    fn verify(&self, payload: &[u8], signer_id: &str, token: &str) -> bool;
}

/// Keyed SHA-256 digest signer. Tokens are URL-safe base64 without padding.
pub struct DigestSigner {
    secret: Vec<u8>,
}

impl DigestSigner {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Signer with a fresh random 32-byte secret.
    pub fn random() -> Self {
        let secret: [u8; 32] = rand::random();
        Self::new(secret.to_vec())
    }

    fn digest(&self, payload: &[u8], signer_id: &str) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(&self.secret);
        hasher.update(b"|");
        hasher.update(signer_id.as_bytes());
        hasher.update(b"|");
        hasher.update(payload);
        hasher.finalize().into()
    }
}

impl std::fmt::Debug for DigestSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DigestSigner").finish_non_exhaustive()
    }
}

impl PrescriptionSigner for DigestSigner {
    fn sign(&self, payload: &[u8], signer_id: &str) -> Result<String, SigningError> {
        if signer_id.trim().is_empty() {
            return Err(SigningError::MissingSigner);
        }
        let digest = self.digest(payload, signer_id);
        Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest))
    }

    fn verify(&self, payload: &[u8], signer_id: &str, token: &str) -> bool {
        let Ok(decoded) = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(token) else {
            return false;
        };
        let expected = self.digest(payload, signer_id);
        decoded.len() == expected.len() && expected[..].ct_eq(&decoded[..]).unwrap_u8() == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify() {
        let signer = DigestSigner::new(b"clinic-secret".to_vec());
        let token = signer.sign(b"rx-payload", "dr-lee").unwrap();
        assert!(signer.verify(b"rx-payload", "dr-lee", &token));
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let signer = DigestSigner::new(b"clinic-secret".to_vec());
        let token = signer.sign(b"rx-payload", "dr-lee").unwrap();
        assert!(!signer.verify(b"rx-payload-edited", "dr-lee", &token));
        assert!(!signer.verify(b"rx-payload", "dr-other", &token));
        assert!(!signer.verify(b"rx-payload", "dr-lee", "not base64 !!"));
    }

    #[test]
    fn different_secrets_produce_different_tokens() {
        let a = DigestSigner::random();
        let b = DigestSigner::random();
        assert_ne!(
            a.sign(b"payload", "dr-lee").unwrap(),
            b.sign(b"payload", "dr-lee").unwrap()
        );
    }

    #[test]
    fn empty_signer_rejected() {
        let signer = DigestSigner::random();
        assert!(matches!(signer.sign(b"payload", " "), Err(SigningError::MissingSigner)));
    }
}
