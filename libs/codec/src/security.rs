//! Message authentication
//!
//! HMAC-SHA256 over the header bytes, every annotation block except the
//! digest itself, and the body. The key is shared out of band and must be
//! identical on both ends.

use crate::error::{CodecError, Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Digest length in bytes
pub const DIGEST_SIZE: usize = 32;

/// Keyed signer/verifier for message digests
#[derive(Clone)]
pub struct MessageAuthenticator {
    key: Vec<u8>,
}

impl MessageAuthenticator {
    pub fn new(key: impl Into<Vec<u8>>) -> Result<Self> {
        let key = key.into();
        if key.is_empty() {
            return Err(CodecError::authentication("HMAC key must not be empty"));
        }
        Ok(Self { key })
    }

    fn mac(&self, parts: &[&[u8]]) -> Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| CodecError::authentication(e.to_string()))?;
        for part in parts {
            mac.update(part);
        }
        Ok(mac)
    }

    /// Compute the digest over the concatenation of `parts`
    pub fn sign(&self, parts: &[&[u8]]) -> Result<[u8; DIGEST_SIZE]> {
        let digest = self.mac(parts)?.finalize().into_bytes();
        let mut out = [0u8; DIGEST_SIZE];
        out.copy_from_slice(&digest);
        Ok(out)
    }

    /// Constant-time comparison against a received digest
    pub fn verify(&self, parts: &[&[u8]], digest: &[u8]) -> Result<()> {
        self.mac(parts)?
            .verify_slice(digest)
            .map_err(|_| CodecError::authentication("message digest mismatch"))
    }
}

impl std::fmt::Debug for MessageAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageAuthenticator")
            .field("key", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let auth = MessageAuthenticator::new("secret").unwrap();
        let digest = auth.sign(&[b"header", b"body"]).unwrap();
        assert!(auth.verify(&[b"header", b"body"], &digest).is_ok());
        // Split points do not matter, only the byte sequence
        assert!(auth.verify(&[b"head", b"erbody"], &digest).is_ok());
        assert!(auth.verify(&[b"header", b"bodx"], &digest).is_err());
    }

    #[test]
    fn different_keys_disagree() {
        let a = MessageAuthenticator::new("alpha").unwrap();
        let b = MessageAuthenticator::new("bravo").unwrap();
        let digest = a.sign(&[b"payload"]).unwrap();
        assert!(b.verify(&[b"payload"], &digest).is_err());
    }

    #[test]
    fn empty_key_rejected() {
        assert!(MessageAuthenticator::new(Vec::new()).is_err());
    }

    #[test]
    fn debug_redacts_key() {
        let auth = MessageAuthenticator::new("topsecret").unwrap();
        assert!(!format!("{:?}", auth).contains("topsecret"));
    }
}
