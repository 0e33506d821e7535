use std::fmt::{Debug, Formatter};
use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair, UnparsedPublicKey, ED25519};
use crate::error::TransportError;

/// The public half of a node's identity. Comparable and hashable, so it can be handed around as
///  the 'expected' key when connecting to a peer.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PublicKey(pub [u8; PublicKey::LEN]);

impl PublicKey {
    pub const LEN: usize = 32;

    pub fn from_slice(raw: &[u8]) -> anyhow::Result<PublicKey> {
        let bytes: [u8; Self::LEN] = raw.try_into()?;
        Ok(PublicKey(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }

    #[must_use]
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        UnparsedPublicKey::new(&ED25519, &self.0)
            .verify(message, &signature.0)
            .is_ok()
    }
}

impl Debug for PublicKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        // the first eight bytes are plenty for telling keys apart in log output
        for b in &self.0[..8] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "..")
    }
}

#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Signature(pub [u8; Signature::LEN]);

impl Signature {
    pub const LEN: usize = 64;

    pub fn from_slice(raw: &[u8]) -> anyhow::Result<Signature> {
        let bytes: [u8; Self::LEN] = raw.try_into()?;
        Ok(Signature(bytes))
    }
}

impl Debug for Signature {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature(..)")
    }
}

/// An Ed25519 key pair owned by one network interface for its whole lifetime. The private half
///  never leaves this struct; it is used to sign handshake messages.
pub struct Identity {
    key_pair: Ed25519KeyPair,
    public_key: PublicKey,
}

impl Identity {
    pub fn generate() -> Result<Identity, TransportError> {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng)
            .map_err(|_| TransportError::Identity("key generation failed".to_string()))?;
        Self::from_pkcs8(pkcs8.as_ref())
    }

    /// loads a key pair that was generated and stored elsewhere
    pub fn from_pkcs8(pkcs8: &[u8]) -> Result<Identity, TransportError> {
        let key_pair = Ed25519KeyPair::from_pkcs8(pkcs8)
            .map_err(|e| TransportError::Identity(format!("invalid PKCS#8 key: {}", e)))?;
        let public_key = PublicKey::from_slice(key_pair.public_key().as_ref())
            .map_err(|e| TransportError::Identity(format!("unexpected public key format: {}", e)))?;

        Ok(Identity {
            key_pair,
            public_key,
        })
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        let mut raw = [0u8; Signature::LEN];
        raw.copy_from_slice(self.key_pair.sign(message).as_ref());
        Signature(raw)
    }
}

impl Debug for Identity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity({:?})", self.public_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let identity = Identity::generate().unwrap();
        let signature = identity.sign(b"abc");

        assert!(identity.public_key().verify(b"abc", &signature));
        assert!(!identity.public_key().verify(b"abd", &signature));
    }

    #[test]
    fn test_verify_with_other_key() {
        let a = Identity::generate().unwrap();
        let b = Identity::generate().unwrap();
        assert_ne!(a.public_key(), b.public_key());

        let signature = a.sign(b"xyz");
        assert!(!b.public_key().verify(b"xyz", &signature));
    }

    #[test]
    fn test_from_pkcs8_stable_public_key() {
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&SystemRandom::new()).unwrap();
        let a = Identity::from_pkcs8(pkcs8.as_ref()).unwrap();
        let b = Identity::from_pkcs8(pkcs8.as_ref()).unwrap();
        assert_eq!(a.public_key(), b.public_key());
    }

    #[test]
    fn test_from_pkcs8_invalid() {
        assert!(matches!(Identity::from_pkcs8(b"garbage"), Err(TransportError::Identity(_))));
    }

    #[test]
    fn test_public_key_from_slice() {
        assert!(PublicKey::from_slice(&[1u8; 31]).is_err());
        assert_eq!(PublicKey::from_slice(&[7u8; 32]).unwrap(), PublicKey([7u8; 32]));
    }
}
