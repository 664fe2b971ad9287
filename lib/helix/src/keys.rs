use crate::crypto;
use crate::encoding::base64;
use serde::{de, Deserialize as _, Deserializer};
use serde_derive::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

const KEY_SIZE: usize = 32;

#[inline]
fn deserialize_b64_key<'de, D>(deserializer: D) -> Result<[u8; KEY_SIZE], D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    let decoded_raw = base64::decode(&s).map_err(de::Error::custom)?;

    if decoded_raw.len() != KEY_SIZE {
        return Err(de::Error::custom("key must decode to exactly 32 bytes"));
    }

    let mut decoded = [0u8; KEY_SIZE];
    decoded.copy_from_slice(&decoded_raw);

    Ok(decoded)
}

/// Long-term Curve25519 secret key. The raw bytes are wiped when the value is dropped.
#[derive(Serialize, Deserialize, Clone)]
pub struct SecretKey(
    #[serde(
        serialize_with = "base64::serialize",
        deserialize_with = "deserialize_b64_key"
    )]
    [u8; KEY_SIZE],
);

impl SecretKey {
    pub const SIZE: usize = KEY_SIZE;

    #[inline]
    pub fn new(key: [u8; Self::SIZE]) -> SecretKey {
        SecretKey(key)
    }

    /// Generates a fresh random secret key.
    #[inline]
    pub fn generate() -> SecretKey {
        let mut key = [0u8; Self::SIZE];
        crypto::random_bytes(&mut key);
        SecretKey(key)
    }
}

impl Deref for SecretKey {
    type Target = [u8; SecretKey::SIZE];

    #[inline]
    fn deref(&self) -> &[u8; SecretKey::SIZE] {
        &self.0
    }
}

impl Drop for SecretKey {
    fn drop(&mut self) {
        crypto::memzero(&mut self.0);
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SecretKey(..)")
    }
}

/// Curve25519 public key.
#[derive(Serialize, Deserialize, Clone, Copy, Eq, PartialEq)]
pub struct PublicKey(
    #[serde(
        serialize_with = "base64::serialize",
        deserialize_with = "deserialize_b64_key"
    )]
    [u8; KEY_SIZE],
);

impl PublicKey {
    pub const SIZE: usize = KEY_SIZE;

    #[inline]
    pub fn new(key: [u8; Self::SIZE]) -> PublicKey {
        PublicKey(key)
    }

    /// Derives the public key matching the supplied secret key.
    #[inline]
    pub fn from_secret(secret: &SecretKey) -> PublicKey {
        PublicKey(crypto::scalarmult_base(secret))
    }
}

impl Deref for PublicKey {
    type Target = [u8; PublicKey::SIZE];

    #[inline]
    fn deref(&self) -> &[u8; PublicKey::SIZE] {
        &self.0
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PublicKey({})", crate::encoding::hex::encode(&self.0))
    }
}

/// Long-term client identity used to authenticate against the grid.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct KeyPair {
    pub public: PublicKey,
    pub secret: SecretKey,
}

impl KeyPair {
    /// Generates a fresh identity.
    #[inline]
    pub fn generate() -> KeyPair {
        let (public, secret) = crypto::keypair();
        KeyPair {
            public: PublicKey::new(public),
            secret: SecretKey::new(secret),
        }
    }

    /// Builds the identity belonging to an existing secret key.
    #[inline]
    pub fn from_secret(secret: SecretKey) -> KeyPair {
        let public = PublicKey::from_secret(&secret);
        KeyPair { public, secret }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_secret_matches_generate() {
        let keys = KeyPair::generate();
        let rebuilt = KeyPair::from_secret(keys.secret.clone());

        assert_eq!(*rebuilt.public, *keys.public);
    }

    #[test]
    fn test_public_derivation_is_deterministic() {
        let secret = SecretKey::generate();

        assert_eq!(PublicKey::from_secret(&secret), PublicKey::from_secret(&secret));
    }

    #[test]
    fn test_generated_keys_differ() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();

        assert_ne!(*a.secret, *b.secret);
        assert_ne!(*a.public, *b.public);
    }
}
