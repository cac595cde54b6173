//! Cryptographic identity of a peer.
//!
//! Every peer is identified by the public half of a static Curve25519
//! keypair. The same keypair is used to seal signalling payloads between two
//! peers, so possession of the secret key is what authenticates a peer to the
//! rest of the mesh.

mod encryption;

use std::{
    cmp::Ordering,
    fmt::{Debug, Display},
    hash::Hash,
    str::FromStr,
};

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use ssh_key::LineEnding;

pub use self::encryption::SharedSecret;

/// Length in bytes of both the public and the secret half of an identity key.
pub const KEY_LENGTH: usize = 32;

/// A peer's public identity key.
///
/// Ordered byte-wise; the ordering decides which side of a peer pair drives
/// the connection negotiation.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PublicKey([u8; KEY_LENGTH]);

impl PublicKey {
    /// Get this public key as a byte array.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }

    /// Construct a `PublicKey` from a slice of bytes.
    pub fn from_bytes(bytes: &[u8; KEY_LENGTH]) -> Self {
        PublicKey(*bytes)
    }

    pub(crate) fn crypto_box(&self) -> crypto_box::PublicKey {
        crypto_box::PublicKey::from(self.0)
    }

    /// The first 8 characters of the base64 form, for log lines.
    pub fn fmt_short(&self) -> String {
        let full = data_encoding::BASE64.encode(&self.0);
        full.chars().take(8).collect()
    }

    /// Reports whether this key sorts before `other`, making the holder the
    /// controlling side of the pair.
    pub fn controls(&self, other: &PublicKey) -> bool {
        matches!(self.cmp(other), Ordering::Less)
    }
}

impl TryFrom<&[u8]> for PublicKey {
    type Error = KeyParsingError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; KEY_LENGTH] = bytes
            .try_into()
            .map_err(|_| KeyParsingError::InvalidLength(bytes.len()))?;
        Ok(PublicKey(bytes))
    }
}

impl AsRef<[u8]> for PublicKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", self.fmt_short())
    }
}

impl Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", data_encoding::BASE64.encode(&self.0))
    }
}

impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string())
        } else {
            serializer.serialize_bytes(&self.0)
        }
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            Self::from_str(&s).map_err(D::Error::custom)
        } else {
            let bytes = <Vec<u8>>::deserialize(deserializer)?;
            Self::try_from(&bytes[..]).map_err(D::Error::custom)
        }
    }
}

/// Deserialises the [`PublicKey`] from its base64 encoding.
///
/// [`Display`] is capable of serialising this format.
impl FromStr for PublicKey {
    type Err = KeyParsingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = data_encoding::BASE64.decode(s.as_bytes())?;
        PublicKey::try_from(&bytes[..])
    }
}

/// Error when deserialising a [`PublicKey`] or a [`SecretKey`].
#[derive(thiserror::Error, Debug)]
pub enum KeyParsingError {
    /// Error when decoding the base64.
    #[error("decoding: {0}")]
    Base64(#[from] data_encoding::DecodeError),
    /// The decoded key material has the wrong length.
    #[error("invalid key length {0}, expected {KEY_LENGTH}")]
    InvalidLength(usize),
}

/// The secret half of a peer identity.
#[derive(Clone)]
pub struct SecretKey {
    secret: crypto_box::SecretKey,
}

impl Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretKey(..)")
    }
}

impl Display for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", data_encoding::BASE64.encode(&self.to_bytes()))
    }
}

impl FromStr for SecretKey {
    type Err = KeyParsingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = data_encoding::BASE64.decode(s.as_bytes())?;
        let bytes: [u8; KEY_LENGTH] = bytes[..]
            .try_into()
            .map_err(|_| KeyParsingError::InvalidLength(bytes.len()))?;
        Ok(SecretKey::from_bytes(&bytes))
    }
}

impl Serialize for SecretKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for SecretKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(D::Error::custom)
    }
}

impl SecretKey {
    /// Generate a new key with the default randomness generator.
    pub fn generate() -> Self {
        SecretKey {
            secret: crypto_box::SecretKey::generate(&mut OsRng),
        }
    }

    /// The public half of this key.
    pub fn public(&self) -> PublicKey {
        PublicKey(*self.secret.public_key().as_bytes())
    }

    /// Convert this to the bytes representing the secret part.
    /// The public part can always be recovered.
    pub fn to_bytes(&self) -> [u8; KEY_LENGTH] {
        self.secret.to_bytes()
    }

    /// Create a secret key from its byte representation.
    pub fn from_bytes(bytes: &[u8; KEY_LENGTH]) -> Self {
        SecretKey {
            secret: crypto_box::SecretKey::from(*bytes),
        }
    }

    pub(crate) fn crypto_box(&self) -> &crypto_box::SecretKey {
        &self.secret
    }
}

impl From<[u8; KEY_LENGTH]> for SecretKey {
    fn from(value: [u8; KEY_LENGTH]) -> Self {
        Self::from_bytes(&value)
    }
}

/// The SSH keypair a peer advertises to management at login.
///
/// Kept separate from the identity key: the identity never leaves the tunnel
/// protocol, while the SSH public key is handed to other management surfaces.
#[derive(Clone)]
pub struct SshKeyPair {
    secret: ed25519_dalek::SigningKey,
}

impl Debug for SshKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SshKeyPair(..)")
    }
}

impl SshKeyPair {
    /// Generate a new ed25519 SSH keypair.
    pub fn generate() -> Self {
        let mut rng = OsRng;
        SshKeyPair {
            secret: ed25519_dalek::SigningKey::generate(&mut rng),
        }
    }

    /// Serialise the private key to OpenSSH format.
    pub fn to_openssh(&self) -> ssh_key::Result<zeroize::Zeroizing<String>> {
        let ckey = ssh_key::private::Ed25519Keypair {
            public: self.secret.verifying_key().into(),
            private: self.secret.clone().into(),
        };
        ssh_key::private::PrivateKey::from(ckey).to_openssh(LineEnding::default())
    }

    /// Deserialise a keypair from OpenSSH format.
    pub fn try_from_openssh<T: AsRef<[u8]>>(data: T) -> anyhow::Result<Self> {
        let ser_key = ssh_key::private::PrivateKey::from_openssh(data)?;
        match ser_key.key_data() {
            ssh_key::private::KeypairData::Ed25519(kp) => Ok(SshKeyPair {
                secret: kp.private.clone().into(),
            }),
            _ => anyhow::bail!("invalid key format"),
        }
    }

    /// The public key in OpenSSH single-line format, as sent at login.
    pub fn public_openssh(&self) -> ssh_key::Result<String> {
        let public = ssh_key::public::Ed25519PublicKey::from(self.secret.verifying_key());
        ssh_key::public::PublicKey::from(public).to_openssh()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_from_str() {
        let key = SecretKey::generate();
        assert_eq!(
            SecretKey::from_str(&key.to_string()).unwrap().to_bytes(),
            key.to_bytes()
        );

        assert_eq!(
            PublicKey::from_str(&key.public().to_string()).unwrap(),
            key.public()
        );
    }

    #[test]
    fn test_controlling_side_is_exclusive() {
        let a = SecretKey::generate().public();
        let b = SecretKey::generate().public();
        assert_ne!(a.controls(&b), b.controls(&a));
        assert!(!a.controls(&a));
    }

    #[test]
    fn test_serde_json_roundtrip() {
        let key = SecretKey::generate();
        let ser = serde_json::to_string(&key).unwrap();
        let de: SecretKey = serde_json::from_str(&ser).unwrap();
        assert_eq!(key.to_bytes(), de.to_bytes());
    }

    #[test]
    fn test_ssh_keypair_roundtrip() {
        let kp = SshKeyPair::generate();
        let ser = kp.to_openssh().unwrap();
        let de = SshKeyPair::try_from_openssh(ser.as_bytes()).unwrap();
        assert_eq!(
            kp.public_openssh().unwrap(),
            de.public_openssh().unwrap()
        );
        assert!(kp.public_openssh().unwrap().starts_with("ssh-ed25519 "));
    }
}
