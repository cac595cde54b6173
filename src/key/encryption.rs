//! Authenticated encryption between two static identity keys.
//!
//! Signalling payloads travel as `nonce || ciphertext`: a fresh 24-byte
//! random nonce followed by the ChaCha20-Poly1305 box output. A fresh nonce
//! per payload means sealing the same bytes twice never produces the same
//! wire bytes.

use std::fmt;

use anyhow::{anyhow, bail, Result};
use crypto_box::aead::generic_array::GenericArray;
use crypto_box::aead::{Aead, AeadCore, OsRng};

pub(crate) const NONCE_LEN: usize = 24;

/// Poly1305 tag appended by the box construction.
const TAG_LEN: usize = 16;

/// Precomputed box for one local/remote key pair.
pub struct SharedSecret {
    pair_box: crypto_box::ChaChaBox,
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedSecret").finish_non_exhaustive()
    }
}

impl SharedSecret {
    fn new(ours: &crypto_box::SecretKey, theirs: &crypto_box::PublicKey) -> Self {
        SharedSecret {
            pair_box: crypto_box::ChaChaBox::new(theirs, ours),
        }
    }

    /// Encrypts `payload` under a fresh nonce and frames it for the wire.
    pub fn seal(&self, payload: &[u8]) -> Vec<u8> {
        let nonce = crypto_box::ChaChaBox::generate_nonce(&mut OsRng);

        let mut wire = Vec::with_capacity(NONCE_LEN + payload.len() + TAG_LEN);
        wire.extend_from_slice(&nonce);
        wire.extend_from_slice(
            &self
                .pair_box
                .encrypt(&nonce, payload)
                .expect("box encryption is infallible"),
        );
        wire
    }

    /// Decrypts wire bytes the other side produced with [`Self::seal`].
    ///
    /// Fails on truncated input and on anything not sealed for exactly this
    /// key pair.
    pub fn open(&self, wire: &[u8]) -> Result<Vec<u8>> {
        if wire.len() <= NONCE_LEN {
            bail!("sealed payload too short");
        }
        let (nonce, sealed) = wire.split_at(NONCE_LEN);
        self.pair_box
            .decrypt(GenericArray::from_slice(nonce), sealed)
            .map_err(|_| anyhow!("sealed payload does not open for this key pair"))
    }
}

impl crate::key::SecretKey {
    /// Seals `cleartext` so that only the holder of `other` can open it.
    pub fn seal_to(&self, other: &crate::key::PublicKey, cleartext: &[u8]) -> Vec<u8> {
        self.shared(other).seal(cleartext)
    }

    /// Opens a payload the holder of `other` sealed for us.
    pub fn open_from(&self, other: &crate::key::PublicKey, wire: &[u8]) -> Result<Vec<u8>> {
        self.shared(other).open(wire)
    }

    /// The shared secret for traffic between this key and `other`.
    pub fn shared(&self, other: &crate::key::PublicKey) -> SharedSecret {
        SharedSecret::new(self.crypto_box(), &other.crypto_box())
    }
}

#[cfg(test)]
mod tests {
    use super::NONCE_LEN;
    use crate::key::SecretKey;

    fn seal_open_both_ways(key_a: &SecretKey, key_b: &SecretKey) {
        let msg = b"connection offer, sealed";
        let wire = key_a.seal_to(&key_b.public(), msg);
        assert_eq!(
            key_b.open_from(&key_a.public(), &wire).unwrap(),
            msg.to_vec()
        );

        let wire = key_a.shared(&key_b.public()).seal(msg);
        assert_eq!(
            key_b.shared(&key_a.public()).open(&wire).unwrap(),
            msg.to_vec()
        );
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let key_a = SecretKey::generate();
        let key_b = SecretKey::generate();

        seal_open_both_ways(&key_a, &key_b);
        seal_open_both_ways(&key_b, &key_a);
        seal_open_both_ways(&key_a, &key_a);
    }

    #[test]
    fn test_fresh_nonce_per_seal() {
        let key_a = SecretKey::generate();
        let key_b = SecretKey::generate();
        let shared = key_a.shared(&key_b.public());
        assert_ne!(shared.seal(b"payload"), shared.seal(b"payload"));
    }

    #[test]
    fn test_truncated_wire_fails() {
        let key_a = SecretKey::generate();
        let key_b = SecretKey::generate();
        let wire = key_a.seal_to(&key_b.public(), b"payload");
        assert!(key_b
            .open_from(&key_a.public(), &wire[..NONCE_LEN])
            .is_err());
    }

    #[test]
    fn test_tampered_seal_fails() {
        let key_a = SecretKey::generate();
        let key_b = SecretKey::generate();
        let mut wire = key_a.seal_to(&key_b.public(), b"payload");
        let last = wire.len() - 1;
        wire[last] ^= 0xff;
        assert!(key_b.open_from(&key_a.public(), &wire).is_err());
    }

    #[test]
    fn test_wrong_recipient_fails() {
        let key_a = SecretKey::generate();
        let key_b = SecretKey::generate();
        let key_c = SecretKey::generate();
        let wire = key_a.seal_to(&key_b.public(), b"payload");
        assert!(key_c.open_from(&key_a.public(), &wire).is_err());
    }
}
