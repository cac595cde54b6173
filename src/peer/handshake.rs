//! Session handshake material exchanged through signal.
//!
//! Tunnel keys are only installed after both sides have exchanged ephemeral
//! session material over the sealed signal channel. In post-quantum mode an
//! additional KEM exchange rides the same offer/answer pair and its shared
//! secret is folded into the tunnel's pre-shared key.

use anyhow::{Context, Result};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::key::{PublicKey, SecretKey};

/// Length of KEM shared secrets and of the derived pre-shared key.
pub const SECRET_LEN: usize = 32;

/// Key encapsulation used for the supplementary handshake.
///
/// Object-safe so the engine can inject a different primitive per
/// deployment; [`SealedBoxKem`] is the default.
pub trait Kem: Send + Sync + 'static {
    /// Generates an encapsulation keypair. The public half travels in the
    /// offer.
    fn generate(&self) -> KemKeys;

    /// Encapsulates against a remote encapsulation key, yielding the
    /// ciphertext for the answer and the local copy of the shared secret.
    fn encapsulate(&self, public: &[u8]) -> Result<KemOutput>;

    /// Recovers the shared secret from an answer's ciphertext.
    fn decapsulate(&self, secret: &[u8], ciphertext: &[u8]) -> Result<[u8; SECRET_LEN]>;
}

#[derive(Debug, Clone)]
pub struct KemKeys {
    pub public: Vec<u8>,
    pub secret: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct KemOutput {
    pub ciphertext: Vec<u8>,
    pub shared: [u8; SECRET_LEN],
}

/// KEM built from the sealed-box construction of the identity layer: the
/// encapsulator seals a random secret to the remote encapsulation key with a
/// fresh ephemeral key.
#[derive(Debug, Default, Clone, Copy)]
pub struct SealedBoxKem;

impl Kem for SealedBoxKem {
    fn generate(&self) -> KemKeys {
        let secret = SecretKey::generate();
        KemKeys {
            public: secret.public().as_bytes().to_vec(),
            secret: secret.to_bytes().to_vec(),
        }
    }

    fn encapsulate(&self, public: &[u8]) -> Result<KemOutput> {
        let remote = PublicKey::try_from(public).context("invalid encapsulation key")?;
        let mut shared = [0u8; SECRET_LEN];
        OsRng.fill_bytes(&mut shared);

        let ephemeral = SecretKey::generate();
        let sealed = ephemeral.seal_to(&remote, &shared);

        let mut ciphertext = ephemeral.public().as_bytes().to_vec();
        ciphertext.extend(sealed);
        Ok(KemOutput { ciphertext, shared })
    }

    fn decapsulate(&self, secret: &[u8], ciphertext: &[u8]) -> Result<[u8; SECRET_LEN]> {
        let secret_bytes: [u8; 32] = secret.try_into().context("invalid KEM secret")?;
        let secret = SecretKey::from_bytes(&secret_bytes);

        anyhow::ensure!(ciphertext.len() > 32, "KEM ciphertext too short");
        let (ephemeral, sealed) = ciphertext.split_at(32);
        let ephemeral = PublicKey::try_from(ephemeral).context("invalid ephemeral key")?;

        let shared = secret.open_from(&ephemeral, sealed)?;
        shared[..]
            .try_into()
            .context("KEM shared secret has wrong length")
    }
}

/// Per-session handshake state of one negotiation cycle.
pub struct SessionHandshake {
    session: SecretKey,
    kem_keys: Option<KemKeys>,
}

impl SessionHandshake {
    /// Starts a new cycle. When `kem` is set (controlling side, post-quantum
    /// mode) an encapsulation keypair is generated for the offer.
    pub fn new(kem: Option<&dyn Kem>) -> Self {
        SessionHandshake {
            session: SecretKey::generate(),
            kem_keys: kem.map(|k| k.generate()),
        }
    }

    /// The ephemeral session public key, carried in the offer or answer.
    pub fn session_key(&self) -> [u8; 32] {
        *self.session.public().as_bytes()
    }

    /// The KEM encapsulation key for the offer, if one was generated.
    pub fn kem_public(&self) -> Option<Vec<u8>> {
        self.kem_keys.as_ref().map(|k| k.public.clone())
    }

    /// Recovers the KEM shared secret from the answer.
    pub fn kem_open(&self, kem: &dyn Kem, ciphertext: &[u8]) -> Result<[u8; SECRET_LEN]> {
        let keys = self.kem_keys.as_ref().context("no KEM keypair this cycle")?;
        kem.decapsulate(&keys.secret, ciphertext)
    }
}

/// Derives the pre-shared key installed with the tunnel session.
///
/// Without a KEM secret this is the configured key unchanged, so plain
/// deployments keep byte-identical device entries. With one, both inputs are
/// folded through a keyed hash; both sides hold the same KEM secret so they
/// derive the same key.
pub fn derive_preshared_key(
    configured: Option<[u8; SECRET_LEN]>,
    kem_shared: Option<[u8; SECRET_LEN]>,
) -> Option<[u8; SECRET_LEN]> {
    match (configured, kem_shared) {
        (psk, None) => psk,
        (configured, Some(kem_shared)) => {
            let mut hasher = blake3::Hasher::new_derive_key("trellis session psk v1");
            hasher.update(&kem_shared);
            if let Some(configured) = configured {
                hasher.update(&configured);
            }
            Some(*hasher.finalize().as_bytes())
        }
    }
}
