//! Passphrase-based envelope encryption for relayed messages.
//!
//! AES-256-GCM keyed by PBKDF2-HMAC-SHA256 over a random 16-byte salt. An
//! envelope is `flags(1) || iv(12) || salt(16)? || ciphertext`, base64
//! encoded. The salt travels only with the first envelope of an instance
//! (or after [`CipherBox::reannounce_salt`]); receivers cache the key they
//! derived per sender. Salts that failed to authenticate are remembered so
//! a replayed forgery costs no further derivation.

use std::collections::{HashMap, HashSet};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::RngCore;
use sha2::Sha256;
use tracing::trace;

use crate::config::CipherConfig;
use crate::domain::error::DecryptError;
use crate::domain::identity::Identity;

const FLAG_SALT: u8 = 0x01;
const IV_LEN: usize = 12;
const SALT_LEN: usize = 16;
const KEY_LEN: usize = 32;
const TAG_LEN: usize = 16;
/// Rejected (sender, salt) pairs kept before the set is reset.
const MAX_REJECTED: usize = 1024;

type Salt = [u8; SALT_LEN];

#[derive(Clone)]
struct DerivedKey([u8; KEY_LEN]);

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DerivedKey(***)")
    }
}

// ---------------------------------------------------------------------------
// Key state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum KeyState {
    Uninitialized,
    SaltKnown { salt: Salt },
    KeyDerived { salt: Salt, key: DerivedKey },
}

/// Externally visible phase of a key state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPhase {
    Uninitialized,
    SaltKnown,
    KeyDerived,
}

impl KeyState {
    fn phase(&self) -> KeyPhase {
        match self {
            Self::Uninitialized => KeyPhase::Uninitialized,
            Self::SaltKnown { .. } => KeyPhase::SaltKnown,
            Self::KeyDerived { .. } => KeyPhase::KeyDerived,
        }
    }
}

// ---------------------------------------------------------------------------
// CipherBox
// ---------------------------------------------------------------------------

/// One instance per relay connection and room.
pub struct CipherBox {
    passphrase: String,
    iterations: u32,
    outbound: KeyState,
    /// Put the salt in the next envelope.
    announce_salt: bool,
    inbound: HashMap<Identity, KeyState>,
    rejected: HashSet<(Identity, Salt)>,
    derivations: u64,
}

impl CipherBox {
    pub fn new(passphrase: &str) -> Self {
        Self::with_config(passphrase, &CipherConfig::default())
    }

    pub fn with_config(passphrase: &str, config: &CipherConfig) -> Self {
        Self {
            passphrase: passphrase.to_owned(),
            iterations: config.kdf_iterations,
            outbound: KeyState::Uninitialized,
            announce_salt: true,
            inbound: HashMap::new(),
            rejected: HashSet::new(),
            derivations: 0,
        }
    }

    pub fn state(&self) -> KeyPhase {
        self.outbound.phase()
    }

    /// Phase of the key material held for `sender`.
    pub fn peer_state(&self, sender: &Identity) -> KeyPhase {
        self.inbound
            .get(sender)
            .map_or(KeyPhase::Uninitialized, KeyState::phase)
    }

    /// Include the salt in the next envelope again.
    pub fn reannounce_salt(&mut self) {
        self.announce_salt = true;
    }

    pub fn encrypt(&mut self, plaintext: &str) -> anyhow::Result<String> {
        let (salt, key) = self.outbound_key();

        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);
        let ciphertext = cipher(&key)
            .encrypt(Nonce::from_slice(&iv), plaintext.as_bytes())
            .map_err(|e| anyhow::anyhow!("AES-GCM encrypt error: {e}"))?;

        let with_salt = std::mem::take(&mut self.announce_salt);
        let mut envelope = Vec::with_capacity(1 + IV_LEN + SALT_LEN + ciphertext.len());
        envelope.push(if with_salt { FLAG_SALT } else { 0 });
        envelope.extend_from_slice(&iv);
        if with_salt {
            envelope.extend_from_slice(&salt);
        }
        envelope.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(envelope))
    }

    /// Open an envelope published by `sender`.
    ///
    /// A salt-bearing envelope from a sender we had no key for (or whose
    /// salt changed) means that sender is new to us and probably lacks our
    /// salt too, so our next envelope carries it.
    pub fn decrypt(&mut self, sender: &Identity, envelope: &str) -> Result<String, DecryptError> {
        let raw = STANDARD
            .decode(envelope.trim())
            .map_err(|e| DecryptError::Malformed(e.to_string()))?;

        let (&flags, rest) = raw
            .split_first()
            .ok_or_else(|| DecryptError::Malformed("empty envelope".into()))?;
        if flags & !FLAG_SALT != 0 {
            return Err(DecryptError::Malformed(format!("unknown flags {flags:#04x}")));
        }
        if rest.len() < IV_LEN {
            return Err(DecryptError::Malformed("truncated iv".into()));
        }
        let (iv, rest) = rest.split_at(IV_LEN);

        let (salt, ciphertext) = if flags & FLAG_SALT != 0 {
            if rest.len() < SALT_LEN {
                return Err(DecryptError::Malformed("truncated salt".into()));
            }
            let (salt, ciphertext) = rest.split_at(SALT_LEN);
            let mut fixed = [0u8; SALT_LEN];
            fixed.copy_from_slice(salt);
            (Some(fixed), ciphertext)
        } else {
            (None, rest)
        };
        if ciphertext.len() < TAG_LEN {
            return Err(DecryptError::Malformed("truncated ciphertext".into()));
        }

        let known = self.inbound.get(sender).cloned().unwrap_or(KeyState::Uninitialized);
        let (next, first_contact) = match (salt, known) {
            (Some(salt), KeyState::KeyDerived { salt: cached, key }) if cached == salt => {
                (KeyState::KeyDerived { salt, key }, false)
            }
            (Some(salt), _) if self.rejected.contains(&(sender.clone(), salt)) => {
                return Err(DecryptError::Authentication);
            }
            (Some(salt), _) => (self.derive_state(KeyState::SaltKnown { salt }), true),
            (None, KeyState::KeyDerived { salt, key }) => (KeyState::KeyDerived { salt, key }, false),
            (None, KeyState::SaltKnown { salt }) => {
                (self.derive_state(KeyState::SaltKnown { salt }), false)
            }
            (None, KeyState::Uninitialized) => return Err(DecryptError::MissingSalt),
        };

        let KeyState::KeyDerived { key, .. } = &next else {
            return Err(DecryptError::MissingSalt);
        };
        let Ok(plaintext) = cipher(key).decrypt(Nonce::from_slice(iv), ciphertext) else {
            if let (Some(salt), true) = (salt, first_contact) {
                self.reject(sender, salt);
            }
            return Err(DecryptError::Authentication);
        };
        let plaintext = String::from_utf8(plaintext).map_err(|_| DecryptError::Encoding)?;

        // Only authenticated salts are cached.
        self.inbound.insert(sender.clone(), next);
        if first_contact {
            self.announce_salt = true;
        }
        Ok(plaintext)
    }

    // -----------------------------------------------------------------------
    // Key derivation
    // -----------------------------------------------------------------------

    fn outbound_key(&mut self) -> (Salt, DerivedKey) {
        if let KeyState::KeyDerived { salt, key } = &self.outbound {
            return (*salt, key.clone());
        }
        let salt = if let KeyState::SaltKnown { salt } = self.outbound {
            salt
        } else {
            let mut salt = [0u8; SALT_LEN];
            rand::thread_rng().fill_bytes(&mut salt);
            self.outbound = KeyState::SaltKnown { salt };
            salt
        };
        let key = self.derive(&salt);
        self.outbound = KeyState::KeyDerived {
            salt,
            key: key.clone(),
        };
        (salt, key)
    }

    fn reject(&mut self, sender: &Identity, salt: Salt) {
        if self.rejected.len() >= MAX_REJECTED {
            self.rejected.clear();
        }
        self.rejected.insert((sender.clone(), salt));
    }

    /// `SaltKnown -> KeyDerived`; other states pass through.
    fn derive_state(&mut self, state: KeyState) -> KeyState {
        match state {
            KeyState::SaltKnown { salt } => KeyState::KeyDerived {
                key: self.derive(&salt),
                salt,
            },
            other => other,
        }
    }

    fn derive(&mut self, salt: &Salt) -> DerivedKey {
        self.derivations += 1;
        let mut key = [0u8; KEY_LEN];
        pbkdf2::pbkdf2_hmac::<Sha256>(self.passphrase.as_bytes(), salt, self.iterations, &mut key);
        trace!(iterations = self.iterations, derivations = self.derivations, "Derived key");
        DerivedKey(key)
    }
}

fn cipher(key: &DerivedKey) -> Aes256Gcm {
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
