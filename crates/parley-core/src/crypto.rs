//! Endpoint identity.
//!
//! An endpoint is addressed on the relay by its public id: the 32-byte X25519
//! public key, hex encoded. Key generation is explicit; nothing in parley
//! creates a keypair behind the caller's back.
//!
//! Key material derives ZeroizeOnDrop and is wiped from memory when dropped.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Length of a public id in hex characters.
pub const PUBLIC_ID_LEN: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("public id must be {PUBLIC_ID_LEN} characters, got {0}")]
    BadLength(usize),
    #[error("public id must be hex encoded")]
    NotHex,
}

// ── Public id ─────────────────────────────────────────────────────────────────

/// 64 lowercase hex characters identifying an endpoint on the relay.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PublicId(String);

impl PublicId {
    /// Parse a public id, normalizing to lowercase.
    pub fn parse(s: &str) -> Result<Self, IdentityError> {
        if s.len() != PUBLIC_ID_LEN {
            return Err(IdentityError::BadLength(s.chars().count()));
        }
        if !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(IdentityError::NotHex);
        }
        Ok(Self(s.to_ascii_lowercase()))
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..8]
    }
}

impl fmt::Display for PublicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PublicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicId({})", self.short())
    }
}

impl FromStr for PublicId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PublicId {
    type Error = IdentityError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<PublicId> for String {
    fn from(id: PublicId) -> Self {
        id.0
    }
}

// ── Keypair ───────────────────────────────────────────────────────────────────

/// A long-term X25519 keypair. The private key never leaves this struct
/// except through [`Keypair::private_bytes`].
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Keypair {
    private: Zeroizing<[u8; 32]>,
    pub public: [u8; 32],
}

impl Keypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::thread_rng());
        let public = PublicKey::from(&secret);
        Self {
            private: Zeroizing::new(secret.to_bytes()),
            public: *public.as_bytes(),
        }
    }

    /// Reconstruct a keypair from stored private key bytes.
    pub fn from_private(private_bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(private_bytes);
        let public = PublicKey::from(&secret);
        Self {
            private: Zeroizing::new(private_bytes),
            public: *public.as_bytes(),
        }
    }

    pub fn private_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(*self.private)
    }

    pub fn public_id(&self) -> PublicId {
        PublicId::from_bytes(&self.public)
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &self.public_id())
            .finish_non_exhaustive()
    }
}
