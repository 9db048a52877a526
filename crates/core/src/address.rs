//! 32-byte ledger addresses and program-derived address seeds.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::KeeperError;

/// Marker appended to every derivation so derived addresses never collide
/// with key-backed ones.
const DERIVATION_MARKER: &[u8] = b"comet-pda";

/// A ledger address (account key or program id).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address(pub [u8; 32]);

impl Address {
    pub const ZERO: Self = Self([0u8; 32]);

    /// Derives a stable address from a program id and a list of seeds.
    ///
    /// `sha256(program_id || seed_0 || ... || seed_n || "comet-pda")`
    #[must_use]
    pub fn derive(program_id: &Self, seeds: &[&[u8]]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(program_id.0);
        for seed in seeds {
            hasher.update(seed);
        }
        hasher.update(DERIVATION_MARKER);
        Self(hasher.finalize().into())
    }

    /// Hashes arbitrary bytes (e.g. a public key) into an address.
    #[must_use]
    pub fn from_hashed(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form keeps log lines readable.
        let full = hex::encode(self.0);
        write!(f, "Address({}..{})", &full[..8], &full[56..])
    }
}

impl FromStr for Address {
    type Err = KeeperError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches("0x");
        let bytes = hex::decode(trimmed)
            .map_err(|e| KeeperError::Configuration(format!("invalid address '{s}': {e}")))?;
        let array: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| {
            KeeperError::Configuration(format!(
                "invalid address '{s}': expected 32 bytes, got {}",
                v.len()
            ))
        })?;
        Ok(Self(array))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
