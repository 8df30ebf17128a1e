use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::FateError;

pub const HASH_BYTES: usize = 32;
pub const HASH_HEX_LEN: usize = HASH_BYTES * 2;
pub const HASH_PREFIX: &str = "0x";

/// Block hash the feed starts from before anything has been fetched.
pub const GENESIS_HASH: &str =
    "0xd4e56740f876aef8c010b86a40d5f56745a118d0906a34e69aec8c0db1cb8fa3";

/// A 32-byte hash, always held as `0x` followed by 64 lowercase hex digits.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Hash(String);

impl Hash {
    /// Parse and normalize. Accepts an optional `0x`/`0X` prefix and either
    /// hex case; anything else, surrounding whitespace included, is
    /// `InvalidHash`.
    pub fn parse(input: &str) -> Result<Self, FateError> {
        let digits = input
            .strip_prefix(HASH_PREFIX)
            .or_else(|| input.strip_prefix("0X"))
            .unwrap_or(input);
        if digits.len() != HASH_HEX_LEN {
            return Err(FateError::invalid_hash(format!(
                "expected {} hex digits, got {}",
                HASH_HEX_LEN,
                digits.len()
            )));
        }
        let mut bytes = [0u8; HASH_BYTES];
        hex::decode_to_slice(digits, &mut bytes)
            .map_err(|e| FateError::invalid_hash(e.to_string()))?;
        Ok(Self::from_bytes(bytes))
    }

    pub fn from_bytes(bytes: [u8; HASH_BYTES]) -> Self {
        Self(format!("{}{}", HASH_PREFIX, hex::encode(bytes)))
    }

    /// Uniformly random hash, used for decoys and the synthetic feed.
    pub fn random<R: RngCore + ?Sized>(rng: &mut R) -> Self {
        let mut bytes = [0u8; HASH_BYTES];
        rng.fill_bytes(&mut bytes);
        Self::from_bytes(bytes)
    }

    pub fn genesis() -> Self {
        Self(GENESIS_HASH.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The 64 hex digits without the prefix.
    pub fn digits(&self) -> &str {
        &self.0[HASH_PREFIX.len()..]
    }

    pub fn to_bytes(&self) -> [u8; HASH_BYTES] {
        let mut bytes = [0u8; HASH_BYTES];
        // The stored form is validated on construction.
        let _ = hex::decode_to_slice(self.digits(), &mut bytes);
        bytes
    }

    pub fn is_zero(&self) -> bool {
        self.digits().bytes().all(|b| b == b'0')
    }

    /// Short form for log lines: `0xd4e5…8fa3`.
    pub fn short(&self) -> String {
        let d = self.digits();
        format!("{}{}…{}", HASH_PREFIX, &d[..4], &d[HASH_HEX_LEN - 4..])
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.0)
    }
}

impl FromStr for Hash {
    type Err = FateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Hash::parse(s)
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Hash::parse(&raw).map_err(serde::de::Error::custom)
    }
}
