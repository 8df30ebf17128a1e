use rand::rngs::StdRng;
use rand::SeedableRng;
use sha2::{Digest, Sha256};

use crate::hash::{Hash, HASH_BYTES};

/// Synthetic block hashes for when no upstream is reachable.
///
/// Seeded generators derive each hash as `sha256(seed_be || height_be)`, so a
/// replayed session sees the same blocks at the same heights. Unseeded ones
/// draw from an OS-seeded RNG.
pub struct SyntheticGenerator {
    seed: Option<u64>,
    rng: StdRng,
}

impl SyntheticGenerator {
    pub fn new(seed: Option<u64>) -> Self {
        Self {
            seed,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn is_seeded(&self) -> bool {
        self.seed.is_some()
    }

    pub fn hash_for(&mut self, height: u64) -> Hash {
        match self.seed {
            Some(seed) => {
                let mut hasher = Sha256::new();
                hasher.update(seed.to_be_bytes());
                hasher.update(height.to_be_bytes());
                let digest = hasher.finalize();
                let mut bytes = [0u8; HASH_BYTES];
                bytes.copy_from_slice(&digest);
                Hash::from_bytes(bytes)
            }
            None => loop {
                // All-zero is reserved as the "nothing yet" pattern.
                let h = Hash::random(&mut self.rng);
                if !h.is_zero() {
                    break h;
                }
            },
        }
    }
}
