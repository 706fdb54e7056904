//! Seed resolution
//!
//! Explicit seeds pass through untouched so a generation can be reproduced.
//! Missing seeds come straight from the operating system's CSPRNG; no
//! process-wide generator is shared with anything else.

use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{Error, Result};

/// Seeds are 63-bit: `0..=MAX_SEED`.
pub const MAX_SEED: u64 = (1 << 63) - 1;

pub fn resolve_seed(seed: Option<u64>) -> Result<u64> {
    match seed {
        Some(seed) if seed > MAX_SEED => Err(Error::InvalidRequest(format!(
            "seed must be below 2^63, got {}",
            seed
        ))),
        Some(seed) => Ok(seed),
        None => Ok(random_seed()),
    }
}

fn random_seed() -> u64 {
    OsRng.next_u64() >> 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_seed_passes_through() {
        assert_eq!(resolve_seed(Some(42)).unwrap(), 42);
        assert_eq!(resolve_seed(Some(0)).unwrap(), 0);
        assert_eq!(resolve_seed(Some(MAX_SEED)).unwrap(), MAX_SEED);
    }

    #[test]
    fn seed_above_63_bits_is_rejected() {
        let err = resolve_seed(Some(MAX_SEED + 1)).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn random_seeds_fit_and_differ() {
        let seeds: Vec<u64> = (0..16).map(|_| resolve_seed(None).unwrap()).collect();
        assert!(seeds.iter().all(|&s| s <= MAX_SEED));

        let unique: std::collections::HashSet<_> = seeds.iter().collect();
        assert_eq!(unique.len(), seeds.len());
    }
}
