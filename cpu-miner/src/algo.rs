//! Algorithm variants and their memory requirements.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Proof-of-work algorithm variant.
///
/// The variant decides how large each worker's scratch buffer must be; the
/// transform itself lives behind [`crate::hasher::HashExecutor`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Algorithm {
    #[default]
    Cryptonight,
    CryptonightLite,
    CryptonightHeavy,
}

impl Algorithm {
    /// Working-set size for a single hash, in bytes.
    pub const fn scratch_size(self) -> usize {
        match self {
            Algorithm::Cryptonight => 2 * 1024 * 1024,
            Algorithm::CryptonightLite => 1024 * 1024,
            Algorithm::CryptonightHeavy => 4 * 1024 * 1024,
        }
    }

    /// Scratch bytes needed by a worker computing `hash_factor` hashes per pass.
    pub const fn scratch_size_for(self, hash_factor: usize) -> usize {
        self.scratch_size() * hash_factor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use test_case::test_case;

    #[test_case(Algorithm::Cryptonight, "cryptonight", 2 << 20)]
    #[test_case(Algorithm::CryptonightLite, "cryptonight-lite", 1 << 20)]
    #[test_case(Algorithm::CryptonightHeavy, "cryptonight-heavy", 4 << 20)]
    fn names_and_sizes(algo: Algorithm, name: &str, size: usize) {
        assert_eq!(algo.to_string(), name);
        assert_eq!(Algorithm::from_str(name).unwrap(), algo);
        assert_eq!(algo.scratch_size(), size);
    }

    #[test]
    fn hash_factor_multiplies_working_set() {
        assert_eq!(
            Algorithm::Cryptonight.scratch_size_for(3),
            3 * Algorithm::Cryptonight.scratch_size()
        );
    }
}
