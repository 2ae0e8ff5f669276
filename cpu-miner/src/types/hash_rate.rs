//! Hashrate measurement type.

use std::time::Duration;

use serde::Serialize;

/// Hashrate measurement, in hashes per second.
///
/// Memory-hard CPU algorithms run at hundreds to thousands of hashes per
/// second per core, so the value keeps fractional precision.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize)]
#[serde(transparent)]
pub struct HashRate(pub f64);

impl HashRate {
    /// Rate from a hash count over an interval. Zero for an empty interval.
    pub fn from_count(hashes: u64, over: Duration) -> Self {
        let secs = over.as_secs_f64();
        if secs <= 0.0 {
            return Self(0.0);
        }
        Self(hashes as f64 / secs)
    }

    /// Create from kilohashes per second
    pub fn from_kilohashes(kh: f64) -> Self {
        Self(kh * 1_000.0)
    }

    /// Get value as hashes per second
    pub fn as_hashes(&self) -> f64 {
        self.0
    }

    /// Get value as kilohashes per second
    pub fn as_kilohashes(&self) -> f64 {
        self.0 / 1_000.0
    }

    /// Get value as megahashes per second
    pub fn as_megahashes(&self) -> f64 {
        self.0 / 1_000_000.0
    }

    /// Returns true if the hashrate is zero.
    pub fn is_zero(&self) -> bool {
        self.0 == 0.0
    }

    /// Expected number of hashes in the given duration.
    pub fn hashes_in(&self, duration: Duration) -> u64 {
        (self.0 * duration.as_secs_f64()) as u64
    }

    /// Format as human-readable string with appropriate units
    pub fn to_human_readable(&self) -> String {
        if self.0 >= 1_000_000.0 {
            format!("{:.2} MH/s", self.as_megahashes())
        } else if self.0 >= 1_000.0 {
            format!("{:.2} kH/s", self.as_kilohashes())
        } else {
            format!("{:.1} H/s", self.0)
        }
    }
}

impl From<HashRate> for f64 {
    fn from(rate: HashRate) -> Self {
        rate.0
    }
}

impl std::ops::Add for HashRate {
    type Output = HashRate;

    fn add(self, other: HashRate) -> HashRate {
        HashRate(self.0 + other.0)
    }
}

impl std::iter::Sum for HashRate {
    fn sum<I: Iterator<Item = HashRate>>(iter: I) -> Self {
        iter.fold(HashRate::default(), |a, b| a + b)
    }
}

impl std::fmt::Display for HashRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_human_readable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hashrate_conversions() {
        let rate = HashRate::from_kilohashes(2.5);
        assert_eq!(rate.as_hashes(), 2500.0);
        assert_eq!(rate.to_human_readable(), "2.50 kH/s");

        assert_eq!(HashRate(812.34).to_human_readable(), "812.3 H/s");
        assert_eq!(HashRate(3_250_000.0).to_human_readable(), "3.25 MH/s");
    }

    #[test]
    fn test_hashrate_from_count() {
        let rate = HashRate::from_count(1500, Duration::from_millis(2500));
        assert_eq!(rate.as_hashes(), 600.0);
        assert!(HashRate::from_count(10, Duration::ZERO).is_zero());
        assert_eq!(rate.hashes_in(Duration::from_secs(10)), 6000);
    }

    #[test]
    fn test_hashrate_sum() {
        let total: HashRate = [HashRate(100.0), HashRate(250.5)].into_iter().sum();
        assert_eq!(total, HashRate(350.5));
    }
}
