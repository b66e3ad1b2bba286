//! Validated percentile cut points and their metric name suffixes.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// A percentile outside of the range `[0, 100]` was requested.
#[derive(Clone, Copy, Debug, PartialEq, thiserror::Error)]
#[error("invalid percentile {0}, must be between 0 and 100")]
pub struct InvalidPercentile(pub f64);

/// A validated percentile cut point in the range `[0, 100]`.
///
/// Percentiles are totally ordered and hashable, so they can be used as keys of sets and maps.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Percentile(f64);

impl Percentile {
    /// The median.
    pub const P50: Self = Self(50.0);
    /// The 95th percentile, requested by default.
    pub const P95: Self = Self(95.0);

    /// Validates and creates a percentile.
    pub fn new(value: f64) -> Result<Self, InvalidPercentile> {
        if (0.0..=100.0).contains(&value) {
            // Normalize negative zero, so that hashing agrees with equality.
            Ok(Self(value + 0.0))
        } else {
            Err(InvalidPercentile(value))
        }
    }

    /// Returns the percentile as number.
    pub fn value(self) -> f64 {
        self.0
    }

    /// Returns the suffix appended to a metric name for this percentile.
    ///
    /// Whole percentiles are written as is, so `95` becomes `p95`. Fractional percentiles drop the
    /// decimal point and pad the integral part to two digits, so `99.9` becomes `p999` and `9.99`
    /// becomes `p0999`. Distinct percentiles never share a suffix.
    pub fn suffix(self) -> String {
        let repr = self.to_string();
        match repr.split_once('.') {
            Some((integral, fraction)) => format!("p{integral:0>2}{fraction}"),
            None => format!("p{repr}"),
        }
    }
}

impl TryFrom<f64> for Percentile {
    type Error = InvalidPercentile;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Percentile> for f64 {
    fn from(percentile: Percentile) -> Self {
        percentile.0
    }
}

impl PartialEq for Percentile {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Percentile {}

impl PartialOrd for Percentile {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Percentile {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl Hash for Percentile {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

impl fmt::Display for Percentile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds() {
        assert!(Percentile::new(0.0).is_ok());
        assert!(Percentile::new(100.0).is_ok());
        assert_eq!(Percentile::new(-1.0), Err(InvalidPercentile(-1.0)));
        assert_eq!(Percentile::new(100.1), Err(InvalidPercentile(100.1)));
        assert!(Percentile::new(f64::NAN).is_err());
    }

    #[test]
    fn test_suffix() {
        assert_eq!(Percentile::P95.suffix(), "p95");
        assert_eq!(Percentile::new(99.9).unwrap().suffix(), "p999");
        assert_eq!(Percentile::new(99.999).unwrap().suffix(), "p99999");
        assert_eq!(Percentile::new(0.0).unwrap().suffix(), "p0");
        assert_eq!(Percentile::new(0.5).unwrap().suffix(), "p005");
        assert_eq!(Percentile::new(5.0).unwrap().suffix(), "p5");
        assert_eq!(Percentile::new(100.0).unwrap().suffix(), "p100");
    }

    #[test]
    fn test_suffix_unambiguous() {
        assert_eq!(Percentile::new(9.99).unwrap().suffix(), "p0999");
        assert_ne!(
            Percentile::new(9.99).unwrap().suffix(),
            Percentile::new(99.9).unwrap().suffix()
        );
        assert_ne!(
            Percentile::new(10.0).unwrap().suffix(),
            Percentile::new(1.0).unwrap().suffix()
        );
    }

    #[test]
    fn test_negative_zero() {
        assert_eq!(Percentile::new(-0.0).unwrap(), Percentile::new(0.0).unwrap());
    }

    #[test]
    fn test_serde() {
        let percentiles: Vec<Percentile> = serde_json::from_str("[95, 99.9]").unwrap();
        assert_eq!(percentiles[1].value(), 99.9);
        assert!(serde_json::from_str::<Percentile>("101").is_err());
    }
}
