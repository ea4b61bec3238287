//! Entry versions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A totally ordered entry version.
///
/// Every key starts at [`Version::initial`] and advances by one
/// [`Version::next`] step per accepted write.
pub trait Version: Clone + Ord + fmt::Debug + fmt::Display + Send + Sync + 'static {
    /// Version of a key that has never been written (or was deleted).
    fn initial() -> Self;

    /// The version following `self`.
    fn next(&self) -> Self;
}

/// Counter version: the version after N accepted writes is N.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct MonotonicVersion(pub u64);

impl Version for MonotonicVersion {
    fn initial() -> Self {
        MonotonicVersion(0)
    }

    fn next(&self) -> Self {
        MonotonicVersion(self.0.saturating_add(1))
    }
}

impl fmt::Display for MonotonicVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for MonotonicVersion {
    fn from(value: u64) -> Self {
        MonotonicVersion(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_version_steps() {
        let initial = MonotonicVersion::initial();
        assert_eq!(initial, MonotonicVersion(0));
        assert_eq!(initial.next().next(), MonotonicVersion(2));
        assert!(initial < initial.next());
        assert_eq!(initial.next().to_string(), "1");
    }
}
