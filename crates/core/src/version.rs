//! Resource versioning and optimistic concurrency expectations.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Monotonic version of a materialised resource, scoped to its upstream id.
///
/// Starts at 1 on first materialisation and only moves forward when the
/// materialised content actually changes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionId(u64);

impl VersionId {
    pub const INITIAL: VersionId = VersionId(1);

    pub fn new(value: u64) -> DomainResult<Self> {
        if value == 0 {
            return Err(DomainError::validation("version ids start at 1"));
        }
        Ok(Self(value))
    }

    pub fn get(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl core::fmt::Display for VersionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Optimistic concurrency expectation for a resource write.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// No resource may exist yet for the upstream id (first materialisation).
    Absent,
    /// The stored resource must be at exactly this version.
    Exact(VersionId),
}

impl ExpectedVersion {
    pub fn matches(self, actual: Option<VersionId>) -> bool {
        match (self, actual) {
            (ExpectedVersion::Absent, None) => true,
            (ExpectedVersion::Exact(v), Some(a)) => v == a,
            _ => false,
        }
    }

    pub fn check(self, actual: Option<VersionId>) -> DomainResult<()> {
        if self.matches(actual) {
            Ok(())
        } else {
            Err(DomainError::conflict(format!(
                "stale write rejected (expected: {self:?}, actual: {actual:?})"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn zero_is_not_a_version() {
        assert!(VersionId::new(0).is_err());
        assert_eq!(VersionId::new(1).unwrap(), VersionId::INITIAL);
    }

    #[test]
    fn absent_only_matches_missing_rows() {
        assert!(ExpectedVersion::Absent.matches(None));
        assert!(!ExpectedVersion::Absent.matches(Some(VersionId::INITIAL)));
    }

    #[test]
    fn exact_rejects_other_versions() {
        let v2 = VersionId::INITIAL.next();
        assert!(ExpectedVersion::Exact(v2).check(Some(v2)).is_ok());
        let err = ExpectedVersion::Exact(VersionId::INITIAL)
            .check(Some(v2))
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
        assert!(ExpectedVersion::Exact(v2).check(None).is_err());
    }

    proptest! {
        #[test]
        fn next_is_strictly_increasing(start in 1u64..u64::MAX / 2, steps in 0usize..64) {
            let mut v = VersionId::new(start).unwrap();
            for _ in 0..steps {
                let n = v.next();
                prop_assert!(n > v);
                v = n;
            }
        }
    }
}
