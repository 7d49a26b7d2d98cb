//! Optimistic concurrency for space records.
//!
//! Every accepted mutation bumps the record's version. A request that was
//! read against an older version is rejected untouched; the caller must
//! re-read and retry. Nothing is merged.

use crate::error::{SpaceError, SpaceResult};

/// Checks the version a request was read against.
///
/// `None` means the caller did not read the record first (host-driven
/// refreshes, reconciliation) and is accepted at any version.
pub fn validate(expected: Option<u64>, current: u64) -> SpaceResult<()> {
    match expected {
        Some(expected) if expected != current => Err(SpaceError::Conflict { expected, current }),
        _ => Ok(()),
    }
}

/// The version a record carries after one more accepted mutation.
pub fn next_version(current: u64) -> u64 {
    current.saturating_add(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matching_version_is_accepted() {
        assert!(validate(Some(3), 3).is_ok());
    }

    #[test]
    fn test_stale_version_is_a_conflict() {
        assert_eq!(
            validate(Some(3), 4),
            Err(SpaceError::Conflict {
                expected: 3,
                current: 4
            })
        );
    }

    #[test]
    fn test_version_from_the_future_is_also_a_conflict() {
        assert!(validate(Some(9), 4).is_err(), "only exact matches pass");
    }

    #[test]
    fn test_unversioned_request_is_accepted() {
        assert!(validate(None, 17).is_ok());
        assert_eq!(next_version(17), 18);
    }
}
