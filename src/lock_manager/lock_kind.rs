//! Lock disciplines and batch request ordering

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The three lock disciplines, ordered by escalation
///
/// - `Read` shares with readers, excludes `Write` and `NonExWrite`
/// - `NonExWrite` shares with other `NonExWrite` holders, excludes `Read` and `Write`
/// - `Write` excludes everything
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockKind {
    Read,
    NonExWrite,
    Write,
}

impl LockKind {
    /// Whether a holder of `self` may coexist with a holder of `other`
    #[must_use]
    pub fn compatible_with(self, other: LockKind) -> bool {
        matches!(
            (self, other),
            (LockKind::Read, LockKind::Read) | (LockKind::NonExWrite, LockKind::NonExWrite)
        )
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            LockKind::Read => "read",
            LockKind::NonExWrite => "non-ex-write",
            LockKind::Write => "write",
        }
    }
}

impl fmt::Display for LockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a batch acquisition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRequest {
    pub key: String,
    pub kind: LockKind,
}

/// Merge read, non-exclusive-write and write key lists into one request list.
///
/// Duplicate keys collapse to their most restrictive kind and the result is
/// sorted lexicographically by key. Every batch acquisition in the process
/// goes through this ordering, so two batches with overlapping keys never
/// wait on each other in a cycle.
#[must_use]
pub fn sorted_unique_requests<R, N, W>(read: R, non_ex_write: N, write: W) -> Vec<LockRequest>
where
    R: IntoIterator,
    R::Item: AsRef<str>,
    N: IntoIterator,
    N::Item: AsRef<str>,
    W: IntoIterator,
    W::Item: AsRef<str>,
{
    let mut merged: BTreeMap<String, LockKind> = BTreeMap::new();
    let mut add = |key: &str, kind: LockKind| {
        merged
            .entry(key.to_string())
            .and_modify(|existing| *existing = (*existing).max(kind))
            .or_insert(kind);
    };
    for key in read {
        add(key.as_ref(), LockKind::Read);
    }
    for key in non_ex_write {
        add(key.as_ref(), LockKind::NonExWrite);
    }
    for key in write {
        add(key.as_ref(), LockKind::Write);
    }
    merged
        .into_iter()
        .map(|(key, kind)| LockRequest { key, kind })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compatibility_matrix() {
        use LockKind::*;
        assert!(Read.compatible_with(Read));
        assert!(NonExWrite.compatible_with(NonExWrite));
        assert!(!Read.compatible_with(NonExWrite));
        assert!(!NonExWrite.compatible_with(Read));
        for kind in [Read, NonExWrite, Write] {
            assert!(!Write.compatible_with(kind));
            assert!(!kind.compatible_with(Write));
        }
    }

    #[test]
    fn test_duplicates_collapse_to_most_restrictive() {
        let requests = sorted_unique_requests(["b", "a", "c"], ["c"], ["a"]);
        assert_eq!(
            requests,
            vec![
                LockRequest { key: "a".into(), kind: LockKind::Write },
                LockRequest { key: "b".into(), kind: LockKind::Read },
                LockRequest { key: "c".into(), kind: LockKind::NonExWrite },
            ]
        );
    }

    #[test]
    fn test_empty_batch() {
        let none: [&str; 0] = [];
        assert!(sorted_unique_requests(none, none, none).is_empty());
    }
}
