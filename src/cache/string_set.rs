//! Order-independent sets of cache keys

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Immutable, deduplicated set of strings
///
/// Two sets with the same members compare and hash equal however they were
/// built. [`descriptive_string`](Self::descriptive_string) gives a canonical
/// textual identity usable as a map key across processes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StringSet {
    members: BTreeSet<String>,
}

impl StringSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    #[must_use]
    pub fn contains(&self, member: &str) -> bool {
        self.members.contains(member)
    }

    /// Members in sorted order
    pub fn iter(&self) -> impl Iterator<Item = &str> + '_ {
        self.members.iter().map(String::as_str)
    }

    /// Whether any member is shared with `other`
    #[must_use]
    pub fn intersects(&self, other: &StringSet) -> bool {
        let (small, large) = if self.len() <= other.len() {
            (self, other)
        } else {
            (other, self)
        };
        small.iter().any(|member| large.contains(member))
    }

    #[must_use]
    pub fn union(&self, other: &StringSet) -> StringSet {
        StringSet {
            members: self.members.union(&other.members).cloned().collect(),
        }
    }

    #[must_use]
    pub fn difference(&self, other: &StringSet) -> StringSet {
        StringSet {
            members: self.members.difference(&other.members).cloned().collect(),
        }
    }

    /// Canonical form: sorted members, `:`-separated, with `\` and `:`
    /// escaped by a preceding `\`
    ///
    /// ```
    /// use crawl_coord::cache::StringSet;
    ///
    /// let set: StringSet = ["b", "a:1"].into_iter().collect();
    /// assert_eq!(set.descriptive_string(), "a\\:1:b");
    /// ```
    #[must_use]
    pub fn descriptive_string(&self) -> String {
        let mut out = String::new();
        for (i, member) in self.members.iter().enumerate() {
            if i > 0 {
                out.push(':');
            }
            for ch in member.chars() {
                if ch == ':' || ch == '\\' {
                    out.push('\\');
                }
                out.push(ch);
            }
        }
        out
    }
}

impl<S: Into<String>> FromIterator<S> for StringSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            members: iter.into_iter().map(Into::into).collect(),
        }
    }
}

impl<'a> IntoIterator for &'a StringSet {
    type Item = &'a String;
    type IntoIter = std::collections::btree_set::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.members.iter()
    }
}

impl fmt::Display for StringSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}", self.descriptive_string())
    }
}
