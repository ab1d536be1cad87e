//! Version ranges
//!
//! A rowset covers the closed range `[start, end]` of committed versions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed range of versions covered by one rowset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Version {
    pub start: i64,
    pub end: i64,
}

/// Ordered list of version ranges
pub type Versions = Vec<Version>;

impl Version {
    pub const fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    /// Range holding exactly one version
    pub const fn singleton(v: i64) -> Self {
        Self { start: v, end: v }
    }

    /// Whether `v` lies in this range
    pub fn contains_version(&self, v: i64) -> bool {
        self.start <= v && v <= self.end
    }

    /// Whether `other` lies entirely inside this range
    pub fn contains(&self, other: &Version) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn overlaps(&self, other: &Version) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}-{}]", self.start, self.end)
    }
}

/// Versions in `[0, spec_version]` not covered by `existing`, as singletons.
pub fn calc_missed_versions<I>(spec_version: i64, existing: I) -> Versions
where
    I: IntoIterator<Item = Version>,
{
    let mut existing: Vec<Version> = existing.into_iter().collect();
    existing.sort();

    let mut last_version = -1i64;
    let mut missed = Versions::new();
    for version in existing {
        if version.start > last_version + 1 {
            let mut v = last_version + 1;
            while v < version.start && v <= spec_version {
                missed.push(Version::singleton(v));
                v += 1;
            }
        }
        last_version = last_version.max(version.end);
        if last_version >= spec_version {
            break;
        }
    }
    for v in (last_version + 1)..=spec_version {
        missed.push(Version::singleton(v));
    }
    missed
}

/// First pair of overlapping ranges, if any
pub fn find_overlap(versions: &[Version]) -> Option<(Version, Version)> {
    let mut sorted = versions.to_vec();
    sorted.sort();
    sorted
        .windows(2)
        .find(|w| w[0].overlaps(&w[1]))
        .map(|w| (w[0], w[1]))
}

/// Highest version reachable from version 0 without a hole, or -1
pub fn max_continuous_version<I>(existing: I) -> i64
where
    I: IntoIterator<Item = Version>,
{
    let mut existing: Vec<Version> = existing.into_iter().collect();
    existing.sort();

    let mut last = -1i64;
    for version in existing {
        if version.start > last + 1 {
            break;
        }
        last = last.max(version.end);
    }
    last
}

/// Render a version list for logs
pub fn format_versions(versions: &[Version]) -> String {
    let parts: Vec<String> = versions.iter().map(|v| v.to_string()).collect();
    format!("[{}]", parts.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(start: i64, end: i64) -> Version {
        Version::new(start, end)
    }

    #[test]
    fn test_missed_versions_fill_gaps_and_tail() {
        let existing = vec![v(0, 5), v(6, 7)];
        let missed = calc_missed_versions(10, existing);
        assert_eq!(missed, vec![v(8, 8), v(9, 9), v(10, 10)]);
    }

    #[test]
    fn test_missed_versions_inner_hole() {
        let existing = vec![v(4, 6), v(0, 1), v(9, 12)];
        let missed = calc_missed_versions(10, existing);
        assert_eq!(missed, vec![v(2, 2), v(3, 3), v(7, 7), v(8, 8)]);
    }

    #[test]
    fn test_missed_versions_satisfied() {
        let existing = vec![v(0, 5), v(6, 12)];
        assert!(calc_missed_versions(10, existing).is_empty());
        assert!(calc_missed_versions(12, vec![v(0, 12)]).is_empty());
    }

    #[test]
    fn test_missed_versions_empty_tablet() {
        let missed = calc_missed_versions(2, Vec::new());
        assert_eq!(missed, vec![v(0, 0), v(1, 1), v(2, 2)]);
    }

    #[test]
    fn test_find_overlap() {
        assert!(find_overlap(&[v(0, 5), v(6, 8), v(9, 10)]).is_none());
        assert_eq!(
            find_overlap(&[v(0, 5), v(9, 10), v(5, 8)]),
            Some((v(0, 5), v(5, 8)))
        );
    }

    #[test]
    fn test_max_continuous_version() {
        assert_eq!(max_continuous_version(vec![v(0, 5), v(6, 7), v(9, 10)]), 7);
        assert_eq!(max_continuous_version(vec![v(1, 5)]), -1);
        assert_eq!(max_continuous_version(Vec::new()), -1);
    }

    #[test]
    fn test_contains_and_display() {
        assert!(v(9, 10).contains(&v(9, 9)));
        assert!(!v(9, 10).contains(&v(8, 9)));
        assert_eq!(v(7, 12).to_string(), "[7-12]");
        assert_eq!(format_versions(&[v(8, 8), v(9, 10)]), "[[8-8], [9-10]]");
    }
}
