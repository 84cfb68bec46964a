//! Suffix-matching domain set.
//!
//! Patterns are bucketed by the first two ASCII characters of their first
//! label (short labels padded with `-`), so a lookup only ever touches the
//! buckets for the suffixes of the queried name instead of the whole set.

use compact_str::CompactString;
use dnsteer_domain::name::string_to_domain;
use rustc_hash::{FxBuildHasher, FxHashMap, FxHashSet};

type Bucket = FxHashSet<CompactString>;

fn bucket_key(name: &str) -> [u8; 2] {
    let bytes = name.as_bytes();
    let first = bytes.first().copied().unwrap_or(b'-');
    let second = match bytes.get(1) {
        Some(b'.') | None => b'-',
        Some(&c) => c,
    };
    [first, second]
}

#[derive(Debug, Default, Clone)]
pub struct DomainSet {
    buckets: FxHashMap<[u8; 2], Bucket>,
}

impl DomainSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a suffix pattern. Returns false when `name` does not validate
    /// as a domain name.
    pub fn add(&mut self, name: &str) -> bool {
        let Some(name) = string_to_domain(name) else {
            return false;
        };
        self.buckets
            .entry(bucket_key(&name))
            .or_insert_with(|| Bucket::with_hasher(FxBuildHasher))
            .insert(CompactString::from(name));
        true
    }

    pub fn len(&self) -> usize {
        self.buckets.values().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.buckets
            .values()
            .flat_map(|b| b.iter().map(|s| s.as_str()))
    }

    /// True when any stored pattern equals `child` or is a proper suffix of
    /// it at a label boundary. The walk visits `child`, then `child` with
    /// its first label stripped, and so on; each candidate is an exact
    /// bucket lookup. `child` must be non-empty, lower case, and without a
    /// trailing dot.
    pub fn matches(&self, child: &str) -> bool {
        debug_assert!(!child.is_empty(), "callers guarantee a non-empty name");

        let mut candidate = child;
        loop {
            if let Some(bucket) = self.buckets.get(&bucket_key(candidate)) {
                if bucket.contains(candidate) {
                    return true;
                }
            }
            match candidate.find('.') {
                Some(i) if i + 1 < candidate.len() => candidate = &candidate[i + 1..],
                _ => return false,
            }
        }
    }
}

impl std::fmt::Display for DomainSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, name) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", name)?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn added_names_match_themselves_and_children() {
        let mut set = DomainSet::new();
        assert!(set.add("example.com"));
        assert!(set.add("x.org"));

        assert!(set.matches("example.com"));
        assert!(set.matches("a.example.com"));
        assert!(set.matches("deep.sub.example.com"));
        assert!(set.matches("x.org"));
        assert!(set.matches("mail.x.org"));
    }

    #[test]
    fn suffix_requires_label_boundary() {
        let mut set = DomainSet::new();
        set.add("example.com");

        assert!(!set.matches("notexample.com"));
        assert!(!set.matches("com"));
        assert!(!set.matches("example.org"));
    }

    #[test]
    fn short_labels_are_padded() {
        let mut set = DomainSet::new();
        set.add("t.co");
        assert!(set.matches("t.co"));
        assert!(set.matches("link.t.co"));
        assert!(!set.matches("tt.co"));
    }

    #[test]
    fn invalid_names_are_rejected() {
        let mut set = DomainSet::new();
        assert!(!set.add("not a domain"));
        assert!(!set.add(""));
        assert!(set.add("Example.COM."));
        assert_eq!(set.len(), 1);
        assert!(set.matches("example.com"));
    }

    #[test]
    fn len_counts_across_buckets() {
        let mut set = DomainSet::new();
        set.add("alpha.test");
        set.add("beta.test");
        set.add("gamma.test");
        assert_eq!(set.len(), 3);
    }
}
