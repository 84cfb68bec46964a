//! Rough domain-name validation and normalization.
//!
//! The validator is intentionally permissive: it accepts any dot-separated
//! sequence of labels of 1..=63 characters drawn from `[a-z0-9-]` without a
//! leading or trailing hyphen. IDNA names are accepted in their ASCII
//! (punycode) form. It does not consult the public suffix list.

/// Maximum length of a single DNS label.
const MAX_LABEL_LEN: usize = 63;

pub fn is_domain_name(s: &str) -> bool {
    if s.is_empty() {
        return false;
    }

    for label in s.split('.') {
        let n = label.len();
        if n == 0 || n > MAX_LABEL_LEN {
            return false;
        }
        if !label
            .bytes()
            .all(|c| c == b'-' || c.is_ascii_lowercase() || c.is_ascii_digit())
        {
            return false;
        }
        if label.starts_with('-') || label.ends_with('-') {
            return false;
        }
    }

    true
}

/// Strips a single trailing dot, leaving the root name `"."` untouched.
pub fn remove_trailing_dot(s: &str) -> &str {
    if s.len() > 1 {
        s.strip_suffix('.').unwrap_or(s)
    } else {
        s
    }
}

/// Lowercases and strips the trailing dot. Returns `None` when the result is
/// not a plausible domain name.
pub fn string_to_domain(s: &str) -> Option<String> {
    let name = remove_trailing_dot(&s.to_ascii_lowercase()).to_string();
    if is_domain_name(&name) {
        Some(name)
    } else {
        None
    }
}

/// Query-name normalization used on the dispatch path: lowercase, trailing
/// dot removed except for the root zone itself.
pub fn normalize_query_name(s: &str) -> String {
    let lower = s.to_ascii_lowercase();
    remove_trailing_dot(&lower).to_string()
}

/// True when `parent` is equal to `child` or a proper suffix of it at a
/// label boundary: `example.com` covers `a.example.com` but not
/// `notexample.com`.
pub fn name_covers(parent: &str, child: &str) -> bool {
    if parent == "." {
        return true;
    }
    if let Some(head) = child.strip_suffix(parent) {
        head.is_empty() || head.ends_with('.')
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ordinary_names() {
        assert!(is_domain_name("example.com"));
        assert!(is_domain_name("a.b.c.d.example"));
        assert!(is_domain_name("xn--fiqs8s"));
        assert!(is_domain_name("com"));
        assert!(is_domain_name("123.example.com"));
    }

    #[test]
    fn rejects_bad_labels() {
        assert!(!is_domain_name(""));
        assert!(!is_domain_name(".example.com"));
        assert!(!is_domain_name("example..com"));
        assert!(!is_domain_name("-example.com"));
        assert!(!is_domain_name("example-.com"));
        assert!(!is_domain_name("exam ple.com"));
        assert!(!is_domain_name("EXAMPLE.com"));
        let long = "a".repeat(64);
        assert!(!is_domain_name(&long));
    }

    #[test]
    fn string_to_domain_normalizes() {
        assert_eq!(
            string_to_domain("Example.COM.").as_deref(),
            Some("example.com")
        );
        assert_eq!(string_to_domain("!bogus!"), None);
    }

    #[test]
    fn root_is_preserved() {
        assert_eq!(normalize_query_name("."), ".");
        assert_eq!(normalize_query_name("A.Example.Org."), "a.example.org");
    }

    #[test]
    fn cover_requires_label_boundary() {
        assert!(name_covers("example.com", "example.com"));
        assert!(name_covers("example.com", "a.example.com"));
        assert!(name_covers(".", "anything.at.all"));
        assert!(!name_covers("example.com", "notexample.com"));
        assert!(!name_covers("a.example.com", "example.com"));
    }
}
