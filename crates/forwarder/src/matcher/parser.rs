//! Name-list parsing.
//!
//! Two line forms are accepted:
//!
//! ```text
//! example.com                  # bare domain
//! server=/example.org/10.0.0.1 # dnsmasq style, only the domain is used
//! ```
//!
//! `#` starts a comment that runs to end of line. Invalid entries are
//! logged and dropped rather than failing the whole list.

use super::domain_set::DomainSet;
use tracing::{debug, warn};

pub struct ParseOutcome {
    pub names: DomainSet,
    pub total_lines: usize,
}

pub fn parse_name_list(content: &str) -> ParseOutcome {
    let mut names = DomainSet::new();
    let mut total_lines = 0;

    for raw in content.lines() {
        total_lines += 1;

        let line = match raw.find('#') {
            Some(i) => &raw[..i],
            None => raw,
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let fields: Vec<&str> = line.split('/').collect();
        if fields.len() != 3 {
            // The whole line is a domain name.
            if !names.add(line) {
                warn!(entry = %line, "dropping entry, not a domain name");
            }
            continue;
        }

        if fields[0] != "server=" {
            continue;
        }
        if !names.add(fields[1]) {
            warn!(entry = %fields[1], "dropping server= entry, not a domain name");
        }
    }

    debug!(
        names = names.len(),
        total_lines, "name list parsed"
    );
    ParseOutcome { names, total_lines }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_domains_and_comments() {
        let out = parse_name_list("example.com\n# full comment\nfoo.org # trailing\n\n");
        assert_eq!(out.total_lines, 4);
        assert_eq!(out.names.len(), 2);
        assert!(out.names.matches("a.example.com"));
        assert!(out.names.matches("foo.org"));
    }

    #[test]
    fn parses_dnsmasq_server_lines() {
        let out = parse_name_list("server=/example.net/114.114.114.114\nserver=/other.net/#\n");
        assert!(out.names.matches("example.net"));
        assert!(out.names.matches("other.net"));
        assert_eq!(out.names.len(), 2);
    }

    #[test]
    fn drops_invalid_entries() {
        let out = parse_name_list("good.example\nbad entry with spaces\nserver=/-bad-/x\n");
        assert_eq!(out.names.len(), 1);
        assert_eq!(out.total_lines, 3);
    }

    #[test]
    fn ignores_unrelated_slash_lines() {
        let out = parse_name_list("address=/example.com/10.0.0.1\n");
        assert_eq!(out.names.len(), 0);
    }
}
