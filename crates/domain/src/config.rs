//! Typed zone configuration.
//!
//! The host server's config parser is responsible for turning its own
//! directive syntax into [`ZoneConfig`] values; this crate only validates
//! them. Field defaults mirror the documented directive defaults.

use crate::endpoint::Endpoint;
use crate::errors::ForwardError;
use crate::name::string_to_domain;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

pub const MIN_PATH_RELOAD: Duration = Duration::from_secs(1);
pub const MIN_URL_RELOAD: Duration = Duration::from_secs(15);
pub const MIN_URL_READ_TIMEOUT: Duration = Duration::from_secs(3);
pub const MIN_HEALTH_CHECK: Duration = Duration::from_secs(1);
pub const MIN_EXPIRE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    #[default]
    Random,
    RoundRobin,
    Sequential,
}

/// TLS material for TLS and DoH upstreams. All paths are optional; an empty
/// config means system roots and no client certificate.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Default)]
pub struct TlsConfig {
    #[serde(default)]
    pub ca_cert: Option<PathBuf>,
    #[serde(default)]
    pub client_cert: Option<PathBuf>,
    #[serde(default)]
    pub client_key: Option<PathBuf>,
}

/// One zone block: a set of name sources bound to a pool of upstreams.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ZoneConfig {
    /// Match pattern sources: `.` (match any), file paths, or https URLs.
    pub from: Vec<String>,

    /// Upstream endpoints, in `Endpoint` scheme syntax.
    pub to: Vec<String>,

    /// Names excluded from this zone.
    #[serde(default)]
    pub except: Vec<String>,

    /// Names matched in addition to the `from` sources.
    #[serde(default)]
    pub inline: Vec<String>,

    #[serde(default = "default_path_reload_ms")]
    pub path_reload_ms: u64,

    #[serde(default = "default_url_reload_ms")]
    pub url_reload_ms: u64,

    #[serde(default = "default_url_read_timeout_ms")]
    pub url_read_timeout_ms: u64,

    #[serde(default)]
    pub policy: SelectionPolicy,

    /// Random fallback over all hosts when every host is down.
    #[serde(default)]
    pub spray: bool,

    /// Failure count at which a host is considered down; 0 disables.
    #[serde(default = "default_max_fails")]
    pub max_fails: i32,

    /// Cap on immediate same-host retries after a cached connection died.
    #[serde(default = "default_max_retry")]
    pub max_retry: i32,

    #[serde(default = "default_health_check_ms")]
    pub health_check_ms: u64,

    /// Clear the RD bit on health probes.
    #[serde(default)]
    pub no_rec: bool,

    /// Idle connection expiry.
    #[serde(default = "default_expire_ms")]
    pub expire_ms: u64,

    #[serde(default)]
    pub tls: Option<TlsConfig>,

    #[serde(default)]
    pub tls_servername: Option<String>,

    /// Resolvers used to translate DoH/URL hostnames, `ip[:port]` each.
    #[serde(default)]
    pub bootstrap: Vec<String>,

    /// Kernel ipset table names receiving answered addresses.
    #[serde(default)]
    pub ipset: Vec<String>,

    /// PF tables, `name[:anchor]` each.
    #[serde(default)]
    pub pf: Vec<String>,

    /// Disable IPv6 dials and AAAA bootstrap results.
    #[serde(default)]
    pub no_ipv6: bool,
}

fn default_path_reload_ms() -> u64 {
    2_000
}
fn default_url_reload_ms() -> u64 {
    30 * 60 * 1_000
}
fn default_url_read_timeout_ms() -> u64 {
    15_000
}
fn default_max_fails() -> i32 {
    3
}
fn default_max_retry() -> i32 {
    10
}
fn default_health_check_ms() -> u64 {
    2_000
}
fn default_expire_ms() -> u64 {
    15_000
}

impl ZoneConfig {
    pub fn new(from: Vec<String>, to: Vec<String>) -> Self {
        Self {
            from,
            to,
            except: Vec::new(),
            inline: Vec::new(),
            path_reload_ms: default_path_reload_ms(),
            url_reload_ms: default_url_reload_ms(),
            url_read_timeout_ms: default_url_read_timeout_ms(),
            policy: SelectionPolicy::default(),
            spray: false,
            max_fails: default_max_fails(),
            max_retry: default_max_retry(),
            health_check_ms: default_health_check_ms(),
            no_rec: false,
            expire_ms: default_expire_ms(),
            tls: None,
            tls_servername: None,
            bootstrap: Vec::new(),
            ipset: Vec::new(),
            pf: Vec::new(),
            no_ipv6: false,
        }
    }

    pub fn path_reload(&self) -> Duration {
        Duration::from_millis(self.path_reload_ms)
    }
    pub fn url_reload(&self) -> Duration {
        Duration::from_millis(self.url_reload_ms)
    }
    pub fn url_read_timeout(&self) -> Duration {
        Duration::from_millis(self.url_read_timeout_ms)
    }
    pub fn health_check(&self) -> Duration {
        Duration::from_millis(self.health_check_ms)
    }
    pub fn expire(&self) -> Duration {
        Duration::from_millis(self.expire_ms)
    }

    /// True when the zone matches every name (`from .`).
    pub fn match_any(&self) -> bool {
        self.from.len() == 1 && self.from[0] == "."
    }

    /// Parsed `to` endpoints.
    pub fn endpoints(&self) -> Result<Vec<Endpoint>, ForwardError> {
        self.to.iter().map(|s| s.parse()).collect()
    }

    /// Parsed bootstrap resolvers; a bare IP gets port 53, bracketed IPv6
    /// accepted.
    pub fn bootstrap_addrs(&self) -> Result<Vec<SocketAddr>, ForwardError> {
        self.bootstrap
            .iter()
            .map(|s| {
                if let Ok(sa) = s.parse::<SocketAddr>() {
                    return Ok(sa);
                }
                let bare = s
                    .strip_prefix('[')
                    .and_then(|rest| rest.strip_suffix(']'))
                    .unwrap_or(s);
                bare.parse::<IpAddr>()
                    .map(|ip| SocketAddr::new(ip, 53))
                    .map_err(|_| {
                        ForwardError::Config(format!("bootstrap: {:?} is not an IP address", s))
                    })
            })
            .collect()
    }

    /// Structural validation. Interval minimums allow zero (zero disables
    /// the subsystem), everything else is rejected at load time.
    pub fn validate(&self) -> Result<(), ForwardError> {
        if self.from.is_empty() {
            return Err(ForwardError::Config("missing mandatory property: from".into()));
        }
        if self.to.is_empty() {
            return Err(ForwardError::Config("missing mandatory property: to".into()));
        }
        self.endpoints()?;
        self.bootstrap_addrs()?;

        if self.match_any() && !self.inline.is_empty() {
            return Err(ForwardError::Config(
                "inline names are forbidden since \".\" matches all requests".into(),
            ));
        }
        if self.from.iter().any(|f| f.starts_with("http://")) {
            return Err(ForwardError::Config(
                "plain http name-list URLs are refused, use https".into(),
            ));
        }

        for name in self.inline.iter().chain(self.except.iter()) {
            if string_to_domain(name).is_none() {
                return Err(ForwardError::InvalidDomainName(name.clone()));
            }
        }
        for name in &self.inline {
            let normalized = string_to_domain(name).unwrap_or_default();
            if self
                .except
                .iter()
                .filter_map(|e| string_to_domain(e))
                .any(|e| e == normalized)
            {
                return Err(ForwardError::Config(format!(
                    "inline name {:?} conflicts with except",
                    name
                )));
            }
        }

        check_min("path_reload", self.path_reload(), MIN_PATH_RELOAD)?;
        check_min("url_reload", self.url_reload(), MIN_URL_RELOAD)?;
        check_min("health_check", self.health_check(), MIN_HEALTH_CHECK)?;
        check_min("expire", self.expire(), MIN_EXPIRE)?;
        if self.url_read_timeout() < MIN_URL_READ_TIMEOUT {
            return Err(ForwardError::Config(format!(
                "url_reload: minimal read timeout is {:?}",
                MIN_URL_READ_TIMEOUT
            )));
        }
        if self.max_fails < 0 || self.max_retry < 0 {
            return Err(ForwardError::Config(
                "max_fails and max_retry must be non-negative".into(),
            ));
        }

        if let Some(servername) = &self.tls_servername {
            if string_to_domain(servername).is_none() {
                return Err(ForwardError::Config(format!(
                    "tls_servername: {:?} is not a valid domain name",
                    servername
                )));
            }
        }

        Ok(())
    }
}

fn check_min(directive: &str, value: Duration, min: Duration) -> Result<(), ForwardError> {
    if !value.is_zero() && value < min {
        return Err(ForwardError::Config(format!(
            "{}: minimal interval is {:?}",
            directive, min
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ZoneConfig {
        ZoneConfig::new(
            vec!["example.com".into()],
            vec!["dns://10.0.0.1:53".into()],
        )
    }

    #[test]
    fn defaults_validate() {
        assert!(base().validate().is_ok());
    }

    #[test]
    fn missing_to_is_rejected() {
        let mut cfg = base();
        cfg.to.clear();
        assert!(matches!(cfg.validate(), Err(ForwardError::Config(_))));
    }

    #[test]
    fn plain_http_source_is_rejected() {
        let mut cfg = base();
        cfg.from = vec!["http://example.com/list.txt".into()];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn inline_on_match_any_is_rejected() {
        let mut cfg = base();
        cfg.from = vec![".".into()];
        cfg.inline = vec!["example.org".into()];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn inline_except_conflict_is_rejected() {
        let mut cfg = base();
        cfg.inline = vec!["foo.example.org".into()];
        cfg.except = vec!["foo.example.org.".into()];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn interval_minimums_enforced_but_zero_disables() {
        let mut cfg = base();
        cfg.path_reload_ms = 500;
        assert!(cfg.validate().is_err());
        cfg.path_reload_ms = 0;
        assert!(cfg.validate().is_ok());

        cfg = base();
        cfg.url_reload_ms = 10_000;
        assert!(cfg.validate().is_err());

        cfg = base();
        cfg.health_check_ms = 0;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn bootstrap_accepts_bare_and_bracketed() {
        let mut cfg = base();
        cfg.bootstrap = vec!["9.9.9.9".into(), "[2620:fe::fe]".into(), "1.1.1.1:5353".into()];
        let addrs = cfg.bootstrap_addrs().unwrap();
        assert_eq!(addrs[0], "9.9.9.9:53".parse().unwrap());
        assert_eq!(addrs[1], "[2620:fe::fe]:53".parse().unwrap());
        assert_eq!(addrs[2], "1.1.1.1:5353".parse().unwrap());
    }

    #[test]
    fn serde_round_trips_all_directives() {
        let mut cfg = base();
        cfg.except = vec!["skip.example.com".into()];
        cfg.inline = vec!["extra.example.com".into()];
        cfg.policy = SelectionPolicy::RoundRobin;
        cfg.spray = true;
        cfg.max_fails = 5;
        cfg.bootstrap = vec!["9.9.9.9:53".into()];
        cfg.ipset = vec!["gfwlist".into()];
        cfg.pf = vec!["bypass:dnsteer".into()];
        cfg.no_ipv6 = true;
        cfg.tls_servername = Some("dns.example.net".into());

        let json = serde_json::to_string(&cfg).unwrap();
        let back: ZoneConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg, back);
    }
}
