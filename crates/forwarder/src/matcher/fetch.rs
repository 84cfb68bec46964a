//! HTTPS name-list fetching.

use crate::bootstrap::BootstrapResolver;
use dnsteer_domain::ForwardError;
use fnv::FnvHasher;
use std::hash::Hasher;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, warn};

/// Some providers hide list URLs behind HTML shorteners that answer with a
/// 200 text/html page instead of a redirect.
const HTML_CONTENT_TYPE: &str = "text/html";

/// Browser-like agent; some list mirrors reject obvious bots.
const LIST_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0";

pub fn content_hash(content: &str) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(content.as_bytes());
    hasher.finish()
}

pub fn build_list_client(
    bootstrap: &[SocketAddr],
    no_ipv6: bool,
    read_timeout: Duration,
) -> Result<reqwest::Client, ForwardError> {
    let mut builder = reqwest::Client::builder()
        .use_rustls_tls()
        .user_agent(LIST_USER_AGENT)
        .timeout(read_timeout)
        .connect_timeout(read_timeout);

    if no_ipv6 {
        builder = builder.local_address(Some(std::net::Ipv4Addr::UNSPECIFIED.into()));
    }
    if !bootstrap.is_empty() {
        builder = builder.dns_resolver(BootstrapResolver::new(bootstrap, no_ipv6)?);
    }

    builder
        .build()
        .map_err(|e| ForwardError::Config(format!("list client: {}", e)))
}

/// Fetches a name-list URL and returns its body.
///
/// A non-2xx status fails the fetch. When the body comes back as HTML
/// instead of a plain list, the first https link in the page is followed
/// once; a second mismatch fails.
pub async fn fetch_list(client: &reqwest::Client, url: &str) -> Result<String, ForwardError> {
    let body = fetch_once(client, url).await?;
    match body {
        Fetched::List(content) => Ok(content),
        Fetched::Html(page) => {
            let target = extract_https_link(&page).ok_or_else(|| {
                ForwardError::transport(url, "html response with no https link to follow")
            })?;
            debug!(url, target = %target, "following html indirection once");
            match fetch_once(client, &target).await? {
                Fetched::List(content) => Ok(content),
                Fetched::Html(_) => Err(ForwardError::transport(
                    url,
                    "html response after following indirection",
                )),
            }
        }
    }
}

enum Fetched {
    List(String),
    Html(String),
}

async fn fetch_once(client: &reqwest::Client, url: &str) -> Result<Fetched, ForwardError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| ForwardError::transport(url, e))?;

    let status = response.status();
    if !status.is_success() {
        return Err(ForwardError::transport(
            url,
            format!("bad status code: {}", status.as_u16()),
        ));
    }

    let is_html = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.starts_with(HTML_CONTENT_TYPE))
        .unwrap_or(false);

    let body = response
        .text()
        .await
        .map_err(|e| ForwardError::transport(url, e))?;

    if is_html {
        warn!(url, "name list url answered with html");
        Ok(Fetched::Html(body))
    } else {
        Ok(Fetched::List(body))
    }
}

fn extract_https_link(page: &str) -> Option<String> {
    let start = page.find("https://")?;
    let rest = &page[start..];
    let end = rest
        .find(|c: char| c == '"' || c == '\'' || c == '<' || c.is_whitespace())
        .unwrap_or(rest.len());
    let link = &rest[..end];
    if link.len() > "https://".len() {
        Some(link.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv_hash_is_stable_and_content_sensitive() {
        let a = content_hash("example.com\nfoo.org\n");
        let b = content_hash("example.com\nfoo.org\n");
        let c = content_hash("example.com\nfoo.org\nbar.net\n");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn fnv_64a_known_vectors() {
        // Reference values for the FNV-1a 64-bit function.
        assert_eq!(content_hash(""), 0xcbf29ce484222325);
        assert_eq!(content_hash("a"), 0xaf63dc4c8601ec8c);
    }

    #[test]
    fn extracts_first_https_link() {
        let page = r#"<html><p class="link"><a href="https://example.com/list.txt">x</a></p>"#;
        assert_eq!(
            extract_https_link(page).as_deref(),
            Some("https://example.com/list.txt")
        );
        assert_eq!(extract_https_link("<html>nothing</html>"), None);
    }
}
