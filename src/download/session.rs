//! Per-request decoration: cookies, credentials, and proxy selection.
//!
//! These stores are owned by the engine context and passed in
//! explicitly; the engine itself never reaches for process-wide state.
//! The UI layer (or a browser-integration host) populates them, the
//! engine only reads when it builds a request.

use std::collections::HashMap;
use std::sync::Mutex;

use url::Url;

use super::client::ProxyConfig;

/// Basic credentials for one site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    /// Username.
    pub username: String,
    /// Password.
    pub password: String,
}

/// Cookie store: `name=value` pairs per registered domain, matched by
/// domain suffix (a cookie stored for `example.com` is sent to
/// `dl.example.com`).
#[derive(Debug, Default)]
pub struct CookieStore {
    by_domain: Mutex<HashMap<String, Vec<(String, String)>>>,
}

impl CookieStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a cookie for a domain, replacing one with the same name.
    pub fn set(&self, domain: &str, name: &str, value: &str) {
        let mut map = lock(&self.by_domain);
        let cookies = map.entry(normalize_domain(domain)).or_default();
        if let Some(existing) = cookies.iter_mut().find(|(n, _)| n == name) {
            existing.1 = value.to_string();
        } else {
            cookies.push((name.to_string(), value.to_string()));
        }
    }

    /// Imports a `name=value; name2=value2` header string for a domain.
    pub fn import_header(&self, domain: &str, header: &str) {
        for pair in header.split(';') {
            if let Some((name, value)) = pair.trim().split_once('=') {
                self.set(domain, name.trim(), value.trim());
            }
        }
    }

    /// Builds the Cookie header value for a URL; empty when nothing
    /// matches.
    #[must_use]
    pub fn cookies_for_url(&self, url: &str) -> String {
        let Some(host) = host_of(url) else {
            return String::new();
        };

        let map = lock(&self.by_domain);
        let mut pairs = Vec::new();
        for (domain, cookies) in map.iter() {
            if domain_matches(&host, domain) {
                pairs.extend(cookies.iter().map(|(n, v)| format!("{n}={v}")));
            }
        }
        pairs.join("; ")
    }

    /// Removes every stored cookie.
    pub fn clear(&self) {
        lock(&self.by_domain).clear();
    }
}

/// Credential store matched by exact host.
#[derive(Debug, Default)]
pub struct CredentialStore {
    by_host: Mutex<HashMap<String, Credential>>,
}

impl CredentialStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores credentials for a host.
    pub fn set(&self, host: &str, username: &str, password: &str) {
        lock(&self.by_host).insert(
            normalize_domain(host),
            Credential {
                username: username.to_string(),
                password: password.to_string(),
            },
        );
    }

    /// Looks up credentials for a URL's host.
    #[must_use]
    pub fn find(&self, url: &str) -> Option<Credential> {
        let host = host_of(url)?;
        lock(&self.by_host).get(&host).cloned()
    }

    /// Removes credentials for a host.
    pub fn remove(&self, host: &str) {
        lock(&self.by_host).remove(&normalize_domain(host));
    }
}

/// Proxy selection: one global proxy plus a bypass list of host
/// suffixes.
#[derive(Debug, Default)]
pub struct ProxyResolver {
    inner: Mutex<ProxyRules>,
}

#[derive(Debug, Default)]
struct ProxyRules {
    global: Option<ProxyConfig>,
    bypass: Vec<String>,
}

impl ProxyResolver {
    /// Creates a resolver with no proxy configured.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets (or clears) the global proxy.
    pub fn set_proxy(&self, proxy: Option<ProxyConfig>) {
        lock(&self.inner).global = proxy;
    }

    /// Adds a host suffix that connects directly.
    pub fn add_bypass(&self, suffix: &str) {
        lock(&self.inner).bypass.push(normalize_domain(suffix));
    }

    /// The proxy to use for a URL, if any.
    #[must_use]
    pub fn proxy_for_url(&self, url: &str) -> Option<ProxyConfig> {
        let rules = lock(&self.inner);
        let proxy = rules.global.clone()?;

        if let Some(host) = host_of(url) {
            if rules.bypass.iter().any(|suffix| domain_matches(&host, suffix)) {
                return None;
            }
        }
        Some(proxy)
    }
}

fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_start_matches('.').to_ascii_lowercase()
}

fn host_of(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()?
        .host_str()
        .map(str::to_ascii_lowercase)
}

/// True when `host` equals `domain` or is a subdomain of it.
fn domain_matches(host: &str, domain: &str) -> bool {
    host == domain || host.ends_with(&format!(".{domain}"))
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // ==================== Cookie Tests ====================

    #[test]
    fn test_cookie_exact_domain_match() {
        let store = CookieStore::new();
        store.set("example.com", "session", "abc");
        assert_eq!(store.cookies_for_url("https://example.com/f"), "session=abc");
    }

    #[test]
    fn test_cookie_subdomain_match() {
        let store = CookieStore::new();
        store.set("example.com", "session", "abc");
        assert_eq!(
            store.cookies_for_url("https://dl.example.com/f"),
            "session=abc"
        );
        // But not the other direction, and not unrelated suffixes.
        store.set("dl.example.com", "inner", "x");
        assert_eq!(store.cookies_for_url("https://example.com/f"), "session=abc");
        assert_eq!(store.cookies_for_url("https://notexample.com/f"), "");
    }

    #[test]
    fn test_cookie_replacement_by_name() {
        let store = CookieStore::new();
        store.set("example.com", "session", "old");
        store.set("example.com", "session", "new");
        assert_eq!(store.cookies_for_url("https://example.com/"), "session=new");
    }

    #[test]
    fn test_cookie_header_import() {
        let store = CookieStore::new();
        store.import_header("example.com", "a=1; b=2; malformed");
        let header = store.cookies_for_url("https://example.com/");
        assert!(header.contains("a=1"));
        assert!(header.contains("b=2"));
        assert!(!header.contains("malformed"));
    }

    #[test]
    fn test_cookie_clear() {
        let store = CookieStore::new();
        store.set("example.com", "a", "1");
        store.clear();
        assert_eq!(store.cookies_for_url("https://example.com/"), "");
    }

    // ==================== Credential Tests ====================

    #[test]
    fn test_credentials_by_host() {
        let store = CredentialStore::new();
        store.set("files.example.com", "user", "secret");

        let cred = store.find("https://files.example.com/a.zip").unwrap();
        assert_eq!(cred.username, "user");
        assert_eq!(cred.password, "secret");

        assert!(store.find("https://other.example.com/a.zip").is_none());
    }

    #[test]
    fn test_credentials_remove() {
        let store = CredentialStore::new();
        store.set("example.com", "user", "secret");
        store.remove("example.com");
        assert!(store.find("https://example.com/").is_none());
    }

    // ==================== Proxy Tests ====================

    fn proxy() -> ProxyConfig {
        ProxyConfig {
            address: "proxy.corp:3128".to_string(),
            username: String::new(),
            password: String::new(),
        }
    }

    #[test]
    fn test_no_proxy_by_default() {
        let resolver = ProxyResolver::new();
        assert!(resolver.proxy_for_url("https://example.com/").is_none());
    }

    #[test]
    fn test_global_proxy_applies() {
        let resolver = ProxyResolver::new();
        resolver.set_proxy(Some(proxy()));
        assert_eq!(
            resolver.proxy_for_url("https://example.com/").unwrap().address,
            "proxy.corp:3128"
        );
    }

    #[test]
    fn test_bypass_suffix_skips_proxy() {
        let resolver = ProxyResolver::new();
        resolver.set_proxy(Some(proxy()));
        resolver.add_bypass("internal.example.com");

        assert!(resolver
            .proxy_for_url("https://build.internal.example.com/a")
            .is_none());
        assert!(resolver.proxy_for_url("https://example.com/a").is_some());
    }
}
