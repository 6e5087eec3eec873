//! Product URL validation with SSRF defenses.
//!
//! A URL is valid when its scheme is allowed, neither its host nor any
//! address the host resolves to is internal, and the target answers with a
//! 2xx/3xx status within the redirect limit. Redirects are followed here,
//! not by the HTTP client, so every hop goes through the same host policy.
//! Each request connects only to the addresses that passed that policy; the
//! client never resolves the host a second time.
//!
//! Ordinary failures are reported in [`ValidationResult`]; [`UrlValidator::validate`]
//! never returns an error.

use crate::config::UrlCheckConfig;
use crate::error::{QuoteError, Result};
use crate::retry::{retry, Delay, RetryPolicy, ThreadDelay};
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::time::Duration;
use url::{Host, Url};

const USER_AGENT: &str = concat!("quotemail/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// Result
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub url: String,
    pub final_url: String,
    pub status: Option<u16>,
    pub redirects: u32,
    pub warning: Option<String>,
    pub error: Option<String>,
}

impl ValidationResult {
    fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            ..Self::default()
        }
    }

    fn fail(mut self, reason: impl Into<String>) -> Self {
        self.valid = false;
        self.error = Some(reason.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Seams: HTTP probe and resolver
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResponse {
    pub status: u16,
    pub location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    Timeout,
    Connect(String),
    Other(String),
}

impl ProbeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Connect(_))
    }
}

impl std::fmt::Display for ProbeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => f.write_str("timed out"),
            Self::Connect(msg) => write!(f, "connection error: {msg}"),
            Self::Other(msg) => write!(f, "request error: {msg}"),
        }
    }
}

/// Issues single requests without following redirects. A non-empty `addrs`
/// is the complete set of addresses the request may connect to.
pub trait HttpProbe {
    fn head(&self, url: &Url, addrs: &[SocketAddr]) -> std::result::Result<ProbeResponse, ProbeError>;
    fn get(&self, url: &Url, addrs: &[SocketAddr]) -> std::result::Result<ProbeResponse, ProbeError>;
}

pub trait Resolver {
    fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<IpAddr>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl Resolver for SystemResolver {
    fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<IpAddr>> {
        Ok((host, port).to_socket_addrs()?.map(|a| a.ip()).collect())
    }
}

/// Blocking reqwest client with redirects disabled.
pub struct ReqwestProbe {
    timeout: Duration,
    client: reqwest::blocking::Client,
}

impl ReqwestProbe {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Self::builder(timeout)
            .build()
            .map_err(|e| QuoteError::Http(e.to_string()))?;
        Ok(Self { timeout, client })
    }

    fn builder(timeout: Duration) -> reqwest::blocking::ClientBuilder {
        reqwest::blocking::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(USER_AGENT)
    }

    /// The shared client for IP-literal hosts, otherwise a client whose
    /// resolver answers `addrs` for this host only.
    fn client_for(
        &self,
        url: &Url,
        addrs: &[SocketAddr],
    ) -> std::result::Result<reqwest::blocking::Client, ProbeError> {
        match url.host() {
            Some(Host::Domain(domain)) if !addrs.is_empty() => Self::builder(self.timeout)
                .resolve_to_addrs(domain, addrs)
                .build()
                .map_err(|e| ProbeError::Other(e.to_string())),
            _ => Ok(self.client.clone()),
        }
    }

    fn send(&self, req: reqwest::blocking::RequestBuilder) -> std::result::Result<ProbeResponse, ProbeError> {
        let resp = req.send().map_err(|e| {
            if e.is_timeout() {
                ProbeError::Timeout
            } else if e.is_connect() {
                ProbeError::Connect(e.to_string())
            } else {
                ProbeError::Other(e.to_string())
            }
        })?;
        let location = resp
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Ok(ProbeResponse {
            status: resp.status().as_u16(),
            location,
        })
    }
}

impl HttpProbe for ReqwestProbe {
    fn head(&self, url: &Url, addrs: &[SocketAddr]) -> std::result::Result<ProbeResponse, ProbeError> {
        let client = self.client_for(url, addrs)?;
        self.send(client.head(url.as_str()))
    }

    fn get(&self, url: &Url, addrs: &[SocketAddr]) -> std::result::Result<ProbeResponse, ProbeError> {
        let client = self.client_for(url, addrs)?;
        self.send(client.get(url.as_str()))
    }
}

// ---------------------------------------------------------------------------
// Address policy
// ---------------------------------------------------------------------------

/// Loopback, private, link-local, unspecified, CGNAT, broadcast and IPv6
/// unique-local addresses, plus IPv4-mapped forms of those.
pub fn is_internal_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_internal_v4(v4),
        IpAddr::V6(v6) => is_internal_v6(v6),
    }
}

fn is_internal_v4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || a == 0
        || (a == 100 && (64..128).contains(&b))
}

fn is_internal_v6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || (first & 0xfe00) == 0xfc00
        || (first & 0xffc0) == 0xfe80
        || ip.to_ipv4_mapped().is_some_and(is_internal_v4)
}

// ---------------------------------------------------------------------------
// Validator
// ---------------------------------------------------------------------------

pub struct UrlValidator {
    config: UrlCheckConfig,
    probe: Box<dyn HttpProbe>,
    resolver: Box<dyn Resolver>,
    delay: Box<dyn Delay>,
}

impl UrlValidator {
    /// Production validator: reqwest probe, system resolver, real sleeps.
    pub fn new(config: UrlCheckConfig) -> Result<Self> {
        let probe = ReqwestProbe::new(Duration::from_secs(config.timeout_secs))?;
        Ok(Self::with_parts(
            config,
            Box::new(probe),
            Box::new(SystemResolver),
            Box::new(ThreadDelay),
        ))
    }

    pub fn with_parts(
        config: UrlCheckConfig,
        probe: Box<dyn HttpProbe>,
        resolver: Box<dyn Resolver>,
        delay: Box<dyn Delay>,
    ) -> Self {
        Self {
            config,
            probe,
            resolver,
            delay,
        }
    }

    pub fn validate(&self, raw: &str) -> ValidationResult {
        let mut result = ValidationResult::new(raw);
        let mut current = match Url::parse(raw.trim()) {
            Ok(u) => u,
            Err(e) => return result.fail(format!("malformed URL: {e}")),
        };

        match current.scheme() {
            "https" => {}
            "http" => {
                result.warning = Some("plain HTTP: the page is not served over TLS".to_string())
            }
            other => return result.fail(format!("scheme not allowed: {other}")),
        }

        loop {
            let addrs = match self.check_host(&current) {
                Ok(addrs) => addrs,
                Err(reason) => {
                    tracing::warn!(url = %current, %reason, "URL blocked");
                    return result.fail(reason);
                }
            };
            result.final_url = current.to_string();

            let resp = match self.request(&current, &addrs) {
                Ok(r) => r,
                Err(reason) => return result.fail(reason),
            };
            result.status = Some(resp.status);

            let next = match (resp.status, &resp.location) {
                (300..=399, Some(location)) => current.join(location),
                _ => break,
            };
            let next = match next {
                Ok(u) => u,
                Err(e) => return result.fail(format!("invalid redirect target: {e}")),
            };
            result.redirects += 1;
            if result.redirects > self.config.max_redirects {
                return result.fail(format!(
                    "redirect limit exceeded: more than {} redirect(s)",
                    self.config.max_redirects
                ));
            }
            if !matches!(next.scheme(), "https" | "http") {
                return result.fail(format!("redirect to disallowed scheme: {}", next.scheme()));
            }
            current = next;
        }

        match result.status {
            Some(status) if (200..400).contains(&status) => {
                result.valid = true;
                result
            }
            Some(status) => result.fail(format!("HTTP status {status}")),
            None => result.fail("no response"),
        }
    }

    /// Applies the host policy and returns the addresses the request is
    /// pinned to. IP-literal hosts need no pinning and return none.
    fn check_host(&self, url: &Url) -> std::result::Result<Vec<SocketAddr>, String> {
        match url.host() {
            None => Err("URL has no host".to_string()),
            Some(Host::Ipv4(ip)) if is_internal_v4(ip) => {
                Err(format!("internal address blocked: {ip}"))
            }
            Some(Host::Ipv6(ip)) if is_internal_v6(ip) => {
                Err(format!("internal address blocked: {ip}"))
            }
            Some(Host::Ipv4(_)) | Some(Host::Ipv6(_)) => Ok(Vec::new()),
            Some(Host::Domain(domain)) => {
                let domain = domain.trim_end_matches('.').to_ascii_lowercase();
                if domain == "localhost" || domain.ends_with(".localhost") {
                    return Err(format!("localhost blocked: {domain}"));
                }
                let port = url.port_or_known_default().unwrap_or(443);
                let ips = self
                    .resolver
                    .resolve(&domain, port)
                    .map_err(|e| format!("could not resolve host {domain}: {e}"))?;
                if ips.is_empty() {
                    return Err(format!("could not resolve host {domain}: no addresses"));
                }
                if let Some(ip) = ips.iter().find(|ip| is_internal_ip(**ip)) {
                    return Err(format!("host resolves to internal address: {domain} -> {ip}"));
                }
                Ok(ips.into_iter().map(|ip| SocketAddr::new(ip, port)).collect())
            }
        }
    }

    /// HEAD, falling back to GET on 405, retried on transient errors.
    fn request(&self, url: &Url, addrs: &[SocketAddr]) -> std::result::Result<ProbeResponse, String> {
        let policy = RetryPolicy {
            retries: self.config.retry_count,
            interval: Duration::from_secs_f64(self.config.retry_interval_secs.max(0.0)),
        };
        retry(policy, self.delay.as_ref(), ProbeError::is_transient, |_| {
            let resp = self.probe.head(url, addrs)?;
            if resp.status == 405 {
                self.probe.get(url, addrs)
            } else {
                Ok(resp)
            }
        })
        .map(|(resp, _)| resp)
        .map_err(|e| match e.last {
            ProbeError::Timeout => format!(
                "timed out after {}s ({} attempt(s))",
                self.config.timeout_secs, e.attempts
            ),
            other => format!("{other} ({} attempt(s))", e.attempts),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RecordingDelay;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;

    type Reply = std::result::Result<ProbeResponse, ProbeError>;

    /// Scripted probe: per (method, url) a queue of replies; the last reply
    /// repeats once the queue drains.
    #[derive(Clone, Default)]
    struct FakeProbe {
        replies: Rc<RefCell<HashMap<(String, String), Vec<Reply>>>>,
        calls: Rc<RefCell<Vec<(String, String)>>>,
        pinned: Rc<RefCell<Vec<Vec<SocketAddr>>>>,
    }

    impl FakeProbe {
        fn on(&self, method: &str, url: &str, reply: Reply) -> &Self {
            self.replies
                .borrow_mut()
                .entry((method.into(), url.into()))
                .or_default()
                .push(reply);
            self
        }

        fn reply(&self, method: &str, url: &Url, addrs: &[SocketAddr]) -> Reply {
            let key = (method.to_string(), url.to_string());
            self.calls.borrow_mut().push(key.clone());
            self.pinned.borrow_mut().push(addrs.to_vec());
            let mut replies = self.replies.borrow_mut();
            let queue = replies
                .get_mut(&key)
                .unwrap_or_else(|| panic!("unexpected {method} {url}"));
            if queue.len() > 1 {
                queue.remove(0)
            } else {
                queue[0].clone()
            }
        }

        fn call_count(&self) -> usize {
            self.calls.borrow().len()
        }
    }

    impl HttpProbe for FakeProbe {
        fn head(&self, url: &Url, addrs: &[SocketAddr]) -> Reply {
            self.reply("HEAD", url, addrs)
        }
        fn get(&self, url: &Url, addrs: &[SocketAddr]) -> Reply {
            self.reply("GET", url, addrs)
        }
    }

    /// Named hosts resolve as listed; any other host resolves to `fallback`
    /// when one is set.
    struct FakeResolver {
        hosts: HashMap<String, Vec<IpAddr>>,
        fallback: Option<IpAddr>,
    }

    impl Resolver for FakeResolver {
        fn resolve(&self, host: &str, _port: u16) -> std::io::Result<Vec<IpAddr>> {
            self.hosts
                .get(host)
                .cloned()
                .or_else(|| self.fallback.map(|ip| vec![ip]))
                .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no such host"))
        }
    }

    const PUBLIC_IP: &str = "93.184.216.34";

    fn ok(status: u16) -> Reply {
        Ok(ProbeResponse {
            status,
            location: None,
        })
    }

    fn redirect(to: &str) -> Reply {
        Ok(ProbeResponse {
            status: 302,
            location: Some(to.to_string()),
        })
    }

    fn validator_with(probe: &FakeProbe, resolver: FakeResolver) -> UrlValidator {
        UrlValidator::with_parts(
            UrlCheckConfig::default(),
            Box::new(probe.clone()),
            Box::new(resolver),
            Box::new(RecordingDelay::default()),
        )
    }

    fn validator(probe: &FakeProbe, hosts: &[(&str, &str)]) -> UrlValidator {
        let hosts = hosts
            .iter()
            .map(|(h, ip)| (h.to_string(), vec![ip.parse().unwrap()]))
            .collect();
        validator_with(
            probe,
            FakeResolver {
                hosts,
                fallback: Some(PUBLIC_IP.parse().unwrap()),
            },
        )
    }

    #[test]
    fn https_200_is_valid() {
        let probe = FakeProbe::default();
        probe.on("HEAD", "https://shop.example.com/item", ok(200));
        let r = validator(&probe, &[("shop.example.com", "93.184.216.34")])
            .validate("https://shop.example.com/item");
        assert!(r.valid, "{r:?}");
        assert_eq!(r.status, Some(200));
        assert_eq!(r.warning, None);
    }

    #[test]
    fn requests_are_pinned_to_the_checked_addresses() {
        let probe = FakeProbe::default();
        probe
            .on("HEAD", "https://a.example.com/", redirect("http://b.example.com:8080/x"))
            .on("HEAD", "http://b.example.com:8080/x", ok(200))
            .on("HEAD", "https://203.0.113.7/", ok(200));
        let v = validator(
            &probe,
            &[("a.example.com", "198.51.100.1"), ("b.example.com", "198.51.100.2")],
        );
        assert!(v.validate("https://a.example.com/").valid);
        assert!(v.validate("https://203.0.113.7/").valid);

        let pinned = probe.pinned.borrow();
        assert_eq!(pinned[0], vec!["198.51.100.1:443".parse::<SocketAddr>().unwrap()]);
        assert_eq!(pinned[1], vec!["198.51.100.2:8080".parse::<SocketAddr>().unwrap()]);
        assert!(pinned[2].is_empty());
    }

    #[test]
    fn unresolvable_host_fails_without_requests() {
        let probe = FakeProbe::default();
        let v = validator_with(
            &probe,
            FakeResolver {
                hosts: HashMap::new(),
                fallback: None,
            },
        );
        let r = v.validate("https://nowhere.example.com/");
        assert!(!r.valid);
        assert!(r.error.unwrap().contains("could not resolve host nowhere.example.com"));
        assert_eq!(probe.call_count(), 0);
    }

    #[test]
    fn http_is_allowed_with_warning() {
        let probe = FakeProbe::default();
        probe.on("HEAD", "http://shop.example.com/", ok(200));
        let r = validator(&probe, &[]).validate("http://shop.example.com");
        assert!(r.valid);
        assert!(r.warning.unwrap().contains("HTTP"));
    }

    #[test]
    fn other_schemes_are_rejected_without_requests() {
        let probe = FakeProbe::default();
        let r = validator(&probe, &[]).validate("ftp://example.com/file");
        assert!(!r.valid);
        assert!(r.error.unwrap().contains("scheme not allowed: ftp"));
        assert_eq!(probe.call_count(), 0);
    }

    #[test]
    fn internal_targets_are_blocked_without_requests() {
        let probe = FakeProbe::default();
        let v = validator(&probe, &[("intranet.example.com", "10.1.2.3")]);
        for url in [
            "http://localhost:8080/",
            "http://api.localhost/",
            "http://127.0.0.1/",
            "http://192.168.1.10/",
            "http://172.16.0.1/",
            "http://169.254.169.254/latest/meta-data",
            "http://0.0.0.0/",
            "http://[::1]/",
            "http://[fd00::1]/",
            "http://[::ffff:10.0.0.1]/",
            "https://intranet.example.com/",
        ] {
            let r = v.validate(url);
            assert!(!r.valid, "{url}");
            assert!(r.error.is_some(), "{url}");
        }
        assert_eq!(probe.call_count(), 0);
    }

    #[test]
    fn head_405_falls_back_to_get() {
        let probe = FakeProbe::default();
        probe
            .on("HEAD", "https://shop.example.com/p", ok(405))
            .on("GET", "https://shop.example.com/p", ok(200));
        let r = validator(&probe, &[]).validate("https://shop.example.com/p");
        assert!(r.valid);
        assert_eq!(probe.call_count(), 2);
    }

    #[test]
    fn follows_redirects_and_reports_final_url() {
        let probe = FakeProbe::default();
        probe
            .on("HEAD", "https://a.example.com/", redirect("https://b.example.com/x"))
            .on("HEAD", "https://b.example.com/x", redirect("/y"))
            .on("HEAD", "https://b.example.com/y", ok(200));
        let r = validator(&probe, &[]).validate("https://a.example.com/");
        assert!(r.valid);
        assert_eq!(r.redirects, 2);
        assert_eq!(r.final_url, "https://b.example.com/y");
    }

    #[test]
    fn redirect_into_private_range_is_blocked() {
        let probe = FakeProbe::default();
        probe.on("HEAD", "https://a.example.com/", redirect("http://10.0.0.5/admin"));
        let r = validator(&probe, &[]).validate("https://a.example.com/");
        assert!(!r.valid);
        assert!(r.error.unwrap().contains("10.0.0.5"));
        assert_eq!(probe.call_count(), 1);
    }

    #[test]
    fn redirect_limit_is_a_validation_failure() {
        let probe = FakeProbe::default();
        probe.on("HEAD", "https://loop.example.com/", redirect("https://loop.example.com/"));
        let r = validator(&probe, &[]).validate("https://loop.example.com/");
        assert!(!r.valid);
        assert!(r.error.unwrap().contains("redirect limit"));
        assert_eq!(probe.call_count(), 6);
    }

    #[test]
    fn timeouts_are_retried_then_reported_with_attempts() {
        let probe = FakeProbe::default();
        probe.on("HEAD", "https://slow.example.com/", Err(ProbeError::Timeout));
        let r = validator(&probe, &[]).validate("https://slow.example.com/");
        assert!(!r.valid);
        let err = r.error.unwrap();
        assert!(err.contains("timed out after 10s"), "{err}");
        assert!(err.contains("3 attempt(s)"), "{err}");
        assert_eq!(probe.call_count(), 3);
    }

    #[test]
    fn transient_failure_then_success() {
        let probe = FakeProbe::default();
        probe
            .on("HEAD", "https://flaky.example.com/", Err(ProbeError::Connect("reset".into())))
            .on("HEAD", "https://flaky.example.com/", ok(204));
        let r = validator(&probe, &[]).validate("https://flaky.example.com/");
        assert!(r.valid, "{r:?}");
    }

    #[test]
    fn error_status_is_invalid_without_retry() {
        let probe = FakeProbe::default();
        probe.on("HEAD", "https://gone.example.com/", ok(404));
        let r = validator(&probe, &[]).validate("https://gone.example.com/");
        assert!(!r.valid);
        assert_eq!(r.error.as_deref(), Some("HTTP status 404"));
        assert_eq!(probe.call_count(), 1);
    }

    #[test]
    fn reqwest_probe_reports_status_and_location() {
        let mut server = mockito::Server::new();
        let head = server
            .mock("HEAD", "/moved")
            .with_status(301)
            .with_header("location", "/new")
            .create();
        let get = server.mock("GET", "/only-get").with_status(200).create();

        let probe = ReqwestProbe::new(Duration::from_secs(5)).unwrap();
        let base = Url::parse(&server.url()).unwrap();

        let resp = probe.head(&base.join("/moved").unwrap(), &[]).unwrap();
        assert_eq!(resp.status, 301);
        assert_eq!(resp.location.as_deref(), Some("/new"));

        let resp = probe.get(&base.join("/only-get").unwrap(), &[]).unwrap();
        assert_eq!(resp.status, 200);

        head.assert();
        get.assert();
    }

    #[test]
    fn reqwest_probe_connects_to_the_pinned_address() {
        let mut server = mockito::Server::new();
        let mock = server.mock("HEAD", "/item").with_status(200).create();
        let addr: SocketAddr = server.host_with_port().parse().unwrap();

        // `.invalid` never resolves through DNS, so only the pin can reach the server.
        let url = Url::parse(&format!("http://shop.invalid:{}/item", addr.port())).unwrap();
        let probe = ReqwestProbe::new(Duration::from_secs(5)).unwrap();
        let resp = probe.head(&url, &[addr]).unwrap();
        assert_eq!(resp.status, 200);
        mock.assert();
    }

    #[test]
    fn internal_ip_table() {
        for ip in ["127.0.0.1", "10.0.0.1", "100.64.0.1", "255.255.255.255", "fe80::1", "fc00::1"] {
            assert!(is_internal_ip(ip.parse().unwrap()), "{ip}");
        }
        for ip in ["93.184.216.34", "8.8.8.8", "2606:4700::1111"] {
            assert!(!is_internal_ip(ip.parse().unwrap()), "{ip}");
        }
    }
}
