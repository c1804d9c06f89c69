// LAN URL 校验：字面 IPv4 走分类器，.local 名称必须解析到允许的地址。
use crate::address::{classify, classify_addr, is_permitted, AddressClass};
use crate::config::LanPolicy;
use crate::error::LanError;
use async_trait::async_trait;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tracing::{debug, warn};
use url::{Host, Url};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

/// 通过校验的目标；只能由 [`LanUrlValidator::validate`] 构造。
#[derive(Debug, Clone)]
pub struct LanTarget {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub address: Ipv4Addr,
    url: Url,
}

impl LanTarget {
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// scheme://host[:port]，默认端口省略。
    pub fn origin(&self) -> String {
        self.url.origin().ascii_serialization()
    }

    /// 主机名经 DNS 得到地址时为 true，出站请求需要固定到 `address`。
    pub fn is_named(&self) -> bool {
        self.host.parse::<Ipv4Addr>().is_err()
    }
}

impl fmt::Display for LanTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}

#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn lookup_ipv4(&self, host: &str) -> anyhow::Result<Vec<Ipv4Addr>>;
}

/// 走系统解析器（getaddrinfo），因此 nss-mdns 等 .local 解析同样生效。
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn lookup_ipv4(&self, host: &str) -> anyhow::Result<Vec<Ipv4Addr>> {
        let addrs = tokio::net::lookup_host((host, 0u16)).await?;
        let mut output = Vec::new();
        for addr in addrs {
            if let IpAddr::V4(ip) = addr.ip() {
                if !output.contains(&ip) {
                    output.push(ip);
                }
            }
        }
        Ok(output)
    }
}

#[derive(Clone)]
pub struct LanUrlValidator {
    policy: LanPolicy,
    local_suffix: String,
    resolver: Arc<dyn HostResolver>,
}

impl LanUrlValidator {
    pub fn new(policy: LanPolicy, local_suffix: &str, resolver: Arc<dyn HostResolver>) -> Self {
        Self {
            policy,
            local_suffix: local_suffix.to_ascii_lowercase(),
            resolver,
        }
    }

    pub async fn validate(&self, raw: &str) -> Result<LanTarget, LanError> {
        let (url, literal) = self.parse(raw)?;
        let scheme = match url.scheme() {
            "http" => Scheme::Http,
            "https" if self.policy.allow_https => Scheme::Https,
            "https" => return Err(LanError::disallowed_scheme("HTTPS not allowed")),
            _ => return Err(LanError::disallowed_scheme("Only http:// is allowed")),
        };
        let port = url
            .port_or_known_default()
            .ok_or_else(|| LanError::invalid_url("Invalid URL"))?;

        let (host, address) = match url.host() {
            Some(Host::Ipv4(addr)) => {
                // 按用户原文严格分类：十六进制或整数写法即便能被 URL 解析器接受也一律拒绝。
                let class = classify(&literal);
                self.check_class(class, &literal, "Only private LAN IPv4 allowed")?;
                (addr.to_string(), addr)
            }
            Some(Host::Ipv6(_)) => {
                return Err(LanError::not_lan_host("IPv6 hosts are not allowed"));
            }
            Some(Host::Domain(domain)) => {
                let domain = domain.to_ascii_lowercase();
                let address = self.resolve_local(&domain).await?;
                (domain, address)
            }
            None => return Err(LanError::invalid_url("Invalid URL")),
        };

        let path = match url.query() {
            Some(query) => format!("{}?{query}", url.path()),
            None => url.path().to_string(),
        };
        Ok(LanTarget {
            scheme,
            host,
            port,
            path,
            address,
            url,
        })
    }

    /// 返回解析结果以及原文中的主机部分。
    fn parse(&self, raw: &str) -> Result<(Url, String), LanError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(LanError::invalid_url("Invalid URL"));
        }
        let lowered = trimmed.to_ascii_lowercase();
        if lowered.starts_with("https://") && !self.policy.allow_https {
            return Err(LanError::disallowed_scheme("HTTPS not allowed"));
        }
        let candidate = if lowered.starts_with("http://") || lowered.starts_with("https://") {
            trimmed.to_string()
        } else if has_foreign_scheme(trimmed) {
            return Err(LanError::disallowed_scheme("Only http:// is allowed"));
        } else {
            format!("http://{trimmed}")
        };
        let url = Url::parse(&candidate).map_err(|err| {
            debug!("url parse failed: {err}");
            LanError::invalid_url("Invalid URL")
        })?;
        Ok((url, authority_host(&candidate).to_string()))
    }

    fn check_address(&self, addr: Ipv4Addr, message: &str) -> Result<(), LanError> {
        self.check_class(classify_addr(addr), &addr.to_string(), message)
    }

    fn check_class(&self, class: AddressClass, shown: &str, message: &str) -> Result<(), LanError> {
        if is_permitted(class, &self.policy) {
            return Ok(());
        }
        warn!("rejected {} address {shown}", class.as_str());
        Err(LanError::not_lan_host(message))
    }

    async fn resolve_local(&self, domain: &str) -> Result<Ipv4Addr, LanError> {
        if !domain.ends_with(&self.local_suffix) || domain.len() == self.local_suffix.len() {
            warn!("rejected non-local host {domain}");
            return Err(LanError::not_lan_host(format!(
                "Only LAN hosts allowed ({} or private IPv4)",
                self.local_suffix
            )));
        }
        // 不做缓存：设备地址随 DHCP 变化，每次请求重新解析。
        let resolved = match self.resolver.lookup_ipv4(domain).await {
            Ok(addrs) => addrs,
            Err(err) => {
                warn!("resolve {domain} failed: {err}");
                Vec::new()
            }
        };
        let message = format!("{} did not resolve to a private IPv4", self.local_suffix);
        let Some(first) = resolved.first().copied() else {
            return Err(LanError::not_lan_host(message));
        };
        for addr in &resolved {
            self.check_address(*addr, &message)?;
        }
        Ok(first)
    }
}

/// `scheme://[user@]host[:port]/...` 中的 host 原文。
fn authority_host(candidate: &str) -> &str {
    let rest = candidate
        .split_once("://")
        .map_or(candidate, |(_, rest)| rest);
    let authority = rest.split(['/', '\\', '?', '#']).next().unwrap_or_default();
    let host_port = authority.rsplit('@').next().unwrap_or_default();
    host_port
        .rsplit_once(':')
        .map_or(host_port, |(host, _)| host)
}

fn has_foreign_scheme(raw: &str) -> bool {
    let Some((scheme, _)) = raw.split_once("://") else {
        return false;
    };
    !scheme.is_empty()
        && scheme
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '+' | '-' | '.'))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::LanErrorKind;
    use std::collections::HashMap;

    #[derive(Default)]
    pub(crate) struct StaticResolver {
        records: HashMap<String, Vec<Ipv4Addr>>,
    }

    impl StaticResolver {
        pub(crate) fn with(mut self, host: &str, addrs: &[[u8; 4]]) -> Self {
            self.records.insert(
                host.to_string(),
                addrs.iter().map(|octets| Ipv4Addr::from(*octets)).collect(),
            );
            self
        }
    }

    #[async_trait]
    impl HostResolver for StaticResolver {
        async fn lookup_ipv4(&self, host: &str) -> anyhow::Result<Vec<Ipv4Addr>> {
            self.records
                .get(host)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no such host: {host}"))
        }
    }

    fn validator(policy: LanPolicy) -> LanUrlValidator {
        let resolver = StaticResolver::default()
            .with("myhost.local", &[[192, 168, 0, 10]])
            .with("evil.local", &[[203, 0, 113, 5]])
            .with("mixed.local", &[[192, 168, 0, 11], [8, 8, 4, 4]])
            .with("empty.local", &[]);
        LanUrlValidator::new(policy, ".local", Arc::new(resolver))
    }

    async fn kind_of(validator: &LanUrlValidator, raw: &str) -> LanErrorKind {
        validator
            .validate(raw)
            .await
            .expect_err("validation should fail")
            .kind()
    }

    #[tokio::test]
    async fn accepts_private_literal_and_prepends_scheme() {
        let validator = validator(LanPolicy::strict());
        let target = validator.validate("192.168.1.50/status?x=1").await.unwrap();
        assert_eq!(target.scheme, Scheme::Http);
        assert_eq!(target.host, "192.168.1.50");
        assert_eq!(target.port, 80);
        assert_eq!(target.path, "/status?x=1");
        assert_eq!(target.origin(), "http://192.168.1.50");
        assert!(!target.is_named());
    }

    #[test]
    fn authority_host_strips_userinfo_port_and_path() {
        assert_eq!(authority_host("http://192.168.1.5:8080/x"), "192.168.1.5");
        assert_eq!(authority_host("http://admin:pw@10.0.0.2/"), "10.0.0.2");
        assert_eq!(authority_host("http://10.0.0.3?q=1"), "10.0.0.3");
        assert_eq!(authority_host("http://10.0.0.4\\@8.8.8.8/"), "10.0.0.4");
    }

    #[tokio::test]
    async fn rejects_public_and_malformed_input() {
        let strict = validator(LanPolicy::strict());
        let browse = validator(LanPolicy::browse());
        assert_eq!(
            kind_of(&strict, "https://8.8.8.8/").await,
            LanErrorKind::DisallowedScheme
        );
        assert_eq!(
            kind_of(&browse, "https://8.8.8.8/").await,
            LanErrorKind::NotLanHost
        );
        assert_eq!(kind_of(&strict, "not a url").await, LanErrorKind::InvalidUrl);
        assert_eq!(kind_of(&strict, "   ").await, LanErrorKind::InvalidUrl);
        assert_eq!(
            kind_of(&strict, "http://10.0.0.256/").await,
            LanErrorKind::InvalidUrl
        );
        for obfuscated in ["http://0x0a.0.0.1/", "http://167772161/", "http://010.0.0.1/"] {
            assert_eq!(
                kind_of(&strict, obfuscated).await,
                LanErrorKind::NotLanHost,
                "{obfuscated}"
            );
        }
        assert_eq!(
            kind_of(&strict, "ftp://192.168.1.5/").await,
            LanErrorKind::DisallowedScheme
        );
        assert_eq!(
            kind_of(&strict, "http://[::1]/").await,
            LanErrorKind::NotLanHost
        );
        assert_eq!(
            kind_of(&strict, "example.com").await,
            LanErrorKind::NotLanHost
        );
    }

    #[tokio::test]
    async fn loopback_and_link_local_follow_policy() {
        let strict = validator(LanPolicy::strict());
        assert_eq!(
            kind_of(&strict, "127.0.0.1:8080").await,
            LanErrorKind::NotLanHost
        );
        assert_eq!(
            kind_of(&strict, "169.254.3.4").await,
            LanErrorKind::NotLanHost
        );

        let browse = validator(LanPolicy::browse());
        assert!(browse.validate("169.254.3.4").await.is_ok());
        assert_eq!(
            kind_of(&browse, "127.0.0.1").await,
            LanErrorKind::NotLanHost
        );
        let target = browse.validate("https://10.1.2.3:8443/").await.unwrap();
        assert_eq!(target.scheme, Scheme::Https);
        assert_eq!(target.origin(), "https://10.1.2.3:8443");
    }

    #[tokio::test]
    async fn local_names_must_resolve_to_allowed_addresses() {
        let validator = validator(LanPolicy::strict());
        let target = validator.validate("MyHost.local:8080/").await.unwrap();
        assert_eq!(target.host, "myhost.local");
        assert_eq!(target.address, Ipv4Addr::new(192, 168, 0, 10));
        assert_eq!(target.port, 8080);
        assert!(target.is_named());

        assert_eq!(
            kind_of(&validator, "myhost.local.").await,
            LanErrorKind::NotLanHost
        );
        assert_eq!(
            kind_of(&validator, "evil.local").await,
            LanErrorKind::NotLanHost
        );
        assert_eq!(
            kind_of(&validator, "mixed.local").await,
            LanErrorKind::NotLanHost
        );
        assert_eq!(
            kind_of(&validator, "empty.local").await,
            LanErrorKind::NotLanHost
        );
        assert_eq!(
            kind_of(&validator, "missing.local").await,
            LanErrorKind::NotLanHost
        );
    }
}
