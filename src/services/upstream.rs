// 出站 HTTP 客户端：按入口区分跳转策略，.local 目标固定到已校验的地址。
use crate::address::is_permitted_addr;
use crate::config::{LanPolicy, ScanConfig, UpstreamConfig};
use crate::error::LanError;
use crate::lan_url::LanTarget;
use anyhow::{Context, Result};
use reqwest::redirect::{Action, Attempt, Policy};
use reqwest::Client;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::{debug, warn};
use url::{Host, Url};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectMode {
    /// 不跟随跳转，由调用方改写 Location。
    Manual,
    /// 仅在同主机或策略允许的字面 IPv4 之间跟随。
    SameLan { policy: LanPolicy, max: usize },
}

#[derive(Clone)]
pub struct UpstreamClient {
    settings: UpstreamConfig,
    redirect: RedirectMode,
    shared: Client,
}

impl UpstreamClient {
    pub fn new(settings: &UpstreamConfig, redirect: RedirectMode) -> Result<Self> {
        let shared = client_builder(settings, redirect)
            .build()
            .context("build upstream http client failed")?;
        Ok(Self {
            settings: settings.clone(),
            redirect,
            shared,
        })
    }

    /// 字面 IPv4 目标直接复用共享客户端；主机名目标构造一次性客户端并固定解析结果，
    /// 校验与连接之间不会再次查询 DNS。
    pub fn for_target(&self, target: &LanTarget) -> Result<Client, LanError> {
        if !target.is_named() {
            return Ok(self.shared.clone());
        }
        let pinned = SocketAddr::new(IpAddr::V4(target.address), target.port);
        debug!("pin {} to {}", target.host, target.address);
        client_builder(&self.settings, self.redirect)
            .resolve(&target.host, pinned)
            .build()
            .map_err(|err| {
                warn!("build pinned client failed: {err}");
                LanError::upstream_unreachable("Upstream client unavailable")
            })
    }

    pub fn max_body_bytes(&self) -> usize {
        self.settings.max_body_bytes
    }
}

fn client_builder(settings: &UpstreamConfig, redirect: RedirectMode) -> reqwest::ClientBuilder {
    let policy = match redirect {
        RedirectMode::Manual => Policy::none(),
        RedirectMode::SameLan { policy, max } => {
            Policy::custom(move |attempt| follow_within_lan(attempt, &policy, max))
        }
    };
    Client::builder()
        .user_agent(settings.user_agent.clone())
        .timeout(Duration::from_secs(settings.timeout_s))
        .redirect(policy)
}

fn follow_within_lan(attempt: Attempt<'_>, policy: &LanPolicy, max: usize) -> Action {
    if redirect_allowed(attempt.url(), attempt.previous(), policy, max) {
        attempt.follow()
    } else {
        debug!("stop redirect to {}", attempt.url());
        attempt.stop()
    }
}

/// `previous` 含最初请求的地址，因此最多跟随 `max` 次。
fn redirect_allowed(next: &Url, previous: &[Url], policy: &LanPolicy, max: usize) -> bool {
    if previous.len() > max {
        return false;
    }
    let host_allowed = match next.host() {
        Some(Host::Ipv4(addr)) => is_permitted_addr(addr, policy),
        Some(host) => previous.last().and_then(Url::host) == Some(host),
        None => false,
    };
    let scheme_allowed = match next.scheme() {
        "http" => true,
        "https" => policy.allow_https,
        _ => false,
    };
    host_allowed && scheme_allowed
}

/// 扫描用客户端：短超时，不跟随跳转。
pub fn scan_client(settings: &ScanConfig, user_agent: &str) -> Result<Client> {
    let probe_timeout = Duration::from_millis(settings.probe_timeout_ms);
    Client::builder()
        .user_agent(user_agent.to_string())
        .connect_timeout(probe_timeout)
        .timeout(probe_timeout)
        .redirect(Policy::none())
        .build()
        .context("build scan http client failed")
}
