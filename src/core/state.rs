// 全局状态：只读配置、校验器与出站客户端，不保存任何跨请求的会话数据。
use crate::config::Config;
use crate::lan_url::{HostResolver, LanUrlValidator, SystemResolver};
use crate::upstream::{scan_client, RedirectMode, UpstreamClient};
use anyhow::Result;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub proxy_validator: LanUrlValidator,
    pub browse_validator: LanUrlValidator,
    pub proxy_client: UpstreamClient,
    pub browse_client: UpstreamClient,
    pub scan_client: reqwest::Client,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self> {
        Self::with_resolver(config, Arc::new(SystemResolver))
    }

    pub fn with_resolver(config: Config, resolver: Arc<dyn HostResolver>) -> Result<Self> {
        let suffix = config.lan.local_suffix.as_str();
        let proxy_validator = LanUrlValidator::new(config.lan.proxy, suffix, resolver.clone());
        let browse_validator = LanUrlValidator::new(config.lan.browse, suffix, resolver);
        let proxy_client = UpstreamClient::new(
            &config.upstream,
            RedirectMode::SameLan {
                policy: config.lan.proxy,
                max: config.upstream.max_redirects,
            },
        )?;
        let browse_client = UpstreamClient::new(&config.upstream, RedirectMode::Manual)?;
        let scan_client = scan_client(&config.scan, &config.upstream.user_agent)?;
        Ok(Self {
            config,
            proxy_validator,
            browse_validator,
            proxy_client,
            browse_client,
            scan_client,
        })
    }
}
