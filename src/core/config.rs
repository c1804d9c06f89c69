// 配置读取与覆盖合并：YAML 基础配置 + 可选覆盖文件 + 环境变量占位符。
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::env;
use std::fs;
use std::path::Path;
use tracing::warn;

const DEFAULT_CONFIG_PATH: &str = "config/minerlan.yaml";
const DEFAULT_OVERRIDE_PATH: &str = "data/config/minerlan.override.yaml";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    #[serde(default)]
    pub lan: LanConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub scan: ScanConfig,
}

impl Config {
    pub fn normalized(mut self) -> Self {
        self.server = self.server.normalized();
        self.lan = self.lan.normalized();
        self.upstream = self.upstream.normalized();
        self.scan = self.scan.normalized();
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(
        default = "default_port",
        deserialize_with = "deserialize_port"
    )]
    pub port: u16,
    #[serde(default = "default_static_dir")]
    pub static_dir: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            static_dir: default_static_dir(),
        }
    }
}

impl ServerConfig {
    fn normalized(mut self) -> Self {
        if self.host.trim().is_empty() {
            self.host = default_host();
        } else {
            self.host = self.host.trim().to_string();
        }
        if self.port == 0 {
            self.port = default_port();
        }
        if self.static_dir.trim().is_empty() {
            self.static_dir = default_static_dir();
        }
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// 单个入口允许访问的地址范围与协议。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LanPolicy {
    #[serde(default)]
    pub allow_https: bool,
    #[serde(default)]
    pub allow_loopback: bool,
    #[serde(default)]
    pub allow_link_local: bool,
}

impl LanPolicy {
    /// 单目标代理：仅 http，拒绝回环与链路本地地址。
    pub const fn strict() -> Self {
        Self {
            allow_https: false,
            allow_loopback: false,
            allow_link_local: false,
        }
    }

    /// 会话浏览：允许 https 与链路本地地址，回环仍默认拒绝。
    pub const fn browse() -> Self {
        Self {
            allow_https: true,
            allow_loopback: false,
            allow_link_local: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanConfig {
    #[serde(default = "default_local_suffix")]
    pub local_suffix: String,
    #[serde(default = "LanPolicy::strict")]
    pub proxy: LanPolicy,
    #[serde(default = "LanPolicy::browse")]
    pub browse: LanPolicy,
}

impl Default for LanConfig {
    fn default() -> Self {
        Self {
            local_suffix: default_local_suffix(),
            proxy: LanPolicy::strict(),
            browse: LanPolicy::browse(),
        }
    }
}

impl LanConfig {
    fn normalized(mut self) -> Self {
        let suffix = self.local_suffix.trim().to_ascii_lowercase();
        self.local_suffix = match suffix.as_str() {
            "" | "." => default_local_suffix(),
            value if value.starts_with('.') => value.to_string(),
            value => format!(".{value}"),
        };
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_timeout_s")]
    pub timeout_s: u64,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            timeout_s: default_timeout_s(),
            max_body_bytes: default_max_body_bytes(),
            max_redirects: default_max_redirects(),
        }
    }
}

impl UpstreamConfig {
    fn normalized(mut self) -> Self {
        if self.user_agent.trim().is_empty() {
            self.user_agent = default_user_agent();
        }
        self.timeout_s = self.timeout_s.clamp(1, 300);
        if self.max_body_bytes == 0 {
            self.max_body_bytes = default_max_body_bytes();
        }
        self.max_redirects = self.max_redirects.min(10);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_max_hosts")]
    pub max_hosts: usize,
    #[serde(default = "default_scan_ports")]
    pub ports: Vec<u16>,
    #[serde(default = "default_body_sample_bytes")]
    pub body_sample_bytes: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            probe_timeout_ms: default_probe_timeout_ms(),
            max_hosts: default_max_hosts(),
            ports: default_scan_ports(),
            body_sample_bytes: default_body_sample_bytes(),
        }
    }
}

impl ScanConfig {
    pub fn normalized(mut self) -> Self {
        self.concurrency = self.concurrency.clamp(1, 512);
        self.probe_timeout_ms = self.probe_timeout_ms.clamp(50, 30_000);
        if self.max_hosts == 0 {
            self.max_hosts = default_max_hosts();
        }
        let mut ports = Vec::with_capacity(self.ports.len());
        for port in self.ports {
            if port != 0 && !ports.contains(&port) {
                ports.push(port);
            }
        }
        self.ports = if ports.is_empty() {
            default_scan_ports()
        } else {
            ports
        };
        self.body_sample_bytes = self.body_sample_bytes.clamp(1024, 1024 * 1024);
        self
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

const fn default_port() -> u16 {
    8080
}

fn default_static_dir() -> String {
    "public".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_local_suffix() -> String {
    ".local".to_string()
}

fn default_user_agent() -> String {
    "Umbrel-LAN-Proxy/1.0".to_string()
}

const fn default_timeout_s() -> u64 {
    15
}

const fn default_max_body_bytes() -> usize {
    16 * 1024 * 1024
}

const fn default_max_redirects() -> usize {
    5
}

const fn default_concurrency() -> usize {
    60
}

const fn default_probe_timeout_ms() -> u64 {
    800
}

const fn default_max_hosts() -> usize {
    1024
}

fn default_scan_ports() -> Vec<u16> {
    vec![80, 8080]
}

const fn default_body_sample_bytes() -> usize {
    64 * 1024
}

/// 端口既可写成数字，也可写成占位符展开后的字符串。
fn deserialize_port<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PortValue {
        Number(i64),
        Text(String),
    }

    match PortValue::deserialize(deserializer)? {
        PortValue::Number(number) => u16::try_from(number)
            .map_err(|_| de::Error::custom(format!("port {number} out of range"))),
        PortValue::Text(text) => text
            .trim()
            .parse::<u16>()
            .map_err(|_| de::Error::custom(format!("invalid port {text:?}"))),
    }
}

pub fn load_config() -> Config {
    let base_path =
        env::var("MINERLAN_CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let override_path = env::var("MINERLAN_CONFIG_OVERRIDE_PATH")
        .unwrap_or_else(|_| DEFAULT_OVERRIDE_PATH.to_string());
    load_config_from(&base_path, Some(&override_path))
}

pub fn load_config_from(base_path: &str, override_path: Option<&str>) -> Config {
    let mut merged = read_yaml(base_path);
    if let Some(override_path) = override_path.filter(|path| Path::new(path).exists()) {
        // 覆盖文件里写成 null 的键保留基础配置的值。
        overlay_yaml(&mut merged, read_yaml(override_path));
    }
    expand_yaml_env(&mut merged);

    if merged.is_null() {
        return Config::default();
    }
    match serde_yaml::from_value::<Config>(merged) {
        Ok(config) => config.normalized(),
        Err(err) => {
            warn!("minerlan config invalid, falling back to defaults: {err}");
            Config::default()
        }
    }
}

/// 缺失或损坏的配置文件按空配置处理，服务仍以默认值启动。
fn read_yaml(path: &str) -> Value {
    let content = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) => {
            warn!("config file {path} unreadable: {err}");
            return Value::Null;
        }
    };
    match serde_yaml::from_str(&content) {
        Ok(value) => value,
        Err(err) => {
            warn!("config file {path} is not valid YAML: {err}");
            Value::Null
        }
    }
}

fn overlay_yaml(base: &mut Value, layer: Value) {
    if layer.is_null() {
        return;
    }
    match (base, layer) {
        (Value::Mapping(base_map), Value::Mapping(layer_map)) => {
            for (key, value) in layer_map {
                match base_map.get_mut(&key) {
                    Some(slot) => overlay_yaml(slot, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, layer) => *slot = layer,
    }
}

fn expand_yaml_env(value: &mut Value) {
    match value {
        Value::String(text) => *text = expand_placeholders(text, env_lookup),
        Value::Sequence(items) => items.iter_mut().for_each(expand_yaml_env),
        Value::Mapping(map) => map.values_mut().for_each(expand_yaml_env),
        _ => {}
    }
}

/// 空值视同未设置，`${PORT:-8080}` 这类写法才能回落到默认值。
fn env_lookup(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.is_empty())
}

/// 展开 `${NAME}` 与 `${NAME:-default}`；未闭合或名称为空的片段原样保留。
fn expand_placeholders(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        let body = &rest[start + 2..];
        let Some(end) = body.find('}') else {
            output.push_str(&rest[start..]);
            return output;
        };
        let placeholder = &body[..end];
        rest = &body[end + 1..];
        let (name, fallback) = match placeholder.split_once(":-") {
            Some((name, fallback)) => (name.trim(), fallback),
            None => (placeholder.trim(), ""),
        };
        if name.is_empty() {
            output.push_str("${");
            output.push_str(placeholder);
            output.push('}');
            continue;
        }
        match lookup(name) {
            Some(value) => output.push_str(&value),
            None => output.push_str(fallback),
        }
    }
    output.push_str(rest);
    output
}
