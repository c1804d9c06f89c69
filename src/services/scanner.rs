// 设备扫描：固定宽度的探测池 + 厂商特征匹配，结果按候选生成顺序输出。
use crate::config::ScanConfig;
use crate::subnet::{NetworkInterface, SubnetRange};
use async_trait::async_trait;
use futures::future::join_all;
use futures::StreamExt;
use serde::Serialize;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Vendor {
    Avalon,
    Antminer,
    WhatsMiner,
    #[serde(rename = "Braiins OS")]
    BraiinsOs,
}

impl Vendor {
    pub fn as_str(self) -> &'static str {
        match self {
            Vendor::Avalon => "Avalon",
            Vendor::Antminer => "Antminer",
            Vendor::WhatsMiner => "WhatsMiner",
            Vendor::BraiinsOs => "Braiins OS",
        }
    }
}

/// 按优先级排列的特征串，先命中者生效。
const VENDOR_SIGNATURES: [(&str, Vendor); 6] = [
    ("avalon device", Vendor::Avalon),
    ("antminer", Vendor::Antminer),
    ("bitmain", Vendor::Antminer),
    ("whatsminer", Vendor::WhatsMiner),
    ("braiins", Vendor::BraiinsOs),
    ("bos", Vendor::BraiinsOs),
];

pub fn fingerprint(body: &str) -> Option<Vendor> {
    let folded = body.to_lowercase();
    VENDOR_SIGNATURES
        .iter()
        .find(|(needle, _)| folded.contains(needle))
        .map(|(_, vendor)| *vendor)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScanCandidate {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl ScanCandidate {
    pub fn url(&self) -> String {
        format!("http://{}:{}/", self.ip, self.port)
    }
}

/// 主机优先、端口其次的生成顺序。
pub fn build_candidates(hosts: &[Ipv4Addr], ports: &[u16]) -> Vec<ScanCandidate> {
    hosts
        .iter()
        .flat_map(|ip| ports.iter().map(move |port| ScanCandidate { ip: *ip, port: *port }))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeFailure {
    Timeout,
    Connect,
    Body,
    NonText,
}

impl ProbeFailure {
    pub fn as_str(self) -> &'static str {
        match self {
            ProbeFailure::Timeout => "timeout",
            ProbeFailure::Connect => "connect",
            ProbeFailure::Body => "body",
            ProbeFailure::NonText => "non_text",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub candidate: ScanCandidate,
    pub reachable: bool,
    pub http_status: Option<u16>,
    pub content_type: Option<String>,
    pub body_sample: Option<String>,
    pub failure_reason: Option<ProbeFailure>,
}

impl ProbeOutcome {
    pub fn unreachable(candidate: ScanCandidate, reason: ProbeFailure) -> Self {
        Self {
            candidate,
            reachable: false,
            http_status: None,
            content_type: None,
            body_sample: None,
            failure_reason: Some(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredDevice {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub vendor: Vendor,
    pub url: String,
}

impl DiscoveredDevice {
    pub fn from_outcome(outcome: &ProbeOutcome) -> Option<Self> {
        let body = outcome.body_sample.as_deref()?;
        let vendor = fingerprint(body)?;
        Some(Self {
            ip: outcome.candidate.ip,
            port: outcome.candidate.port,
            vendor,
            url: outcome.candidate.url(),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanReport {
    pub interface: NetworkInterface,
    pub scanned_hosts: usize,
    pub total_hosts: u64,
    pub probes: usize,
    pub found: Vec<DiscoveredDevice>,
}

/// 单次探测；失败以 [`ProbeOutcome`] 表达，从不向上抛出错误。
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, candidate: ScanCandidate) -> ProbeOutcome;
}

pub struct HttpProber {
    client: reqwest::Client,
    probe_timeout: Duration,
    body_sample_bytes: usize,
}

impl HttpProber {
    pub fn new(client: reqwest::Client, settings: &ScanConfig) -> Self {
        Self {
            client,
            probe_timeout: Duration::from_millis(settings.probe_timeout_ms),
            body_sample_bytes: settings.body_sample_bytes,
        }
    }

    async fn fetch(&self, candidate: ScanCandidate) -> ProbeOutcome {
        let response = match self.client.get(candidate.url()).send().await {
            Ok(response) => response,
            Err(err) => {
                let reason = if err.is_timeout() {
                    ProbeFailure::Timeout
                } else {
                    ProbeFailure::Connect
                };
                return ProbeOutcome::unreachable(candidate, reason);
            }
        };
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let mut outcome = ProbeOutcome {
            candidate,
            reachable: true,
            http_status: Some(status),
            content_type: content_type.clone(),
            body_sample: None,
            failure_reason: None,
        };
        let is_text = content_type
            .as_deref()
            .map(|value| {
                let value = value.to_ascii_lowercase();
                value.contains("text") || value.contains("html")
            })
            .unwrap_or(false);
        if !is_text {
            outcome.failure_reason = Some(ProbeFailure::NonText);
            return outcome;
        }

        let mut sample = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => {
                    let room = self.body_sample_bytes.saturating_sub(sample.len());
                    sample.extend_from_slice(&bytes[..bytes.len().min(room)]);
                    if sample.len() >= self.body_sample_bytes {
                        break;
                    }
                }
                Err(_) => {
                    outcome.failure_reason = Some(ProbeFailure::Body);
                    break;
                }
            }
        }
        outcome.body_sample = Some(String::from_utf8_lossy(&sample).into_owned());
        outcome
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, candidate: ScanCandidate) -> ProbeOutcome {
        // 超时即取消整个请求（含读 body），互不影响其它探测。
        match timeout(self.probe_timeout, self.fetch(candidate)).await {
            Ok(outcome) => outcome,
            Err(_) => ProbeOutcome::unreachable(candidate, ProbeFailure::Timeout),
        }
    }
}

pub struct DeviceScanner<P> {
    prober: P,
    concurrency: usize,
    ports: Vec<u16>,
}

impl<P: Prober> DeviceScanner<P> {
    pub fn new(prober: P, settings: &ScanConfig) -> Self {
        Self {
            prober,
            concurrency: settings.concurrency.max(1),
            ports: settings.ports.clone(),
        }
    }

    pub async fn scan(&self, interface: NetworkInterface, range: &SubnetRange) -> ScanReport {
        let started = Instant::now();
        if range.is_truncated() {
            warn!(
                "subnet {}/{} has {} hosts, scanning the first {}",
                range.network,
                interface.netmask,
                range.total_hosts,
                range.scanned_hosts()
            );
        }
        let candidates = build_candidates(&range.hosts, &self.ports);
        let outcomes = self.probe_all(&candidates).await;
        let found = outcomes
            .iter()
            .filter_map(DiscoveredDevice::from_outcome)
            .collect::<Vec<_>>();
        for device in &found {
            info!("found {} at {}", device.vendor.as_str(), device.url);
        }
        info!(
            "scan on {} ({}) probed {} candidates across {}/{} hosts, found {} devices in {:?}",
            interface.name,
            interface.address,
            candidates.len(),
            range.scanned_hosts(),
            range.total_hosts,
            found.len(),
            started.elapsed()
        );
        ScanReport {
            interface,
            scanned_hosts: range.scanned_hosts(),
            total_hosts: range.total_hosts,
            probes: candidates.len(),
            found,
        }
    }

    /// 所有 worker 在同一个任务里协作执行，共享游标保证每个下标只被领取一次。
    pub async fn probe_all(&self, candidates: &[ScanCandidate]) -> Vec<ProbeOutcome> {
        let cursor = AtomicUsize::new(0);
        let cursor = &cursor;
        let width = self.concurrency.min(candidates.len()).max(1);
        let workers = (0..width).map(|_| async move {
            let mut claimed = Vec::new();
            loop {
                let index = cursor.fetch_add(1, Ordering::SeqCst);
                let Some(candidate) = candidates.get(index).copied() else {
                    break;
                };
                let outcome = self.prober.probe(candidate).await;
                if let Some(reason) = outcome.failure_reason {
                    debug!("probe {} failed: {}", candidate.url(), reason.as_str());
                }
                claimed.push((index, outcome));
            }
            claimed
        });

        let mut slots: Vec<Option<ProbeOutcome>> = vec![None; candidates.len()];
        for (index, outcome) in join_all(workers).await.into_iter().flatten() {
            slots[index] = Some(outcome);
        }
        slots.into_iter().flatten().collect()
    }
}
