use anyhow::Result;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use minerlan::config::ScanConfig;
use minerlan::scanner::{DeviceScanner, HttpProber, ProbeFailure, Prober, ScanCandidate, Vendor};
use minerlan::subnet::{NetworkInterface, SubnetRange};
use minerlan::upstream::scan_client;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;

const SAMPLE_BYTES: usize = 1024;

fn settings(ports: Vec<u16>) -> ScanConfig {
    ScanConfig {
        concurrency: 4,
        probe_timeout_ms: 300,
        max_hosts: 16,
        ports,
        body_sample_bytes: SAMPLE_BYTES,
    }
}

fn sampler(settings: &ScanConfig) -> Result<HttpProber> {
    let client = scan_client(settings, "minerlan-test")?;
    Ok(HttpProber::new(client, settings))
}

fn on_loopback(port: u16) -> ScanCandidate {
    ScanCandidate {
        ip: Ipv4Addr::LOCALHOST,
        port,
    }
}

async fn serve(app: Router) -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(port)
}

/// 首页带 Antminer 特征，页面远大于采样上限。
fn miner_page() -> Router {
    Router::new().route(
        "/",
        get(|| async {
            let page = format!("<title>Antminer S19</title>{}", "x".repeat(8 * SAMPLE_BYTES));
            ([(CONTENT_TYPE, "text/html")], page)
        }),
    )
}

fn camera_snapshot() -> Router {
    Router::new().route(
        "/",
        get(|| async { ([(CONTENT_TYPE, "image/png")], vec![0x89u8, b'P', b'N', b'G']) }),
    )
}

fn stalled_device() -> Router {
    Router::new().route(
        "/",
        get(|| async {
            tokio::time::sleep(Duration::from_secs(3)).await;
            ([(CONTENT_TYPE, "text/html")], "antminer").into_response()
        }),
    )
}

async fn closed_port() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn text_pages_are_sampled_up_to_the_limit() -> Result<()> {
    let port = serve(miner_page()).await?;
    let settings = settings(vec![port]);
    let outcome = sampler(&settings)?.probe(on_loopback(port)).await;

    assert!(outcome.reachable);
    assert_eq!(outcome.http_status, Some(200));
    assert_eq!(outcome.failure_reason, None);
    let sample = outcome.body_sample.unwrap_or_default();
    assert_eq!(sample.len(), SAMPLE_BYTES);
    assert!(sample.starts_with("<title>Antminer S19</title>"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn non_text_responses_keep_no_sample() -> Result<()> {
    let port = serve(camera_snapshot()).await?;
    let settings = settings(vec![port]);
    let outcome = sampler(&settings)?.probe(on_loopback(port)).await;

    assert!(outcome.reachable);
    assert_eq!(outcome.http_status, Some(200));
    assert_eq!(outcome.content_type.as_deref(), Some("image/png"));
    assert_eq!(outcome.failure_reason, Some(ProbeFailure::NonText));
    assert_eq!(outcome.body_sample, None);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stalled_device_times_out_within_budget() -> Result<()> {
    let port = serve(stalled_device()).await?;
    let settings = settings(vec![port]);
    let started = Instant::now();
    let outcome = sampler(&settings)?.probe(on_loopback(port)).await;

    assert!(!outcome.reachable);
    assert_eq!(outcome.failure_reason, Some(ProbeFailure::Timeout));
    assert!(started.elapsed() < Duration::from_secs(2));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refused_connection_is_reported() -> Result<()> {
    let port = closed_port().await?;
    let settings = settings(vec![port]);
    let outcome = sampler(&settings)?.probe(on_loopback(port)).await;

    assert!(!outcome.reachable);
    assert_eq!(outcome.failure_reason, Some(ProbeFailure::Connect));
    assert_eq!(outcome.http_status, None);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scan_over_real_sockets_reports_only_miners() -> Result<()> {
    let miner = serve(miner_page()).await?;
    let camera = serve(camera_snapshot()).await?;
    let stalled = serve(stalled_device()).await?;
    let closed = closed_port().await?;
    let settings = settings(vec![closed, stalled, camera, miner]);

    let scanner = DeviceScanner::new(sampler(&settings)?, &settings);
    let interface = NetworkInterface {
        name: "lo".to_string(),
        address: Ipv4Addr::LOCALHOST,
        netmask: Ipv4Addr::new(255, 255, 255, 255),
    };
    let range = SubnetRange {
        network: Ipv4Addr::LOCALHOST,
        broadcast: Ipv4Addr::LOCALHOST,
        total_hosts: 1,
        hosts: vec![Ipv4Addr::LOCALHOST],
    };
    let report = scanner.scan(interface, &range).await;

    assert_eq!(report.probes, 4);
    assert_eq!(report.found.len(), 1);
    assert_eq!(report.found[0].vendor, Vendor::Antminer);
    assert_eq!(report.found[0].port, miner);
    assert_eq!(report.found[0].url, format!("http://127.0.0.1:{miner}/"));
    Ok(())
}
