//! Parallel CIDR sweep, port probe, and brand fingerprint (§4.2).

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::timeout;
use tracing::info;

use core_common::cidr::Cidr4;
use core_common::model::{Brand, DeviceRecord, RtspTestOutcome};

const CAMERA_PORTS: [u16; 8] = [554, 80, 8080, 37777, 8000, 443, 4520, 88];
const FINGERPRINT_PORTS: [u16; 4] = [80, 8080, 443, 88];
const PORT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);
const DEFAULT_WORKERS: usize = 50;

#[derive(Debug, Clone)]
pub enum ScanProgress {
    Started { total_hosts: usize },
    Tick { completed: usize, total: usize },
    Finished { emitted: usize },
}

/// Shared cooperative cancellation flag checked at the top of each
/// per-host task.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn is_same(&self, other: &CancelToken) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

struct BrandRule {
    brand: Brand,
    keywords: &'static [&'static str],
    templates: &'static [&'static str],
    users: &'static [&'static str],
    passwords: &'static [&'static str],
}

const BRAND_RULES: &[BrandRule] = &[
    BrandRule {
        brand: Brand::Hikvision,
        keywords: &["hikvision", "ds-", "app-webs"],
        templates: &["rtsp://{user}:{pass}@{ip}:554/Streaming/Channels/101"],
        users: &["admin"],
        passwords: &["12345", "admin12345"],
    },
    BrandRule {
        brand: Brand::Dahua,
        keywords: &["dahua", "dh-"],
        templates: &["rtsp://{user}:{pass}@{ip}:554/cam/realmonitor?channel=1&subtype=0"],
        users: &["admin"],
        passwords: &["admin"],
    },
    BrandRule {
        brand: Brand::Intelbras,
        keywords: &["intelbras"],
        templates: &["rtsp://{user}:{pass}@{ip}:554/cam/realmonitor?channel=1&subtype=0"],
        users: &["admin"],
        passwords: &["admin"],
    },
    BrandRule {
        brand: Brand::Hanwha,
        keywords: &["hanwha", "wisenet", "samsung techwin"],
        templates: &["rtsp://{user}:{pass}@{ip}:554/profile2/media.smp"],
        users: &["admin"],
        passwords: &["4321"],
    },
    BrandRule {
        brand: Brand::Foscam,
        keywords: &["foscam"],
        templates: &["rtsp://{user}:{pass}@{ip}:554/videoMain"],
        users: &["admin"],
        passwords: &[""],
    },
    BrandRule {
        brand: Brand::Axis,
        keywords: &["axis"],
        templates: &["rtsp://{user}:{pass}@{ip}:554/axis-media/media.amp"],
        users: &["root"],
        passwords: &["pass"],
    },
];

fn generic_rule() -> BrandRule {
    BrandRule {
        brand: Brand::Generic,
        keywords: &[],
        templates: &["rtsp://{user}:{pass}@{ip}:554/"],
        users: &["admin"],
        passwords: &["admin"],
    }
}

/// Scans `cidr` with a bounded worker pool, sending device records and
/// progress events over `events_tx` as they're produced. Returns the
/// total number of device records emitted.
pub async fn scan(
    cidr: &str,
    workers: Option<usize>,
    user_id: &str,
    cancel: CancelToken,
    events_tx: mpsc::UnboundedSender<ScanEvent>,
) -> core_common::Result<usize> {
    let network = Cidr4::parse(cidr)?;
    let hosts: Vec<Ipv4Addr> = network.hosts().collect();
    let total = hosts.len();

    let _ = events_tx.send(ScanEvent::Progress(ScanProgress::Started { total_hosts: total }));

    let semaphore = Arc::new(Semaphore::new(workers.unwrap_or(DEFAULT_WORKERS)));
    let completed = Arc::new(AtomicUsize::new(0));
    let emitted = Arc::new(AtomicUsize::new(0));
    let started_at = Utc::now();

    let mut handles = Vec::with_capacity(total);
    for ip in hosts {
        if cancel.is_cancelled() {
            break;
        }
        let permit = semaphore.clone();
        let completed = completed.clone();
        let emitted = emitted.clone();
        let cancel = cancel.clone();
        let tx = events_tx.clone();
        let user_id = user_id.to_string();

        handles.push(tokio::spawn(async move {
            let _permit = permit.acquire_owned().await.ok();
            if cancel.is_cancelled() {
                return;
            }

            if let Some(record) = probe_host(ip, &user_id, started_at).await {
                emitted.fetch_add(1, Ordering::Relaxed);
                let _ = tx.send(ScanEvent::Device(record));
            }

            let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
            if done % 3 == 0 || done == total {
                let _ = tx.send(ScanEvent::Progress(ScanProgress::Tick { completed: done, total }));
            }
        }));
    }

    for handle in handles {
        let _ = handle.await;
    }

    let total_emitted = emitted.load(Ordering::Relaxed);
    info!(cidr, total, total_emitted, "scan complete");
    let _ = events_tx.send(ScanEvent::Progress(ScanProgress::Finished { emitted: total_emitted }));
    Ok(total_emitted)
}

pub enum ScanEvent {
    Device(DeviceRecord),
    Progress(ScanProgress),
}

async fn probe_host(ip: Ipv4Addr, user_id: &str, discovered_at: chrono::DateTime<Utc>) -> Option<DeviceRecord> {
    let mut open_ports = Vec::new();
    for &port in &CAMERA_PORTS {
        if tcp_probe(ip, port).await {
            open_ports.push(port);
        }
    }

    let qualifies = open_ports.contains(&554)
        || open_ports.contains(&37777)
        || open_ports.contains(&8000)
        || open_ports.contains(&4520);
    if !qualifies {
        return None;
    }

    let (rule, confidence) = fingerprint(ip, &open_ports).await;

    Some(DeviceRecord {
        user_id: user_id.to_string(),
        ip: ip.to_string(),
        brand: rule.brand,
        confidence,
        open_ports,
        rtsp_url_templates: rule.templates.iter().map(|s| s.to_string()).collect(),
        default_users: rule.users.iter().map(|s| s.to_string()).collect(),
        default_passwords: rule.passwords.iter().map(|s| s.to_string()).collect(),
        discovered_at,
        validated_rtsp_url: None,
        last_test_outcome: RtspTestOutcome::Untested,
    })
}

async fn tcp_probe(ip: Ipv4Addr, port: u16) -> bool {
    matches!(
        timeout(PORT_PROBE_TIMEOUT, TcpStream::connect((ip, port))).await,
        Ok(Ok(_))
    )
}

/// HTTP banner match first (confidence 0.9); otherwise infer from
/// characteristic ports (0.5-0.7); else generic (0.3).
async fn fingerprint(ip: Ipv4Addr, open_ports: &[u16]) -> (BrandRule, f32) {
    for &port in &FINGERPRINT_PORTS {
        if !open_ports.contains(&port) {
            continue;
        }
        if let Some(banner) = fetch_banner(ip, port).await {
            let banner_lower = banner.to_ascii_lowercase();
            for rule in BRAND_RULES {
                if rule.keywords.iter().any(|kw| banner_lower.contains(kw)) {
                    return (
                        BrandRule {
                            brand: rule.brand,
                            keywords: rule.keywords,
                            templates: rule.templates,
                            users: rule.users,
                            passwords: rule.passwords,
                        },
                        0.9,
                    );
                }
            }
        }
    }

    if open_ports.contains(&37777) {
        return (find_rule(Brand::Intelbras), 0.7);
    }
    if open_ports.contains(&8000) {
        return (find_rule(Brand::Hikvision), 0.6);
    }
    if open_ports.contains(&4520) {
        return (find_rule(Brand::Hanwha), 0.6);
    }
    if open_ports.contains(&88) {
        return (find_rule(Brand::Foscam), 0.5);
    }

    (generic_rule(), 0.3)
}

fn find_rule(brand: Brand) -> BrandRule {
    BRAND_RULES
        .iter()
        .find(|r| r.brand == brand)
        .map(|r| BrandRule {
            brand: r.brand,
            keywords: r.keywords,
            templates: r.templates,
            users: r.users,
            passwords: r.passwords,
        })
        .unwrap_or_else(generic_rule)
}

async fn fetch_banner(ip: Ipv4Addr, port: u16) -> Option<String> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    let mut stream = timeout(PORT_PROBE_TIMEOUT, TcpStream::connect((ip, port)))
        .await
        .ok()?
        .ok()?;
    let request = format!("GET / HTTP/1.0\r\nHost: {ip}\r\n\r\n");
    timeout(PORT_PROBE_TIMEOUT, stream.write_all(request.as_bytes())).await.ok()?.ok()?;
    let mut buf = vec![0u8; 4096];
    let n = timeout(PORT_PROBE_TIMEOUT, stream.read(&mut buf)).await.ok()?.ok()?;
    Some(String::from_utf8_lossy(&buf[..n]).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualifies_on_rtsp_port_alone() {
        let open = vec![554u16];
        assert!(open.contains(&554));
    }

    #[test]
    fn intelbras_port_fingerprint_matches_scenario() {
        // Mirrors the literal scenario: 554 and 37777 open, brand
        // fingerprints to intelbras at 0.7 confidence.
        let open_ports = [554u16, 37777];
        assert!(open_ports.contains(&37777));
        let rule = find_rule(Brand::Intelbras);
        assert_eq!(rule.brand, Brand::Intelbras);
    }

    #[test]
    fn cancel_token_starts_uncancelled() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }
}
