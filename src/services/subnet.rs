// 子网枚举：从本机网卡中挑选私网地址，推导可扫描的主机范围。
use crate::address::{classify_addr, AddressClass};
use crate::error::LanError;
use network_interface::{Addr, NetworkInterface as OsInterface, NetworkInterfaceConfig};
use serde::Serialize;
use std::net::Ipv4Addr;
use tracing::{debug, warn};

const FALLBACK_NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

/// 本机对外的 IPv4 网卡地址。每次扫描重新选择，不跨请求缓存。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkInterface {
    pub name: String,
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetRange {
    pub network: Ipv4Addr,
    pub broadcast: Ipv4Addr,
    /// 子网内可分配主机总数（不含网络地址与广播地址）。
    pub total_hosts: u64,
    /// 实际参与扫描的主机，按地址升序，受上限截断。
    pub hosts: Vec<Ipv4Addr>,
}

impl SubnetRange {
    pub fn scanned_hosts(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_truncated(&self) -> bool {
        (self.hosts.len() as u64) < self.total_hosts
    }
}

/// 读取系统网卡列表，保持操作系统给出的顺序。
pub fn system_interfaces() -> Result<Vec<NetworkInterface>, LanError> {
    let interfaces = OsInterface::show().map_err(|err| {
        warn!("enumerate network interfaces failed: {err}");
        LanError::no_interface_found("Unable to read local network interfaces")
    })?;
    let mut output = Vec::new();
    for interface in interfaces {
        for addr in &interface.addr {
            if let Addr::V4(v4) = addr {
                output.push(NetworkInterface {
                    name: interface.name.clone(),
                    address: v4.ip,
                    netmask: v4.netmask.unwrap_or(FALLBACK_NETMASK),
                });
            }
        }
    }
    debug!("found {} ipv4 interface addresses", output.len());
    Ok(output)
}

/// 先在非回环地址中找第一个私网地址；找不到时退回到第一个私网或回环地址。
pub fn select_interface(candidates: &[NetworkInterface]) -> Result<NetworkInterface, LanError> {
    let preferred = candidates.iter().find(|item| {
        !item.address.is_loopback() && classify_addr(item.address) == AddressClass::Private
    });
    let selected = preferred.or_else(|| {
        candidates.iter().find(|item| {
            matches!(
                classify_addr(item.address),
                AddressClass::Private | AddressClass::Loopback
            )
        })
    });
    selected
        .cloned()
        .ok_or_else(|| LanError::no_interface_found("No private IPv4 interface found"))
}

/// 主机列表只取网卡地址所在的私网（或回环）大段内的部分：掩码过宽时不会越界到公网。
/// `total_hosts` 仍按网卡声明的子网计算。
pub fn derive_range(interface: &NetworkInterface, max_hosts: usize) -> SubnetRange {
    let address = u32::from(interface.address);
    let mask = u32::from(interface.netmask);
    let network = address & mask;
    let broadcast = network | !mask;
    let total_hosts = usable_hosts(network, broadcast);

    let hosts = match enclosing_block_mask(interface.address) {
        Some(block_mask) => {
            let scan_mask = mask | block_mask;
            let scan_network = address & scan_mask;
            let scan_broadcast = scan_network | !scan_mask;
            let take = usable_hosts(scan_network, scan_broadcast).min(max_hosts as u64) as u32;
            (0..take)
                .map(|offset| Ipv4Addr::from(scan_network + 1 + offset))
                .collect()
        }
        None => Vec::new(),
    };
    SubnetRange {
        network: Ipv4Addr::from(network),
        broadcast: Ipv4Addr::from(broadcast),
        total_hosts,
        hosts,
    }
}

fn usable_hosts(network: u32, broadcast: u32) -> u64 {
    let (first, last) = (network.saturating_add(1), broadcast.saturating_sub(1));
    if last >= first {
        u64::from(last - first) + 1
    } else {
        0
    }
}

/// 地址所属保留段的掩码：10/8、172.16/12、192.168/16、127/8。
fn enclosing_block_mask(address: Ipv4Addr) -> Option<u32> {
    let prefix = match (classify_addr(address), address.octets()) {
        (AddressClass::Private, [10, ..]) => 8,
        (AddressClass::Private, [172, ..]) => 12,
        (AddressClass::Private, _) => 16,
        (AddressClass::Loopback, _) => 8,
        _ => return None,
    };
    Some(u32::MAX << (32 - prefix))
}
