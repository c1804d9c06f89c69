// 地址分类：判定 IPv4 地址是否属于本地网段，是整个 SSRF 防护的唯一判据。
use crate::config::LanPolicy;
use std::net::Ipv4Addr;

const MAX_DOTTED_QUAD_LEN: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressClass {
    Private,
    LinkLocal,
    Loopback,
    Public,
    Invalid,
}

impl AddressClass {
    pub fn as_str(self) -> &'static str {
        match self {
            AddressClass::Private => "private",
            AddressClass::LinkLocal => "link_local",
            AddressClass::Loopback => "loopback",
            AddressClass::Public => "public",
            AddressClass::Invalid => "invalid",
        }
    }
}

/// 严格解析四段十进制数字；十六进制、八进制、整数写法、IPv6 与主机名一律视为 Invalid。
pub fn parse_dotted_quad(raw: &str) -> Option<Ipv4Addr> {
    if raw.is_empty() || raw.len() > MAX_DOTTED_QUAD_LEN {
        return None;
    }
    let mut octets = [0u8; 4];
    let mut count = 0;
    for part in raw.split('.') {
        if count == 4 || part.is_empty() || part.len() > 3 {
            return None;
        }
        if !part.bytes().all(|byte| byte.is_ascii_digit()) {
            return None;
        }
        let value = part.parse::<u16>().ok()?;
        octets[count] = u8::try_from(value).ok()?;
        count += 1;
    }
    (count == 4).then(|| Ipv4Addr::from(octets))
}

pub fn classify(raw: &str) -> AddressClass {
    match parse_dotted_quad(raw) {
        Some(addr) => classify_addr(addr),
        None => AddressClass::Invalid,
    }
}

pub fn classify_addr(addr: Ipv4Addr) -> AddressClass {
    match addr.octets() {
        [10, ..] => AddressClass::Private,
        [172, second, ..] if (16..=31).contains(&second) => AddressClass::Private,
        [192, 168, ..] => AddressClass::Private,
        [169, 254, ..] => AddressClass::LinkLocal,
        [127, ..] => AddressClass::Loopback,
        _ => AddressClass::Public,
    }
}

/// 私网地址始终放行；链路本地与回环由策略决定；公网与非法输入一律拒绝。
pub fn is_permitted(class: AddressClass, policy: &LanPolicy) -> bool {
    match class {
        AddressClass::Private => true,
        AddressClass::LinkLocal => policy.allow_link_local,
        AddressClass::Loopback => policy.allow_loopback,
        AddressClass::Public | AddressClass::Invalid => false,
    }
}

pub fn is_permitted_addr(addr: Ipv4Addr, policy: &LanPolicy) -> bool {
    is_permitted(classify_addr(addr), policy)
}
