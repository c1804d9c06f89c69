use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LanErrorKind {
    InvalidUrl,
    DisallowedScheme,
    NotLanHost,
    NoInterfaceFound,
    UpstreamUnreachable,
}

impl LanErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            LanErrorKind::InvalidUrl => "INVALID_URL",
            LanErrorKind::DisallowedScheme => "DISALLOWED_SCHEME",
            LanErrorKind::NotLanHost => "NOT_LAN_HOST",
            LanErrorKind::NoInterfaceFound => "NO_INTERFACE_FOUND",
            LanErrorKind::UpstreamUnreachable => "UPSTREAM_UNREACHABLE",
        }
    }
}

/// 请求级错误：只影响当前请求或单次探测，从不终止进程。
#[derive(Debug, Clone)]
pub struct LanError {
    kind: LanErrorKind,
    message: String,
}

impl LanError {
    fn new(kind: LanErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_url(message: impl Into<String>) -> Self {
        Self::new(LanErrorKind::InvalidUrl, message)
    }

    pub fn disallowed_scheme(message: impl Into<String>) -> Self {
        Self::new(LanErrorKind::DisallowedScheme, message)
    }

    pub fn not_lan_host(message: impl Into<String>) -> Self {
        Self::new(LanErrorKind::NotLanHost, message)
    }

    pub fn no_interface_found(message: impl Into<String>) -> Self {
        Self::new(LanErrorKind::NoInterfaceFound, message)
    }

    pub fn upstream_unreachable(message: impl Into<String>) -> Self {
        Self::new(LanErrorKind::UpstreamUnreachable, message)
    }

    pub fn kind(&self) -> LanErrorKind {
        self.kind
    }

    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for LanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for LanError {}
